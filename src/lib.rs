//! Client-side resilience and caching for web applications that have to keep
//! working with a flaky or absent network.
//!
//! - [`cache`]: persistent partitioned response store, eviction, result cache
//! - [`agent`]: request interception with cache-first/network-first routing
//! - [`push`]: push payloads to notifications and back into the app
//! - [`client`]: API client with timeouts and exponential backoff
//! - [`runtime`]: wires it all together from a [`config::Config`]

pub mod agent;
pub mod cache;
pub mod client;
pub mod clock;
pub mod config;
pub mod http;
pub mod logging;
pub mod push;
pub mod runtime;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use runtime::Offgrid;
