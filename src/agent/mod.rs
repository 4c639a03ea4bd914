//! Request interception for one origin.
//!
//! The [`InterceptionAgent`] owns the versioned cache partitions, decides per
//! request whether to answer from cache, network or a synthesized fallback,
//! and moves through its lifecycle as new versions are installed. The
//! [`control`] module carries messages from application contexts to it.

mod clients;
pub mod control;
mod lifecycle;
mod partitions;
mod request;
pub mod responses;
mod routing;
mod service;

pub use clients::{ClientContext, ClientContexts, ClientId, ClientRegistry};
pub use control::{ControlError, ControlHandle, ControlMessage, ControlReply};
pub use lifecycle::{
  transition, ActiveVersion, AgentState, Effect, LifecycleEvent, LifecyclePolicy, Transition,
};
pub use partitions::PartitionNames;
pub use request::{AgentRequest, Destination};
pub use routing::{AssetClass, Route, Router};
pub use service::{AgentBuilder, InterceptionAgent, Interception};
