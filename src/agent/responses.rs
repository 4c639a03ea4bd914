//! Responses synthesized when neither the network nor the cache can answer.

use serde_json::json;

use crate::http::HttpResponse;

const IMAGE_PLACEHOLDER: &str = r##"<svg xmlns="http://www.w3.org/2000/svg" width="300" height="200" viewBox="0 0 300 200"><rect width="300" height="200" fill="#f3f4f6"/><text x="150" y="100" font-family="sans-serif" font-size="14" fill="#6b7280" text-anchor="middle" dominant-baseline="middle">Image unavailable</text></svg>"##;

/// 503 JSON body for API requests with no cached copy.
pub fn offline_api(message: &str) -> HttpResponse {
  HttpResponse::json(503, &json!({ "error": "Offline", "message": message }))
}

/// Inline SVG served in place of an image that cannot be fetched.
pub fn image_placeholder() -> HttpResponse {
  HttpResponse::new(200, IMAGE_PLACEHOLDER)
    .with_header("Content-Type", "image/svg+xml")
    .with_header("Cache-Control", "no-store")
}

/// Plain 503 for any other resource.
pub fn unavailable() -> HttpResponse {
  HttpResponse::new(503, "Resource not available offline")
    .with_header("Content-Type", "text/plain")
}

/// Plain 503 for static paths other than the root document.
pub fn offline_text() -> HttpResponse {
  HttpResponse::new(503, "Offline").with_header("Content-Type", "text/plain")
}
