//! Request identification.
//!
//! # Responsibilities
//! - Generate an `x-request-id` (UUID v4) when the client sent none
//! - Echo the request id on the response
//!
//! Request id is assigned as the outermost layer, before tracing.

use axum::http::Request;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, RequestId, SetRequestIdLayer};

pub const X_REQUEST_ID: &str = "x-request-id";

/// Assigns a UUID request id to requests that lack one.
pub fn set_request_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::x_request_id(MakeRequestUuid)
}

/// Copies the request id onto the response.
pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::x_request_id()
}

/// Access to the request id assigned by `set_request_id_layer`.
pub trait RequestIdExt {
    fn request_id(&self) -> Option<&str>;
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> Option<&str> {
        self.extensions()
            .get::<RequestId>()
            .and_then(|id| id.header_value().to_str().ok())
            .or_else(|| self.headers().get(X_REQUEST_ID).and_then(|v| v.to_str().ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_falls_back_to_header() {
        let req = Request::builder()
            .header(X_REQUEST_ID, "abc-123")
            .body(())
            .unwrap();
        assert_eq!(req.request_id(), Some("abc-123"));
    }
}
