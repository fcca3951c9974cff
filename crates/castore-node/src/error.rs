//! Error types for node routing, peers and the HTTP surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use castore_storage::StoreError;
use thiserror::Error;

/// Result type alias for node operations.
pub type NodeResult<T> = Result<T, NodeError>;

/// Error variants for node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Failure inside a local volume.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A peer could not be reached or the transfer broke mid-way.
    #[error("peer {peer} unreachable: {msg}")]
    PeerUnreachable {
        /// Peer node name.
        peer: String,
        /// Transport failure description.
        msg: String,
    },

    /// A peer answered with an error status.
    #[error("peer {peer} returned {status}: {msg}")]
    Remote {
        /// Peer node name.
        peer: String,
        /// HTTP status code returned by the peer.
        status: u16,
        /// Error message decoded from the response body.
        msg: String,
    },

    /// Invalid or incomplete configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed client request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Socket or filesystem failure outside a volume.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Shorthand for a missing key.
    pub fn not_found(key: &str) -> Self {
        NodeError::Store(StoreError::not_found(format!("key {}", key)))
    }

    /// Returns true when the error means the record is absent, locally or on a peer.
    pub fn is_not_found(&self) -> bool {
        match self {
            NodeError::Store(e) => e.is_not_found(),
            NodeError::Remote { status, .. } => *status == StatusCode::NOT_FOUND.as_u16(),
            _ => false,
        }
    }

    /// HTTP status reported to clients.
    pub fn status(&self) -> StatusCode {
        match self {
            e if e.is_not_found() => StatusCode::NOT_FOUND,
            NodeError::Store(StoreError::CapacityExhausted { .. }) => StatusCode::INSUFFICIENT_STORAGE,
            NodeError::PeerUnreachable { .. } | NodeError::Remote { .. } => StatusCode::BAD_GATEWAY,
            NodeError::BadRequest(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for NodeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(NodeError::not_found("k").status(), StatusCode::NOT_FOUND);
        let full = NodeError::Store(StoreError::CapacityExhausted {
            requested: 10,
            available: 1,
        });
        assert_eq!(full.status(), StatusCode::INSUFFICIENT_STORAGE);
        let peer = NodeError::PeerUnreachable {
            peer: "n2".into(),
            msg: "refused".into(),
        };
        assert_eq!(peer.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(NodeError::BadRequest("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            NodeError::Store(StoreError::InvalidState("x".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_remote_404_is_not_found() {
        let e = NodeError::Remote {
            peer: "n2".into(),
            status: 404,
            msg: "not found: key a".into(),
        };
        assert!(e.is_not_found());
        assert_eq!(e.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_error_body_is_json() {
        let response = NodeError::not_found("a").into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["error"].as_str().unwrap().contains("key a"));
    }
}
