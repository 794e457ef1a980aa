//! Error types for the Realm server.
//!
//! [`ServerError`] covers both startup failures, propagated out of `main`,
//! and request failures, rendered as JSON responses through its
//! [`IntoResponse`] implementation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Top-level error for the server binary and its HTTP surface.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: realm_core::config::ConfigError,
    },

    /// A store connection, migration or query failed.
    #[error("database error: {source}")]
    Database {
        /// The underlying data-layer error.
        #[from]
        source: realm_db::DbError,
    },

    /// Failed to bind the HTTP listener.
    #[error("bind error: {0}")]
    Bind(String),

    /// The HTTP server failed while serving.
    #[error("serve error: {0}")]
    Serve(String),

    /// The request carried no usable principal.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Config { .. } | Self::Database { .. } | Self::Bind(_) | Self::Serve(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = serde_json::json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        });

        (status, axum::Json(body)).into_response()
    }
}
