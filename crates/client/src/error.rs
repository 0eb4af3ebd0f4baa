use pushfeed_book::BookError;
use thiserror::Error;

use crate::auth::AuthError;
use crate::config::ConfigError;
use crate::dispatch::DispatchError;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("dial failed: {0}")]
    Dial(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("timed out after {timeout_ms}ms: {what}")]
    Timeout { what: &'static str, timeout_ms: u64 },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("server error {code}: {msg}")]
    Server { code: String, msg: String },

    #[error("{op} rejected with code {code}: {msg}")]
    OpFailed {
        op: String,
        code: String,
        msg: String,
        reply: Box<crate::frame::OpReply>,
    },

    #[error("order book verification failed: {0}")]
    Book(#[from] BookError),

    #[error("private endpoint requires credentials")]
    MissingCredentials,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("REST request failed: {0}")]
    Rest(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("client is shut down")]
    Shutdown,
}

impl ClientError {
    /// Errors that the lifecycle manager recovers from by reconnecting.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ClientError::Dial(_)
                | ClientError::WebSocket(_)
                | ClientError::Timeout { .. }
                | ClientError::ConnectionClosed
                | ClientError::Rest(_)
                | ClientError::RateLimited { .. }
                | ClientError::Disconnected(_)
        )
    }
}
