//! Websocket transport
//!
//! The lifecycle manager dials through a [`Dialer`] so tests and callers can
//! substitute their own transport setup (proxies, custom TLS, fault
//! injection). The handshake timeout is applied by the caller around
//! `dial`, so it holds for every implementation.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use crate::error::ClientError;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a websocket to `url`, sending `headers` with the upgrade request.
    async fn dial(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<WsStream, ClientError>;
}

/// Default dialer over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteDialer;

#[async_trait]
impl Dialer for TungsteniteDialer {
    async fn dial(
        &self,
        url: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<WsStream, ClientError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ClientError::Dial(format!("invalid url {}: {}", url, e)))?;

        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| ClientError::Dial(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| ClientError::Dial(format!("invalid header value: {}", e)))?;
            request.headers_mut().insert(name, value);
        }

        debug!(url = %url, headers = headers.len(), "dialing");
        let (ws, response) = connect_async(request)
            .await
            .map_err(|e| ClientError::Dial(e.to_string()))?;
        info!(url = %url, status = ?response.status(), "WebSocket connected");
        Ok(ws)
    }
}
