//! REST collaborator
//!
//! The streaming core only needs REST for auxiliary calls made before a
//! session opens, such as fetching server time to sign the login. It talks
//! to it through [`RestApi`] and only cares whether a call succeeded.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::auth::Credentials;
use crate::config::SIMULATED_HEADER;
use crate::error::ClientError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const MIN_REQUEST_GAP: Duration = Duration::from_millis(100);
const SERVER_TIME_PATH: &str = "/api/v5/public/time";

#[async_trait]
pub trait RestApi: Send + Sync {
    /// Issue one request and return the envelope's `data` on success.
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        signed: bool,
    ) -> Result<Value, ClientError>;
}

/// Server time in milliseconds since the epoch.
pub async fn server_time(api: &dyn RestApi) -> Result<i64, ClientError> {
    let data = api
        .request(Method::GET, SERVER_TIME_PATH, &[], None, false)
        .await?;
    data.get(0)
        .and_then(|entry| entry.get("ts"))
        .and_then(|ts| match ts {
            Value::String(s) => s.parse::<i64>().ok(),
            Value::Number(n) => n.as_i64(),
            _ => None,
        })
        .ok_or_else(|| ClientError::Rest(format!("unexpected server time payload: {}", data)))
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    data: Value,
}

/// `reqwest` implementation of [`RestApi`].
pub struct HttpRestClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
    simulated: bool,
    min_gap: Duration,
    last_request: tokio::sync::Mutex<Option<tokio::time::Instant>>,
}

impl HttpRestClient {
    pub fn new(
        base_url: impl Into<String>,
        credentials: Option<Credentials>,
        simulated: bool,
    ) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ClientError::Rest(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
            simulated,
            min_gap: MIN_REQUEST_GAP,
            last_request: tokio::sync::Mutex::new(None),
        })
    }

    pub fn with_min_gap(mut self, min_gap: Duration) -> Self {
        self.min_gap = min_gap;
        self
    }

    /// Enforce minimum gap between requests
    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(at) = *last {
            let elapsed = at.elapsed();
            if elapsed < self.min_gap {
                tokio::time::sleep(self.min_gap - elapsed).await;
            }
        }
        *last = Some(tokio::time::Instant::now());
    }

    fn check_rate_limit(resp: &reqwest::Response) -> Result<(), ClientError> {
        if resp.status() == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(1);
            return Err(ClientError::RateLimited {
                retry_after_ms: retry_after * 1000,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RestApi for HttpRestClient {
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(String, String)],
        body: Option<&Value>,
        signed: bool,
    ) -> Result<Value, ClientError> {
        self.throttle().await;

        let path_and_query = if query.is_empty() {
            path.to_string()
        } else {
            let encoded = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .finish();
            format!("{}?{}", path, encoded)
        };
        let body = match body {
            Some(body) => serde_json::to_string(body)?,
            None => String::new(),
        };

        let url = format!("{}{}", self.base_url, path_and_query);
        debug!(method = %method, url = %url, signed, "REST request");

        let mut request = self
            .http
            .request(method.clone(), &url)
            .header("Content-Type", "application/json");
        if self.simulated {
            request = request.header(SIMULATED_HEADER, "1");
        }
        if signed {
            let credentials = self
                .credentials
                .as_ref()
                .ok_or(ClientError::MissingCredentials)?;
            let timestamp = chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string();
            let signature =
                credentials.sign_request(&timestamp, method.as_str(), &path_and_query, &body)?;
            request = request
                .header("OK-ACCESS-KEY", &credentials.api_key)
                .header("OK-ACCESS-SIGN", signature)
                .header("OK-ACCESS-TIMESTAMP", timestamp)
                .header("OK-ACCESS-PASSPHRASE", credentials.passphrase());
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let resp = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ClientError::Timeout {
                    what: "REST request",
                    timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
                }
            } else {
                ClientError::Rest(e.to_string())
            }
        })?;

        Self::check_rate_limit(&resp)?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ClientError::Rest(e.to_string()))?;
        if !status.is_success() {
            warn!(status = %status, url = %url, "REST request failed");
            return Err(ClientError::Rest(format!("HTTP {}: {}", status, text)));
        }

        let envelope: Envelope = serde_json::from_str(&text)?;
        if envelope.code != "0" {
            return Err(ClientError::Server {
                code: envelope.code,
                msg: envelope.msg,
            });
        }
        Ok(envelope.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, credentials: Option<Credentials>) -> HttpRestClient {
        HttpRestClient::new(server.uri(), credentials, false)
            .unwrap()
            .with_min_gap(Duration::ZERO)
    }

    #[tokio::test]
    async fn test_server_time() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/public/time"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": "0", "msg": "", "data": [{"ts": "1597026383085"}]
            })))
            .mount(&server)
            .await;

        let api = client(&server, None);
        assert_eq!(server_time(&api).await.unwrap(), 1597026383085);
    }

    #[tokio::test]
    async fn test_signed_request_carries_auth_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v5/account/balance"))
            .and(query_param("ccy", "BTC"))
            .and(header("OK-ACCESS-KEY", "key"))
            .and(header("OK-ACCESS-PASSPHRASE", "pass"))
            .and(header_exists("OK-ACCESS-SIGN"))
            .and(header_exists("OK-ACCESS-TIMESTAMP"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": "0", "msg": "", "data": [{"totalEq": "1"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let credentials = Credentials::new("key", "secret", "pass").unwrap();
        let api = client(&server, Some(credentials));
        let data = api
            .request(
                Method::GET,
                "/api/v5/account/balance",
                &[("ccy".to_string(), "BTC".to_string())],
                None,
                true,
            )
            .await
            .unwrap();
        assert_eq!(data[0]["totalEq"], "1");
    }

    #[tokio::test]
    async fn test_signed_request_without_credentials() {
        let server = MockServer::start().await;
        let api = client(&server, None);
        let err = api
            .request(Method::GET, "/api/v5/account/balance", &[], None, true)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::MissingCredentials));
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "2"))
            .mount(&server)
            .await;

        let api = client(&server, None);
        let err = server_time(&api).await.unwrap_err();
        assert!(matches!(err, ClientError::RateLimited { retry_after_ms: 2000 }));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_error_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "code": "50011", "msg": "Rate limit reached", "data": []
            })))
            .mount(&server)
            .await;

        let api = client(&server, None);
        match server_time(&api).await {
            Err(ClientError::Server { code, msg }) => {
                assert_eq!(code, "50011");
                assert_eq!(msg, "Rate limit reached");
            }
            other => panic!("expected Server error, got {:?}", other),
        }
    }
}
