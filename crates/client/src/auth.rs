use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use serde::Serialize;
use sha2::Sha256;
use thiserror::Error;

use crate::config::ConfigError;

type HmacSha256 = Hmac<Sha256>;

/// Path signed by the websocket login handshake.
const LOGIN_VERIFY_PATH: &str = "/users/self/verify";

pub const ENV_API_KEY: &str = "PUSHFEED_API_KEY";
pub const ENV_SECRET_KEY: &str = "PUSHFEED_SECRET_KEY";
pub const ENV_PASSPHRASE: &str = "PUSHFEED_PASSPHRASE";

/// Errors that can occur during authentication
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Credential field {0} is empty")]
    EmptyField(&'static str),
    #[error("Failed to sign message: {0}")]
    SigningError(String),
    #[error("Login rejected with code {code}: {msg}")]
    Rejected { code: String, msg: String },
}

/// API key credentials for private endpoints
#[derive(Clone)]
pub struct Credentials {
    pub api_key: String,
    secret_key: String,
    passphrase: String,
}

/// Login command argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginArgs {
    pub api_key: String,
    pub passphrase: String,
    pub timestamp: String,
    pub sign: String,
}

impl Credentials {
    pub fn new(
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Result<Self, AuthError> {
        let credentials = Self {
            api_key: api_key.into(),
            secret_key: secret_key.into(),
            passphrase: passphrase.into(),
        };
        if credentials.api_key.is_empty() {
            return Err(AuthError::EmptyField("api_key"));
        }
        if credentials.secret_key.is_empty() {
            return Err(AuthError::EmptyField("secret_key"));
        }
        if credentials.passphrase.is_empty() {
            return Err(AuthError::EmptyField("passphrase"));
        }
        Ok(credentials)
    }

    /// Load credentials from `PUSHFEED_API_KEY`, `PUSHFEED_SECRET_KEY` and
    /// `PUSHFEED_PASSPHRASE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let read = |name: &'static str| {
            std::env::var(name)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(name.to_string()))
        };
        let api_key = read(ENV_API_KEY)?;
        let secret_key = read(ENV_SECRET_KEY)?;
        let passphrase = read(ENV_PASSPHRASE)?;
        Ok(Self {
            api_key,
            secret_key,
            passphrase,
        })
    }

    /// Base64 HMAC-SHA256 of `prehash` under the secret key.
    pub fn sign(&self, prehash: &str) -> Result<String, AuthError> {
        let mut mac = HmacSha256::new_from_slice(self.secret_key.as_bytes())
            .map_err(|e| AuthError::SigningError(e.to_string()))?;
        mac.update(prehash.as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    /// Build the websocket login argument for `unix_secs`.
    ///
    /// The signed string is `timestamp + "GET" + "/users/self/verify"`.
    pub fn login_args(&self, unix_secs: i64) -> Result<LoginArgs, AuthError> {
        let timestamp = unix_secs.to_string();
        let sign = self.sign(&format!("{}GET{}", timestamp, LOGIN_VERIFY_PATH))?;
        Ok(LoginArgs {
            api_key: self.api_key.clone(),
            passphrase: self.passphrase.clone(),
            timestamp,
            sign,
        })
    }

    /// Sign a REST request. Returns the signature for
    /// `timestamp + METHOD + path_and_query + body`.
    pub fn sign_request(
        &self,
        timestamp: &str,
        method: &str,
        path_and_query: &str,
        body: &str,
    ) -> Result<String, AuthError> {
        self.sign(&format!(
            "{}{}{}{}",
            timestamp,
            method.to_uppercase(),
            path_and_query,
            body
        ))
    }

    pub fn passphrase(&self) -> &str {
        &self.passphrase
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &self.api_key)
            .field("secret_key", &"<redacted>")
            .field("passphrase", &"<redacted>")
            .finish()
    }
}
