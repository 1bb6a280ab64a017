//! Credential providers for the sync connection.
//!
//! The sync server authenticates every new connection with an instance name
//! and an API key, optionally paired with a user `auth_key`. An
//! [`Authenticator`] is consulted before every connect and reconnect so that
//! short-lived user keys can be refreshed.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const USER_LOGIN_PATH: &str = "/api/user.login";
/// Local development REST endpoint.
pub const LOCAL_API_BASE_URL: &str = "http://localhost:8000";

/// Identity presented to the sync server when a connection is opened.
#[derive(Clone, Debug)]
pub struct ConnectionCredentials {
    /// Instance (tenant) name.
    pub instance: String,
    /// Instance API key.
    pub api_key: SecretString,
    /// User session key for user-scoped API keys.
    pub auth_key: Option<SecretString>,
}

impl ConnectionCredentials {
    /// Credentials for an instance-level API key.
    pub fn new(instance: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            instance: instance.into(),
            api_key,
            auth_key: None,
        }
    }

    /// Attaches a user session key.
    pub fn with_auth_key(mut self, auth_key: SecretString) -> Self {
        self.auth_key = Some(auth_key);
        self
    }
}

/// Source of [`ConnectionCredentials`].
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Produces credentials for the next connection attempt.
    async fn authenticate(&self) -> Result<ConnectionCredentials, AuthError>;
}

/// Authenticator returning a fixed instance/API key pair.
#[derive(Clone, Debug)]
pub struct ApiKeyAuthenticator {
    credentials: ConnectionCredentials,
}

impl ApiKeyAuthenticator {
    pub fn new(instance: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            credentials: ConnectionCredentials::new(instance, api_key),
        }
    }
}

#[async_trait]
impl Authenticator for ApiKeyAuthenticator {
    async fn authenticate(&self) -> Result<ConnectionCredentials, AuthError> {
        Ok(self.credentials.clone())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct UserLoginDefaults;

impl UserLoginDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);
    pub const MAX_ATTEMPTS: usize = 3;
    pub const BACKOFF: Duration = Duration::from_millis(100);
    pub const JITTER: Duration = Duration::from_millis(50);
}

#[derive(Clone, Debug)]
pub struct UserLoginOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for UserLoginOptions {
    fn default() -> Self {
        Self {
            connect_timeout: UserLoginDefaults::CONNECT_TIMEOUT,
            attempt_timeout: UserLoginDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: UserLoginDefaults::MAX_ATTEMPTS,
                initial_backoff: UserLoginDefaults::BACKOFF,
                max_backoff: UserLoginDefaults::BACKOFF,
                jitter: UserLoginDefaults::JITTER,
            },
        }
    }
}

/// Authenticator that logs a user in over HTTP to obtain an `auth_key`.
///
/// A fresh login is performed for every connection attempt.
#[derive(Clone)]
pub struct UserLoginAuthenticator {
    http: Client,
    instance: String,
    api_key: SecretString,
    user_name: String,
    password: SecretString,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
    local: bool,
    base_url_override: Option<String>,
}

impl UserLoginAuthenticator {
    pub fn new(
        instance: impl Into<String>,
        api_key: SecretString,
        user_name: impl Into<String>,
        password: SecretString,
    ) -> Result<Self, AuthError> {
        Self::with_options(
            instance,
            api_key,
            user_name,
            password,
            UserLoginOptions::default(),
        )
    }

    pub fn with_options(
        instance: impl Into<String>,
        api_key: SecretString,
        user_name: impl Into<String>,
        password: SecretString,
        options: UserLoginOptions,
    ) -> Result<Self, AuthError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(AuthError::Transport)?;

        Ok(Self {
            http,
            instance: instance.into(),
            api_key,
            user_name: user_name.into(),
            password,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
            local: false,
            base_url_override: None,
        })
    }

    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit REST base URL. Takes precedence over local mode.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_url_override = Some(base_url.trim().trim_end_matches('/').to_string());
        self
    }

    fn base_url(&self) -> String {
        if let Some(base_url) = self.base_url_override.as_deref() {
            return base_url.to_string();
        }
        if self.local {
            LOCAL_API_BASE_URL.to_string()
        } else {
            format!("https://{}.syncano.com", self.instance)
        }
    }

    async fn login_attempt(&self, endpoint: &str) -> Result<SecretString, AuthError> {
        let body = UserLoginRequest {
            api_key: self.api_key.expose_secret(),
            user_name: &self.user_name,
            password: self.password.expose_secret(),
        };

        let response = self
            .http
            .post(endpoint)
            .timeout(self.attempt_timeout)
            .json(&body)
            .send()
            .await
            .map_err(AuthError::Transport)?;
        let status = response.status();
        let text = response.text().await.map_err(AuthError::Transport)?;

        if !status.is_success() {
            return Err(AuthError::HttpStatus {
                status,
                body: summarize_error_body(&text),
            });
        }

        parse_login_response(&text)
    }
}

#[async_trait]
impl Authenticator for UserLoginAuthenticator {
    async fn authenticate(&self) -> Result<ConnectionCredentials, AuthError> {
        let endpoint = format!("{}{}", self.base_url(), USER_LOGIN_PATH);
        let auth_key = retry_async(
            &self.retry_policy,
            |attempt| {
                let endpoint = endpoint.clone();
                async move {
                    debug!(event = "user_login_attempt", attempt, user = %self.user_name);
                    self.login_attempt(&endpoint).await
                }
            },
            AuthError::is_retryable,
        )
        .await?;

        Ok(ConnectionCredentials::new(self.instance.clone(), self.api_key.clone())
            .with_auth_key(auth_key))
    }
}

#[derive(Serialize)]
struct UserLoginRequest<'a> {
    api_key: &'a str,
    user_name: &'a str,
    password: &'a str,
}

/// Errors produced while obtaining connection credentials.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("login rejected: {0}")]
    Rejected(String),

    #[error("failed to parse login response: {0}")]
    Parse(String),
}

impl AuthError {
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Rejected(_) | Self::Parse(_) => false,
        }
    }
}

#[derive(Debug, Deserialize)]
struct LoginEnvelope {
    result: String,
    #[serde(default)]
    auth_key: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn parse_login_response(body: &str) -> Result<SecretString, AuthError> {
    let envelope: LoginEnvelope =
        serde_json::from_str(body).map_err(|err| AuthError::Parse(err.to_string()))?;

    if envelope.result.eq_ignore_ascii_case("ok") {
        return envelope
            .auth_key
            .filter(|key| !key.is_empty())
            .map(SecretString::new)
            .ok_or_else(|| AuthError::Parse("result=OK payload missing auth_key".to_string()));
    }

    Err(AuthError::Rejected(
        envelope
            .error
            .or(envelope.message)
            .unwrap_or_else(|| format!("result={}", envelope.result)),
    ))
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use secrecy::{ExposeSecret, SecretString};

    use super::{
        parse_login_response, summarize_error_body, ApiKeyAuthenticator, AuthError,
        Authenticator, UserLoginAuthenticator, LOCAL_API_BASE_URL,
    };

    fn secret(value: &str) -> SecretString {
        SecretString::new(value.to_string())
    }

    #[test]
    fn parse_ok_envelope_returns_auth_key() {
        let key = parse_login_response(r#"{"result":"OK","auth_key":"abc123"}"#)
            .expect("parse ok envelope");
        assert_eq!(key.expose_secret(), "abc123");
    }

    #[test]
    fn parse_nok_envelope_as_rejection() {
        let error = parse_login_response(r#"{"result":"NOK","error":"Invalid password"}"#)
            .expect_err("nok should error");

        match error {
            AuthError::Rejected(reason) => assert_eq!(reason, "Invalid password"),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn parse_ok_without_key_is_a_parse_error() {
        let error = parse_login_response(r#"{"result":"OK"}"#).expect_err("missing key");
        assert!(matches!(error, AuthError::Parse(_)));
        assert!(!error.is_retryable());
    }

    #[test]
    fn server_errors_are_retryable() {
        let error = AuthError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            body: String::new(),
        };
        assert!(error.is_retryable());

        let error = AuthError::HttpStatus {
            status: StatusCode::FORBIDDEN,
            body: String::new(),
        };
        assert!(!error.is_retryable());
    }

    #[test]
    fn error_body_prefers_structured_message() {
        assert_eq!(summarize_error_body(r#"{"error":"quota"}"#), "quota");
        let long = "x".repeat(500);
        assert_eq!(summarize_error_body(&long).len(), 220);
    }

    #[test]
    fn base_url_resolution_prefers_override() {
        let login = UserLoginAuthenticator::new("acme", secret("k"), "ann", secret("p"))
            .expect("build authenticator");
        assert_eq!(login.base_url(), "https://acme.syncano.com");

        let local = login.clone().with_local_mode(true);
        assert_eq!(local.base_url(), LOCAL_API_BASE_URL);

        let overridden = local.with_base_url(" http://127.0.0.1:9000/ ");
        assert_eq!(overridden.base_url(), "http://127.0.0.1:9000");
    }

    #[tokio::test]
    async fn api_key_authenticator_returns_fixed_credentials() {
        let authenticator = ApiKeyAuthenticator::new("acme", secret("key-1"));
        let credentials = authenticator.authenticate().await.expect("credentials");

        assert_eq!(credentials.instance, "acme");
        assert_eq!(credentials.api_key.expose_secret(), "key-1");
        assert!(credentials.auth_key.is_none());
    }
}
