//! Login-state and stream-token collaborators.
//!
//! The streaming client stays decoupled from how an application signs in: it
//! only needs a boolean login predicate and a way to mint a short-lived
//! stream token. `TokenClient` implements the token request against the
//! backend; `LoginState` abstracts the signed-in check.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::SecretString;
use serde::Deserialize;
use thiserror::Error;

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Path of the stream-token endpoint relative to the server base URL.
pub const TOKEN_PATH: &str = "/api/auth/sse/token";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TokenClientDefaults;

impl TokenClientDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
}

#[derive(Clone, Debug)]
pub struct TokenClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
}

impl Default for TokenClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: TokenClientDefaults::CONNECT_TIMEOUT,
            attempt_timeout: TokenClientDefaults::ATTEMPT_TIMEOUT,
        }
    }
}

/// HTTP client for the stream-token endpoint.
#[derive(Clone)]
pub struct TokenClient {
    http: Client,
    base_url: String,
    attempt_timeout: Duration,
}

impl TokenClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, TokenError> {
        Self::with_options(base_url, TokenClientOptions::default())
    }

    pub fn with_options(
        base_url: impl Into<String>,
        options: TokenClientOptions,
    ) -> Result<Self, TokenError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(TokenError::Transport)?;

        let base_url = base_url.into();
        Ok(Self {
            http,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            attempt_timeout: options.attempt_timeout,
        })
    }

    /// Requests a fresh stream token.
    ///
    /// Accepts both a JSON-encoded string body and a raw text body. Non-2xx
    /// responses map to [`TokenError::HttpStatus`] with a summarized body.
    pub async fn fetch(&self) -> Result<SecretString, TokenError> {
        let endpoint = self.endpoint();
        let response = self
            .http
            .get(&endpoint)
            .timeout(self.attempt_timeout)
            .send()
            .await
            .map_err(TokenError::Transport)?;

        let status = response.status();
        let body = response.text().await.map_err(TokenError::Transport)?;

        if !status.is_success() {
            return Err(TokenError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        Ok(SecretString::new(parse_token_body(&body)))
    }

    fn endpoint(&self) -> String {
        format!("{}{}", self.base_url, TOKEN_PATH)
    }

    /// Connection pool shared with the stream transport.
    pub(crate) fn http(&self) -> &Client {
        &self.http
    }
}

/// Errors produced by the stream-token request.
#[derive(Debug, Error)]
pub enum TokenError {
    /// Request could not be sent or the body not read.
    #[error("token request failed: {0}")]
    Transport(reqwest::Error),

    /// Token endpoint answered with a non-success status.
    #[error("token endpoint status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },
}

impl TokenError {
    /// Whether this failure ends the automatic retry cycle.
    ///
    /// A 401 means the session is gone and retrying cannot help until the
    /// application signs in again; a 504 gets the same treatment. Every other
    /// failure, transport-level ones included, stays retryable.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::Transport(_) => false,
            Self::HttpStatus { status, .. } => {
                *status == StatusCode::UNAUTHORIZED || *status == StatusCode::GATEWAY_TIMEOUT
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    token: String,
}

fn parse_token_body(body: &str) -> String {
    if let Ok(token) = serde_json::from_str::<String>(body) {
        return token;
    }
    if let Ok(parsed) = serde_json::from_str::<TokenBody>(body) {
        return parsed.token;
    }
    body.trim().to_string()
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

/// Signed-in check consulted once per connect attempt.
///
/// Implemented for any `Fn() -> bool` closure; [`LoginFlag`] is the shared
/// boolean holder for applications without their own session type.
pub trait LoginState: Send + Sync {
    fn is_logged_in(&self) -> bool;
}

impl<F> LoginState for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_logged_in(&self) -> bool {
        self()
    }
}

/// Shared login flag.
///
/// Clones observe the same value, so an auth layer can hold one handle and
/// the streaming client another.
#[derive(Clone, Debug, Default)]
pub struct LoginFlag {
    logged_in: Arc<AtomicBool>,
}

impl LoginFlag {
    pub fn new(logged_in: bool) -> Self {
        Self {
            logged_in: Arc::new(AtomicBool::new(logged_in)),
        }
    }

    pub fn set_logged_in(&self, logged_in: bool) {
        self.logged_in.store(logged_in, Ordering::SeqCst);
    }
}

impl LoginState for LoginFlag {
    fn is_logged_in(&self) -> bool {
        self.logged_in.load(Ordering::SeqCst)
    }
}
