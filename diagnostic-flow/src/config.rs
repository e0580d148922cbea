use std::time::Duration;

use crate::resolver::ResolverConfig;

const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/diagnostics";
const DEFAULT_AUTH_SCHEME: &str = "Bearer";
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

const DEFAULT_RECONNECT_BASE_MS: u64 = 1000;
const DEFAULT_RECONNECT_MAX_MS: u64 = 10_000;
const DEFAULT_MAX_CONNECTION_ATTEMPTS: u32 = 10;
const DEFAULT_COMPLETION_GRACE_MS: u64 = 2000;

/// Where the prediction backend lives and how to authenticate against it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub auth_scheme: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            auth_scheme: DEFAULT_AUTH_SCHEME.to_string(),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_auth_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.auth_scheme = scheme.into();
        self
    }

    /// `Authorization` header value, if a token is configured
    pub fn authorization(&self) -> Option<String> {
        self.token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .map(|token| format!("{} {}", self.auth_scheme, token))
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub fn enhanced_prediction_url(&self) -> String {
        self.endpoint("predict/disease/enhanced/")
    }

    pub fn answer_questions_url(&self) -> String {
        self.endpoint("predict/disease/answer-questions/")
    }

    pub fn session_status_url(&self, session_id: &str) -> String {
        self.endpoint(&format!(
            "sessions/{}/status/",
            urlencoding::encode(session_id)
        ))
    }

    pub fn reasoning_stream_url(&self, session_id: &str) -> String {
        self.endpoint(&format!(
            "reasoning-stream/{}",
            urlencoding::encode(session_id)
        ))
    }
}

/// Capped exponential backoff for reasoning stream reconnects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failures after which the stream is abandoned
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            max_delay: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            max_attempts: DEFAULT_MAX_CONNECTION_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// `min(base_delay * 2^attempt, max_delay)`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// Tuning for a [`DiagnosticSessionCoordinator`](crate::DiagnosticSessionCoordinator)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub reconnect: ReconnectPolicy,
    pub resolver: ResolverConfig,
    /// How long a finished session keeps its stream open for the backend's
    /// `complete` event before tearing it down
    pub completion_grace: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            resolver: ResolverConfig::default(),
            completion_grace: Duration::from_millis(DEFAULT_COMPLETION_GRACE_MS),
        }
    }
}
