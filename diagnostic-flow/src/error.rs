use thiserror::Error;

/// Errors raised while driving a diagnostic session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiagnosticError {
    /// Local input was rejected before any network call
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A REST call to the prediction backend failed
    #[error("Network request failed: {0}")]
    Network(String),

    /// The reasoning event stream failed at the transport level
    #[error("Reasoning stream error: {0}")]
    Stream(String),

    /// The operation is not valid for the current session identifiers
    #[error("Concurrency error: {0}")]
    Concurrency(String),
}

impl DiagnosticError {
    /// Whether the error was resolved locally without touching the network
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            DiagnosticError::Validation(_) | DiagnosticError::Concurrency(_)
        )
    }
}

impl From<reqwest::Error> for DiagnosticError {
    fn from(err: reqwest::Error) -> Self {
        DiagnosticError::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DiagnosticError>;
