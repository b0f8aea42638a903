//! Error types.
//!
//! - `EngineError`: a failure reported by (or while talking to) an external
//!   Stan engine.
//! - `BackendError`: the library-facing taxonomy returned by backends, the
//!   registry and the result parsers.
//! - `AppError`: what the `prophet-stan` binary reports, with an exit code.

use thiserror::Error;

/// Failure of an external sampling/optimization engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The engine ran and reported a failure (non-zero exit, failed operation).
    ///
    /// This is the only variant eligible for the Newton fallback.
    #[error("{0}")]
    Runtime(String),

    /// The engine could not be launched or its files could not be accessed.
    #[error("engine I/O failed: {0}")]
    Io(#[from] std::io::Error),

    /// The engine service could not be reached or answered with a bad status.
    #[error("engine request failed: {0}")]
    Transport(String),

    /// The engine produced output we cannot interpret.
    #[error("unexpected engine output: {0}")]
    Output(String),
}

impl EngineError {
    /// Whether this failure came from the optimizer/sampler itself.
    pub fn is_runtime(&self) -> bool {
        matches!(self, EngineError::Runtime(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        EngineError::Transport(e.to_string())
    }
}

/// Errors surfaced by backends, the registry and result parsing.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Model artifact missing, corrupt or incompatible with this platform.
    #[error("failed to load stan model: {0}")]
    Load(String),

    #[error("Unknown option {0}")]
    UnknownOption(String),

    #[error("Invalid value for option '{key}': {reason}")]
    InvalidOption { key: String, reason: String },

    #[error("Unknown stan backend: {0}")]
    UnknownBackend(String),

    /// The optimizer failed (after the Newton fallback, when it applied).
    #[error("optimization failed: {0}")]
    Fit(#[source] EngineError),

    /// The sampler failed. Never retried.
    #[error("sampling failed: {0}")]
    Sample(#[source] EngineError),

    #[error("Found repeated column name '{0}'")]
    DuplicateColumn(String),

    /// Model data or init values are inconsistent with the declared sizes.
    #[error("invalid model input: {0}")]
    InvalidData(String),

    /// Engine output has an unexpected shape.
    #[error("invalid engine output: {0}")]
    InvalidOutput(String),

    #[error("model download failed: {0}")]
    Download(String),
}

/// Error reported by the binary, carrying its process exit code.
#[derive(Clone)]
pub struct AppError {
    exit_code: u8,
    message: String,
}

impl AppError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        let exit_code = match &err {
            BackendError::UnknownOption(_)
            | BackendError::InvalidOption { .. }
            | BackendError::UnknownBackend(_)
            | BackendError::InvalidData(_) => 2,
            BackendError::Load(_) | BackendError::Download(_) => 3,
            BackendError::Fit(_)
            | BackendError::Sample(_)
            | BackendError::DuplicateColumn(_)
            | BackendError::InvalidOutput(_) => 4,
        };
        AppError::new(exit_code, err.to_string())
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for AppError {}
