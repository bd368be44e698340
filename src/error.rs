use thiserror::Error;

/// Domain errors for the storefront core.
///
/// Validation and balance errors are user-facing and recoverable (the flow may
/// retry or abort cleanly); storage errors propagate — a balance mutation must
/// never be reported as success when the write failed.
#[derive(Error, Debug)]
pub enum ShopError {
    #[error("{0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("insufficient balance: {required} required, {available} available")]
    InsufficientBalance { required: i64, available: i64 },

    #[error("remote provisioning failed: {0}")]
    RemoteProvisioning(String),

    #[error("remote provisioning timed out")]
    RemoteTimeout,

    /// Absorbed silently at call sites: the first settlement already notified
    /// the user.
    #[error("invoice already settled")]
    AlreadySettled,

    #[error("payment backend is disabled")]
    BackendDisabled,

    #[error("all payment backends are disabled")]
    AllBackendsDisabled,

    #[error("amount out of range: must be between {min} and {max}")]
    AmountOutOfRange { min: i64, max: i64 },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ShopError {
    /// True for errors that should be shown to the user inline and leave the
    /// current flow step unchanged.
    pub fn is_validation(&self) -> bool {
        matches!(self, ShopError::Validation(_))
    }

    pub fn is_terminal_invoice(&self) -> bool {
        matches!(self, ShopError::AlreadySettled)
    }
}

pub type ShopResult<T> = Result<T, ShopError>;
