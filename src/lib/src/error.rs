/// The tufroot error type.
#[derive(Debug, thiserror::Error)]
pub enum TufError {
    #[error("Internal error: [{0}]")]
    InternalError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error")]
    IOError(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Usage error: {0}")]
    UsageError(&'static str),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Malformed, missing or unwritable offline credentials archive.
    #[error("Credentials archive error: {0}")]
    ArchiveError(String),

    /// No private key in the credentials matches an expected public key.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Unsupported key type: {0}")]
    UnsupportedKeyType(String),

    /// A transaction is already active, or the server refused a concurrent change.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error(
        "The production root is out of sync with the CI root. \
         Sync it inside a transaction (`keys tuf updates init`, `sign`, `apply`) \
         or with `keys tuf sync-prod-root`"
    )]
    ProdOutOfSync,

    /// The server rejected the request and nothing was changed.
    #[error("Validation failed (HTTP {status}): {message}")]
    Validation { status: u16, message: String },

    /// Network failure, or an HTTP status outside the validation class.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Threshold error: {0}")]
    Threshold(String),
}

/// HTTP statuses the server uses to reject a change without applying any part of it.
pub const NON_FATAL_HTTP_STATUSES: [u16; 5] = [400, 401, 403, 422, 423];

impl TufError {
    /// Whether a failed `apply` left the Factory untouched.
    ///
    /// Only server-side validation rejections qualify; every other failure
    /// may have happened in the middle of a commit.
    pub fn is_non_fatal_apply(&self) -> bool {
        matches!(
            self,
            TufError::Validation { status, .. } if NON_FATAL_HTTP_STATUSES.contains(status)
        )
    }

    /// Short, stable name of the error class (used in audit events).
    pub fn kind(&self) -> &'static str {
        match self {
            TufError::InternalError(_) => "internal",
            TufError::ParseError(_) => "parse",
            TufError::IOError(_) => "io",
            TufError::CryptoError(_) => "crypto",
            TufError::InvalidArgument(_) => "invalid_argument",
            TufError::UsageError(_) => "usage",
            TufError::ConfigError(_) => "config",
            TufError::ArchiveError(_) => "archive",
            TufError::KeyNotFound(_) => "key_not_found",
            TufError::UnsupportedKeyType(_) => "unsupported_key_type",
            TufError::Conflict(_) => "conflict",
            TufError::ProdOutOfSync => "prod_out_of_sync",
            TufError::Validation { .. } => "validation",
            TufError::Transport(_) => "transport",
            TufError::Threshold(_) => "threshold",
        }
    }
}

impl From<serde_json::Error> for TufError {
    fn from(err: serde_json::Error) -> Self {
        TufError::ParseError(err.to_string())
    }
}

impl From<ed25519_compact::Error> for TufError {
    fn from(err: ed25519_compact::Error) -> Self {
        TufError::CryptoError(format!("Ed25519: {}", err))
    }
}

impl From<rsa::Error> for TufError {
    fn from(err: rsa::Error) -> Self {
        TufError::CryptoError(format!("RSA: {}", err))
    }
}
