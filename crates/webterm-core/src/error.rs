use thiserror::Error;

/// Errors produced by the gateway. The `Display` form of every variant is
/// the single line shown to the browser user.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A required backend executable or setting is missing.
    #[error("ConfigError: {0}")]
    Config(String),

    /// Backend unreachable.
    #[error("{0}")]
    Dial(String),

    /// Credentials rejected at the transport level.
    #[error("Auth Fail: {0}")]
    Auth(String),

    /// Auto-login prompt was not seen in time.
    #[error("Timeout")]
    PromptTimeout,

    /// Backend stream ended while waiting for a prompt.
    #[error("EOF or IOException Encountered")]
    PromptEof,

    #[error("{0}")]
    ProtocolDecode(String),

    #[error("Unsupported Message: {0}")]
    Unsupported(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Permission(String),

    #[error("no valid backend connection")]
    NoBackend,

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(e: serde_json::Error) -> Self {
        GatewayError::ProtocolDecode(e.to_string())
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
