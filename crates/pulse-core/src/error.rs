use thiserror::Error;

#[derive(Debug, Error)]
pub enum PulseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Cipher error: {0}")]
    Cipher(String),

    #[error("Market data error: {0}")]
    Market(String),

    #[error("Exchange error ({exchange}): {reason}")]
    Exchange { exchange: String, reason: String },

    #[error("LLM provider error: {0}")]
    LlmProvider(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Contract violation: {0}")]
    Contract(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PulseError {
    /// Short machine-readable code for structured log fields.
    pub fn code(&self) -> &'static str {
        match self {
            PulseError::Config(_) => "CONFIG_ERROR",
            PulseError::Database(_) => "DATABASE_ERROR",
            PulseError::Cipher(_) => "CIPHER_ERROR",
            PulseError::Market(_) => "MARKET_ERROR",
            PulseError::Exchange { .. } => "EXCHANGE_ERROR",
            PulseError::LlmProvider(_) => "LLM_PROVIDER_ERROR",
            PulseError::VectorStore(_) => "VECTOR_STORE_ERROR",
            PulseError::Contract(_) => "CONTRACT_VIOLATION",
            PulseError::Serialization(_) => "SERIALIZATION_ERROR",
            PulseError::Io(_) => "IO_ERROR",
            PulseError::Timeout { .. } => "TIMEOUT",
            PulseError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, PulseError>;
