use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] pulse_store::StoreError),

    #[error("source error: {0}")]
    Source(#[from] pulse_sources::SourceError),

    #[error("LLM error: {0}")]
    Llm(#[from] pulse_llm::ProviderError),

    #[error("vector error: {0}")]
    Vector(#[from] pulse_vector::VectorError),

    #[error("core error: {0}")]
    Core(#[from] pulse_core::error::PulseError),

    #[error("contract violation: {0}")]
    Contract(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
