use thiserror::Error;

/// Errors raised by the LLaVA-Llama3 stack.
#[derive(Error, Debug)]
pub enum Error {
    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("unknown model type: {0}")]
    UnknownModelType(String),

    #[error("config parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("multimodal merge: {0}")]
    Multimodal(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
