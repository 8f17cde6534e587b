use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde_json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("invalid model config: {0}")]
    Config(String),

    #[error("unknown model '{0}': not a preset and no config.json found")]
    UnknownModel(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn checkpoint<S: Into<String>>(msg: S) -> Self {
        Error::Checkpoint(msg.into())
    }
}
