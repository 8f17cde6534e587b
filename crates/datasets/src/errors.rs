use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serde_json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("tokenizer error: {0}")]
    Tokenizer(String),

    #[error("unknown dataset {0}, please register")]
    UnknownDataset(String),

    #[error("failed to read split '{split}' from {path}: {reason}")]
    Split {
        split: String,
        path: String,
        reason: String,
    },

    #[error("malformed item: {0}")]
    Format(String),
}

pub(crate) fn format_error<S: Into<String>>(msg: S) -> Error {
    Error::Format(msg.into())
}
