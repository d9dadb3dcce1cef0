use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown task referenced: {id}")]
    UnknownTask { id: crate::core::TaskId },

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl Error {
    /// Process exit code used by the CLI for this error.
    ///
    /// Unreadable or unparseable input maps to 2, malformed but parseable
    /// input maps to 3.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Io(_) | Error::Json(_) | Error::TomlParse(_) | Error::TomlSerialize(_) => 2,
            Error::NoHomeDir => 2,
            Error::Validation(_) | Error::UnknownTask { .. } | Error::Timeout(_) => 3,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
