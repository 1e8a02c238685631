//! Typed errors for the update engine.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A manifest arrived without a `Version` directive; nothing can be
    /// compiled from it.
    #[error("manifest missing version")]
    MissingVersion,

    /// A persisted command script could not be interpreted on resume.
    #[error("malformed update script: {0}")]
    MalformedScript(String),

    #[error("config file error: {0}")]
    Config(#[from] toml::de::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
