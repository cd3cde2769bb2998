use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Config Error - {0}")]
    Config(String),

    #[error("Watch Error - {0}")]
    Watch(String),

    #[error("Filesystem Error - {0}")]
    Filesystem(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Processor Error - {0}")]
    Processor(String),
}
