use thiserror::Error;

use crate::{DecodingError, colored::ColoredError, sync::peer::P2PError};

#[derive(Error, Debug)]
pub enum Error {
    #[error("decoding error: {0}")]
    Decoding(#[from] DecodingError),

    #[error("rocksdb error: {0}")]
    Rocks(#[from] rocksdb::Error),

    #[error("p2p error: {0}")]
    P2P(#[from] P2PError),

    #[error("colored error: {0}")]
    Colored(#[from] ColoredError),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("fetch error: {0}")]
    Fetch(String),

    #[error("row format error: {0}")]
    RowFormat(String),

    #[error("{0}")]
    Custom(String),
}

impl Error {
    pub fn custom(error: Box<dyn std::error::Error>) -> Error {
        Error::Custom(format!("{error}"))
    }

    pub fn fetch(msg: impl Into<String>) -> Error {
        Error::Fetch(msg.into())
    }

    pub fn row_format(msg: impl Into<String>) -> Error {
        Error::RowFormat(msg.into())
    }
}

impl From<Box<dyn std::error::Error>> for Error {
    fn from(err: Box<dyn std::error::Error>) -> Self {
        Error::custom(err)
    }
}
