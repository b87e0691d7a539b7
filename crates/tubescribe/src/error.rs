use std::path::PathBuf;
use thiserror::Error;

use crate::broadcast::ConnectionError;
use crate::db::DatabaseError;
use crate::queue::StoreError;

#[derive(Error, Debug)]
pub enum TubescribeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Observer connection error: {0}")]
    Connection(#[from] ConnectionError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TubescribeError>;
