use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("logger initialization failed: {0}")]
    Logger(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("request serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("node error: {0}")]
    Core(#[from] meridian_core::Error),
    #[error("cluster join failed: {0}")]
    Join(String),
    #[error("join request error: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http server error: {0}")]
    Http(#[from] hyper::Error),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
