//! Error types for the FX collector

use thiserror::Error;

/// Collector errors
#[derive(Error, Debug)]
pub enum CollectorError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Platform {0} is not connected")]
    NotConnected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Instrument not offered by venue: {0}")]
    InstrumentNotOffered(String),

    #[error("REST API error: {0}")]
    RestApi(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown adapter kind '{kind}' for platform {platform}")]
    UnknownAdapter { platform: String, kind: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Request timed out")]
    Timeout,
}

impl From<std::io::Error> for CollectorError {
    fn from(err: std::io::Error) -> Self {
        CollectorError::Connection(err.to_string())
    }
}

impl From<serde_json::Error> for CollectorError {
    fn from(err: serde_json::Error) -> Self {
        CollectorError::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for CollectorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CollectorError::Timeout
        } else {
            CollectorError::RestApi(err.to_string())
        }
    }
}

impl From<config::ConfigError> for CollectorError {
    fn from(err: config::ConfigError) -> Self {
        CollectorError::Config(err.to_string())
    }
}

impl From<prometheus::Error> for CollectorError {
    fn from(err: prometheus::Error) -> Self {
        CollectorError::Metrics(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for CollectorError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        CollectorError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollectorError>;
