use hyper::StatusCode;
use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;

/// Failure of a remote broker query. Never fatal: the alert being processed is
/// abandoned and the polling loop carries on.
#[derive(Debug, Error)]
pub enum BrokerQueryError {
    #[error("HTTP {status} from {endpoint}: {body}")]
    Status {
        endpoint: String,
        status: StatusCode,
        body: String,
        likely_timeout: bool,
    },
    #[error("Request to {endpoint} timed out after {elapsed:?}")]
    Timeout {
        endpoint: String,
        elapsed: std::time::Duration,
    },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Invalid broker response: {0}")]
    InvalidResponse(String),
}

impl BrokerQueryError {
    pub fn is_likely_timeout(&self) -> bool {
        match self {
            BrokerQueryError::Status { likely_timeout, .. } => *likely_timeout,
            BrokerQueryError::Timeout { .. } => true,
            _ => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum StampDecodeError {
    #[error("Stamp payload is empty")]
    Empty,
    #[error("Failed to decompress stamp: {0}")]
    Decompress(#[from] std::io::Error),
    #[error("Malformed FITS header: {0}")]
    Header(String),
    #[error("Unsupported BITPIX {0}")]
    UnsupportedBitpix(i64),
    #[error("FITS data truncated: expected {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
    #[error("Decompressed stamp exceeds {0} bytes")]
    TooLarge(u64),
}

/// Delivery of one item to one recipient failed.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Invalid recipient address {0}")]
    InvalidRecipient(String),
    #[error("Failed to read artifact {path}: {source}")]
    Artifact {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to build message: {0}")]
    Message(String),
    #[error("Transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Failed to parse generated SVG: {0}")]
    Svg(String),
    #[error("Failed to allocate a {width}x{height} canvas")]
    Canvas { width: u32, height: u32 },
    #[error("Failed to encode PNG: {0}")]
    Encode(String),
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Alert source connection error: {0}")]
    Connection(String),
    #[error("Failed to decode alert payload: {0}")]
    Decode(String),
    #[error("Alert source I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Failed to create archive directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to serialize alert: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Anything that escapes the polling loop. These halt the process after an
/// operator report.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("Polling loop panicked: {0}")]
    Panicked(String),
    #[error("Polling loop was aborted: {0}")]
    Aborted(String),
    #[error("Failed to allocate artifact path in {dir}: {source}")]
    Allocate {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
