use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("invalid timestamp (expected yyyy-MM-ddTHH:mm:ssZ): {0}")]
    InvalidTimestamp(String),

    #[error("invalid bounding box (expected W,S,E,N): {0}")]
    InvalidBoundingBox(String),

    #[error("invalid collection concept id: {0}")]
    InvalidConceptId(String),

    #[error("no configuration found")]
    #[diagnostic(help("pass --config, create earthdata-sync.json, or supply --data-dir and a collection"))]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("missing collection identifier: {0}")]
    MissingCollection(String),

    #[error("refusing to search an unbounded time range: {0}")]
    #[diagnostic(help("set data_since, or repair or delete the .update marker in the data directory"))]
    UnboundedSearch(String),

    #[error("no Earthdata Login credentials: {0}")]
    #[diagnostic(help("add `machine <login host> login <user> password <pass>` to your netrc file"))]
    MissingCredentials(String),

    #[error("token request failed: {0}")]
    TokenHttp(String),

    #[error("token endpoint returned status {status}: {message}")]
    TokenStatus { status: u16, message: String },

    #[error("unexpected token response: {0}")]
    TokenResponse(String),

    #[error("CMR request failed: {0}")]
    CmrHttp(String),

    #[error("CMR returned status {status}: {message}")]
    CmrStatus { status: u16, message: String },

    #[error("unexpected CMR response: {0}")]
    CmrResponse(String),

    #[error("download failed: {0}")]
    DownloadHttp(String),

    #[error("download returned status {status}: {message}")]
    DownloadStatus { status: u16, message: String },

    #[error("failed to write checkpoint: {0}")]
    CheckpointWrite(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl SyncError {
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            SyncError::MissingCredentials(_)
                | SyncError::TokenHttp(_)
                | SyncError::TokenStatus { .. }
                | SyncError::TokenResponse(_)
        )
    }

    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SyncError::CmrHttp(_)
                | SyncError::CmrStatus { .. }
                | SyncError::CmrResponse(_)
                | SyncError::DownloadHttp(_)
                | SyncError::DownloadStatus { .. }
        )
    }

    pub fn is_config(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidTimestamp(_)
                | SyncError::InvalidBoundingBox(_)
                | SyncError::InvalidConceptId(_)
                | SyncError::MissingConfig
                | SyncError::ConfigRead(_)
                | SyncError::ConfigParse(_)
                | SyncError::InvalidConfig(_)
                | SyncError::MissingCollection(_)
                | SyncError::UnboundedSearch(_)
        )
    }
}
