//! Engine error type — a fixed kind enumeration plus detail text.
//!
//! Consumers branch on `ErrorKind`; the detail string is human-readable
//! server/system output and is never parsed.

use serde::{Deserialize, Serialize};

/// Categorised engine error kind, carried on error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// TCP / TLS / SSH transport could not be established.
    ConnectFailed,
    /// Authentication rejected.
    LoginFailed,
    /// Server refused the operation on permission grounds.
    PermissionDenied,
    /// Remote file or directory does not exist.
    FileNotFound,
    /// Catch-all for a rejected or aborted operation.
    OperationFailed,
    /// Directory listing could not be retrieved.
    ListFailed,
    /// A local file could not be opened or created.
    FileOpenFailed,
}

/// Engine error: kind + optional human-readable detail.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind:?}: {detail}")]
pub struct Error {
    pub kind: ErrorKind,
    pub detail: String,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    pub fn connect_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectFailed, detail)
    }

    pub fn login_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::LoginFailed, detail)
    }

    pub fn permission_denied(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::PermissionDenied, detail)
    }

    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::FileNotFound, detail)
    }

    pub fn operation_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::OperationFailed, detail)
    }

    pub fn list_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ListFailed, detail)
    }

    pub fn file_open_failed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::FileOpenFailed, detail)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(e.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::permission_denied(e.to_string()),
            _ => Self::operation_failed(e.to_string()),
        }
    }
}
