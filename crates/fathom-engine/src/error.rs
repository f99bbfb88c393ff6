//! Internal engine error type.
//!
//! Commands work in `EngineResult` and convert to the public
//! `fathom_core::ErrorKind` vocabulary only at the event boundary, via
//! [`EngineError::kind`]. Reply-code classification follows RFC 959
//! semantics with text sniffing for the ambiguous 450/550 family.

use fathom_core::ErrorKind;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("server closed the connection")]
    Disconnected,

    #[error("timed out waiting for server")]
    Timeout,

    /// A 4xx/5xx (or otherwise unexpected) FTP reply.
    #[error("[{code}] {text}")]
    Reply { code: u16, text: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("TLS: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("SSH: {0}")]
    Ssh(#[from] ssh2::Error),

    /// Local-side failure (file open, bad parameters).
    #[error("{0}")]
    Local(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn reply(code: u16, text: impl Into<String>) -> Self {
        Self::Reply {
            code,
            text: text.into(),
        }
    }

    pub fn protocol(detail: impl Into<String>) -> Self {
        Self::Protocol(detail.into())
    }

    pub fn local(detail: impl Into<String>) -> Self {
        Self::Local(detail.into())
    }

    /// The reply code, when this error wraps one.
    pub fn code(&self) -> Option<u16> {
        match self {
            Self::Reply { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Map onto the public error-kind vocabulary. Commands may override
    /// this with a more specific kind (e.g. `ListFailed`) when emitting.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Disconnected | Self::Tls(_) => ErrorKind::ConnectFailed,
            Self::Reply { code, text } => match code {
                421 => ErrorKind::ConnectFailed,
                430 | 530 | 532 => ErrorKind::LoginFailed,
                450 | 550 => {
                    let lower = text.to_lowercase();
                    if lower.contains("permission") || lower.contains("denied") {
                        ErrorKind::PermissionDenied
                    } else if lower.contains("not found") || lower.contains("no such") {
                        ErrorKind::FileNotFound
                    } else {
                        ErrorKind::OperationFailed
                    }
                }
                _ => ErrorKind::OperationFailed,
            },
            Self::Ssh(e) => match e.code() {
                ssh2::ErrorCode::Session(libssh2_code) if libssh2_code == -18 => {
                    // LIBSSH2_ERROR_AUTHENTICATION_FAILED
                    ErrorKind::LoginFailed
                }
                ssh2::ErrorCode::SFTP(2) => ErrorKind::FileNotFound,
                ssh2::ErrorCode::SFTP(3) => ErrorKind::PermissionDenied,
                _ => ErrorKind::OperationFailed,
            },
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
                std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
                std::io::ErrorKind::ConnectionRefused => ErrorKind::ConnectFailed,
                _ => ErrorKind::OperationFailed,
            },
            Self::Timeout | Self::Protocol(_) | Self::Local(_) => ErrorKind::OperationFailed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_classification() {
        assert_eq!(
            EngineError::reply(530, "Login incorrect.").kind(),
            ErrorKind::LoginFailed
        );
        assert_eq!(
            EngineError::reply(550, "Permission denied.").kind(),
            ErrorKind::PermissionDenied
        );
        assert_eq!(
            EngineError::reply(550, "No such file or directory").kind(),
            ErrorKind::FileNotFound
        );
        assert_eq!(
            EngineError::reply(550, "Requested action not taken").kind(),
            ErrorKind::OperationFailed
        );
        assert_eq!(
            EngineError::reply(421, "Service not available").kind(),
            ErrorKind::ConnectFailed
        );
    }

    #[test]
    fn io_classification() {
        let e = EngineError::from(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "missing",
        ));
        assert_eq!(e.kind(), ErrorKind::FileNotFound);
    }
}
