//! A control/data stream that may be plain TCP or TLS-wrapped.
//!
//! Both FTP channels need the same duality: the control channel upgrades
//! in place after `AUTH TLS`, and the data channel is wrapped when `PROT P`
//! is active. One enum serves both.

use crate::error::{EngineError, EngineResult};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;

pub enum SecurableStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl SecurableStream {
    pub fn is_tls(&self) -> bool {
        matches!(self, Self::Tls(_))
    }

    /// Wrap in TLS. `accept_invalid` disables certificate verification —
    /// only set after the consumer explicitly accepted the peer.
    pub async fn upgrade_tls(self, domain: &str, accept_invalid: bool) -> EngineResult<Self> {
        let stream = match self {
            Self::Plain(s) => s,
            Self::Tls(_) => return Err(EngineError::protocol("stream is already TLS")),
        };
        let connector = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(accept_invalid)
            .danger_accept_invalid_hostnames(accept_invalid)
            .build()?;
        let connector = tokio_native_tls::TlsConnector::from(connector);
        let tls = connector.connect(domain, stream).await?;
        Ok(Self::Tls(Box::new(tls)))
    }
}

impl AsyncRead for SecurableStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for SecurableStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
