//! FTP control-channel codec (RFC 959 §4).
//!
//! Sends CRLF-terminated commands and reads single- or multi-line replies
//! ("NNN-" lines continue until "NNN "). Every wire line is traced through
//! the `log` facade and mirrored onto the session's event stream.

use super::stream::SecurableStream;
use crate::error::{EngineError, EngineResult};
use crate::session::SessionCore;
use fathom_core::SessionEvent;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};

/// A complete FTP reply: 3-digit code plus all lines received.
#[derive(Debug, Clone)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    /// First digit of the code (the reply class).
    pub fn class(&self) -> u16 {
        self.code / 100
    }

    /// Text of the final line, code stripped.
    pub fn text(&self) -> &str {
        self.lines
            .last()
            .map(|l| l.get(4..).unwrap_or("").trim())
            .unwrap_or("")
    }

    /// All body lines of a multi-line reply (between the first and last).
    pub fn body(&self) -> &[String] {
        if self.lines.len() > 2 {
            &self.lines[1..self.lines.len() - 1]
        } else {
            &[]
        }
    }

    pub fn is_positive(&self) -> bool {
        self.class() == 2
    }

    pub fn into_error(self) -> EngineError {
        EngineError::reply(self.code, self.text().to_string())
    }
}

pub struct ControlChannel {
    reader: BufReader<ReadHalf<SecurableStream>>,
    writer: WriteHalf<SecurableStream>,
    timeout: Duration,
}

impl ControlChannel {
    pub fn new(stream: SecurableStream, timeout: Duration) -> Self {
        let (rd, wr) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(rd),
            writer: wr,
            timeout,
        }
    }

    /// Reclaim the underlying stream, e.g. for an in-place TLS upgrade.
    /// Any buffered unread bytes are dropped; callers only upgrade at a
    /// reply boundary.
    pub fn into_stream(self) -> SecurableStream {
        self.reader.into_inner().unsplit(self.writer)
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send one command line (CRLF appended here).
    pub async fn send_command(&mut self, cmd: &str, core: &SessionCore) -> EngineResult<()> {
        let line = format!("{}\r\n", cmd);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        // Never let credentials reach logs or the event stream.
        let shown = if cmd.starts_with("PASS") {
            "PASS ********"
        } else {
            cmd
        };
        log::trace!(">>> {}", shown);
        core.emit(SessionEvent::CommandSent(shown.to_string()));
        Ok(())
    }

    async fn read_line(&mut self) -> EngineResult<String> {
        let mut buf = String::new();
        let n = tokio::time::timeout(self.timeout, self.reader.read_line(&mut buf))
            .await
            .map_err(|_| EngineError::Timeout)??;
        if n == 0 {
            return Err(EngineError::Disconnected);
        }
        Ok(buf.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read a complete reply, following "NNN-" continuation lines until
    /// the matching "NNN " terminator.
    pub async fn read_reply(&mut self, core: &SessionCore) -> EngineResult<Reply> {
        let first = self.read_line().await?;
        if first.len() < 3 {
            return Err(EngineError::protocol(format!(
                "reply too short: '{}'",
                first
            )));
        }
        let code: u16 = first[..3]
            .parse()
            .map_err(|_| EngineError::protocol(format!("bad reply code in '{}'", first)))?;

        let mut lines = vec![first.clone()];
        let is_multi = first.as_bytes().get(3) == Some(&b'-');
        if is_multi {
            let terminator = format!("{} ", code);
            loop {
                let next = self.read_line().await?;
                let done = next.starts_with(&terminator);
                if !done {
                    core.emit(SessionEvent::MultilineResponse(next.clone()));
                }
                lines.push(next);
                if done {
                    break;
                }
            }
        }

        let reply = Reply { code, lines };
        log::trace!("<<< {}", reply.lines.last().map(String::as_str).unwrap_or(""));
        core.emit(SessionEvent::Response(
            reply.lines.last().cloned().unwrap_or_default(),
        ));
        Ok(reply)
    }

    /// Send a command and read its reply.
    pub async fn execute(&mut self, cmd: &str, core: &SessionCore) -> EngineResult<Reply> {
        self.send_command(cmd, core).await?;
        self.read_reply(core).await
    }

    /// Send a command and require a reply of the given class.
    pub async fn expect(
        &mut self,
        cmd: &str,
        class: u16,
        core: &SessionCore,
    ) -> EngineResult<Reply> {
        let reply = self.execute(cmd, core).await?;
        if reply.class() != class {
            return Err(reply.into_error());
        }
        Ok(reply)
    }

    /// Send a command and require a 2xx reply.
    pub async fn expect_ok(&mut self, cmd: &str, core: &SessionCore) -> EngineResult<Reply> {
        self.expect(cmd, 2, core).await
    }
}
