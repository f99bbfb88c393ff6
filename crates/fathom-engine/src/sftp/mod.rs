//! SFTP protocol state machines.
//!
//! - `connect` — handshake, host-key verification, authentication ladder
//! - `ops` — list, mkdir, remove, rename, chmod, scan, keepalive
//! - `transfer` — chunked get/put with resume and throttling
//!
//! The SSH library is synchronous; every call is bounded by the session
//! timeout and commands keep their per-step work small (one directory, one
//! buffer slice), so a step never stalls the connection task for long.

pub mod connect;
pub mod ops;
pub mod transfer;

use crate::command::{ChainStatus, Command, CommandChain, ResultCode};
use crate::error::{EngineError, EngineResult};
use crate::session::{EngineShared, SessionCore};
use chrono::{DateTime, TimeZone, Utc};
use fathom_core::{DirectoryEntry, EntryKind, ErrorKind, SessionEvent, WakeupEvent};
use tokio::sync::mpsc::UnboundedSender;

/// Mutable state shared by all SFTP commands of one session.
pub struct SftpCtx {
    pub core: SessionCore,
    pub session: Option<ssh2::Session>,
    pub sftp: Option<ssh2::Sftp>,
}

impl SftpCtx {
    pub fn new(events: UnboundedSender<SessionEvent>, shared: EngineShared) -> Self {
        Self {
            core: SessionCore::new(events, shared),
            session: None,
            sftp: None,
        }
    }

    pub fn sftp(&self) -> EngineResult<&ssh2::Sftp> {
        self.sftp.as_ref().ok_or(EngineError::Disconnected)
    }

    /// Bound for every blocking SSH call, enforced by the library's own
    /// session timeout.
    pub fn control_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.core.settings.get_u32(
            fathom_core::settings::keys::CONTROL_TIMEOUT,
            crate::ftp::DEFAULT_CONTROL_TIMEOUT_SECS,
        ) as u64)
    }

    pub fn resolve_path(&self, path: &str) -> String {
        self.core.resolve_path(path)
    }

    pub fn fail(&self, err: &EngineError, fallback: ErrorKind) -> ResultCode {
        self.core.fail(err, fallback)
    }

    /// Tear the transport down and reset connection-scoped state.
    pub fn drop_connection(&mut self) {
        self.sftp = None;
        if let Some(session) = self.session.take() {
            let _ = session.disconnect(None, "closing", None);
        }
        self.core.reset_after_disconnect();
    }
}

/// Map an SFTP stat to the engine's entry model. Ownership comes back as
/// numeric ids only; they go into the owner/group fields verbatim.
pub(crate) fn entry_from_stat(name: &str, stat: &ssh2::FileStat) -> DirectoryEntry {
    DirectoryEntry {
        filename: name.to_string(),
        owner: stat.uid.map(|v| v.to_string()).unwrap_or_default(),
        group: stat.gid.map(|v| v.to_string()).unwrap_or_default(),
        link_target: String::new(),
        permissions: stat.perm.unwrap_or(0) & 0o7777,
        size: stat.size.unwrap_or(0),
        kind: if stat.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        },
        modified: stat
            .mtime
            .and_then(|t| Utc.timestamp_opt(t as i64, 0).single()),
    }
}

pub(crate) fn mtime_of(stat: &ssh2::FileStat) -> Option<DateTime<Utc>> {
    stat.mtime.and_then(|t| Utc.timestamp_opt(t as i64, 0).single())
}

/// One SFTP session: context plus its command chain.
pub struct SftpSession {
    ctx: SftpCtx,
    chain: CommandChain<SftpCtx>,
}

impl SftpSession {
    pub fn new(events: UnboundedSender<SessionEvent>, shared: EngineShared) -> Self {
        Self {
            ctx: SftpCtx::new(events, shared),
            chain: CommandChain::new(),
        }
    }

    pub fn ctx(&self) -> &SftpCtx {
        &self.ctx
    }

    pub fn ctx_mut(&mut self) -> &mut SftpCtx {
        &mut self.ctx
    }

    pub fn busy(&self) -> bool {
        !self.chain.is_empty()
    }

    pub fn connected(&self) -> bool {
        self.ctx.core.connected
    }

    pub fn start(&mut self, cmd: Box<dyn Command<SftpCtx>>) {
        self.ctx.core.touch();
        self.chain.start(cmd);
    }

    pub async fn step(&mut self) -> ChainStatus {
        let status = self.chain.step(&mut self.ctx).await;
        self.finish(status)
    }

    pub async fn wakeup(&mut self, event: WakeupEvent) -> ChainStatus {
        let status = self.chain.wakeup(&mut self.ctx, event).await;
        self.finish(status)
    }

    pub async fn abort(&mut self) {
        if self.chain.is_empty() {
            return;
        }
        self.chain.abort(&mut self.ctx).await;
        self.ctx.core.emit(SessionEvent::Ready);
    }

    fn finish(&mut self, status: ChainStatus) -> ChainStatus {
        if let ChainStatus::Finished(code) = status {
            log::debug!("command finished: {:?}", code);
            self.ctx.core.touch();
            self.ctx.core.emit(SessionEvent::Ready);
            self.ctx.core.emit(SessionEvent::Idle);
        }
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_mapping() {
        let stat = ssh2::FileStat {
            size: Some(1234),
            uid: Some(1000),
            gid: Some(100),
            perm: Some(0o100644),
            atime: None,
            mtime: Some(1_672_915_200),
        };
        let entry = entry_from_stat("file.txt", &stat);
        assert_eq!(entry.filename, "file.txt");
        assert_eq!(entry.size, 1234);
        assert_eq!(entry.kind, EntryKind::File);
        assert_eq!(entry.permissions, 0o644);
        assert_eq!(entry.owner, "1000");
        assert!(entry.modified.is_some());
    }

    #[test]
    fn dir_stat_maps_to_dir() {
        let stat = ssh2::FileStat {
            size: Some(4096),
            uid: None,
            gid: None,
            perm: Some(0o040755),
            atime: None,
            mtime: None,
        };
        assert_eq!(entry_from_stat("sub", &stat).kind, EntryKind::Dir);
        assert!(entry_from_stat("sub", &stat).owner.is_empty());
    }
}
