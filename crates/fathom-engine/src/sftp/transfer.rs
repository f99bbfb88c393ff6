//! SFTP file transfers — chunked get/put with the same existence/resume
//! negotiation and throttling as the FTP transfers. Resume is a plain seek
//! on the remote handle instead of a REST exchange.

use super::{entry_from_stat, mtime_of, SftpCtx};
use crate::command::{Command, Flow, ResultCode};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fathom_core::limiter::{Channel, ItemId};
use fathom_core::{
    DirectoryEntry, EntryKind, ErrorKind, FileExistsAction, RemoteUrl, SessionEvent, WakeupEvent,
};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const SLICE: usize = 32 * 1024;
const THROTTLE_WAIT: std::time::Duration = std::time::Duration::from_millis(25);

fn entry_from_metadata(name: &str, md: &std::fs::Metadata) -> DirectoryEntry {
    DirectoryEntry {
        filename: name.to_string(),
        size: md.len(),
        kind: if md.is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        },
        modified: md.modified().ok().map(DateTime::from),
        ..Default::default()
    }
}

// ── Get (download) ───────────────────────────────────────────────────

enum GetState {
    Stat,
    AwaitDecision,
    Open,
    Pump,
    Complete,
}

pub struct GetCmd {
    remote: String,
    local: PathBuf,
    state: GetState,
    offset: u64,
    modified: Option<DateTime<Utc>>,
    remote_file: Option<ssh2::File>,
    local_file: Option<File>,
    item: Option<ItemId>,
    bytes: u64,
}

impl GetCmd {
    pub fn new(remote: impl Into<String>, local: impl Into<PathBuf>) -> Self {
        Self {
            remote: remote.into(),
            local: local.into(),
            state: GetState::Stat,
            offset: 0,
            modified: None,
            remote_file: None,
            local_file: None,
            item: None,
            bytes: 0,
        }
    }

    fn stat(&mut self, ctx: &mut SftpCtx) -> EngineResult<Option<DirectoryEntry>> {
        let remote = ctx.resolve_path(&self.remote);
        let stat = ctx.sftp()?.stat(Path::new(&remote))?;
        let name = remote.rsplit('/').next().unwrap_or(&remote);
        let source = entry_from_stat(name, &stat);
        self.modified = mtime_of(&stat);
        ctx.core.last_stat = Some(source.clone());
        Ok(Some(source))
    }

    async fn open(&mut self, ctx: &mut SftpCtx) -> EngineResult<()> {
        let remote = ctx.resolve_path(&self.remote);
        let mut remote_file = ctx.sftp()?.open(Path::new(&remote))?;
        if self.offset > 0 {
            remote_file
                .seek(SeekFrom::Start(self.offset))
                .map_err(EngineError::Io)?;
            ctx.core.emit(SessionEvent::ResumeOffset(self.offset));
        }
        self.remote_file = Some(remote_file);

        self.local_file = Some(if self.offset > 0 {
            OpenOptions::new()
                .append(true)
                .open(&self.local)
                .await
                .map_err(EngineError::Io)?
        } else {
            File::create(&self.local).await.map_err(EngineError::Io)?
        });

        if !ctx.core.shared.limiter().is_unlimited(Channel::Download) {
            self.item = Some(ctx.core.shared.limiter().register(Channel::Download));
        }
        Ok(())
    }

    async fn pump_slice(&mut self, ctx: &mut SftpCtx) -> EngineResult<bool> {
        let granted = ctx.core.shared.grant(Channel::Download, self.item, SLICE);
        if granted == 0 {
            tokio::time::sleep(THROTTLE_WAIT).await;
            return Ok(false);
        }
        let remote = self
            .remote_file
            .as_mut()
            .ok_or_else(|| EngineError::local("remote file missing"))?;
        let mut buf = vec![0u8; granted];
        let n = remote.read(&mut buf).map_err(EngineError::Io)?;
        if n == 0 {
            return Ok(true);
        }
        let local = self
            .local_file
            .as_mut()
            .ok_or_else(|| EngineError::local("local file missing"))?;
        local.write_all(&buf[..n]).await.map_err(EngineError::Io)?;
        self.bytes += n as u64;
        ctx.core.bytes_transferred += n as u64;
        Ok(false)
    }

    async fn complete(&mut self, ctx: &mut SftpCtx) -> EngineResult<()> {
        self.remote_file = None;
        if let Some(mut file) = self.local_file.take() {
            file.flush().await.map_err(EngineError::Io)?;
        }
        if let Some(modified) = self.modified {
            let mtime = filetime::FileTime::from_unix_time(modified.timestamp(), 0);
            if let Err(e) = filetime::set_file_mtime(&self.local, mtime) {
                log::debug!("mtime restore failed for {:?}: {}", self.local, e);
            }
        }
        ctx.core.emit(SessionEvent::TransferComplete { bytes: self.bytes });
        Ok(())
    }
}

#[async_trait]
impl Command<SftpCtx> for GetCmd {
    fn name(&self) -> &'static str {
        "sftp-get"
    }

    async fn process(&mut self, ctx: &mut SftpCtx) -> Flow<SftpCtx> {
        match self.state {
            GetState::Stat => {
                let source = match self.stat(ctx) {
                    Ok(entry) => entry,
                    Err(e) => {
                        let code = ctx.fail(&e, ErrorKind::FileNotFound);
                        return Flow::Done(code);
                    }
                };
                match tokio::fs::metadata(&self.local).await {
                    Ok(md) => {
                        let name = self.local.file_name().map(|n| n.to_string_lossy());
                        let dest = entry_from_metadata(name.as_deref().unwrap_or(""), &md);
                        ctx.core.emit(SessionEvent::FileExists {
                            source,
                            destination: Some(dest),
                        });
                        self.state = GetState::AwaitDecision;
                        Flow::Suspended
                    }
                    Err(_) => {
                        self.state = GetState::Open;
                        Flow::Continue
                    }
                }
            }
            GetState::AwaitDecision => Flow::Suspended,
            GetState::Open => match self.open(ctx).await {
                Ok(()) => {
                    self.state = GetState::Pump;
                    Flow::Continue
                }
                Err(e) => {
                    let code = ctx.fail(&e, ErrorKind::FileOpenFailed);
                    Flow::Done(code)
                }
            },
            GetState::Pump => match self.pump_slice(ctx).await {
                Ok(true) => {
                    self.state = GetState::Complete;
                    Flow::Continue
                }
                Ok(false) => Flow::Continue,
                Err(e) => {
                    let code = ctx.fail(&e, ErrorKind::OperationFailed);
                    Flow::Done(code)
                }
            },
            GetState::Complete => match self.complete(ctx).await {
                Ok(()) => Flow::Done(ResultCode::Ok),
                Err(e) => {
                    let code = ctx.fail(&e, ErrorKind::OperationFailed);
                    Flow::Done(code)
                }
            },
        }
    }

    async fn wakeup(&mut self, ctx: &mut SftpCtx, event: WakeupEvent) -> Flow<SftpCtx> {
        let WakeupEvent::FileExists(action) = event else {
            return Flow::Suspended;
        };
        match action {
            FileExistsAction::Overwrite => self.offset = 0,
            FileExistsAction::Resume => {
                self.offset = tokio::fs::metadata(&self.local)
                    .await
                    .map(|md| md.len())
                    .unwrap_or(0);
            }
            FileExistsAction::Rename(name) => {
                self.local = self
                    .local
                    .parent()
                    .map(|p| p.join(&name))
                    .unwrap_or_else(|| PathBuf::from(&name));
                self.offset = 0;
            }
            FileExistsAction::Skip => return Flow::Done(ResultCode::Ok),
        }
        self.state = GetState::Open;
        self.process(ctx).await
    }

    async fn cleanup(&mut self, ctx: &mut SftpCtx) {
        if let Some(item) = self.item.take() {
            ctx.core.shared.limiter().deregister(Channel::Download, item);
        }
        self.remote_file = None;
        self.local_file = None;
    }
}

// ── Put (upload) ─────────────────────────────────────────────────────

enum PutState {
    Stat,
    AwaitDecision,
    Open,
    Pump,
    Complete,
}

pub struct PutCmd {
    local: PathBuf,
    remote: String,
    state: PutState,
    offset: u64,
    dest_size: u64,
    remote_file: Option<ssh2::File>,
    local_file: Option<File>,
    item: Option<ItemId>,
    bytes: u64,
}

impl PutCmd {
    pub fn new(local: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            remote: remote.into(),
            state: PutState::Stat,
            offset: 0,
            dest_size: 0,
            remote_file: None,
            local_file: None,
            item: None,
            bytes: 0,
        }
    }

    async fn open(&mut self, ctx: &mut SftpCtx) -> EngineResult<()> {
        let mut local = File::open(&self.local).await.map_err(EngineError::Io)?;
        if self.offset > 0 {
            local
                .seek(std::io::SeekFrom::Start(self.offset))
                .await
                .map_err(EngineError::Io)?;
        }
        self.local_file = Some(local);

        let remote = ctx.resolve_path(&self.remote);
        let flags = if self.offset > 0 {
            ssh2::OpenFlags::WRITE
        } else {
            ssh2::OpenFlags::WRITE | ssh2::OpenFlags::CREATE | ssh2::OpenFlags::TRUNCATE
        };
        let mut remote_file =
            ctx.sftp()?
                .open_mode(Path::new(&remote), flags, 0o644, ssh2::OpenType::File)?;
        if self.offset > 0 {
            remote_file
                .seek(SeekFrom::Start(self.offset))
                .map_err(EngineError::Io)?;
            ctx.core.emit(SessionEvent::ResumeOffset(self.offset));
        }
        self.remote_file = Some(remote_file);

        if !ctx.core.shared.limiter().is_unlimited(Channel::Upload) {
            self.item = Some(ctx.core.shared.limiter().register(Channel::Upload));
        }
        Ok(())
    }

    async fn pump_slice(&mut self, ctx: &mut SftpCtx) -> EngineResult<bool> {
        let granted = ctx.core.shared.grant(Channel::Upload, self.item, SLICE);
        if granted == 0 {
            tokio::time::sleep(THROTTLE_WAIT).await;
            return Ok(false);
        }
        let local = self
            .local_file
            .as_mut()
            .ok_or_else(|| EngineError::local("local file missing"))?;
        let mut buf = vec![0u8; granted];
        let n = local.read(&mut buf).await.map_err(EngineError::Io)?;
        if n == 0 {
            return Ok(true);
        }
        let remote = self
            .remote_file
            .as_mut()
            .ok_or_else(|| EngineError::local("remote file missing"))?;
        remote.write_all(&buf[..n]).map_err(EngineError::Io)?;
        self.bytes += n as u64;
        ctx.core.bytes_transferred += n as u64;
        Ok(false)
    }

    fn complete(&mut self, ctx: &mut SftpCtx) -> EngineResult<()> {
        // Dropping the handle closes the remote file.
        self.remote_file = None;
        self.local_file = None;

        let remote = ctx.resolve_path(&self.remote);
        let parent = RemoteUrl::parent_of(&remote).to_string();
        let name = remote.rsplit('/').next().unwrap_or(&remote).to_string();
        if let Some(url) = ctx.core.url().cloned() {
            let mut cache = ctx.core.shared.cache();
            let patched = cache
                .find_listing(&url, &parent)
                .map(|l| l.find(&name).is_some())
                .unwrap_or(false);
            if patched {
                cache.update_entry_size(&url, &parent, &name, self.offset + self.bytes);
            } else {
                cache.invalidate(&url, &parent);
            }
        }
        ctx.core.emit(SessionEvent::TransferComplete { bytes: self.bytes });
        Ok(())
    }
}

#[async_trait]
impl Command<SftpCtx> for PutCmd {
    fn name(&self) -> &'static str {
        "sftp-put"
    }

    async fn process(&mut self, ctx: &mut SftpCtx) -> Flow<SftpCtx> {
        match self.state {
            PutState::Stat => {
                let md = match tokio::fs::metadata(&self.local).await {
                    Ok(md) if md.is_file() => md,
                    Ok(_) => {
                        let e = EngineError::local(format!(
                            "{:?} is not a regular file",
                            self.local
                        ));
                        let code = ctx.fail(&e, ErrorKind::FileOpenFailed);
                        return Flow::Done(code);
                    }
                    Err(e) => {
                        let code = ctx.fail(&EngineError::Io(e), ErrorKind::FileOpenFailed);
                        return Flow::Done(code);
                    }
                };
                let remote = ctx.resolve_path(&self.remote);
                let existing = ctx
                    .sftp()
                    .ok()
                    .and_then(|sftp| sftp.stat(Path::new(&remote)).ok());
                if let Some(stat) = existing {
                    self.dest_size = stat.size.unwrap_or(0);
                    let rname = remote.rsplit('/').next().unwrap_or(&remote);
                    let lname = self.local.file_name().map(|n| n.to_string_lossy());
                    ctx.core.emit(SessionEvent::FileExists {
                        source: Some(entry_from_metadata(lname.as_deref().unwrap_or(""), &md)),
                        destination: Some(entry_from_stat(rname, &stat)),
                    });
                    self.state = PutState::AwaitDecision;
                    return Flow::Suspended;
                }
                self.state = PutState::Open;
                Flow::Continue
            }
            PutState::AwaitDecision => Flow::Suspended,
            PutState::Open => match self.open(ctx).await {
                Ok(()) => {
                    self.state = PutState::Pump;
                    Flow::Continue
                }
                Err(e) => {
                    let code = ctx.fail(&e, ErrorKind::FileOpenFailed);
                    Flow::Done(code)
                }
            },
            PutState::Pump => match self.pump_slice(ctx).await {
                Ok(true) => {
                    self.state = PutState::Complete;
                    Flow::Continue
                }
                Ok(false) => Flow::Continue,
                Err(e) => {
                    let code = ctx.fail(&e, ErrorKind::OperationFailed);
                    Flow::Done(code)
                }
            },
            PutState::Complete => match self.complete(ctx) {
                Ok(()) => Flow::Done(ResultCode::Ok),
                Err(e) => {
                    let code = ctx.fail(&e, ErrorKind::OperationFailed);
                    Flow::Done(code)
                }
            },
        }
    }

    async fn wakeup(&mut self, ctx: &mut SftpCtx, event: WakeupEvent) -> Flow<SftpCtx> {
        let WakeupEvent::FileExists(action) = event else {
            return Flow::Suspended;
        };
        match action {
            FileExistsAction::Overwrite => self.offset = 0,
            FileExistsAction::Resume => self.offset = self.dest_size,
            FileExistsAction::Rename(name) => {
                let parent = RemoteUrl::parent_of(&ctx.resolve_path(&self.remote)).to_string();
                self.remote = RemoteUrl::join(&parent, &name);
                self.offset = 0;
            }
            FileExistsAction::Skip => return Flow::Done(ResultCode::Ok),
        }
        self.state = PutState::Open;
        self.process(ctx).await
    }

    async fn cleanup(&mut self, ctx: &mut SftpCtx) {
        if let Some(item) = self.item.take() {
            ctx.core.shared.limiter().deregister(Channel::Upload, item);
        }
        self.remote_file = None;
        self.local_file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_metadata_maps_to_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("up.bin");
        std::fs::write(&path, b"hello").unwrap();
        let md = std::fs::metadata(&path).unwrap();
        let entry = entry_from_metadata("up.bin", &md);
        assert_eq!(entry.size, 5);
        assert_eq!(entry.kind, EntryKind::File);
        assert!(entry.modified.is_some());
    }
}
