//! File transfers: RETR (get) and STOR (put).
//!
//! Both stat the colliding side first and suspend on a file-exists
//! decision (overwrite / resume / rename / skip). Data is pumped in
//! bounded slices, one slice per `process` step, so an abort request is
//! serviced between slices; each slice is metered through the shared
//! speed limiter. Completion requires both the data-channel EOF and the
//! control-channel completion reply.

use super::data::DataChannelCmd;
use super::ops::invalidate_parent;
use super::{DataRequest, FtpCtx};
use crate::command::{Command, Flow, ResultCode};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fathom_core::limiter::{Channel, ItemId};
use fathom_core::settings::keys;
use fathom_core::{
    DirectoryEntry, EntryKind, ErrorKind, FileExistsAction, RemoteUrl, SessionEvent, WakeupEvent,
};
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Transfer slice ceiling per step; the limiter may grant less.
const SLICE: usize = 64 * 1024;
/// Back-off when the limiter has no tokens for us this tick.
const THROTTLE_WAIT: std::time::Duration = std::time::Duration::from_millis(25);

/// Parse a 213 MDTM reply body: `YYYYMMDDHHMMSS`.
fn parse_mdtm(text: &str) -> Option<DateTime<Utc>> {
    let t = text.trim();
    if t.len() < 14 {
        return None;
    }
    let (y, mo, d, h, mi, s) = (
        t[0..4].parse().ok()?,
        t[4..6].parse().ok()?,
        t[6..8].parse().ok()?,
        t[8..10].parse().ok()?,
        t[10..12].parse().ok()?,
        t[12..14].parse().ok()?,
    );
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).single()
}

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

/// Stat a remote file over the control channel (SIZE + optional MDTM).
pub(super) async fn stat_remote(
    ctx: &mut FtpCtx,
    path: &str,
) -> EngineResult<Option<DirectoryEntry>> {
    // SIZE is defined for binary mode.
    let _ = ctx.execute("TYPE I").await;
    let size_reply = ctx.execute(&format!("SIZE {}", path)).await?;
    if size_reply.code != 213 {
        return Ok(None);
    }
    let size: u64 = size_reply.text().trim().parse().unwrap_or(0);

    let mut modified = None;
    if ctx.core.settings.get_bool(keys::FEAT_MDTM, false) {
        let mdtm = ctx.execute(&format!("MDTM {}", path)).await?;
        if mdtm.code == 213 {
            modified = parse_mdtm(mdtm.text());
        }
    }

    let name = path.rsplit('/').next().unwrap_or(path);
    Ok(Some(DirectoryEntry {
        filename: name.to_string(),
        size,
        kind: EntryKind::File,
        modified,
        ..Default::default()
    }))
}

// ── Get (download) ───────────────────────────────────────────────────

enum GetState {
    Stat,
    AwaitDecision,
    Open,
    Negotiated,
    Pump,
    Complete,
}

pub struct GetCmd {
    remote: String,
    local: PathBuf,
    state: GetState,
    offset: u64,
    source: Option<DirectoryEntry>,
    file: Option<File>,
    stream: Option<super::stream::SecurableStream>,
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
            source: None,
            file: None,
            stream: None,
            item: None,
            bytes: 0,
        }
    }

    async fn open_local(&mut self, ctx: &mut FtpCtx) -> EngineResult<()> {
        let file = if self.offset > 0 {
            OpenOptions::new()
                .append(true)
                .open(&self.local)
                .await
                .map_err(EngineError::Io)?
        } else {
            File::create(&self.local).await.map_err(EngineError::Io)?
        };
        self.file = Some(file);
        let remote = ctx.resolve_path(&self.remote);
        ctx.data_request = Some(DataRequest {
            command: format!("RETR {}", remote),
            rest: self.offset,
            binary: true,
            error_kind: ErrorKind::OperationFailed,
        });
        Ok(())
    }

    async fn pump_slice(&mut self, ctx: &mut FtpCtx) -> EngineResult<bool> {
        let granted = ctx.core.shared.grant(Channel::Download, self.item, SLICE);
        if granted == 0 {
            tokio::time::sleep(THROTTLE_WAIT).await;
            return Ok(false);
        }

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| EngineError::local("data stream missing"))?;
        let mut buf = vec![0u8; granted];
        let n = tokio::time::timeout(ctx.data_timeout(), stream.read(&mut buf))
            .await
            .map_err(|_| EngineError::Timeout)??;
        if n == 0 {
            return Ok(true);
        }
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| EngineError::local("local file missing"))?;
        file.write_all(&buf[..n]).await.map_err(EngineError::Io)?;
        self.bytes += n as u64;
        ctx.core.bytes_transferred += n as u64;
        Ok(false)
    }

    async fn complete(&mut self, ctx: &mut FtpCtx) -> EngineResult<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await.map_err(EngineError::Io)?;
        }
        self.stream = None;

        // Second half of the rendezvous: the control-channel completion.
        let done = ctx.read_reply().await?;
        if !done.is_positive() {
            return Err(done.into_error());
        }

        // Restore the source's modification time locally.
        if let Some(modified) = self.source.as_ref().and_then(|e| e.modified) {
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
impl Command<FtpCtx> for GetCmd {
    fn name(&self) -> &'static str {
        "get"
    }

    async fn process(&mut self, ctx: &mut FtpCtx) -> Flow<FtpCtx> {
        match self.state {
            GetState::Stat => {
                let remote = ctx.resolve_path(&self.remote);
                self.source = match stat_remote(ctx, &remote).await {
                    Ok(entry) => entry,
                    Err(e) => {
                        let code = ctx.fail(&e, ErrorKind::OperationFailed);
                        return Flow::Done(code);
                    }
                };
                ctx.core.last_stat = self.source.clone();

                match tokio::fs::metadata(&self.local).await {
                    Ok(md) => {
                        let name = self.local.file_name().map(|n| n.to_string_lossy());
                        let dest = entry_from_metadata(name.as_deref().unwrap_or(""), &md);
                        ctx.core.emit(SessionEvent::FileExists {
                            source: self.source.clone(),
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
            GetState::Open => match self.open_local(ctx).await {
                Ok(()) => {
                    self.state = GetState::Negotiated;
                    Flow::Chain(Box::new(DataChannelCmd::new()))
                }
                Err(e) => {
                    let code = ctx.fail(&e, ErrorKind::FileOpenFailed);
                    Flow::Done(code)
                }
            },
            GetState::Negotiated => {
                ctx.data_request = None;
                self.stream = ctx.data_result.take();
                if self.stream.is_none() {
                    return Flow::Done(ResultCode::Failed);
                }
                // The server may have refused REST; restart from zero.
                if self.offset > 0 && ctx.applied_rest == 0 {
                    log::debug!("resume refused, restarting from 0");
                    self.offset = 0;
                    match File::create(&self.local).await {
                        Ok(f) => self.file = Some(f),
                        Err(e) => {
                            let code =
                                ctx.fail(&EngineError::Io(e), ErrorKind::FileOpenFailed);
                            return Flow::Done(code);
                        }
                    }
                }
                if ctx.applied_rest > 0 {
                    ctx.core.emit(SessionEvent::ResumeOffset(ctx.applied_rest));
                }
                if !ctx.core.shared.limiter().is_unlimited(Channel::Download) {
                    self.item = Some(ctx.core.shared.limiter().register(Channel::Download));
                }
                self.state = GetState::Pump;
                Flow::Continue
            }
            GetState::Pump => match self.pump_slice(ctx).await {
                Ok(true) => {
                    self.state = GetState::Complete;
                    Flow::Continue
                }
                Ok(false) => Flow::Continue,
                Err(e) => {
                    let code = ctx.fail_transport(&e, ErrorKind::OperationFailed);
                    Flow::Done(code)
                }
            },
            GetState::Complete => match self.complete(ctx).await {
                Ok(()) => Flow::Done(ResultCode::Ok),
                Err(e) => {
                    let code = ctx.fail_transport(&e, ErrorKind::OperationFailed);
                    Flow::Done(code)
                }
            },
        }
    }

    async fn wakeup(&mut self, ctx: &mut FtpCtx, event: WakeupEvent) -> Flow<FtpCtx> {
        let WakeupEvent::FileExists(action) = event else {
            return Flow::Suspended;
        };
        match action {
            FileExistsAction::Overwrite => {
                self.offset = 0;
            }
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

    async fn cleanup(&mut self, ctx: &mut FtpCtx) {
        if let Some(item) = self.item.take() {
            ctx.core.shared.limiter().deregister(Channel::Download, item);
        }
        self.stream = None;
        self.file = None;
    }
}

// ── Put (upload) ─────────────────────────────────────────────────────

enum PutState {
    Stat,
    AwaitDecision,
    Open,
    Negotiated,
    Pump,
    Complete,
}

pub struct PutCmd {
    local: PathBuf,
    remote: String,
    state: PutState,
    offset: u64,
    /// Remote size observed at stat time; the Resume decision appends
    /// from here.
    dest_size: u64,
    file: Option<File>,
    stream: Option<super::stream::SecurableStream>,
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
            file: None,
            stream: None,
            item: None,
            bytes: 0,
        }
    }

    async fn open_local(&mut self, ctx: &mut FtpCtx) -> EngineResult<()> {
        let mut file = File::open(&self.local).await.map_err(EngineError::Io)?;
        if self.offset > 0 {
            file.seek(std::io::SeekFrom::Start(self.offset))
                .await
                .map_err(EngineError::Io)?;
        }
        self.file = Some(file);
        let remote = ctx.resolve_path(&self.remote);
        ctx.data_request = Some(DataRequest {
            command: format!("STOR {}", remote),
            rest: self.offset,
            binary: true,
            error_kind: ErrorKind::OperationFailed,
        });
        Ok(())
    }

    async fn pump_slice(&mut self, ctx: &mut FtpCtx) -> EngineResult<bool> {
        let granted = ctx.core.shared.grant(Channel::Upload, self.item, SLICE);
        if granted == 0 {
            tokio::time::sleep(THROTTLE_WAIT).await;
            return Ok(false);
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| EngineError::local("local file missing"))?;
        let mut buf = vec![0u8; granted];
        let n = file.read(&mut buf).await.map_err(EngineError::Io)?;
        if n == 0 {
            // Local EOF: close our half so the server sees end-of-stream.
            if let Some(mut stream) = self.stream.take() {
                let _ = stream.shutdown().await;
            }
            return Ok(true);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| EngineError::local("data stream missing"))?;
        tokio::time::timeout(ctx.data_timeout(), stream.write_all(&buf[..n]))
            .await
            .map_err(|_| EngineError::Timeout)?
            .map_err(EngineError::Io)?;
        self.bytes += n as u64;
        ctx.core.bytes_transferred += n as u64;
        Ok(false)
    }

    async fn complete(&mut self, ctx: &mut FtpCtx) -> EngineResult<()> {
        self.file = None;
        let done = ctx.read_reply().await?;
        if !done.is_positive() {
            return Err(done.into_error());
        }

        // Patch the cached parent listing in place when we can; otherwise
        // drop it so the next listing refetches.
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
impl Command<FtpCtx> for PutCmd {
    fn name(&self) -> &'static str {
        "put"
    }

    async fn process(&mut self, ctx: &mut FtpCtx) -> Flow<FtpCtx> {
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
                let existing = match stat_remote(ctx, &remote).await {
                    Ok(entry) => entry,
                    Err(e) => {
                        let code = ctx.fail(&e, ErrorKind::OperationFailed);
                        return Flow::Done(code);
                    }
                };
                if let Some(dest) = existing {
                    self.dest_size = dest.size;
                    let name = self.local.file_name().map(|n| n.to_string_lossy());
                    let src = entry_from_metadata(name.as_deref().unwrap_or(""), &md);
                    ctx.core.emit(SessionEvent::FileExists {
                        source: Some(src),
                        destination: Some(dest),
                    });
                    self.state = PutState::AwaitDecision;
                    return Flow::Suspended;
                }
                self.state = PutState::Open;
                Flow::Continue
            }
            PutState::AwaitDecision => Flow::Suspended,
            PutState::Open => match self.open_local(ctx).await {
                Ok(()) => {
                    self.state = PutState::Negotiated;
                    Flow::Chain(Box::new(DataChannelCmd::new()))
                }
                Err(e) => {
                    let code = ctx.fail(&e, ErrorKind::FileOpenFailed);
                    Flow::Done(code)
                }
            },
            PutState::Negotiated => {
                ctx.data_request = None;
                self.stream = ctx.data_result.take();
                if self.stream.is_none() {
                    return Flow::Done(ResultCode::Failed);
                }
                if self.offset > 0 && ctx.applied_rest == 0 {
                    log::debug!("resume refused, restarting upload from 0");
                    self.offset = 0;
                    if let Some(file) = self.file.as_mut() {
                        if let Err(e) = file.seek(std::io::SeekFrom::Start(0)).await {
                            let code =
                                ctx.fail(&EngineError::Io(e), ErrorKind::FileOpenFailed);
                            return Flow::Done(code);
                        }
                    }
                }
                if ctx.applied_rest > 0 {
                    ctx.core.emit(SessionEvent::ResumeOffset(ctx.applied_rest));
                }
                if !ctx.core.shared.limiter().is_unlimited(Channel::Upload) {
                    self.item = Some(ctx.core.shared.limiter().register(Channel::Upload));
                }
                self.state = PutState::Pump;
                Flow::Continue
            }
            PutState::Pump => match self.pump_slice(ctx).await {
                Ok(true) => {
                    self.state = PutState::Complete;
                    Flow::Continue
                }
                Ok(false) => Flow::Continue,
                Err(e) => {
                    let code = ctx.fail_transport(&e, ErrorKind::OperationFailed);
                    Flow::Done(code)
                }
            },
            PutState::Complete => match self.complete(ctx).await {
                Ok(()) => Flow::Done(ResultCode::Ok),
                Err(e) => {
                    let code = ctx.fail_transport(&e, ErrorKind::OperationFailed);
                    Flow::Done(code)
                }
            },
        }
    }

    async fn wakeup(&mut self, ctx: &mut FtpCtx, event: WakeupEvent) -> Flow<FtpCtx> {
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

    async fn cleanup(&mut self, ctx: &mut FtpCtx) {
        if let Some(item) = self.item.take() {
            ctx.core.shared.limiter().deregister(Channel::Upload, item);
        }
        self.stream = None;
        self.file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Datelike;

    #[test]
    fn mdtm_parses() {
        let t = parse_mdtm("20230105123400").unwrap();
        assert_eq!((t.year(), t.month(), t.day()), (2023, 1, 5));
        assert!(parse_mdtm("not a date").is_none());
    }
}
