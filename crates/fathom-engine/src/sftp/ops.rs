//! Directory operations over SFTP — list, mkdir, remove, rename, chmod,
//! recursive scan and the keepalive probe.
//!
//! Recursive commands carry an explicit work stack and process a bounded
//! batch per step, so deep trees neither recurse nor monopolize the
//! connection task.

use super::{entry_from_stat, SftpCtx};
use crate::command::{Command, Flow, ResultCode};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use fathom_core::{
    DirectoryEntry, DirectoryListing, DirectoryTree, ErrorKind, RemoteUrl, SessionEvent,
};
use std::path::Path;

/// Work items handled per `process` step by the recursive commands.
const BATCH: usize = 32;

fn perm_stat(mode: u32) -> ssh2::FileStat {
    ssh2::FileStat {
        size: None,
        uid: None,
        gid: None,
        perm: Some(mode),
        atime: None,
        mtime: None,
    }
}

pub(super) fn invalidate_parent(ctx: &SftpCtx, path: &str) {
    if let Some(url) = ctx.core.url() {
        let mut cache = ctx.core.shared.cache();
        cache.invalidate_parent(url, path);
        cache.invalidate(url, path);
    }
}

/// Read one remote directory into entries. Symlinks are resolved one hop:
/// the link target fills `link_target` and a directory target flips the
/// kind, matching how the listing parser treats `ls -l` output.
pub(super) fn read_dir(ctx: &SftpCtx, dir: &str) -> EngineResult<Vec<DirectoryEntry>> {
    let sftp = ctx.sftp()?;
    let mut out = Vec::new();
    for (path, stat) in sftp.readdir(Path::new(dir))? {
        let name = match path.file_name() {
            Some(n) => n.to_string_lossy().into_owned(),
            None => continue,
        };
        let mut entry = entry_from_stat(&name, &stat);
        if stat.file_type().is_symlink() {
            if let Ok(target) = sftp.readlink(&path) {
                entry.link_target = target.to_string_lossy().into_owned();
            }
            // stat() follows the link; a dangling link stays a file.
            if let Ok(resolved) = sftp.stat(&path) {
                if resolved.is_dir() {
                    entry.kind = fathom_core::EntryKind::Dir;
                }
            }
        }
        out.push(entry);
    }
    Ok(out)
}

// ── List ─────────────────────────────────────────────────────────────

pub struct ListCmd {
    path: String,
    emit: bool,
    use_cache: bool,
}

impl ListCmd {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            emit: true,
            use_cache: true,
        }
    }

    pub fn quiet(path: impl Into<String>) -> Self {
        let mut cmd = Self::new(path);
        cmd.emit = false;
        cmd
    }

    pub fn fresh(path: impl Into<String>) -> Self {
        let mut cmd = Self::new(path);
        cmd.use_cache = false;
        cmd
    }

    fn fetch(&self, ctx: &mut SftpCtx) -> EngineResult<DirectoryListing> {
        let dir = ctx.resolve_path(&self.path);
        let key = ctx
            .core
            .url()
            .map(|u| u.cache_key(&dir))
            .unwrap_or_else(|| dir.clone());
        let mut listing = DirectoryListing::new(key);
        for entry in read_dir(ctx, &dir)? {
            listing.add_entry(entry);
        }
        Ok(listing)
    }
}

#[async_trait]
impl Command<SftpCtx> for ListCmd {
    fn name(&self) -> &'static str {
        "sftp-list"
    }

    async fn process(&mut self, ctx: &mut SftpCtx) -> Flow<SftpCtx> {
        let dir = ctx.resolve_path(&self.path);
        if self.use_cache {
            let cached = ctx
                .core
                .url()
                .and_then(|u| ctx.core.shared.cache().find_listing(u, &dir).cloned());
            if let Some(listing) = cached {
                log::debug!("listing served from cache: {}", dir);
                if self.emit {
                    ctx.core
                        .emit(SessionEvent::DirectoryListing(listing.clone()));
                }
                ctx.core.last_listing = Some(listing);
                return Flow::Done(ResultCode::Ok);
            }
        }
        match self.fetch(ctx) {
            Ok(listing) => {
                if let Some(url) = ctx.core.url().cloned() {
                    ctx.core
                        .shared
                        .cache()
                        .insert_listing(&url, &dir, listing.clone());
                }
                ctx.core.current_dir = dir;
                if self.emit {
                    ctx.core
                        .emit(SessionEvent::DirectoryListing(listing.clone()));
                }
                ctx.core.last_listing = Some(listing);
                Flow::Done(ResultCode::Ok)
            }
            Err(e) => {
                let code = ctx.fail(&e, ErrorKind::ListFailed);
                Flow::Done(code)
            }
        }
    }
}

// ── Mkdir ────────────────────────────────────────────────────────────

pub struct MkdirCmd {
    path: String,
}

impl MkdirCmd {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Command<SftpCtx> for MkdirCmd {
    fn name(&self) -> &'static str {
        "sftp-mkdir"
    }

    async fn process(&mut self, ctx: &mut SftpCtx) -> Flow<SftpCtx> {
        let path = ctx.resolve_path(&self.path);
        let result = ctx
            .sftp()
            .and_then(|sftp| sftp.mkdir(Path::new(&path), 0o755).map_err(EngineError::Ssh));
        match result {
            Ok(()) => {
                invalidate_parent(ctx, &path);
                Flow::Done(ResultCode::Ok)
            }
            Err(e) => {
                let code = ctx.fail(&e, ErrorKind::OperationFailed);
                Flow::Done(code)
            }
        }
    }
}

// ── Remove ───────────────────────────────────────────────────────────

enum RemoveWork {
    /// Expand a directory: unlink its files, queue its subdirectories.
    Scan(String),
    /// Remove a by-now-empty directory.
    Rmdir(String),
}

pub struct RemoveCmd {
    path: String,
    started: bool,
    stack: Vec<RemoveWork>,
}

impl RemoveCmd {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            started: false,
            stack: Vec::new(),
        }
    }

    fn begin(&mut self, ctx: &SftpCtx) -> EngineResult<()> {
        let path = ctx.resolve_path(&self.path);
        let sftp = ctx.sftp()?;
        let stat = sftp.lstat(Path::new(&path))?;
        if stat.is_dir() && !stat.file_type().is_symlink() {
            // LIFO: Scan runs before the Rmdir beneath it, so children are
            // gone by the time the directory itself is removed.
            self.stack.push(RemoveWork::Rmdir(path.clone()));
            self.stack.push(RemoveWork::Scan(path));
        } else {
            sftp.unlink(Path::new(&path))?;
        }
        Ok(())
    }

    fn work(&mut self, ctx: &SftpCtx) -> EngineResult<()> {
        let sftp = ctx.sftp()?;
        for _ in 0..BATCH {
            match self.stack.pop() {
                Some(RemoveWork::Scan(dir)) => {
                    for (path, stat) in sftp.readdir(Path::new(&dir))? {
                        if stat.is_dir() && !stat.file_type().is_symlink() {
                            let sub = path.to_string_lossy().into_owned();
                            self.stack.push(RemoveWork::Rmdir(sub.clone()));
                            self.stack.push(RemoveWork::Scan(sub));
                        } else {
                            sftp.unlink(&path)?;
                        }
                    }
                }
                Some(RemoveWork::Rmdir(dir)) => sftp.rmdir(Path::new(&dir))?,
                None => break,
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Command<SftpCtx> for RemoveCmd {
    fn name(&self) -> &'static str {
        "sftp-remove"
    }

    async fn process(&mut self, ctx: &mut SftpCtx) -> Flow<SftpCtx> {
        let result = if self.started {
            self.work(ctx)
        } else {
            self.started = true;
            self.begin(ctx)
        };
        if let Err(e) = result {
            let code = ctx.fail(&e, ErrorKind::OperationFailed);
            return Flow::Done(code);
        }
        if self.stack.is_empty() {
            let path = ctx.resolve_path(&self.path);
            invalidate_parent(ctx, &path);
            Flow::Done(ResultCode::Ok)
        } else {
            Flow::Continue
        }
    }
}

// ── Rename ───────────────────────────────────────────────────────────

pub struct RenameCmd {
    from: String,
    to: String,
}

impl RenameCmd {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

#[async_trait]
impl Command<SftpCtx> for RenameCmd {
    fn name(&self) -> &'static str {
        "sftp-rename"
    }

    async fn process(&mut self, ctx: &mut SftpCtx) -> Flow<SftpCtx> {
        let from = ctx.resolve_path(&self.from);
        let to = ctx.resolve_path(&self.to);
        let result = ctx.sftp().and_then(|sftp| {
            sftp.rename(Path::new(&from), Path::new(&to), None)
                .map_err(EngineError::Ssh)
        });
        match result {
            Ok(()) => {
                invalidate_parent(ctx, &from);
                invalidate_parent(ctx, &to);
                Flow::Done(ResultCode::Ok)
            }
            Err(e) => {
                let code = ctx.fail(&e, ErrorKind::OperationFailed);
                Flow::Done(code)
            }
        }
    }
}

// ── Chmod ────────────────────────────────────────────────────────────

pub struct ChmodCmd {
    path: String,
    mode: u32,
    recursive: bool,
    started: bool,
    /// Directories whose children still need the mode applied.
    dirs: Vec<String>,
}

impl ChmodCmd {
    pub fn new(path: impl Into<String>, mode: u32, recursive: bool) -> Self {
        Self {
            path: path.into(),
            mode,
            recursive,
            started: false,
            dirs: Vec::new(),
        }
    }

    fn begin(&mut self, ctx: &SftpCtx) -> EngineResult<()> {
        let path = ctx.resolve_path(&self.path);
        let sftp = ctx.sftp()?;
        let stat = sftp.lstat(Path::new(&path))?;
        sftp.setstat(Path::new(&path), perm_stat(self.mode))?;
        if self.recursive && stat.is_dir() && !stat.file_type().is_symlink() {
            self.dirs.push(path);
        }
        Ok(())
    }

    fn work(&mut self, ctx: &SftpCtx) -> EngineResult<()> {
        let sftp = ctx.sftp()?;
        for _ in 0..BATCH {
            let Some(dir) = self.dirs.pop() else { break };
            for (path, stat) in sftp.readdir(Path::new(&dir))? {
                if stat.file_type().is_symlink() {
                    continue;
                }
                sftp.setstat(&path, perm_stat(self.mode))?;
                if stat.is_dir() {
                    self.dirs.push(path.to_string_lossy().into_owned());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Command<SftpCtx> for ChmodCmd {
    fn name(&self) -> &'static str {
        "sftp-chmod"
    }

    async fn process(&mut self, ctx: &mut SftpCtx) -> Flow<SftpCtx> {
        let result = if self.started {
            self.work(ctx)
        } else {
            self.started = true;
            self.begin(ctx)
        };
        if let Err(e) = result {
            let code = ctx.fail(&e, ErrorKind::PermissionDenied);
            return Flow::Done(code);
        }
        if self.dirs.is_empty() {
            let path = ctx.resolve_path(&self.path);
            invalidate_parent(ctx, &path);
            Flow::Done(ResultCode::Ok)
        } else {
            Flow::Continue
        }
    }
}

// ── Scan ─────────────────────────────────────────────────────────────

struct ScanNode {
    tree: DirectoryTree,
    path: String,
    listed: bool,
    pending: Vec<(String, DirectoryEntry)>,
}

/// Recursive listing into a [`DirectoryTree`]. One directory is read per
/// step; completed nodes fold into their parent as the stack unwinds.
pub struct ScanCmd {
    root: String,
    started: bool,
    stack: Vec<ScanNode>,
}

impl ScanCmd {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            started: false,
            stack: Vec::new(),
        }
    }

    fn begin(&mut self, ctx: &SftpCtx) -> EngineResult<()> {
        let path = ctx.resolve_path(&self.root);
        let sftp = ctx.sftp()?;
        let stat = sftp.stat(Path::new(&path))?;
        let name = path.rsplit('/').next().unwrap_or(&path);
        self.stack.push(ScanNode {
            tree: DirectoryTree::new(entry_from_stat(name, &stat)),
            path,
            listed: false,
            pending: Vec::new(),
        });
        Ok(())
    }

    fn step_node(&mut self, ctx: &SftpCtx) -> EngineResult<Option<DirectoryTree>> {
        let Some(node) = self.stack.last_mut() else {
            return Err(EngineError::local("scan stack underflow"));
        };
        if !node.listed {
            node.listed = true;
            let dir = node.path.clone();
            for entry in read_dir(ctx, &dir)? {
                if entry.is_dir() && !entry.is_symlink() {
                    let sub = RemoteUrl::join(&dir, &entry.filename);
                    node.pending.push((sub, entry));
                } else {
                    node.tree.add_file(entry);
                }
            }
            return Ok(None);
        }
        if let Some((path, entry)) = node.pending.pop() {
            self.stack.push(ScanNode {
                tree: DirectoryTree::new(entry),
                path,
                listed: false,
                pending: Vec::new(),
            });
            return Ok(None);
        }
        // Node complete: fold into the parent, or yield the root.
        let done = match self.stack.pop() {
            Some(node) => node,
            None => return Err(EngineError::local("scan stack underflow")),
        };
        match self.stack.last_mut() {
            Some(parent) => {
                parent.tree.add_subdir(done.tree);
                Ok(None)
            }
            None => Ok(Some(done.tree)),
        }
    }
}

#[async_trait]
impl Command<SftpCtx> for ScanCmd {
    fn name(&self) -> &'static str {
        "sftp-scan"
    }

    async fn process(&mut self, ctx: &mut SftpCtx) -> Flow<SftpCtx> {
        let result = if self.started {
            self.step_node(ctx)
        } else {
            self.started = true;
            self.begin(ctx).map(|()| None)
        };
        match result {
            Ok(Some(tree)) => {
                ctx.core.emit(SessionEvent::ScanComplete(Box::new(tree)));
                Flow::Done(ResultCode::Ok)
            }
            Ok(None) => Flow::Continue,
            Err(e) => {
                let code = ctx.fail(&e, ErrorKind::ListFailed);
                Flow::Done(code)
            }
        }
    }
}

// ── Keepalive ────────────────────────────────────────────────────────

/// Idle probe: a cheap stat of the current directory. Failure means the
/// transport is gone; the session disconnects without surfacing an error.
pub struct NoopCmd;

#[async_trait]
impl Command<SftpCtx> for NoopCmd {
    fn name(&self) -> &'static str {
        "sftp-noop"
    }

    async fn process(&mut self, ctx: &mut SftpCtx) -> Flow<SftpCtx> {
        let dir = ctx.core.current_dir.clone();
        let alive = ctx
            .sftp()
            .and_then(|sftp| sftp.stat(Path::new(&dir)).map_err(EngineError::Ssh))
            .is_ok();
        if alive {
            Flow::Done(ResultCode::Ok)
        } else {
            log::debug!("keepalive probe failed, dropping connection");
            ctx.drop_connection();
            ctx.core.emit(SessionEvent::Disconnected);
            Flow::Done(ResultCode::FailedSilently)
        }
    }
}
