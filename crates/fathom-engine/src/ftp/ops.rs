//! Directory and file operations: cwd, mkdir, remove (recursive), rename,
//! chmod (recursive), raw passthrough, recursive scan, keepalive.
//!
//! Recursive operations never recurse on the call stack: children are
//! chained one frame at a time and the parent resumes between them.

use super::list::ListCmd;
use super::{connect::parse_pwd, FtpCtx};
use crate::command::{Command, Flow, ResultCode};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use fathom_core::{
    DirectoryEntry, DirectoryTree, EntryKind, ErrorKind, RemoteUrl, SessionEvent,
};

// ── Cwd ──────────────────────────────────────────────────────────────

enum CwdState {
    Check,
    Walk,
    Resync,
}

/// Change the remote working directory, optionally creating missing
/// ancestors. Skips the round-trip when the cached resolved path already
/// matches the current directory.
pub struct CwdCmd {
    target: String,
    create_missing: bool,
    state: CwdState,
}

impl CwdCmd {
    pub fn new(target: impl Into<String>, create_missing: bool) -> Self {
        Self {
            target: target.into(),
            create_missing,
            state: CwdState::Check,
        }
    }

    async fn walk(&self, ctx: &mut FtpCtx) -> EngineResult<()> {
        let target = ctx.resolve_path(&self.target);
        let reply = ctx.execute(&format!("CWD {}", target)).await?;
        if reply.is_positive() {
            return Ok(());
        }
        if !self.create_missing {
            return Err(reply.into_error());
        }
        // Walk component by component, creating what is missing.
        ctx.expect_ok("CWD /").await?;
        for comp in target.split('/').filter(|c| !c.is_empty()) {
            let reply = ctx.execute(&format!("CWD {}", comp)).await?;
            if !reply.is_positive() {
                ctx.expect_ok(&format!("MKD {}", comp)).await?;
                ctx.expect_ok(&format!("CWD {}", comp)).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Command<FtpCtx> for CwdCmd {
    fn name(&self) -> &'static str {
        "cwd"
    }

    async fn process(&mut self, ctx: &mut FtpCtx) -> Flow<FtpCtx> {
        match self.state {
            CwdState::Check => {
                let target = ctx.resolve_path(&self.target);
                if ctx.core.current_dir == target {
                    return Flow::Done(ResultCode::Ok);
                }
                let cached = ctx
                    .core
                    .url()
                    .and_then(|u| ctx.core.shared.cache().find_path(u, &target).map(String::from));
                if let Some(resolved) = cached {
                    if resolved == ctx.core.current_dir {
                        return Flow::Done(ResultCode::Ok);
                    }
                }
                self.state = CwdState::Walk;
                Flow::Continue
            }
            CwdState::Walk => match self.walk(ctx).await {
                Ok(()) => {
                    self.state = CwdState::Resync;
                    Flow::Continue
                }
                Err(e) => {
                    let code = ctx.fail(&e, ErrorKind::FileNotFound);
                    Flow::Done(code)
                }
            },
            CwdState::Resync => match ctx.expect("PWD", 2).await {
                Ok(reply) => {
                    let resolved =
                        parse_pwd(reply.text()).unwrap_or_else(|| ctx.resolve_path(&self.target));
                    ctx.core.current_dir = resolved.clone();
                    let target = ctx.resolve_path(&self.target);
                    if let Some(url) = ctx.core.url().cloned() {
                        ctx.core.shared.cache().insert_path(&url, &target, resolved);
                    }
                    Flow::Done(ResultCode::Ok)
                }
                Err(e) => {
                    let code = ctx.fail(&e, ErrorKind::OperationFailed);
                    Flow::Done(code)
                }
            },
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
impl Command<FtpCtx> for MkdirCmd {
    fn name(&self) -> &'static str {
        "mkdir"
    }

    async fn process(&mut self, ctx: &mut FtpCtx) -> Flow<FtpCtx> {
        let path = ctx.resolve_path(&self.path);
        match ctx.expect_ok(&format!("MKD {}", path)).await {
            Ok(_) => {
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

// ── Remove (file or directory, recursive) ────────────────────────────

enum RemoveState {
    TryDele,
    TryRmd,
    Listed,
    Children,
    FinalRmd,
}

pub struct RemoveCmd {
    path: String,
    state: RemoveState,
    children: Vec<DirectoryEntry>,
    /// Whether this frame suppressed error reporting (probe phase).
    suppressed: bool,
}

impl RemoveCmd {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            state: RemoveState::TryDele,
            children: Vec::new(),
            suppressed: false,
        }
    }
}

#[async_trait]
impl Command<FtpCtx> for RemoveCmd {
    fn name(&self) -> &'static str {
        "remove"
    }

    async fn process(&mut self, ctx: &mut FtpCtx) -> Flow<FtpCtx> {
        let path = ctx.resolve_path(&self.path);
        match self.state {
            RemoveState::TryDele => {
                // Probing: a directory will refuse DELE and that is fine.
                self.suppressed = !ctx.core.report_errors;
                ctx.core.report_errors = false;
                match ctx.execute(&format!("DELE {}", path)).await {
                    Ok(reply) if reply.is_positive() => {
                        ctx.core.report_errors = !self.suppressed;
                        invalidate_parent(ctx, &path);
                        Flow::Done(ResultCode::Ok)
                    }
                    Ok(_) => {
                        self.state = RemoveState::TryRmd;
                        Flow::Continue
                    }
                    Err(e) => {
                        ctx.core.report_errors = !self.suppressed;
                        let code = ctx.fail(&e, ErrorKind::OperationFailed);
                        Flow::Done(code)
                    }
                }
            }
            RemoveState::TryRmd => match ctx.execute(&format!("RMD {}", path)).await {
                Ok(reply) if reply.is_positive() => {
                    ctx.core.report_errors = !self.suppressed;
                    invalidate_parent(ctx, &path);
                    Flow::Done(ResultCode::Ok)
                }
                Ok(_) => {
                    // Non-empty directory: list it and remove the children.
                    // Their failures are real errors, so reporting resumes.
                    ctx.core.report_errors = !self.suppressed;
                    self.state = RemoveState::Listed;
                    Flow::Chain(Box::new(ListCmd::quiet(path)))
                }
                Err(e) => {
                    ctx.core.report_errors = !self.suppressed;
                    let code = ctx.fail(&e, ErrorKind::OperationFailed);
                    Flow::Done(code)
                }
            },
            RemoveState::Listed => {
                self.children = ctx
                    .core
                    .last_listing
                    .take()
                    .map(|l| l.into_entries())
                    .unwrap_or_default();
                self.state = RemoveState::Children;
                Flow::Continue
            }
            RemoveState::Children => match self.children.pop() {
                Some(child) => {
                    let child_path = RemoteUrl::join(&path, &child.filename);
                    Flow::Chain(Box::new(RemoveCmd::new(child_path)))
                }
                None => {
                    self.state = RemoveState::FinalRmd;
                    Flow::Continue
                }
            },
            RemoveState::FinalRmd => {
                ctx.core.report_errors = !self.suppressed;
                match ctx.expect_ok(&format!("RMD {}", path)).await {
                    Ok(_) => {
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
    }

    async fn cleanup(&mut self, ctx: &mut FtpCtx) {
        // An unwind mid-probe must not leave reporting off.
        if !self.suppressed {
            ctx.core.report_errors = true;
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
impl Command<FtpCtx> for RenameCmd {
    fn name(&self) -> &'static str {
        "rename"
    }

    async fn process(&mut self, ctx: &mut FtpCtx) -> Flow<FtpCtx> {
        let from = ctx.resolve_path(&self.from);
        let to = ctx.resolve_path(&self.to);
        let run = async {
            ctx.expect(&format!("RNFR {}", from), 3).await?;
            ctx.expect_ok(&format!("RNTO {}", to)).await?;
            EngineResult::Ok(())
        };
        match run.await {
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

// ── Chmod (recursive) ────────────────────────────────────────────────

enum ChmodState {
    Apply,
    Listed,
    Children,
}

pub struct ChmodCmd {
    path: String,
    mode: u32,
    recursive: bool,
    state: ChmodState,
    children: Vec<DirectoryEntry>,
}

impl ChmodCmd {
    pub fn new(path: impl Into<String>, mode: u32, recursive: bool) -> Self {
        Self {
            path: path.into(),
            mode,
            recursive,
            state: ChmodState::Apply,
            children: Vec::new(),
        }
    }
}

#[async_trait]
impl Command<FtpCtx> for ChmodCmd {
    fn name(&self) -> &'static str {
        "chmod"
    }

    async fn process(&mut self, ctx: &mut FtpCtx) -> Flow<FtpCtx> {
        let path = ctx.resolve_path(&self.path);
        match self.state {
            ChmodState::Apply => {
                let cmd = format!("SITE CHMOD {:o} {}", self.mode, path);
                match ctx.expect_ok(&cmd).await {
                    Ok(_) => {
                        invalidate_parent(ctx, &path);
                        if self.recursive {
                            self.state = ChmodState::Listed;
                            Flow::Chain(Box::new(ListCmd::quiet(path)))
                        } else {
                            Flow::Done(ResultCode::Ok)
                        }
                    }
                    Err(e) => {
                        let code = ctx.fail(&e, ErrorKind::PermissionDenied);
                        Flow::Done(code)
                    }
                }
            }
            ChmodState::Listed => {
                self.children = ctx
                    .core
                    .last_listing
                    .take()
                    .map(|l| l.into_entries())
                    .unwrap_or_default();
                self.state = ChmodState::Children;
                Flow::Continue
            }
            ChmodState::Children => match self.children.pop() {
                Some(child) => {
                    let child_path = RemoteUrl::join(&path, &child.filename);
                    // Only directories need a recursive frame; files get a
                    // plain SITE CHMOD.
                    let recurse = child.is_dir() && !child.is_symlink();
                    Flow::Chain(Box::new(ChmodCmd::new(child_path, self.mode, recurse)))
                }
                None => Flow::Done(ResultCode::Ok),
            },
        }
    }
}

// ── Raw passthrough ──────────────────────────────────────────────────

/// Send a verbatim control-channel line (SITE commands and friends); the
/// complete reply is surfaced as a raw-response event.
pub struct RawCmd {
    text: String,
}

impl RawCmd {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

#[async_trait]
impl Command<FtpCtx> for RawCmd {
    fn name(&self) -> &'static str {
        "raw"
    }

    async fn process(&mut self, ctx: &mut FtpCtx) -> Flow<FtpCtx> {
        match ctx.execute(&self.text).await {
            Ok(reply) => {
                ctx.core
                    .emit(SessionEvent::RawResponse(reply.lines.join("\n")));
                Flow::Done(ResultCode::Ok)
            }
            Err(e) => {
                let code = ctx.fail(&e, ErrorKind::OperationFailed);
                Flow::Done(code)
            }
        }
    }
}

// ── Keepalive ────────────────────────────────────────────────────────

/// Idle-time NOOP probe; only ever started on an otherwise idle session.
pub struct NoopCmd;

#[async_trait]
impl Command<FtpCtx> for NoopCmd {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn process(&mut self, ctx: &mut FtpCtx) -> Flow<FtpCtx> {
        match ctx.execute("NOOP").await {
            Ok(_) => Flow::Done(ResultCode::Ok),
            Err(e) => {
                log::debug!("keepalive failed: {}", e);
                ctx.drop_connection();
                ctx.core.emit(SessionEvent::Disconnected);
                Flow::Done(ResultCode::FailedSilently)
            }
        }
    }
}

// ── Recursive scan ───────────────────────────────────────────────────

enum ScanState {
    Start,
    Listed,
    Descend,
}

/// Depth-first recursive listing producing a [`DirectoryTree`].
pub struct ScanCmd {
    root: String,
    state: ScanState,
    /// Node under construction per open directory, with its not-yet
    /// visited subdirectories.
    stack: Vec<(DirectoryTree, Vec<(String, DirectoryEntry)>)>,
    /// Path whose listing the pending ListCmd will produce.
    pending: Option<(String, DirectoryEntry)>,
}

impl ScanCmd {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            state: ScanState::Start,
            stack: Vec::new(),
            pending: None,
        }
    }

    /// Fold completed nodes into their parents; `Some` when the whole
    /// scan finished.
    fn pop_completed(&mut self, ctx: &mut FtpCtx) -> Option<Flow<FtpCtx>> {
        loop {
            match self.stack.last() {
                Some((_, pending)) if pending.is_empty() => {
                    let (node, _) = self.stack.pop()?;
                    match self.stack.last_mut() {
                        Some((parent, _)) => parent.add_subdir(node),
                        None => {
                            ctx.core.emit(SessionEvent::ScanComplete(Box::new(node)));
                            return Some(Flow::Done(ResultCode::Ok));
                        }
                    }
                }
                _ => return None,
            }
        }
    }
}

#[async_trait]
impl Command<FtpCtx> for ScanCmd {
    fn name(&self) -> &'static str {
        "scan"
    }

    async fn process(&mut self, ctx: &mut FtpCtx) -> Flow<FtpCtx> {
        match self.state {
            ScanState::Start => {
                let path = ctx.resolve_path(&self.root);
                let entry = DirectoryEntry {
                    filename: path.clone(),
                    kind: EntryKind::Dir,
                    ..Default::default()
                };
                self.pending = Some((path.clone(), entry));
                self.state = ScanState::Listed;
                Flow::Chain(Box::new(ListCmd::quiet(path)))
            }
            ScanState::Listed => {
                let (path, entry) = match self.pending.take() {
                    Some(p) => p,
                    None => return Flow::Done(ResultCode::Failed),
                };
                let listing = ctx.core.last_listing.take();
                let mut node = DirectoryTree::new(entry);
                let mut subdirs = Vec::new();
                for child in listing.map(|l| l.into_entries()).unwrap_or_default() {
                    if child.is_dir() && !child.is_symlink() {
                        let child_path = RemoteUrl::join(&path, &child.filename);
                        subdirs.push((child_path, child));
                    } else {
                        node.add_file(child);
                    }
                }
                self.stack.push((node, subdirs));
                self.state = ScanState::Descend;
                Flow::Continue
            }
            ScanState::Descend => {
                if let Some(flow) = self.pop_completed(ctx) {
                    return flow;
                }
                let next = self
                    .stack
                    .last_mut()
                    .and_then(|(_, pending)| pending.pop());
                match next {
                    Some((path, entry)) => {
                        self.pending = Some((path.clone(), entry));
                        self.state = ScanState::Listed;
                        Flow::Chain(Box::new(ListCmd::quiet(path)))
                    }
                    None => Flow::Done(ResultCode::Ok),
                }
            }
        }
    }
}

// ── Shared helpers ───────────────────────────────────────────────────

pub(crate) fn invalidate_parent(ctx: &FtpCtx, path: &str) {
    if let Some(url) = ctx.core.url() {
        ctx.core.shared.cache().invalidate_parent(url, path);
        // The entry itself may also be cached (a removed directory).
        ctx.core.shared.cache().invalidate(url, path);
    }
}
