//! Server-to-server (FXP) transfers.
//!
//! Two sessions cooperate: the source runs `FxpSourceCmd`, which drives the
//! whole exchange, and the destination runs `FxpServeCmd`, which executes
//! control-channel requests on the source's behalf. The pair talks over an
//! in-process channel; each request carries a oneshot for its reply.
//!
//! Wire order: CWD both sides, destination existence check, TYPE I both,
//! TLS mode (SSCN when both ends support it, CPSV as fallback, otherwise
//! PROT C on both), PASV on the source, PORT on the destination with the
//! source's reported address, REST both, RETR on the source and only then
//! STOR on the destination, completion replies on both. A RETR refusal
//! therefore never triggers a half-open STOR.

use super::data::{is_private, parse_pasv};
use super::ops::invalidate_parent;
use super::transfer::stat_remote;
use super::FtpCtx;
use crate::command::{Command, Flow, ResultCode};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use fathom_core::settings::keys;
use fathom_core::{
    DirectoryEntry, ErrorKind, FileExistsAction, RemoteUrl, SessionEvent, WakeupEvent,
};
use std::net::{IpAddr, SocketAddr};
use tokio::sync::{mpsc, oneshot};

/// How long the serve side blocks on its request channel per step. Short,
/// so aborts queued on the destination thread stay responsive.
const SERVE_POLL: std::time::Duration = std::time::Duration::from_millis(250);

/// A control-channel action requested from the destination session.
#[derive(Debug)]
pub enum FxpOp {
    /// Capabilities of the destination end.
    Query,
    Cwd(String),
    /// SIZE/MDTM stat of a destination file.
    Stat(String),
    TypeBinary,
    Sscn(bool),
    ProtClear,
    /// PORT to the source server's advertised data endpoint.
    Port(SocketAddr),
    Rest(u64),
    Stor(String),
    /// Read the transfer-completion reply.
    WaitComplete,
    /// Tear the serve command down.
    Finish,
}

#[derive(Debug)]
pub enum FxpReply {
    Ok,
    Failed(String),
    Caps { secured: bool, sscn: bool },
    Stat(Option<DirectoryEntry>),
}

pub struct FxpRequest {
    op: FxpOp,
    reply: oneshot::Sender<FxpReply>,
}

/// Build a connected source/serve command pair.
///
/// `source` is the full path on the source server, `dest` the full path on
/// the destination server. Start the serve command on the destination
/// session first, then the source command on the source session.
pub fn fxp_pair(source: impl Into<String>, dest: impl Into<String>) -> (FxpSourceCmd, FxpServeCmd) {
    let (tx, rx) = mpsc::unbounded_channel();
    let dest = dest.into();
    let dest_dir = RemoteUrl::parent_of(&dest).to_string();
    let dest_name = dest.rsplit('/').next().unwrap_or(&dest).to_string();
    (
        FxpSourceCmd {
            ops: tx,
            source: source.into(),
            dest_dir,
            dest_name,
            state: SourceState::Setup,
            offset: 0,
            size: 0,
            caps: None,
        },
        FxpServeCmd {
            rx,
            dest,
            invalidated: false,
        },
    )
}

// ── Destination side ─────────────────────────────────────────────────

pub struct FxpServeCmd {
    rx: mpsc::UnboundedReceiver<FxpRequest>,
    /// Full destination path; its parent's cached listing is stale once
    /// the exchange starts, success or not.
    dest: String,
    invalidated: bool,
}

impl FxpServeCmd {
    fn invalidate_once(&mut self, ctx: &mut FtpCtx) {
        if !self.invalidated {
            let dest = self.dest.clone();
            invalidate_parent(ctx, &dest);
            self.invalidated = true;
        }
    }

    async fn handle(&mut self, ctx: &mut FtpCtx, op: FxpOp) -> EngineResult<FxpReply> {
        match op {
            FxpOp::Query => Ok(FxpReply::Caps {
                secured: ctx.secured,
                sscn: ctx.core.settings.get_bool(keys::FEAT_SSCN, false),
            }),
            FxpOp::Cwd(dir) => {
                ctx.expect_ok(&format!("CWD {}", dir)).await?;
                ctx.core.current_dir = dir;
                Ok(FxpReply::Ok)
            }
            FxpOp::Stat(path) => {
                let path = ctx.resolve_path(&path);
                Ok(FxpReply::Stat(stat_remote(ctx, &path).await?))
            }
            FxpOp::TypeBinary => {
                ctx.expect_ok("TYPE I").await?;
                Ok(FxpReply::Ok)
            }
            FxpOp::Sscn(on) => {
                ctx.expect_ok(if on { "SSCN ON" } else { "SSCN OFF" }).await?;
                ctx.sscn_active = on;
                Ok(FxpReply::Ok)
            }
            FxpOp::ProtClear => {
                ctx.expect_ok("PROT C").await?;
                ctx.data_protected = false;
                Ok(FxpReply::Ok)
            }
            FxpOp::Port(addr) => {
                let IpAddr::V4(ip) = addr.ip() else {
                    return Err(EngineError::protocol("FXP requires an IPv4 endpoint"));
                };
                let o = ip.octets();
                let cmd = format!(
                    "PORT {},{},{},{},{},{}",
                    o[0],
                    o[1],
                    o[2],
                    o[3],
                    addr.port() / 256,
                    addr.port() % 256
                );
                ctx.expect_ok(&cmd).await?;
                Ok(FxpReply::Ok)
            }
            FxpOp::Rest(offset) => {
                ctx.expect(&format!("REST {}", offset), 3).await?;
                Ok(FxpReply::Ok)
            }
            FxpOp::Stor(name) => {
                ctx.expect(&format!("STOR {}", name), 1).await?;
                Ok(FxpReply::Ok)
            }
            FxpOp::WaitComplete => {
                let done = ctx.read_reply().await?;
                if !done.is_positive() {
                    return Err(done.into_error());
                }
                self.invalidate_once(ctx);
                Ok(FxpReply::Ok)
            }
            FxpOp::Finish => Ok(FxpReply::Ok),
        }
    }
}

#[async_trait]
impl Command<FtpCtx> for FxpServeCmd {
    fn name(&self) -> &'static str {
        "fxp-serve"
    }

    async fn process(&mut self, ctx: &mut FtpCtx) -> Flow<FtpCtx> {
        let req = match tokio::time::timeout(SERVE_POLL, self.rx.recv()).await {
            Err(_) => return Flow::Continue,
            // Source side gone without a Finish: wind down.
            Ok(None) => return Flow::Done(ResultCode::Ok),
            Ok(Some(req)) => req,
        };
        let finish = matches!(req.op, FxpOp::Finish);
        let reply = match self.handle(ctx, req.op).await {
            Ok(reply) => reply,
            Err(e) => {
                if matches!(e, EngineError::Disconnected | EngineError::Timeout) {
                    ctx.drop_connection();
                    ctx.core.emit(SessionEvent::Disconnected);
                }
                FxpReply::Failed(e.to_string())
            }
        };
        // A dropped receiver means the source already gave up; nothing to do.
        let _ = req.reply.send(reply);
        if finish {
            Flow::Done(ResultCode::Ok)
        } else {
            Flow::Continue
        }
    }

    async fn cleanup(&mut self, ctx: &mut FtpCtx) {
        self.rx.close();
        self.invalidate_once(ctx);
    }
}

// ── Source side ──────────────────────────────────────────────────────

enum SourceState {
    Setup,
    AwaitDecision,
    Transfer,
    Complete,
}

pub struct FxpSourceCmd {
    ops: mpsc::UnboundedSender<FxpRequest>,
    source: String,
    dest_dir: String,
    dest_name: String,
    state: SourceState,
    offset: u64,
    size: u64,
    caps: Option<(bool, bool)>,
}

impl FxpSourceCmd {
    async fn call(&self, ctx: &FtpCtx, op: FxpOp) -> EngineResult<FxpReply> {
        let (tx, rx) = oneshot::channel();
        self.ops
            .send(FxpRequest { op, reply: tx })
            .map_err(|_| EngineError::local("destination session is gone"))?;
        let reply = tokio::time::timeout(ctx.control_timeout(), rx)
            .await
            .map_err(|_| EngineError::Timeout)?
            .map_err(|_| EngineError::local("destination dropped the request"))?;
        match reply {
            FxpReply::Failed(detail) => Err(EngineError::protocol(detail)),
            other => Ok(other),
        }
    }

    async fn expect_ok(&self, ctx: &FtpCtx, op: FxpOp) -> EngineResult<()> {
        self.call(ctx, op).await.map(|_| ())
    }

    /// Returns false when a destination collision was found and a decision
    /// request is pending.
    async fn setup(&mut self, ctx: &mut FtpCtx) -> EngineResult<bool> {
        let caps = match self.call(ctx, FxpOp::Query).await? {
            FxpReply::Caps { secured, sscn } => (secured, sscn),
            _ => return Err(EngineError::protocol("unexpected capability reply")),
        };
        self.caps = Some(caps);

        let source = ctx.resolve_path(&self.source);
        let src_dir = RemoteUrl::parent_of(&source).to_string();
        ctx.expect_ok(&format!("CWD {}", src_dir)).await?;
        ctx.core.current_dir = src_dir;
        self.call(ctx, FxpOp::Cwd(self.dest_dir.clone())).await?;

        let name = source.rsplit('/').next().unwrap_or(&source).to_string();
        self.source = name.clone();
        let src_entry = stat_remote(ctx, &name).await?;
        self.size = src_entry.as_ref().map(|e| e.size).unwrap_or(0);

        match self.call(ctx, FxpOp::Stat(self.dest_name.clone())).await? {
            FxpReply::Stat(Some(dest)) => {
                ctx.core.emit(SessionEvent::FileExists {
                    source: src_entry,
                    destination: Some(dest),
                });
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    async fn transfer(&mut self, ctx: &mut FtpCtx) -> EngineResult<()> {
        ctx.expect_ok("TYPE I").await?;
        self.expect_ok(ctx, FxpOp::TypeBinary).await?;

        // Protected FXP needs one end in TLS-client mode (SSCN). Without
        // SSCN on both ends, CPSV covers the same case from the source
        // side; failing both, the data legs fall back to clear.
        let (dest_secured, dest_sscn) = self.caps.unwrap_or((false, false));
        let mut passive_cmd = "PASV";
        if ctx.secured && dest_secured {
            let src_sscn = ctx.core.settings.get_bool(keys::FEAT_SSCN, false);
            if src_sscn && dest_sscn {
                ctx.expect_ok("SSCN ON").await?;
                ctx.sscn_active = true;
            } else if ctx.core.settings.get_bool(keys::FEAT_CPSV, false) {
                passive_cmd = "CPSV";
            } else {
                ctx.expect_ok("PROT C").await?;
                ctx.data_protected = false;
                self.expect_ok(ctx, FxpOp::ProtClear).await?;
            }
        }

        let reply = ctx.expect(passive_cmd, 2).await?;
        let mut addr = parse_pasv(reply.text())
            .ok_or_else(|| EngineError::protocol(format!("bad PASV reply: {}", reply.text())))?;
        // NAT-mangled private address in the reply: trust the control
        // connection's peer instead.
        if let (IpAddr::V4(ip), Some(peer)) = (addr.ip(), ctx.peer_addr) {
            let trust = ctx.core.settings.get_bool(keys::PASV_TRUST_PRIVATE, false);
            if is_private(ip) && !trust {
                addr = SocketAddr::new(peer.ip(), addr.port());
            }
        }
        self.expect_ok(ctx, FxpOp::Port(addr)).await?;

        if self.offset > 0 {
            ctx.expect(&format!("REST {}", self.offset), 3).await?;
            self.expect_ok(ctx, FxpOp::Rest(self.offset)).await?;
            ctx.core.emit(SessionEvent::ResumeOffset(self.offset));
        }

        // RETR first: a refused source file must never leave the
        // destination with an open STOR.
        ctx.expect(&format!("RETR {}", self.source), 1).await?;
        self.expect_ok(ctx, FxpOp::Stor(self.dest_name.clone())).await?;
        Ok(())
    }

    async fn complete(&mut self, ctx: &mut FtpCtx) -> EngineResult<()> {
        let done = ctx.read_reply().await?;
        if !done.is_positive() {
            return Err(done.into_error());
        }
        self.expect_ok(ctx, FxpOp::WaitComplete).await?;
        self.expect_ok(ctx, FxpOp::Finish).await?;
        if ctx.sscn_active {
            let _ = ctx.execute("SSCN OFF").await;
            ctx.sscn_active = false;
        }
        ctx.core.emit(SessionEvent::TransferComplete {
            bytes: self.size.saturating_sub(self.offset),
        });
        Ok(())
    }

    fn bail(&self, ctx: &mut FtpCtx, e: &EngineError) -> Flow<FtpCtx> {
        let code = ctx.fail(e, ErrorKind::OperationFailed);
        Flow::Done(code)
    }
}

#[async_trait]
impl Command<FtpCtx> for FxpSourceCmd {
    fn name(&self) -> &'static str {
        "fxp-source"
    }

    async fn process(&mut self, ctx: &mut FtpCtx) -> Flow<FtpCtx> {
        match self.state {
            SourceState::Setup => match self.setup(ctx).await {
                Ok(true) => {
                    self.state = SourceState::Transfer;
                    Flow::Continue
                }
                Ok(false) => {
                    self.state = SourceState::AwaitDecision;
                    Flow::Suspended
                }
                Err(e) => self.bail(ctx, &e),
            },
            SourceState::AwaitDecision => Flow::Suspended,
            SourceState::Transfer => match self.transfer(ctx).await {
                Ok(()) => {
                    self.state = SourceState::Complete;
                    Flow::Continue
                }
                Err(e) => self.bail(ctx, &e),
            },
            SourceState::Complete => match self.complete(ctx).await {
                Ok(()) => Flow::Done(ResultCode::Ok),
                Err(e) => self.bail(ctx, &e),
            },
        }
    }

    async fn wakeup(&mut self, ctx: &mut FtpCtx, event: WakeupEvent) -> Flow<FtpCtx> {
        let WakeupEvent::FileExists(action) = event else {
            return Flow::Suspended;
        };
        match action {
            FileExistsAction::Overwrite => self.offset = 0,
            FileExistsAction::Resume => {
                // Stat again rather than trusting a stale decision dialog.
                self.offset = match self.call(ctx, FxpOp::Stat(self.dest_name.clone())).await {
                    Ok(FxpReply::Stat(Some(e))) => e.size,
                    _ => 0,
                };
            }
            FileExistsAction::Rename(name) => {
                self.dest_name = name;
                self.offset = 0;
            }
            FileExistsAction::Skip => {
                let _ = self.expect_ok(ctx, FxpOp::Finish).await;
                return Flow::Done(ResultCode::Ok);
            }
        }
        self.state = SourceState::Transfer;
        self.process(ctx).await
    }

    async fn cleanup(&mut self, _ctx: &mut FtpCtx) {
        // Unwind path: make sure the peer stops serving. The reply channel
        // is dropped on purpose.
        let (tx, _rx) = oneshot::channel();
        let _ = self.ops.send(FxpRequest {
            op: FxpOp::Finish,
            reply: tx,
        });
    }
}
