//! Directory listing: cache read-through, single-connection STAT when the
//! server supports it, LIST/MLSD over a negotiated data channel otherwise.

use super::data::DataChannelCmd;
use super::ops::CwdCmd;
use super::{DataRequest, FtpCtx};
use crate::command::{Command, Flow, ResultCode};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use fathom_core::settings::keys;
use fathom_core::{DirectoryListing, ErrorKind, ListingParser, SessionEvent};
use tokio::io::AsyncReadExt;

enum State {
    CheckCache,
    Fetch,
    Drain,
}

pub struct ListCmd {
    path: String,
    /// Emit the result as an event; listing chained under another command
    /// only fills `last_listing`.
    emit: bool,
    use_cache: bool,
    state: State,
}

impl ListCmd {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            emit: true,
            use_cache: true,
            state: State::CheckCache,
        }
    }

    /// A chained listing: no event, still cached.
    pub fn quiet(path: impl Into<String>) -> Self {
        let mut cmd = Self::new(path);
        cmd.emit = false;
        cmd
    }

    /// Bypass the cache (refresh).
    pub fn fresh(path: impl Into<String>) -> Self {
        let mut cmd = Self::new(path);
        cmd.use_cache = false;
        cmd
    }

    fn finish(&self, ctx: &mut FtpCtx, listing: DirectoryListing) -> Flow<FtpCtx> {
        let dir = ctx.resolve_path(&self.path);
        if let Some(url) = ctx.core.url().cloned() {
            ctx.core
                .shared
                .cache()
                .insert_listing(&url, &dir, listing.clone());
        }
        if self.emit {
            ctx.core.emit(SessionEvent::DirectoryListing(listing.clone()));
        }
        ctx.core.last_listing = Some(listing);
        Flow::Done(ResultCode::Ok)
    }

    fn parse_lines<'a>(
        &self,
        ctx: &FtpCtx,
        lines: impl Iterator<Item = &'a str>,
    ) -> DirectoryListing {
        let dir = ctx.resolve_path(&self.path);
        let key = ctx
            .core
            .url()
            .map(|u| u.cache_key(&dir))
            .unwrap_or_else(|| dir.clone());
        let encoding = ctx.core.settings.get_str(keys::ENCODING, "utf-8");
        let parser = ListingParser::new(&encoding);
        let mut listing = DirectoryListing::new(key);
        for line in lines {
            if let Some(entry) = parser.parse_line(line) {
                listing.add_entry(entry);
            }
        }
        listing
    }

    /// Try a single-connection STAT listing.
    async fn stat_list(&self, ctx: &mut FtpCtx) -> EngineResult<Option<DirectoryListing>> {
        let reply = ctx.execute("STAT -la").await?;
        if reply.class() != 2 || reply.body().is_empty() {
            return Ok(None);
        }
        let lines: Vec<String> = reply.body().to_vec();
        Ok(Some(self.parse_lines(ctx, lines.iter().map(String::as_str))))
    }

    async fn drain(&self, ctx: &mut FtpCtx) -> EngineResult<DirectoryListing> {
        let mut stream = ctx
            .data_result
            .take()
            .ok_or_else(|| EngineError::local("no data channel for listing"))?;

        let dir = ctx.resolve_path(&self.path);
        let key = ctx
            .core
            .url()
            .map(|u| u.cache_key(&dir))
            .unwrap_or_else(|| dir.clone());
        let encoding = ctx.core.settings.get_str(keys::ENCODING, "utf-8");
        let mut parser = ListingParser::new(&encoding);
        let mut listing = DirectoryListing::new(key);

        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = tokio::time::timeout(ctx.data_timeout(), stream.read(&mut buf))
                .await
                .map_err(|_| EngineError::Timeout)??;
            if n == 0 {
                break;
            }
            for entry in parser.feed(&buf[..n]) {
                listing.add_entry(entry);
            }
        }
        if let Some(entry) = parser.finish() {
            listing.add_entry(entry);
        }
        drop(stream);

        // Control-channel completion is the second half of the rendezvous.
        let done = ctx.read_reply().await?;
        if !done.is_positive() {
            return Err(done.into_error());
        }
        Ok(listing)
    }
}

#[async_trait]
impl Command<FtpCtx> for ListCmd {
    fn name(&self) -> &'static str {
        "list"
    }

    async fn process(&mut self, ctx: &mut FtpCtx) -> Flow<FtpCtx> {
        match self.state {
            State::CheckCache => {
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
                self.state = State::Fetch;
                Flow::Chain(Box::new(CwdCmd::new(dir, false)))
            }
            State::Fetch => {
                if ctx.core.settings.get_bool(keys::FEAT_STAT, false) {
                    match self.stat_list(ctx).await {
                        Ok(Some(listing)) => return self.finish(ctx, listing),
                        Ok(None) => {
                            log::debug!("STAT listing refused, disabled for this session");
                            ctx.core.settings.set(keys::FEAT_STAT, false);
                        }
                        Err(e) => {
                            let code = ctx.fail(&e, ErrorKind::ListFailed);
                            return Flow::Done(code);
                        }
                    }
                }
                let command = if ctx.core.settings.get_bool(keys::FEAT_MLSD, false) {
                    "MLSD"
                } else {
                    "LIST"
                };
                ctx.data_request = Some(DataRequest {
                    command: command.to_string(),
                    rest: 0,
                    binary: false,
                    error_kind: ErrorKind::ListFailed,
                });
                self.state = State::Drain;
                Flow::Chain(Box::new(DataChannelCmd::new()))
            }
            State::Drain => {
                ctx.data_request = None;
                match self.drain(ctx).await {
                    Ok(listing) => self.finish(ctx, listing),
                    Err(e) => {
                        let code = ctx.fail_transport(&e, ErrorKind::ListFailed);
                        Flow::Done(code)
                    }
                }
            }
        }
    }

    async fn cleanup(&mut self, ctx: &mut FtpCtx) {
        ctx.data_request = None;
        ctx.data_result = None;
    }
}
