//! Data-channel negotiation, always chained under a listing or transfer
//! command.
//!
//! Order of attempts: EPSV → PASV → PORT/EPRT. A mode the server rejects
//! is disabled in the session settings, so every later operation on this
//! session skips it. Passive replies pointing at a private address are
//! substituted with the control connection's peer address unless the
//! session is configured to trust them. The negotiated stream is left in
//! `ctx.data_result` once the server has acknowledged the data command
//! with a 1xx mark.

use super::stream::SecurableStream;
use super::FtpCtx;
use crate::command::{Command, Flow, ResultCode};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use fathom_core::settings::keys;
use regex::Regex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::{TcpListener, TcpStream};

enum State {
    Prepare,
    Negotiate,
    Establish,
}

/// Where the data connection will come from.
enum Endpoint {
    /// We connect out to the server (EPSV/PASV).
    Outbound(SocketAddr),
    /// The server connects back to us (PORT/EPRT).
    Inbound(TcpListener),
}

pub struct DataChannelCmd {
    state: State,
    endpoint: Option<Endpoint>,
}

impl DataChannelCmd {
    pub fn new() -> Self {
        Self {
            state: State::Prepare,
            endpoint: None,
        }
    }
}

impl Default for DataChannelCmd {
    fn default() -> Self {
        Self::new()
    }
}

pub(super) fn is_private(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local()
}

/// Parse a 227 PASV reply: `(h1,h2,h3,h4,p1,p2)`.
pub(super) fn parse_pasv(text: &str) -> Option<SocketAddr> {
    let re = Regex::new(r"\((\d+),(\d+),(\d+),(\d+),(\d+),(\d+)\)").ok()?;
    let caps = re.captures(text)?;
    let oct = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u8>().ok());
    let ip = Ipv4Addr::new(oct(1)?, oct(2)?, oct(3)?, oct(4)?);
    let port = u16::from(oct(5)?) * 256 + u16::from(oct(6)?);
    Some(SocketAddr::new(IpAddr::V4(ip), port))
}

/// Parse a 229 EPSV reply: `(|||port|)`.
fn parse_epsv(text: &str) -> Option<u16> {
    let re = Regex::new(r"\|\|\|(\d+)\|").ok()?;
    re.captures(text)?.get(1)?.as_str().parse().ok()
}

impl DataChannelCmd {
    async fn prepare(&mut self, ctx: &mut FtpCtx) -> EngineResult<()> {
        // A leftover SSCN mode from an earlier FXP leg would corrupt a
        // plain transfer.
        if ctx.sscn_active {
            let _ = ctx.execute("SSCN OFF").await;
            ctx.sscn_active = false;
        }

        let binary = ctx.data_request.as_ref().is_some_and(|r| r.binary);
        ctx.expect_ok(if binary { "TYPE I" } else { "TYPE A" }).await?;

        if ctx.secured {
            let mode = ctx.core.settings.get_str(keys::SSL_PROT_MODE, "P");
            let want_protected = mode == "P";
            if want_protected != ctx.data_protected {
                ctx.expect_ok(&format!("PROT {}", mode)).await?;
                ctx.data_protected = want_protected;
            }
        }

        if ctx.core.settings.get_bool(keys::FEAT_PRET, false) {
            let command = ctx
                .data_request
                .as_ref()
                .map(|r| r.command.clone())
                .unwrap_or_default();
            if let Err(e) = ctx.expect_ok(&format!("PRET {}", command)).await {
                // Optional pre-check; a refusing server simply loses it.
                log::debug!("PRET refused, disabling: {}", e);
                ctx.core.settings.set(keys::FEAT_PRET, false);
            }
        }
        Ok(())
    }

    async fn try_epsv(&mut self, ctx: &mut FtpCtx) -> EngineResult<Option<SocketAddr>> {
        let reply = ctx.execute("EPSV").await?;
        if reply.code != 229 {
            return Ok(None);
        }
        let Some(port) = parse_epsv(reply.text()) else {
            return Ok(None);
        };
        let peer = ctx.peer_addr.ok_or(EngineError::Disconnected)?;
        Ok(Some(SocketAddr::new(peer.ip(), port)))
    }

    async fn try_pasv(&mut self, ctx: &mut FtpCtx) -> EngineResult<Option<SocketAddr>> {
        let reply = ctx.execute("PASV").await?;
        if reply.code != 227 {
            return Ok(None);
        }
        let Some(mut addr) = parse_pasv(reply.text()) else {
            return Ok(None);
        };
        // Servers behind NAT frequently report their internal address.
        if let (IpAddr::V4(reported), Some(peer)) = (addr.ip(), ctx.peer_addr) {
            let trust = ctx.core.settings.get_bool(keys::PASV_TRUST_PRIVATE, false);
            if is_private(reported) && reported != peer.ip() && !trust {
                log::debug!(
                    "PASV reported private address {}, substituting {}",
                    reported,
                    peer.ip()
                );
                addr = SocketAddr::new(peer.ip(), addr.port());
            }
        }
        Ok(Some(addr))
    }

    async fn bind_active(&mut self, ctx: &mut FtpCtx) -> EngineResult<TcpListener> {
        let local_ip = ctx
            .local_addr
            .map(|a| a.ip())
            .ok_or(EngineError::Disconnected)?;
        let min = ctx.core.settings.get_u16(keys::ACTIVE_PORT_MIN, 0);
        let max = ctx.core.settings.get_u16(keys::ACTIVE_PORT_MAX, 0);
        if min == 0 || max < min {
            return Ok(TcpListener::bind((local_ip, 0)).await?);
        }
        for port in min..=max {
            if let Ok(listener) = TcpListener::bind((local_ip, port)).await {
                return Ok(listener);
            }
        }
        Err(EngineError::local(format!(
            "no free port in active range {}-{}",
            min, max
        )))
    }

    async fn announce_active(&mut self, ctx: &mut FtpCtx, listener: &TcpListener) -> EngineResult<()> {
        let port = listener.local_addr()?.port();
        let ip = match ctx.core.settings.get(keys::ACTIVE_EXTERNAL_IP) {
            Some(forced) => forced
                .parse::<IpAddr>()
                .map_err(|e| EngineError::local(format!("bad external IP: {}", e)))?,
            None => listener.local_addr()?.ip(),
        };

        if ctx.core.settings.get_bool(keys::FEAT_EPRT, true) {
            let cmd = format!("EPRT |1|{}|{}|", ip, port);
            match ctx.execute(&cmd).await {
                Ok(reply) if reply.is_positive() => return Ok(()),
                Ok(_) => ctx.core.settings.set(keys::FEAT_EPRT, false),
                Err(e) => return Err(e),
            }
        }

        let IpAddr::V4(v4) = ip else {
            return Err(EngineError::local("PORT requires an IPv4 address"));
        };
        let o = v4.octets();
        let cmd = format!(
            "PORT {},{},{},{},{},{}",
            o[0],
            o[1],
            o[2],
            o[3],
            port / 256,
            port % 256
        );
        ctx.expect_ok(&cmd).await?;
        Ok(())
    }

    /// Run the EPSV → PASV → PORT ladder, disabling each rejected rung.
    async fn negotiate(&mut self, ctx: &mut FtpCtx) -> EngineResult<Endpoint> {
        if ctx.core.settings.get_bool(keys::FEAT_EPSV, true) {
            match self.try_epsv(ctx).await? {
                Some(addr) => return Ok(Endpoint::Outbound(addr)),
                None => {
                    log::debug!("EPSV rejected, disabled for this session");
                    ctx.core.settings.set(keys::FEAT_EPSV, false);
                }
            }
        }
        if ctx.core.settings.get_bool(keys::FEAT_PASV, true) {
            match self.try_pasv(ctx).await? {
                Some(addr) => return Ok(Endpoint::Outbound(addr)),
                None => {
                    log::debug!("PASV rejected, disabled for this session");
                    ctx.core.settings.set(keys::FEAT_PASV, false);
                }
            }
        }
        let listener = self.bind_active(ctx).await?;
        self.announce_active(ctx, &listener).await?;
        Ok(Endpoint::Inbound(listener))
    }

    async fn establish(&mut self, ctx: &mut FtpCtx) -> EngineResult<()> {
        let (command, rest) = match ctx.data_request.as_ref() {
            Some(r) => (r.command.clone(), r.rest),
            None => return Err(EngineError::local("no data request staged")),
        };

        // Pre-connect for passive modes so the server sees our connection
        // before (or while) it handles the data command.
        let pre_connected = match self.endpoint.take() {
            Some(Endpoint::Outbound(addr)) => {
                let tcp = tokio::time::timeout(ctx.data_timeout(), TcpStream::connect(addr))
                    .await
                    .map_err(|_| EngineError::Timeout)??;
                self.endpoint = None;
                Some(tcp)
            }
            Some(Endpoint::Inbound(listener)) => {
                self.endpoint = Some(Endpoint::Inbound(listener));
                None
            }
            None => return Err(EngineError::local("no endpoint negotiated")),
        };

        // REST before the data command; a refusal downgrades to a full
        // transfer rather than failing.
        ctx.applied_rest = 0;
        if rest > 0 {
            if ctx.core.settings.get_bool(keys::FEAT_REST, true) {
                match ctx.expect(&format!("REST {}", rest), 3).await {
                    Ok(_) => ctx.applied_rest = rest,
                    Err(EngineError::Reply { .. }) => {
                        log::debug!("REST rejected, disabled for this session");
                        ctx.core.settings.set(keys::FEAT_REST, false);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let mark = ctx.expect(&command, 1).await?;
        log::trace!("data command accepted: {}", mark.code);

        let tcp = match (pre_connected, self.endpoint.take()) {
            (Some(tcp), _) => tcp,
            (None, Some(Endpoint::Inbound(listener))) => {
                let (tcp, peer) = tokio::time::timeout(ctx.data_timeout(), listener.accept())
                    .await
                    .map_err(|_| EngineError::Timeout)??;
                log::trace!("active data connection from {}", peer);
                tcp
            }
            _ => return Err(EngineError::local("no endpoint negotiated")),
        };

        let mut stream = SecurableStream::Plain(tcp);
        if ctx.data_protected {
            let host = ctx.core.url().map(|u| u.host.clone()).unwrap_or_default();
            let accept = ctx.core.settings.get_bool(keys::SSL_IGNORE_ERRORS, false);
            stream = stream.upgrade_tls(&host, accept).await?;
        }
        ctx.data_result = Some(stream);
        Ok(())
    }
}

#[async_trait]
impl Command<FtpCtx> for DataChannelCmd {
    fn name(&self) -> &'static str {
        "data-channel"
    }

    async fn process(&mut self, ctx: &mut FtpCtx) -> Flow<FtpCtx> {
        let step: EngineResult<()> = match self.state {
            State::Prepare => {
                let r = self.prepare(ctx).await;
                self.state = State::Negotiate;
                r
            }
            State::Negotiate => match self.negotiate(ctx).await {
                Ok(endpoint) => {
                    self.endpoint = Some(endpoint);
                    self.state = State::Establish;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            State::Establish => match self.establish(ctx).await {
                Ok(()) => return Flow::Done(ResultCode::Ok),
                Err(e) => Err(e),
            },
        };

        match step {
            Ok(()) => Flow::Continue,
            Err(e) => {
                let kind = ctx
                    .data_request
                    .as_ref()
                    .map(|r| r.error_kind)
                    .unwrap_or(fathom_core::ErrorKind::OperationFailed);
                let code = ctx.fail_transport(&e, kind);
                Flow::Done(code)
            }
        }
    }

    async fn cleanup(&mut self, _ctx: &mut FtpCtx) {
        // Dropping a pending listener/endpoint closes it.
        self.endpoint = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasv_reply_parses() {
        let addr =
            parse_pasv("Entering Passive Mode (192,168,1,10,19,137)").unwrap();
        assert_eq!(addr.ip().to_string(), "192.168.1.10");
        assert_eq!(addr.port(), 19 * 256 + 137);
        assert!(parse_pasv("garbage").is_none());
    }

    #[test]
    fn epsv_reply_parses() {
        assert_eq!(
            parse_epsv("Entering Extended Passive Mode (|||6446|)"),
            Some(6446)
        );
        assert!(parse_epsv("(|x|6446|)").is_none());
    }

    #[test]
    fn private_ranges() {
        assert!(is_private(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(is_private(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(is_private(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(is_private(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(!is_private(Ipv4Addr::new(93, 184, 216, 34)));
    }
}
