//! HTTP CONNECT tunnel proxy.
//!
//! Parses a `CONNECT host:port` request head, opens the upstream TCP
//! connection, answers `200 Connection Established`, and hands both raw
//! sockets to the relay primitive. No further HTTP framing happens after
//! the 200; responses are limited to 200/500.

use crate::context::AppContext;
use crate::relay::{self, RelayConfig};
use crate::usage::AccountingDecision;
use crate::utils::generate_correlation_id;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

const RESPONSE_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
const RESPONSE_ERROR: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\r\n";

/// Upper bound on a single request-head line; anything longer is malformed.
const MAX_LINE_LENGTH: usize = 8192;

/// Upper bound on the number of header lines drained after the request line.
const MAX_HEADER_LINES: usize = 128;

/// Start the HTTP CONNECT proxy listener with graceful shutdown support.
pub async fn start_connect_proxy(
    listen_addr: &str,
    ctx: Arc<AppContext>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "HTTP CONNECT proxy listening");

    let semaphore = Arc::new(Semaphore::new(ctx.config.limits.max_connections as usize));

    loop {
        let stream = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _peer)) => stream,
                    Err(e) => {
                        error!(error = %e, "CONNECT proxy accept error");
                        continue;
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("CONNECT proxy shutting down (no new connections)");
                break;
            }
        };

        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("CONNECT proxy connection limit reached, dropping connection");
                drop(stream);
                continue;
            }
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handle_connection(stream, ctx).await {
                error!(error = %e, "CONNECT proxy connection error");
            }
        });
    }

    Ok(())
}

/// Handle a single CONNECT client.
pub async fn handle_connection(mut stream: TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    let peer_addr = stream.peer_addr()?;
    let conn_id = generate_correlation_id();
    let span = info_span!("connect", conn_id = %conn_id, peer = %peer_addr.ip());
    async {
        debug!(peer = %peer_addr, "New CONNECT client");
        let _guard = ctx.track_connection();

        let peer_ip = peer_addr.ip().to_string();
        let acct_id = match ctx.accounting.begin_session(&peer_ip, "connect", &peer_ip) {
            AccountingDecision::Allowed(id) => id,
            AccountingDecision::Denied(reason) => {
                warn!(reason = %reason, "CONNECT session rejected by accounting");
                return Ok(());
            }
        };

        let handshake_timeout = Duration::from_secs(ctx.config.limits.handshake_timeout);
        let head = tokio::time::timeout(handshake_timeout, read_request_head(&mut stream)).await;

        let target = match head {
            Ok(Ok(request_line)) => parse_connect_target(&request_line),
            Ok(Err(e)) => {
                debug!(error = %e, "CONNECT request head unreadable");
                ctx.accounting.end_session(&acct_id, 0, 0);
                return Ok(());
            }
            Err(_) => {
                warn!(peer = %peer_addr, "CONNECT handshake timeout");
                ctx.accounting.end_session(&acct_id, 0, 0);
                return Ok(());
            }
        };

        let (host, port) = match target {
            Ok(t) => t,
            Err(e) => {
                warn!(peer = %peer_addr, error = %e, "CONNECT request rejected: malformed target");
                let _ = stream.write_all(RESPONSE_ERROR).await;
                ctx.accounting.end_session(&acct_id, 0, 0);
                return Ok(());
            }
        };

        debug!(target = %format!("{}:{}", host, port), "CONNECT request");

        let connect_timeout = Duration::from_secs(ctx.config.limits.connect_timeout);
        let upstream = match tokio::time::timeout(
            connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(e)) => {
                warn!(target = %format!("{}:{}", host, port), error = %e, "CONNECT upstream connect failed");
                let _ = stream.write_all(RESPONSE_ERROR).await;
                ctx.accounting.end_session(&acct_id, 0, 0);
                return Ok(());
            }
            Err(_) => {
                warn!(target = %format!("{}:{}", host, port), "CONNECT upstream connect failed: timeout");
                let _ = stream.write_all(RESPONSE_ERROR).await;
                ctx.accounting.end_session(&acct_id, 0, 0);
                return Ok(());
            }
        };

        stream
            .write_all(RESPONSE_ESTABLISHED)
            .await
            .context("sending 200 Connection Established")?;

        let relay_cfg = RelayConfig::new(
            Duration::from_secs(ctx.config.limits.idle_timeout),
            format!("{}@{}:{}", peer_addr.ip(), host, port),
        );
        let (bytes_up, bytes_down) = relay::relay(stream, upstream, relay_cfg).await?;
        ctx.accounting.end_session(&acct_id, bytes_up, bytes_down);
        Ok(())
    }
    .instrument(span)
    .await
}

/// Read the request line and drain the remaining header lines.
/// Returns the request line.
async fn read_request_head<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String> {
    let request_line = read_crlf_line(stream).await?;
    for _ in 0..MAX_HEADER_LINES {
        let line = read_crlf_line(stream).await?;
        if line.is_empty() {
            return Ok(request_line);
        }
    }
    anyhow::bail!("too many header lines in CONNECT request");
}

/// Read a single CRLF-terminated line, without the terminator.
/// Bare LF is tolerated; lines over `MAX_LINE_LENGTH` are an error.
pub(crate) async fn read_crlf_line<S: AsyncRead + Unpin>(stream: &mut S) -> Result<String> {
    let mut line = Vec::new();
    loop {
        let byte = stream.read_u8().await.context("reading request line")?;
        if byte == b'\n' {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return String::from_utf8(line).context("request line is not valid UTF-8");
        }
        line.push(byte);
        if line.len() > MAX_LINE_LENGTH {
            anyhow::bail!("request line too long (max {} bytes)", MAX_LINE_LENGTH);
        }
    }
}

/// Parse `CONNECT host:port HTTP/1.x` into `(host, port)`.
fn parse_connect_target(request_line: &str) -> Result<(String, u16)> {
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    if !method.eq_ignore_ascii_case("CONNECT") {
        anyhow::bail!("unsupported method '{}'", method);
    }

    let target = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("missing CONNECT target"))?;
    let version = parts.next().unwrap_or("");
    if !version.starts_with("HTTP/") {
        anyhow::bail!("missing HTTP version");
    }

    let (host, port_str) = target
        .rsplit_once(':')
        .ok_or_else(|| anyhow::anyhow!("CONNECT target '{}' has no port", target))?;
    if host.is_empty() {
        anyhow::bail!("CONNECT target has empty host");
    }
    let port: u16 = port_str
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid port '{}'", port_str))?;
    if port == 0 {
        anyhow::bail!("invalid port 0");
    }

    Ok((host.to_string(), port))
}
