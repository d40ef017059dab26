//! WebSocket-to-SSH bridge.
//!
//! Per connection: HANDSHAKING → TUNNEL_STARTING → BRIDGING → CLOSED.
//! Any failure is terminal for the session; there are no retries. Teardown
//! always kills the SSH subprocess and removes the registry entry, whichever
//! relay direction ends first.

use crate::context::AppContext;
use crate::relay::RELAY_BUFFER_SIZE;
use crate::session::TunnelSession;
use crate::ssh;
use crate::usage::AccountingDecision;
use crate::utils::generate_correlation_id;
use crate::ws::handshake::{self, TemplateSet};
use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::net::Ipv4Addr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Role};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, info_span, warn, Instrument};

/// Handle one bridge client from accept to teardown.
pub async fn handle_connection(mut stream: TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    let peer_addr = stream.peer_addr()?;
    let conn_id = generate_correlation_id();
    let span = info_span!("wsbridge", conn_id = %conn_id, peer = %peer_addr.ip());
    async {
        debug!(peer = %peer_addr, "New WebSocket bridge connection");
        let _guard = ctx.track_connection();

        let peer_ip = peer_addr.ip().to_string();
        let acct_id = match ctx.accounting.begin_session(&peer_ip, "wsbridge", &peer_ip) {
            AccountingDecision::Allowed(id) => id,
            AccountingDecision::Denied(reason) => {
                warn!(reason = %reason, "Bridge session rejected by accounting");
                return Ok(());
            }
        };

        // HANDSHAKING: parse the upgrade head, pick a template, answer 101
        let handshake_timeout = Duration::from_secs(ctx.config.limits.handshake_timeout);
        let upgrade = match tokio::time::timeout(
            handshake_timeout,
            handshake::read_upgrade_request(&mut stream),
        )
        .await
        {
            Ok(Ok(upgrade)) => upgrade,
            Ok(Err(e)) => {
                debug!(error = %e, "Upgrade request rejected");
                ctx.accounting.end_session(&acct_id, 0, 0);
                return Ok(());
            }
            Err(_) => {
                warn!(peer = %peer_addr, "WebSocket handshake timeout");
                ctx.accounting.end_session(&acct_id, 0, 0);
                return Ok(());
            }
        };

        let templates = TemplateSet::from_config(&ctx.config.websocket);
        let template = templates.select(upgrade.agent.as_deref());
        let response =
            handshake::build_upgrade_response(template, &upgrade.key, upgrade.offers_socks());
        stream
            .write_all(response.as_bytes())
            .await
            .context("writing upgrade response")?;
        debug!(template = %template.name, path = %upgrade.path, "Upgrade accepted");

        let mut ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;

        // TUNNEL_STARTING: launcher failure closes the socket with a reason
        let tunnel = match ssh::launch(&ctx.config.ssh).await {
            Ok(tunnel) => tunnel,
            Err(e) => {
                warn!(error = %e, "SSH tunnel launch failed");
                close_with_error(&mut ws, "tunnel unavailable").await;
                ctx.accounting.end_session(&acct_id, 0, 0);
                return Ok(());
            }
        };

        let local = match TcpStream::connect((Ipv4Addr::LOCALHOST, tunnel.port())).await {
            Ok(local) => local,
            Err(e) => {
                warn!(local_port = tunnel.port(), error = %e, "Forward port connect failed");
                tunnel.terminate().await;
                close_with_error(&mut ws, "tunnel unavailable").await;
                ctx.accounting.end_session(&acct_id, 0, 0);
                return Ok(());
            }
        };

        // BRIDGING
        let session = ctx
            .tunnels
            .register(&peer_addr.to_string(), &template.name, tunnel.port());
        info!(
            session_id = %session.session_id,
            template = %template.name,
            local_port = tunnel.port(),
            "WebSocket bridge established"
        );

        let idle_timeout = Duration::from_secs(ctx.config.limits.idle_timeout);
        let result = bridge_streams(ws, local, session.clone(), idle_timeout).await;

        // CLOSED: teardown order is fixed: subprocess first, then registry entry
        tunnel.terminate().await;
        ctx.tunnels.unregister(&session.session_id);

        let bytes_up = session.bytes_up.load(Ordering::Relaxed);
        let bytes_down = session.bytes_down.load(Ordering::Relaxed);
        ctx.accounting.end_session(&acct_id, bytes_up, bytes_down);
        info!(
            session_id = %session.session_id,
            bytes_up = bytes_up,
            bytes_down = bytes_down,
            "Bridge session closed"
        );
        result
    }
    .instrument(span)
    .await
}

/// Best-effort close frame with an explicit failure code.
async fn close_with_error<S>(ws: &mut WebSocketStream<S>, reason: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Error,
        reason: reason.to_string().into(),
    };
    let _ = ws.send(Message::Close(Some(frame))).await;
}

/// Run the two relay directions until the first one ends, the session is
/// cancelled, or a direction stays idle past the window. The losing
/// direction is aborted and both streams are dropped.
pub async fn bridge_streams<S>(
    ws: WebSocketStream<S>,
    local: TcpStream,
    session: Arc<TunnelSession>,
    idle_timeout: Duration,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let effective_timeout = if idle_timeout.is_zero() {
        Duration::from_secs(365 * 24 * 3600)
    } else {
        idle_timeout
    };

    let (mut ws_write, mut ws_read) = ws.split();
    let (mut local_read, mut local_write) = local.into_split();

    let inbound_session = session.clone();
    let mut ws_to_local = tokio::spawn(async move {
        loop {
            let frame = match tokio::time::timeout(effective_timeout, ws_read.next()).await {
                Ok(Some(frame)) => frame?,
                Ok(None) => break,
                Err(_) => {
                    debug!("Bridge idle timeout (ws->local)");
                    break;
                }
            };
            match frame {
                Message::Binary(data) => {
                    local_write.write_all(&data).await?;
                    inbound_session
                        .bytes_up
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                }
                Message::Close(_) => break,
                // Control frames are answered by tungstenite; text is noise
                Message::Ping(_) | Message::Pong(_) | Message::Text(_) => {}
                _ => {}
            }
        }
        Ok::<(), anyhow::Error>(())
    });

    let outbound_session = session.clone();
    let mut local_to_ws = tokio::spawn(async move {
        let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
        loop {
            let n = match tokio::time::timeout(effective_timeout, local_read.read(&mut buf)).await
            {
                Ok(Ok(0)) => {
                    let _ = ws_write.send(Message::Close(None)).await;
                    break;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    debug!("Bridge idle timeout (local->ws)");
                    break;
                }
            };
            ws_write
                .send(Message::Binary(buf[..n].to_vec().into()))
                .await?;
            outbound_session
                .bytes_down
                .fetch_add(n as u64, Ordering::Relaxed);
        }
        Ok::<(), anyhow::Error>(())
    });

    tokio::select! {
        _ = session.cancel.cancelled() => {
            debug!(session_id = %session.session_id, "Bridge session cancelled");
            ws_to_local.abort();
            local_to_ws.abort();
        }
        first = &mut ws_to_local => {
            local_to_ws.abort();
            first.context("ws->local task join failure")??;
        }
        second = &mut local_to_ws => {
            ws_to_local.abort();
            second.context("local->ws task join failure")??;
        }
    }

    Ok(())
}
