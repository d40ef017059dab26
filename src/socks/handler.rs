use crate::context::AppContext;
use crate::relay::{self, RelayConfig};
use crate::socks::protocol;
use crate::usage::AccountingDecision;
use crate::utils::generate_correlation_id;
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, info_span, warn, Instrument};

/// Handle a single SOCKS5 connection
pub async fn handle_connection(mut stream: TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    let peer_addr = stream.peer_addr()?;
    let conn_id = generate_correlation_id();
    let span = info_span!("socks5", conn_id = %conn_id, peer = %peer_addr.ip());
    async {
        debug!(peer = %peer_addr, "New SOCKS5 connection");
        let _guard = ctx.track_connection();

        // Accounting wraps connection acceptance; under NOAUTH the peer IP
        // is the only identity available.
        let peer_ip = peer_addr.ip().to_string();
        let acct_id = match ctx.accounting.begin_session(&peer_ip, "socks5", &peer_ip) {
            AccountingDecision::Allowed(id) => id,
            AccountingDecision::Denied(reason) => {
                warn!(reason = %reason, "SOCKS5 session rejected by accounting");
                return Ok(());
            }
        };

        // The timeout covers only the handshake phase, never the relay
        let handshake_timeout = Duration::from_secs(ctx.config.limits.handshake_timeout);
        let handshake_result = tokio::time::timeout(
            handshake_timeout,
            socks5_handshake(&mut stream, &ctx, &conn_id),
        )
        .await;

        let mut transferred = (0u64, 0u64);
        let outcome = match handshake_result {
            Ok(Ok(Some(relay_info))) => {
                let relay_cfg = RelayConfig::new(
                    Duration::from_secs(ctx.config.limits.idle_timeout),
                    format!(
                        "{}@{}:{}",
                        peer_addr.ip(),
                        relay_info.host,
                        relay_info.port
                    ),
                );
                transferred = relay::relay(stream, relay_info.target_stream, relay_cfg).await?;
                Ok(())
            }
            Ok(Ok(None)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(peer = %peer_addr, "SOCKS5 handshake timeout");
                Ok(())
            }
        };

        ctx.accounting
            .end_session(&acct_id, transferred.0, transferred.1);
        outcome
    }
    .instrument(span)
    .await
}

/// Everything the relay phase needs, produced by a successful handshake.
struct RelayInfo {
    target_stream: TcpStream,
    host: String,
    port: u16,
}

/// Perform the SOCKS5 handshake: greeting, method selection, CONNECT.
/// Returns relay info on success; `None` when the protocol-mandated error
/// reply has already been written and the connection just needs closing.
async fn socks5_handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    ctx: &Arc<AppContext>,
    conn_id: &str,
) -> Result<Option<RelayInfo>> {
    let methods = protocol::read_greeting(stream).await?;

    if !methods.contains(&protocol::AUTH_NONE) {
        // RFC 1928: explicit "no acceptable methods" byte, then close
        protocol::send_method_selection(stream, protocol::AUTH_NO_ACCEPTABLE).await?;
        debug!(conn_id = %conn_id, "SOCKS5 greeting rejected: NOAUTH not offered");
        return Ok(None);
    }

    protocol::send_method_selection(stream, protocol::AUTH_NONE).await?;

    let target = match protocol::read_request(stream).await? {
        protocol::RequestOutcome::Connect(target) => target,
        protocol::RequestOutcome::UnsupportedCommand(cmd) => {
            warn!(conn_id = %conn_id, command = cmd, "SOCKS5 command not supported");
            return Ok(None);
        }
        protocol::RequestOutcome::UnsupportedAddressType(atyp) => {
            warn!(conn_id = %conn_id, atyp = atyp, "SOCKS5 address type not supported");
            return Ok(None);
        }
    };

    let host = target.host_string();
    let port = target.port();
    debug!(conn_id = %conn_id, target = %format!("{}:{}", host, port), "SOCKS5 CONNECT request");

    let connect_timeout = Duration::from_secs(ctx.config.limits.connect_timeout);
    let connected = tokio::time::timeout(
        connect_timeout,
        TcpStream::connect((host.as_str(), port)),
    )
    .await;

    match connected {
        Ok(Ok(target_stream)) => {
            protocol::send_reply(stream, protocol::REPLY_SUCCESS).await?;
            Ok(Some(RelayInfo {
                target_stream,
                host,
                port,
            }))
        }
        Ok(Err(e)) => {
            warn!(conn_id = %conn_id, target = %format!("{}:{}", host, port), error = %e, "SOCKS5 connect failed");
            protocol::send_reply(stream, protocol::REPLY_GENERAL_FAILURE).await?;
            Ok(None)
        }
        Err(_) => {
            warn!(conn_id = %conn_id, target = %format!("{}:{}", host, port), "SOCKS5 connect failed: timeout");
            protocol::send_reply(stream, protocol::REPLY_GENERAL_FAILURE).await?;
            Ok(None)
        }
    }
}
