pub mod handler;
pub mod protocol;

use crate::context::AppContext;
use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Start the SOCKS5 listener with graceful shutdown support.
pub async fn start_socks5_server(
    listen_addr: &str,
    ctx: Arc<AppContext>,
    shutdown: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!(addr = %listen_addr, "SOCKS5 server listening");

    // Limit concurrent SOCKS5 connections
    let semaphore = Arc::new(Semaphore::new(ctx.config.limits.max_connections as usize));

    loop {
        let stream = tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _peer)) => stream,
                    Err(e) => {
                        error!(error = %e, "SOCKS5 accept error");
                        continue;
                    }
                }
            }
            _ = shutdown.cancelled() => {
                info!("SOCKS5 server shutting down (no new connections)");
                break;
            }
        };

        // Check connection limit before spawning
        let permit = match semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("SOCKS5 connection limit reached, dropping connection");
                drop(stream);
                continue;
            }
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = handler::handle_connection(stream, ctx).await {
                error!(error = %e, "SOCKS5 connection error");
            }
        });
    }

    Ok(())
}
