use crate::config::types::AppConfig;
use crate::context::AppContext;
use crate::usage::{NoopAccounting, SessionAccounting};

use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Main server orchestrator with the default (no-op) accounting backend.
pub async fn run(config: AppConfig) -> Result<()> {
    run_with_accounting(config, Arc::new(NoopAccounting)).await
}

/// Main server orchestrator with an injected accounting backend.
///
/// Architecture: each enabled listener runs as an independent task sharing
/// one cancellation token. A listener that fails to start (bad address,
/// bind error) is fatal to that listener only; the others keep serving.
pub async fn run_with_accounting(
    mut config: AppConfig,
    accounting: Arc<dyn SessionAccounting>,
) -> Result<()> {
    // Invalid values fail startup of that component only
    for (component, error) in crate::config::enabled_component_errors(&config) {
        error!(component = component, error = %error, "Component configuration invalid, disabling");
        match component {
            "socks5" => config.socks5.enabled = false,
            "connect" => config.connect.enabled = false,
            "websocket" => config.websocket.enabled = false,
            _ => {}
        }
    }
    if !config.socks5.enabled && !config.connect.enabled && !config.websocket.enabled {
        anyhow::bail!("no usable listener: every component is disabled or misconfigured");
    }

    let config = Arc::new(config);
    let ctx = Arc::new(AppContext::new(config.clone(), accounting));

    // Global shutdown token, tripped by signals
    let shutdown = CancellationToken::new();
    // Token observed by the listeners
    let services_shutdown = CancellationToken::new();

    let _socks_handle = spawn_socks5_server(&ctx, services_shutdown.clone());
    let _connect_handle = spawn_connect_proxy(&ctx, services_shutdown.clone());
    let _ws_handle = spawn_ws_bridge(&ctx, services_shutdown.clone());

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            handle_signals(shutdown).await;
        });
    }

    info!(
        socks5 = config.socks5.enabled,
        connect = config.connect.enabled,
        websocket = config.websocket.enabled,
        "All enabled services started"
    );

    // Wait for a shutdown signal, then drain
    shutdown.cancelled().await;

    let shutdown_timeout = config.limits.shutdown_timeout;
    info!(timeout = shutdown_timeout, "Initiating graceful shutdown");
    services_shutdown.cancel();

    // Tear down active tunnel sessions; each bridge task kills its own
    // SSH subprocess when its token fires.
    ctx.tunnels.cancel_all();

    let drain_deadline =
        tokio::time::Instant::now() + std::time::Duration::from_secs(shutdown_timeout);
    loop {
        let active = ctx.active_connections();
        if active == 0 {
            info!("All connections drained");
            break;
        }
        if tokio::time::Instant::now() >= drain_deadline {
            warn!(active_connections = active, "Shutdown timeout reached, forcing exit");
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }

    info!("Graceful shutdown complete");
    Ok(())
}

/// Spawn the SOCKS5 server task (if enabled)
fn spawn_socks5_server(
    ctx: &Arc<AppContext>,
    shutdown: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if !ctx.config.socks5.enabled {
        return None;
    }
    let listen = ctx.config.socks5.listen.clone();
    let ctx = ctx.clone();
    Some(tokio::spawn(async move {
        if let Err(e) = crate::socks::start_socks5_server(&listen, ctx, shutdown).await {
            error!(error = %e, addr = %listen, "SOCKS5 server error");
        }
    }))
}

/// Spawn the HTTP CONNECT proxy task (if enabled)
fn spawn_connect_proxy(
    ctx: &Arc<AppContext>,
    shutdown: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if !ctx.config.connect.enabled {
        return None;
    }
    let listen = ctx.config.connect.listen.clone();
    let ctx = ctx.clone();
    Some(tokio::spawn(async move {
        if let Err(e) = crate::http::start_connect_proxy(&listen, ctx, shutdown).await {
            error!(error = %e, addr = %listen, "CONNECT proxy error");
        }
    }))
}

/// Spawn the WebSocket bridge task (if enabled)
fn spawn_ws_bridge(
    ctx: &Arc<AppContext>,
    shutdown: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    if !ctx.config.websocket.enabled {
        return None;
    }
    let listen = ctx.config.websocket.listen.clone();
    let ctx = ctx.clone();
    Some(tokio::spawn(async move {
        if let Err(e) = crate::ws::start_ws_bridge(&listen, ctx, shutdown).await {
            error!(error = %e, addr = %listen, "WebSocket bridge error");
        }
    }))
}

#[cfg(unix)]
async fn handle_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to install SIGINT handler");
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("SIGTERM received, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            info!("SIGINT received, initiating graceful shutdown");
        }
    }
    shutdown.cancel();
}

#[cfg(not(unix))]
async fn handle_signals(shutdown: CancellationToken) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Ctrl-C received, initiating graceful shutdown");
        shutdown.cancel();
    }
}
