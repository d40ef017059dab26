use crate::config::types::AppConfig;
use crate::session::TunnelRegistry;
use crate::usage::SessionAccounting;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared application context, replacing scattered Arc parameters
pub struct AppContext {
    pub config: Arc<AppConfig>,
    pub tunnels: TunnelRegistry,
    pub accounting: Arc<dyn SessionAccounting>,
    pub start_time: Instant,
    active_connections: AtomicU32,
}

impl AppContext {
    pub fn new(config: Arc<AppConfig>, accounting: Arc<dyn SessionAccounting>) -> Self {
        Self {
            config,
            tunnels: TunnelRegistry::new(),
            accounting,
            start_time: Instant::now(),
            active_connections: AtomicU32::new(0),
        }
    }

    /// Track a live connection; the returned guard decrements on drop.
    pub fn track_connection(self: &Arc<Self>) -> ConnectionGuard {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        ConnectionGuard { ctx: self.clone() }
    }

    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Relaxed)
    }
}

/// RAII guard for the live-connection counter used by the shutdown drain.
pub struct ConnectionGuard {
    ctx: Arc<AppContext>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.ctx.active_connections.fetch_sub(1, Ordering::Relaxed);
    }
}
