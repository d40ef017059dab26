use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Serializable snapshot of an active tunnel session.
#[derive(Debug, Clone, Serialize)]
pub struct TunnelSnapshot {
    pub session_id: String,
    pub peer: String,
    pub template: String,
    pub local_port: u16,
    pub started_at: DateTime<Utc>,
    pub bytes_up: u64,
    pub bytes_down: u64,
}

/// Live state of one WebSocket-SSH tunnel session.
///
/// Created when the bridge enters BRIDGING and removed on teardown; the SSH
/// child process itself stays owned by the bridge task, which watches
/// `cancel` so the registry can force a teardown without touching the
/// process handle from another task.
pub struct TunnelSession {
    pub session_id: String,
    pub peer: String,
    pub template: String,
    pub local_port: u16,
    pub started_at: DateTime<Utc>,
    pub bytes_up: AtomicU64,
    pub bytes_down: AtomicU64,
    pub cancel: CancellationToken,
}

impl TunnelSession {
    pub fn snapshot(&self) -> TunnelSnapshot {
        TunnelSnapshot {
            session_id: self.session_id.clone(),
            peer: self.peer.clone(),
            template: self.template.clone(),
            local_port: self.local_port,
            started_at: self.started_at,
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
        }
    }
}

/// Shared registry of active tunnel sessions.
///
/// All cross-session state lives here; every access goes through the
/// concurrent map, never through bare shared fields.
#[derive(Default)]
pub struct TunnelRegistry {
    sessions: DashMap<String, Arc<TunnelSession>>,
    counter: AtomicU64,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new tunnel session and return its handle.
    pub fn register(&self, peer: &str, template: &str, local_port: u16) -> Arc<TunnelSession> {
        let id = self.counter.fetch_add(1, Ordering::Relaxed);
        let session_id = format!("t{}", id);
        let session = Arc::new(TunnelSession {
            session_id: session_id.clone(),
            peer: peer.to_string(),
            template: template.to_string(),
            local_port,
            started_at: Utc::now(),
            bytes_up: AtomicU64::new(0),
            bytes_down: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        });
        self.sessions.insert(session_id, session.clone());
        session
    }

    /// Remove a session by ID. Idempotent.
    pub fn unregister(&self, session_id: &str) {
        self.sessions.remove(session_id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshots of all active sessions.
    pub fn snapshots(&self) -> Vec<TunnelSnapshot> {
        self.sessions.iter().map(|e| e.value().snapshot()).collect()
    }

    /// Cancel every active session. Each bridge task observes its token,
    /// kills its SSH subprocess, and unregisters itself.
    pub fn cancel_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_assigns_sequential_ids() {
        let registry = TunnelRegistry::new();
        let a = registry.register("1.2.3.4:5000", "nginx", 40001);
        let b = registry.register("1.2.3.4:5001", "nginx", 40002);
        assert_ne!(a.session_id, b.session_id);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_unregister_removes_entry() {
        let registry = TunnelRegistry::new();
        let s = registry.register("peer", "default", 40000);
        registry.unregister(&s.session_id);
        assert!(registry.is_empty());
        // Idempotent
        registry.unregister(&s.session_id);
    }

    #[test]
    fn test_snapshot_reflects_byte_counters() {
        let registry = TunnelRegistry::new();
        let s = registry.register("peer", "cloudflare", 40000);
        s.bytes_up.fetch_add(100, Ordering::Relaxed);
        s.bytes_down.fetch_add(42, Ordering::Relaxed);

        let snaps = registry.snapshots();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].bytes_up, 100);
        assert_eq!(snaps[0].bytes_down, 42);
        assert_eq!(snaps[0].template, "cloudflare");
    }

    #[test]
    fn test_cancel_all_cancels_every_token() {
        let registry = TunnelRegistry::new();
        let a = registry.register("p1", "nginx", 1);
        let b = registry.register("p2", "nginx", 2);
        assert!(!a.cancel.is_cancelled());
        registry.cancel_all();
        assert!(a.cancel.is_cancelled());
        assert!(b.cancel.is_cancelled());
    }

    #[test]
    fn test_concurrent_register_unregister() {
        let registry = Arc::new(TunnelRegistry::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = registry.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    let s = reg.register("peer", "nginx", 0);
                    reg.unregister(&s.session_id);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(registry.is_empty());
    }
}
