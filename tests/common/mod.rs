#![allow(dead_code)]

use portway::config::types::AppConfig;
use portway::context::AppContext;
use portway::usage::{AccountingDecision, SessionAccounting};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Get an OS-assigned free port
pub async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a TCP echo server; returns its address. The task runs until the
/// test process exits.
pub async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Build an app context over the given config with no-op accounting.
pub fn test_context(config: AppConfig) -> Arc<AppContext> {
    Arc::new(AppContext::new(
        Arc::new(config),
        Arc::new(portway::usage::NoopAccounting),
    ))
}

/// Build an app context with a recording accounting backend.
pub fn test_context_with_accounting(
    config: AppConfig,
    accounting: Arc<RecordingAccounting>,
) -> Arc<AppContext> {
    Arc::new(AppContext::new(Arc::new(config), accounting))
}

/// One `end_session` record: (session_id, bytes_in, bytes_out).
pub type EndRecord = (String, u64, u64);

/// Accounting backend that records calls and can be told to deny.
#[derive(Default)]
pub struct RecordingAccounting {
    pub deny_reason: Option<String>,
    counter: AtomicU64,
    pub begins: Mutex<Vec<(String, String, String)>>,
    pub ends: Mutex<Vec<EndRecord>>,
}

impl RecordingAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn denying(reason: &str) -> Self {
        Self {
            deny_reason: Some(reason.to_string()),
            ..Self::default()
        }
    }
}

impl SessionAccounting for RecordingAccounting {
    fn begin_session(&self, user: &str, service: &str, ip: &str) -> AccountingDecision {
        self.begins
            .lock()
            .unwrap()
            .push((user.to_string(), service.to_string(), ip.to_string()));
        match &self.deny_reason {
            Some(reason) => AccountingDecision::Denied(reason.clone()),
            None => {
                let id = self.counter.fetch_add(1, Ordering::Relaxed);
                AccountingDecision::Allowed(format!("acct-{}", id))
            }
        }
    }

    fn end_session(&self, session_id: &str, bytes_in: u64, bytes_out: u64) {
        self.ends
            .lock()
            .unwrap()
            .push((session_id.to_string(), bytes_in, bytes_out));
    }
}
