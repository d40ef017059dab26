//! SSH dynamic-forward launcher.
//!
//! Leases a loopback port, spawns an external `ssh` client with dynamic
//! SOCKS forwarding (`-D`) on that port, and confirms readiness before
//! handing the tunnel to the bridge. No SSH protocol work happens in this
//! process; the child owns the cryptography.
//!
//! Lifecycle: IDLE → PORT_LEASED → PROCESS_STARTED → READY | FAILED.
//! A FAILED launch always terminates and reaps the child; there is no retry.

use crate::config::types::SshConfig;
use anyhow::{Context, Result};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// An ephemeral loopback port obtained by bind-then-release.
///
/// Between the release and the ssh client's own bind another process could
/// claim the port; the launcher's liveness + connect probe turns that race
/// into a FAILED launch instead of silent misrouting.
#[derive(Debug, Clone, Copy)]
pub struct PortLease {
    port: u16,
}

impl PortLease {
    /// Ask the OS for a free loopback port and release it immediately.
    pub fn acquire() -> Result<Self> {
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .context("leasing a loopback port")?;
        let port = listener
            .local_addr()
            .context("reading leased port")?
            .port();
        drop(listener);
        Ok(Self { port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// A running SSH dynamic-forward subprocess and the port it serves.
pub struct SshTunnel {
    child: Child,
    port: u16,
}

impl SshTunnel {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Kill the subprocess and reap it. Safe to call on an already-dead child.
    pub async fn terminate(mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "ssh client already gone on terminate");
        }
        match self.child.wait().await {
            Ok(status) => debug!(status = %status, "ssh client reaped"),
            Err(e) => warn!(error = %e, "failed to reap ssh client"),
        }
    }
}

/// Launch the SSH client and wait until the forward port is usable.
///
/// Both checks must pass: the child is still alive AND the leased port
/// accepts a bare TCP connection. Either failing terminates the child and
/// returns an error.
pub async fn launch(cfg: &SshConfig) -> Result<SshTunnel> {
    let lease = PortLease::acquire()?;
    let port = lease.port();

    let (program, args) = build_invocation(cfg, port);
    debug!(program = %program.display(), local_port = port, "Spawning ssh client");

    let mut child = Command::new(&program)
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning ssh client '{}'", program.display()))?;

    // Give the client time to authenticate and bind the forward
    tokio::time::sleep(Duration::from_millis(cfg.settle_delay_ms)).await;

    match probe_ready(&mut child, port, cfg).await {
        Ok(()) => {
            info!(
                local_port = port,
                target = %format!("{}@{}:{}", cfg.user, cfg.host, cfg.port),
                "SSH tunnel ready"
            );
            Ok(SshTunnel { child, port })
        }
        Err(e) => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            Err(e)
        }
    }
}

/// Build the program + argument vector for the ssh invocation.
///
/// Key-file credentials run `ssh -i <key> ...` with BatchMode so a passphrase
/// prompt can never hang the launcher; password credentials wrap the same
/// command line in `sshpass -p`.
fn build_invocation(cfg: &SshConfig, local_port: u16) -> (PathBuf, Vec<String>) {
    let mut ssh_args = vec![
        "-N".to_string(),
        "-D".to_string(),
        format!("127.0.0.1:{}", local_port),
        "-p".to_string(),
        cfg.port.to_string(),
        "-o".to_string(),
        "StrictHostKeyChecking=no".to_string(),
        "-o".to_string(),
        "UserKnownHostsFile=/dev/null".to_string(),
        "-o".to_string(),
        "ExitOnForwardFailure=yes".to_string(),
    ];

    let use_key = cfg.key_path.is_some();
    if let Some(ref key) = cfg.key_path {
        ssh_args.push("-o".to_string());
        ssh_args.push("BatchMode=yes".to_string());
        ssh_args.push("-i".to_string());
        ssh_args.push(key.display().to_string());
    }
    ssh_args.push(format!("{}@{}", cfg.user, cfg.host));

    match (&cfg.password, use_key) {
        (Some(password), false) => {
            let mut args = vec![
                "-p".to_string(),
                password.clone(),
                cfg.ssh_binary.display().to_string(),
            ];
            args.extend(ssh_args);
            (cfg.sshpass_binary.clone(), args)
        }
        _ => (cfg.ssh_binary.clone(), ssh_args),
    }
}

/// Bounded readiness probe: the child must stay alive and the leased port
/// must accept a TCP connection within the configured attempts.
async fn probe_ready(child: &mut Child, port: u16, cfg: &SshConfig) -> Result<()> {
    for attempt in 1..=cfg.probe_attempts {
        if let Some(status) = child.try_wait().context("polling ssh client")? {
            anyhow::bail!("ssh client exited before becoming ready ({})", status);
        }
        match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
            Ok(_) => {
                debug!(local_port = port, attempt = attempt, "Forward port accepting");
                return Ok(());
            }
            Err(e) => {
                debug!(local_port = port, attempt = attempt, error = %e, "Probe attempt failed");
            }
        }
        tokio::time::sleep(Duration::from_millis(cfg.probe_interval_ms)).await;
    }
    anyhow::bail!(
        "forward port 127.0.0.1:{} not ready after {} attempts",
        port,
        cfg.probe_attempts
    )
}
