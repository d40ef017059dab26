//! Environment variable configuration support.
//!
//! Provides three modes:
//! 1. `PORTWAY_CONFIG` env var to specify the config file path (handled by the CLI)
//! 2. Full config from env vars (container mode, no file needed)
//! 3. Hybrid: file + env var overrides

use crate::config::types::*;
use std::path::PathBuf;

/// Env vars that mark an intentional env-driven deployment. If any is set,
/// portway will run without a config file.
const ENV_CONFIG_MARKERS: &[&str] = &[
    "PORTWAY_SOCKS5_LISTEN",
    "PORTWAY_SOCKS5_ENABLED",
    "PORTWAY_CONNECT_LISTEN",
    "PORTWAY_CONNECT_ENABLED",
    "PORTWAY_WEBSOCKET_LISTEN",
    "PORTWAY_WEBSOCKET_ENABLED",
];

/// Check if enough env vars are set to build a config without a file.
pub fn can_build_from_env() -> bool {
    ENV_CONFIG_MARKERS.iter().any(|k| opt_env(k).is_some())
}

/// Build a complete AppConfig from environment variables.
pub fn build_config_from_env() -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::default();
    apply_env_overrides(&mut config)?;
    clear_sensitive_env_vars();
    Ok(config)
}

/// Apply environment variable overrides to an existing config (hybrid mode).
/// Only overrides values for which an env var is set. The SSH password
/// supports the `_FILE` convention for container secrets.
pub fn apply_env_overrides(config: &mut AppConfig) -> anyhow::Result<()> {
    // SOCKS5 listener
    if std::env::var("PORTWAY_SOCKS5_ENABLED").is_ok() {
        config.socks5.enabled = parse_bool_env("PORTWAY_SOCKS5_ENABLED", config.socks5.enabled);
    }
    if let Some(v) = opt_env("PORTWAY_SOCKS5_LISTEN") {
        config.socks5.listen = v;
    }

    // CONNECT proxy listener
    if std::env::var("PORTWAY_CONNECT_ENABLED").is_ok() {
        config.connect.enabled = parse_bool_env("PORTWAY_CONNECT_ENABLED", config.connect.enabled);
    }
    if let Some(v) = opt_env("PORTWAY_CONNECT_LISTEN") {
        config.connect.listen = v;
    }

    // WebSocket bridge listener
    if std::env::var("PORTWAY_WEBSOCKET_ENABLED").is_ok() {
        config.websocket.enabled =
            parse_bool_env("PORTWAY_WEBSOCKET_ENABLED", config.websocket.enabled);
    }
    if let Some(v) = opt_env("PORTWAY_WEBSOCKET_LISTEN") {
        config.websocket.listen = v;
    }
    if let Some(v) = opt_env("PORTWAY_DEFAULT_TEMPLATE") {
        config.websocket.default_template = v;
    }

    // SSH tunnel target
    if let Some(v) = opt_env("PORTWAY_SSH_HOST") {
        config.ssh.host = v;
    }
    if std::env::var("PORTWAY_SSH_PORT").is_ok() {
        config.ssh.port = parse_env("PORTWAY_SSH_PORT", config.ssh.port);
    }
    if let Some(v) = opt_env("PORTWAY_SSH_USER") {
        config.ssh.user = v;
    }
    if let Some(v) = opt_env("PORTWAY_SSH_KEY_PATH") {
        config.ssh.key_path = Some(PathBuf::from(v));
    }
    if let Some(v) = resolve_env_or_file("PORTWAY_SSH_PASSWORD")? {
        config.ssh.password = Some(v);
    }
    if let Some(v) = opt_env("PORTWAY_SSH_BINARY") {
        config.ssh.ssh_binary = PathBuf::from(v);
    }
    if let Some(v) = opt_env("PORTWAY_SSHPASS_BINARY") {
        config.ssh.sshpass_binary = PathBuf::from(v);
    }
    if std::env::var("PORTWAY_SETTLE_DELAY_MS").is_ok() {
        config.ssh.settle_delay_ms =
            parse_env("PORTWAY_SETTLE_DELAY_MS", config.ssh.settle_delay_ms);
    }
    if std::env::var("PORTWAY_PROBE_ATTEMPTS").is_ok() {
        config.ssh.probe_attempts = parse_env("PORTWAY_PROBE_ATTEMPTS", config.ssh.probe_attempts);
    }
    if std::env::var("PORTWAY_PROBE_INTERVAL_MS").is_ok() {
        config.ssh.probe_interval_ms =
            parse_env("PORTWAY_PROBE_INTERVAL_MS", config.ssh.probe_interval_ms);
    }

    // Limits
    if std::env::var("PORTWAY_MAX_CONNECTIONS").is_ok() {
        config.limits.max_connections =
            parse_env("PORTWAY_MAX_CONNECTIONS", config.limits.max_connections);
    }
    if std::env::var("PORTWAY_IDLE_TIMEOUT").is_ok() {
        config.limits.idle_timeout = parse_env("PORTWAY_IDLE_TIMEOUT", config.limits.idle_timeout);
    }
    if std::env::var("PORTWAY_HANDSHAKE_TIMEOUT").is_ok() {
        config.limits.handshake_timeout = parse_env(
            "PORTWAY_HANDSHAKE_TIMEOUT",
            config.limits.handshake_timeout,
        );
    }
    if std::env::var("PORTWAY_CONNECT_TIMEOUT").is_ok() {
        config.limits.connect_timeout =
            parse_env("PORTWAY_CONNECT_TIMEOUT", config.limits.connect_timeout);
    }
    if std::env::var("PORTWAY_SHUTDOWN_TIMEOUT").is_ok() {
        config.limits.shutdown_timeout =
            parse_env("PORTWAY_SHUTDOWN_TIMEOUT", config.limits.shutdown_timeout);
    }

    // Logging
    if let Some(v) = opt_env("PORTWAY_LOG_LEVEL") {
        config.logging.level = parse_log_level(&v)?;
    }
    if let Some(v) = opt_env("PORTWAY_LOG_FORMAT") {
        config.logging.format = parse_log_format(&v)?;
    }

    Ok(())
}

/// Clear sensitive environment variables after they have been read.
/// Limits exposure via /proc/pid/environ or similar process inspection.
fn clear_sensitive_env_vars() {
    for key in ["PORTWAY_SSH_PASSWORD", "PORTWAY_SSH_PASSWORD_FILE"] {
        if std::env::var_os(key).is_some() {
            // SAFETY: only removes vars in our own PORTWAY_ namespace. There
            // is an inherent race if other threads read concurrently, but
            // this runs once at startup before the runtime spins up.
            unsafe {
                std::env::remove_var(key);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn opt_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Resolve a value from an env var, with _FILE fallback for container secrets.
/// Priority: direct env var > _FILE (file content, trimmed) > None.
fn resolve_env_or_file(key: &str) -> anyhow::Result<Option<String>> {
    if let Some(val) = opt_env(key) {
        return Ok(Some(val));
    }
    let file_key = format!("{key}_FILE");
    if let Some(path) = opt_env(&file_key) {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("reading {file_key}={path}: {e}"))?;
        let trimmed = content.trim().to_string();
        if trimmed.is_empty() {
            anyhow::bail!("{file_key}={path} is empty");
        }
        return Ok(Some(trimmed));
    }
    Ok(None)
}

fn parse_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    opt_env(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_bool_env(key: &str, default: bool) -> bool {
    opt_env(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn parse_log_level(s: &str) -> anyhow::Result<LogLevel> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Ok(LogLevel::Trace),
        "debug" => Ok(LogLevel::Debug),
        "info" => Ok(LogLevel::Info),
        "warn" => Ok(LogLevel::Warn),
        "error" => Ok(LogLevel::Error),
        _ => anyhow::bail!("invalid log level: '{s}'"),
    }
}

fn parse_log_format(s: &str) -> anyhow::Result<LogFormat> {
    match s.to_ascii_lowercase().as_str() {
        "pretty" => Ok(LogFormat::Pretty),
        "json" => Ok(LogFormat::Json),
        _ => anyhow::bail!("invalid log format: '{s}'"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Env var tests must run serially since they mutate process state
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env_vars<F: FnOnce()>(vars: &[(&str, &str)], f: F) {
        let _lock = ENV_LOCK.lock().unwrap();
        for (k, v) in vars {
            std::env::set_var(k, v);
        }
        f();
        for (k, _) in vars {
            std::env::remove_var(k);
        }
        // Also clean up vars the code under test may have consumed
        for key in [
            "PORTWAY_SOCKS5_LISTEN",
            "PORTWAY_SOCKS5_ENABLED",
            "PORTWAY_CONNECT_LISTEN",
            "PORTWAY_CONNECT_ENABLED",
            "PORTWAY_WEBSOCKET_LISTEN",
            "PORTWAY_WEBSOCKET_ENABLED",
            "PORTWAY_SSH_HOST",
            "PORTWAY_SSH_USER",
            "PORTWAY_SSH_PASSWORD",
            "PORTWAY_SSH_PASSWORD_FILE",
            "PORTWAY_LOG_LEVEL",
            "PORTWAY_LOG_FORMAT",
            "PORTWAY_IDLE_TIMEOUT",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn test_can_build_from_env_false_when_empty() {
        with_env_vars(&[], || {
            assert!(!can_build_from_env());
        });
    }

    #[test]
    fn test_can_build_from_env_with_listener() {
        with_env_vars(&[("PORTWAY_SOCKS5_LISTEN", "127.0.0.1:1080")], || {
            assert!(can_build_from_env());
        });
    }

    #[test]
    fn test_build_config_minimal() {
        with_env_vars(&[("PORTWAY_SOCKS5_LISTEN", "127.0.0.1:9999")], || {
            let config = build_config_from_env().unwrap();
            assert_eq!(config.socks5.listen, "127.0.0.1:9999");
            // Untouched fields keep their defaults
            assert!(config.connect.enabled);
            assert_eq!(config.connect.listen, "0.0.0.0:8888");
        });
    }

    #[test]
    fn test_build_config_websocket_target() {
        with_env_vars(
            &[
                ("PORTWAY_WEBSOCKET_ENABLED", "true"),
                ("PORTWAY_WEBSOCKET_LISTEN", "0.0.0.0:8081"),
                ("PORTWAY_SSH_HOST", "tunnel.example.com"),
                ("PORTWAY_SSH_USER", "forward"),
                ("PORTWAY_SSH_PASSWORD", "hunter2"),
            ],
            || {
                let config = build_config_from_env().unwrap();
                assert!(config.websocket.enabled);
                assert_eq!(config.websocket.listen, "0.0.0.0:8081");
                assert_eq!(config.ssh.host, "tunnel.example.com");
                assert_eq!(config.ssh.password.as_deref(), Some("hunter2"));
                // Consumed secret must be gone from the environment
                assert!(std::env::var("PORTWAY_SSH_PASSWORD").is_err());
            },
        );
    }

    #[test]
    fn test_apply_env_overrides_on_file_config() {
        with_env_vars(
            &[
                ("PORTWAY_LOG_LEVEL", "debug"),
                ("PORTWAY_IDLE_TIMEOUT", "15"),
            ],
            || {
                let mut config: AppConfig = toml::from_str(
                    r#"
[socks5]
listen = "127.0.0.1:1080"

[logging]
level = "warn"
"#,
                )
                .unwrap();
                apply_env_overrides(&mut config).unwrap();
                assert_eq!(config.logging.level, LogLevel::Debug);
                assert_eq!(config.limits.idle_timeout, 15);
                // File value not shadowed by env stays
                assert_eq!(config.socks5.listen, "127.0.0.1:1080");
            },
        );
    }

    #[test]
    fn test_password_file_convention() {
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("ssh_password");
        std::fs::write(&secret_path, "  from-file  \n").unwrap();

        with_env_vars(
            &[(
                "PORTWAY_SSH_PASSWORD_FILE",
                secret_path.to_str().unwrap(),
            )],
            || {
                let mut config = AppConfig::default();
                apply_env_overrides(&mut config).unwrap();
                assert_eq!(config.ssh.password.as_deref(), Some("from-file"));
            },
        );
    }

    #[test]
    fn test_password_file_missing_fails() {
        with_env_vars(
            &[("PORTWAY_SSH_PASSWORD_FILE", "/nonexistent/secret")],
            || {
                let mut config = AppConfig::default();
                assert!(apply_env_overrides(&mut config).is_err());
            },
        );
    }

    #[test]
    fn test_invalid_log_level_fails() {
        with_env_vars(&[("PORTWAY_LOG_LEVEL", "loud")], || {
            let mut config = AppConfig::default();
            assert!(apply_env_overrides(&mut config).is_err());
        });
    }

    #[test]
    fn test_parse_bool_env_variants() {
        with_env_vars(&[("PORTWAY_TEST_BOOL", "true")], || {
            assert!(parse_bool_env("PORTWAY_TEST_BOOL", false));
        });
        with_env_vars(&[("PORTWAY_TEST_BOOL", "1")], || {
            assert!(parse_bool_env("PORTWAY_TEST_BOOL", false));
        });
        with_env_vars(&[("PORTWAY_TEST_BOOL", "yes")], || {
            assert!(parse_bool_env("PORTWAY_TEST_BOOL", false));
        });
        with_env_vars(&[("PORTWAY_TEST_BOOL", "false")], || {
            assert!(!parse_bool_env("PORTWAY_TEST_BOOL", true));
        });
    }
}
