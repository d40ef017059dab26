pub mod env;
pub mod types;

use anyhow::{Context, Result};
use std::path::Path;
use types::AppConfig;

/// Maximum config file size (1 MB)
const MAX_CONFIG_SIZE: u64 = 1_048_576;

/// Load configuration from a TOML file and validate the global sections.
///
/// Per-component sections are validated by the supervisor when each listener
/// starts; an invalid component disables that listener only.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let metadata = std::fs::metadata(path)
        .with_context(|| format!("reading config metadata: {}", path.display()))?;
    if metadata.len() > MAX_CONFIG_SIZE {
        anyhow::bail!(
            "config file too large: {} bytes (max {} bytes)",
            metadata.len(),
            MAX_CONFIG_SIZE
        );
    }

    // Warn if the file is world-readable; it may carry an SSH password
    check_config_file_permissions(path);

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading config: {}", path.display()))?;
    parse_config(&content)
}

/// On Unix, warn if the config file is readable by group or others,
/// since it may contain the SSH tunnel password.
#[cfg(unix)]
fn check_config_file_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::metadata(path) {
        Ok(meta) => {
            let mode = meta.permissions().mode();
            if mode & 0o077 != 0 {
                tracing::warn!(
                    path = %path.display(),
                    mode = format!("{:04o}", mode & 0o7777),
                    "Config file is readable by group/others. \
                     Consider restricting permissions to 0600 (owner read/write only) \
                     since it may contain secrets."
                );
            }
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "Could not check config file permissions"
            );
        }
    }
}

#[cfg(not(unix))]
fn check_config_file_permissions(_path: &Path) {
    // Permission checks are only available on Unix systems
}

/// Parse configuration from a TOML string and validate the global sections.
pub fn parse_config(content: &str) -> Result<AppConfig> {
    let config: AppConfig = toml::from_str(content).context("parsing TOML configuration")?;
    validate_globals(&config)?;
    Ok(config)
}

/// Validate an already-constructed AppConfig (e.g. built from env vars).
pub fn parse_config_validate(config: &AppConfig) -> Result<()> {
    validate_globals(config)
}

/// Validate the sections shared by all components. Anything wrong here is
/// an operator error that should fail the whole process.
fn validate_globals(config: &AppConfig) -> Result<()> {
    if config.limits.max_connections == 0 {
        anyhow::bail!("limits.max_connections must be > 0");
    }
    if config.limits.connect_timeout == 0 {
        anyhow::bail!("limits.connect_timeout must be > 0");
    }
    let timeout = config.limits.handshake_timeout;
    if !(5..=120).contains(&timeout) {
        anyhow::bail!(
            "limits.handshake_timeout must be between 5 and 120 (got {})",
            timeout
        );
    }
    Ok(())
}

/// Validate the SOCKS5 section. Called when the listener starts; an error
/// disables that listener only.
pub fn validate_socks5(config: &AppConfig) -> Result<()> {
    validate_listen_addr("socks5.listen", &config.socks5.listen)
}

/// Validate the CONNECT proxy section.
pub fn validate_connect(config: &AppConfig) -> Result<()> {
    validate_listen_addr("connect.listen", &config.connect.listen)
}

/// Validate the WebSocket bridge section together with its SSH target.
pub fn validate_websocket(config: &AppConfig) -> Result<()> {
    validate_listen_addr("websocket.listen", &config.websocket.listen)?;

    let ssh = &config.ssh;
    if ssh.host.is_empty() {
        anyhow::bail!("ssh.host must be set when the websocket bridge is enabled");
    }
    if ssh.user.is_empty() {
        anyhow::bail!("ssh.user must be set when the websocket bridge is enabled");
    }
    if ssh.key_path.is_none() && ssh.password.is_none() {
        anyhow::bail!(
            "ssh.key_path or ssh.password must be set when the websocket bridge is enabled"
        );
    }
    if let Some(ref key) = ssh.key_path {
        if !key.exists() {
            anyhow::bail!("ssh.key_path not found: {}", key.display());
        }
    }
    if ssh.probe_attempts == 0 {
        anyhow::bail!("ssh.probe_attempts must be >= 1");
    }

    for template in &config.websocket.templates {
        if template.name.is_empty() {
            anyhow::bail!("websocket.templates entry has empty name");
        }
        for (name, _) in &template.headers {
            if name.trim().is_empty() || name.contains([':', '\r', '\n']) {
                anyhow::bail!(
                    "template '{}' has invalid header name '{}'",
                    template.name,
                    name
                );
            }
        }
    }

    let known_default = crate::ws::handshake::BUILTIN_TEMPLATE_NAMES
        .contains(&config.websocket.default_template.as_str())
        || config
            .websocket
            .templates
            .iter()
            .any(|t| t.name == config.websocket.default_template);
    if !known_default {
        anyhow::bail!(
            "websocket.default_template '{}' does not name a built-in or configured template",
            config.websocket.default_template
        );
    }

    Ok(())
}

/// Validation errors for every enabled component, as (component, error) pairs.
pub fn enabled_component_errors(config: &AppConfig) -> Vec<(&'static str, anyhow::Error)> {
    let mut errors = Vec::new();
    if config.socks5.enabled {
        if let Err(e) = validate_socks5(config) {
            errors.push(("socks5", e));
        }
    }
    if config.connect.enabled {
        if let Err(e) = validate_connect(config) {
            errors.push(("connect", e));
        }
    }
    if config.websocket.enabled {
        if let Err(e) = validate_websocket(config) {
            errors.push(("websocket", e));
        }
    }
    errors
}

fn validate_listen_addr(field: &str, addr: &str) -> Result<()> {
    if addr.is_empty() {
        anyhow::bail!("{} must not be empty", field);
    }
    addr.parse::<std::net::SocketAddr>()
        .with_context(|| format!("{}: invalid listen address '{}'", field, addr))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_config_uses_defaults() {
        let config = parse_config("").unwrap();
        assert!(config.socks5.enabled);
        assert_eq!(config.socks5.listen, "0.0.0.0:1080");
        assert!(config.connect.enabled);
        assert_eq!(config.connect.listen, "0.0.0.0:8888");
        assert!(!config.websocket.enabled);
        assert_eq!(config.limits.idle_timeout, 60);
        assert_eq!(config.limits.max_connections, 1000);
        assert_eq!(config.logging.level, types::LogLevel::Info);
        assert_eq!(config.logging.format, types::LogFormat::Pretty);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r##"
[socks5]
enabled = true
listen = "127.0.0.1:1080"

[connect]
enabled = false

[websocket]
enabled = true
listen = "127.0.0.1:8080"
default_template = "cloudflare"

[[websocket.templates]]
name = "custom"
agents = ["MyAgent"]
headers = [["Server", "custom/1.0"], ["X-Robots-Tag", "none"]]

[ssh]
host = "tunnel.example.com"
port = 2222
user = "forward"
password = "secret"
settle_delay_ms = 500
probe_attempts = 3

[limits]
max_connections = 64
idle_timeout = 30
handshake_timeout = 10

[logging]
level = "debug"
format = "json"
"##;
        let config = parse_config(toml).unwrap();
        assert_eq!(config.socks5.listen, "127.0.0.1:1080");
        assert!(!config.connect.enabled);
        assert!(config.websocket.enabled);
        assert_eq!(config.websocket.templates.len(), 1);
        assert_eq!(config.websocket.templates[0].headers.len(), 2);
        assert_eq!(config.ssh.port, 2222);
        assert_eq!(config.ssh.probe_attempts, 3);
        assert_eq!(config.limits.max_connections, 64);
        assert_eq!(config.logging.level, types::LogLevel::Debug);
        assert!(enabled_component_errors(&config).is_empty());
    }

    #[test]
    fn test_invalid_listen_addr_flags_component_only() {
        let config = parse_config("[socks5]\nlisten = \"not-an-address\"\n").unwrap();
        let errors = enabled_component_errors(&config);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].0, "socks5");
    }

    #[test]
    fn test_websocket_requires_ssh_target() {
        let config = parse_config("[websocket]\nenabled = true\n").unwrap();
        let err = validate_websocket(&config).unwrap_err();
        assert!(
            err.to_string().contains("ssh.host"),
            "error should mention ssh.host: {}",
            err
        );
    }

    #[test]
    fn test_websocket_requires_credentials() {
        let toml = r#"
[websocket]
enabled = true

[ssh]
host = "example.com"
user = "forward"
"#;
        let config = parse_config(toml).unwrap();
        let err = validate_websocket(&config).unwrap_err();
        assert!(err.to_string().contains("key_path or ssh.password"));
    }

    #[test]
    fn test_missing_key_file_flagged() {
        let toml = r#"
[websocket]
enabled = true

[ssh]
host = "example.com"
user = "forward"
key_path = "/nonexistent/portway-test-key"
"#;
        let config = parse_config(toml).unwrap();
        assert!(validate_websocket(&config).is_err());
    }

    #[test]
    fn test_unknown_default_template_flagged() {
        let toml = r#"
[websocket]
enabled = true
default_template = "no-such-template"

[ssh]
host = "example.com"
user = "forward"
password = "secret"
"#;
        let config = parse_config(toml).unwrap();
        let err = validate_websocket(&config).unwrap_err();
        assert!(err.to_string().contains("default_template"));
    }

    #[test]
    fn test_configured_template_can_be_default() {
        let toml = r#"
[websocket]
enabled = true
default_template = "mine"

[[websocket.templates]]
name = "mine"
headers = [["Server", "mine/1.0"]]

[ssh]
host = "example.com"
user = "forward"
password = "secret"
"#;
        let config = parse_config(toml).unwrap();
        assert!(validate_websocket(&config).is_ok());
    }

    #[test]
    fn test_handshake_timeout_bounds() {
        assert!(parse_config("[limits]\nhandshake_timeout = 2\n").is_err());
        assert!(parse_config("[limits]\nhandshake_timeout = 600\n").is_err());
        assert!(parse_config("[limits]\nhandshake_timeout = 30\n").is_ok());
    }

    #[test]
    fn test_zero_max_connections_rejected() {
        assert!(parse_config("[limits]\nmax_connections = 0\n").is_err());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        assert!(parse_config("[logging]\nlevel = \"verbose\"\n").is_err());
    }

    #[test]
    fn test_invalid_header_name_flagged() {
        let toml = r#"
[websocket]
enabled = true

[[websocket.templates]]
name = "bad"
headers = [["Ser:ver", "x"]]

[ssh]
host = "example.com"
user = "forward"
password = "secret"
"#;
        let config = parse_config(toml).unwrap();
        assert!(validate_websocket(&config).is_err());
    }

    #[test]
    fn test_disabled_component_not_validated() {
        // Broken socks5 listen, but the component is off
        let config = parse_config("[socks5]\nenabled = false\nlisten = \"nope\"\n").unwrap();
        assert!(enabled_component_errors(&config).is_empty());
    }
}
