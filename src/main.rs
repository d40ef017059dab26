use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use portway::cli::{Cli, Command};
use portway::config;
use portway::config::types::LogFormat;

fn setup_logging(level: &str, format: LogFormat) {
    portway::logging::setup_logging(level, format);
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Some(Command::CheckConfig) => {
            let cfg = config::load_config(&cli.config)?;
            let component_errors = config::enabled_component_errors(&cfg);
            if !component_errors.is_empty() {
                for (component, error) in &component_errors {
                    eprintln!("  [{}] {:#}", component, error);
                }
                anyhow::bail!(
                    "{} component(s) misconfigured",
                    component_errors.len()
                );
            }
            println!("Configuration is valid.");
            if cfg.socks5.enabled {
                println!("  SOCKS5 listen:    {}", cfg.socks5.listen);
            }
            if cfg.connect.enabled {
                println!("  CONNECT listen:   {}", cfg.connect.listen);
            }
            if cfg.websocket.enabled {
                println!("  WebSocket listen: {}", cfg.websocket.listen);
                println!(
                    "  SSH target:       {}@{}:{}",
                    cfg.ssh.user, cfg.ssh.host, cfg.ssh.port
                );
            }
            return Ok(());
        }
        Some(Command::Init { output }) => {
            std::fs::write(output, starter_config_toml())?;
            eprintln!("Configuration written to: {}", output.display());
            eprintln!();
            eprintln!("Start the server with:");
            eprintln!("  portway -c {}", output.display());
            return Ok(());
        }
        Some(Command::ShowConfig { format }) => {
            // Load config the same way the server does
            let app_config = load_effective_config(&cli)?;
            let redacted = redact_config(app_config);

            match format.as_str() {
                "json" => {
                    let json = serde_json::to_string_pretty(&redacted)?;
                    println!("{}", json);
                }
                "toml" => {
                    let toml_str = toml::to_string_pretty(&redacted)?;
                    println!("{}", toml_str);
                }
                _ => {
                    anyhow::bail!("unsupported format '{}' (available: toml, json)", format);
                }
            }
            return Ok(());
        }
        Some(Command::HealthCheck { addr, timeout }) => {
            use std::net::TcpStream;
            use std::time::Duration;

            let timeout = Duration::from_secs(*timeout);
            match TcpStream::connect_timeout(
                &addr.parse().unwrap_or_else(|_| {
                    eprintln!("Invalid address: {}", addr);
                    std::process::exit(1);
                }),
                timeout,
            ) {
                Ok(_) => {
                    println!("OK: {} is reachable", addr);
                    return Ok(());
                }
                Err(e) => {
                    eprintln!("FAIL: {} is not reachable: {}", addr, e);
                    std::process::exit(1);
                }
            }
        }
        None => {}
    }

    // Load config: file → env vars → error
    let app_config = load_effective_config(&cli)?;

    // Setup logging (CLI override > config)
    let log_level = cli
        .log_level
        .as_deref()
        .map(|s| s.to_string())
        .unwrap_or_else(|| app_config.logging.level.to_string());
    setup_logging(&log_level, app_config.logging.format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting portway relay suite"
    );

    // Run the async server
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        if let Err(e) = portway::server::run(app_config).await {
            error!(error = %e, "Server error");
            std::process::exit(1);
        }
    });

    Ok(())
}

/// Resolve the effective config: file with env overrides when the file
/// exists, pure env-var config otherwise, or a clear error.
fn load_effective_config(cli: &Cli) -> Result<config::types::AppConfig> {
    if cli.config.exists() {
        let mut cfg = config::load_config(&cli.config)?;
        config::env::apply_env_overrides(&mut cfg)?;
        config::parse_config_validate(&cfg)?;
        Ok(cfg)
    } else if config::env::can_build_from_env() {
        let cfg = config::env::build_config_from_env()?;
        config::parse_config_validate(&cfg)?;
        eprintln!("No config file found — using environment variables");
        Ok(cfg)
    } else {
        // Load anyway to produce a clear "file not found" error
        config::load_config(&cli.config)
    }
}

/// Replace the SSH password before printing the config.
fn redact_config(mut cfg: config::types::AppConfig) -> config::types::AppConfig {
    if cfg.ssh.password.is_some() {
        cfg.ssh.password = Some("***REDACTED***".to_string());
    }
    cfg
}

fn starter_config_toml() -> &'static str {
    r#"[socks5]
enabled = true
listen = "0.0.0.0:1080"

[connect]
enabled = true
listen = "0.0.0.0:8888"

[websocket]
enabled = false
listen = "0.0.0.0:8080"
default_template = "nginx"

# [[websocket.templates]]
# name = "custom"
# agents = ["MyClient"]
# headers = [["Server", "custom/1.0"]]

[ssh]
# Required when the websocket bridge is enabled
host = ""
port = 22
user = ""
# key_path = "/etc/portway/id_ed25519"
# password = ""
settle_delay_ms = 1500
probe_attempts = 10
probe_interval_ms = 200

[limits]
max_connections = 1000
idle_timeout = 60            # seconds, 0 = disabled
handshake_timeout = 30
connect_timeout = 10
shutdown_timeout = 30

[logging]
level = "info"
format = "pretty"
"#
}
