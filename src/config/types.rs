use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Log level enum (replaces stringly-typed field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

/// Log format enum (replaces stringly-typed field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Pretty => write!(f, "pretty"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub socks5: Socks5Config,
    #[serde(default)]
    pub connect: ConnectConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// SOCKS5 listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Socks5Config {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_socks5_listen")]
    pub listen: String,
}

impl Default for Socks5Config {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_socks5_listen(),
        }
    }
}

/// HTTP CONNECT proxy listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConnectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_connect_listen")]
    pub listen: String,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen: default_connect_listen(),
        }
    }
}

/// WebSocket-SSH bridge listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebSocketConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_websocket_listen")]
    pub listen: String,
    /// Template used when no agent hint matches. Must name a built-in or
    /// configured template.
    #[serde(default = "default_template_name")]
    pub default_template: String,
    /// Extra handshake templates, merged over the built-in set.
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: default_websocket_listen(),
            default_template: default_template_name(),
            templates: Vec::new(),
        }
    }
}

/// A named set of upgrade-response headers mimicking a server fingerprint.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TemplateConfig {
    pub name: String,
    /// Case-insensitive substrings matched against the client's User-Agent.
    #[serde(default)]
    pub agents: Vec<String>,
    /// Cosmetic headers, e.g. `[["Server", "nginx/1.24.0"]]`.
    #[serde(default)]
    pub headers: Vec<(String, String)>,
}

/// SSH client invocation for the dynamic port forward behind the bridge.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SshConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    /// Private key file passed via `-i`. Mutually layered with `password`;
    /// key wins when both are set.
    pub key_path: Option<PathBuf>,
    /// Password injected through sshpass.
    pub password: Option<String>,
    #[serde(default = "default_ssh_binary")]
    pub ssh_binary: PathBuf,
    #[serde(default = "default_sshpass_binary")]
    pub sshpass_binary: PathBuf,
    /// Fixed delay before the first readiness probe, giving the client time
    /// to authenticate and bind the forward port.
    #[serde(default = "default_settle_delay_ms")]
    pub settle_delay_ms: u64,
    /// Number of TCP connect attempts against the leased port.
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ssh_port(),
            user: String::new(),
            key_path: None,
            password: None,
            ssh_binary: default_ssh_binary(),
            sshpass_binary: default_sshpass_binary(),
            settle_delay_ms: default_settle_delay_ms(),
            probe_attempts: default_probe_attempts(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Maximum concurrent connections per listener.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Relay idle timeout in seconds (0 = disabled).
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Time budget in seconds for a protocol handshake (SOCKS5 negotiation,
    /// CONNECT head, WebSocket upgrade).
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout: u64,
    /// Destination connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    /// Seconds to wait for active connections to drain on shutdown.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            idle_timeout: default_idle_timeout(),
            handshake_timeout: default_handshake_timeout(),
            connect_timeout: default_connect_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_socks5_listen() -> String {
    "0.0.0.0:1080".to_string()
}

fn default_connect_listen() -> String {
    "0.0.0.0:8888".to_string()
}

fn default_websocket_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_template_name() -> String {
    "nginx".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_ssh_binary() -> PathBuf {
    PathBuf::from("ssh")
}

fn default_sshpass_binary() -> PathBuf {
    PathBuf::from("sshpass")
}

fn default_settle_delay_ms() -> u64 {
    1500
}

fn default_probe_attempts() -> u32 {
    10
}

fn default_probe_interval_ms() -> u64 {
    200
}

fn default_max_connections() -> u32 {
    1000
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    30
}
