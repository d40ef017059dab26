//! WebSocket upgrade handshake with fingerprint templates.
//!
//! The upgrade request head is parsed and answered manually so the response
//! bytes are fully under our control: the cosmetic headers come from a
//! selected template, while `Sec-WebSocket-Accept` is always computed per
//! RFC 6455 from the client nonce. After the 101 the socket is handed to
//! tungstenite for framing.

use crate::config::types::WebSocketConfig;
use crate::http::read_crlf_line;
use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use tokio::io::AsyncRead;

/// RFC 6455 handshake GUID.
const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Subprotocol echoed back when the client offers it.
pub const SUBPROTOCOL: &str = "socks";

/// Names of the templates compiled into the binary.
pub const BUILTIN_TEMPLATE_NAMES: &[&str] = &["nginx", "apache", "dropbear", "cloudflare"];

const MAX_HEADER_LINES: usize = 128;

/// A named set of upgrade-response headers mimicking a server fingerprint.
#[derive(Debug, Clone)]
pub struct HandshakeTemplate {
    pub name: String,
    /// Case-insensitive substrings matched against the client's User-Agent.
    pub agents: Vec<String>,
    /// Cosmetic headers appended to the 101 response.
    pub headers: Vec<(String, String)>,
}

fn builtin_templates() -> Vec<HandshakeTemplate> {
    vec![
        HandshakeTemplate {
            name: "nginx".to_string(),
            agents: Vec::new(),
            headers: vec![("Server".to_string(), "nginx/1.24.0".to_string())],
        },
        HandshakeTemplate {
            name: "apache".to_string(),
            agents: vec!["dalvik".to_string(), "okhttp".to_string()],
            headers: vec![
                ("Server".to_string(), "Apache/2.4.57 (Debian)".to_string()),
                ("X-Powered-By".to_string(), "PHP/8.2.7".to_string()),
            ],
        },
        HandshakeTemplate {
            name: "dropbear".to_string(),
            agents: vec![
                "openssh".to_string(),
                "dropbear".to_string(),
                "paramiko".to_string(),
            ],
            headers: vec![("Server".to_string(), "dropbear_2022.83".to_string())],
        },
        HandshakeTemplate {
            name: "cloudflare".to_string(),
            agents: vec!["websocket-sharp".to_string()],
            headers: vec![
                ("Server".to_string(), "cloudflare".to_string()),
                ("CF-Cache-Status".to_string(), "DYNAMIC".to_string()),
            ],
        },
    ]
}

/// The template table for one listener: built-ins plus configured extras,
/// with a named default. Exactly one template applies per connection.
pub struct TemplateSet {
    templates: Vec<HandshakeTemplate>,
    default_name: String,
}

impl TemplateSet {
    /// Merge built-in templates with configured ones. A configured template
    /// with a built-in's name replaces it.
    pub fn from_config(config: &WebSocketConfig) -> Self {
        let mut templates = builtin_templates();
        for tc in &config.templates {
            let template = HandshakeTemplate {
                name: tc.name.clone(),
                agents: tc.agents.clone(),
                headers: tc.headers.clone(),
            };
            match templates.iter_mut().find(|t| t.name == tc.name) {
                Some(existing) => *existing = template,
                None => templates.push(template),
            }
        }
        Self {
            templates,
            default_name: config.default_template.clone(),
        }
    }

    /// Select the template for a client: first one with an agent hint that
    /// is a case-insensitive substring of the User-Agent, else the default.
    pub fn select(&self, agent: Option<&str>) -> &HandshakeTemplate {
        if let Some(agent) = agent {
            let agent_lower = agent.to_lowercase();
            for template in &self.templates {
                if template
                    .agents
                    .iter()
                    .any(|hint| agent_lower.contains(&hint.to_lowercase()))
                {
                    return template;
                }
            }
        }
        self.templates
            .iter()
            .find(|t| t.name == self.default_name)
            .unwrap_or(&self.templates[0])
    }
}

/// Compute `Sec-WebSocket-Accept` per RFC 6455:
/// `base64(SHA1(key + GUID))`.
pub fn compute_accept(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// The parts of a client upgrade request the bridge cares about.
#[derive(Debug)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
    pub agent: Option<String>,
    pub protocols: Vec<String>,
}

impl UpgradeRequest {
    pub fn offers_socks(&self) -> bool {
        self.protocols.iter().any(|p| p == SUBPROTOCOL)
    }
}

/// Read and parse the HTTP Upgrade request head.
pub async fn read_upgrade_request<S: AsyncRead + Unpin>(stream: &mut S) -> Result<UpgradeRequest> {
    let request_line = read_crlf_line(stream).await?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("missing request path"))?
        .to_string();
    if !method.eq_ignore_ascii_case("GET") {
        anyhow::bail!("upgrade request must use GET (got '{}')", method);
    }

    let mut upgrade_seen = false;
    let mut key = None;
    let mut agent = None;
    let mut protocols = Vec::new();

    for _ in 0..MAX_HEADER_LINES {
        let line = read_crlf_line(stream).await?;
        if line.is_empty() {
            let key = key.ok_or_else(|| anyhow::anyhow!("missing Sec-WebSocket-Key header"))?;
            if !upgrade_seen {
                anyhow::bail!("missing 'Upgrade: websocket' header");
            }
            return Ok(UpgradeRequest {
                path,
                key,
                agent,
                protocols,
            });
        }

        let Some((name, value)) = line.split_once(':') else {
            anyhow::bail!("malformed header line '{}'", line);
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();

        match name.as_str() {
            "upgrade" => upgrade_seen = value.eq_ignore_ascii_case("websocket"),
            "sec-websocket-key" => key = Some(value.to_string()),
            "user-agent" => agent = Some(value.to_string()),
            "sec-websocket-protocol" => {
                protocols.extend(value.split(',').map(|p| p.trim().to_string()));
            }
            _ => {}
        }
    }
    anyhow::bail!("too many header lines in upgrade request")
}

/// Build the 101 response: correct Accept first, then the subprotocol echo,
/// then the template's cosmetic headers.
pub fn build_upgrade_response(
    template: &HandshakeTemplate,
    key: &str,
    echo_subprotocol: bool,
) -> String {
    let mut response = String::from("HTTP/1.1 101 Switching Protocols\r\n");
    response.push_str("Upgrade: websocket\r\n");
    response.push_str("Connection: Upgrade\r\n");
    response.push_str(&format!("Sec-WebSocket-Accept: {}\r\n", compute_accept(key)));
    if echo_subprotocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {}\r\n", SUBPROTOCOL));
    }
    for (name, value) in &template.headers {
        response.push_str(&format!("{}: {}\r\n", name, value));
    }
    response.push_str("\r\n");
    response
}
