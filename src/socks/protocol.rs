use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

// SOCKS5 constants (RFC 1928)
pub const SOCKS_VERSION: u8 = 0x05;
pub const AUTH_NONE: u8 = 0x00;
pub const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
pub const CMD_CONNECT: u8 = 0x01;
pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;
pub const REPLY_SUCCESS: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Maximum domain name length per RFC 1035
const MAX_DOMAIN_LENGTH: usize = 253;

/// SOCKS5 target address. IPv6 is rejected at the wire level and never
/// materializes here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ipv4([u8; 4], u16),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn host_string(&self) -> String {
        match self {
            TargetAddr::Ipv4(ip, _) => format!("{}.{}.{}.{}", ip[0], ip[1], ip[2], ip[3]),
            TargetAddr::Domain(domain, _) => domain.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ipv4(_, p) | TargetAddr::Domain(_, p) => *p,
        }
    }
}

/// Outcome of reading a SOCKS5 request. Unsupported commands and address
/// types already had their error reply written when these variants are
/// returned; the caller only has to close.
#[derive(Debug)]
pub enum RequestOutcome {
    Connect(TargetAddr),
    UnsupportedCommand(u8),
    UnsupportedAddressType(u8),
}

/// Read the SOCKS5 client greeting, returning the offered auth methods.
pub async fn read_greeting(stream: &mut (impl AsyncRead + Unpin)) -> Result<Vec<u8>> {
    let ver = stream.read_u8().await.context("reading SOCKS version")?;
    if ver != SOCKS_VERSION {
        anyhow::bail!("unsupported SOCKS version: {}", ver);
    }

    let nmethods = stream.read_u8().await.context("reading nmethods")?;
    if nmethods == 0 {
        anyhow::bail!("client offered no authentication methods (RFC 1928)");
    }
    let mut methods = vec![0u8; nmethods as usize];
    stream
        .read_exact(&mut methods)
        .await
        .context("reading auth methods")?;

    Ok(methods)
}

/// Send the method selection response `(5, method)`.
pub async fn send_method_selection(
    stream: &mut (impl AsyncWrite + Unpin),
    method: u8,
) -> Result<()> {
    stream
        .write_all(&[SOCKS_VERSION, method])
        .await
        .context("sending method selection")?;
    Ok(())
}

/// Read the SOCKS5 request following a successful method negotiation.
///
/// Only CONNECT with an IPv4 or domain-name target is accepted. For an
/// unsupported command or address type the mandated error reply (0x07 /
/// 0x08) is written before returning, so callers can close immediately.
pub async fn read_request(
    stream: &mut (impl AsyncRead + AsyncWrite + Unpin),
) -> Result<RequestOutcome> {
    let ver = stream.read_u8().await.context("reading request version")?;
    if ver != SOCKS_VERSION {
        anyhow::bail!("invalid SOCKS version in request: {}", ver);
    }

    let cmd = stream.read_u8().await.context("reading request command")?;
    let _rsv = stream.read_u8().await.context("reading reserved byte")?;
    let atyp = stream.read_u8().await.context("reading address type")?;

    // For an unsupported command the reply goes out without consuming the
    // address bytes; the connection closes right after.
    if cmd != CMD_CONNECT {
        send_reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Ok(RequestOutcome::UnsupportedCommand(cmd));
    }

    let target = match atyp {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            stream
                .read_exact(&mut ip)
                .await
                .context("reading IPv4 address")?;
            let port = stream.read_u16().await.context("reading port")?;
            TargetAddr::Ipv4(ip, port)
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await.context("reading domain length")? as usize;
            if len == 0 {
                anyhow::bail!("empty domain name in SOCKS5 request");
            }
            if len > MAX_DOMAIN_LENGTH {
                anyhow::bail!(
                    "domain name too long: {} bytes (max {})",
                    len,
                    MAX_DOMAIN_LENGTH
                );
            }
            let mut domain_bytes = vec![0u8; len];
            stream
                .read_exact(&mut domain_bytes)
                .await
                .context("reading domain name")?;
            let domain = String::from_utf8(domain_bytes).context("invalid domain name encoding")?;
            let port = stream.read_u16().await.context("reading port")?;
            TargetAddr::Domain(domain, port)
        }
        other => {
            // IPv6 and anything else: explicit error reply, then close
            send_reply(stream, REPLY_ADDRESS_TYPE_NOT_SUPPORTED).await?;
            return Ok(RequestOutcome::UnsupportedAddressType(other));
        }
    };

    Ok(RequestOutcome::Connect(target))
}

/// Send a SOCKS5 reply with a zero-filled IPv4 bind address.
///
/// CONNECT clients do not consume the bind address, so it is not
/// load-bearing; zero-filling it keeps the reply a fixed 10 bytes.
pub async fn send_reply(stream: &mut (impl AsyncWrite + Unpin), reply: u8) -> Result<()> {
    let buf = [
        SOCKS_VERSION,
        reply,
        0x00, // rsv
        ATYP_IPV4,
        0,
        0,
        0,
        0, // bnd.addr
        0,
        0, // bnd.port
    ];
    stream.write_all(&buf).await.context("sending reply")?;
    Ok(())
}
