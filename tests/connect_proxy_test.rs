mod common;

use portway::config::types::AppConfig;
use portway::http::start_connect_proxy;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

async fn start_server(
    ctx: Arc<portway::context::AppContext>,
) -> (String, TcpStream, CancellationToken) {
    let port = common::free_port().await;
    let addr = format!("127.0.0.1:{}", port);
    let token = CancellationToken::new();
    {
        let addr = addr.clone();
        let token = token.clone();
        tokio::spawn(async move {
            let _ = start_connect_proxy(&addr, ctx, token).await;
        });
    }
    let client = connect_ready(&addr).await;
    (addr, client, token)
}

async fn connect_ready(addr: &str) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("listener at {} never became ready", addr);
}

/// Read the status line of the proxy's response.
async fn read_status_line(stream: &mut TcpStream) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await.unwrap();
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8(line).unwrap()
}

/// Drain the remaining response headers up to the blank line.
async fn drain_headers(stream: &mut TcpStream) {
    loop {
        let line = read_status_line(stream).await;
        if line.is_empty() {
            break;
        }
    }
}

#[tokio::test]
async fn connect_establishes_tunnel_and_relays() {
    let echo_addr = common::spawn_echo_server().await;
    let ctx = common::test_context(AppConfig::default());
    let (_addr, mut client, _token) = start_server(ctx).await;

    let request = format!(
        "CONNECT {}:{} HTTP/1.1\r\nHost: {}:{}\r\n\r\n",
        echo_addr.ip(),
        echo_addr.port(),
        echo_addr.ip(),
        echo_addr.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();

    let status = read_status_line(&mut client).await;
    assert_eq!(status, "HTTP/1.1 200 Connection Established");
    drain_headers(&mut client).await;

    // Raw bytes after the 200, no HTTP framing
    client.write_all(b"tunnel payload").await.unwrap();
    let mut buf = [0u8; 14];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"tunnel payload");
}

#[tokio::test]
async fn connect_rejects_get_with_500() {
    let ctx = common::test_context(AppConfig::default());
    let (_addr, mut client, _token) = start_server(ctx).await;

    client
        .write_all(b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n")
        .await
        .unwrap();

    let status = read_status_line(&mut client).await;
    assert_eq!(status, "HTTP/1.1 500 Internal Server Error");
}

#[tokio::test]
async fn connect_rejects_malformed_target_with_500() {
    let ctx = common::test_context(AppConfig::default());
    let (_addr, mut client, _token) = start_server(ctx).await;

    client
        .write_all(b"CONNECT no-port-here HTTP/1.1\r\n\r\n")
        .await
        .unwrap();

    let status = read_status_line(&mut client).await;
    assert_eq!(status, "HTTP/1.1 500 Internal Server Error");

    // Connection is closed afterwards
    let mut rest = [0u8; 64];
    loop {
        match client.read(&mut rest).await {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }
}

#[tokio::test]
async fn connect_unreachable_upstream_gets_500() {
    let ctx = common::test_context(AppConfig::default());
    let (_addr, mut client, _token) = start_server(ctx).await;

    let dead_port = common::free_port().await;
    let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", dead_port);
    client.write_all(request.as_bytes()).await.unwrap();

    let status = read_status_line(&mut client).await;
    assert_eq!(status, "HTTP/1.1 500 Internal Server Error");
}

#[tokio::test]
async fn connect_accounting_records_session() {
    let echo_addr = common::spawn_echo_server().await;
    let accounting = Arc::new(common::RecordingAccounting::new());
    let ctx = common::test_context_with_accounting(AppConfig::default(), accounting.clone());
    let (_addr, mut client, _token) = start_server(ctx).await;

    let request = format!(
        "CONNECT {}:{} HTTP/1.1\r\n\r\n",
        echo_addr.ip(),
        echo_addr.port()
    );
    client.write_all(request.as_bytes()).await.unwrap();
    let status = read_status_line(&mut client).await;
    assert_eq!(status, "HTTP/1.1 200 Connection Established");
    drain_headers(&mut client).await;

    client.write_all(b"abc").await.unwrap();
    let mut buf = [0u8; 3];
    client.read_exact(&mut buf).await.unwrap();
    drop(client);

    for _ in 0..100 {
        if !accounting.ends.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let begins = accounting.begins.lock().unwrap();
    assert_eq!(begins.len(), 1);
    assert_eq!(begins[0].1, "connect");

    let ends = accounting.ends.lock().unwrap();
    assert_eq!(ends.len(), 1);
    assert_eq!(ends[0].1, 3);
    assert_eq!(ends[0].2, 3);
}
