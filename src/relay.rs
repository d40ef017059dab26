use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Buffer size for relay read operations (8 KiB)
pub const RELAY_BUFFER_SIZE: usize = 8192;

/// Configuration for a relay session.
pub struct RelayConfig {
    /// Per-read idle timeout. `Duration::ZERO` disables the idle check.
    pub idle_timeout: Duration,
    /// Free-form label included in log records, e.g. `"1.2.3.4@example.com:443"`.
    pub context: String,
}

impl RelayConfig {
    pub fn new(idle_timeout: Duration, context: impl Into<String>) -> Self {
        Self {
            idle_timeout,
            context: context.into(),
        }
    }
}

/// Relay data in one direction: reader -> writer, with idle timeout.
/// Forwarded bytes are accumulated into `counter` chunk by chunk so the
/// total survives even if the task is aborted mid-flight.
async fn relay_one_direction<R: AsyncRead + Unpin, W: AsyncWrite + Unpin>(
    mut reader: R,
    mut writer: W,
    timeout: Duration,
    counter: Arc<AtomicU64>,
    context: String,
    direction: &'static str,
) {
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        match tokio::time::timeout(timeout, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                counter.fetch_add(n as u64, Ordering::Relaxed);
            }
            Ok(Err(_)) => break,
            Err(_) => {
                debug!(context = %context, direction = direction, "Relay idle timeout");
                break;
            }
        }
    }
}

/// Bidirectional relay between two streams. The first direction to end
/// (orderly close, error, or idle timeout) tears down the pair: the other
/// direction is aborted and both streams are dropped.
///
/// Bytes are forwarded verbatim; there is no framing and no flow control
/// beyond TCP's own, so a stalled peer stalls the pair.
/// Returns `(bytes_up, bytes_down)` where up = A to B, down = B to A.
pub async fn relay<A, B>(stream_a: A, stream_b: B, config: RelayConfig) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let effective_timeout = if config.idle_timeout.is_zero() {
        Duration::from_secs(365 * 24 * 3600)
    } else {
        config.idle_timeout
    };
    let start = Instant::now();

    let up_count = Arc::new(AtomicU64::new(0));
    let down_count = Arc::new(AtomicU64::new(0));

    let (a_read, a_write) = tokio::io::split(stream_a);
    let (b_read, b_write) = tokio::io::split(stream_b);

    let mut a_to_b = tokio::spawn(relay_one_direction(
        a_read,
        b_write,
        effective_timeout,
        up_count.clone(),
        config.context.clone(),
        "a->b",
    ));
    let mut b_to_a = tokio::spawn(relay_one_direction(
        b_read,
        a_write,
        effective_timeout,
        down_count.clone(),
        config.context.clone(),
        "b->a",
    ));

    tokio::select! {
        _ = &mut a_to_b => b_to_a.abort(),
        _ = &mut b_to_a => a_to_b.abort(),
    }

    let bytes_up = up_count.load(Ordering::Relaxed);
    let bytes_down = down_count.load(Ordering::Relaxed);
    let duration_ms = start.elapsed().as_millis() as u64;

    info!(
        bytes_up = bytes_up,
        bytes_down = bytes_down,
        duration_ms = duration_ms,
        context = %config.context,
        "Relay completed"
    );

    Ok((bytes_up, bytes_down))
}
