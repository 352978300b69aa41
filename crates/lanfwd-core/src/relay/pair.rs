//! Bidirectional byte copy between two connected duplex streams.
//!
//! Each direction runs in its own spawned task and never waits for the
//! other. End-of-input on one side is propagated as a write shutdown (FIN)
//! to the other side while the opposite direction keeps flowing. A read or
//! write error, or the optional idle timeout, tears down both directions.
//! When both directions have finished every half is dropped, which closes
//! both underlying streams.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Per-direction copy buffer size.
const COPY_BUFFER_SIZE: usize = 8192;

/// Byte counts for one finished pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PairStats {
    /// Bytes copied from the first stream to the second.
    pub a_to_b: u64,
    /// Bytes copied from the second stream to the first.
    pub b_to_a: u64,
}

/// Relay bytes between `a` and `b` until both directions have ended.
///
/// `idle_timeout`, when set, tears the pair down once no bytes have moved in
/// either direction for that long.
pub async fn relay_pair<A, B>(a: A, b: B, idle_timeout: Option<Duration>) -> PairStats
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);

    let (abort_tx, abort_rx) = watch::channel(false);
    let abort_tx = Arc::new(abort_tx);
    let activity = Arc::new(Activity::new());

    let forward = tokio::spawn(copy_direction(
        a_read,
        b_write,
        abort_tx.clone(),
        abort_rx.clone(),
        activity.clone(),
        "a->b",
    ));
    let backward = tokio::spawn(copy_direction(
        b_read,
        a_write,
        abort_tx.clone(),
        abort_rx,
        activity.clone(),
        "b->a",
    ));
    let watchdog = idle_timeout
        .map(|timeout| tokio::spawn(idle_watchdog(timeout, activity, abort_tx)));

    let (a_to_b, b_to_a) = tokio::join!(forward, backward);
    if let Some(watchdog) = watchdog {
        watchdog.abort();
    }

    PairStats {
        a_to_b: a_to_b.unwrap_or_default(),
        b_to_a: b_to_a.unwrap_or_default(),
    }
}

/// Copy `reader` into `writer` until EOF, an error, or an abort signal.
async fn copy_direction<R, W>(
    mut reader: R,
    mut writer: W,
    abort_tx: Arc<watch::Sender<bool>>,
    mut abort_rx: watch::Receiver<bool>,
    activity: Arc<Activity>,
    direction: &'static str,
) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = tokio::select! {
            _ = aborted(&mut abort_rx) => {
                debug!(direction, "copy aborted");
                break;
            }
            result = reader.read(&mut buf) => match result {
                Ok(0) => {
                    debug!(direction, total, "source reached end of input");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(direction, error = %e, "read failed, closing pair");
                    abort_tx.send_replace(true);
                    break;
                }
            }
        };

        tokio::select! {
            _ = aborted(&mut abort_rx) => {
                debug!(direction, "copy aborted");
                break;
            }
            result = writer.write_all(&buf[..n]) => {
                if let Err(e) = result {
                    debug!(direction, error = %e, "write failed, closing pair");
                    abort_tx.send_replace(true);
                    break;
                }
            }
        }

        total += n as u64;
        activity.touch();
    }

    let _ = writer.shutdown().await;
    total
}

/// Resolves once the pair has been told to shut down.
async fn aborted(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn idle_watchdog(timeout: Duration, activity: Arc<Activity>, abort_tx: Arc<watch::Sender<bool>>) {
    loop {
        let idle = activity.idle_for();
        if idle >= timeout {
            debug!(timeout_ms = timeout.as_millis() as u64, "pair idle, closing");
            abort_tx.send_replace(true);
            return;
        }
        tokio::time::sleep(timeout - idle).await;
    }
}

/// Time of the last successful write in either direction.
struct Activity {
    origin: Instant,
    last_ms: AtomicU64,
}

impl Activity {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        let now = self.origin.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Relaxed));
        self.origin.elapsed().saturating_sub(last)
    }
}
