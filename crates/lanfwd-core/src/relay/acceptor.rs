//! Listener ownership and the accept loop.
//!
//! [`Acceptor::start`] binds the listen endpoint and spawns an accept loop.
//! Every accepted connection gets its own task that dials the upstream and
//! hands both streams to [`relay_pair`](super::pair::relay_pair). The loop
//! is cancelled through an `mpsc` channel held by the returned
//! [`RelaySession`]; the listener is owned by the loop and closes when the
//! loop exits.

use super::pair::relay_pair;
use crate::endpoint::{ListenEndpoint, UpstreamEndpoint};
use crate::error::{FwdError, FwdResult};
use crate::limits::{ConnectionGuard, ConnectionTracker, RelayLimits};
use crate::notify::{RelayEvent, RelayNotifier};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Pause after a failed `accept` so a persistent failure (e.g. EMFILE)
/// does not spin the loop.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// A bound listener with a running accept loop.
///
/// Dropping the session without calling [`RelaySession::shutdown`] also
/// stops the accept loop (the cancel channel closes), but nothing waits for
/// it to exit.
#[derive(Debug)]
pub struct RelaySession {
    listen: ListenEndpoint,
    local_addr: SocketAddr,
    upstream: UpstreamEndpoint,
    tracker: ConnectionTracker,
    cancel_tx: mpsc::Sender<()>,
    accept_task: JoinHandle<()>,
}

impl RelaySession {
    pub fn listen(&self) -> ListenEndpoint {
        self.listen
    }

    /// Address the OS actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn upstream(&self) -> &UpstreamEndpoint {
        &self.upstream
    }

    /// Connection pairs currently being relayed (including pairs accepted
    /// before a shutdown that are still draining).
    pub fn active_connections(&self) -> usize {
        self.tracker.active()
    }

    /// Stop accepting and wait until the accept loop has exited.
    ///
    /// Once this returns the listener is closed. Established connection
    /// pairs are left running until their peers disconnect.
    pub async fn shutdown(self) -> ConnectionTracker {
        let _ = self.cancel_tx.send(()).await;
        if let Err(e) = self.accept_task.await {
            warn!(port = self.listen.port, error = %e, "accept loop ended abnormally");
        }
        self.tracker
    }
}

/// Source of inbound connections for the accept loop.
trait Incoming: Send + Sync + 'static {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;
}

impl Incoming for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }
}

/// Everything a connection task needs, shared by all tasks of a session.
struct ConnectionContext {
    upstream: UpstreamEndpoint,
    idle_timeout: Option<Duration>,
    notifier: RelayNotifier,
}

/// Binds listeners and runs accept loops.
///
/// All methods are associated functions; the struct exists only for
/// namespacing.
pub struct Acceptor;

impl Acceptor {
    /// Bind `listen` and start forwarding every accepted connection to
    /// `upstream`.
    ///
    /// Returns as soon as the listener is bound; accepting happens on a
    /// spawned task.
    ///
    /// # Errors
    ///
    /// Returns [`FwdError::Bind`] if the address is in use or cannot be
    /// bound.
    pub async fn start(
        listen: ListenEndpoint,
        upstream: UpstreamEndpoint,
        limits: RelayLimits,
        notifier: RelayNotifier,
    ) -> FwdResult<RelaySession> {
        let addr = listen.socket_addr();
        let listener = TcpListener::bind(addr).await.map_err(|source| {
            warn!(addr = %addr, error = %source, "listen bind failed");
            FwdError::Bind {
                addr: addr.to_string(),
                source,
            }
        })?;
        let local_addr = listener.local_addr().unwrap_or(addr);

        let tracker = ConnectionTracker::new(limits.max_connections);
        let ctx = Arc::new(ConnectionContext {
            upstream: upstream.clone(),
            idle_timeout: limits.idle_timeout,
            notifier,
        });

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>(1);

        info!(
            listen = %local_addr,
            upstream = %upstream,
            max_connections = ?limits.max_connections,
            "relay listener started"
        );

        let loop_tracker = tracker.clone();
        let port = listen.port;
        let accept_task = tokio::spawn(async move {
            Self::accept_loop(listener, cancel_rx, loop_tracker, ctx).await;
            debug!(port, "accept loop ended");
        });

        Ok(RelaySession {
            listen,
            local_addr,
            upstream,
            tracker,
            cancel_tx,
            accept_task,
        })
    }

    async fn accept_loop(
        listener: impl Incoming,
        mut cancel_rx: mpsc::Receiver<()>,
        tracker: ConnectionTracker,
        ctx: Arc<ConnectionContext>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = cancel_rx.recv() => {
                    debug!("accept loop cancelled");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let Some(guard) = tracker.try_acquire() else {
                                let limit = tracker.max_connections().unwrap_or_default();
                                warn!(peer = %peer, limit, "connection limit reached, closing inbound");
                                ctx.notifier.notify(RelayEvent::ConnectionRefused { peer, limit });
                                drop(stream);
                                continue;
                            };
                            let ctx = ctx.clone();
                            tokio::spawn(Self::handle_connection(stream, peer, guard, ctx));
                        }
                        Err(e) => Self::accept_failed(e, &ctx.notifier).await,
                    }
                }
            }
        }
    }

    /// Report a failed `accept` and pause before the next attempt.
    async fn accept_failed(e: io::Error, notifier: &RelayNotifier) {
        let err = FwdError::Accept(e);
        warn!(error = %err, "accept failed");
        notifier.notify(RelayEvent::AcceptError(err.to_string()));
        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
    }

    /// Dial the upstream for one inbound connection and relay until the
    /// pair ends. A failed dial only affects this connection.
    async fn handle_connection(
        inbound: TcpStream,
        peer: SocketAddr,
        guard: ConnectionGuard,
        ctx: Arc<ConnectionContext>,
    ) {
        let id = guard.id();
        let addr = ctx.upstream.address();

        let outbound = match TcpStream::connect(&addr).await {
            Ok(stream) => stream,
            Err(source) => {
                let err = FwdError::Dial { addr, source };
                warn!(id, peer = %peer, error = %err, "upstream dial failed");
                ctx.notifier.notify(RelayEvent::ConnectionError(err.to_string()));
                return;
            }
        };
        let _ = inbound.set_nodelay(true);
        let _ = outbound.set_nodelay(true);

        info!(id, peer = %peer, upstream = %addr, "connection opened");
        ctx.notifier.notify(RelayEvent::ConnectionOpened { id, peer });

        let stats = relay_pair(inbound, outbound, ctx.idle_timeout).await;

        info!(
            id,
            peer = %peer,
            bytes_up = stats.a_to_b,
            bytes_down = stats.b_to_a,
            "connection closed"
        );
        ctx.notifier.notify(RelayEvent::ConnectionClosed {
            id,
            bytes_up: stats.a_to_b,
            bytes_down: stats.b_to_a,
        });
        drop(guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{free_port, loopback_listen, spawn_echo_server, WAIT};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::{timeout, Instant};

    /// Listener whose first `failures` accepts fail like an exhausted fd table.
    struct FlakyListener {
        inner: TcpListener,
        failures: AtomicUsize,
    }

    impl Incoming for FlakyListener {
        fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
            let fail = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            async move {
                if fail {
                    return Err(io::Error::other("too many open files"));
                }
                self.inner.accept().await
            }
        }
    }

    async fn start_echo_relay(
        limits: RelayLimits,
    ) -> (RelaySession, tokio::sync::mpsc::UnboundedReceiver<RelayEvent>) {
        let echo = spawn_echo_server().await;
        let upstream = UpstreamEndpoint::new("127.0.0.1", echo.port()).unwrap();
        let (notifier, rx) = RelayNotifier::channel();
        let session = Acceptor::start(loopback_listen(), upstream, limits, notifier)
            .await
            .unwrap();
        (session, rx)
    }

    async fn next_matching(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<RelayEvent>,
        pred: impl Fn(&RelayEvent) -> bool,
    ) -> RelayEvent {
        timeout(WAIT, async {
            loop {
                let event = rx.recv().await.expect("notifier closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event not received")
    }

    #[tokio::test]
    async fn relays_through_echo_upstream() {
        let (session, mut rx) = start_echo_relay(RelayLimits::default()).await;

        let mut client = TcpStream::connect(session.local_addr()).await.unwrap();
        client.write_all(b"hello relay").await.unwrap();
        let mut buf = [0u8; 11];
        timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"hello relay");

        next_matching(&mut rx, |e| matches!(e, RelayEvent::ConnectionOpened { .. })).await;
        assert_eq!(session.active_connections(), 1);

        drop(client);
        let closed = next_matching(&mut rx, |e| matches!(e, RelayEvent::ConnectionClosed { .. })).await;
        assert_eq!(
            closed,
            RelayEvent::ConnectionClosed { id: 1, bytes_up: 11, bytes_down: 11 }
        );
        session.shutdown().await;
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let listen = ListenEndpoint::new("127.0.0.1".parse().unwrap(), port).unwrap();

        let result = Acceptor::start(
            listen,
            UpstreamEndpoint::loopback(port).unwrap(),
            RelayLimits::default(),
            RelayNotifier::silent(),
        )
        .await;
        assert!(matches!(result, Err(FwdError::Bind { .. })));
    }

    #[tokio::test]
    async fn dial_failure_closes_only_that_connection() {
        let dead = UpstreamEndpoint::loopback(free_port()).unwrap();
        let (notifier, mut rx) = RelayNotifier::channel();
        let session = Acceptor::start(loopback_listen(), dead, RelayLimits::default(), notifier)
            .await
            .unwrap();

        let mut client = TcpStream::connect(session.local_addr()).await.unwrap();
        let mut buf = [0u8; 1];
        let read = timeout(WAIT, client.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)), "inbound should be closed, got {read:?}");

        let event = next_matching(&mut rx, |e| matches!(e, RelayEvent::ConnectionError(_))).await;
        assert!(event.to_string().starts_with("Connection error: "));

        // The listener keeps accepting after a failed dial.
        let second = TcpStream::connect(session.local_addr()).await;
        assert!(second.is_ok());
        session.shutdown().await;
    }

    #[tokio::test]
    async fn connection_cap_refuses_extra_clients() {
        let limits = RelayLimits {
            max_connections: Some(1),
            idle_timeout: None,
        };
        let (session, mut rx) = start_echo_relay(limits).await;

        let mut first = TcpStream::connect(session.local_addr()).await.unwrap();
        first.write_all(b"a").await.unwrap();
        let mut buf = [0u8; 1];
        timeout(WAIT, first.read_exact(&mut buf)).await.unwrap().unwrap();

        let mut second = TcpStream::connect(session.local_addr()).await.unwrap();
        let read = timeout(WAIT, second.read(&mut buf)).await.unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));

        let refused = next_matching(&mut rx, |e| matches!(e, RelayEvent::ConnectionRefused { .. })).await;
        assert!(matches!(refused, RelayEvent::ConnectionRefused { limit: 1, .. }));

        // The first pair is unaffected.
        first.write_all(b"b").await.unwrap();
        timeout(WAIT, first.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"b");
        session.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_listener_but_not_live_pairs() {
        let (session, _rx) = start_echo_relay(RelayLimits::default()).await;
        let addr = session.local_addr();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"1").await.unwrap();
        let mut buf = [0u8; 1];
        timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();

        let tracker = timeout(WAIT, session.shutdown()).await.unwrap();
        assert!(TcpStream::connect(addr).await.is_err());

        client.write_all(b"2").await.unwrap();
        timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"2");
        assert_eq!(tracker.active(), 1);

        drop(client);
        timeout(WAIT, async {
            while tracker.active() > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn accept_error_is_reported_then_backs_off() {
        let (notifier, mut rx) = RelayNotifier::channel();
        let started = Instant::now();
        Acceptor::accept_failed(io::Error::other("too many open files"), &notifier).await;
        assert!(started.elapsed() >= ACCEPT_ERROR_BACKOFF);

        let event = rx.try_recv().unwrap();
        assert_eq!(
            event.to_string(),
            "Accept error: accept failed: too many open files"
        );
    }

    #[tokio::test]
    async fn accept_loop_keeps_serving_after_accept_errors() {
        let echo = spawn_echo_server().await;
        let inner = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = inner.local_addr().unwrap();
        let listener = FlakyListener {
            inner,
            failures: AtomicUsize::new(2),
        };

        let (notifier, mut rx) = RelayNotifier::channel();
        let ctx = Arc::new(ConnectionContext {
            upstream: UpstreamEndpoint::new("127.0.0.1", echo.port()).unwrap(),
            idle_timeout: None,
            notifier,
        });
        let (cancel_tx, cancel_rx) = mpsc::channel(1);
        let tracker = ConnectionTracker::new(None);
        let accept_task = tokio::spawn(Acceptor::accept_loop(listener, cancel_rx, tracker, ctx));

        for _ in 0..2 {
            let event = next_matching(&mut rx, |e| matches!(e, RelayEvent::AcceptError(_))).await;
            assert!(event.to_string().starts_with("Accept error: "));
        }

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"still here").await.unwrap();
        let mut buf = [0u8; 10];
        timeout(WAIT, client.read_exact(&mut buf)).await.unwrap().unwrap();
        assert_eq!(&buf, b"still here");
        next_matching(&mut rx, |e| matches!(e, RelayEvent::ConnectionOpened { .. })).await;

        cancel_tx.send(()).await.unwrap();
        timeout(WAIT, accept_task).await.unwrap().unwrap();
    }
}
