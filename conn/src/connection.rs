//! Bind a [RawConnection] to a [Scope] and exchange framed messages over it.
//!
//! Each [Connection] spawns two forwarders on the runtime it is given:
//! - the inbound forwarder reads length-prefixed frames from the [Stream] half and pushes them
//!   into a bounded inbound queue (drained by [Connection::receive]),
//! - the outbound forwarder drains a bounded outbound queue (filled by [Connection::send]) and
//!   writes each message as a frame to the [Sink] half.
//!
//! Both forwarders exit as soon as the connection's scope is cancelled, whatever the trigger:
//! [Connection::close], cancellation of the connection's scope or of any ancestor, dropping the
//! [Connection], or a read/write failure on the transport (which cancels the scope with
//! [Cause::Transport]).

use crate::{
    metrics::{Metrics, Worker},
    utils::codec::{recv_frame, send_frame},
    Cause, Done, Error, RawConnection, Scope,
};
use bytes::Bytes;
use commonware_macros::select;
use commonware_runtime::{Handle, Metrics as RuntimeMetrics, Sink, Spawner, Stream};
use futures::{channel::mpsc, future::poll_fn, SinkExt as _, StreamExt as _};
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Configuration for a [Connection].
#[derive(Clone)]
pub struct Config {
    /// Capacity of the outbound and inbound queues.
    ///
    /// [Connection::send] waits for capacity once the outbound queue is full.
    pub mailbox_size: usize,

    /// Maximum message size (in bytes). Prevents memory exhaustion DoS attacks.
    pub max_message_size: usize,

    /// Metrics updated by the connection and its forwarders.
    pub metrics: Metrics,
}

impl Config {
    /// See [Config]
    pub fn with_mailbox_size(mut self, mailbox_size: usize) -> Self {
        self.mailbox_size = mailbox_size;
        self
    }
    /// See [Config]
    pub fn with_max_message_size(mut self, max_message_size: usize) -> Self {
        self.max_message_size = max_message_size;
        self
    }
    /// See [Config]
    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = metrics;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mailbox_size: 128,
            max_message_size: 1024 * 1024, // 1 MB
            metrics: Metrics::default(),
        }
    }
}

/// A framed, cancellable connection to some remote endpoint.
pub struct Connection {
    address: SocketAddr,
    scope: Scope,
    max_message_size: usize,
    metrics: Metrics,

    outbound: mpsc::Sender<Bytes>,
    inbound: mpsc::Receiver<Bytes>,

    workers: Option<(Handle<()>, Handle<()>)>,
}

impl Connection {
    /// Bind `raw` to a new child of `parent` and spawn its forwarders on `context`.
    ///
    /// Cancelling `parent` closes the connection, but closing the connection never cancels
    /// `parent`, so a listener can hand the same scope to every connection it accepts.
    pub fn wrap<E: Spawner + RuntimeMetrics, Si: Sink, St: Stream>(
        context: E,
        parent: Scope,
        config: Config,
        raw: RawConnection<Si, St>,
    ) -> Self {
        let scope = parent.child();
        let address = raw.address();
        let (sink, stream) = raw.split();
        let (outbound_sender, outbound_receiver) = mpsc::channel(config.mailbox_size);
        let (inbound_sender, inbound_receiver) = mpsc::channel(config.mailbox_size);
        config.metrics.connections_opened.inc();

        let reader = {
            let worker = Worker::new(&config.metrics.workers_running);
            let scope = scope.clone();
            let metrics = config.metrics.clone();
            let max_message_size = config.max_message_size;
            context.with_label("reader").spawn(move |_| async move {
                let _worker = worker;
                forward_inbound(
                    scope,
                    address,
                    stream,
                    inbound_sender,
                    max_message_size,
                    metrics,
                )
                .await
            })
        };
        let writer = {
            let worker = Worker::new(&config.metrics.workers_running);
            let scope = scope.clone();
            let metrics = config.metrics.clone();
            let max_message_size = config.max_message_size;
            context.with_label("writer").spawn(move |_| async move {
                let _worker = worker;
                forward_outbound(
                    scope,
                    address,
                    sink,
                    outbound_receiver,
                    max_message_size,
                    metrics,
                )
                .await
            })
        };
        debug!(%address, "connection opened");

        Self {
            address,
            scope,
            max_message_size: config.max_message_size,
            metrics: config.metrics,
            outbound: outbound_sender,
            inbound: inbound_receiver,
            workers: Some((reader, writer)),
        }
    }

    /// Address of the remote endpoint.
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Maximum size of a message accepted by [Connection::send].
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// The scope bound to this connection.
    ///
    /// Cancelling it (or deriving children from it) is equivalent to composing with the
    /// connection's own lifecycle.
    pub fn context(&self) -> Scope {
        self.scope.clone()
    }

    /// Resolves once the connection is closed.
    pub fn done(&self) -> Done {
        self.scope.done()
    }

    /// Returns `true` once the connection is closed (or closing).
    pub fn is_closed(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Enqueue `msg` for transmission.
    ///
    /// Waits while the outbound queue is full. Returns [Error::Closed] if the connection is (or
    /// becomes) closed before `msg` could be enqueued. Empty or oversized messages are rejected
    /// without affecting the connection. If the returned future is dropped before completion,
    /// `msg` is not sent.
    pub async fn send(&mut self, msg: &[u8]) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if msg.is_empty() {
            return Err(Error::SendZeroSize);
        }
        if msg.len() > self.max_message_size {
            return Err(Error::SendTooLarge(msg.len()));
        }

        self.reserve().await?;
        self.enqueue(Bytes::copy_from_slice(msg))
    }

    /// Wait until the outbound queue can accept a message.
    ///
    /// Nothing is consumed if the returned future is dropped.
    pub(crate) async fn reserve(&mut self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let done = self.scope.done();
        let outbound = &mut self.outbound;
        select! {
            _ = done => {
                Err(Error::Closed)
            },
            result = poll_fn(|cx| outbound.poll_ready(cx)) => {
                result.map_err(|_| Error::Closed)
            },
        }
    }

    /// Enqueue `msg` into capacity obtained with [Connection::reserve].
    pub(crate) fn enqueue(&mut self, msg: Bytes) -> Result<(), Error> {
        self.outbound.start_send(msg).map_err(|_| Error::Closed)
    }

    /// Wait for the next inbound message.
    ///
    /// Returns [Error::Closed] once the connection is closed. To stop waiting without closing
    /// the connection, drop the returned future.
    pub async fn receive(&mut self) -> Result<Bytes, Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        let done = self.scope.done();
        select! {
            _ = done => {
                Err(Error::Closed)
            },
            msg = self.inbound.next() => {
                msg.ok_or(Error::Closed)
            },
        }
    }

    /// Close the connection and wait for both forwarders to exit.
    ///
    /// Closing an already closed connection is a no-op.
    pub async fn close(&mut self) {
        self.shutdown(Cause::Closed).await;
    }

    /// Cancel the connection's scope with `cause` (unless it is already cancelled) and wait for
    /// both forwarders to exit.
    pub(crate) async fn shutdown(&mut self, cause: Cause) {
        if self.scope.cancel(cause) {
            debug!(address = %self.address, %cause, "closing connection");
        }
        self.inbound.close();
        if let Some((reader, writer)) = self.workers.take() {
            if let Err(err) = reader.await {
                warn!(?err, address = %self.address, "inbound forwarder exited abnormally");
            }
            if let Err(err) = writer.await {
                warn!(?err, address = %self.address, "outbound forwarder exited abnormally");
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Forwarders observe the cancellation and exit on their own.
        self.scope.cancel(Cause::Closed);
    }
}

async fn forward_inbound<St: Stream>(
    scope: Scope,
    address: SocketAddr,
    mut stream: St,
    mut inbound: mpsc::Sender<Bytes>,
    max_message_size: usize,
    metrics: Metrics,
) {
    let mut done = scope.done();
    loop {
        let msg = select! {
            _ = &mut done => {
                break;
            },
            result = recv_frame(&mut stream, max_message_size) => {
                match result {
                    Ok(msg) => msg,
                    Err(err) => {
                        if scope.cancel(Cause::Transport) {
                            debug!(?err, %address, "inbound stream failed");
                        }
                        break;
                    }
                }
            },
        };
        metrics.messages_received.inc();

        select! {
            _ = &mut done => {
                break;
            },
            result = inbound.send(msg) => {
                if result.is_err() {
                    break;
                }
            },
        }
    }
}

async fn forward_outbound<Si: Sink>(
    scope: Scope,
    address: SocketAddr,
    mut sink: Si,
    mut outbound: mpsc::Receiver<Bytes>,
    max_message_size: usize,
    metrics: Metrics,
) {
    let mut done = scope.done();
    loop {
        let msg = select! {
            _ = &mut done => {
                break;
            },
            msg = outbound.next() => {
                match msg {
                    Some(msg) => msg,
                    None => {
                        scope.cancel(Cause::Closed);
                        break;
                    }
                }
            },
        };

        select! {
            _ = &mut done => {
                break;
            },
            result = send_frame(&mut sink, &msg, max_message_size) => {
                match result {
                    Ok(()) => metrics.messages_sent.inc(),
                    Err(err) => {
                        if scope.cancel(Cause::Transport) {
                            debug!(?err, %address, "outbound sink failed");
                        }
                        break;
                    }
                }
            },
        };
    }

    // Dropping both halves (the stream in the inbound forwarder, the sink here) releases the
    // raw connection.
}

#[cfg(test)]
mod tests {
    use super::*;
    use commonware_macros::test_traced;
    use commonware_runtime::{deterministic, mocks, Clock, Error as RuntimeError, Runner};
    use commonware_utils::StableBuf;
    use futures::{future::pending, FutureExt as _};
    use std::time::Duration;

    fn addresses() -> (SocketAddr, SocketAddr) {
        (
            "127.0.0.1:1234".parse().unwrap(),
            "127.0.0.1:2345".parse().unwrap(),
        )
    }

    fn setup(
        context: &deterministic::Context,
        scope: &Scope,
        config: &Config,
    ) -> (Connection, Connection) {
        let (addr_a, addr_b) = addresses();
        let (sink_a, stream_b) = mocks::Channel::init();
        let (sink_b, stream_a) = mocks::Channel::init();
        (
            Connection::wrap(
                context.clone(),
                scope.clone(),
                config.clone(),
                RawConnection::new(addr_b, sink_a, stream_a),
            ),
            Connection::wrap(
                context.clone(),
                scope.clone(),
                config.clone(),
                RawConnection::new(addr_a, sink_b, stream_b),
            ),
        )
    }

    async fn wait_for_workers(context: &deterministic::Context, metrics: &Metrics, expected: i64) {
        for _ in 0..1_000 {
            if metrics.workers_running.get() == expected {
                return;
            }
            context.sleep(Duration::from_millis(1)).await;
        }
        panic!("workers did not exit");
    }

    /// A sink that accepts no writes.
    struct StalledSink;

    impl Sink for StalledSink {
        async fn send(&mut self, _msg: impl Into<StableBuf> + Send) -> Result<(), RuntimeError> {
            pending().await
        }
    }

    /// A stream that never yields any bytes.
    struct StalledStream;

    impl Stream for StalledStream {
        async fn recv(
            &mut self,
            _buf: impl Into<StableBuf> + Send,
        ) -> Result<StableBuf, RuntimeError> {
            pending().await
        }
    }

    /// A stream whose transport has failed.
    struct BrokenStream;

    impl Stream for BrokenStream {
        async fn recv(
            &mut self,
            _buf: impl Into<StableBuf> + Send,
        ) -> Result<StableBuf, RuntimeError> {
            Err(RuntimeError::RecvFailed)
        }
    }

    #[test_traced]
    fn test_send_receive() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let scope = Scope::root();
            let (mut a, mut b) = setup(&context, &scope, &Config::default());
            let (addr_a, addr_b) = addresses();
            assert_eq!(a.address(), addr_b);
            assert_eq!(b.address(), addr_a);

            a.send(b"beep").await.unwrap();
            assert_eq!(b.receive().await.unwrap(), &b"beep"[..]);
            b.send(b"boop").await.unwrap();
            assert_eq!(a.receive().await.unwrap(), &b"boop"[..]);

            // Interleaved directions never reorder within a direction
            for msg in [&b"m1"[..], b"m2", b"m3"] {
                a.send(msg).await.unwrap();
                b.send(msg).await.unwrap();
            }
            for msg in [&b"m1"[..], b"m2", b"m3"] {
                assert_eq!(b.receive().await.unwrap(), msg);
                assert_eq!(a.receive().await.unwrap(), msg);
            }
        });
    }

    #[test_traced]
    fn test_close_idempotent() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let config = Config::default();
            let scope = Scope::root();
            let (mut a, mut b) = setup(&context, &scope, &config);
            assert!(a.done().now_or_never().is_none());
            assert_eq!(config.metrics.workers_running.get(), 4);

            a.close().await;
            assert!(a.done().now_or_never().is_some());
            assert_eq!(a.context().cause(), Some(Cause::Closed));
            a.close().await;
            assert!(a.done().now_or_never().is_some());
            assert_eq!(a.context().cause(), Some(Cause::Closed));

            // Closed connections reject everything
            assert!(matches!(a.send(b"beep").await, Err(Error::Closed)));
            assert!(matches!(a.receive().await, Err(Error::Closed)));

            // Closing one side never cancels the shared parent
            assert!(!scope.is_cancelled());

            b.close().await;
            assert_eq!(config.metrics.workers_running.get(), 0);
        });
    }

    #[test_traced]
    fn test_cancel_implies_close() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let config = Config::default();
            let scope = Scope::root();
            let (mut a, b) = setup(&context, &scope, &config);

            a.context().cancel(Cause::Cancelled);
            a.done().await;
            assert!(a.is_closed());
            assert_eq!(a.context().cause(), Some(Cause::Cancelled));
            assert!(matches!(a.receive().await, Err(Error::Closed)));

            drop(b);
            wait_for_workers(&context, &config.metrics, 0).await;
        });
    }

    #[test_traced]
    fn test_parent_cancel_closes_all() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let config = Config::default();
            let listener = Scope::root();
            let pairs: Vec<_> = (0..5)
                .map(|_| setup(&context, &listener, &config))
                .collect();
            assert_eq!(config.metrics.workers_running.get(), 20);

            listener.cancel(Cause::Cancelled);
            for (a, b) in &pairs {
                assert!(a.done().now_or_never().is_some());
                assert!(b.done().now_or_never().is_some());
                assert_eq!(a.context().cause(), Some(Cause::Cancelled));
            }
            wait_for_workers(&context, &config.metrics, 0).await;
        });
    }

    #[test_traced]
    fn test_drop_closes() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let config = Config::default();
            let (a, b) = setup(&context, &Scope::root(), &config);
            let scope = a.context();
            drop(a);
            assert_eq!(scope.cause(), Some(Cause::Closed));

            drop(b);
            wait_for_workers(&context, &config.metrics, 0).await;
        });
    }

    #[test_traced]
    fn test_transport_failure_closes() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let config = Config::default();
            let (address, _) = addresses();
            let (sink, _stream) = mocks::Channel::init();
            let mut conn = Connection::wrap(
                context.clone(),
                Scope::root(),
                config.clone(),
                RawConnection::new(address, sink, BrokenStream),
            );

            conn.done().await;
            assert_eq!(conn.context().cause(), Some(Cause::Transport));
            assert!(matches!(conn.send(b"beep").await, Err(Error::Closed)));
            conn.close().await;
            assert_eq!(conn.context().cause(), Some(Cause::Transport));
            assert_eq!(config.metrics.workers_running.get(), 0);
        });
    }

    #[test_traced]
    fn test_send_invalid_keeps_open() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let config = Config::default().with_max_message_size(8);
            let (mut a, mut b) = setup(&context, &Scope::root(), &config);
            assert!(matches!(a.send(b"").await, Err(Error::SendZeroSize)));
            assert!(matches!(
                a.send(b"too large!").await,
                Err(Error::SendTooLarge(10))
            ));
            assert!(!a.is_closed());

            a.send(b"fits").await.unwrap();
            assert_eq!(b.receive().await.unwrap(), &b"fits"[..]);
        });
    }

    #[test_traced]
    fn test_backpressure() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let config = Config::default().with_mailbox_size(1);
            let (address, _) = addresses();
            let mut conn = Connection::wrap(
                context.clone(),
                Scope::root(),
                config.clone(),
                RawConnection::new(address, StalledSink, StalledStream),
            );

            // Eventually the outbound queue fills up and send waits
            let mut blocked = false;
            for _ in 0..10 {
                select! {
                    _ = context.sleep(Duration::from_millis(50)) => {
                        blocked = true;
                    },
                    result = conn.send(b"beep") => {
                        result.unwrap();
                    },
                }
                if blocked {
                    break;
                }
            }
            assert!(blocked);

            // Cancellation releases a blocked sender
            let scope = conn.context();
            context.with_label("canceller").spawn(move |context| async move {
                context.sleep(Duration::from_millis(10)).await;
                scope.cancel(Cause::Cancelled);
            });
            assert!(matches!(conn.send(b"beep").await, Err(Error::Closed)));
            conn.close().await;
            assert_eq!(config.metrics.workers_running.get(), 0);
        });
    }

    #[test_traced]
    fn test_receive_waits_for_close() {
        let executor = deterministic::Runner::default();
        executor.start(|context| async move {
            let (mut a, _b) = setup(&context, &Scope::root(), &Config::default());
            let scope = a.context();
            let receiver = context
                .with_label("receiver")
                .spawn(move |_| async move { a.receive().await });
            context.sleep(Duration::from_millis(10)).await;
            scope.cancel(Cause::Cancelled);
            assert!(matches!(receiver.await.unwrap(), Err(Error::Closed)));
        });
    }
}
