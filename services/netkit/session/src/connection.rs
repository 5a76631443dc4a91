//! One socket driven by a reader task and a writer task.
//!
//! The reader appends to an accumulation buffer and extracts frames until the
//! encoder reports a partial one; only the bytes of decoded frames are removed.
//! The writer serves two queues: protocol replies first, then application sends
//! once the protocol is ready. Both tasks only enqueue events to the sink; they
//! never call back into their owner.

use bytes::BytesMut;
use netkit_actor::{Content, LifecycleHooks, Message, MessageBox, Session, Status};
use netkit_wire::{Encoder, Extracted};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::pool::BufferPool;
use crate::protocol::{Disposition, Protocol, ProtocolFactory};
use crate::stats::{ConnectionStats, StatsSnapshot};

/// Spare capacity ensured before every read
const READ_RESERVE: usize = 8 * 1024;

/// Identity of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Session id of the connection
    pub id: u64,
    /// Local socket address
    pub local: SocketAddr,
    /// Peer socket address
    pub remote: SocketAddr,
    /// Accepted by a listener rather than dialed
    pub is_server: bool,
}

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Decoded from the socket
    Incoming,
    /// Written to the socket
    Outgoing,
}

/// A value that crossed a connection, published as an `Other` message
#[derive(Debug, Clone)]
pub struct Transfer<T> {
    /// Incoming or outgoing
    pub direction: Direction,
    /// Connection the value crossed
    pub connection: ConnectionInfo,
    /// Encoded size in bytes
    pub bytes: usize,
    /// The value itself
    pub value: T,
}

/// Per-connection behaviour switches
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectionOptions {
    /// Send every decoded frame back through the encoder's echo policy
    pub echo: bool,
}

enum Outbound<T> {
    Packet(T),
    Close,
}

/// State shared by the handle and both tasks
struct Shared {
    info: ConnectionInfo,
    session: Arc<Session>,
    stats: ConnectionStats,
    sink: MessageBox<Message>,
    shutdown: watch::Sender<bool>,
}

impl Shared {
    fn publish(&self, content: impl Into<Content>) {
        self.sink.enqueue(Message::from_session(&self.session, content));
    }

    fn publish_transfer<T: Send + Sync + 'static>(
        &self,
        direction: Direction,
        bytes: usize,
        value: T,
    ) {
        let transfer = Transfer {
            direction,
            connection: self.info,
            bytes,
            value,
        };
        self.sink
            .enqueue(Message::other(transfer).sent_by(&self.session));
    }

    fn stop(&self) {
        if let Err(err) = self.session.stop_with(self) {
            warn!("Connection {} failed to stop cleanly: {:#}", self.info.id, err);
        }
    }

    fn fail(&self, err: TransportError) {
        if !self.session.is_started() {
            debug!(
                "Discarding error from stopped connection {}: {}",
                self.info.id, err
            );
            return;
        }
        warn!(
            "Connection {} ({} -> {}) failed: {}",
            self.info.id, self.info.local, self.info.remote, err
        );
        self.sink.enqueue(Message::error(err).sent_by(&self.session));
        self.stop();
    }
}

impl LifecycleHooks for Shared {
    fn on_starting(&self) -> anyhow::Result<()> {
        self.publish(Status::Starting);
        Ok(())
    }

    fn on_started(&self) -> anyhow::Result<()> {
        self.publish(Status::Started);
        Ok(())
    }

    fn on_stopping(&self) -> anyhow::Result<()> {
        self.shutdown.send_replace(true);
        self.publish(Status::Stopping);
        Ok(())
    }

    fn on_stopped(&self) -> anyhow::Result<()> {
        self.publish(Status::Stopped);
        Ok(())
    }
}

/// How the reader ended
enum ReadEnd {
    /// Stop the session now
    Stopped,
    /// The writer stops the session once it has flushed the close
    Closing,
}

struct Reader<E: Encoder> {
    shared: Arc<Shared>,
    encoder: Arc<E>,
    protocol: Box<dyn Protocol<E::Item>>,
    control_tx: mpsc::UnboundedSender<Outbound<E::Item>>,
    ready_tx: watch::Sender<bool>,
    echo: bool,
}

impl<E: Encoder> Reader<E> {
    async fn run(
        mut self,
        mut socket: OwnedReadHalf,
        pool: Arc<BufferPool>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buf = pool.acquire();
        let result = self.read_loop(&mut socket, &mut buf, &mut shutdown).await;
        pool.release(buf);

        match result {
            Ok(ReadEnd::Stopped) => self.shared.stop(),
            Ok(ReadEnd::Closing) => {}
            Err(err) => self.shared.fail(err),
        }
    }

    async fn read_loop(
        &mut self,
        socket: &mut OwnedReadHalf,
        buf: &mut BytesMut,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<ReadEnd, TransportError> {
        let mut replies = Vec::new();
        self.protocol.on_open(&self.shared.info, &mut replies)?;
        self.flush_replies(&mut replies);

        loop {
            if let Some(end) = self.drain(buf, &mut replies)? {
                return Ok(end);
            }
            if *shutdown.borrow() {
                return Ok(ReadEnd::Stopped);
            }

            buf.reserve(READ_RESERVE);
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(ReadEnd::Stopped);
                    }
                }
                read = socket.read_buf(buf) => {
                    if read? == 0 {
                        debug!("Connection {} closed by {}", self.shared.info.id, self.shared.info.remote);
                        return Ok(ReadEnd::Stopped);
                    }
                }
            }
        }
    }

    /// Handle every complete frame in `buf`
    fn drain(
        &mut self,
        buf: &mut BytesMut,
        replies: &mut Vec<E::Item>,
    ) -> Result<Option<ReadEnd>, TransportError> {
        while let Some(Extracted { value, consumed }) = self.encoder.decode_from(buf)? {
            if !self.shared.session.is_started() {
                return Ok(Some(ReadEnd::Stopped));
            }
            self.shared.stats.record_received(consumed);

            let disposition = self
                .protocol
                .on_packet(&self.shared.info, &value, replies)?;
            self.flush_replies(replies);

            match disposition {
                Disposition::Deliver => {
                    if self.echo {
                        if let Some(reply) = self.encoder.echo(&value) {
                            let _ = self.control_tx.send(Outbound::Packet(reply));
                        }
                    }
                    self.shared
                        .publish_transfer(Direction::Incoming, consumed, value)
                }
                Disposition::Consume => {}
                Disposition::Shutdown => {
                    let _ = self.control_tx.send(Outbound::Close);
                    return Ok(Some(ReadEnd::Closing));
                }
            }
        }
        Ok(None)
    }

    fn flush_replies(&self, replies: &mut Vec<E::Item>) {
        for reply in replies.drain(..) {
            let _ = self.control_tx.send(Outbound::Packet(reply));
        }
        let ready = self.protocol.is_ready();
        self.ready_tx.send_if_modified(|current| {
            if *current == ready {
                false
            } else {
                *current = ready;
                true
            }
        });
    }
}

struct Writer<E: Encoder> {
    shared: Arc<Shared>,
    encoder: Arc<E>,
    control_rx: mpsc::UnboundedReceiver<Outbound<E::Item>>,
    app_rx: mpsc::UnboundedReceiver<Outbound<E::Item>>,
    ready_rx: watch::Receiver<bool>,
    shutdown: watch::Receiver<bool>,
}

impl<E: Encoder> Writer<E> {
    async fn run(mut self, mut socket: OwnedWriteHalf) {
        match self.write_loop(&mut socket).await {
            Ok(()) => self.shared.stop(),
            Err(err) => self.shared.fail(err),
        }
    }

    async fn write_loop(&mut self, socket: &mut OwnedWriteHalf) -> Result<(), TransportError> {
        loop {
            if *self.shutdown.borrow() {
                return Ok(());
            }
            let ready = *self.ready_rx.borrow();

            let command = tokio::select! {
                biased;
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    continue;
                }
                Some(command) = self.control_rx.recv() => command,
                Some(command) = self.app_rx.recv(), if ready => command,
                Ok(()) = self.ready_rx.changed(), if !ready => continue,
            };

            match command {
                Outbound::Packet(value) => {
                    let bytes = self.encoder.encode(&value)?;
                    socket.write_all(&bytes).await?;
                    if !self.shared.session.is_started() {
                        return Ok(());
                    }
                    self.shared.stats.record_sent(bytes.len());
                    self.shared
                        .publish_transfer(Direction::Outgoing, bytes.len(), value);
                }
                Outbound::Close => {
                    socket.shutdown().await?;
                    debug!("Connection {} closed gracefully", self.shared.info.id);
                    return Ok(());
                }
            }
        }
    }
}

/// A running connection over one TCP socket
pub struct Connection<E: Encoder> {
    shared: Arc<Shared>,
    app_tx: mpsc::UnboundedSender<Outbound<E::Item>>,
}

impl<E: Encoder> std::fmt::Debug for Connection<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("info", &self.shared.info)
            .field("status", &self.shared.session.status())
            .finish()
    }
}

impl<E: Encoder> Connection<E> {
    /// Start a connection over `stream`; must be called inside a Tokio runtime.
    ///
    /// Status changes, transfers and errors are published to `sink`.
    pub fn open(
        stream: TcpStream,
        is_server: bool,
        encoder: Arc<E>,
        protocols: &dyn ProtocolFactory<E::Item>,
        sink: MessageBox<Message>,
        pool: Arc<BufferPool>,
        options: ConnectionOptions,
    ) -> Result<Self, TransportError> {
        let session = Arc::new(Session::new());
        let info = ConnectionInfo {
            id: session.id(),
            local: stream.local_addr()?,
            remote: stream.peer_addr()?,
            is_server,
        };
        let protocol = protocols.create(&info);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = watch::channel(false);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (app_tx, app_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            info,
            session,
            stats: ConnectionStats::default(),
            sink,
            shutdown: shutdown_tx,
        });
        if let Err(err) = shared.session.start_with(shared.as_ref()) {
            warn!("Connection {} failed to start cleanly: {:#}", info.id, err);
        }
        debug!(
            "Connection {} open ({} -> {}, server: {})",
            info.id, info.local, info.remote, is_server
        );

        let (read_half, write_half) = stream.into_split();
        let reader = Reader {
            shared: shared.clone(),
            encoder: encoder.clone(),
            protocol,
            control_tx,
            ready_tx,
            echo: options.echo,
        };
        let writer = Writer {
            shared: shared.clone(),
            encoder,
            control_rx,
            app_rx,
            ready_rx,
            shutdown: shutdown_rx.clone(),
        };
        tokio::spawn(reader.run(read_half, pool, shutdown_rx));
        tokio::spawn(writer.run(write_half));

        Ok(Self { shared, app_tx })
    }

    /// Identity of this connection
    pub fn info(&self) -> &ConnectionInfo {
        &self.shared.info
    }

    /// Session id
    pub fn id(&self) -> u64 {
        self.shared.info.id
    }

    /// Local socket address
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.info.local
    }

    /// Peer socket address
    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.info.remote
    }

    /// Accepted by a listener rather than dialed
    pub fn is_server(&self) -> bool {
        self.shared.info.is_server
    }

    /// Lifecycle session
    pub fn session(&self) -> &Arc<Session> {
        &self.shared.session
    }

    /// Current status
    pub fn status(&self) -> Status {
        self.shared.session.status()
    }

    /// Whether the connection is running
    pub fn is_started(&self) -> bool {
        self.shared.session.is_started()
    }

    /// When the connection stopped, if it has
    pub fn stopped_at(&self) -> Option<Instant> {
        self.shared.session.stopped_at()
    }

    /// Traffic counters
    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Queue a value for writing; false once the connection stopped
    pub fn send(&self, value: E::Item) -> bool {
        self.is_started() && self.app_tx.send(Outbound::Packet(value)).is_ok()
    }

    /// Close after every value queued so far has been written
    pub fn close(&self) -> bool {
        self.is_started() && self.app_tx.send(Outbound::Close).is_ok()
    }

    /// Stop both tasks now and drop the socket
    pub fn stop(&self) {
        self.shared.stop();
    }
}

impl<E: Encoder> Drop for Connection<E> {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PlainFactory, WsServerFactory};
    use netkit_actor::Subscription;
    use netkit_wire::{JsonEncoder, TextEncoder, WsEncoder, WsFrame};
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (peer, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, peer.unwrap())
    }

    fn sink() -> (
        MessageBox<Message>,
        mpsc::UnboundedReceiver<Message>,
        Subscription,
    ) {
        let sink = MessageBox::new("test-sink");
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = sink.subscribe(move |message: &Message| {
            let _ = tx.send(message.clone());
            Ok(())
        });
        (sink, rx, subscription)
    }

    fn open_text(stream: TcpStream, sink: MessageBox<Message>, echo: bool) -> Connection<TextEncoder> {
        Connection::open(
            stream,
            true,
            Arc::new(TextEncoder::new("\n").unwrap()),
            &PlainFactory,
            sink,
            Arc::new(BufferPool::default()),
            ConnectionOptions { echo },
        )
        .unwrap()
    }

    async fn next_transfer<T: Clone + Send + Sync + 'static>(
        rx: &mut mpsc::UnboundedReceiver<Message>,
    ) -> Transfer<T> {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let Some(transfer) = message.downcast_ref::<Transfer<T>>() {
                return transfer.clone();
            }
        }
    }

    async fn wait_stopped<E: Encoder>(connection: &Connection<E>) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while connection.status() != Status::Stopped {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_frames_split_across_reads() {
        let (server, mut peer) = socket_pair().await;
        let (sink, mut rx, _sub) = sink();
        let connection = open_text(server, sink, false);

        peer.write_all(b"hel").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.write_all(b"lo\nwor").await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        peer.write_all(b"ld\n").await.unwrap();

        let first = next_transfer::<String>(&mut rx).await;
        assert_eq!(first.value, "hello");
        assert_eq!(first.bytes, 6);
        assert_eq!(first.direction, Direction::Incoming);
        assert_eq!(first.connection.remote, peer.local_addr().unwrap());

        let second = next_transfer::<String>(&mut rx).await;
        assert_eq!(second.value, "world");
        assert_eq!(connection.stats().messages_received, 2);
        assert_eq!(connection.stats().bytes_received, 12);
    }

    #[tokio::test]
    async fn test_send_publishes_outgoing() {
        let (server, mut peer) = socket_pair().await;
        let (sink, mut rx, _sub) = sink();
        let connection = open_text(server, sink, false);

        assert!(connection.send("ping".to_string()));
        let mut buf = [0u8; 5];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\n");

        let sent = next_transfer::<String>(&mut rx).await;
        assert_eq!(sent.direction, Direction::Outgoing);
        assert_eq!(sent.bytes, 5);
        assert_eq!(connection.stats().bytes_sent, 5);
    }

    #[tokio::test]
    async fn test_echo_option() {
        let (server, mut peer) = socket_pair().await;
        let (sink, _rx, _sub) = sink();
        let _connection = open_text(server, sink, true);

        peer.write_all(b"again\n").await.unwrap();
        let mut buf = [0u8; 6];
        tokio::time::timeout(Duration::from_secs(5), peer.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"again\n");
    }

    #[tokio::test]
    async fn test_echo_skips_frames_rejected_by_protocol() {
        let (server, mut peer) = socket_pair().await;
        let (sink, mut rx, _sub) = sink();
        let connection = Connection::open(
            server,
            true,
            Arc::new(WsEncoder::server()),
            &WsServerFactory,
            sink,
            Arc::new(BufferPool::default()),
            ConnectionOptions { echo: true },
        )
        .unwrap();

        peer.write_all(&WsFrame::text("early").with_mask([1, 2, 3, 4]).encode())
            .await
            .unwrap();

        let error = loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let Some(err) = message.as_error() {
                break err.to_string();
            }
        };
        assert!(error.contains("before upgrade"), "{error}");
        wait_stopped(&connection).await;

        let mut echoed = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), peer.read_to_end(&mut echoed))
            .await
            .unwrap()
            .unwrap();
        assert!(echoed.is_empty(), "nothing may be echoed before the upgrade");
        assert_eq!(connection.stats().bytes_sent, 0);
    }

    #[tokio::test]
    async fn test_peer_close_stops_session() {
        let (server, peer) = socket_pair().await;
        let (sink, mut rx, _sub) = sink();
        let connection = open_text(server, sink, false);
        drop(peer);

        wait_stopped(&connection).await;
        assert!(connection.stopped_at().is_some());
        assert!(!connection.send("late".to_string()));

        let mut statuses = Vec::new();
        while let Ok(Some(message)) =
            tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
        {
            if let Some(status) = message.as_status() {
                statuses.push(status);
            }
        }
        assert_eq!(
            statuses,
            vec![Status::Starting, Status::Started, Status::Stopping, Status::Stopped]
        );
    }

    #[tokio::test]
    async fn test_protocol_error_published() {
        let (server, mut peer) = socket_pair().await;
        let (sink, mut rx, _sub) = sink();
        let connection = Connection::open(
            server,
            true,
            Arc::new(JsonEncoder::<serde_json::Value>::new()),
            &PlainFactory,
            sink,
            Arc::new(BufferPool::default()),
            ConnectionOptions::default(),
        )
        .unwrap();

        peer.write_all(b"[1, 2]").await.unwrap();
        let error = loop {
            let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let Some(err) = message.as_error() {
                break err.to_string();
            }
        };
        assert!(error.starts_with("protocol error"));
        wait_stopped(&connection).await;
    }

    #[tokio::test]
    async fn test_close_flushes_queued_sends() {
        let (server, mut peer) = socket_pair().await;
        let (sink, _rx, _sub) = sink();
        let connection = open_text(server, sink, false);

        connection.send("a".to_string());
        connection.send("b".to_string());
        connection.close();

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), peer.read_to_end(&mut received))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, b"a\nb\n");
        wait_stopped(&connection).await;
    }
}
