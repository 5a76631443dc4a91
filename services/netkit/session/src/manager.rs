//! Server and client session managers.
//!
//! A [`SessionManager`] is an actor whose inbox receives every connection
//! event (status changes, transfers, errors). Its heartbeat drives the
//! housekeeping: restarting a lost listener, reconnecting a client, dropping
//! connections that stopped longer ago than the retention window, and emitting
//! a [`Report`]. Everything received is forwarded to the outbox, which is the
//! surface applications subscribe to.

use netkit_actor::{
    Actor, ActorConfig, ActorContext, ContentKind, Handler, Message, MessageBox, Session, Status,
    Subscription,
};
use netkit_wire::{Encoder, WsEncoder, WsFrame};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionInfo, ConnectionOptions, Direction, Transfer};
use crate::error::TransportError;
use crate::pool::BufferPool;
use crate::protocol::{PlainFactory, ProtocolFactory, WsClientFactory, WsServerFactory};
use crate::registry::SessionRegistry;
use crate::stats::{Report, ReportWindow};
use crate::transport::{connect_with_timeout, listen_tcp};

/// Which side of the conversation a manager plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Accept connections on `bind`
    Server {
        /// Listen address; port 0 picks a free port
        bind: SocketAddr,
    },
    /// Keep one connection to `remote`
    Client {
        /// Server address
        remote: SocketAddr,
    },
}

/// Automatic handling of incoming application values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayMode {
    /// Only publish them
    #[default]
    None,
    /// Send each value back to its sender
    Echo,
    /// Send each value to every other connection
    Broadcast,
}

/// Recipients of [`SessionManager::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every running connection
    All,
    /// The connection to this peer address
    Address(SocketAddr),
    /// Back to the peer that sent a value
    Echo(SocketAddr),
    /// Every connection except this peer
    Broadcast(SocketAddr),
}

impl Target {
    /// Whether a connection with identity `info` is a recipient
    pub fn matches(&self, info: &ConnectionInfo) -> bool {
        match self {
            Target::All => true,
            Target::Address(addr) | Target::Echo(addr) => info.remote == *addr,
            Target::Broadcast(sender) => info.remote != *sender,
        }
    }
}

/// Manager settings
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Name used for queues, logs and reports
    pub name: String,
    /// Housekeeping period
    pub heartbeat_interval: Duration,
    /// How long stopped connections stay registered
    pub retention: Duration,
    /// Upper bound for draining events on `stop`
    pub drain_timeout: Duration,
    /// Upper bound for one connect attempt
    pub connect_timeout: Duration,
    /// Automatic echo/broadcast of incoming values
    pub relay: RelayMode,
    /// Connection-level echo of every decoded frame
    pub echo: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "netkit".to_string(),
            heartbeat_interval: Duration::from_secs(1),
            retention: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            relay: RelayMode::None,
            echo: false,
        }
    }
}

impl ManagerConfig {
    /// Default settings with a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// State shared by the manager handle, its handler and its background tasks
struct ManagerShared<E: Encoder> {
    config: ManagerConfig,
    mode: Mode,
    component: &'static str,
    encoder: Arc<E>,
    protocols: Box<dyn ProtocolFactory<E::Item>>,
    registry: SessionRegistry<Connection<E>>,
    pool: Arc<BufferPool>,
    window: ReportWindow,
    listener: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    listening: AtomicBool,
    connecting: AtomicBool,
    draining: AtomicBool,
    connect_attempts: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Pause before accepting again after a per-connection accept failure
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Accept failures that concern one pending connection or a momentary
/// resource shortage, leaving the listening socket usable
fn is_transient_accept_error(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    if matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    ) {
        return true;
    }
    // ENOMEM, ENFILE, EMFILE, ENOBUFS
    matches!(err.raw_os_error(), Some(12 | 23 | 24 | 105))
}

impl<E: Encoder> ManagerShared<E> {
    fn on_event(&self, ctx: &ActorContext, message: &Message) {
        if let Some(transfer) = message.downcast_ref::<Transfer<E::Item>>() {
            match transfer.direction {
                Direction::Incoming => {
                    self.window.record_received(transfer.bytes);
                    self.relay(transfer);
                }
                Direction::Outgoing => self.window.record_sent(transfer.bytes),
            }
        } else if let Some(status) = message.as_status() {
            match status {
                Status::Started => {
                    self.window.record_connected();
                    info!(
                        component = self.component,
                        "Connection {} started",
                        message.sender_id().unwrap_or_default()
                    );
                }
                Status::Stopped => {
                    self.window.record_disconnected();
                    info!(
                        component = self.component,
                        "Connection {} stopped",
                        message.sender_id().unwrap_or_default()
                    );
                }
                _ => {}
            }
        } else if let Some(err) = message.as_error() {
            warn!(component = self.component, "{}", err);
        }

        ctx.forward(message);
    }

    fn relay(&self, transfer: &Transfer<E::Item>) {
        let sender = transfer.connection.remote;
        let target = match self.config.relay {
            RelayMode::None => return,
            RelayMode::Echo => Target::Echo(sender),
            RelayMode::Broadcast => Target::Broadcast(sender),
        };
        if let Some(value) = self.encoder.echo(&transfer.value) {
            self.send(value, target);
        }
    }

    fn send(&self, value: E::Item, target: Target) -> usize {
        self.send_where(value, |info| target.matches(info))
    }

    fn send_where<P>(&self, value: E::Item, predicate: P) -> usize
    where
        P: Fn(&ConnectionInfo) -> bool,
    {
        self.registry
            .connections_where(predicate)
            .iter()
            .filter(|connection| connection.send(value.clone()))
            .count()
    }

    fn on_heartbeat(self: &Arc<Self>, ctx: &ActorContext, tick: u64) {
        if self.draining.load(Ordering::SeqCst) {
            return;
        }

        match self.mode {
            Mode::Server { bind } => self.ensure_listener(ctx, bind),
            Mode::Client { remote } => self.ensure_connected(ctx, remote),
        }

        if let Some(cutoff) = Instant::now().checked_sub(self.config.retention) {
            let removed = self.registry.cleanup(cutoff);
            if removed > 0 {
                debug!(
                    component = self.component,
                    "Cleaned up {} stopped connections", removed
                );
            }
        }

        let report = self.window.take(
            &self.config.name,
            self.registry.active_count(),
            Instant::now(),
        );
        debug!(component = self.component, "Tick {}: {}", tick, report);
        ctx.publish_message(Message::other(report).sent_by(ctx.session()));
    }

    /// Restart the listener if it was lost
    fn ensure_listener(self: &Arc<Self>, ctx: &ActorContext, bind: SocketAddr) {
        if self.listening.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = self.clone();
        let sink = ctx.inbox().clone();
        let session = ctx.session().clone();
        tokio::spawn(async move {
            match shared.bind_listener(bind, sink.clone(), session.clone()).await {
                Ok(_) => {}
                Err(TransportError::Closed) => {
                    debug!(component = shared.component, "Dropped listener bound after stop");
                }
                Err(err) => {
                    warn!(component = shared.component, "Failed to listen on {}: {}", bind, err);
                    sink.enqueue(Message::error(err).sent_by(&session));
                }
            }
        });
    }

    /// Bind and spawn the accept loop; `listening` must already be set.
    ///
    /// Fails with [`TransportError::Closed`] when the manager stopped while
    /// the bind was in flight; the port is released again in that case.
    async fn bind_listener(
        self: &Arc<Self>,
        bind: SocketAddr,
        sink: MessageBox<Message>,
        session: Arc<Session>,
    ) -> Result<SocketAddr, TransportError> {
        let bound = async {
            let listener = listen_tcp(bind).await?;
            let local = listener.local_addr()?;
            Ok::<_, TransportError>((listener, local))
        }
        .await;
        let (listener, local) = match bound {
            Ok(bound) => bound,
            Err(err) => {
                self.listening.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };

        if self.is_stale(&session) {
            drop(listener);
            self.listening.store(false, Ordering::SeqCst);
            return Err(TransportError::Closed);
        }

        *lock(&self.local_addr) = Some(local);
        info!(component = self.component, "Listening on {}", local);

        let shared = self.clone();
        let accept_session = session.clone();
        let task =
            tokio::spawn(async move { shared.accept_loop(listener, sink, accept_session).await });
        if let Some(previous) = lock(&self.listener).replace(task) {
            previous.abort();
        }

        // stop() may have released the listener between the check and the install
        if self.is_stale(&session) {
            self.shutdown_listener();
            return Err(TransportError::Closed);
        }
        Ok(local)
    }

    fn is_stale(&self, session: &Session) -> bool {
        !session.is_started() || self.draining.load(Ordering::SeqCst)
    }

    async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        sink: MessageBox<Message>,
        session: Arc<Session>,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    if self.is_stale(&session) {
                        debug!(component = self.component, "Refusing {} while stopping", peer);
                        continue;
                    }
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY for {}: {}", peer, err);
                    }
                    self.register(stream, true, &sink, &session);
                }
                Err(err) if is_transient_accept_error(&err) => {
                    warn!(component = self.component, "Accept failed, retrying: {}", err);
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
                Err(err) => {
                    self.listening.store(false, Ordering::SeqCst);
                    *lock(&self.local_addr) = None;
                    warn!(component = self.component, "Listener lost: {}", err);
                    sink.enqueue(Message::error(TransportError::from(err)).sent_by(&session));
                    return;
                }
            }
        }
    }

    fn shutdown_listener(&self) {
        if let Some(task) = lock(&self.listener).take() {
            task.abort();
            debug!(component = self.component, "Listener stopped");
        }
        *lock(&self.local_addr) = None;
        self.listening.store(false, Ordering::SeqCst);
    }

    /// Start one connect attempt unless connected or already connecting
    fn ensure_connected(self: &Arc<Self>, ctx: &ActorContext, remote: SocketAddr) {
        if self.registry.active_count() > 0 || self.connecting.swap(true, Ordering::SeqCst) {
            return;
        }
        let attempt = self.connect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            component = self.component,
            "Connecting to {} (attempt {})", remote, attempt
        );

        let shared = self.clone();
        let sink = ctx.inbox().clone();
        let session = ctx.session().clone();
        tokio::spawn(async move {
            match connect_with_timeout(remote, shared.config.connect_timeout).await {
                Ok(stream) if session.is_started() && !shared.draining.load(Ordering::SeqCst) => {
                    shared.register(stream, false, &sink, &session);
                }
                Ok(_) => debug!(
                    component = shared.component,
                    "Dropping connection to {} made while stopping", remote
                ),
                Err(err) if session.is_started() => {
                    sink.enqueue(Message::error(err).sent_by(&session));
                }
                Err(err) => debug!(component = shared.component, "Connect after stop: {}", err),
            }
            shared.connecting.store(false, Ordering::SeqCst);
        });
    }

    fn register(
        &self,
        stream: TcpStream,
        is_server: bool,
        sink: &MessageBox<Message>,
        session: &Arc<Session>,
    ) {
        let opened = Connection::open(
            stream,
            is_server,
            self.encoder.clone(),
            self.protocols.as_ref(),
            sink.clone(),
            self.pool.clone(),
            ConnectionOptions {
                echo: self.config.echo,
            },
        );
        match opened {
            Ok(connection) => self.registry.add(Arc::new(connection)),
            Err(err) => {
                sink.enqueue(Message::error(err).sent_by(session));
            }
        }
    }
}

struct ManagerHandler<E: Encoder> {
    shared: Arc<ManagerShared<E>>,
}

impl<E: Encoder> Handler for ManagerHandler<E> {
    fn receive(&self, ctx: &ActorContext, message: &Message) -> anyhow::Result<()> {
        self.shared.on_event(ctx, message);
        Ok(())
    }

    fn on_heartbeat(&self, ctx: &ActorContext, tick: u64) -> anyhow::Result<()> {
        self.shared.on_heartbeat(ctx, tick);
        Ok(())
    }

    fn on_started(&self, ctx: &ActorContext) -> anyhow::Result<()> {
        info!(component = self.shared.component, "{} started", ctx.name());
        Ok(())
    }

    fn on_stopping(&self, _ctx: &ActorContext) -> anyhow::Result<()> {
        self.shared.shutdown_listener();
        Ok(())
    }

    fn on_stopped(&self, ctx: &ActorContext) -> anyhow::Result<()> {
        info!(component = self.shared.component, "{} stopped", ctx.name());
        Ok(())
    }
}

/// Accepts or dials connections and routes their events through one actor
pub struct SessionManager<E: Encoder> {
    actor: Actor<ManagerHandler<E>>,
    shared: Arc<ManagerShared<E>>,
}

impl<E: Encoder> std::fmt::Debug for SessionManager<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("name", &self.shared.config.name)
            .field("mode", &self.shared.mode)
            .field("status", &self.actor.status())
            .field("connections", &self.shared.registry.len())
            .finish()
    }
}

impl<E: Encoder> SessionManager<E> {
    /// Build a manager; must be called inside a Tokio runtime
    pub fn new<F>(mode: Mode, encoder: E, protocols: F, config: ManagerConfig) -> Self
    where
        F: ProtocolFactory<E::Item>,
    {
        let component = match mode {
            Mode::Server { .. } => "server",
            Mode::Client { .. } => "client",
        };
        Self::with_component(mode, encoder, Box::new(protocols), config, component)
    }

    fn with_component(
        mode: Mode,
        encoder: E,
        protocols: Box<dyn ProtocolFactory<E::Item>>,
        config: ManagerConfig,
        component: &'static str,
    ) -> Self {
        let actor_config =
            ActorConfig::named(config.name.clone()).with_heartbeat(config.heartbeat_interval);
        let shared = Arc::new(ManagerShared {
            config,
            mode,
            component,
            encoder: Arc::new(encoder),
            protocols,
            registry: SessionRegistry::new(),
            pool: Arc::new(BufferPool::default()),
            window: ReportWindow::new(),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
            listening: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            connect_attempts: AtomicU64::new(0),
        });
        let actor = Actor::new(
            actor_config,
            ManagerHandler {
                shared: shared.clone(),
            },
        );
        Self { actor, shared }
    }

    /// Plain TCP server framing with `encoder`
    pub fn tcp_server(bind: SocketAddr, encoder: E, config: ManagerConfig) -> Self {
        Self::with_component(
            Mode::Server { bind },
            encoder,
            Box::new(PlainFactory),
            config,
            "tcp-server",
        )
    }

    /// Plain TCP client framing with `encoder`
    pub fn tcp_client(remote: SocketAddr, encoder: E, config: ManagerConfig) -> Self {
        Self::with_component(
            Mode::Client { remote },
            encoder,
            Box::new(PlainFactory),
            config,
            "tcp-client",
        )
    }

    /// Manager settings
    pub fn config(&self) -> &ManagerConfig {
        &self.shared.config
    }

    /// Server or client
    pub fn mode(&self) -> Mode {
        self.shared.mode
    }

    /// Session id of the manager
    pub fn id(&self) -> u64 {
        self.actor.id()
    }

    /// Manager name
    pub fn name(&self) -> &str {
        self.actor.name()
    }

    /// Current status
    pub fn status(&self) -> Status {
        self.actor.status()
    }

    /// Whether the manager is running
    pub fn is_started(&self) -> bool {
        self.actor.status() == Status::Started
    }

    /// Address the listener is bound to (server only)
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.shared.local_addr)
    }

    /// Connect attempts made so far (client only)
    pub fn connect_attempts(&self) -> u64 {
        self.shared.connect_attempts.load(Ordering::SeqCst)
    }

    /// Heartbeat ticks generated so far
    pub fn heartbeat_ticks(&self) -> u64 {
        self.actor.context().heartbeat_ticks()
    }

    /// Registered connections, stopped ones included
    pub fn connections(&self) -> Vec<Arc<Connection<E>>> {
        self.shared.registry.select(|_| true)
    }

    /// Number of running connections
    pub fn active_connections(&self) -> usize {
        self.shared.registry.active_count()
    }

    /// Start the manager; a server binds its listener before this returns
    pub async fn start(&self) -> anyhow::Result<bool> {
        if !self.actor.start()? {
            return Ok(false);
        }
        if let Mode::Server { bind } = self.shared.mode {
            if !self.shared.listening.swap(true, Ordering::SeqCst) {
                let ctx = self.actor.context();
                let bound = self
                    .shared
                    .bind_listener(bind, ctx.inbox().clone(), ctx.session().clone())
                    .await;
                if let Err(err) = bound {
                    self.actor.stop()?;
                    return Err(err.into());
                }
            }
        }
        Ok(true)
    }

    /// Stop every connection and drain pending events before releasing the listener
    pub async fn stop(&self) -> anyhow::Result<bool> {
        if !self.is_started() {
            return Ok(false);
        }
        self.shared.draining.store(true, Ordering::SeqCst);
        self.shared.registry.stop_all();

        let ctx = self.actor.context();
        let deadline = Instant::now() + self.shared.config.drain_timeout;
        let inbox_idle = ctx
            .inbox()
            .wait_idle(deadline.saturating_duration_since(Instant::now()))
            .await;
        let outbox_idle = ctx
            .outbox()
            .wait_idle(deadline.saturating_duration_since(Instant::now()))
            .await;
        if !(inbox_idle && outbox_idle) {
            warn!(
                component = self.shared.component,
                "Events still pending after {:?}", self.shared.config.drain_timeout
            );
        }

        self.shared.shutdown_listener();
        let stopped = self.actor.stop();
        self.shared.draining.store(false, Ordering::SeqCst);
        stopped
    }

    /// Queue `value` for every connection matched by `target`; returns how many
    pub fn send(&self, value: E::Item, target: Target) -> usize {
        self.shared.send(value, target)
    }

    /// Queue `value` for every running connection matching `predicate`
    pub fn send_where<P>(&self, value: E::Item, predicate: P) -> usize
    where
        P: Fn(&ConnectionInfo) -> bool,
    {
        self.shared.send_where(value, predicate)
    }

    /// Drop connections that stopped before `cutoff`
    pub fn cleanup(&self, cutoff: Instant) -> usize {
        self.shared.registry.cleanup(cutoff)
    }

    /// Observe every event the manager publishes
    pub fn subscribe<F>(&self, on_message: F) -> Subscription
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.actor.subscribe(on_message)
    }

    /// Observe events whose content (or wrapped content) has `kind`
    pub fn subscribe_kind<F>(&self, kind: ContentKind, on_message: F) -> Subscription
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.actor.subscribe_kind(kind, on_message)
    }

    /// Observe events carrying a value of type `T`, such as [`Report`] or [`Transfer`]
    pub fn subscribe_typed<T, F>(&self, on_value: F) -> Subscription
    where
        T: Any + Send + Sync,
        F: Fn(&Message, &T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.actor.subscribe_typed(on_value)
    }
}

impl SessionManager<WsEncoder> {
    /// WebSocket server answering upgrade requests on `bind`
    pub fn websocket_server(bind: SocketAddr, config: ManagerConfig) -> Self {
        Self::with_component(
            Mode::Server { bind },
            WsEncoder::server(),
            Box::new(WsServerFactory),
            config,
            "ws-server",
        )
    }

    /// WebSocket client upgrading `path` on `remote`
    pub fn websocket_client(remote: SocketAddr, path: &str, config: ManagerConfig) -> Self {
        Self::with_component(
            Mode::Client { remote },
            WsEncoder::client(),
            Box::new(WsClientFactory::new(path)),
            config,
            "ws-client",
        )
    }

    /// Send a text frame to every connection matched by `target`
    pub fn send_text(&self, text: &str, target: Target) -> usize {
        self.send(WsFrame::text(text).into(), target)
    }
}

impl<E: Encoder> Drop for SessionManager<E> {
    fn drop(&mut self) {
        self.shared.shutdown_listener();
        self.shared.registry.stop_all();
        if let Err(err) = self.actor.dispose() {
            debug!("Manager {} dispose failed: {:#}", self.shared.config.name, err);
        }
    }
}
