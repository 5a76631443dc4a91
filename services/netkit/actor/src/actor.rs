//! Actor: a session with an inbox, an outbox and an optional heartbeat.
//!
//! Everything sent to the inbox is handed to the [`Handler`] on the inbox's
//! worker, one message at a time. Results, lifecycle changes and (optionally)
//! heartbeat ticks are published to the outbox, which is what other components
//! subscribe to.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ActorError;
use crate::heartbeat::Heartbeat;
use crate::lifecycle::{LifecycleHooks, Session, Status};
use crate::message::{Content, ContentKind, Message};
use crate::queue::{MessageBox, Subscription};

/// Actor settings
#[derive(Debug, Clone)]
pub struct ActorConfig {
    /// Name used for queue names and logs
    pub name: String,
    /// Heartbeat interval; zero disables the heartbeat
    pub heartbeat_interval: Duration,
    /// Publish a `Status` message to the outbox on every transition
    pub publish_status: bool,
    /// Republish heartbeat ticks to the outbox
    pub publish_heartbeat: bool,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            name: "actor".to_string(),
            heartbeat_interval: Duration::ZERO,
            publish_status: true,
            publish_heartbeat: false,
        }
    }
}

impl ActorConfig {
    /// Default settings with a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the heartbeat interval
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

/// Behaviour plugged into an [`Actor`]
pub trait Handler: Send + Sync + 'static {
    /// Handle one inbox message (heartbeat ticks go to `on_heartbeat`)
    fn receive(&self, ctx: &ActorContext, message: &Message) -> anyhow::Result<()>;

    /// Handle a heartbeat tick while started
    fn on_heartbeat(&self, _ctx: &ActorContext, _tick: u64) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called while the actor is starting
    fn on_starting(&self, _ctx: &ActorContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once the actor is started and its heartbeat armed
    fn on_started(&self, _ctx: &ActorContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called while the actor is stopping, after the heartbeat is cancelled
    fn on_stopping(&self, _ctx: &ActorContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once the actor is stopped
    fn on_stopped(&self, _ctx: &ActorContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// State shared between an actor and its handler
#[derive(Debug)]
pub struct ActorContext {
    config: ActorConfig,
    session: Arc<Session>,
    inbox: MessageBox<Message>,
    outbox: MessageBox<Message>,
    heartbeat: Heartbeat,
    disposed: AtomicBool,
}

impl ActorContext {
    /// Actor name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Actor settings
    pub fn config(&self) -> &ActorConfig {
        &self.config
    }

    /// Underlying lifecycle session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Current status
    pub fn status(&self) -> Status {
        self.session.status()
    }

    /// Whether the actor is started
    pub fn is_started(&self) -> bool {
        self.session.is_started()
    }

    /// Inbound queue
    pub fn inbox(&self) -> &MessageBox<Message> {
        &self.inbox
    }

    /// Outbound queue
    pub fn outbox(&self) -> &MessageBox<Message> {
        &self.outbox
    }

    /// Number of heartbeat ticks generated so far
    pub fn heartbeat_ticks(&self) -> u64 {
        self.heartbeat.ticks()
    }

    /// Publish content to the outbox as a message sent by this actor
    pub fn publish(&self, content: impl Into<Content>) -> bool {
        self.outbox
            .enqueue(Message::from_session(&self.session, content))
    }

    /// Publish an already built message to the outbox
    pub fn publish_message(&self, message: Message) -> bool {
        self.outbox.enqueue(message)
    }

    /// Forward a message to the outbox wrapped with this actor as sender
    pub fn forward(&self, message: &Message) -> bool {
        self.outbox.enqueue(message.forward(&self.session))
    }

    /// Queue a message for this actor's own handler
    pub fn tell(&self, message: Message) -> bool {
        self.inbox.enqueue(message)
    }

    fn publish_status(&self, status: Status) {
        if self.config.publish_status {
            self.publish(Content::Status(status));
        }
    }

    fn arm_heartbeat(&self) {
        let inbox = self.inbox.clone();
        let session = Arc::downgrade(&self.session);
        let armed = self
            .heartbeat
            .start(self.config.heartbeat_interval, move |tick| {
                let mut message = Message::heartbeat(tick);
                if let Some(session) = session.upgrade() {
                    message = message.sent_by(&session);
                }
                inbox.enqueue(message);
            });
        if armed {
            debug!(
                "Actor {} heartbeat armed every {:?}",
                self.config.name, self.config.heartbeat_interval
            );
        }
    }
}

struct Hooks<'a, H> {
    ctx: &'a ActorContext,
    handler: &'a H,
}

impl<H: Handler> LifecycleHooks for Hooks<'_, H> {
    fn on_starting(&self) -> anyhow::Result<()> {
        self.ctx.publish_status(Status::Starting);
        self.handler.on_starting(self.ctx)
    }

    fn on_started(&self) -> anyhow::Result<()> {
        self.ctx.arm_heartbeat();
        self.ctx.publish_status(Status::Started);
        self.handler.on_started(self.ctx)
    }

    fn on_stopping(&self) -> anyhow::Result<()> {
        self.ctx.heartbeat.stop();
        self.ctx.publish_status(Status::Stopping);
        self.handler.on_stopping(self.ctx)
    }

    fn on_stopped(&self) -> anyhow::Result<()> {
        self.ctx.publish_status(Status::Stopped);
        self.handler.on_stopped(self.ctx)
    }
}

fn dispatch<H: Handler>(ctx: &ActorContext, handler: &H, message: &Message) -> anyhow::Result<()> {
    if let Content::Heartbeat(tick) = message.content() {
        if !ctx.is_started() {
            return Ok(());
        }
        if ctx.config.publish_heartbeat {
            ctx.publish(Content::Heartbeat(*tick));
        }
        return handler.on_heartbeat(ctx, *tick);
    }
    handler.receive(ctx, message)
}

/// Session + inbox + outbox + heartbeat driving a [`Handler`]
pub struct Actor<H: Handler> {
    ctx: Arc<ActorContext>,
    handler: Arc<H>,
    inbox_subscription: Mutex<Option<Subscription>>,
}

impl<H: Handler> Actor<H> {
    /// Build an actor; must be called inside a Tokio runtime
    pub fn new(config: ActorConfig, handler: H) -> Self {
        let ctx = Arc::new(ActorContext {
            inbox: MessageBox::new(format!("{}-inbox", config.name)),
            outbox: MessageBox::new(format!("{}-outbox", config.name)),
            session: Arc::new(Session::new()),
            heartbeat: Heartbeat::new(),
            disposed: AtomicBool::new(false),
            config,
        });
        let handler = Arc::new(handler);

        let weak_ctx = Arc::downgrade(&ctx);
        let weak_handler = Arc::downgrade(&handler);
        let name = ctx.config.name.clone();
        let subscription = ctx.inbox.subscribe_with(
            move |message: &Message| {
                match (weak_ctx.upgrade(), weak_handler.upgrade()) {
                    (Some(ctx), Some(handler)) => dispatch(&ctx, handler.as_ref(), message),
                    _ => Ok(()),
                }
            },
            move |err| warn!("Actor {} failed to handle message: {:#}", name, err),
        );

        Self {
            ctx,
            handler,
            inbox_subscription: Mutex::new(Some(subscription)),
        }
    }

    /// Shared context
    pub fn context(&self) -> &Arc<ActorContext> {
        &self.ctx
    }

    /// Plugged-in handler
    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Session id of this actor
    pub fn id(&self) -> u64 {
        self.ctx.session.id()
    }

    /// Actor name
    pub fn name(&self) -> &str {
        self.ctx.name()
    }

    /// Current status
    pub fn status(&self) -> Status {
        self.ctx.status()
    }

    /// Start the actor; returns whether a transition happened
    pub fn start(&self) -> anyhow::Result<bool> {
        if self.ctx.disposed.load(Ordering::SeqCst) {
            return Err(ActorError::Disposed(self.ctx.config.name.clone()).into());
        }
        self.ctx.session.start_with(&self.hooks())
    }

    /// Stop the actor; returns whether a transition happened
    pub fn stop(&self) -> anyhow::Result<bool> {
        self.ctx.session.stop_with(&self.hooks())
    }

    /// Stop then start again
    pub fn restart(&self) -> anyhow::Result<bool> {
        self.stop()?;
        self.start()
    }

    /// Stop, cancel the heartbeat and close both queues for good
    pub fn dispose(&self) -> anyhow::Result<()> {
        if self.ctx.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let stopped = self.stop();
        self.ctx.heartbeat.stop();
        if let Some(subscription) = self
            .inbox_subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        {
            subscription.unsubscribe();
        }
        self.ctx.inbox.close();
        self.ctx.outbox.close();
        debug!("Actor {} disposed", self.ctx.config.name);
        stopped.map(|_| ())
    }

    /// Whether `dispose` was called
    pub fn is_disposed(&self) -> bool {
        self.ctx.disposed.load(Ordering::SeqCst)
    }

    /// Queue a message for the handler
    pub fn tell(&self, message: Message) -> bool {
        self.ctx.tell(message)
    }

    /// Observe every outbox message
    pub fn subscribe<F>(&self, on_message: F) -> Subscription
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ctx.outbox.subscribe(on_message)
    }

    /// Observe outbox messages whose content (or wrapped content) has `kind`
    pub fn subscribe_kind<F>(&self, kind: ContentKind, on_message: F) -> Subscription
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ctx
            .outbox
            .subscribe_filtered(move |message: &Message| message.is(kind), on_message)
    }

    /// Observe outbox messages carrying an application value of type `T`
    pub fn subscribe_typed<T, F>(&self, on_value: F) -> Subscription
    where
        T: Any + Send + Sync,
        F: Fn(&Message, &T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.ctx.outbox.subscribe_filtered(
            |message: &Message| message.is_type::<T>(),
            move |message: &Message| match message.downcast_ref::<T>() {
                Some(value) => on_value(message, value),
                None => Ok(()),
            },
        )
    }

    fn hooks(&self) -> Hooks<'_, H> {
        Hooks {
            ctx: &self.ctx,
            handler: self.handler.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Upper {
        beats: AtomicU64,
    }

    impl Handler for Upper {
        fn receive(&self, ctx: &ActorContext, message: &Message) -> anyhow::Result<()> {
            match message.as_text() {
                Some("fail") => anyhow::bail!("refused"),
                Some(text) => {
                    ctx.publish(text.to_uppercase());
                    Ok(())
                }
                None => Ok(()),
            }
        }

        fn on_heartbeat(&self, _ctx: &ActorContext, _tick: u64) -> anyhow::Result<()> {
            self.beats.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Debug, PartialEq)]
    struct Reading(u32);

    async fn settle<H: Handler>(actor: &Actor<H>) {
        let ctx = actor.context();
        assert!(ctx.inbox().wait_idle(Duration::from_secs(5)).await);
        assert!(ctx.outbox().wait_idle(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_lifecycle_published_to_outbox() {
        let actor = Actor::new(ActorConfig::named("status"), Upper::default());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = actor.subscribe_kind(ContentKind::Status, move |m| {
            sink.lock().unwrap().push(m.as_status().unwrap());
            Ok(())
        });

        assert!(actor.start().unwrap());
        assert!(actor.stop().unwrap());
        settle(&actor).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Status::Starting,
                Status::Started,
                Status::Stopping,
                Status::Stopped
            ]
        );
    }

    #[tokio::test]
    async fn test_handler_results_and_errors() {
        let actor = Actor::new(ActorConfig::named("upper"), Upper::default());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = actor.subscribe_kind(ContentKind::Text, move |m| {
            sink.lock().unwrap().push(m.as_text().unwrap().to_string());
            Ok(())
        });
        actor.start().unwrap();

        actor.tell(Message::new("one"));
        actor.tell(Message::new("fail"));
        actor.tell(Message::new("two"));
        settle(&actor).await;

        assert_eq!(*seen.lock().unwrap(), vec!["ONE", "TWO"]);
        assert_eq!(actor.context().inbox().processed(), 3);
    }

    #[tokio::test]
    async fn test_typed_subscription_unwraps() {
        let actor = Actor::new(ActorConfig::named("typed"), Upper::default());
        let relay = Arc::new(Session::with_id(99));
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = actor.subscribe_typed::<Reading, _>(move |_, reading| {
            sink.lock().unwrap().push(reading.0);
            Ok(())
        });

        let ctx = actor.context();
        ctx.publish_message(Message::other(Reading(1)));
        ctx.publish_message(Message::other(Reading(2)).forward(&relay));
        ctx.publish("not a reading");
        settle(&actor).await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_republish_is_optional() {
        let config = ActorConfig {
            name: "beats".to_string(),
            heartbeat_interval: Duration::from_millis(100),
            publish_status: false,
            publish_heartbeat: true,
        };
        let actor = Actor::new(config, Upper::default());
        let published = Arc::new(AtomicU64::new(0));
        let sink = published.clone();
        let _sub = actor.subscribe_kind(ContentKind::Heartbeat, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        actor.start().unwrap();
        tokio::time::sleep(Duration::from_millis(350)).await;
        actor.stop().unwrap();
        settle(&actor).await;

        assert_eq!(actor.handler().beats.load(Ordering::SeqCst), 3);
        assert_eq!(published.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_secs(1)).await;
        settle(&actor).await;
        assert_eq!(actor.handler().beats.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_heartbeat_ignored_while_stopped() {
        let actor = Actor::new(ActorConfig::named("idle"), Upper::default());
        actor.tell(Message::heartbeat(1));
        settle(&actor).await;
        assert_eq!(actor.handler().beats.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_dispose_makes_queues_inert() {
        let actor = Actor::new(ActorConfig::named("gone"), Upper::default());
        actor.start().unwrap();
        actor.dispose().unwrap();

        assert!(actor.is_disposed());
        assert_eq!(actor.status(), Status::Stopped);
        assert!(!actor.tell(Message::new("late")));
        assert!(actor.start().is_err());
    }
}
