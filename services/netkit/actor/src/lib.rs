//! Session lifecycle, ordered message boxes, heartbeats and actors for netkit.
//!
//! This crate is the concurrency substrate the transport layer is built on:
//!
//! - **Session**: four-state lifecycle (`Stopped`, `Starting`, `Started`, `Stopping`)
//!   with hooks, shared by every long-lived entity
//! - **MessageBox**: FIFO publish/subscribe queue served by one worker task, with
//!   per-subscriber failure isolation and pending/processed counters
//! - **Heartbeat**: cancelable periodic tick source
//! - **Actor**: a session owning an inbox, an outbox and an optional heartbeat
//!
//! ## Example
//!
//! ```rust,no_run
//! use netkit_actor::{Actor, ActorConfig, ActorContext, Handler, Message};
//!
//! struct Shout;
//!
//! impl Handler for Shout {
//!     fn receive(&self, ctx: &ActorContext, message: &Message) -> anyhow::Result<()> {
//!         if let Some(text) = message.as_text() {
//!             ctx.publish(text.to_uppercase());
//!         }
//!         Ok(())
//!     }
//! }
//!
//! # async fn example() -> anyhow::Result<()> {
//! let actor = Actor::new(ActorConfig::named("shout"), Shout);
//! let _sub = actor.subscribe(|message| {
//!     println!("{:?}", message.payload());
//!     Ok(())
//! });
//! actor.start()?;
//! actor.tell(Message::new("hello"));
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actor;
pub mod error;
pub mod heartbeat;
pub mod id;
pub mod lifecycle;
pub mod message;
pub mod queue;

// Re-export main types
pub use actor::{Actor, ActorConfig, ActorContext, Handler};
pub use error::{ActorError, SubscriberError};
pub use heartbeat::Heartbeat;
pub use id::IdGenerator;
pub use lifecycle::{LifecycleHooks, NoHooks, Session, Status};
pub use message::{Content, ContentKind, Message};
pub use queue::{ErrorHandler, ItemHandler, MessageBox, Predicate, Subscription};
