//! Messages exchanged between actors.
//!
//! Content is a tagged union. A message can wrap another message when it is
//! forwarded through a pipeline; every inspection helper walks through the
//! wrappers so subscribers see the innermost payload regardless of how many
//! actors it passed through.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

use crate::id::{self, IdGenerator};
use crate::lifecycle::{Session, Status};

/// Tag of a [`Content`] value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentKind {
    /// No payload
    Empty,
    /// Lifecycle status of the sender
    Status,
    /// Heartbeat tick
    Heartbeat,
    /// UTF-8 text
    Text,
    /// Raw bytes
    Bytes,
    /// JSON document
    Json,
    /// Error raised by the sender
    Error,
    /// Another message
    Wrapped,
    /// Application-defined value
    Other,
}

/// Message payload
#[derive(Clone)]
pub enum Content {
    /// No payload
    Empty,
    /// Lifecycle status of the sender
    Status(Status),
    /// Heartbeat tick
    Heartbeat(u64),
    /// UTF-8 text
    Text(String),
    /// Raw bytes
    Bytes(Bytes),
    /// JSON document
    Json(serde_json::Value),
    /// Error raised by the sender
    Error(Arc<dyn std::error::Error + Send + Sync>),
    /// Another message, kept intact when forwarding
    Wrapped(Box<Message>),
    /// Application-defined value, inspected with [`Message::downcast_ref`]
    Other(Arc<dyn Any + Send + Sync>),
}

impl Content {
    /// Tag of this value
    pub fn kind(&self) -> ContentKind {
        match self {
            Content::Empty => ContentKind::Empty,
            Content::Status(_) => ContentKind::Status,
            Content::Heartbeat(_) => ContentKind::Heartbeat,
            Content::Text(_) => ContentKind::Text,
            Content::Bytes(_) => ContentKind::Bytes,
            Content::Json(_) => ContentKind::Json,
            Content::Error(_) => ContentKind::Error,
            Content::Wrapped(_) => ContentKind::Wrapped,
            Content::Other(_) => ContentKind::Other,
        }
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Content::Empty => f.write_str("Empty"),
            Content::Status(status) => f.debug_tuple("Status").field(status).finish(),
            Content::Heartbeat(tick) => f.debug_tuple("Heartbeat").field(tick).finish(),
            Content::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Content::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Content::Json(value) => f.debug_tuple("Json").field(value).finish(),
            Content::Error(err) => f.debug_tuple("Error").field(&err.to_string()).finish(),
            Content::Wrapped(inner) => f.debug_tuple("Wrapped").field(inner).finish(),
            Content::Other(_) => f.write_str("Other(..)"),
        }
    }
}

impl From<String> for Content {
    fn from(value: String) -> Self {
        Content::Text(value)
    }
}

impl From<&str> for Content {
    fn from(value: &str) -> Self {
        Content::Text(value.to_string())
    }
}

impl From<Bytes> for Content {
    fn from(value: Bytes) -> Self {
        Content::Bytes(value)
    }
}

impl From<serde_json::Value> for Content {
    fn from(value: serde_json::Value) -> Self {
        Content::Json(value)
    }
}

impl From<Status> for Content {
    fn from(value: Status) -> Self {
        Content::Status(value)
    }
}

/// Immutable message with an id, a timestamp and an optional sender
#[derive(Clone, Debug)]
pub struct Message {
    id: u64,
    timestamp: DateTime<Utc>,
    sender_id: Option<u64>,
    sender: Option<Weak<Session>>,
    content: Content,
}

impl Message {
    /// Create a message without a sender
    pub fn new(content: impl Into<Content>) -> Self {
        Self::with_id(id::next_id(), None, content.into())
    }

    /// Create a message sent by `sender`
    pub fn from_session(sender: &Arc<Session>, content: impl Into<Content>) -> Self {
        Self::with_id(id::next_id(), Some(sender), content.into())
    }

    /// Create a message drawing its id from an injected generator
    pub fn with_generator(
        ids: &IdGenerator,
        sender: Option<&Arc<Session>>,
        content: impl Into<Content>,
    ) -> Self {
        Self::with_id(ids.next_id(), sender, content.into())
    }

    fn with_id(id: u64, sender: Option<&Arc<Session>>, content: Content) -> Self {
        Self {
            id,
            timestamp: Utc::now(),
            sender_id: sender.map(|s| s.id()),
            sender: sender.map(Arc::downgrade),
            content,
        }
    }

    /// Heartbeat tick without a sender
    pub fn heartbeat(tick: u64) -> Self {
        Self::new(Content::Heartbeat(tick))
    }

    /// Wrap an application value
    pub fn other<T: Any + Send + Sync>(value: T) -> Self {
        Self::new(Content::Other(Arc::new(value)))
    }

    /// Wrap an error
    pub fn error<E: std::error::Error + Send + Sync + 'static>(err: E) -> Self {
        Self::new(Content::Error(Arc::new(err)))
    }

    /// Replace the sender of a freshly built message
    pub fn sent_by(mut self, sender: &Arc<Session>) -> Self {
        self.sender_id = Some(sender.id());
        self.sender = Some(Arc::downgrade(sender));
        self
    }

    /// Message id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Creation time
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Id of the sending session, still known after the sender is gone
    pub fn sender_id(&self) -> Option<u64> {
        self.sender_id
    }

    /// Sending session, if it is still alive
    pub fn sender(&self) -> Option<Arc<Session>> {
        self.sender.as_ref().and_then(Weak::upgrade)
    }

    /// Content of this message, without unwrapping
    pub fn content(&self) -> &Content {
        &self.content
    }

    /// Tag of this message's own content
    pub fn kind(&self) -> ContentKind {
        self.content.kind()
    }

    /// Wrap this message in a new one sent by `sender`
    pub fn forward(&self, sender: &Arc<Session>) -> Message {
        Message::from_session(sender, Content::Wrapped(Box::new(self.clone())))
    }

    /// Innermost message after walking through wrappers
    pub fn innermost(&self) -> &Message {
        let mut current = self;
        while let Content::Wrapped(inner) = &current.content {
            current = inner;
        }
        current
    }

    /// Innermost content after walking through wrappers
    pub fn payload(&self) -> &Content {
        &self.innermost().content
    }

    /// Whether this message or any message it wraps has content of `kind`
    pub fn is(&self, kind: ContentKind) -> bool {
        let mut current = self;
        loop {
            if current.kind() == kind {
                return true;
            }
            match &current.content {
                Content::Wrapped(inner) => current = inner,
                _ => return false,
            }
        }
    }

    /// Whether the innermost content is an application value of type `T`
    pub fn is_type<T: Any>(&self) -> bool {
        self.downcast_ref::<T>().is_some()
    }

    /// Borrow the innermost application value as `T`
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match self.payload() {
            Content::Other(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }

    /// Innermost text
    pub fn as_text(&self) -> Option<&str> {
        match self.payload() {
            Content::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Innermost bytes
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self.payload() {
            Content::Bytes(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Innermost status
    pub fn as_status(&self) -> Option<Status> {
        match self.payload() {
            Content::Status(status) => Some(*status),
            _ => None,
        }
    }

    /// Innermost heartbeat tick
    pub fn as_heartbeat(&self) -> Option<u64> {
        match self.payload() {
            Content::Heartbeat(tick) => Some(*tick),
            _ => None,
        }
    }

    /// Innermost error
    pub fn as_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self.payload() {
            Content::Error(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Reading(u32);

    #[derive(Debug, thiserror::Error)]
    #[error("boom")]
    struct Boom;

    #[test]
    fn test_nested_unwrap() {
        let origin = Arc::new(Session::with_id(10));
        let relay = Arc::new(Session::with_id(11));

        let msg = Message::from_session(&origin, Content::Other(Arc::new(Reading(5))));
        let forwarded = msg.forward(&relay).forward(&relay);

        assert_eq!(forwarded.kind(), ContentKind::Wrapped);
        assert!(forwarded.is(ContentKind::Other));
        assert!(forwarded.is(ContentKind::Wrapped));
        assert!(!forwarded.is(ContentKind::Text));
        assert_eq!(forwarded.downcast_ref::<Reading>(), Some(&Reading(5)));
        assert!(!forwarded.is_type::<String>());
        assert_eq!(forwarded.sender_id(), Some(11));
        assert_eq!(forwarded.innermost().sender_id(), Some(10));
        assert_eq!(forwarded.innermost().id(), msg.id());
    }

    #[test]
    fn test_sender_is_weak() {
        let session = Arc::new(Session::with_id(12));
        let msg = Message::from_session(&session, "hello");
        assert_eq!(msg.sender().map(|s| s.id()), Some(12));

        drop(session);
        assert!(msg.sender().is_none());
        assert_eq!(msg.sender_id(), Some(12));
        assert_eq!(msg.as_text(), Some("hello"));
    }

    #[test]
    fn test_accessors() {
        assert_eq!(Message::heartbeat(3).as_heartbeat(), Some(3));
        assert_eq!(
            Message::new(Status::Started).as_status(),
            Some(Status::Started)
        );
        assert_eq!(
            Message::new(Bytes::from_static(b"ab")).as_bytes(),
            Some(&Bytes::from_static(b"ab"))
        );
        let err = Message::error(Boom);
        assert_eq!(err.as_error().map(|e| e.to_string()), Some("boom".to_string()));
        assert!(err.as_error().unwrap().downcast_ref::<Boom>().is_some());
    }

    #[test]
    fn test_injected_ids() {
        let ids = IdGenerator::new(500);
        let a = Message::with_generator(&ids, None, Content::Empty);
        let b = Message::with_generator(&ids, None, Content::Empty);
        assert_eq!((a.id(), b.id()), (500, 501));
    }
}
