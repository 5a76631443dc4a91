//! Error types for the actor substrate.

use std::any::Any;
use thiserror::Error;

/// Failure of a queue subscriber that did not return an error itself
#[derive(Error, Debug)]
pub enum SubscriberError {
    /// The callback panicked
    #[error("subscriber panicked: {0}")]
    Panicked(String),
}

impl SubscriberError {
    pub(crate) fn from_panic(payload: &(dyn Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        SubscriberError::Panicked(message)
    }
}

/// Actor lifecycle errors
#[derive(Error, Debug)]
pub enum ActorError {
    /// The actor was disposed and cannot run again
    #[error("actor {0} is disposed")]
    Disposed(String),
}
