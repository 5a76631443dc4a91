//! Four-state lifecycle shared by every long-lived entity.
//!
//! A [`Session`] moves `Stopped -> Starting -> Started` on start and
//! `Started -> Stopping -> Stopped` on stop. Transitions are serialized by a
//! dedicated lock while the current status stays readable lock-free, so hooks
//! may inspect the session they belong to. Hooks must not start or stop the
//! same session re-entrantly.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::id::{self, IdGenerator};

/// Lifecycle status of a session
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Not running; the only state `start` acts on
    Stopped = 0,
    /// `on_starting` is running
    Starting = 1,
    /// Running; the only state `stop` acts on
    Started = 2,
    /// `on_stopping` is running
    Stopping = 3,
}

impl Status {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Status::Starting,
            2 => Status::Started,
            3 => Status::Stopping,
            _ => Status::Stopped,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Stopped => "stopped",
            Status::Starting => "starting",
            Status::Started => "started",
            Status::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Callbacks invoked around lifecycle transitions.
///
/// Errors propagate to the caller of `start`/`stop`. A failing `on_starting`
/// rolls the session back to `Stopped`, a failing `on_stopping` rolls it back
/// to `Started`; failures of the other two hooks leave the reached state.
pub trait LifecycleHooks {
    /// Called after the status became `Starting`
    fn on_starting(&self) -> anyhow::Result<()> {
        Ok(())
    }
    /// Called after the status became `Started`
    fn on_started(&self) -> anyhow::Result<()> {
        Ok(())
    }
    /// Called after the status became `Stopping`
    fn on_stopping(&self) -> anyhow::Result<()> {
        Ok(())
    }
    /// Called after the status became `Stopped`
    fn on_stopped(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl LifecycleHooks for NoHooks {}

#[derive(Debug, Clone, Copy, Default)]
struct Timestamps {
    started_at: Option<Instant>,
    stopped_at: Option<Instant>,
}

/// Lifecycle state machine with a process-unique id
#[derive(Debug)]
pub struct Session {
    id: u64,
    status: AtomicU8,
    times: RwLock<Timestamps>,
    transition: Mutex<()>,
}

impl Session {
    /// Create a stopped session with an id from the process-wide generator
    pub fn new() -> Self {
        Self::with_id(id::next_id())
    }

    /// Create a stopped session with an id from an injected generator
    pub fn with_generator(ids: &IdGenerator) -> Self {
        Self::with_id(ids.next_id())
    }

    /// Create a stopped session with an explicit id
    pub fn with_id(id: u64) -> Self {
        Self {
            id,
            status: AtomicU8::new(Status::Stopped as u8),
            times: RwLock::new(Timestamps::default()),
            transition: Mutex::new(()),
        }
    }

    /// Session id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current status
    pub fn status(&self) -> Status {
        Status::from_u8(self.status.load(Ordering::Acquire))
    }

    /// Whether the session is `Started`
    pub fn is_started(&self) -> bool {
        self.status() == Status::Started
    }

    /// When the session last reached `Starting`
    pub fn started_at(&self) -> Option<Instant> {
        self.read_times().started_at
    }

    /// When the session last reached `Stopped`; cleared by the next start
    pub fn stopped_at(&self) -> Option<Instant> {
        self.read_times().stopped_at
    }

    /// Time spent running since the last start, if started
    pub fn uptime(&self) -> Option<Duration> {
        if !self.is_started() {
            return None;
        }
        self.started_at().map(|at| at.elapsed())
    }

    /// Start without hooks
    pub fn start(&self) -> anyhow::Result<bool> {
        self.start_with(&NoHooks)
    }

    /// Stop without hooks
    pub fn stop(&self) -> anyhow::Result<bool> {
        self.stop_with(&NoHooks)
    }

    /// Transition `Stopped -> Started`, returning whether a transition happened
    pub fn start_with(&self, hooks: &dyn LifecycleHooks) -> anyhow::Result<bool> {
        let _guard = self.lock_transition();
        if self.status() != Status::Stopped {
            return Ok(false);
        }

        self.set_status(Status::Starting);
        if let Err(e) = hooks.on_starting() {
            self.set_status(Status::Stopped);
            return Err(e);
        }

        {
            let mut times = self.write_times();
            times.started_at = Some(Instant::now());
            times.stopped_at = None;
        }

        self.set_status(Status::Started);
        trace!("Session {} started", self.id);
        hooks.on_started()?;
        Ok(true)
    }

    /// Transition `Started -> Stopped`, returning whether a transition happened
    pub fn stop_with(&self, hooks: &dyn LifecycleHooks) -> anyhow::Result<bool> {
        let _guard = self.lock_transition();
        if self.status() != Status::Started {
            return Ok(false);
        }

        self.set_status(Status::Stopping);
        if let Err(e) = hooks.on_stopping() {
            self.set_status(Status::Started);
            return Err(e);
        }

        self.write_times().stopped_at = Some(Instant::now());

        self.set_status(Status::Stopped);
        trace!("Session {} stopped", self.id);
        hooks.on_stopped()?;
        Ok(true)
    }

    /// Stop then start again with the same hooks
    pub fn restart_with(&self, hooks: &dyn LifecycleHooks) -> anyhow::Result<bool> {
        self.stop_with(hooks)?;
        self.start_with(hooks)
    }

    fn set_status(&self, status: Status) {
        self.status.store(status as u8, Ordering::Release);
    }

    fn lock_transition(&self) -> MutexGuard<'_, ()> {
        self.transition
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_times(&self) -> Timestamps {
        *self
            .times
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_times(&self) -> std::sync::RwLockWriteGuard<'_, Timestamps> {
        self.times
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
