//! Process-unique monotonic identifiers.
//!
//! Sessions and messages draw their ids from an [`IdGenerator`]. The process-wide
//! default generator is initialised lazily; code that needs deterministic ids
//! (tests, replay tools) injects its own generator instead.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static GLOBAL_IDS: Lazy<Arc<IdGenerator>> = Lazy::new(|| Arc::new(IdGenerator::new(1)));

/// Monotonic id source backed by an atomic counter
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    /// Create a generator whose first id is `start`
    pub const fn new(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Take the next id
    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Peek at the id that will be handed out next
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Shared handle to the process-wide generator
pub fn global() -> Arc<IdGenerator> {
    GLOBAL_IDS.clone()
}

/// Take the next id from the process-wide generator
pub fn next_id() -> u64 {
    GLOBAL_IDS.next_id()
}
