//! Concurrent registry of live and recently stopped sessions.

use dashmap::DashMap;
use netkit_wire::Encoder;
use std::sync::Arc;
use std::time::Instant;

use crate::connection::{Connection, ConnectionInfo};

/// Something the registry can track and clean up
pub trait Tracked: Send + Sync + 'static {
    /// Registry key
    fn key(&self) -> u64;
    /// Whether it is running
    fn is_active(&self) -> bool;
    /// When it stopped, if it has
    fn stopped_at(&self) -> Option<Instant>;
    /// Stop it
    fn stop(&self);
}

impl<E: Encoder> Tracked for Connection<E> {
    fn key(&self) -> u64 {
        self.id()
    }

    fn is_active(&self) -> bool {
        self.is_started()
    }

    fn stopped_at(&self) -> Option<Instant> {
        Connection::stopped_at(self)
    }

    fn stop(&self) {
        Connection::stop(self)
    }
}

/// Sessions keyed by id, shared between accept tasks and the manager
#[derive(Debug)]
pub struct SessionRegistry<C> {
    entries: DashMap<u64, Arc<C>>,
}

impl<C: Tracked> SessionRegistry<C> {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Track `entry`
    pub fn add(&self, entry: Arc<C>) {
        self.entries.insert(entry.key(), entry);
    }

    /// Stop tracking `key`
    pub fn remove(&self, key: u64) -> Option<Arc<C>> {
        self.entries.remove(&key).map(|(_, entry)| entry)
    }

    /// Entry for `key`
    pub fn get(&self, key: u64) -> Option<Arc<C>> {
        self.entries.get(&key).map(|entry| entry.value().clone())
    }

    /// All entries matching `predicate`
    pub fn select<P>(&self, predicate: P) -> Vec<Arc<C>>
    where
        P: Fn(&C) -> bool,
    {
        self.entries
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Running entries
    pub fn active(&self) -> Vec<Arc<C>> {
        self.select(|entry| entry.is_active())
    }

    /// Number of running entries
    pub fn active_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().is_active())
            .count()
    }

    /// Number of tracked entries, stopped ones included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop entries that stopped before `cutoff`; returns how many were removed
    pub fn cleanup(&self, cutoff: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| {
            entry.is_active() || entry.stopped_at().map_or(true, |at| at >= cutoff)
        });
        before.saturating_sub(self.entries.len())
    }

    /// Stop every entry
    pub fn stop_all(&self) {
        for entry in self.entries.iter() {
            entry.value().stop();
        }
    }
}

impl<E: Encoder> SessionRegistry<Connection<E>> {
    /// Running connections whose identity matches `predicate`
    pub fn connections_where<P>(&self, predicate: P) -> Vec<Arc<Connection<E>>>
    where
        P: Fn(&ConnectionInfo) -> bool,
    {
        self.select(|connection| connection.is_started() && predicate(connection.info()))
    }
}

impl<C: Tracked> Default for SessionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug)]
    struct Fake {
        id: u64,
        stopped_at: Mutex<Option<Instant>>,
    }

    impl Fake {
        fn running(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id,
                stopped_at: Mutex::new(None),
            })
        }

        fn stopped(id: u64, at: Instant) -> Arc<Self> {
            Arc::new(Self {
                id,
                stopped_at: Mutex::new(Some(at)),
            })
        }
    }

    impl Tracked for Fake {
        fn key(&self) -> u64 {
            self.id
        }

        fn is_active(&self) -> bool {
            self.stopped_at.lock().unwrap().is_none()
        }

        fn stopped_at(&self) -> Option<Instant> {
            *self.stopped_at.lock().unwrap()
        }

        fn stop(&self) {
            self.stopped_at.lock().unwrap().get_or_insert_with(Instant::now);
        }
    }

    #[test]
    fn test_cleanup_cutoff() {
        let base = Instant::now();
        let registry = SessionRegistry::new();
        registry.add(Fake::running(1));
        registry.add(Fake::stopped(2, base));
        registry.add(Fake::stopped(3, base + Duration::from_secs(10)));
        registry.add(Fake::stopped(4, base + Duration::from_secs(20)));

        let removed = registry.cleanup(base + Duration::from_secs(10));
        assert_eq!(removed, 1);
        assert!(registry.get(2).is_none());
        assert!(registry.get(3).is_some(), "stopped exactly at the cutoff is kept");
        assert!(registry.get(1).is_some());

        assert_eq!(registry.cleanup(base + Duration::from_secs(30)), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_select_and_stop_all() {
        let registry = SessionRegistry::new();
        for id in 1..=4 {
            registry.add(Fake::running(id));
        }
        let even = registry.select(|entry| entry.id % 2 == 0);
        assert_eq!(even.len(), 2);
        assert_eq!(registry.active_count(), 4);

        registry.stop_all();
        assert_eq!(registry.active_count(), 0);
        assert!(registry.active().is_empty());
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_add_replaces_same_key() {
        let registry = SessionRegistry::new();
        registry.add(Fake::running(7));
        registry.add(Fake::running(7));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(7).is_some());
        assert!(registry.is_empty());
    }
}
