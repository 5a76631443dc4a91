//! Periodic tick source used for supervision.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Cancelable timer producing ticks 1, 2, 3, ... at a fixed interval.
///
/// Tick numbers keep increasing across restarts. A zero interval means the
/// heartbeat never fires.
#[derive(Debug, Default)]
pub struct Heartbeat {
    task: Mutex<Option<JoinHandle<()>>>,
    ticks: Arc<AtomicU64>,
}

impl Heartbeat {
    /// Create an idle heartbeat
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer, replacing a running one; returns `false` for a zero interval
    pub fn start<F>(&self, interval: Duration, on_tick: F) -> bool
    where
        F: Fn(u64) + Send + 'static,
    {
        self.stop();
        if interval.is_zero() {
            debug!("Heartbeat interval is zero, not generating ticks");
            return false;
        }

        let ticks = self.ticks.clone();
        let handle = tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + interval, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                let tick = ticks.fetch_add(1, Ordering::SeqCst) + 1;
                on_tick(tick);
            }
        });

        *self.lock_task() = Some(handle);
        true
    }

    /// Cancel the timer; returns whether one was running
    pub fn stop(&self) -> bool {
        match self.lock_task().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Whether a timer is armed
    pub fn is_running(&self) -> bool {
        self.lock_task()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// Number of ticks generated so far
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    fn lock_task(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[tokio::test(start_paused = true)]
    async fn test_ticks_at_interval() {
        let heartbeat = Heartbeat::new();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();

        assert!(heartbeat.start(Duration::from_millis(100), move |tick| {
            sink.lock().unwrap().push(tick);
        }));
        assert!(heartbeat.is_running());

        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(heartbeat.ticks(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_cancels() {
        let heartbeat = Heartbeat::new();
        let count = Arc::new(AtomicU64::new(0));
        let sink = count.clone();
        heartbeat.start(Duration::from_millis(50), move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(heartbeat.stop());
        assert!(!heartbeat.stop());
        let after_stop = count.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
        assert!(!heartbeat.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_never_fires() {
        let heartbeat = Heartbeat::new();
        let count = Arc::new(AtomicU64::new(0));
        let sink = count.clone();
        assert!(!heartbeat.start(Duration::ZERO, move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        }));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(!heartbeat.is_running());
    }
}
