//! Traffic counters and periodic reports.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Per-connection traffic counters
#[derive(Debug, Default)]
pub struct ConnectionStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
}

/// Point-in-time copy of [`ConnectionStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Bytes written to the socket
    pub bytes_sent: u64,
    /// Bytes consumed by decoded frames
    pub bytes_received: u64,
    /// Frames written
    pub messages_sent: u64,
    /// Frames decoded
    pub messages_received: u64,
}

impl ConnectionStats {
    /// Count one written frame
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one decoded frame
    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
        }
    }
}

/// Activity of a manager over one reporting window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Manager name
    pub name: String,
    /// Window length in seconds
    pub elapsed_secs: f64,
    /// Connections started during the window
    pub connected: u64,
    /// Connections stopped during the window
    pub disconnected: u64,
    /// Connections running when the report was taken
    pub active: usize,
    /// Traffic during the window
    pub traffic: StatsSnapshot,
    /// Bytes sent per second
    pub bytes_sent_per_sec: f64,
    /// Bytes received per second
    pub bytes_received_per_sec: f64,
    /// Messages sent per second
    pub messages_sent_per_sec: f64,
    /// Messages received per second
    pub messages_received_per_sec: f64,
}

/// `count / elapsed_secs`, or 0 when no time has elapsed
pub fn rate(count: u64, elapsed_secs: f64) -> f64 {
    if elapsed_secs <= 0.0 {
        0.0
    } else {
        count as f64 / elapsed_secs
    }
}

impl Report {
    /// Build a report, deriving rates from the window length
    pub fn new(
        name: impl Into<String>,
        elapsed: Duration,
        connected: u64,
        disconnected: u64,
        active: usize,
        traffic: StatsSnapshot,
    ) -> Self {
        let secs = elapsed.as_secs_f64();
        Self {
            name: name.into(),
            elapsed_secs: secs,
            connected,
            disconnected,
            active,
            traffic,
            bytes_sent_per_sec: rate(traffic.bytes_sent, secs),
            bytes_received_per_sec: rate(traffic.bytes_received, secs),
            messages_sent_per_sec: rate(traffic.messages_sent, secs),
            messages_received_per_sec: rate(traffic.messages_received, secs),
        }
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: active={} connected={} disconnected={} sent={}B/{}msg ({:.1} B/s) received={}B/{}msg ({:.1} B/s) over {:.2}s",
            self.name,
            self.active,
            self.connected,
            self.disconnected,
            self.traffic.bytes_sent,
            self.traffic.messages_sent,
            self.bytes_sent_per_sec,
            self.traffic.bytes_received,
            self.traffic.messages_received,
            self.bytes_received_per_sec,
            self.elapsed_secs
        )
    }
}

/// Counters that reset every time a report is taken
#[derive(Debug)]
pub struct ReportWindow {
    connected: AtomicU64,
    disconnected: AtomicU64,
    traffic: ConnectionStats,
    opened_at: Mutex<Instant>,
}

impl ReportWindow {
    /// Open a window starting now
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    /// Open a window starting at `opened_at`
    pub fn starting_at(opened_at: Instant) -> Self {
        Self {
            connected: AtomicU64::new(0),
            disconnected: AtomicU64::new(0),
            traffic: ConnectionStats::default(),
            opened_at: Mutex::new(opened_at),
        }
    }

    /// Count a started connection
    pub fn record_connected(&self) {
        self.connected.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a stopped connection
    pub fn record_disconnected(&self) {
        self.disconnected.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one frame written
    pub fn record_sent(&self, bytes: usize) {
        self.traffic.record_sent(bytes);
    }

    /// Count one frame received
    pub fn record_received(&self, bytes: usize) {
        self.traffic.record_received(bytes);
    }

    /// Produce a report for the window ending at `now` and start a new one
    pub fn take(&self, name: &str, active: usize, now: Instant) -> Report {
        let elapsed = {
            let mut opened_at = self
                .opened_at
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let elapsed = now.saturating_duration_since(*opened_at);
            *opened_at = now;
            elapsed
        };

        let traffic = StatsSnapshot {
            bytes_sent: self.traffic.bytes_sent.swap(0, Ordering::Relaxed),
            bytes_received: self.traffic.bytes_received.swap(0, Ordering::Relaxed),
            messages_sent: self.traffic.messages_sent.swap(0, Ordering::Relaxed),
            messages_received: self.traffic.messages_received.swap(0, Ordering::Relaxed),
        };

        Report::new(
            name,
            elapsed,
            self.connected.swap(0, Ordering::Relaxed),
            self.disconnected.swap(0, Ordering::Relaxed),
            active,
            traffic,
        )
    }
}

impl Default for ReportWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_with_no_elapsed_time() {
        assert_eq!(rate(100, 0.0), 0.0);
        assert_eq!(rate(100, -1.0), 0.0);
        assert_eq!(rate(100, 4.0), 25.0);
    }

    #[test]
    fn test_connection_counters() {
        let stats = ConnectionStats::default();
        stats.record_sent(10);
        stats.record_sent(5);
        stats.record_received(7);
        assert_eq!(
            stats.snapshot(),
            StatsSnapshot {
                bytes_sent: 15,
                bytes_received: 7,
                messages_sent: 2,
                messages_received: 1,
            }
        );
    }

    #[test]
    fn test_window_resets_on_take() {
        let start = Instant::now();
        let window = ReportWindow::starting_at(start);
        window.record_connected();
        window.record_connected();
        window.record_disconnected();
        window.record_received(200);

        let report = window.take("server", 1, start + Duration::from_secs(2));
        assert_eq!(report.connected, 2);
        assert_eq!(report.disconnected, 1);
        assert_eq!(report.active, 1);
        assert_eq!(report.traffic.bytes_received, 200);
        assert_eq!(report.bytes_received_per_sec, 100.0);
        assert_eq!(report.messages_received_per_sec, 0.5);

        let next = window.take("server", 1, start + Duration::from_secs(2));
        assert_eq!(next.connected, 0);
        assert_eq!(next.traffic, StatsSnapshot::default());
        assert_eq!(next.elapsed_secs, 0.0);
        assert_eq!(next.bytes_received_per_sec, 0.0);
    }

    #[test]
    fn test_report_serializes() {
        let report = Report::new("r", Duration::from_secs(1), 1, 0, 1, StatsSnapshot::default());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["name"], "r");
        assert_eq!(json["active"], 1);
    }
}
