//! Application-level heartbeat for subscription connections.
//!
//! Sends `{"action":"ping"}` on a fixed interval while the socket is open
//! and tracks ping, pong and message timing.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::debug;

/// Heartbeat state for one connection. Reset on every open.
pub struct HeartbeatMonitor {
    /// `None` disables the heartbeat.
    interval: Option<Duration>,
    last_ping: RwLock<Option<DateTime<Utc>>>,
    last_pong: RwLock<Option<DateTime<Utc>>>,
    last_message: RwLock<Option<DateTime<Utc>>>,
    pings_sent: AtomicU64,
}

impl HeartbeatMonitor {
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval: (interval_ms > 0).then(|| Duration::from_millis(interval_ms)),
            last_ping: RwLock::new(None),
            last_pong: RwLock::new(None),
            last_message: RwLock::new(None),
            pings_sent: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.interval.is_some()
    }

    /// Reset timing state (called on open).
    pub fn reset(&self) {
        *self.last_ping.write() = None;
        *self.last_pong.write() = None;
        *self.last_message.write() = None;
    }

    pub fn record_ping(&self) {
        *self.last_ping.write() = Some(Utc::now());
        self.pings_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pong(&self) {
        let now = Utc::now();
        *self.last_pong.write() = Some(now);

        if let Some(ping_time) = *self.last_ping.read() {
            let rtt_ms = (now - ping_time).num_milliseconds();
            debug!(rtt_ms, "Received pong");
        }
    }

    pub fn record_message(&self) {
        *self.last_message.write() = Some(Utc::now());
    }

    /// Ping ticker, first tick one interval after open.
    pub fn ticker(&self) -> Option<Interval> {
        self.interval.map(|period| {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        })
    }

    pub fn stats(&self) -> HeartbeatStats {
        HeartbeatStats {
            last_ping: *self.last_ping.read(),
            last_pong: *self.last_pong.read(),
            last_message: *self.last_message.read(),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
        }
    }
}

/// Heartbeat statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatStats {
    pub last_ping: Option<DateTime<Utc>>,
    pub last_pong: Option<DateTime<Utc>>,
    pub last_message: Option<DateTime<Utc>>,
    /// Pings sent over the connection's lifetime, across reconnects.
    pub pings_sent: u64,
}

/// Wait for the next tick, forever when the heartbeat is disabled.
pub(crate) async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker.as_mut() {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_interval_disables() {
        let hb = HeartbeatMonitor::new(0);
        assert!(!hb.is_enabled());
        assert!(hb.ticker().is_none());
    }

    #[test]
    fn test_ping_pong_stats() {
        let hb = HeartbeatMonitor::new(30000);
        assert_eq!(hb.stats(), HeartbeatStats::default());

        hb.record_ping();
        hb.record_pong();
        hb.record_message();
        let stats = hb.stats();
        assert!(stats.last_ping.is_some());
        assert!(stats.last_pong >= stats.last_ping);
        assert!(stats.last_message.is_some());
        assert_eq!(stats.pings_sent, 1);

        hb.reset();
        let stats = hb.stats();
        assert!(stats.last_ping.is_none());
        assert_eq!(stats.pings_sent, 1);
    }

    #[tokio::test]
    async fn test_ticker_first_tick_after_one_interval() {
        let hb = HeartbeatMonitor::new(40);
        let start = Instant::now();
        let mut ticker = hb.ticker();
        next_tick(&mut ticker).await;
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
