//! Lock-free observability snapshot and the tunnel lifecycle broadcast.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::error::CoreError;

/// Lifecycle phase of a tunnel, broadcast on a [`tokio::sync::watch`]
/// channel whenever the peer's handshake/session state changes.
#[derive(Debug, Clone, PartialEq)]
pub enum TunnelState {
    Idle,
    Handshaking,
    Connected,
    Error(String),
}

impl TunnelState {
    pub(crate) fn from_error(err: &CoreError) -> Self {
        TunnelState::Error(err.to_string())
    }
}

/// Counters updated by the forwarder and peer state machine on every
/// packet or handshake event. Each field is independently relaxed: a
/// snapshot may be slightly inconsistent across fields, which is fine
/// for reporting purposes.
#[derive(Default)]
pub struct Stats {
    bytes_tx: AtomicU64,
    bytes_rx: AtomicU64,
    packets_tx: AtomicU64,
    packets_rx: AtomicU64,
    tx_dropped: AtomicU64,
    rx_dropped: AtomicU64,
    current_send_counter: AtomicU64,
    last_handshake_at_millis: AtomicU64,
}

/// A point-in-time copy of [`Stats`], safe to hand to a host application.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub bytes_tx: u64,
    pub bytes_rx: u64,
    pub packets_tx: u64,
    pub packets_rx: u64,
    pub tx_dropped: u64,
    pub rx_dropped: u64,
    pub current_send_counter: u64,
    pub last_handshake_at: Option<Instant>,
}

impl Stats {
    pub fn record_tx(&self, bytes: usize) {
        self.bytes_tx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_tx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rx(&self, bytes: usize) {
        self.bytes_rx.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_rx.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tx_dropped(&self) {
        self.tx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rx_dropped(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_current_send_counter(&self, counter: u64) {
        self.current_send_counter.store(counter, Ordering::Relaxed);
    }

    pub fn record_handshake(&self, at: Instant, epoch: Instant) {
        let millis = at.saturating_duration_since(epoch).as_millis() as u64;
        self.last_handshake_at_millis.store(millis, Ordering::Relaxed);
    }

    pub fn snapshot(&self, epoch: Instant) -> StatsSnapshot {
        let millis = self.last_handshake_at_millis.load(Ordering::Relaxed);
        StatsSnapshot {
            bytes_tx: self.bytes_tx.load(Ordering::Relaxed),
            bytes_rx: self.bytes_rx.load(Ordering::Relaxed),
            packets_tx: self.packets_tx.load(Ordering::Relaxed),
            packets_rx: self.packets_rx.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            current_send_counter: self.current_send_counter.load(Ordering::Relaxed),
            last_handshake_at: if millis == 0 { None } else { Some(epoch + std::time::Duration::from_millis(millis)) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_recorded_traffic() {
        let stats = Stats::default();
        stats.record_tx(100);
        stats.record_rx(50);
        stats.record_tx_dropped();

        let snap = stats.snapshot(Instant::now());
        assert_eq!(snap.bytes_tx, 100);
        assert_eq!(snap.packets_tx, 1);
        assert_eq!(snap.bytes_rx, 50);
        assert_eq!(snap.tx_dropped, 1);
    }
}
