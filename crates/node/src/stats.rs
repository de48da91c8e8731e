use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

#[derive(Clone, Copy, Debug, Default)]
pub struct ListenerStatsSnapshot {
    pub accepted: u64,
    pub active: usize,
    pub rejected: u64,
}

/// Per-listener accept counters, updated from the accept task and read by
/// snapshot code on any thread.
#[derive(Debug, Default)]
pub struct ListenerStats {
    accepted: AtomicU64,
    active: AtomicUsize,
    rejected: AtomicU64,
}

impl ListenerStats {
    pub fn note_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_closed(&self) {
        self.active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_sub(1))
            })
            .ok();
    }

    pub fn note_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ListenerStatsSnapshot {
        ListenerStatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NetTotalsSnapshot {
    pub bytes_recv: u64,
    pub bytes_sent: u64,
    pub connections: usize,
}

/// Process-wide byte and connection totals across every transport.
#[derive(Debug, Default)]
pub struct NetTotals {
    bytes_recv: AtomicU64,
    bytes_sent: AtomicU64,
    connections: AtomicUsize,
}

impl NetTotals {
    pub fn add_recv(&self, bytes: usize) {
        self.bytes_recv.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn add_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn inc_connections(&self) {
        self.connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_connections(&self) {
        self.connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
                Some(value.saturating_sub(1))
            })
            .ok();
    }

    pub fn snapshot(&self) -> NetTotalsSnapshot {
        NetTotalsSnapshot {
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            connections: self.connections.load(Ordering::Relaxed),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PollStatsSnapshot {
    pub polls_ok: u64,
    pub polls_failed: u64,
    pub last_poll_ms: u64,
    pub last_poll_elapsed_ms: u64,
    pub tip_height: i64,
    pub throttled: u64,
}

/// Upstream-node poll bookkeeping, written by the poller task.
#[derive(Debug, Default)]
pub struct PollStats {
    polls_ok: AtomicU64,
    polls_failed: AtomicU64,
    last_poll_ms: AtomicU64,
    last_poll_elapsed_ms: AtomicU64,
    tip_height: AtomicI64,
    throttled: AtomicU64,
}

impl PollStats {
    pub fn note_ok(&self, elapsed_ms: u64) {
        self.polls_ok.fetch_add(1, Ordering::Relaxed);
        self.last_poll_ms
            .store(crate::logging::now_ms(), Ordering::Relaxed);
        self.last_poll_elapsed_ms
            .store(elapsed_ms, Ordering::Relaxed);
    }

    pub fn note_failed(&self) {
        self.polls_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_throttled(&self) {
        self.throttled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_tip_height(&self, height: i64) {
        self.tip_height.store(height, Ordering::Relaxed);
    }

    pub fn tip_height(&self) -> i64 {
        self.tip_height.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PollStatsSnapshot {
        PollStatsSnapshot {
            polls_ok: self.polls_ok.load(Ordering::Relaxed),
            polls_failed: self.polls_failed.load(Ordering::Relaxed),
            last_poll_ms: self.last_poll_ms.load(Ordering::Relaxed),
            last_poll_elapsed_ms: self.last_poll_elapsed_ms.load(Ordering::Relaxed),
            tip_height: self.tip_height.load(Ordering::Relaxed),
            throttled: self.throttled.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_counters() {
        let stats = ListenerStats::default();
        stats.note_accepted();
        stats.note_accepted();
        stats.note_rejected();
        stats.note_closed();
        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.active, 1);
        assert_eq!(snap.rejected, 1);
        // active never underflows
        stats.note_closed();
        stats.note_closed();
        assert_eq!(stats.snapshot().active, 0);
    }

    #[test]
    fn net_totals_accumulate() {
        let totals = NetTotals::default();
        totals.add_recv(10);
        totals.add_sent(20);
        totals.inc_connections();
        let snap = totals.snapshot();
        assert_eq!(snap.bytes_recv, 10);
        assert_eq!(snap.bytes_sent, 20);
        assert_eq!(snap.connections, 1);
        totals.dec_connections();
        totals.dec_connections();
        assert_eq!(totals.snapshot().connections, 0);
    }
}
