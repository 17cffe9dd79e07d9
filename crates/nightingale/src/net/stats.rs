use std::sync::atomic::{AtomicU64, Ordering};

/// Drops outbound datagrams at random after they have been stamped into the
/// ledger, so the peer's acknowledgments report them as undelivered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PacketLossSimulation {
    pub enabled: bool,
    /// Chance of dropping a datagram, 0-100.
    pub loss_percent: f32,
}

impl PacketLossSimulation {
    pub fn new(loss_percent: f32) -> Self {
        Self {
            enabled: true,
            loss_percent: loss_percent.clamp(0.0, 100.0),
        }
    }

    pub fn should_drop(&self) -> bool {
        if !self.enabled || self.loss_percent <= 0.0 {
            return false;
        }
        rand_percent() * 100.0 < self.loss_percent
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworkStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Inbound datagrams thrown away as malformed or foreign.
    pub packets_discarded: u64,
    pub packets_simulated_lost: u64,
}

impl NetworkStats {
    pub fn simulated_loss_ratio(&self) -> f32 {
        let attempted = self.packets_sent + self.packets_simulated_lost;
        if attempted == 0 {
            return 0.0;
        }
        self.packets_simulated_lost as f32 / attempted as f32
    }
}

/// Counters updated from the receive thread and from senders concurrently.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_discarded: AtomicU64,
    packets_simulated_lost: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_discarded(&self) {
        self.packets_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_simulated_loss(&self) {
        self.packets_simulated_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> NetworkStats {
        NetworkStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_discarded: self.packets_discarded.load(Ordering::Relaxed),
            packets_simulated_lost: self.packets_simulated_lost.load(Ordering::Relaxed),
        }
    }
}

/// Uniform-ish value in `[0, 1)`, seeded per call from the std hasher.
pub fn rand_percent() -> f32 {
    (rand_u64() % 10_000) as f32 / 10_000.0
}

fn rand_u64() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u128(nanos);
    hasher.finish()
}
