//! Peer selection for the download manager: which donor serves the next
//! chunk, and whether an in-progress transfer should be abandoned for a
//! faster one.
//!
//! Grounded on the same "single mutex, held only around the op" discipline
//! as [`crate::chunk::store::ChunkIndex`] — this is bookkeeping, not I/O, so
//! it never needs to be held across a socket or disk operation.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::PeerId;

/// Tracks, per peer, the most recently observed round-trip and the last
/// time it was handed a chunk — the two factors spec.md §4.6 names for
/// donor selection ("lowest observed round-trip and least recent usage;
/// ties broken by peer ID hash").
pub struct Scheduler {
    observed_rtt: Mutex<HashMap<PeerId, Duration>>,
    last_used: Mutex<HashMap<PeerId, Instant>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self { observed_rtt: Mutex::new(HashMap::new()), last_used: Mutex::new(HashMap::new()) }
    }

    /// Record a fresh round-trip observation (e.g. time-to-first-byte of a
    /// `GET_CHUNK` reply) for a peer.
    pub fn record_rtt(&self, peer: PeerId, rtt: Duration) {
        self.observed_rtt.lock().unwrap().insert(peer, rtt);
    }

    /// Mark a peer as just having been handed work, for least-recent-use
    /// comparisons against other candidates.
    pub fn record_used(&self, peer: PeerId) {
        self.last_used.lock().unwrap().insert(peer, Instant::now());
    }

    /// Observed rate (bytes/sec) last recorded for a peer, or `0.0` if none.
    pub fn observed_rate(&self, peer: PeerId, rates: &HashMap<PeerId, f64>) -> f64 {
        rates.get(&peer).copied().unwrap_or(0.0)
    }

    /// Choose a donor among `candidates` (peers known to own the needed
    /// digest and currently available): lowest observed round-trip first,
    /// then least-recent usage, ties broken by peer ID hash so the choice is
    /// deterministic across replays.
    pub fn choose_donor(&self, candidates: &[PeerId]) -> Option<PeerId> {
        if candidates.is_empty() {
            return None;
        }
        let rtt = self.observed_rtt.lock().unwrap();
        let last_used = self.last_used.lock().unwrap();
        candidates
            .iter()
            .copied()
            .min_by(|a, b| {
                let rtt_a = rtt.get(a).copied().unwrap_or(Duration::MAX);
                let rtt_b = rtt.get(b).copied().unwrap_or(Duration::MAX);
                rtt_a
                    .cmp(&rtt_b)
                    .then_with(|| last_used_order(last_used.get(a).copied(), last_used.get(b).copied()))
                    .then_with(|| peer_hash(a).cmp(&peer_hash(b)))
            })
    }

    /// Whether an in-progress transfer from `current` should be cancelled in
    /// favor of `candidate_rate` — spec.md §4.6 "Switching peers": cancel
    /// when `current_rate * switch_to_another_peer_factor < candidate_rate`.
    pub fn should_switch(&self, current_rate: f64, candidate_rate: f64, factor: f64) -> bool {
        current_rate * factor < candidate_rate
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Older (earlier) usage sorts first; a peer never used sorts before one
/// that has been, matching "least recent usage" preferring the idlest peer.
fn last_used_order(a: Option<Instant>, b: Option<Instant>) -> std::cmp::Ordering {
    match (a, b) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(&y),
    }
}

fn peer_hash(id: &PeerId) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}
