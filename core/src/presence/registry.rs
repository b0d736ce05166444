//! Peer registry: who is alive right now, seen through relays or directly

use crate::identity::PeerId;
use crate::relay::PresencePulse;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Status recorded for peers refreshed through a direct link
pub const DIRECT_STATUS: &str = "direct";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    /// Milliseconds since the epoch
    pub last_seen: u64,
    pub status: String,
    pub platform: Option<String>,
    /// Currently refreshed by a live direct connection
    pub direct: bool,
    /// Timestamp of the newest relay pulse, if any
    pub last_pulse: Option<u64>,
}

pub struct PeerRegistry {
    local: PeerId,
    staleness: Duration,
    peers: Mutex<HashMap<PeerId, PeerRecord>>,
}

impl PeerRegistry {
    pub fn new(local: PeerId, staleness: Duration) -> Self {
        Self {
            local,
            staleness,
            peers: Mutex::new(HashMap::new()),
        }
    }

    pub fn staleness_window(&self) -> Duration {
        self.staleness
    }

    fn is_fresh(&self, timestamp: u64, now: u64) -> bool {
        (now.saturating_sub(timestamp) as u128) < self.staleness.as_millis()
    }

    /// Upsert from a relay pulse. Returns false if the pulse was ignored
    /// (our own, or already stale). Timestamps in the future are clamped.
    pub fn observe_pulse(&self, peer_id: &PeerId, pulse: &PresencePulse, now: u64) -> bool {
        if peer_id == &self.local {
            return false;
        }
        let timestamp = pulse.timestamp.min(now);
        if !self.is_fresh(timestamp, now) {
            debug!("Ignoring stale pulse from {}", peer_id.short());
            return false;
        }

        let mut peers = self.peers.lock();
        let record = peers.entry(peer_id.clone()).or_insert_with(|| PeerRecord {
            peer_id: peer_id.clone(),
            last_seen: timestamp,
            status: pulse.status.clone(),
            platform: None,
            direct: false,
            last_pulse: None,
        });
        if record.last_pulse.map_or(true, |seen| timestamp >= seen) {
            record.last_pulse = Some(timestamp);
            record.platform = Some(pulse.platform.clone());
            if !record.direct {
                record.status = pulse.status.clone();
            }
        }
        record.last_seen = record.last_seen.max(timestamp);
        true
    }

    /// Mark a direct peer as seen now
    pub fn refresh_direct(&self, peer_id: &PeerId, now: u64) {
        if peer_id == &self.local {
            return;
        }
        let mut peers = self.peers.lock();
        let record = peers.entry(peer_id.clone()).or_insert_with(|| PeerRecord {
            peer_id: peer_id.clone(),
            last_seen: now,
            status: DIRECT_STATUS.to_string(),
            platform: None,
            direct: true,
            last_pulse: None,
        });
        record.last_seen = record.last_seen.max(now);
        record.status = DIRECT_STATUS.to_string();
        record.direct = true;
    }

    /// The direct link to `peer_id` went away. The record falls back to its
    /// last relay pulse, or disappears if it never had one.
    pub fn remove_direct(&self, peer_id: &PeerId) {
        let mut peers = self.peers.lock();
        let Some(record) = peers.get_mut(peer_id) else {
            return;
        };
        if !record.direct {
            return;
        }
        match record.last_pulse {
            Some(pulse_at) => {
                record.direct = false;
                record.last_seen = pulse_at;
                record.status = "online".to_string();
            }
            None => {
                peers.remove(peer_id);
            }
        }
    }

    /// One heartbeat: refresh every connected direct peer, then evict
    /// everything older than the staleness window. Returns evicted peers.
    pub fn tick(&self, direct_peers: &[PeerId], now: u64) -> Vec<PeerId> {
        let mut peers = self.peers.lock();
        for peer_id in direct_peers {
            if peer_id == &self.local {
                continue;
            }
            let record = peers.entry(peer_id.clone()).or_insert_with(|| PeerRecord {
                peer_id: peer_id.clone(),
                last_seen: now,
                status: DIRECT_STATUS.to_string(),
                platform: None,
                direct: true,
                last_pulse: None,
            });
            record.last_seen = record.last_seen.max(now);
            record.status = DIRECT_STATUS.to_string();
            record.direct = true;
        }

        let evicted: Vec<PeerId> = peers
            .values()
            .filter(|r| !self.is_fresh(r.last_seen, now))
            .map(|r| r.peer_id.clone())
            .collect();
        for peer_id in &evicted {
            peers.remove(peer_id);
        }
        if !evicted.is_empty() {
            debug!("Evicted {} stale peers", evicted.len());
        }
        evicted
    }

    pub fn peer_count(&self) -> usize {
        self.peer_count_at(crate::now_millis())
    }

    /// Live peers at `now`; stale entries are not counted even before the
    /// next tick removes them
    pub fn peer_count_at(&self, now: u64) -> usize {
        self.peers
            .lock()
            .values()
            .filter(|r| self.is_fresh(r.last_seen, now))
            .count()
    }

    pub fn live_peers(&self) -> Vec<PeerRecord> {
        self.live_peers_at(crate::now_millis())
    }

    pub fn live_peers_at(&self, now: u64) -> Vec<PeerRecord> {
        let mut live: Vec<PeerRecord> = self
            .peers
            .lock()
            .values()
            .filter(|r| self.is_fresh(r.last_seen, now))
            .cloned()
            .collect();
        live.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        live
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.peers.lock().get(peer_id).cloned()
    }

    pub fn is_live(&self, peer_id: &PeerId) -> bool {
        let now = crate::now_millis();
        self.peers
            .lock()
            .get(peer_id)
            .map(|r| self.is_fresh(r.last_seen, now))
            .unwrap_or(false)
    }
}
