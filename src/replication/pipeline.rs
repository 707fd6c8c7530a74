use log::debug;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::timeouts;

/// Per-peer dispatch slot. At most one request is in flight per peer; the
/// next one goes out either immediately (more operations pending) or at the
/// heartbeat interval.
#[derive(Debug, Clone)]
struct PeerSlot {
    in_flight: bool,
    last_dispatch: Option<Instant>,
    /// Set when a response said more operations are waiting.
    send_immediately: bool,
}

impl PeerSlot {
    fn new() -> Self {
        Self {
            in_flight: false,
            last_dispatch: None,
            send_immediately: true,
        }
    }
}

/// Decides when each remote peer is due a request. The pipeline owns no
/// I/O: the replica asks `due_peers`, builds requests from the queue, and
/// reports completions back.
#[derive(Debug)]
pub struct LeaderPipeline {
    slots: HashMap<Uuid, PeerSlot>,
    heartbeat_interval: Duration,
}

impl LeaderPipeline {
    pub fn new() -> Self {
        Self::with_heartbeat_interval(timeouts::HEARTBEAT_INTERVAL)
    }

    pub fn with_heartbeat_interval(heartbeat_interval: Duration) -> Self {
        Self {
            slots: HashMap::new(),
            heartbeat_interval,
        }
    }

    /// Rebuilds the slot set for a new leader term. All prior in-flight
    /// bookkeeping is dropped.
    pub fn reset(&mut self, peers: impl IntoIterator<Item = Uuid>) {
        self.slots.clear();
        for uuid in peers {
            self.slots.insert(uuid, PeerSlot::new());
        }
    }

    pub fn track_peer(&mut self, uuid: Uuid) {
        self.slots.entry(uuid).or_insert_with(PeerSlot::new);
    }

    pub fn untrack_peer(&mut self, uuid: &Uuid) {
        self.slots.remove(uuid);
    }

    pub fn peer_count(&self) -> usize {
        self.slots.len()
    }

    /// Peers that should be sent a request now: nothing in flight, and
    /// either flagged for immediate dispatch or heartbeat-due.
    pub fn due_peers(&self, now: Instant) -> Vec<Uuid> {
        self.slots
            .iter()
            .filter(|(_, slot)| !slot.in_flight)
            .filter(|(_, slot)| {
                slot.send_immediately
                    || slot
                        .last_dispatch
                        .map(|at| now.saturating_duration_since(at) >= self.heartbeat_interval)
                        .unwrap_or(true)
            })
            .map(|(uuid, _)| *uuid)
            .collect()
    }

    /// Marks a request dispatched. Panics if one is already outstanding;
    /// the one-in-flight rule is an invariant, not a hint.
    pub fn begin_request(&mut self, uuid: &Uuid, now: Instant) {
        let slot = self
            .slots
            .get_mut(uuid)
            .unwrap_or_else(|| panic!("peer {} has no pipeline slot", uuid));
        assert!(!slot.in_flight, "peer {} already has a request in flight", uuid);
        slot.in_flight = true;
        slot.send_immediately = false;
        slot.last_dispatch = Some(now);
    }

    /// Marks the outstanding request complete. With `more_pending`, the
    /// peer becomes due again with no intervening delay.
    pub fn complete_request(&mut self, uuid: &Uuid, more_pending: bool) {
        if let Some(slot) = self.slots.get_mut(uuid) {
            slot.in_flight = false;
            slot.send_immediately = more_pending;
            if more_pending {
                debug!("event=pipeline_immediate_redispatch peer={}", uuid);
            }
        }
    }

    pub fn has_request_in_flight(&self, uuid: &Uuid) -> bool {
        self.slots
            .get(uuid)
            .map(|slot| slot.in_flight)
            .unwrap_or(false)
    }

    pub fn is_tracked(&self, uuid: &Uuid) -> bool {
        self.slots.contains_key(uuid)
    }
}

impl Default for LeaderPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_peers_are_due_immediately() {
        let mut pipeline = LeaderPipeline::with_heartbeat_interval(Duration::from_millis(100));
        let peer = Uuid::new_v4();
        pipeline.reset([peer]);
        let now = Instant::now();
        assert_eq!(pipeline.due_peers(now), vec![peer]);
    }

    #[test]
    fn one_request_in_flight_per_peer() {
        let mut pipeline = LeaderPipeline::with_heartbeat_interval(Duration::from_millis(100));
        let peer = Uuid::new_v4();
        pipeline.reset([peer]);
        let now = Instant::now();
        pipeline.begin_request(&peer, now);
        assert!(pipeline.due_peers(now).is_empty());
        assert!(pipeline.has_request_in_flight(&peer));
    }

    #[test]
    fn more_pending_makes_peer_due_with_no_delay() {
        let mut pipeline = LeaderPipeline::with_heartbeat_interval(Duration::from_secs(3600));
        let peer = Uuid::new_v4();
        pipeline.reset([peer]);
        let now = Instant::now();
        pipeline.begin_request(&peer, now);
        pipeline.complete_request(&peer, true);
        assert_eq!(pipeline.due_peers(now), vec![peer]);
    }

    #[test]
    fn idle_peer_waits_for_heartbeat_interval() {
        let interval = Duration::from_millis(100);
        let mut pipeline = LeaderPipeline::with_heartbeat_interval(interval);
        let peer = Uuid::new_v4();
        pipeline.reset([peer]);
        let now = Instant::now();
        pipeline.begin_request(&peer, now);
        pipeline.complete_request(&peer, false);
        assert!(pipeline.due_peers(now).is_empty());
        assert_eq!(pipeline.due_peers(now + interval), vec![peer]);
    }

    #[test]
    #[should_panic(expected = "already has a request in flight")]
    fn double_dispatch_is_fatal() {
        let mut pipeline = LeaderPipeline::new();
        let peer = Uuid::new_v4();
        pipeline.reset([peer]);
        let now = Instant::now();
        pipeline.begin_request(&peer, now);
        pipeline.begin_request(&peer, now);
    }
}
