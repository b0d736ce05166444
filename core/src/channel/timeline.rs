//! Local timeline: merges messages from every path, one copy each

use super::types::PublicMessage;
use std::collections::{HashSet, VecDeque};

/// Messages kept per timeline
pub const MAX_TIMELINE: usize = 1_000;
/// Ids remembered for dedup; outlives the timeline itself
const MAX_SEEN: usize = 10_000;

#[derive(Debug, Clone)]
struct Entry {
    seq: u64,
    message: PublicMessage,
}

/// Sorted by `timestamp`, ties by arrival order; duplicate ids dropped
#[derive(Debug, Default)]
pub struct Timeline {
    entries: Vec<Entry>,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
    next_seq: u64,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if the message was new
    pub fn insert(&mut self, message: PublicMessage) -> bool {
        if self.seen.contains(&message.id) {
            return false;
        }
        self.remember(message.id.clone());

        let seq = self.next_seq;
        self.next_seq += 1;
        let timestamp = message.timestamp;
        let at = self
            .entries
            .partition_point(|e| e.message.timestamp <= timestamp);
        self.entries.insert(at, Entry { seq, message });

        if self.entries.len() > MAX_TIMELINE {
            self.entries.remove(0);
        }
        true
    }

    fn remember(&mut self, id: String) {
        self.seen.insert(id.clone());
        self.seen_order.push_back(id);
        while self.seen_order.len() > MAX_SEEN {
            if let Some(old) = self.seen_order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }

    pub fn messages(&self) -> Vec<PublicMessage> {
        self.entries.iter().map(|e| e.message.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Full purge: entries and remembered ids both go
    pub fn clear(&mut self) {
        self.entries.clear();
        self.seen.clear();
        self.seen_order.clear();
        self.next_seq = 0;
    }

    /// Arrival sequence numbers, in timeline order
    #[cfg(test)]
    fn sequence(&self) -> Vec<u64> {
        self.entries.iter().map(|e| e.seq).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn msg(id: &str, timestamp: u64) -> PublicMessage {
        PublicMessage {
            id: id.to_string(),
            text: format!("text {}", id),
            sender: "peer".into(),
            alias: "Peer".into(),
            timestamp,
        }
    }

    #[test]
    fn test_duplicate_dropped() {
        let mut timeline = Timeline::new();
        assert!(timeline.insert(msg("a", 1)));
        assert!(!timeline.insert(msg("a", 1)));
        assert_eq!(timeline.len(), 1);
    }

    #[test]
    fn test_sorted_by_timestamp_then_arrival() {
        let mut timeline = Timeline::new();
        timeline.insert(msg("late", 30));
        timeline.insert(msg("tie-1", 20));
        timeline.insert(msg("early", 10));
        timeline.insert(msg("tie-2", 20));
        let ids: Vec<String> = timeline.messages().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["early", "tie-1", "tie-2", "late"]);
    }

    #[test]
    fn test_cap_drops_oldest() {
        let mut timeline = Timeline::new();
        for i in 0..(MAX_TIMELINE as u64 + 5) {
            timeline.insert(msg(&i.to_string(), i));
        }
        assert_eq!(timeline.len(), MAX_TIMELINE);
        assert_eq!(timeline.messages()[0].id, "5");
        // Evicted ids are still known, so a late replay does not resurrect them
        assert!(!timeline.insert(msg("0", 0)));
    }

    #[test]
    fn test_clear_forgets_entries_and_ids() {
        let mut timeline = Timeline::new();
        timeline.insert(msg("a", 1));
        timeline.insert(msg("b", 2));

        timeline.clear();
        assert!(timeline.is_empty());
        assert!(timeline.insert(msg("a", 1)));
        assert_eq!(timeline.sequence(), vec![0]);
    }

    proptest! {
        #[test]
        fn prop_one_copy_each_in_order(
            items in proptest::collection::vec((0u8..20, 0u64..50), 0..60)
        ) {
            let mut timeline = Timeline::new();
            for (id, ts) in &items {
                timeline.insert(msg(&id.to_string(), *ts));
            }

            let messages = timeline.messages();
            let unique: HashSet<&u8> = items.iter().map(|(id, _)| id).collect();
            prop_assert_eq!(messages.len(), unique.len());

            let ids: HashSet<String> = messages.iter().map(|m| m.id.clone()).collect();
            prop_assert_eq!(ids.len(), messages.len());

            for pair in messages.windows(2) {
                prop_assert!(pair[0].timestamp <= pair[1].timestamp);
            }
            let seq = timeline.sequence();
            for (pair, m) in seq.windows(2).zip(messages.windows(2)) {
                if m[0].timestamp == m[1].timestamp {
                    prop_assert!(pair[0] < pair[1]);
                }
            }
        }
    }
}
