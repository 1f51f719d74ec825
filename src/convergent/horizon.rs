//! Per-replica delivery frontier
//!
//! Every envelope carries the horizon its author had when the op was made.
//! A remote op is delivered only once the local horizon covers it, so array
//! inserts can anchor on element ids that are guaranteed to exist.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity of one copy of a document
pub type ReplicaId = String;

/// Position in a replica's op stream, starting at 1
pub type SeqNum = u64;

/// Highest delivered sequence number per replica
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Horizon {
    seen: BTreeMap<ReplicaId, SeqNum>,
}

impl Horizon {
    pub fn new() -> Self {
        Self::default()
    }

    /// 0 for a replica nothing has been delivered from
    pub fn get(&self, replica: &ReplicaId) -> SeqNum {
        self.seen.get(replica).copied().unwrap_or(0)
    }

    /// Advance the frontier for `replica`; never moves backwards
    pub fn observe(&mut self, replica: &ReplicaId, seq: SeqNum) {
        let frontier = self.seen.entry(replica.clone()).or_insert(0);
        *frontier = (*frontier).max(seq);
    }

    pub fn has_seen(&self, replica: &ReplicaId, seq: SeqNum) -> bool {
        self.get(replica) >= seq
    }

    /// True when every op covered by `other` is covered here too
    pub fn dominates(&self, other: &Horizon) -> bool {
        other.seen.iter().all(|(replica, seq)| self.has_seen(replica, *seq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn horizon(entries: &[(&str, SeqNum)]) -> Horizon {
        let mut h = Horizon::new();
        for (replica, seq) in entries {
            h.observe(&replica.to_string(), *seq);
        }
        h
    }

    #[test]
    fn test_observe_only_advances() {
        let mut h = horizon(&[("alpha", 5)]);
        assert_eq!(h.get(&"alpha".into()), 5);
        assert_eq!(h.get(&"beta".into()), 0);

        h.observe(&"alpha".into(), 3);
        assert_eq!(h.get(&"alpha".into()), 5);
        assert!(h.has_seen(&"alpha".into(), 4));
        assert!(!h.has_seen(&"alpha".into(), 6));
    }

    #[test]
    fn test_dominates_needs_every_replica_covered() {
        let local = horizon(&[("alpha", 5), ("beta", 2)]);
        assert!(local.dominates(&horizon(&[("alpha", 3), ("beta", 2)])));
        assert!(local.dominates(&Horizon::new()));
        assert!(!local.dominates(&horizon(&[("beta", 4)])));
        assert!(!local.dominates(&horizon(&[("gamma", 1)])));
    }
}
