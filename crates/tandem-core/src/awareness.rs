//! Awareness (presence) tracking for a document.
//!
//! Each client publishes an ephemeral presence record under its own client
//! id. Records merge last-writer-wins by clock; a removal is recorded as a
//! tombstone so an older live record arriving late cannot resurrect it.
//! Tombstones are kept for one stale timeout and then forgotten.

use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tandem_protocol::{AwarenessEntry, AwarenessUpdate};
use tracing::debug;

/// Presence record for a single client.
#[derive(Debug, Clone)]
pub struct AwarenessRecord {
    /// Clock of the last accepted update.
    pub clock: u64,
    /// Current presence state, `None` once removed.
    pub state: Option<Value>,
    /// When the last update was accepted.
    pub last_updated: Instant,
}

impl AwarenessRecord {
    fn is_stale(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_updated) >= timeout
    }
}

/// Awareness state of one document.
#[derive(Debug, Default)]
pub struct AwarenessMap {
    records: HashMap<u64, AwarenessRecord>,
}

impl AwarenessMap {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of clients with a live state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.values().filter(|r| r.state.is_some()).count()
    }

    /// Check if no client has a live state.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the record for a client, live or removed.
    #[must_use]
    pub fn get(&self, client_id: u64) -> Option<&AwarenessRecord> {
        self.records.get(&client_id)
    }

    /// Get the live state of a client.
    #[must_use]
    pub fn state(&self, client_id: u64) -> Option<&Value> {
        self.records.get(&client_id).and_then(|r| r.state.as_ref())
    }

    /// Merge one tuple.
    ///
    /// A tuple wins when its clock is newer, or when it carries the same
    /// clock and removes a live state. Returns `true` if the map changed.
    pub fn apply(&mut self, entry: &AwarenessEntry) -> bool {
        let accept = match self.records.get(&entry.client_id) {
            None => entry.state.is_some(),
            Some(current) => {
                current.clock < entry.clock
                    || (current.clock == entry.clock
                        && entry.state.is_none()
                        && current.state.is_some())
            }
        };

        if accept {
            self.records.insert(
                entry.client_id,
                AwarenessRecord {
                    clock: entry.clock,
                    state: entry.state.clone(),
                    last_updated: Instant::now(),
                },
            );
        }

        accept
    }

    /// Remove a client's live state.
    ///
    /// Returns the removal tuple to broadcast, or `None` if the client had
    /// no live state.
    pub fn remove(&mut self, client_id: u64) -> Option<AwarenessEntry> {
        let record = self.records.get_mut(&client_id)?;
        record.state.take()?;
        record.last_updated = Instant::now();
        debug!(client_id, "Awareness: client removed");
        Some(AwarenessEntry::removed(client_id, record.clock))
    }

    /// Remove live states not refreshed within `timeout` and forget
    /// tombstones older than `timeout`.
    ///
    /// Returns the removal tuples to broadcast.
    pub fn prune_stale(&mut self, timeout: Duration) -> Vec<AwarenessEntry> {
        let now = Instant::now();
        let before = self.records.len();
        self.records
            .retain(|_, r| r.state.is_some() || !r.is_stale(timeout, now));
        let forgotten = before - self.records.len();
        if forgotten > 0 {
            debug!(forgotten, "Awareness: dropped expired tombstones");
        }

        let stale: Vec<u64> = self
            .records
            .iter()
            .filter(|(_, r)| r.state.is_some() && r.is_stale(timeout, now))
            .map(|(id, _)| *id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| {
                debug!(client_id = id, "Awareness: pruned stale client");
                self.remove(id)
            })
            .collect()
    }

    /// Full live state as a single update, for awareness queries.
    #[must_use]
    pub fn snapshot(&self) -> AwarenessUpdate {
        let mut entries: Vec<AwarenessEntry> = self
            .records
            .iter()
            .filter_map(|(id, r)| {
                r.state
                    .as_ref()
                    .map(|state| AwarenessEntry::new(*id, r.clock, state.clone()))
            })
            .collect();
        entries.sort_by_key(|e| e.client_id);
        AwarenessUpdate::new(entries)
    }

    /// Number of records, live or removed.
    #[must_use]
    pub fn tracked(&self) -> usize {
        self.records.len()
    }

    /// Drop every record, live or removed.
    pub fn clear(&mut self) {
        self.records.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn live(client_id: u64, clock: u64) -> AwarenessEntry {
        AwarenessEntry::new(client_id, clock, json!({"cursor": clock}))
    }

    #[test]
    fn test_last_writer_wins_by_clock() {
        let mut map = AwarenessMap::new();

        assert!(map.apply(&live(1, 1)));
        assert!(map.apply(&live(1, 3)));
        // Older and equal clocks lose.
        assert!(!map.apply(&live(1, 2)));
        assert!(!map.apply(&live(1, 3)));

        assert_eq!(map.state(1), Some(&json!({"cursor": 3})));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_null_update_removes_at_same_clock() {
        let mut map = AwarenessMap::new();
        map.apply(&live(1, 5));

        assert!(map.apply(&AwarenessEntry::removed(1, 5)));
        assert!(map.state(1).is_none());
        assert!(map.is_empty());

        // Late arrival of an older live state does not resurrect the client.
        assert!(!map.apply(&live(1, 4)));
        // Nor does a repeated removal count as a change.
        assert!(!map.apply(&AwarenessEntry::removed(1, 5)));
        // A newer state does.
        assert!(map.apply(&live(1, 6)));
    }

    #[test]
    fn test_unknown_client_removal_is_ignored() {
        let mut map = AwarenessMap::new();
        assert!(!map.apply(&AwarenessEntry::removed(9, 1)));
        assert!(map.get(9).is_none());
    }

    #[test]
    fn test_remove_returns_tombstone() {
        let mut map = AwarenessMap::new();
        map.apply(&live(4, 2));

        let removal = map.remove(4).unwrap();
        assert_eq!(removal, AwarenessEntry::removed(4, 2));
        assert!(map.remove(4).is_none());
        assert!(map.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_lists_live_clients() {
        let mut map = AwarenessMap::new();
        map.apply(&live(2, 1));
        map.apply(&live(1, 1));
        map.apply(&live(3, 1));
        map.remove(3);

        let snapshot = map.snapshot();
        let ids: Vec<u64> = snapshot.entries.iter().map(|e| e.client_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_prune_stale() {
        let mut map = AwarenessMap::new();
        map.apply(&live(1, 1));
        map.apply(&live(2, 1));

        assert!(map.prune_stale(Duration::from_secs(3600)).is_empty());

        let pruned = map.prune_stale(Duration::ZERO);
        assert_eq!(pruned.len(), 2);
        assert!(pruned.iter().all(AwarenessEntry::is_removal));
        assert!(map.is_empty());
    }

    #[test]
    fn test_prune_forgets_expired_tombstones() {
        let mut map = AwarenessMap::new();
        map.apply(&live(1, 1));
        map.apply(&live(2, 1));
        map.remove(1);
        assert_eq!(map.tracked(), 2);

        // Recent tombstones are kept.
        assert!(map.prune_stale(Duration::from_secs(3600)).is_empty());
        assert!(map.get(1).is_some());

        // The expired tombstone goes; client 2 becomes a fresh tombstone.
        let pruned = map.prune_stale(Duration::ZERO);
        assert_eq!(pruned, vec![AwarenessEntry::removed(2, 1)]);
        assert!(map.get(1).is_none());
        assert!(map.get(2).is_some());

        assert!(map.prune_stale(Duration::ZERO).is_empty());
        assert_eq!(map.tracked(), 0);
    }
}
