use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Per-client counting state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRecord {
    pub window_expires_at: DateTime<Utc>,
    pub request_count: u64,
    // Present only while the client is blocked
    pub block_expires_at: Option<DateTime<Utc>>,
}

impl ClientRecord {
    pub fn new(now: DateTime<Utc>, window: TimeDelta) -> Self {
        Self {
            window_expires_at: now + window,
            request_count: 0,
            block_expires_at: None,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.block_expires_at.is_some()
    }

    pub fn window_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_expires_at
    }

    pub fn block_expired(&self, now: DateTime<Utc>) -> bool {
        self.block_expires_at.is_some_and(|until| now >= until)
    }

    /// Whether the next request at `now` would drop the record.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        if self.is_blocked() {
            self.block_expired(now)
        } else {
            self.window_expired(now)
        }
    }
}

/// What to do with a record once a critical section is done with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Keep,
    Remove,
}

/// How a transaction changed the set of tracked clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Unchanged,
    Inserted,
    Removed,
}

/// What a purge dropped.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Purged {
    pub removed: usize,
    // ids whose block ran out
    pub released: Vec<String>,
}

/// Client identifier -> [`ClientRecord`].
///
/// Every read-modify-write on one client happens inside [`CounterStore::transact`],
/// which holds the shard lock for that key for the whole closure. Two requests
/// from the same client can therefore never interleave.
#[derive(Debug, Default)]
pub struct CounterStore {
    records: DashMap<String, ClientRecord>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `f` on the record for `client_id` under that key's lock.
    ///
    /// An absent record is created with a window ending at `now + window` and
    /// a zero count, which is the get-or-create step. The record is stored or
    /// deleted according to the [`Disposition`] `f` returns.
    pub fn transact<T>(
        &self,
        client_id: &str,
        now: DateTime<Utc>,
        window: TimeDelta,
        f: impl FnOnce(&mut ClientRecord) -> (Disposition, T),
    ) -> (T, Change) {
        match self.records.entry(client_id.to_owned()) {
            Entry::Occupied(mut slot) => {
                let (disposition, out) = f(slot.get_mut());
                if disposition == Disposition::Remove {
                    slot.remove();
                    return (out, Change::Removed);
                }
                (out, Change::Unchanged)
            }
            Entry::Vacant(slot) => {
                let mut record = ClientRecord::new(now, window);
                let (disposition, out) = f(&mut record);
                if disposition == Disposition::Keep {
                    slot.insert(record);
                    return (out, Change::Inserted);
                }
                (out, Change::Unchanged)
            }
        }
    }

    pub fn get(&self, client_id: &str) -> Option<ClientRecord> {
        self.records.get(client_id).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn blocked_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_blocked()).count()
    }

    /// Drops every stale record.
    pub fn purge(&self, now: DateTime<Utc>) -> Purged {
        let mut purged = Purged::default();
        self.records.retain(|id, record| {
            if !record.is_stale(now) {
                return true;
            }
            if record.is_blocked() {
                purged.released.push(id.clone());
            }
            purged.removed += 1;
            false
        });
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::UNIX_EPOCH + TimeDelta::seconds(secs)
    }

    #[test]
    fn transact_creates_lazily() {
        let store = CounterStore::new();
        assert_eq!(store.len(), 0);

        let (count, change) = store.transact("a", at(0), TimeDelta::seconds(5), |r| {
            r.request_count += 1;
            (Disposition::Keep, r.request_count)
        });
        assert_eq!(count, 1);
        assert_eq!(change, Change::Inserted);

        let record = store.get("a").unwrap();
        assert_eq!(record.window_expires_at, at(5));
        assert_eq!(record.request_count, 1);
        assert!(!record.is_blocked());
    }

    #[test]
    fn transact_reports_only_membership_changes() {
        let store = CounterStore::new();
        let window = TimeDelta::seconds(5);

        let ((), change) = store.transact("a", at(0), window, |_| (Disposition::Keep, ()));
        assert_eq!(change, Change::Inserted);
        let ((), change) = store.transact("a", at(1), window, |_| (Disposition::Keep, ()));
        assert_eq!(change, Change::Unchanged);
        let ((), change) = store.transact("a", at(2), window, |_| (Disposition::Remove, ()));
        assert_eq!(change, Change::Removed);
        assert!(store.get("a").is_none());
    }

    #[test]
    fn transact_remove_on_vacant_never_inserts() {
        let store = CounterStore::new();
        let ((), change) = store.transact("a", at(0), TimeDelta::seconds(5), |_| (Disposition::Remove, ()));
        assert_eq!(change, Change::Unchanged);
        assert!(store.get("a").is_none());
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn purge_reports_removed_and_released() {
        let store = CounterStore::new();
        let window = TimeDelta::seconds(5);
        store.transact("idle", at(0), window, |_| (Disposition::Keep, ()));
        store.transact("jailed", at(0), window, |r| {
            r.block_expires_at = Some(at(3));
            (Disposition::Keep, ())
        });
        store.transact("busy", at(4), window, |_| (Disposition::Keep, ()));

        let purged = store.purge(at(5));
        assert_eq!(purged.removed, 2);
        assert_eq!(purged.released, vec!["jailed".to_string()]);
        assert_eq!(store.len(), 1);
        assert!(store.get("busy").is_some());
    }

    #[test]
    fn blocked_window_is_not_stale_until_block_ends() {
        let mut record = ClientRecord::new(at(0), TimeDelta::seconds(1));
        record.block_expires_at = Some(at(10));
        assert!(!record.is_stale(at(5)));
        assert!(record.is_stale(at(10)));
    }
}
