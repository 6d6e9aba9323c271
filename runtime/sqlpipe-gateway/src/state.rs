//! Registry of logical connections and their transaction flags.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use sqlpipe_db::AsyncPooled;

/// Something the store can tell to stay out of the idle pool once released.
pub trait Discard {
    fn discard(&self);
}

impl<T> Discard for AsyncPooled<T> {
    fn discard(&self) {
        self.poison();
    }
}

struct Slots<H> {
    live: HashMap<i32, Arc<H>>,
    connecting: HashSet<i32>,
}

/// Connection id → handle map plus the set of ids inside a transaction.
///
/// Locks are internal; `slots` is always taken before `txns`, and a
/// transaction flag is only set while the id is live.
pub struct StateStore<H> {
    slots: Mutex<Slots<H>>,
    txns: Mutex<HashSet<i32>>,
}

impl<H> StateStore<H> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots {
                live: HashMap::new(),
                connecting: HashSet::new(),
            }),
            txns: Mutex::new(HashSet::new()),
        }
    }

    pub fn get(&self, conn: i32) -> Option<Arc<H>> {
        self.slots.lock().live.get(&conn).cloned()
    }

    #[cfg(test)]
    pub fn contains(&self, conn: i32) -> bool {
        self.slots.lock().live.contains_key(&conn)
    }

    /// Claims `conn` for a connect in flight. Fails if it is live or already claimed.
    pub fn reserve(&self, conn: i32) -> bool {
        let mut slots = self.slots.lock();
        if slots.live.contains_key(&conn) {
            return false;
        }
        slots.connecting.insert(conn)
    }

    /// Drops a claim whose connect failed.
    pub fn abandon(&self, conn: i32) {
        self.slots.lock().connecting.remove(&conn);
    }

    /// Registers a freshly acquired handle, consuming any claim on `conn`.
    pub fn register(&self, conn: i32, handle: Arc<H>) -> Option<Arc<H>> {
        let mut slots = self.slots.lock();
        slots.connecting.remove(&conn);
        slots.live.insert(conn, handle)
    }

    /// Removes the connection and its transaction flag together.
    pub fn remove(&self, conn: i32) -> Option<Arc<H>> {
        let mut slots = self.slots.lock();
        self.txns.lock().remove(&conn);
        slots.live.remove(&conn)
    }

    pub fn ids(&self) -> Vec<i32> {
        let mut ids: Vec<i32> = self.slots.lock().live.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.slots.lock().live.len()
    }

    pub fn in_txn(&self, conn: i32) -> bool {
        self.txns.lock().contains(&conn)
    }

    /// Flags `conn` as inside a transaction; refused when it is not live.
    pub fn begin(&self, conn: i32) -> bool {
        let slots = self.slots.lock();
        if !slots.live.contains_key(&conn) {
            return false;
        }
        self.txns.lock().insert(conn)
    }

    /// Clears the transaction flag, reporting whether it was set.
    pub fn end_txn(&self, conn: i32) -> bool {
        self.txns.lock().remove(&conn)
    }
}

impl<H> Default for StateStore<H> {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeHandle;
    use super::*;

    #[test]
    fn transaction_flag_requires_a_live_connection() {
        let store: StateStore<FakeHandle> = StateStore::new();
        assert!(!store.begin(1));
        store.register(1, Arc::new(FakeHandle::default()));
        assert!(store.begin(1));
        assert!(!store.begin(1));
        assert!(store.in_txn(1));
        assert!(store.end_txn(1));
        assert!(!store.end_txn(1));
    }

    #[test]
    fn remove_clears_the_transaction_flag() {
        let store: StateStore<FakeHandle> = StateStore::new();
        store.register(7, Arc::new(FakeHandle::default()));
        store.begin(7);
        assert!(store.remove(7).is_some());
        assert!(!store.in_txn(7));
        assert!(!store.contains(7));
        assert!(store.remove(7).is_none());
    }

    #[test]
    fn reservation_blocks_a_second_connect() {
        let store: StateStore<FakeHandle> = StateStore::new();
        assert!(store.reserve(2));
        assert!(!store.reserve(2));
        assert!(!store.contains(2));
        store.abandon(2);
        assert!(store.reserve(2));
        store.register(2, Arc::new(FakeHandle::default()));
        assert!(store.contains(2));
        assert!(!store.reserve(2));
    }

    #[test]
    fn ids_are_sorted_and_shared_handles_survive_removal() {
        let store: StateStore<FakeHandle> = StateStore::new();
        for id in [9, 3, 5] {
            store.register(id, Arc::new(FakeHandle::default()));
        }
        assert_eq!(store.ids(), vec![3, 5, 9]);
        let borrowed = store.get(5).expect("live");
        store.remove(5);
        assert_eq!(store.len(), 2);
        assert!(!borrowed.was_discarded());
    }
}
