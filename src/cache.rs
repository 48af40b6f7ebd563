use parking_lot::Mutex;
use std::collections::HashSet;
use tokio::sync::broadcast;

const INVALIDATION_CHANNEL_CAPACITY: usize = 64;

/// A cached query result that consumers refetch when marked stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryKey {
    Auctions,
    Auction(u64),
    Packs,
    Pack(u64),
    ActivityFeed,
}

/// Fan-out for staleness. Both invalidation triggers (optimistic
/// post-action and stream-driven) go through here; `mark_stale` is
/// idempotent, so a key already stale is not re-announced and the two
/// triggers compose without double-counting.
pub struct InvalidationBus {
    stale: Mutex<HashSet<QueryKey>>,
    notify_tx: broadcast::Sender<QueryKey>,
}

impl InvalidationBus {
    pub fn new() -> Self {
        let (notify_tx, _) = broadcast::channel(INVALIDATION_CHANNEL_CAPACITY);
        Self {
            stale: Mutex::new(HashSet::new()),
            notify_tx,
        }
    }

    /// Returns whether the key was newly marked.
    pub fn mark_stale(&self, key: QueryKey) -> bool {
        let newly_marked = self.stale.lock().insert(key);
        if newly_marked {
            let _ = self.notify_tx.send(key);
        }
        newly_marked
    }

    pub fn is_stale(&self, key: QueryKey) -> bool {
        self.stale.lock().contains(&key)
    }

    /// Clears the stale flag once a consumer has refetched. Returns whether
    /// the key was stale.
    pub fn acknowledge(&self, key: QueryKey) -> bool {
        self.stale.lock().remove(&key)
    }

    pub fn stale_keys(&self) -> Vec<QueryKey> {
        let mut keys: Vec<QueryKey> = self.stale.lock().iter().copied().collect();
        keys.sort_unstable();
        keys
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueryKey> {
        self.notify_tx.subscribe()
    }
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marking_is_idempotent() {
        let bus = InvalidationBus::new();
        assert!(bus.mark_stale(QueryKey::Auctions));
        assert!(!bus.mark_stale(QueryKey::Auctions));
        assert!(bus.is_stale(QueryKey::Auctions));
        assert_eq!(bus.stale_keys(), vec![QueryKey::Auctions]);
    }

    #[test]
    fn acknowledging_rearms_notification() {
        let bus = InvalidationBus::new();
        bus.mark_stale(QueryKey::Auction(7));
        assert!(bus.acknowledge(QueryKey::Auction(7)));
        assert!(!bus.acknowledge(QueryKey::Auction(7)));
        assert!(bus.mark_stale(QueryKey::Auction(7)));
    }

    #[tokio::test]
    async fn duplicate_marks_notify_once() {
        let bus = InvalidationBus::new();
        let mut invalidations = bus.subscribe();

        bus.mark_stale(QueryKey::ActivityFeed);
        bus.mark_stale(QueryKey::ActivityFeed);
        bus.mark_stale(QueryKey::Auction(42));

        assert_eq!(invalidations.recv().await.ok(), Some(QueryKey::ActivityFeed));
        assert_eq!(invalidations.recv().await.ok(), Some(QueryKey::Auction(42)));
        assert!(invalidations.try_recv().is_err());
    }
}
