use crate::clock::unix_now_ms;
use crate::error::Error;
use crate::store::{bool_to_sqlite, sqlite_to_bool};
use parking_lot::RwLock;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedEntry {
    pub auction_id: u64,
    pub notifications_enabled: bool,
    pub tracked_at_ms: i64,
}

/// The set of auctions the user follows. The in-memory set is
/// authoritative for queries; every mutation writes through to sqlite so
/// membership and notification flags survive restarts. Storage failures
/// are absorbed, never surfaced to callers.
pub struct TrackingStore {
    pool: SqlitePool,
    entries: RwLock<BTreeMap<u64, TrackedEntry>>,
}

impl TrackingStore {
    pub async fn load(pool: SqlitePool) -> Self {
        let entries = match load_entries(&pool).await {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!(%error, "discarding unreadable tracked auctions");
                BTreeMap::new()
            }
        };

        Self {
            pool,
            entries: RwLock::new(entries),
        }
    }

    pub fn is_tracked(&self, auction_id: u64) -> bool {
        self.entries.read().contains_key(&auction_id)
    }

    pub fn notifications_enabled(&self, auction_id: u64) -> Option<bool> {
        self.entries
            .read()
            .get(&auction_id)
            .map(|entry| entry.notifications_enabled)
    }

    pub fn entries(&self) -> Vec<TrackedEntry> {
        self.entries.read().values().cloned().collect()
    }

    /// Returns false when the auction was already tracked.
    pub async fn track(&self, auction_id: u64) -> bool {
        let entry = TrackedEntry {
            auction_id,
            notifications_enabled: true,
            tracked_at_ms: unix_now_ms(),
        };

        let inserted = {
            let mut entries = self.entries.write();
            if entries.contains_key(&auction_id) {
                false
            } else {
                entries.insert(auction_id, entry.clone());
                true
            }
        };

        if inserted {
            if let Err(error) = persist_entry(&self.pool, &entry).await {
                tracing::warn!(%error, auction_id, "failed to persist tracked auction");
            }
        }
        inserted
    }

    pub async fn untrack(&self, auction_id: u64) -> bool {
        let removed = self.entries.write().remove(&auction_id).is_some();
        if removed {
            if let Err(error) = delete_entry(&self.pool, auction_id).await {
                tracing::warn!(%error, auction_id, "failed to delete tracked auction");
            }
        }
        removed
    }

    /// Returns false when the auction is not tracked.
    pub async fn set_notifications(&self, auction_id: u64, enabled: bool) -> bool {
        let updated = {
            let mut entries = self.entries.write();
            match entries.get_mut(&auction_id) {
                Some(entry) => {
                    entry.notifications_enabled = enabled;
                    Some(entry.clone())
                }
                None => None,
            }
        };

        match updated {
            Some(entry) => {
                if let Err(error) = persist_entry(&self.pool, &entry).await {
                    tracing::warn!(%error, auction_id, "failed to persist notification flag");
                }
                true
            }
            None => false,
        }
    }

    pub async fn clear(&self) {
        self.entries.write().clear();
        if let Err(error) = sqlx::query("DELETE FROM tracked_auctions")
            .execute(&self.pool)
            .await
        {
            tracing::warn!(error = %Error::from(error), "failed to clear tracked auctions");
        }
    }
}

async fn load_entries(pool: &SqlitePool) -> Result<BTreeMap<u64, TrackedEntry>, Error> {
    let rows = sqlx::query(
        "SELECT auction_id, notifications_enabled, tracked_at_ms FROM tracked_auctions ORDER BY auction_id ASC",
    )
    .fetch_all(pool)
    .await?;

    let mut entries = BTreeMap::new();
    for row in rows {
        match map_tracked_row(&row) {
            Ok(entry) => {
                entries.insert(entry.auction_id, entry);
            }
            Err(error) => tracing::warn!(%error, "discarding corrupt tracked auction row"),
        }
    }
    Ok(entries)
}

fn map_tracked_row(row: &sqlx::sqlite::SqliteRow) -> Result<TrackedEntry, Error> {
    let auction_id: i64 = row.try_get("auction_id")?;
    let notifications_enabled: i64 = row.try_get("notifications_enabled")?;
    let tracked_at_ms: i64 = row.try_get("tracked_at_ms")?;

    if auction_id < 0 {
        return Err(Error::InvalidArgument(
            "tracked auction id must be non-negative".to_string(),
        ));
    }

    Ok(TrackedEntry {
        auction_id: auction_id as u64,
        notifications_enabled: sqlite_to_bool(notifications_enabled),
        tracked_at_ms,
    })
}

async fn persist_entry(pool: &SqlitePool, entry: &TrackedEntry) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO tracked_auctions (auction_id, notifications_enabled, tracked_at_ms) VALUES (?, ?, ?) \
         ON CONFLICT(auction_id) DO UPDATE SET notifications_enabled=excluded.notifications_enabled",
    )
    .bind(entry.auction_id as i64)
    .bind(bool_to_sqlite(entry.notifications_enabled))
    .bind(entry.tracked_at_ms)
    .execute(pool)
    .await?;
    Ok(())
}

async fn delete_entry(pool: &SqlitePool, auction_id: u64) -> Result<(), Error> {
    sqlx::query("DELETE FROM tracked_auctions WHERE auction_id = ?")
        .bind(auction_id as i64)
        .execute(pool)
        .await?;
    Ok(())
}
