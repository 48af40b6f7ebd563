use crate::clock::unix_now_ms;
use crate::error::Error;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;

pub const DEFAULT_DISPLAY_CURRENCY: DisplayCurrency = DisplayCurrency::Native;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DisplayCurrency {
    Native,
    Usd,
}

impl DisplayCurrency {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Native => "native",
            Self::Usd => "usd",
        }
    }

    pub fn parse_str(value: &str) -> Result<Self, Error> {
        match value {
            "native" => Ok(Self::Native),
            "usd" => Ok(Self::Usd),
            other => Err(Error::InvalidArgument(format!(
                "unknown display currency '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DisplayPreferences {
    pub currency: DisplayCurrency,
    pub updated_at_ms: i64,
}

async fn ensure_display_preferences_seed(pool: &SqlitePool) -> Result<(), Error> {
    sqlx::query(
        "INSERT OR IGNORE INTO display_preferences (id, currency, updated_at_ms) VALUES (1, ?, ?)",
    )
    .bind(DEFAULT_DISPLAY_CURRENCY.as_str())
    .bind(unix_now_ms())
    .execute(pool)
    .await?;
    Ok(())
}

/// A corrupt stored currency is treated as absent and falls back to the
/// default rather than failing the read.
pub async fn get_display_preferences(pool: &SqlitePool) -> Result<DisplayPreferences, Error> {
    ensure_display_preferences_seed(pool).await?;

    let row = sqlx::query("SELECT currency, updated_at_ms FROM display_preferences WHERE id = 1")
        .fetch_one(pool)
        .await?;

    let currency_raw: String = row.try_get("currency")?;
    let updated_at_ms: i64 = row.try_get("updated_at_ms")?;

    let currency = match DisplayCurrency::parse_str(&currency_raw) {
        Ok(currency) => currency,
        Err(error) => {
            tracing::warn!(%error, "resetting corrupt display currency to default");
            DEFAULT_DISPLAY_CURRENCY
        }
    };

    Ok(DisplayPreferences {
        currency,
        updated_at_ms,
    })
}

pub async fn save_display_preferences(
    pool: &SqlitePool,
    currency: DisplayCurrency,
) -> Result<DisplayPreferences, Error> {
    sqlx::query(
        "INSERT INTO display_preferences (id, currency, updated_at_ms) VALUES (1, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET currency=excluded.currency, updated_at_ms=excluded.updated_at_ms",
    )
    .bind(currency.as_str())
    .bind(unix_now_ms())
    .execute(pool)
    .await?;

    get_display_preferences(pool).await
}

/// Metadata lookups that failed once are blacklisted so consumers stop
/// retrying them.
pub async fn record_failed_metadata_lookup(pool: &SqlitePool, token_id: u64) -> Result<(), Error> {
    sqlx::query("INSERT OR IGNORE INTO metadata_blacklist (token_id, failed_at_ms) VALUES (?, ?)")
        .bind(token_id as i64)
        .bind(unix_now_ms())
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn load_metadata_blacklist(pool: &SqlitePool) -> HashSet<u64> {
    let rows = match sqlx::query("SELECT token_id FROM metadata_blacklist")
        .fetch_all(pool)
        .await
    {
        Ok(rows) => rows,
        Err(error) => {
            tracing::warn!(error = %Error::from(error), "discarding unreadable metadata blacklist");
            return HashSet::new();
        }
    };

    let mut blacklist = HashSet::with_capacity(rows.len());
    for row in rows {
        match row.try_get::<i64, _>("token_id") {
            Ok(token_id) if token_id >= 0 => {
                blacklist.insert(token_id as u64);
            }
            _ => tracing::warn!("discarding corrupt metadata blacklist row"),
        }
    }
    blacklist
}

pub async fn clear_metadata_blacklist(pool: &SqlitePool) -> Result<(), Error> {
    sqlx::query("DELETE FROM metadata_blacklist")
        .execute(pool)
        .await?;
    Ok(())
}
