use crate::actions::ActionKind;
use crate::clock::unix_now_ms;
use crate::error::Error;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WalletConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Injected,
    WalletConnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletAccount {
    pub address: String,
    pub chain_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthorizeRequest {
    pub kind: ActionKind,
    pub target: u64,
    pub amount: f64,
    pub address: String,
}

/// The external signing capability. It either succeeds or fails; this crate
/// never sees keys, transaction formats, or the signing protocol.
#[async_trait]
pub trait WalletAuthorizer: Send + Sync {
    async fn connect(&self, provider: ProviderKind) -> Result<WalletAccount, Error>;
    async fn switch_network(&self, chain_id: u64) -> Result<(), Error>;
    async fn authorize(&self, request: AuthorizeRequest) -> Result<(), Error>;
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: WalletConnectionState,
    pub address: Option<String>,
    pub chain_id: Option<u64>,
    pub last_error: Option<String>,
}

/// Process-wide authority on "is the user allowed to act". The account and
/// network survive restarts; the connection state does not and always comes
/// back Disconnected until `connect` is called again.
pub struct SessionManager {
    pool: SqlitePool,
    authorizer: Arc<dyn WalletAuthorizer>,
    session: RwLock<SessionSnapshot>,
}

impl SessionManager {
    pub async fn load(pool: SqlitePool, authorizer: Arc<dyn WalletAuthorizer>) -> Self {
        let persisted = match load_wallet_session(&pool).await {
            Ok(persisted) => persisted,
            Err(error) => {
                tracing::warn!(%error, "discarding unreadable wallet session");
                None
            }
        };

        let session = SessionSnapshot {
            state: WalletConnectionState::Disconnected,
            address: persisted.as_ref().map(|account| account.address.clone()),
            chain_id: persisted.as_ref().map(|account| account.chain_id),
            last_error: None,
        };

        Self {
            pool,
            authorizer,
            session: RwLock::new(session),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.session.read().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session.read().state == WalletConnectionState::Connected
    }

    pub fn account(&self) -> Option<WalletAccount> {
        let session = self.session.read();
        if session.state != WalletConnectionState::Connected {
            return None;
        }
        match (&session.address, session.chain_id) {
            (Some(address), Some(chain_id)) => Some(WalletAccount {
                address: address.clone(),
                chain_id,
            }),
            _ => None,
        }
    }

    /// Overlapping calls are not coalesced; the last one to complete
    /// determines the final state.
    pub async fn connect(&self, provider: ProviderKind) -> Result<SessionSnapshot, Error> {
        {
            let mut session = self.session.write();
            session.state = WalletConnectionState::Connecting;
            session.last_error = None;
        }

        match self.authorizer.connect(provider).await {
            Ok(account) => {
                {
                    let mut session = self.session.write();
                    session.state = WalletConnectionState::Connected;
                    session.address = Some(account.address.clone());
                    session.chain_id = Some(account.chain_id);
                    session.last_error = None;
                }
                if let Err(error) =
                    persist_wallet_session(&self.pool, &account.address, account.chain_id).await
                {
                    tracing::warn!(%error, "failed to persist wallet session");
                }
                Ok(self.snapshot())
            }
            Err(error) => {
                let reason = error.to_string();
                let mut session = self.session.write();
                session.state = WalletConnectionState::Error;
                session.last_error = Some(reason);
                Err(error)
            }
        }
    }

    pub async fn disconnect(&self) -> SessionSnapshot {
        {
            let mut session = self.session.write();
            session.state = WalletConnectionState::Disconnected;
            session.address = None;
            session.chain_id = None;
            session.last_error = None;
        }
        if let Err(error) = clear_wallet_session(&self.pool).await {
            tracing::warn!(%error, "failed to clear persisted wallet session");
        }
        self.snapshot()
    }

    /// A failed switch leaves the prior network untouched.
    pub async fn switch_network(&self, chain_id: u64) -> Result<SessionSnapshot, Error> {
        self.authorizer.switch_network(chain_id).await?;

        let address = {
            let mut session = self.session.write();
            session.chain_id = Some(chain_id);
            session.address.clone()
        };
        if let Some(address) = address {
            if let Err(error) = persist_wallet_session(&self.pool, &address, chain_id).await {
                tracing::warn!(%error, "failed to persist network switch");
            }
        }
        Ok(self.snapshot())
    }
}

async fn load_wallet_session(pool: &SqlitePool) -> Result<Option<WalletAccount>, Error> {
    let row = sqlx::query("SELECT address, chain_id FROM wallet_session WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };

    let address: String = row.try_get("address")?;
    let chain_id: i64 = row.try_get("chain_id")?;
    if address.is_empty() || chain_id < 0 {
        tracing::warn!("discarding corrupt wallet session row");
        return Ok(None);
    }

    Ok(Some(WalletAccount {
        address,
        chain_id: chain_id as u64,
    }))
}

async fn persist_wallet_session(
    pool: &SqlitePool,
    address: &str,
    chain_id: u64,
) -> Result<(), Error> {
    sqlx::query(
        "INSERT INTO wallet_session (id, address, chain_id, updated_at_ms) VALUES (1, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET address=excluded.address, chain_id=excluded.chain_id, updated_at_ms=excluded.updated_at_ms",
    )
    .bind(address)
    .bind(chain_id as i64)
    .bind(unix_now_ms())
    .execute(pool)
    .await?;

    Ok(())
}

async fn clear_wallet_session(pool: &SqlitePool) -> Result<(), Error> {
    sqlx::query("DELETE FROM wallet_session WHERE id = 1")
        .execute(pool)
        .await?;
    Ok(())
}
