use crate::cache::InvalidationBus;
use crate::clock::SyncedClock;
use crate::session::SessionManager;
use crate::store::tracking::TrackingStore;
use crate::stream::client::StreamClient;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct StreamTaskHandle {
    pub cancellation_token: CancellationToken,
    pub stream_handle: JoinHandle<()>,
    pub clock_sync_handle: JoinHandle<()>,
}

pub struct AppState {
    pub started_at: Instant,
    pub db_pool: SqlitePool,
    pub bus: Arc<InvalidationBus>,
    pub stream: Arc<StreamClient>,
    pub stream_task: Mutex<Option<StreamTaskHandle>>,
    pub session: Arc<SessionManager>,
    pub tracking: TrackingStore,
    pub clock: Arc<SyncedClock>,
}

impl AppState {
    pub fn new(
        db_pool: SqlitePool,
        bus: Arc<InvalidationBus>,
        stream: Arc<StreamClient>,
        session: Arc<SessionManager>,
        tracking: TrackingStore,
        clock: Arc<SyncedClock>,
    ) -> Self {
        Self {
            started_at: Instant::now(),
            db_pool,
            bus,
            stream,
            stream_task: Mutex::new(None),
            session,
            tracking,
            clock,
        }
    }
}
