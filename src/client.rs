use crate::actions::pipeline::ActionPipeline;
use crate::actions::server::{
    fetch_server_time_ms, AuctionSnapshot, CommitApi, HttpCommitApi, PackSnapshot,
};
use crate::actions::{ActionKind, ActionPhase, BidRequest, PackPurchaseRequest};
use crate::cache::{InvalidationBus, QueryKey};
use crate::clock::{offset_sample, unix_now_ms, Clock, ClockSyncEwma, SyncedClock};
use crate::countdown::Countdown;
use crate::db::initialize_pool;
use crate::error::Error;
use crate::session::{
    ProviderKind, SessionManager, SessionSnapshot, WalletAuthorizer, WalletConnectionState,
};
use crate::state::{AppState, StreamTaskHandle};
use crate::store::prefs::{
    clear_metadata_blacklist, get_display_preferences, load_metadata_blacklist,
    record_failed_metadata_lookup, save_display_preferences, DisplayCurrency, DisplayPreferences,
    DEFAULT_DISPLAY_CURRENCY,
};
use crate::store::tracking::{TrackedEntry, TrackingStore};
use crate::stream::client::{StreamClient, Subscription};
use crate::stream::types::{
    StreamConfig, StreamConfigArgs, StreamConnectionState, StreamStatusSnapshot,
};
use crate::stream::{NEW_AUCTION_TOPIC, NEW_BID_TOPIC};
use serde::{Deserialize, Serialize};
use simd_json::prelude::*;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_CLOCK_SYNC_INTERVAL_MS: u64 = 30_000;
pub const MIN_CLOCK_SYNC_INTERVAL_MS: u64 = 5_000;
pub const MAX_CLOCK_SYNC_INTERVAL_MS: u64 = 300_000;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfigArgs {
    pub host: Option<String>,
    pub secure: Option<bool>,
    pub data_dir: Option<PathBuf>,
    pub retry_after_loss_ms: Option<u64>,
    pub retry_after_failure_ms: Option<u64>,
    pub clock_sync_interval_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub stream: StreamConfig,
    pub api_base_url: String,
    pub data_dir: PathBuf,
    pub clock_sync_interval_ms: u64,
}

impl ClientConfigArgs {
    pub fn normalize(self) -> Result<ClientConfig, Error> {
        let stream = StreamConfigArgs {
            host: self.host,
            secure: self.secure,
            retry_after_loss_ms: self.retry_after_loss_ms,
            retry_after_failure_ms: self.retry_after_failure_ms,
        }
        .normalize()?;

        let clock_sync_interval_ms = self
            .clock_sync_interval_ms
            .unwrap_or(DEFAULT_CLOCK_SYNC_INTERVAL_MS);
        if !(MIN_CLOCK_SYNC_INTERVAL_MS..=MAX_CLOCK_SYNC_INTERVAL_MS)
            .contains(&clock_sync_interval_ms)
        {
            return Err(Error::InvalidArgument(format!(
                "clockSyncIntervalMs must be between {MIN_CLOCK_SYNC_INTERVAL_MS} and {MAX_CLOCK_SYNC_INTERVAL_MS}"
            )));
        }

        let api_base_url = stream.api_base_url();
        let data_dir = self.data_dir.unwrap_or_else(|| PathBuf::from("."));

        Ok(ClientConfig {
            stream,
            api_base_url,
            data_dir,
            clock_sync_interval_ms,
        })
    }
}

/// The long-lived service object owning the single stream connection, the
/// wallet session, the action pipeline, and every durable store. Constructed
/// once at process start and shared by reference.
pub struct AuctionClient {
    state: Arc<AppState>,
    pipeline: Arc<ActionPipeline>,
    config: ClientConfig,
    http_client: reqwest::Client,
    _stream_subscriptions: Vec<Subscription>,
}

impl AuctionClient {
    pub async fn open(
        args: ClientConfigArgs,
        authorizer: Arc<dyn WalletAuthorizer>,
    ) -> Result<Self, Error> {
        let config = args.normalize()?;

        let db_pool = initialize_pool(&config.data_dir).await?;
        let bus = Arc::new(InvalidationBus::new());
        let stream = Arc::new(StreamClient::new(config.stream.clone()));
        let session =
            Arc::new(SessionManager::load(db_pool.clone(), Arc::clone(&authorizer)).await);
        let tracking = TrackingStore::load(db_pool.clone()).await;
        let clock = Arc::new(SyncedClock::default());

        let commit: Arc<dyn CommitApi> = Arc::new(HttpCommitApi::new(config.api_base_url.clone()));
        let pipeline = Arc::new(ActionPipeline::new(
            Arc::clone(&session),
            authorizer,
            commit,
            Arc::clone(&bus),
        ));

        let stream_subscriptions = wire_invalidation_topics(&stream, &bus);
        let state = Arc::new(AppState::new(
            db_pool,
            bus,
            stream,
            session,
            tracking,
            clock,
        ));

        Ok(Self {
            state,
            pipeline,
            config,
            http_client: reqwest::Client::new(),
            _stream_subscriptions: stream_subscriptions,
        })
    }

    // ---- stream ----

    /// Starts (or restarts) the stream run loop and the server clock probe.
    pub async fn start_stream(&self) -> StreamStatusSnapshot {
        self.stop_stream().await;

        let cancellation_token = CancellationToken::new();
        let stream_handle =
            tokio::spawn(Arc::clone(&self.state.stream).run(cancellation_token.clone()));

        let clock = Arc::clone(&self.state.clock);
        let http_client = self.http_client.clone();
        let base_url = self.config.api_base_url.clone();
        let interval_ms = self.config.clock_sync_interval_ms;
        let sync_token = cancellation_token.clone();
        let clock_sync_handle = tokio::spawn(async move {
            run_clock_sync(clock, http_client, base_url, interval_ms, sync_token).await;
        });

        let mut stream_task = self.state.stream_task.lock().await;
        *stream_task = Some(StreamTaskHandle {
            cancellation_token,
            stream_handle,
            clock_sync_handle,
        });

        self.state.stream.status()
    }

    /// Returns whether a running stream was stopped. Teardown detaches the
    /// reconnect behavior before the transport closes, so no reconnect can
    /// fire afterwards.
    pub async fn stop_stream(&self) -> bool {
        let existing = { self.state.stream_task.lock().await.take() };
        let Some(handle) = existing else {
            return false;
        };

        handle.cancellation_token.cancel();
        let _ = handle.stream_handle.await;
        let _ = handle.clock_sync_handle.await;
        true
    }

    pub fn reconnect_stream(&self) {
        self.state.stream.reconnect();
    }

    pub fn stream_status(&self) -> StreamStatusSnapshot {
        self.state.stream.status()
    }

    pub fn stream(&self) -> &Arc<StreamClient> {
        &self.state.stream
    }

    pub fn subscribe<F>(&self, topic: &str, handler: F) -> Subscription
    where
        F: Fn(&simd_json::OwnedValue) -> Result<(), Error> + Send + Sync + 'static,
    {
        self.state.stream.subscribe(topic, handler)
    }

    pub fn send<T: Serialize>(&self, message_type: &str, data: &T) -> bool {
        self.state.stream.send(message_type, data)
    }

    // ---- wallet session ----

    pub async fn connect_wallet(&self, provider: ProviderKind) -> Result<SessionSnapshot, Error> {
        self.state.session.connect(provider).await
    }

    pub async fn disconnect_wallet(&self) -> SessionSnapshot {
        self.state.session.disconnect().await
    }

    pub async fn switch_network(&self, chain_id: u64) -> Result<SessionSnapshot, Error> {
        self.state.session.switch_network(chain_id).await
    }

    pub fn session(&self) -> SessionSnapshot {
        self.state.session.snapshot()
    }

    // ---- actions ----

    pub async fn place_bid(&self, request: BidRequest) -> Result<AuctionSnapshot, Error> {
        self.pipeline.place_bid(request).await
    }

    pub async fn purchase_pack(
        &self,
        request: PackPurchaseRequest,
    ) -> Result<PackSnapshot, Error> {
        self.pipeline.purchase_pack(request).await
    }

    pub fn action_phase(&self, kind: ActionKind, target: u64) -> Option<ActionPhase> {
        self.pipeline.action_phase(kind, target)
    }

    // ---- invalidation ----

    pub fn invalidations(&self) -> broadcast::Receiver<QueryKey> {
        self.state.bus.subscribe()
    }

    pub fn bus(&self) -> &Arc<InvalidationBus> {
        &self.state.bus
    }

    // ---- tracking ----

    pub async fn track(&self, auction_id: u64) -> bool {
        self.state.tracking.track(auction_id).await
    }

    pub async fn untrack(&self, auction_id: u64) -> bool {
        self.state.tracking.untrack(auction_id).await
    }

    pub async fn set_notifications(&self, auction_id: u64, enabled: bool) -> bool {
        self.state.tracking.set_notifications(auction_id, enabled).await
    }

    pub fn is_tracked(&self, auction_id: u64) -> bool {
        self.state.tracking.is_tracked(auction_id)
    }

    pub fn tracked_auctions(&self) -> Vec<TrackedEntry> {
        self.state.tracking.entries()
    }

    pub async fn clear_tracked(&self) {
        self.state.tracking.clear().await
    }

    // ---- preferences & metadata blacklist ----

    pub async fn display_preferences(&self) -> DisplayPreferences {
        match get_display_preferences(&self.state.db_pool).await {
            Ok(preferences) => preferences,
            Err(error) => {
                tracing::warn!(%error, "falling back to default display preferences");
                DisplayPreferences {
                    currency: DEFAULT_DISPLAY_CURRENCY,
                    updated_at_ms: unix_now_ms(),
                }
            }
        }
    }

    pub async fn set_display_currency(&self, currency: DisplayCurrency) -> DisplayPreferences {
        match save_display_preferences(&self.state.db_pool, currency).await {
            Ok(preferences) => preferences,
            Err(error) => {
                tracing::warn!(%error, "failed to persist display preferences");
                DisplayPreferences {
                    currency,
                    updated_at_ms: unix_now_ms(),
                }
            }
        }
    }

    pub async fn record_failed_metadata_lookup(&self, token_id: u64) {
        if let Err(error) = record_failed_metadata_lookup(&self.state.db_pool, token_id).await {
            tracing::warn!(%error, token_id, "failed to record metadata blacklist entry");
        }
    }

    pub async fn metadata_blacklist(&self) -> HashSet<u64> {
        load_metadata_blacklist(&self.state.db_pool).await
    }

    pub async fn clear_metadata_blacklist(&self) {
        if let Err(error) = clear_metadata_blacklist(&self.state.db_pool).await {
            tracing::warn!(%error, "failed to clear metadata blacklist");
        }
    }

    // ---- clock & countdowns ----

    pub fn clock(&self) -> Arc<SyncedClock> {
        Arc::clone(&self.state.clock)
    }

    pub fn now_ms(&self) -> i64 {
        self.state.clock.now_unix_ms()
    }

    /// A countdown against the server-aligned clock for an auction end time.
    pub fn countdown_for(&self, end_time_ms: i64) -> Countdown {
        let clock: Arc<dyn Clock> = Arc::clone(&self.state.clock) as Arc<dyn Clock>;
        Countdown::new(clock, end_time_ms)
    }

    // ---- health ----

    pub async fn health(&self) -> HealthResponse {
        let db = match sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&self.state.db_pool)
            .await
        {
            Ok(_) => "ok",
            Err(_) => "error",
        };

        HealthResponse {
            status: "ok",
            uptime_ms: self.state.started_at.elapsed().as_millis(),
            db,
            stream: self.state.stream.state(),
            wallet: self.state.session.snapshot().state,
        }
    }
}

fn wire_invalidation_topics(
    stream: &StreamClient,
    bus: &Arc<InvalidationBus>,
) -> Vec<Subscription> {
    let auction_bus = Arc::clone(bus);
    let new_auction = stream.subscribe(NEW_AUCTION_TOPIC, move |_data| {
        auction_bus.mark_stale(QueryKey::Auctions);
        auction_bus.mark_stale(QueryKey::ActivityFeed);
        Ok(())
    });

    let bid_bus = Arc::clone(bus);
    let new_bid = stream.subscribe(NEW_BID_TOPIC, move |data| {
        bid_bus.mark_stale(QueryKey::Auctions);
        if let Some(auction_id) = data.get("auctionId").and_then(|value| value.as_u64()) {
            bid_bus.mark_stale(QueryKey::Auction(auction_id));
        }
        bid_bus.mark_stale(QueryKey::ActivityFeed);
        Ok(())
    });

    vec![new_auction, new_bid]
}

async fn run_clock_sync(
    clock: Arc<SyncedClock>,
    http_client: reqwest::Client,
    base_url: String,
    interval_ms: u64,
    cancel: CancellationToken,
) {
    let mut ewma = ClockSyncEwma::default();
    let mut next_delay_ms = 0_u64;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(next_delay_ms)) => {
                let request_started_ms = unix_now_ms();
                match fetch_server_time_ms(&http_client, &base_url).await {
                    Ok(server_time_ms) => {
                        let sample =
                            offset_sample(request_started_ms, unix_now_ms(), server_time_ms);
                        let smoothed = ewma.update(sample.offset_ms, sample.rtt_ms);
                        clock.set_offset_ms(smoothed);
                    }
                    Err(error) => {
                        tracing::debug!(%error, "server clock probe failed");
                    }
                }
                next_delay_ms = interval_ms;
            }
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub db: &'static str,
    pub stream: StreamConnectionState,
    pub wallet: WalletConnectionState,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{AuthorizeRequest, WalletAccount};
    use async_trait::async_trait;

    struct StubAuthorizer;

    #[async_trait]
    impl WalletAuthorizer for StubAuthorizer {
        async fn connect(&self, _provider: ProviderKind) -> Result<WalletAccount, Error> {
            Ok(WalletAccount {
                address: "0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".to_string(),
                chain_id: 1,
            })
        }

        async fn switch_network(&self, _chain_id: u64) -> Result<(), Error> {
            Ok(())
        }

        async fn authorize(&self, _request: AuthorizeRequest) -> Result<(), Error> {
            Ok(())
        }
    }

    fn unique_data_dir(tag: &str) -> PathBuf {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system clock should be after unix epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("auction-client-facade-{tag}-{timestamp}"))
    }

    fn test_args(tag: &str) -> (ClientConfigArgs, PathBuf) {
        let data_dir = unique_data_dir(tag);
        (
            ClientConfigArgs {
                host: Some("127.0.0.1:9".to_string()),
                secure: Some(false),
                data_dir: Some(data_dir.clone()),
                ..Default::default()
            },
            data_dir,
        )
    }

    #[test]
    fn normalize_fills_defaults() {
        let config = ClientConfigArgs {
            host: Some("market.example.com".to_string()),
            secure: Some(true),
            ..Default::default()
        }
        .normalize()
        .expect("defaults should be valid");

        assert_eq!(config.api_base_url, "https://market.example.com");
        assert_eq!(config.stream.endpoint(), "wss://market.example.com/ws");
        assert_eq!(config.clock_sync_interval_ms, DEFAULT_CLOCK_SYNC_INTERVAL_MS);
        assert_eq!(config.data_dir, PathBuf::from("."));
    }

    #[test]
    fn normalize_rejects_out_of_range_clock_sync_interval() {
        let result = ClientConfigArgs {
            host: Some("localhost".to_string()),
            clock_sync_interval_ms: Some(100),
            ..Default::default()
        }
        .normalize();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn open_wires_stream_topics_onto_the_bus() {
        let (args, data_dir) = test_args("wiring");
        let client = AuctionClient::open(args, Arc::new(StubAuthorizer))
            .await
            .expect("client should open");

        let mut payload = br#"{"type":"new-bid","data":{"auctionId":42}}"#.to_vec();
        let envelope = crate::stream::types::parse_stream_envelope(payload.as_mut_slice())
            .expect("payload should parse");
        client.stream().dispatch(&envelope.message_type, &envelope.data);

        assert_eq!(
            client.bus().stale_keys(),
            vec![
                QueryKey::Auctions,
                QueryKey::Auction(42),
                QueryKey::ActivityFeed
            ]
        );

        let mut auction_payload = br#"{"type":"new-auction","data":{"id":7}}"#.to_vec();
        let envelope =
            crate::stream::types::parse_stream_envelope(auction_payload.as_mut_slice())
                .expect("payload should parse");
        client.stream().dispatch(&envelope.message_type, &envelope.data);
        assert!(client.bus().is_stale(QueryKey::Auctions));

        let _ = std::fs::remove_dir_all(data_dir);
    }

    #[tokio::test]
    async fn open_restores_durable_state_and_reports_health() {
        let (args, data_dir) = test_args("durable");
        {
            let client = AuctionClient::open(args.clone(), Arc::new(StubAuthorizer))
                .await
                .expect("client should open");
            assert!(client.track(7).await);
            client
                .connect_wallet(ProviderKind::Injected)
                .await
                .expect("wallet should connect");
            client.set_display_currency(DisplayCurrency::Usd).await;
        }

        let reopened = AuctionClient::open(args, Arc::new(StubAuthorizer))
            .await
            .expect("client should reopen");
        assert!(reopened.is_tracked(7));
        assert_eq!(
            reopened.session().address.as_deref(),
            Some("0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266")
        );
        assert_eq!(
            reopened.session().state,
            crate::session::WalletConnectionState::Disconnected
        );
        assert_eq!(
            reopened.display_preferences().await.currency,
            DisplayCurrency::Usd
        );

        let health = reopened.health().await;
        assert_eq!(health.status, "ok");
        assert_eq!(health.db, "ok");
        assert_eq!(health.stream, StreamConnectionState::Disconnected);
        assert_eq!(health.wallet, WalletConnectionState::Disconnected);

        let _ = std::fs::remove_dir_all(data_dir);
    }

    #[tokio::test]
    async fn stop_stream_without_start_reports_not_running() {
        let (args, data_dir) = test_args("stop");
        let client = AuctionClient::open(args, Arc::new(StubAuthorizer))
            .await
            .expect("client should open");
        assert!(!client.stop_stream().await);

        let _ = std::fs::remove_dir_all(data_dir);
    }
}
