pub mod actions;
pub mod cache;
pub mod client;
pub mod clock;
pub mod countdown;
pub mod db;
pub mod error;
pub mod session;
pub mod state;
pub mod store;
pub mod stream;

pub use actions::server::{AuctionSnapshot, CommitApi, PackSnapshot};
pub use actions::{ActionKind, ActionPhase, BidRequest, PackPurchaseRequest};
pub use cache::{InvalidationBus, QueryKey};
pub use client::{AuctionClient, ClientConfig, ClientConfigArgs, HealthResponse};
pub use countdown::{Countdown, CountdownTick};
pub use error::Error;
pub use session::{
    ProviderKind, SessionSnapshot, WalletAccount, WalletAuthorizer, WalletConnectionState,
};
pub use store::prefs::{DisplayCurrency, DisplayPreferences};
pub use store::tracking::{TrackedEntry, TrackingStore};
pub use stream::client::{StreamClient, Subscription};
pub use stream::types::{StreamConnectionState, StreamStatusSnapshot};
