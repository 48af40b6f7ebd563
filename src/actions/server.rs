use crate::error::Error;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

fn place_bid_endpoint(base_url: &str, auction_id: u64) -> String {
    format!("{base_url}/api/auctions/{auction_id}/bids")
}

fn purchase_pack_endpoint(base_url: &str, pack_id: u64) -> String {
    format!("{base_url}/api/packs/{pack_id}/purchase")
}

fn server_time_endpoint(base_url: &str) -> String {
    format!("{base_url}/api/time")
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PlaceBidCommit {
    pub auction_id: u64,
    pub amount: f64,
    pub bidder_address: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackPurchaseCommit {
    pub pack_id: u64,
    pub address: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuctionSnapshot {
    pub id: u64,
    pub current_bid: f64,
    pub bid_count: u32,
    pub end_time_ms: i64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackSnapshot {
    pub id: u64,
    pub price: f64,
    pub credits: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorBodyWire {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ServerTimeWire {
    #[serde(rename = "serverTime")]
    server_time: i64,
}

/// Records an already-authorized action with the server of record.
#[async_trait]
pub trait CommitApi: Send + Sync {
    async fn place_bid(&self, commit: PlaceBidCommit) -> Result<AuctionSnapshot, Error>;
    async fn purchase_pack(&self, commit: PackPurchaseCommit) -> Result<PackSnapshot, Error>;
}

pub struct HttpCommitApi {
    client: Client,
    base_url: String,
}

impl HttpCommitApi {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl CommitApi for HttpCommitApi {
    async fn place_bid(&self, commit: PlaceBidCommit) -> Result<AuctionSnapshot, Error> {
        let endpoint = place_bid_endpoint(&self.base_url, commit.auction_id);
        let response = self.client.post(endpoint).json(&commit).send().await?;
        decode_commit_response(response).await
    }

    async fn purchase_pack(&self, commit: PackPurchaseCommit) -> Result<PackSnapshot, Error> {
        let endpoint = purchase_pack_endpoint(&self.base_url, commit.pack_id);
        let response = self.client.post(endpoint).json(&commit).send().await?;
        decode_commit_response(response).await
    }
}

async fn decode_commit_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, Error> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let message = match response.json::<ErrorBodyWire>().await {
        Ok(body) => body.message,
        Err(_) => status.to_string(),
    };
    Err(Error::Commit(message))
}

pub async fn fetch_server_time_ms(client: &Client, base_url: &str) -> Result<i64, Error> {
    let endpoint = server_time_endpoint(base_url);
    let response = client.get(endpoint).send().await?.error_for_status()?;
    let payload = response.json::<ServerTimeWire>().await?;
    Ok(payload.server_time)
}
