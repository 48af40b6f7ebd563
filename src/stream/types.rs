use crate::error::Error;
use serde::{Deserialize, Serialize};

pub const STREAM_PATH: &str = "/ws";
pub const DEFAULT_SECURE: bool = false;
pub const DEFAULT_RETRY_AFTER_LOSS_MS: u64 = 3_000;
pub const DEFAULT_RETRY_AFTER_FAILURE_MS: u64 = 5_000;
pub const MIN_RETRY_DELAY_MS: u64 = 10;
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StreamConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatusSnapshot {
    pub state: StreamConnectionState,
    pub endpoint: String,
    pub last_message_ms: Option<i64>,
    pub reconnect_attempts: u32,
    pub reason: Option<String>,
}

impl StreamStatusSnapshot {
    pub fn idle(endpoint: String, reason: Option<String>) -> Self {
        Self {
            state: StreamConnectionState::Disconnected,
            endpoint,
            last_message_ms: None,
            reconnect_attempts: 0,
            reason,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StreamConfigArgs {
    pub host: Option<String>,
    pub secure: Option<bool>,
    pub retry_after_loss_ms: Option<u64>,
    pub retry_after_failure_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub host: String,
    pub secure: bool,
    pub retry_after_loss_ms: u64,
    pub retry_after_failure_ms: u64,
}

impl StreamConfigArgs {
    pub fn normalize(self) -> Result<StreamConfig, Error> {
        let host = self.host.unwrap_or_default().trim().to_string();
        if host.is_empty() {
            return Err(Error::InvalidArgument("host must be provided".to_string()));
        }
        if !host
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | ':'))
        {
            return Err(Error::InvalidArgument(
                "host must be a bare host or host:port".to_string(),
            ));
        }

        let secure = self.secure.unwrap_or(DEFAULT_SECURE);

        let retry_after_loss_ms = self.retry_after_loss_ms.unwrap_or(DEFAULT_RETRY_AFTER_LOSS_MS);
        if !(MIN_RETRY_DELAY_MS..=MAX_RETRY_DELAY_MS).contains(&retry_after_loss_ms) {
            return Err(Error::InvalidArgument(format!(
                "retryAfterLossMs must be between {MIN_RETRY_DELAY_MS} and {MAX_RETRY_DELAY_MS}"
            )));
        }

        let retry_after_failure_ms = self
            .retry_after_failure_ms
            .unwrap_or(DEFAULT_RETRY_AFTER_FAILURE_MS);
        if !(MIN_RETRY_DELAY_MS..=MAX_RETRY_DELAY_MS).contains(&retry_after_failure_ms) {
            return Err(Error::InvalidArgument(format!(
                "retryAfterFailureMs must be between {MIN_RETRY_DELAY_MS} and {MAX_RETRY_DELAY_MS}"
            )));
        }

        Ok(StreamConfig {
            host,
            secure,
            retry_after_loss_ms,
            retry_after_failure_ms,
        })
    }
}

impl StreamConfig {
    /// Duplex endpoint derived from the origin; secure origins use the
    /// secure transport scheme.
    pub fn endpoint(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}{STREAM_PATH}", self.host)
    }

    pub fn api_base_url(&self) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        format!("{scheme}://{}", self.host)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StreamEnvelope {
    #[serde(rename = "type")]
    pub message_type: String,
    pub data: simd_json::OwnedValue,
}

#[derive(Debug, Serialize)]
pub struct OutboundEnvelope<'a, T: Serialize> {
    #[serde(rename = "type")]
    pub message_type: &'a str,
    pub data: &'a T,
}

pub fn parse_stream_envelope(payload: &mut [u8]) -> Result<StreamEnvelope, Error> {
    let envelope: StreamEnvelope = simd_json::serde::from_slice(payload)?;
    if envelope.message_type.is_empty() {
        return Err(Error::InvalidArgument(
            "stream envelope type must be non-empty".to_string(),
        ));
    }
    Ok(envelope)
}
