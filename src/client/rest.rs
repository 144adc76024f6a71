//! HTTP depth-snapshot client.
//!
//! Fetches a `{lastUpdateId, bids, asks}` depth snapshot (the shape Binance
//! and several other venues publish) and turns it into a snapshot
//! [`UpdateBatch`]. It implements [`BookSync`] so it can drive a REST-sourced
//! book directly.
//!
//! # Example
//!
//! ```rust,no_run
//! use book_resync::client::RestSnapshotClient;
//! use book_resync::config::BookConfig;
//! use book_resync::orderbook::OrderBook;
//!
//! # async fn example() -> book_resync::Result<()> {
//! let client = RestSnapshotClient::new("https://api.binance.com/api/v3/depth", "BTCUSDT")?
//!     .with_limit(1000);
//! let book = OrderBook::new(BookConfig::new("binance", "BTCUSDT"), client);
//!
//! let snapshot = book.strategy().fetch().await?;
//! book.insert_slot_now(snapshot);
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use reqwest::header::RETRY_AFTER;
use reqwest::Client;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer};
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::orderbook::{BookSync, ChainRule};
use crate::types::{now_ms, Amount, Price, UpdateBatch};
use crate::Result;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_LIMIT: u32 = 1000;

/// Depth snapshot as served over HTTP
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthSnapshot {
    /// Update id the snapshot is consistent with
    pub last_update_id: i64,
    /// Message time, when the venue sends one
    #[serde(default, rename = "E")]
    pub event_time: Option<i64>,
    /// Bids, best first
    #[serde(deserialize_with = "deserialize_levels")]
    pub bids: Vec<(Price, Amount)>,
    /// Asks, best first
    #[serde(deserialize_with = "deserialize_levels")]
    pub asks: Vec<(Price, Amount)>,
}

/// Levels arrive as `[price, amount, ...]` with numbers or decimal strings
fn deserialize_levels<'de, D>(deserializer: D) -> std::result::Result<Vec<(Price, Amount)>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Number {
        Float(f64),
        Text(String),
    }

    fn value<E: serde::de::Error>(n: &Number) -> std::result::Result<f64, E> {
        match n {
            Number::Float(f) => Ok(*f),
            Number::Text(s) => s
                .parse()
                .map_err(|_| E::custom(format!("invalid decimal: {s:?}"))),
        }
    }

    let rows: Vec<Vec<Number>> = Vec::deserialize(deserializer)?;
    rows.iter()
        .map(|row| match row.as_slice() {
            [price, amount, ..] => Ok((value(price)?, value(amount)?)),
            _ => Err(D::Error::custom("level needs a price and an amount")),
        })
        .collect()
}

impl DepthSnapshot {
    /// Parse a response body
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`] if the body is not a depth snapshot.
    pub fn from_json(body: &str) -> Result<Self> {
        serde_json::from_str(body).map_err(Error::from)
    }

    /// Convert into a snapshot batch; `last_id` and `prev_last_id` both carry
    /// `last_update_id`
    #[must_use]
    pub fn into_batch(self, arrival_index: i64) -> UpdateBatch {
        let mut batch = UpdateBatch::new(arrival_index)
            .snapshot()
            .with_last_id(self.last_update_id)
            .with_prev_last_id(self.last_update_id);
        batch.exchange_ts_ms = self.event_time.unwrap_or(0);
        batch.levels.reserve(self.bids.len() + self.asks.len());
        for (price, amount) in self.bids {
            batch.push_bid(price, amount);
        }
        for (price, amount) in self.asks {
            batch.push_ask(price, amount);
        }
        batch
    }
}

/// HTTP client for depth snapshots of one symbol
#[derive(Debug, Clone)]
pub struct RestSnapshotClient {
    client: Client,
    endpoint: Url,
    symbol: String,
    limit: u32,
    chain: ChainRule,
}

impl RestSnapshotClient {
    /// Create a client for `symbol` on the snapshot `endpoint`
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the endpoint is not an http(s) URL, or
    /// [`Error::Http`] if the HTTP client cannot be initialized.
    pub fn new(endpoint: &str, symbol: impl Into<String>) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid snapshot endpoint {endpoint:?}: {e}")))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "snapshot endpoint must be http(s), got {}",
                endpoint.scheme()
            )));
        }

        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;

        Ok(Self {
            client,
            endpoint,
            symbol: symbol.into(),
            limit: DEFAULT_LIMIT,
            chain: ChainRule::default(),
        })
    }

    /// Set the number of levels requested per side
    #[must_use]
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Set how deltas chain onto the snapshot
    #[must_use]
    pub fn with_chain_rule(mut self, chain: ChainRule) -> Self {
        self.chain = chain;
        self
    }

    /// Set the request timeout
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the HTTP client cannot be rebuilt.
    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self> {
        self.client = Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    /// Full request URL
    pub fn request_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut()
            .append_pair("symbol", &self.symbol)
            .append_pair("limit", &self.limit.to_string());
        url
    }

    /// Fetch a snapshot and convert it to a batch
    ///
    /// # Errors
    ///
    /// - [`Error::RateLimited`] on HTTP 429
    /// - [`Error::Api`] on any other non-success status
    /// - [`Error::Http`] / [`Error::Json`] on transport or decode failure
    pub async fn fetch(&self) -> Result<UpdateBatch> {
        let url = self.request_url();
        let response = self.client.get(url.clone()).send().await?;
        let snapshot = Self::handle_response(response).await?;
        debug!(
            %url,
            last_update_id = snapshot.last_update_id,
            bids = snapshot.bids.len(),
            asks = snapshot.asks.len(),
            "depth snapshot fetched"
        );
        Ok(snapshot.into_batch(now_ms()))
    }

    async fn handle_response(response: reqwest::Response) -> Result<DepthSnapshot> {
        let status = response.status();

        if status.as_u16() == 429 {
            // Retry-After is in seconds
            let retry_after_ms = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000));
            return Err(Error::RateLimited { retry_after_ms });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status: status.as_u16(),
                message: api_message(&body),
            });
        }

        let body = response.text().await?;
        DepthSnapshot::from_json(&body)
    }
}

/// Error text from a venue error body (`msg`, `message` or `error`), else the body
fn api_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            ["msg", "message", "error"]
                .iter()
                .find_map(|key| value.get(*key).and_then(|v| v.as_str()).map(str::to_string))
        })
        .unwrap_or_else(|| body.to_string())
}

impl BookSync for RestSnapshotClient {
    async fn fetch_snapshot(&self) -> Result<Option<UpdateBatch>> {
        self.fetch()
            .await
            .map(Some)
            .map_err(|e| Error::SnapshotFetchFailed(e.to_string()))
    }

    fn first_match(&self, snapshot: &UpdateBatch, candidate: &UpdateBatch) -> bool {
        self.chain.first_match(snapshot, candidate)
    }

    fn connects(&self, _first_matched: bool, update_id: i64, candidate: &UpdateBatch) -> bool {
        self.chain.connects(update_id, candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_string_levels() {
        let body = r#"{
            "lastUpdateId": 1027024,
            "bids": [["4.00000000", "431.00000000"], ["3.99", "9"]],
            "asks": [["4.00000200", "12.00000000"]]
        }"#;
        let snapshot = DepthSnapshot::from_json(body).unwrap();
        assert_eq!(snapshot.last_update_id, 1_027_024);
        assert_eq!(snapshot.bids, vec![(4.0, 431.0), (3.99, 9.0)]);
        assert_eq!(snapshot.asks, vec![(4.000002, 12.0)]);
        assert_eq!(snapshot.event_time, None);
    }

    #[test]
    fn test_parse_numeric_levels_with_extra_fields() {
        let body = r#"{"lastUpdateId": 7, "E": 1700000000000,
            "bids": [[100.5, 2, "0", "1"]], "asks": []}"#;
        let snapshot = DepthSnapshot::from_json(body).unwrap();
        assert_eq!(snapshot.bids, vec![(100.5, 2.0)]);
        assert_eq!(snapshot.event_time, Some(1_700_000_000_000));
    }

    #[test]
    fn test_parse_rejects_bad_levels() {
        let short = r#"{"lastUpdateId": 1, "bids": [["1.0"]], "asks": []}"#;
        assert!(matches!(DepthSnapshot::from_json(short), Err(Error::Json(_))));

        let garbage = r#"{"lastUpdateId": 1, "bids": [["abc", "1"]], "asks": []}"#;
        assert!(DepthSnapshot::from_json(garbage).is_err());
    }

    #[test]
    fn test_into_batch() {
        let body = r#"{"lastUpdateId": 42, "bids": [["10", "1"], ["9", "2"]], "asks": [["11", "3"]]}"#;
        let batch = DepthSnapshot::from_json(body).unwrap().into_batch(5);

        assert!(batch.is_snapshot);
        assert_eq!(batch.arrival_index, 5);
        assert_eq!(batch.last_id, 42);
        assert_eq!(batch.prev_last_id, 42);
        assert_eq!(batch.bid_count, 2);
        assert_eq!(batch.bids()[1].price, 9.0);
        assert_eq!(batch.asks()[0].amount, 3.0);
    }

    #[test]
    fn test_request_url() {
        let client = RestSnapshotClient::new("https://api.binance.com/api/v3/depth", "BTCUSDT")
            .unwrap()
            .with_limit(500);
        assert_eq!(
            client.request_url().as_str(),
            "https://api.binance.com/api/v3/depth?symbol=BTCUSDT&limit=500"
        );
    }

    #[test]
    fn test_rejects_non_http_endpoint() {
        assert!(matches!(
            RestSnapshotClient::new("wss://stream.binance.com/ws", "BTCUSDT"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            RestSnapshotClient::new("not a url", "BTCUSDT"),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_api_message_extraction() {
        assert_eq!(api_message(r#"{"code":-1121,"msg":"Invalid symbol."}"#), "Invalid symbol.");
        assert_eq!(api_message("gateway timeout"), "gateway timeout");
    }
}
