//! Exchange REST client: a pluggable boundary around the one external
//! collaborator this service has. `ExchangeClient` is the seam; the
//! concrete adapter talks Bybit v5's kline endpoint, and tests swap in
//! an in-memory mock instead of hitting the network.

use crate::candle::Candle;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Fetch up to `limit` klines for `symbol`/`tf_minutes` starting at
    /// `start_ms` (inclusive), ascending by open time.
    async fn fetch_klines(
        &self,
        symbol: &str,
        tf_minutes: i64,
        start_ms: i64,
        limit: u32,
    ) -> AppResult<Vec<Candle>>;
}

/// `reqwest`-backed client for Bybit v5 `/v5/market/kline`.
pub struct HttpExchangeClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpExchangeClient {
    pub fn new(base_url: String, connect_timeout_ms: u64, read_timeout_ms: u64) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_millis(connect_timeout_ms))
            .timeout(Duration::from_millis(read_timeout_ms))
            .build()
            .map_err(|e| AppError::Internal {
                op: "exchange_client_build".into(),
                what: e.to_string(),
            })?;
        Ok(Self { http, base_url })
    }

    fn interval_code(tf_minutes: i64) -> AppResult<&'static str> {
        match tf_minutes {
            15 => Ok("15"),
            60 => Ok("60"),
            240 => Ok("240"),
            1440 => Ok("D"),
            other => Err(AppError::InvalidInput(format!(
                "unsupported timeframe passed exchange boundary: {other}"
            ))),
        }
    }
}

#[derive(Deserialize)]
struct BybitEnvelope {
    #[serde(rename = "retCode")]
    ret_code: i64,
    #[serde(rename = "retMsg")]
    ret_msg: String,
    result: Option<BybitResult>,
}

#[derive(Deserialize)]
struct BybitResult {
    list: Vec<[String; 7]>,
}

#[async_trait]
impl ExchangeClient for HttpExchangeClient {
    async fn fetch_klines(
        &self,
        symbol: &str,
        tf_minutes: i64,
        start_ms: i64,
        limit: u32,
    ) -> AppResult<Vec<Candle>> {
        let interval = Self::interval_code(tf_minutes)?;
        let url = format!("{}/v5/market/kline", self.base_url);
        let resp = self
            .http
            .get(&url)
            .query(&[
                ("category", "linear"),
                ("symbol", symbol),
                ("interval", interval),
                ("start", &start_ms.to_string()),
                ("limit", &limit.to_string()),
            ])
            .send()
            .await
            .map_err(|e| AppError::UpstreamTransient(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(AppError::UpstreamTransient(format!(
                "http status {}",
                resp.status()
            )));
        }

        let envelope: BybitEnvelope = resp
            .json()
            .await
            .map_err(|e| AppError::UpstreamTransient(e.to_string()))?;

        if envelope.ret_code != 0 {
            return Err(AppError::UpstreamTransient(format!(
                "retCode={} retMsg={}",
                envelope.ret_code, envelope.ret_msg
            )));
        }

        let list = envelope
            .result
            .map(|r| r.list)
            .unwrap_or_default();

        let mut candles: Vec<Candle> = list
            .into_iter()
            .filter_map(|row| {
                let ts_ms: i64 = row[0].parse().ok()?;
                let open: f64 = row[1].parse().ok()?;
                let high: f64 = row[2].parse().ok()?;
                let low: f64 = row[3].parse().ok()?;
                let close: f64 = row[4].parse().ok()?;
                let volume: f64 = row[5].parse().ok()?;
                Some(Candle {
                    ts_ms,
                    open,
                    high,
                    low,
                    close,
                    volume,
                })
            })
            .collect();
        candles.sort_by_key(|c| c.ts_ms);
        Ok(candles)
    }
}

/// In-memory test double: returns canned pages keyed by call count, or
/// an `UpstreamTransient` error when the script runs out.
#[cfg(test)]
pub struct MockExchangeClient {
    pub pages: parking_lot::Mutex<Vec<AppResult<Vec<Candle>>>>,
}

#[cfg(test)]
impl MockExchangeClient {
    pub fn new(pages: Vec<AppResult<Vec<Candle>>>) -> Self {
        Self {
            pages: parking_lot::Mutex::new(pages),
        }
    }
}

#[cfg(test)]
#[async_trait]
impl ExchangeClient for MockExchangeClient {
    async fn fetch_klines(
        &self,
        _symbol: &str,
        _tf_minutes: i64,
        _start_ms: i64,
        _limit: u32,
    ) -> AppResult<Vec<Candle>> {
        let mut pages = self.pages.lock();
        if pages.is_empty() {
            return Ok(Vec::new());
        }
        pages.remove(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_client_returns_pages_in_order() {
        let client = MockExchangeClient::new(vec![
            Ok(vec![Candle {
                ts_ms: 0,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1.0,
            }]),
            Ok(vec![]),
        ]);
        let first = client.fetch_klines("BTCUSDT", 15, 0, 200).await.unwrap();
        assert_eq!(first.len(), 1);
        let second = client.fetch_klines("BTCUSDT", 15, 900_000, 200).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn mock_client_surfaces_errors() {
        let client = MockExchangeClient::new(vec![Err(AppError::UpstreamTransient("boom".into()))]);
        let err = client.fetch_klines("BTCUSDT", 15, 0, 200).await.unwrap_err();
        assert!(matches!(err, AppError::UpstreamTransient(_)));
    }
}
