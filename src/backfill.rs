//! C2 — Backfill executor: walks an exchange's kline history forward
//! from a cursor, merging each batch into the candle store.
//!
//! Grounded in the original's `backfill_last_months` cursor loop: fetch
//! a page, advance the cursor past the last bar received, throttle
//! between pages, and give up after a run of consecutive failures
//! rather than retrying forever against a dead upstream.

use crate::candle::Candle;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::exchange::ExchangeClient;
use crate::symbol::tf_ms;
use crate::{store, store::ReadResult};
use serde::Serialize;
use std::time::Duration;

const PAGE_LIMIT: u32 = 1000;
const INTER_BATCH_DELAY_MS: u64 = 60;
const RETRY_DELAY_MS: u64 = 200;
/// Consecutive-failure budget before a backfill run gives up on its cursor.
const MAX_CONSECUTIVE_FAILURES: u32 = 5;

#[derive(Debug, Clone, Serialize, Default)]
pub struct BackfillStats {
    pub ok: bool,
    pub fetched: usize,
    pub written: usize,
    pub skipped_malformed: usize,
    pub retries: u32,
    pub error: Option<String>,
}

pub async fn backfill(
    config: &Config,
    exchange: &dyn ExchangeClient,
    symbol: &str,
    tf_minutes: i64,
    months: i64,
) -> AppResult<BackfillStats> {
    let mut stats = BackfillStats::default();

    let ReadResult { mut rows, skipped } = store::read(&config.raw_path(symbol, tf_minutes))?;
    stats.skipped_malformed += skipped;

    let bar_ms = tf_ms(tf_minutes);
    let now_ms = reference_now_ms();
    let span_ms = months.clamp(1, 36) * 30 * 86_400_000;
    let since_ms = now_ms - span_ms;
    let mut cursor = rows
        .keys()
        .next_back()
        .map(|last| last + bar_ms)
        .unwrap_or(since_ms);

    let mut consecutive_failures = 0u32;

    loop {
        if cursor >= now_ms {
            break;
        }

        match exchange
            .fetch_klines(symbol, tf_minutes, cursor, PAGE_LIMIT)
            .await
        {
            Ok(batch) if batch.is_empty() => break,
            Ok(mut batch) => {
                consecutive_failures = 0;
                batch.sort_by_key(|c: &Candle| c.ts_ms);
                stats.fetched += batch.len();

                let last_ts = batch.last().map(|c| c.ts_ms).unwrap_or(cursor);
                for candle in batch {
                    rows.insert(candle.ts_ms, candle);
                }
                stats.written = rows.len();
                cursor = last_ts + bar_ms;

                tokio::time::sleep(Duration::from_millis(INTER_BATCH_DELAY_MS)).await;
            }
            Err(e) => {
                consecutive_failures += 1;
                stats.retries += 1;
                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                    stats.ok = false;
                    stats.error = Some(e.to_string());
                    return Ok(stats);
                }
                tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
            }
        }
    }

    store::trim_since(&mut rows, since_ms);

    store::write(&config.raw_path(symbol, tf_minutes), &rows)?;
    store::write_clean(&config.clean_path(symbol, tf_minutes), &rows)?;

    stats.ok = true;
    stats.written = rows.len();
    Ok(stats)
}

/// `store::read`/`store::write` never touch wall-clock time; this is the
/// one place the executor needs "now" to bound its walk. Using the
/// system clock here (rather than `chrono::Utc::now` sprinkled through
/// the loop) keeps the cursor math in one spot.
fn reference_now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub fn backfill_error_stats(err: &AppError) -> BackfillStats {
    BackfillStats {
        ok: false,
        error: Some(err.to_string()),
        ..Default::default()
    }
}
