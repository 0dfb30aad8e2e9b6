//! C1 — Candle store: on-disk canonical CSV per (symbol, timeframe).
//!
//! A store file has no header and exactly six comma-separated fields per
//! row (`ts_ms,open,high,low,close,volume`). Reads are tolerant of BOM
//! markers, blank lines, and non-numeric timestamp columns (skipped and
//! counted rather than treated as fatal); writes always truncate and
//! rewrite in ascending timestamp order so a reader never observes a
//! partially-written file mid-sort.

use crate::candle::{parse_tolerant_int, Candle};
use crate::error::{AppError, AppResult};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Result of a raw-CSV read: the merged (ts -> candle) map plus the
/// number of lines that could not be parsed as a timestamp.
pub struct ReadResult {
    pub rows: BTreeMap<i64, Candle>,
    pub skipped: usize,
}

/// Parse one canonical or near-canonical CSV line into `(ts, remaining
/// numeric fields)`. Returns `None` if the timestamp column doesn't parse.
fn parse_line(line: &str) -> Option<(i64, Vec<f64>)> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let mut fields = line.split(',');
    let ts = parse_tolerant_int(fields.next()?)?;
    let rest: Vec<f64> = fields.filter_map(|f| f.trim().parse::<f64>().ok()).collect();
    Some((ts, rest))
}

/// Read a candle CSV file. Missing file => empty map, no error.
pub fn read(path: &Path) -> AppResult<ReadResult> {
    let mut rows = BTreeMap::new();
    let mut skipped = 0usize;

    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ReadResult { rows, skipped });
        }
        Err(e) => return Err(AppError::Io(e.to_string())),
    };

    for line in text.lines() {
        match parse_line(line) {
            Some((ts, fields)) if fields.len() >= 5 => {
                rows.insert(
                    ts,
                    Candle {
                        ts_ms: ts,
                        open: fields[0],
                        high: fields[1],
                        low: fields[2],
                        close: fields[3],
                        volume: fields[4],
                    },
                );
            }
            _ => skipped += 1,
        }
    }

    Ok(ReadResult { rows, skipped })
}

/// Truncate and rewrite the store in ascending `ts_ms` order.
pub fn write(path: &Path, rows: &BTreeMap<i64, Candle>) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::Io(e.to_string()))?;
    }
    let tmp_path = path.with_extension("csv.tmp");
    {
        let mut f = fs::File::create(&tmp_path).map_err(|e| AppError::Io(e.to_string()))?;
        for candle in rows.values() {
            writeln!(f, "{}", candle.to_csv_line()).map_err(|e| AppError::Io(e.to_string()))?;
        }
    }
    fs::rename(&tmp_path, path).map_err(|e| AppError::Io(e.to_string()))?;
    Ok(())
}

/// Trim a map to keys `>= since_ms`.
pub fn trim_since(rows: &mut BTreeMap<i64, Candle>, since_ms: i64) {
    let drop_keys: Vec<i64> = rows.range(..since_ms).map(|(k, _)| *k).collect();
    for k in drop_keys {
        rows.remove(&k);
    }
}

/// Load an OHLCV matrix for (symbol, tf), preferring the `clean/` variant
/// and falling back to raw. Every row has exactly 6 logical columns
/// (ts, open, high, low, close, volume); a 7th raw column is trimmed.
pub fn load_ohlcv(cache_dir: &Path, symbol: &str, tf_minutes: i64) -> AppResult<Vec<Candle>> {
    let clean = cache_dir
        .join("clean")
        .join(format!("{symbol}_{tf_minutes}.csv"));
    let raw = cache_dir.join(format!("{symbol}_{tf_minutes}.csv"));

    let path = if clean.exists() { &clean } else { &raw };
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(AppError::Io(e.to_string())),
    };

    let mut candles = Vec::new();
    for line in text.lines() {
        let Some((ts, fields)) = parse_line(line) else {
            continue;
        };
        // 5 fields => canonical 6-column row. 6 fields => a 7th raw
        // column is present and trimmed. Anything else is malformed.
        let ohlcv: &[f64] = match fields.len() {
            5 => &fields,
            6 => &fields[..5],
            _ => return Err(AppError::BadShape(format!("expected 6 columns, found {}", fields.len() + 1))),
        };
        candles.push(Candle {
            ts_ms: ts,
            open: ohlcv[0],
            high: ohlcv[1],
            low: ohlcv[2],
            close: ohlcv[3],
            volume: ohlcv[4],
        });
    }
    candles.sort_by_key(|c| c.ts_ms);
    Ok(candles)
}

/// True if any adjacent pair of rows in `path` differs from `900_000 ms`
/// (the 15-minute bar width).
pub fn has_gaps_15m(path: &Path) -> bool {
    let Ok(text) = fs::read_to_string(path) else {
        return true;
    };
    let mut prev: Option<i64> = None;
    for line in text.lines() {
        let Some((ts, _)) = parse_line(line) else {
            continue;
        };
        if let Some(p) = prev {
            if ts - p != 900_000 {
                return true;
            }
        }
        prev = Some(ts);
    }
    prev.is_none() // an empty/unreadable file counts as gapped
}

/// Write the clean variant: same rows as `raw`, trimmed to six columns.
/// `raw` is assumed already-canonical (our own store never persists a
/// 7th column), so this is a straight copy through the six-field shape.
pub fn write_clean(clean_path: &Path, rows: &BTreeMap<i64, Candle>) -> AppResult<()> {
    write(clean_path, rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn candle(ts: i64) -> Candle {
        Candle {
            ts_ms: ts,
            open: 1.0,
            high: 2.0,
            low: 0.5,
            close: 1.5,
            volume: 100.0,
        }
    }

    #[test]
    fn read_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let result = read(&dir.path().join("missing.csv")).unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(result.skipped, 0);
    }

    #[test]
    fn read_skips_unparseable_lines_and_dedupes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.csv");
        fs::write(
            &path,
            "not_a_ts,1,2,3,4,5\n1000,1,2,3,4,5\n1000,9,9,9,9,9\n\u{feff}2000,1,2,3,4,5\n",
        )
        .unwrap();
        let result = read(&path).unwrap();
        assert_eq!(result.skipped, 1);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[&1000].open, 9.0); // later line overwrote earlier
    }

    #[test]
    fn write_then_read_round_trips_in_ascending_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("x.csv");
        let mut rows = BTreeMap::new();
        rows.insert(2000, candle(2000));
        rows.insert(1000, candle(1000));
        write(&path, &rows).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("1000,"));
        assert!(lines[1].starts_with("2000,"));
    }

    #[test]
    fn has_gaps_15m_detects_irregular_adjacency() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("clean15.csv");
        fs::write(&path, "0,1,2,3,4,5\n900000,1,2,3,4,5\n1800000,1,2,3,4,5\n").unwrap();
        assert!(!has_gaps_15m(&path));

        fs::write(&path, "0,1,2,3,4,5\n1800000,1,2,3,4,5\n").unwrap();
        assert!(has_gaps_15m(&path));
    }

    #[test]
    fn load_ohlcv_prefers_clean_and_trims_seventh_column() {
        let dir = tempdir().unwrap();
        let raw_dir = dir.path();
        let clean_dir = raw_dir.join("clean");
        fs::create_dir_all(&clean_dir).unwrap();
        fs::write(raw_dir.join("BTCUSDT_15.csv"), "0,1,2,3,4,5,999\n").unwrap();
        fs::write(clean_dir.join("BTCUSDT_15.csv"), "0,1,2,3,4,5\n900000,1,2,3,4,5\n").unwrap();

        let rows = load_ohlcv(raw_dir, "BTCUSDT", 15).unwrap();
        assert_eq!(rows.len(), 2);

        fs::remove_file(clean_dir.join("BTCUSDT_15.csv")).unwrap();
        let rows = load_ohlcv(raw_dir, "BTCUSDT", 15).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].volume, 5.0); // seventh column trimmed
    }

    #[test]
    fn load_ohlcv_rejects_bad_shape() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("BTCUSDT_15.csv"), "0,1,2,3\n").unwrap();
        let err = load_ohlcv(dir.path(), "BTCUSDT", 15).unwrap_err();
        assert!(matches!(err, AppError::BadShape(_)));
    }
}
