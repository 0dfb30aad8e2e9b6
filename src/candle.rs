//! Candle (OHLCV bar) data type and the tolerant integer parser used to
//! read the timestamp column of a candle CSV.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub ts_ms: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Canonical six-column CSV line: `ts,open,high,low,close,volume`.
    pub fn to_csv_line(&self) -> String {
        format!(
            "{},{},{},{},{},{}",
            self.ts_ms, self.open, self.high, self.low, self.close, self.volume
        )
    }
}

/// Accepts an optional UTF-8 BOM, leading/trailing whitespace, and a
/// leading `+`/`-` sign; rejects anything with a decimal point or
/// non-digit characters. Returns `None` rather than erroring so callers
/// can count skipped lines instead of aborting the whole read.
pub fn parse_tolerant_int(field: &str) -> Option<i64> {
    let trimmed = field.trim_start_matches('\u{feff}').trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<i64>().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_integer() {
        assert_eq!(parse_tolerant_int("1700000000000"), Some(1_700_000_000_000));
    }

    #[test]
    fn parses_bom_and_whitespace() {
        assert_eq!(parse_tolerant_int("\u{feff}  42  "), Some(42));
    }

    #[test]
    fn rejects_non_integer() {
        assert_eq!(parse_tolerant_int("12.5"), None);
        assert_eq!(parse_tolerant_int("abc"), None);
        assert_eq!(parse_tolerant_int(""), None);
    }
}
