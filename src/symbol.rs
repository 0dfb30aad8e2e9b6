//! Symbol normalization: a fixed alias table mapping a requested ticker
//! to its exchange-canonical form. Static, process-scoped, no I/O.

/// Canonical timeframes, in minutes.
pub const CANONICAL_TFS: [i64; 4] = [15, 60, 240, 1440];

pub fn canonical_minutes(interval: &str) -> Option<i64> {
    match interval.trim() {
        "15" | "15m" => Some(15),
        "60" | "1h" | "60m" => Some(60),
        "240" | "4h" | "240m" => Some(240),
        "1440" | "1d" | "1440m" => Some(1440),
        _ => None,
    }
}

pub fn tf_ms(tf_minutes: i64) -> i64 {
    tf_minutes * 60_000
}

/// Normalize a requested ticker to the exchange-canonical ticker.
/// Unknown inputs pass through upper-cased with whitespace stripped.
pub fn normalize(requested: &str) -> String {
    let up = requested.trim().to_uppercase();
    match up.as_str() {
        "MATICUSDT" => "POLUSDT".to_string(),
        "XBTUSDT" => "BTCUSDT".to_string(),
        "BCCUSDT" => "BCHUSDT".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_known_aliases() {
        assert_eq!(normalize("maticusdt"), "POLUSDT");
        assert_eq!(normalize(" xbtusdt "), "BTCUSDT");
        assert_eq!(normalize("bccusdt"), "BCHUSDT");
    }

    #[test]
    fn passes_through_unknown_uppercased() {
        assert_eq!(normalize("ethusdt"), "ETHUSDT");
        assert_eq!(normalize("SOLUSDT"), "SOLUSDT");
    }

    #[test]
    fn canonical_interval_resolution() {
        assert_eq!(canonical_minutes("15"), Some(15));
        assert_eq!(canonical_minutes("1h"), Some(60));
        assert_eq!(canonical_minutes("bogus"), None);
    }

    #[test]
    fn tf_ms_matches_invariant() {
        for &tf in &CANONICAL_TFS {
            assert_eq!(tf_ms(tf), tf * 60_000);
        }
    }
}
