//! C4 — Feature builder: turns an OHLCV candle series into a fixed
//! 8-column feature matrix (RSI, EMA(8)-EMA(21) diff, momentum,
//! ATR, MACD line+histogram, Bollinger mean+width%).
//!
//! Every indicator formula here is ported directly from the original
//! `features.cpp`: EMA seeded at the first sample with `k = 2/(period+1)`,
//! RSI smoothed the same way rather than a simple rolling average, and
//! Bollinger width expressed as a percentage of its own mean (clamped
//! away from zero) rather than an absolute spread.

pub const FEATURE_DIM: usize = 8;
/// Rows before this index are zero-filled: MACD's 26+9 lookback is the
/// longest-warming indicator in the set.
const WARMUP: usize = 35;

fn ema(values: &[f64], period: usize) -> Vec<f64> {
    let mut out = vec![0.0; values.len()];
    if values.is_empty() {
        return out;
    }
    let k = 2.0 / (period as f64 + 1.0);
    out[0] = values[0];
    for i in 1..values.len() {
        out[i] = values[i] * k + out[i - 1] * (1.0 - k);
    }
    out
}

fn rsi(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![0.0; n];
    if n < 2 {
        return out;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut avg_up = 0.0;
    let mut avg_down = 0.0;
    for i in 1..n {
        let change = closes[i] - closes[i - 1];
        let up = change.max(0.0);
        let down = (-change).max(0.0);
        avg_up = up * k + avg_up * (1.0 - k);
        avg_down = down * k + avg_down * (1.0 - k);
        let rs = avg_up / avg_down.max(1e-12);
        out[i] = 100.0 - (100.0 / (1.0 + rs));
    }
    out
}

fn momentum(closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut out = vec![0.0; n];
    for i in period..n {
        out[i] = closes[i] - closes[i - period];
    }
    out
}

fn atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> Vec<f64> {
    let n = closes.len();
    let mut true_range = vec![0.0; n];
    for i in 0..n {
        if i == 0 {
            true_range[i] = highs[i] - lows[i];
        } else {
            let hl = highs[i] - lows[i];
            let hc = (highs[i] - closes[i - 1]).abs();
            let lc = (lows[i] - closes[i - 1]).abs();
            true_range[i] = hl.max(hc).max(lc);
        }
    }
    ema(&true_range, period)
}

/// Returns `(macd_line, histogram)`.
fn macd(closes: &[f64], fast: usize, slow: usize, signal: usize) -> (Vec<f64>, Vec<f64>) {
    let ema_fast = ema(closes, fast);
    let ema_slow = ema(closes, slow);
    let line: Vec<f64> = ema_fast.iter().zip(&ema_slow).map(|(f, s)| f - s).collect();
    let signal_line = ema(&line, signal);
    let hist: Vec<f64> = line.iter().zip(&signal_line).map(|(l, s)| l - s).collect();
    (line, hist)
}

/// Returns `(mean, width_pct)` where `width_pct = (stddev / mean) * 100`,
/// `mean` clamped away from zero before dividing.
fn bollinger(closes: &[f64], period: usize) -> (Vec<f64>, Vec<f64>) {
    let n = closes.len();
    let mut mean = vec![0.0; n];
    let mut width = vec![0.0; n];
    for i in 0..n {
        if i + 1 < period {
            continue;
        }
        let window = &closes[i + 1 - period..=i];
        let m = window.iter().sum::<f64>() / period as f64;
        let var = window.iter().map(|v| (v - m).powi(2)).sum::<f64>() / period as f64;
        let sd = var.sqrt();
        let m_safe = if m.abs() < 1e-12 { 1e-12 } else { m };
        mean[i] = m;
        width[i] = (sd / m_safe) * 100.0;
    }
    (mean, width)
}

/// Build the N x 8 feature matrix from an OHLCV series. Rows before
/// [`WARMUP`] are all-zero rather than partially-converged indicator
/// values.
pub fn build_features(opens: &[f64], highs: &[f64], lows: &[f64], closes: &[f64]) -> Vec<Vec<f64>> {
    let _ = opens; // reserved: the original reads open only for the raw matrix, not features
    let n = closes.len();
    let ema_fast = ema(closes, 8);
    let ema_slow = ema(closes, 21);
    let rsi14 = rsi(closes, 14);
    let mom10 = momentum(closes, 10);
    let atr14 = atr(highs, lows, closes, 14);
    let (macd_line, macd_hist) = macd(closes, 12, 26, 9);
    let (bb_mean, bb_width) = bollinger(closes, 20);

    let mut rows = Vec::with_capacity(n);
    for i in 0..n {
        if i < WARMUP {
            rows.push(vec![0.0; FEATURE_DIM]);
            continue;
        }
        rows.push(vec![
            rsi14[i],
            ema_fast[i] - ema_slow[i],
            mom10[i],
            atr14[i],
            macd_line[i],
            macd_hist[i],
            bb_mean[i],
            bb_width[i],
        ]);
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::Candle;

    fn synthetic_candles(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let base = 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.05;
                Candle {
                    ts_ms: i as i64 * 900_000,
                    open: base,
                    high: base + 1.0,
                    low: base - 1.0,
                    close: base + 0.2,
                    volume: 10.0 + i as f64,
                }
            })
            .collect()
    }

    #[test]
    fn warmup_rows_are_zero_filled() {
        let candles = synthetic_candles(60);
        let opens: Vec<f64> = candles.iter().map(|c| c.open).collect();
        let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let features = build_features(&opens, &highs, &lows, &closes);
        assert_eq!(features.len(), 60);
        for row in &features[..WARMUP] {
            assert!(row.iter().all(|&v| v == 0.0));
        }
        assert_eq!(features[59].len(), FEATURE_DIM);
    }

    #[test]
    fn post_warmup_rows_are_non_trivial() {
        let candles = synthetic_candles(80);
        let opens: Vec<f64> = candles.iter().map(|c| c.open).collect();
        let highs: Vec<f64> = candles.iter().map(|c| c.high).collect();
        let lows: Vec<f64> = candles.iter().map(|c| c.low).collect();
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

        let features = build_features(&opens, &highs, &lows, &closes);
        let last = &features[79];
        assert!(last.iter().any(|&v| v != 0.0));
        assert!(last.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn rsi_stays_within_bounds() {
        let closes: Vec<f64> = (0..100).map(|i| 100.0 + i as f64 * 0.5).collect();
        let values = rsi(&closes, 14);
        for v in values.iter().skip(14) {
            assert!(*v >= 0.0 && *v <= 100.0);
        }
    }
}
