//! Process configuration, loaded from the environment.
//!
//! Mirrors the teacher's `Config::from_env` shape: every field has a
//! sane default so the service boots without a `.env` file, and values
//! are re-validated rather than trusted blindly.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub cache_dir: PathBuf,
    pub exchange_base_url: String,
    pub exchange_connect_timeout_ms: u64,
    pub exchange_read_timeout_ms: u64,
    pub default_ma_len: i64,
    pub default_thr: f64,
    pub default_feat_dim: usize,
    pub act_gate: f64,
}

fn env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let cache_dir = std::env::var("SIGNALBOAT_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("cache"));

        Self {
            port: env_u16("PORT", 3000),
            cache_dir,
            exchange_base_url: std::env::var("EXCHANGE_BASE_URL")
                .unwrap_or_else(|_| "https://api.bybit.com".to_string()),
            exchange_connect_timeout_ms: env_u64("EXCHANGE_CONNECT_TIMEOUT_MS", 5_000),
            exchange_read_timeout_ms: env_u64("EXCHANGE_READ_TIMEOUT_MS", 20_000),
            default_ma_len: env_u64("MODEL_DEFAULT_MA_LEN", 12) as i64,
            default_thr: env_f64("MODEL_DEFAULT_THR", 0.38),
            default_feat_dim: env_u64("MODEL_DEFAULT_FEAT_DIM", 28) as usize,
            act_gate: env_f64("SINGLE_TF_ACT_GATE", 0.10),
        }
    }

    pub fn raw_path(&self, symbol: &str, tf_minutes: i64) -> PathBuf {
        self.cache_dir.join(format!("{symbol}_{tf_minutes}.csv"))
    }

    pub fn clean_path(&self, symbol: &str, tf_minutes: i64) -> PathBuf {
        self.cache_dir
            .join("clean")
            .join(format!("{symbol}_{tf_minutes}.csv"))
    }

    pub fn model_path(&self, symbol: &str, tf_minutes: i64) -> PathBuf {
        self.cache_dir
            .join("models")
            .join(format!("{symbol}_{tf_minutes}_ppo_pro.json"))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
