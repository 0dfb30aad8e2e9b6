//! C8 — Model artifact: the on-disk `ppo_pro_v1` JSON schema, and
//! `ModelState`, the in-memory handle the rest of the service reads
//! through. Swapping in a freshly trained model replaces one `Arc`
//! pointer so concurrent readers see either the old or the new
//! snapshot in full, never a half-updated mix of fields.

use crate::error::{AppError, AppResult};
use crate::policy::Policy;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

pub const SCHEMA: &str = "ppo_pro_v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OosSummary {
    pub val_accuracy: f64,
    pub val_sharpe: f64,
    pub val_winrate: f64,
    pub val_drawdown: f64,
    pub val_profit_avg: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub ok: bool,
    pub schema: String,
    pub version: u32,
    pub symbol: String,
    pub timeframe: i64,
    pub best_thr: f64,
    pub ma_len: i64,
    pub tp: f64,
    pub sl: f64,
    pub feat_dim: usize,
    pub policy: Policy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oos_summary: Option<OosSummary>,
}

impl ModelArtifact {
    pub fn validate(&self) -> AppResult<()> {
        if self.version == 0 {
            return Err(AppError::ModelInvalid("version must be >= 1".into()));
        }
        if self.schema != SCHEMA {
            return Err(AppError::ModelInvalid(format!(
                "unexpected schema {:?}, want {SCHEMA:?}",
                self.schema
            )));
        }
        if self.policy.dim != self.feat_dim {
            return Err(AppError::ModelInvalid(format!(
                "policy dim {} does not match feat_dim {}",
                self.policy.dim, self.feat_dim
            )));
        }
        Ok(())
    }
}

fn load_artifact(path: &Path) -> AppResult<Option<ModelArtifact>> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AppError::Io(e.to_string())),
    };
    let artifact: ModelArtifact = match serde_json::from_str(&text) {
        Ok(a) => a,
        Err(e) => return Err(AppError::ModelInvalid(e.to_string())),
    };
    artifact.validate()?;
    Ok(Some(artifact))
}

fn save_artifact(path: &Path, artifact: &ModelArtifact) -> AppResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AppError::Io(e.to_string()))?;
    }
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut f = fs::File::create(&tmp_path).map_err(|e| AppError::Io(e.to_string()))?;
        let text = serde_json::to_string_pretty(artifact)
            .map_err(|e| AppError::Internal { op: "model_serialize".into(), what: e.to_string() })?;
        f.write_all(text.as_bytes()).map_err(|e| AppError::Io(e.to_string()))?;
    }
    fs::rename(&tmp_path, path).map_err(|e| AppError::Io(e.to_string()))?;
    Ok(())
}

/// In-memory handle to "the current model" for one (symbol, timeframe).
/// `thr`/`ma_len`/`feat_dim` are mirrored into atomics so hot-path reads
/// (gating a single inference call) don't need to lock the artifact.
pub struct ModelState {
    thr_bits: AtomicU64,
    ma_len: AtomicI64,
    feat_dim: AtomicUsize,
    current: RwLock<Option<Arc<ModelArtifact>>>,
}

impl ModelState {
    pub fn new(default_thr: f64, default_ma_len: i64, default_feat_dim: usize) -> Self {
        Self {
            thr_bits: AtomicU64::new(default_thr.to_bits()),
            ma_len: AtomicI64::new(default_ma_len),
            feat_dim: AtomicUsize::new(default_feat_dim),
            current: RwLock::new(None),
        }
    }

    /// Load from disk into a fresh state; falls back to the supplied
    /// defaults if no file exists yet or the file fails to validate.
    pub fn load(path: &Path, default_thr: f64, default_ma_len: i64, default_feat_dim: usize) -> Self {
        let state = Self::new(default_thr, default_ma_len, default_feat_dim);
        match load_artifact(path) {
            Ok(Some(artifact)) => state.adopt(artifact),
            Ok(None) => {}
            Err(_) => {}
        }
        state
    }

    pub fn thr(&self) -> f64 {
        f64::from_bits(self.thr_bits.load(Ordering::SeqCst))
    }

    pub fn ma_len(&self) -> i64 {
        self.ma_len.load(Ordering::SeqCst)
    }

    pub fn feat_dim(&self) -> usize {
        self.feat_dim.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Option<Arc<ModelArtifact>> {
        self.current.read().clone()
    }

    /// Atomically swap in a new artifact: readers observe either the
    /// full old snapshot or the full new one, never a partial mix.
    fn adopt(&self, artifact: ModelArtifact) {
        self.thr_bits.store(artifact.best_thr.to_bits(), Ordering::SeqCst);
        self.ma_len.store(artifact.ma_len, Ordering::SeqCst);
        self.feat_dim.store(artifact.feat_dim, Ordering::SeqCst);
        *self.current.write() = Some(Arc::new(artifact));
    }

    pub fn set(&self, path: &Path, artifact: ModelArtifact) -> AppResult<()> {
        artifact.validate()?;
        save_artifact(path, &artifact)?;
        self.adopt(artifact);
        Ok(())
    }

    /// Partial-field override used by `/api/model/set`: each field is
    /// validated independently and only applied if present.
    pub fn apply_overrides(&self, path: &Path, overrides: ModelOverrides) -> AppResult<ModelArtifact> {
        let mut artifact = self
            .snapshot()
            .map(|a| (*a).clone())
            .ok_or(AppError::NoPolicyInModel)?;

        if let Some(thr) = overrides.best_thr {
            if !(thr > 0.0 && thr <= 1.0) {
                return Err(AppError::InvalidInput(format!("best_thr {thr} out of range (0, 1]")));
            }
            artifact.best_thr = thr;
        }
        if let Some(ma_len) = overrides.ma_len {
            if !(ma_len > 0 && ma_len <= 100_000) {
                return Err(AppError::InvalidInput(format!("ma_len {ma_len} out of range (0, 100000]")));
            }
            artifact.ma_len = ma_len;
        }
        if let Some(feat_dim) = overrides.feat_dim {
            if feat_dim == 0 || feat_dim >= 4096 {
                return Err(AppError::InvalidInput(format!("feat_dim {feat_dim} out of range (0, 4096)")));
            }
            artifact.feat_dim = feat_dim;
        }
        if let Some(tp) = overrides.tp {
            if !tp.is_finite() || !(0.0..=1.0).contains(&tp) {
                return Err(AppError::InvalidInput(format!("tp {tp} out of range [0, 1]")));
            }
            artifact.tp = tp;
        }
        if let Some(sl) = overrides.sl {
            if !sl.is_finite() || !(0.0..=1.0).contains(&sl) {
                return Err(AppError::InvalidInput(format!("sl {sl} out of range [0, 1]")));
            }
            artifact.sl = sl;
        }

        self.set(path, artifact.clone())?;
        Ok(artifact)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelOverrides {
    pub best_thr: Option<f64>,
    pub ma_len: Option<i64>,
    pub feat_dim: Option<usize>,
    pub tp: Option<f64>,
    pub sl: Option<f64>,
}
