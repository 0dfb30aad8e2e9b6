//! Shared application state handed to every route.

use crate::config::Config;
use crate::exchange::ExchangeClient;
use crate::model::ModelState;
use crate::queue::{HydrationExecutor, HydrationQueue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub exchange: Arc<dyn ExchangeClient>,
    pub queue: Arc<HydrationQueue>,
    pub started_at: Instant,
    models: Arc<RwLock<HashMap<(String, i64), Arc<ModelState>>>>,
}

impl AppState {
    pub fn new(config: Config, exchange: Arc<dyn ExchangeClient>, executor: Arc<dyn HydrationExecutor>) -> Self {
        Self {
            config: Arc::new(config),
            exchange,
            queue: HydrationQueue::new(executor),
            started_at: Instant::now(),
            models: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Fetch the `ModelState` for (symbol, timeframe), loading it from
    /// disk on first access and caching the handle thereafter.
    pub async fn model_state(&self, symbol: &str, tf_minutes: i64) -> Arc<ModelState> {
        let key = (symbol.to_string(), tf_minutes);
        if let Some(existing) = self.models.read().await.get(&key) {
            return existing.clone();
        }
        let mut models = self.models.write().await;
        if let Some(existing) = models.get(&key) {
            return existing.clone();
        }
        let path = self.config.model_path(symbol, tf_minutes);
        let state = Arc::new(ModelState::load(
            &path,
            self.config.default_thr,
            self.config.default_ma_len,
            self.config.default_feat_dim,
        ));
        models.insert(key, state.clone());
        state
    }
}
