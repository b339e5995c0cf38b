//! Application state shared across routes

use std::sync::Arc;

use crate::config::Config;
use crate::game::map::MapError;
use crate::game::MatchRegistry;
use crate::store::{MapStore, RestClient, StatsRecorder};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<MatchRegistry>,
    pub maps: Arc<MapStore>,
}

impl AppState {
    /// `store` is the persistence client when one is configured; stats go
    /// through `stats` either way
    pub fn new(
        config: Config,
        store: Option<RestClient>,
        stats: StatsRecorder,
    ) -> Result<Self, MapError> {
        let registry = Arc::new(MatchRegistry::new(config.tick_rate, stats));
        let maps = Arc::new(MapStore::new(store)?);

        Ok(Self {
            config: Arc::new(config),
            registry,
            maps,
        })
    }
}
