//! Map lookup: built-in arenas plus editor maps fetched from the store

use std::collections::HashMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

use crate::game::map::{open_arena, test_arena, GameMap, MapError};

use super::{RestClient, StoreError};

pub const DEFAULT_MAP: &str = "test";

/// Row of the `maps` table; `data` is the base64 editor blob
#[derive(Debug, Clone, Deserialize)]
pub struct StoredMap {
    pub name: String,
    pub data: String,
}

impl StoredMap {
    pub fn decode(&self) -> Result<GameMap, StoreError> {
        let blob = STANDARD.decode(self.data.trim())?;
        Ok(GameMap::from_storage(&blob)?)
    }
}

pub struct MapStore {
    maps: RwLock<HashMap<String, Arc<GameMap>>>,
    client: Option<RestClient>,
}

impl MapStore {
    pub fn new(client: Option<RestClient>) -> Result<Self, MapError> {
        let mut maps = HashMap::new();
        maps.insert(DEFAULT_MAP.to_string(), Arc::new(test_arena()?));
        maps.insert("arena".to_string(), Arc::new(open_arena()?));
        Ok(Self {
            maps: RwLock::new(maps),
            client,
        })
    }

    /// Resolve a map by name, fetching and caching store maps on first use
    pub async fn get(&self, name: &str) -> Result<Arc<GameMap>, StoreError> {
        if let Some(map) = self.maps.read().get(name) {
            return Ok(map.clone());
        }
        if !is_valid_map_name(name) {
            return Err(StoreError::MapNotFound(name.to_string()));
        }
        let Some(client) = &self.client else {
            return Err(StoreError::MapNotFound(name.to_string()));
        };

        let query = format!("name=eq.{}&select=name,data", name);
        let stored: StoredMap = client
            .get_one("maps", &query)
            .await?
            .ok_or_else(|| StoreError::MapNotFound(name.to_string()))?;
        let map = Arc::new(stored.decode()?);

        info!(
            map = %stored.name,
            width = map.width(),
            height = map.height(),
            spawns = map.spawn_count(),
            "Loaded map from store"
        );
        let mut maps = self.maps.write();
        Ok(maps.entry(name.to_string()).or_insert(map).clone())
    }

    /// Names of every map currently known, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.maps.read().keys().cloned().collect();
        names.sort();
        names
    }
}

fn is_valid_map_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 32
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn builtin_maps_resolve_without_store() {
        let store = MapStore::new(None).unwrap();
        let map = assert_ok!(store.get("test").await);
        assert_eq!((map.width(), map.height()), (8, 8));
        let again = assert_ok!(store.get("test").await);
        assert!(Arc::ptr_eq(&map, &again));

        let err = assert_err!(store.get("missing").await);
        assert!(matches!(err, StoreError::MapNotFound(name) if name == "missing"));
        assert_eq!(store.names(), vec!["arena".to_string(), "test".to_string()]);
    }

    #[test]
    fn stored_rows_decode_editor_blobs() {
        let blob = open_arena().unwrap().to_storage().unwrap();
        let row = StoredMap {
            name: "copy".to_string(),
            data: STANDARD.encode(&blob),
        };
        let map = assert_ok!(row.decode());
        assert_eq!(map.width(), 32);
        assert!(map.test_block_at(8.5, 8.5));

        let bad = StoredMap {
            name: "bad".to_string(),
            data: "!!!".to_string(),
        };
        assert!(matches!(bad.decode(), Err(StoreError::Decode(_))));
    }

    #[test]
    fn map_names_are_restricted() {
        assert!(is_valid_map_name("dust_2-b"));
        assert!(!is_valid_map_name("a&b=c"));
        assert!(!is_valid_map_name(""));
    }
}
