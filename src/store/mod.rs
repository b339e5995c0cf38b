//! Persistence collaborators: REST client, stats writer and map lookup

pub mod maps;
pub mod rest;
pub mod stats;

pub use maps::MapStore;
pub use rest::RestClient;
pub use stats::{run_stats_writer, StatsRecorder};

use crate::game::map::MapError;

/// Store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("API error (status {status}): {body}")]
    Api { status: u16, body: String },

    #[error("Failed to parse response: {0}")]
    Parse(reqwest::Error),

    #[error("Invalid map encoding: {0}")]
    Decode(#[from] base64::DecodeError),

    #[error("Invalid map: {0}")]
    Map(#[from] MapError),

    #[error("Map '{0}' does not exist")]
    MapNotFound(String),
}
