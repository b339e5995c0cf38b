//! Fire-and-forget player stats persistence

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::RestClient;

/// Result of one player's match
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsUpdate {
    pub username: String,
    pub kills: u32,
    pub died: bool,
}

#[derive(Debug, Serialize)]
struct StatsRow<'a> {
    username: &'a str,
    kills: u32,
    died: bool,
    recorded_at: DateTime<Utc>,
}

/// Cloneable handle the match tasks record stats through
#[derive(Debug, Clone)]
pub struct StatsRecorder {
    tx: mpsc::UnboundedSender<StatsUpdate>,
}

impl StatsRecorder {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatsUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a stats update; never blocks
    pub fn record(&self, username: &str, kills: u32, died: bool) {
        let update = StatsUpdate {
            username: username.to_string(),
            kills,
            died,
        };
        if self.tx.send(update).is_err() {
            warn!(username, kills, died, "Stats writer stopped, update lost");
        }
    }
}

/// Drain recorded stats into the store until every recorder is dropped
pub async fn run_stats_writer(
    mut rx: mpsc::UnboundedReceiver<StatsUpdate>,
    client: Option<RestClient>,
) {
    while let Some(update) = rx.recv().await {
        let Some(client) = &client else {
            info!(
                username = %update.username,
                kills = update.kills,
                died = update.died,
                "Player stats (no store configured)"
            );
            continue;
        };

        let row = StatsRow {
            username: &update.username,
            kills: update.kills,
            died: update.died,
            recorded_at: Utc::now(),
        };
        match client.rpc("update_user_stats", &row).await {
            Ok(()) => debug!(username = %update.username, "Saved player stats"),
            Err(e) => warn!(username = %update.username, error = %e, "Failed to save player stats"),
        }
    }
    debug!("Stats writer finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recorder_enqueues_updates() {
        let (recorder, mut rx) = StatsRecorder::channel();
        recorder.clone().record("alice", 3, true);
        assert_eq!(
            rx.recv().await,
            Some(StatsUpdate {
                username: "alice".to_string(),
                kills: 3,
                died: true,
            })
        );
    }

    #[tokio::test]
    async fn writer_without_store_drains_and_exits() {
        let (recorder, rx) = StatsRecorder::channel();
        recorder.record("bob", 0, false);
        drop(recorder);
        tokio::time::timeout(std::time::Duration::from_secs(1), run_stats_writer(rx, None))
            .await
            .unwrap();
    }
}
