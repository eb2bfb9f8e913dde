use serde::{Deserialize, Serialize};
use tracing::info;

use super::metrics::EpochStats;

pub const MAP_KEY: &str = "mAP";

/// Tracks the best evaluation result seen so far, ranked by mAP.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecorderHoi {
    pub best_epoch: Option<usize>,
    pub best_stats: EpochStats,
}

impl RecorderHoi {
    pub fn best_map(&self) -> Option<f64> {
        self.best_stats.get(MAP_KEY)
    }

    /// Returns true when `stats` is a new best.
    pub fn update(&mut self, epoch: usize, stats: &EpochStats) -> bool {
        let Some(map) = stats.get(MAP_KEY).filter(|map| map.is_finite()) else {
            return false;
        };
        if self.best_map().is_some_and(|best| best >= map) {
            return false;
        }
        self.best_epoch = Some(epoch);
        self.best_stats = stats.clone();
        true
    }

    pub fn print_best_metrics(&self) {
        match self.best_epoch {
            Some(epoch) => {
                info!("Best metrics at epoch {}:", epoch);
                for (key, value) in self.best_stats.iter() {
                    info!("  {}: {:.4}", key, value);
                }
            }
            None => info!("No evaluation result was recorded"),
        }
    }
}
