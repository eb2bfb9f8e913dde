pub mod checkpoint;
pub mod logs;
pub mod metrics;
pub mod recorder;
pub mod sampler;

pub use checkpoint::{load_model_weights, save_checkpoints, CheckpointPaths, CHECKPOINT_NAME};
pub use logs::{save_logs, EvalArtifacts};
pub use metrics::{EpochStats, MetricLogger};
pub use recorder::RecorderHoi;
