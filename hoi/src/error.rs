use burn::record::RecorderError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HoiError {
    /// Unknown option, wrong value type or a value outside the allowed choices.
    #[error("usage error: {0}")]
    Usage(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("precondition violated: {0}")]
    Precondition(String),
    #[error("checkpoint {path}: {reason}")]
    Checkpoint { path: String, reason: String },
    #[error("unimplemented mode: {0}")]
    Unimplemented(String),
    #[error("distributed setup failed: {0}")]
    Distributed(String),
    #[error("loss is {value}, stopping training at epoch {epoch}")]
    NonFiniteLoss { epoch: usize, value: f64 },
    #[error("dataset error: {0}")]
    Dataset(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error("recorder error: {0}")]
    Recorder(#[from] RecorderError),
}

impl HoiError {
    pub fn checkpoint(path: impl AsRef<std::path::Path>, reason: impl ToString) -> Self {
        HoiError::Checkpoint {
            path: path.as_ref().display().to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = HoiError> = std::result::Result<T, E>;
