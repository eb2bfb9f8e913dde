pub mod config;
pub mod controller;
pub mod data;
pub mod detr_hoi;
pub mod distributed;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod misc;
pub mod model;
pub mod optim;
pub mod toolkit;

pub use config::HoiConfig;
pub use controller::{RunMode, RunOutcome, TrainSummary, VisualRelation};
pub use detr_hoi::DetrHoiToolkit;
pub use error::{HoiError, Result};
pub use toolkit::{HoiToolkit, ImageSet};
