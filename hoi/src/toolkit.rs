use std::{fmt::Debug, sync::Arc};

use burn::{data::{dataloader::{batcher::Batcher, DataLoader}, dataset::Dataset}, module::AutodiffModule, tensor::backend::AutodiffBackend};

use crate::{config::{DatasetFile, HoiConfig}, distributed::{DistributedContext, GradientReducer, ModelHandle}, error::Result, misc::EpochStats, optim::HoiOptimizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSet {
    Train,
    Val,
}

impl ImageSet {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageSet::Train => "train",
            ImageSet::Val => "val",
        }
    }
}

/// The model, data and engine pieces the controller drives.
pub trait HoiToolkit<B: AutodiffBackend> {
    type Model: AutodiffModule<B>;
    type Criterion;
    type Postprocessors;
    type Item: Send + Sync + Clone + Debug + 'static;
    type TrainBatch: Send + Clone + Debug + 'static;
    type ValidBatch: Send + Clone + Debug + 'static;
    type TrainBatcher: Batcher<B, Self::Item, Self::TrainBatch> + 'static;
    type ValidBatcher: Batcher<B::InnerBackend, Self::Item, Self::ValidBatch> + 'static;

    fn build_model(&self, config: &HoiConfig, device: &B::Device) -> Result<(Self::Model, Self::Criterion, Self::Postprocessors)>;

    fn build_dataset(&self, image_set: ImageSet, config: &HoiConfig) -> Result<Arc<dyn Dataset<Self::Item>>>;

    fn train_batcher(&self, config: &HoiConfig) -> Self::TrainBatcher;

    fn valid_batcher(&self, config: &HoiConfig) -> Self::ValidBatcher;

    #[allow(clippy::too_many_arguments)]
    fn train_one_epoch(
        &self,
        model: &mut ModelHandle<Self::Model>,
        criterion: &mut Self::Criterion,
        data_loader: Arc<dyn DataLoader<B, Self::TrainBatch>>,
        optimizer: &mut HoiOptimizer<B, Self::Model>,
        device: &B::Device,
        epoch: usize,
        clip_max_norm: f64,
    ) -> Result<EpochStats>;

    fn evaluate_hoi(
        &self,
        dataset_file: DatasetFile,
        model: &<Self::Model as AutodiffModule<B>>::InnerModule,
        postprocessors: &Self::Postprocessors,
        data_loader: Arc<dyn DataLoader<B::InnerBackend, Self::ValidBatch>>,
        subject_category_id: usize,
        device: &B::Device,
    ) -> Result<EpochStats>;

    /// Gradient all-reduce for multi-process runs. `None` means the toolkit cannot train distributed.
    fn gradient_reducer(&self, _dist: &DistributedContext) -> Option<Arc<dyn GradientReducer>> {
        None
    }
}
