use std::{collections::HashMap, fmt, sync::{Arc, OnceLock}};

use burn::{data::{dataloader::DataLoader, dataset::Dataset}, tensor::backend::AutodiffBackend};
use tracing::{info, warn};

use crate::{config::{DatasetFile, HoiConfig}, data::{HoiBatch, HoiBatcher, HoiDataset, HoiSample}, distributed::{DistributedContext, GradientReducer, ModelHandle, ResultGatherer}, engine, error::Result, evaluator::{HicoEvaluator, TripletCategory}, misc::EpochStats, model::{criterion::SetCriterionHoi, postprocess::PostProcessHoi, DetrHoi, DetrHoiConfig}, optim::HoiOptimizer, toolkit::{HoiToolkit, ImageSet}};

pub const DEFAULT_IMAGE_SIZE: usize = 512;

/// Detection-transformer HOI model on HICO-DET / V-COCO annotations.
pub struct DetrHoiToolkit {
    image_size: usize,
    train_counts: OnceLock<HashMap<TripletCategory, usize>>,
    collectives: Option<(Arc<dyn GradientReducer>, Arc<dyn ResultGatherer>)>,
}

impl fmt::Debug for DetrHoiToolkit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DetrHoiToolkit")
            .field("image_size", &self.image_size)
            .field("distributed", &self.collectives.is_some())
            .finish()
    }
}

impl Default for DetrHoiToolkit {
    fn default() -> Self {
        Self::new(DEFAULT_IMAGE_SIZE)
    }
}

impl DetrHoiToolkit {
    /// Images are resized to `image_size x image_size`.
    pub fn new(image_size: usize) -> Self {
        Self {
            image_size,
            train_counts: OnceLock::new(),
            collectives: None,
        }
    }

    /// Enables multi-process runs: gradients go through `reducer`, evaluation results
    /// are merged across ranks through `gatherer`.
    pub fn with_collectives(mut self, reducer: Arc<dyn GradientReducer>, gatherer: Arc<dyn ResultGatherer>) -> Self {
        self.collectives = Some((reducer, gatherer));
        self
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    fn cache_train_counts(&self, load: impl FnOnce() -> Result<HashMap<TripletCategory, usize>>) {
        if self.train_counts.get().is_some() {
            return;
        }
        match load() {
            Ok(counts) => {
                let _ = self.train_counts.set(counts);
            }
            Err(err) => warn!("training annotations unavailable, no triplet is treated as rare: {err}"),
        }
    }

    fn batcher(&self, config: &HoiConfig) -> HoiBatcher {
        HoiBatcher {
            image_size: self.image_size,
            num_obj_classes: config.num_obj_classes,
            num_verb_classes: config.num_verb_classes,
        }
    }
}

impl<B: AutodiffBackend> HoiToolkit<B> for DetrHoiToolkit {
    type Model = DetrHoi<B>;
    type Criterion = SetCriterionHoi;
    type Postprocessors = PostProcessHoi;
    type Item = HoiSample;
    type TrainBatch = HoiBatch<B>;
    type ValidBatch = HoiBatch<B::InnerBackend>;
    type TrainBatcher = HoiBatcher;
    type ValidBatcher = HoiBatcher;

    fn build_model(&self, config: &HoiConfig, device: &B::Device) -> Result<(Self::Model, Self::Criterion, Self::Postprocessors)> {
        let model = DetrHoiConfig::from_hoi(config, self.image_size)?.init::<B>(device)?;
        Ok((model, SetCriterionHoi::from_config(config), PostProcessHoi::from_config(config)))
    }

    fn build_dataset(&self, image_set: ImageSet, config: &HoiConfig) -> Result<Arc<dyn Dataset<Self::Item>>> {
        let load = |image_set| {
            HoiDataset::load(&config.hoi_path, config.dataset_file, image_set, config.num_queries, config.num_verb_classes)
        };
        let dataset = load(image_set)?;
        match image_set {
            ImageSet::Train => self.cache_train_counts(|| Ok(dataset.triplet_counts())),
            ImageSet::Val => self.cache_train_counts(|| Ok(load(ImageSet::Train)?.triplet_counts())),
        }
        Ok(Arc::new(dataset))
    }

    fn train_batcher(&self, config: &HoiConfig) -> Self::TrainBatcher {
        self.batcher(config)
    }

    fn valid_batcher(&self, config: &HoiConfig) -> Self::ValidBatcher {
        self.batcher(config)
    }

    fn train_one_epoch(
        &self,
        model: &mut ModelHandle<Self::Model>,
        criterion: &mut Self::Criterion,
        data_loader: Arc<dyn DataLoader<B, Self::TrainBatch>>,
        optimizer: &mut HoiOptimizer<B, Self::Model>,
        _device: &B::Device,
        epoch: usize,
        clip_max_norm: f64,
    ) -> Result<EpochStats> {
        engine::train_one_epoch(model, criterion, data_loader, optimizer, epoch, clip_max_norm)
    }

    fn evaluate_hoi(
        &self,
        dataset_file: DatasetFile,
        model: &DetrHoi<B::InnerBackend>,
        postprocessors: &Self::Postprocessors,
        data_loader: Arc<dyn DataLoader<B::InnerBackend, Self::ValidBatch>>,
        subject_category_id: usize,
        _device: &B::Device,
    ) -> Result<EpochStats> {
        info!("Evaluating {} interactions", dataset_file.as_str());
        let postprocessors = PostProcessHoi { subject_category_id, ..postprocessors.clone() };
        let evaluator = self.train_counts.get().map(HicoEvaluator::new).unwrap_or_default();
        let gatherer = self.collectives.as_ref().map(|(_, gatherer)| &**gatherer);
        engine::evaluate_hoi(model, &postprocessors, data_loader, evaluator, gatherer)
    }

    fn gradient_reducer(&self, _dist: &DistributedContext) -> Option<Arc<dyn GradientReducer>> {
        self.collectives.as_ref().map(|(reducer, _)| reducer.clone())
    }
}

#[cfg(test)]
mod tests {
    use burn::backend::{Autodiff, NdArray};

    use super::*;

    type TestBackend = Autodiff<NdArray<f32>>;

    #[test]
    fn missing_annotations_are_dataset_errors() {
        let dir = tempfile::tempdir().unwrap();
        let config = HoiConfig { hoi_path: dir.path().to_path_buf(), ..HoiConfig::controller_default() };
        let toolkit = DetrHoiToolkit::new(32);
        let result = <DetrHoiToolkit as HoiToolkit<TestBackend>>::build_dataset(&toolkit, ImageSet::Val, &config);
        assert!(matches!(result, Err(crate::error::HoiError::Dataset(_))));
    }

    #[test]
    fn batchers_share_image_size() {
        let toolkit = DetrHoiToolkit::new(64);
        let config = HoiConfig::controller_default();
        let batcher = <DetrHoiToolkit as HoiToolkit<TestBackend>>::valid_batcher(&toolkit, &config);
        assert_eq!(batcher.image_size, 64);
        assert_eq!(batcher.num_verb_classes, 117);
    }

    struct Loopback;

    impl GradientReducer for Loopback {
        fn all_reduce(&self, grads: burn::optim::GradientsParams) -> Result<burn::optim::GradientsParams> {
            Ok(grads)
        }
    }

    impl ResultGatherer for Loopback {
        fn all_gather(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>> {
            Ok(vec![payload])
        }
    }

    #[test]
    fn collectives_enable_the_gradient_reducer() {
        let dist = DistributedContext::single_process("env://");
        let local = DetrHoiToolkit::new(32);
        assert!(<DetrHoiToolkit as HoiToolkit<TestBackend>>::gradient_reducer(&local, &dist).is_none());

        let shared = Arc::new(Loopback);
        let distributed = DetrHoiToolkit::new(32).with_collectives(shared.clone(), shared);
        assert!(<DetrHoiToolkit as HoiToolkit<TestBackend>>::gradient_reducer(&distributed, &dist).is_some());
        assert!(format!("{distributed:?}").contains("distributed: true"));
    }
}
