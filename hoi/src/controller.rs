use std::{fs, str::FromStr, sync::Arc, time::{Duration, Instant}};

use burn::{config::Config, data::{dataloader::DataLoader, dataset::Dataset}, module::{AutodiffModule, Module}, tensor::backend::AutodiffBackend};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{config::HoiConfig, distributed::{init_distributed_mode, DataParallel, DistributedContext, ModelHandle}, error::{HoiError, Result}, misc::{load_model_weights, sampler::{build_loader, DistributedSampler, LoaderOptions, RandomSampler, Sampler, SequentialSampler}, save_checkpoints, save_logs, EpochStats, RecorderHoi}, optim::{count_trainable, HoiOptimizer, ParamGroups}, toolkit::{HoiToolkit, ImageSet}};

pub const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum RunMode {
    Train,
    Eval,
    /// Single-image inference, reserved.
    Single,
}

impl FromStr for RunMode {
    type Err = HoiError;

    fn from_str(mode: &str) -> Result<Self> {
        <Self as ValueEnum>::from_str(mode, false).map_err(|_| HoiError::Usage(format!("unknown run mode `{mode}`")))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub epochs_run: usize,
    pub total_time: Duration,
    pub last_train_stats: Option<EpochStats>,
    pub last_test_stats: Option<EpochStats>,
    pub best: Option<RecorderHoi>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Trained(TrainSummary),
    Evaluated(EpochStats),
}

/// Formats as `H:MM:SS`.
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, secs / 60 % 60, secs % 60)
}

/// Owns the model, criterion, optimizer and recorder of one HOI run and drives its epoch loop.
pub struct VisualRelation<B: AutodiffBackend, T: HoiToolkit<B>> {
    name: String,
    config: HoiConfig,
    dist: DistributedContext,
    toolkit: T,
    device: B::Device,
    seed: u64,
    model: ModelHandle<T::Model>,
    criterion: T::Criterion,
    postprocessors: T::Postprocessors,
    optimizer: HoiOptimizer<B, T::Model>,
    recorder: Option<RecorderHoi>,
    n_parameters: usize,
    start_epoch: usize,
}

impl<B: AutodiffBackend, T: HoiToolkit<B>> VisualRelation<B, T> {
    pub fn new(name: impl Into<String>, use_distributed: bool, config: HoiConfig, toolkit: T, device: B::Device) -> Result<Self> {
        let name = name.into();
        config.validate()?;
        let dist = init_distributed_mode(&config, use_distributed)?;
        info!(name = %name, "{}", serde_json::to_string(&config)?);

        if config.frozen_weights_path().is_some() && !config.masks {
            return Err(HoiError::Precondition("Frozen training is meant for segmentation only".to_string()));
        }

        let seed = config.seed + dist.get_rank() as u64;
        B::seed(&device, seed);

        let (model, criterion, postprocessors) = toolkit.build_model(&config, &device)?;
        let model = model.fork(&device);
        let mut model = if dist.enabled {
            let reducer = toolkit.gradient_reducer(&dist).ok_or_else(|| {
                HoiError::Distributed(format!("rank {} has no gradient reducer for multi-process training", dist.rank))
            })?;
            ModelHandle::data_parallel(model, DataParallel::new(vec![dist.gpu], true, reducer))
        } else {
            ModelHandle::local(model)
        };

        let n_parameters = count_trainable::<B, T::Model>(model.raw());
        let groups = ParamGroups::partition::<B, T::Model>(model.raw());
        info!("number of params: {}", n_parameters);

        let mut optimizer = HoiOptimizer::new(&config, groups)?;
        let mut recorder = config.hoi.then(RecorderHoi::default);
        let start_epoch = load_model_weights(&config, &mut model, &mut optimizer, recorder.as_mut(), &device)?;

        Ok(Self {
            name,
            config,
            dist,
            toolkit,
            device,
            seed,
            model,
            criterion,
            postprocessors,
            optimizer,
            recorder,
            n_parameters,
            start_epoch,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &HoiConfig {
        &self.config
    }

    pub fn dist(&self) -> &DistributedContext {
        &self.dist
    }

    /// The seed actually applied: `config.seed + rank`.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn model(&self) -> &ModelHandle<T::Model> {
        &self.model
    }

    pub fn param_groups(&self) -> &ParamGroups {
        self.optimizer.groups()
    }

    pub fn optimizer(&self) -> &HoiOptimizer<B, T::Model> {
        &self.optimizer
    }

    pub fn recorder(&self) -> Option<&RecorderHoi> {
        self.recorder.as_ref()
    }

    pub fn n_parameters(&self) -> usize {
        self.n_parameters
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn run(&mut self, mode: RunMode) -> Result<RunOutcome> {
        match mode {
            RunMode::Train => self.train().map(RunOutcome::Trained),
            RunMode::Eval => self.evaluate().map(RunOutcome::Evaluated),
            RunMode::Single => Err(HoiError::Unimplemented("single".to_string())),
        }
    }

    pub fn train(&mut self) -> Result<TrainSummary> {
        if self.dist.is_main_process() {
            fs::create_dir_all(&self.config.output_dir)?;
            self.config.save(self.config.output_dir.join(CONFIG_FILE))?;
        }

        let dataset_train = self.toolkit.build_dataset(ImageSet::Train, &self.config)?;
        let dataset_val = self.toolkit.build_dataset(ImageSet::Val, &self.config)?;

        let mut sampler_train: Box<dyn Sampler> = if self.dist.enabled {
            Box::new(DistributedSampler::new(dataset_train.len(), &self.dist, true, self.config.seed))
        } else {
            Box::new(RandomSampler::new(dataset_train.len(), self.seed))
        };
        let data_loader_val = self.valid_loader(dataset_val);

        info!("Start training");
        let start_time = Instant::now();
        let mut summary = TrainSummary {
            epochs_run: 0,
            total_time: Duration::ZERO,
            last_train_stats: None,
            last_test_stats: None,
            best: None,
        };

        for epoch in self.start_epoch..self.config.epochs {
            sampler_train.set_epoch(epoch);
            let data_loader_train = build_loader::<B, _, _, _>(
                self.toolkit.train_batcher(&self.config),
                dataset_train.clone(),
                sampler_train.as_ref(),
                LoaderOptions {
                    batch_size: self.config.batch_size,
                    drop_last: true,
                    num_workers: self.config.num_workers,
                    device: &self.device,
                },
            );

            let train_stats = self.toolkit.train_one_epoch(
                &mut self.model,
                &mut self.criterion,
                data_loader_train,
                &mut self.optimizer,
                &self.device,
                epoch,
                self.config.clip_max_norm,
            )?;
            self.optimizer.scheduler_step();
            debug!(epoch, lr = self.optimizer.learning_rates().0, "lr scheduler stepped");

            let test_stats = self.evaluate_with(data_loader_val.clone())?;

            save_checkpoints(
                &self.config,
                &self.dist,
                &self.config.output_dir,
                self.recorder.as_mut(),
                epoch,
                &test_stats,
                self.model.raw(),
                &self.optimizer,
                None,
            )?;
            save_logs(&self.dist, &train_stats, &test_stats, epoch, self.n_parameters, &self.config.output_dir, None)?;
            info!(epoch, "train: {}", serde_json::to_string(&train_stats)?);
            info!(epoch, "test: {}", serde_json::to_string(&test_stats)?);

            self.start_epoch = epoch + 1;
            summary.epochs_run += 1;
            summary.last_train_stats = Some(train_stats);
            summary.last_test_stats = Some(test_stats);
        }

        summary.total_time = start_time.elapsed();
        info!("Training time {}", format_duration(summary.total_time));
        if let Some(recorder) = &self.recorder {
            recorder.print_best_metrics();
        }
        summary.best = self.recorder.clone();
        Ok(summary)
    }

    /// One pass over the validation split. Leaves model, optimizer and scheduler untouched.
    pub fn evaluate(&self) -> Result<EpochStats> {
        let dataset_val = self.toolkit.build_dataset(ImageSet::Val, &self.config)?;
        let test_stats = self.evaluate_with(self.valid_loader(dataset_val))?;
        info!("test: {}", serde_json::to_string(&test_stats)?);
        Ok(test_stats)
    }

    fn valid_loader(&self, dataset_val: Arc<dyn Dataset<T::Item>>) -> Arc<dyn DataLoader<B::InnerBackend, T::ValidBatch>> {
        let sampler_val: Box<dyn Sampler> = if self.dist.enabled {
            Box::new(DistributedSampler::new(dataset_val.len(), &self.dist, false, self.config.seed))
        } else {
            Box::new(SequentialSampler::new(dataset_val.len()))
        };
        build_loader::<B::InnerBackend, _, _, _>(
            self.toolkit.valid_batcher(&self.config),
            dataset_val,
            sampler_val.as_ref(),
            LoaderOptions {
                batch_size: self.config.batch_size,
                drop_last: false,
                num_workers: self.config.num_workers,
                device: &self.device,
            },
        )
    }

    fn evaluate_with(&self, data_loader_val: Arc<dyn DataLoader<B::InnerBackend, T::ValidBatch>>) -> Result<EpochStats> {
        let model = self.model.raw().valid();
        self.toolkit.evaluate_hoi(
            self.config.dataset_file,
            &model,
            &self.postprocessors,
            data_loader_val,
            self.config.subject_category_id,
            &self.device,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_mode_parses_closed_set() {
        assert_eq!("train".parse::<RunMode>().unwrap(), RunMode::Train);
        assert_eq!("eval".parse::<RunMode>().unwrap(), RunMode::Eval);
        assert_eq!("single".parse::<RunMode>().unwrap(), RunMode::Single);
        assert!(matches!("predict".parse::<RunMode>(), Err(HoiError::Usage(_))));
    }

    #[test]
    fn duration_is_hours_minutes_seconds() {
        assert_eq!(format_duration(Duration::from_secs(0)), "0:00:00");
        assert_eq!(format_duration(Duration::from_secs(3 * 3600 + 7 * 60 + 9)), "3:07:09");
        assert_eq!(format_duration(Duration::from_secs(26 * 3600)), "26:00:00");
    }
}
