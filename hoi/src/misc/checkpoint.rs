use std::{fs, path::{Path, PathBuf}};

use burn::{module::AutodiffModule, record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder}, tensor::backend::AutodiffBackend};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{logs::EvalArtifacts, metrics::EpochStats, recorder::RecorderHoi};
use crate::{config::HoiConfig, distributed::{DistributedContext, ModelHandle}, error::{HoiError, Result}, optim::{HoiOptimizer, OptimizerRecord, ParamGroups}};

pub const CHECKPOINT_NAME: &str = "checkpoint";
pub const BEST_CHECKPOINT_NAME: &str = "checkpoint_best";

/// Optimizer moments and resumed weights must not lose precision.
pub type CheckpointRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub scheduler_iteration: i32,
    pub recorder: Option<RecorderHoi>,
}

/// One checkpoint on disk: `<base>.mpk` (model), `<base>_optim.mpk` and `<base>.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointPaths {
    base: PathBuf,
}

impl CheckpointPaths {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { base: path.as_ref().with_extension("") }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn model(&self) -> PathBuf {
        self.base.with_extension("mpk")
    }

    pub fn optimizer(&self) -> PathBuf {
        self.optimizer_base().with_extension("mpk")
    }

    pub fn meta(&self) -> PathBuf {
        self.base.with_extension("json")
    }

    fn optimizer_base(&self) -> PathBuf {
        let stem = self.base.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_default();
        self.base.with_file_name(format!("{stem}_optim"))
    }
}

pub fn save_checkpoint<B, M>(paths: &CheckpointPaths, model: &M, optimizer: &HoiOptimizer<B, M>, meta: &CheckpointMeta) -> Result<()>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    if let Some(parent) = paths.base.parent() {
        fs::create_dir_all(parent)?;
    }
    let recorder = CheckpointRecorder::new();
    model.clone().save_file(paths.base.clone(), &recorder)?;
    <CheckpointRecorder as Recorder<B>>::record(&recorder, optimizer.to_record(), paths.optimizer_base())?;
    fs::write(paths.meta(), serde_json::to_vec_pretty(meta)?)?;
    Ok(())
}

/// Updates the best-result recorder, then writes `checkpoint`, the periodic `checkpointNNNN`
/// every `lr_drop` (and every 100) epochs, and `checkpoint_best` on a new best mAP.
/// Returns the model files written; only the main process writes.
#[allow(clippy::too_many_arguments)]
pub fn save_checkpoints<B, M>(
    config: &HoiConfig,
    dist: &DistributedContext,
    output_dir: &Path,
    recorder: Option<&mut RecorderHoi>,
    epoch: usize,
    test_stats: &EpochStats,
    model: &M,
    optimizer: &HoiOptimizer<B, M>,
    hoi_evaluator: Option<&EvalArtifacts>,
) -> Result<Vec<PathBuf>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let (improved, snapshot) = match recorder {
        Some(recorder) => (recorder.update(epoch, test_stats), Some(recorder.clone())),
        None => (false, None),
    };

    if !dist.is_main_process() || output_dir.as_os_str().is_empty() {
        return Ok(Vec::new());
    }

    let mut targets = vec![output_dir.join(CHECKPOINT_NAME)];
    if (epoch + 1) % config.lr_drop == 0 || (epoch + 1) % 100 == 0 {
        targets.push(output_dir.join(format!("{CHECKPOINT_NAME}{epoch:04}")));
    }
    if improved {
        targets.push(output_dir.join(BEST_CHECKPOINT_NAME));
    }

    let meta = CheckpointMeta {
        epoch,
        scheduler_iteration: optimizer.scheduler_iteration(),
        recorder: snapshot,
    };
    let mut written = Vec::with_capacity(targets.len());
    for target in targets {
        let paths = CheckpointPaths::new(target);
        save_checkpoint(&paths, model, optimizer, &meta)?;
        written.push(paths.model());
    }

    if let Some(artifacts) = hoi_evaluator {
        artifacts.write(output_dir)?;
    }
    Ok(written)
}

fn load_module<B, M>(model: &mut ModelHandle<M>, paths: &CheckpointPaths, device: &B::Device) -> Result<()>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let file = paths.model();
    model.update(|module| {
        module
            .load_file(paths.base.clone(), &CheckpointRecorder::new(), device)
            .map_err(|err| HoiError::checkpoint(&file, err))
    })
}

/// Restores frozen weights, then the resume checkpoint (`--resume` or `<output_dir>/checkpoint`)
/// or, when there is none, the pretrained weights. Returns the epoch to start from.
///
/// A checkpoint that does not exist means a fresh start; one that exists but cannot be read is an error.
pub fn load_model_weights<B, M>(
    config: &HoiConfig,
    model: &mut ModelHandle<M>,
    optimizer: &mut HoiOptimizer<B, M>,
    recorder: Option<&mut RecorderHoi>,
    device: &B::Device,
) -> Result<usize>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let mut loaded_any = false;

    if let Some(frozen) = config.frozen_weights_path() {
        let paths = CheckpointPaths::new(frozen);
        if !paths.model().exists() {
            return Err(HoiError::checkpoint(paths.model(), "frozen weights not found"));
        }
        load_module(model, &paths, device)?;
        info!("Loaded frozen weights from {}", paths.model().display());
        loaded_any = true;
    }

    let (paths, explicit) = match config.resume_path() {
        Some(path) => (CheckpointPaths::new(path), true),
        None => (CheckpointPaths::new(config.output_dir.join(CHECKPOINT_NAME)), false),
    };

    let mut start_epoch = config.start_epoch;
    if paths.model().exists() {
        load_module(model, &paths, device)?;
        loaded_any = true;

        let optim_file = paths.optimizer();
        if optim_file.exists() {
            let record: OptimizerRecord<B, M> = <CheckpointRecorder as Recorder<B>>::load(&CheckpointRecorder::new(), paths.optimizer_base(), device)
                .map_err(|err| HoiError::checkpoint(&optim_file, err))?;
            optimizer.load_record(record);
        }

        let meta_file = paths.meta();
        if meta_file.exists() {
            let meta: CheckpointMeta = serde_json::from_slice(&fs::read(&meta_file)?)
                .map_err(|err| HoiError::checkpoint(&meta_file, err))?;
            optimizer.load_scheduler_iteration(meta.scheduler_iteration);
            if let (Some(recorder), Some(saved)) = (recorder, meta.recorder) {
                *recorder = saved;
            }
            start_epoch = meta.epoch + 1;
        }
        info!("Resumed from {} at epoch {}", paths.model().display(), start_epoch);
    } else {
        if explicit {
            warn!("Checkpoint {} not found, training from scratch", paths.model().display());
        }
        if config.frozen_weights_path().is_none() && !config.pretrained.is_empty() {
            let pretrained = CheckpointPaths::new(&config.pretrained);
            if pretrained.model().exists() {
                load_module(model, &pretrained, device)?;
                info!("Loaded pretrained weights from {}", pretrained.model().display());
                loaded_any = true;
            } else {
                warn!("Pretrained weights {} not found, using random initialisation", pretrained.model().display());
            }
        }
    }

    if loaded_any {
        optimizer.set_groups(ParamGroups::partition::<B, M>(model.raw()));
    }
    Ok(start_epoch)
}

#[cfg(test)]
mod tests {
    use burn::{backend::{Autodiff, NdArray}, module::Module, nn::{Linear, LinearConfig}, tensor::backend::Backend};

    use super::*;

    type TestBackend = Autodiff<NdArray<f32>>;

    #[derive(Module, Debug)]
    struct Tiny<B: Backend> {
        backbone: Linear<B>,
        head: Linear<B>,
    }

    fn tiny(device: &<TestBackend as Backend>::Device) -> Tiny<TestBackend> {
        Tiny {
            backbone: LinearConfig::new(2, 2).init(device),
            head: LinearConfig::new(2, 1).init(device),
        }
    }

    fn setup(output_dir: &Path) -> (HoiConfig, ModelHandle<Tiny<TestBackend>>, HoiOptimizer<TestBackend, Tiny<TestBackend>>) {
        let config = HoiConfig {
            output_dir: output_dir.to_path_buf(),
            pretrained: String::new(),
            lr_drop: 2,
            ..HoiConfig::controller_default()
        };
        let model = tiny(&Default::default());
        let optimizer = HoiOptimizer::new(&config, ParamGroups::partition::<TestBackend, _>(&model)).unwrap();
        (config, ModelHandle::local(model), optimizer)
    }

    #[test]
    fn paths_strip_foreign_extensions() {
        let paths = CheckpointPaths::new("/out/checkpoint.pth");
        assert_eq!(paths.model(), PathBuf::from("/out/checkpoint.mpk"));
        assert_eq!(paths.optimizer(), PathBuf::from("/out/checkpoint_optim.mpk"));
        assert_eq!(paths.meta(), PathBuf::from("/out/checkpoint.json"));
    }

    #[test]
    fn periodic_and_best_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let (config, model, optimizer) = setup(dir.path());
        let dist = DistributedContext::single_process("env://");
        let mut recorder = RecorderHoi::default();

        let stats = EpochStats::new().with("mAP", 0.2);
        let written = save_checkpoints(&config, &dist, dir.path(), Some(&mut recorder), 0, &stats, model.raw(), &optimizer, None).unwrap();
        assert_eq!(written, vec![dir.path().join("checkpoint.mpk"), dir.path().join("checkpoint_best.mpk")]);

        let worse = EpochStats::new().with("mAP", 0.1);
        let written = save_checkpoints(&config, &dist, dir.path(), Some(&mut recorder), 1, &worse, model.raw(), &optimizer, None).unwrap();
        assert_eq!(written, vec![dir.path().join("checkpoint.mpk"), dir.path().join("checkpoint0001.mpk")]);
        assert_eq!(recorder.best_epoch, Some(0));
        assert!(dir.path().join("checkpoint_optim.mpk").exists());
    }

    #[test]
    fn resume_restores_weights_epoch_and_recorder() {
        let dir = tempfile::tempdir().unwrap();
        let (config, model, mut optimizer) = setup(dir.path());
        let dist = DistributedContext::single_process("env://");
        let mut recorder = RecorderHoi::default();
        optimizer.scheduler_step();
        let stats = EpochStats::new().with("mAP", 0.5);
        save_checkpoints(&config, &dist, dir.path(), Some(&mut recorder), 3, &stats, model.raw(), &optimizer, None).unwrap();
        let saved_weights = model.raw().head.weight.val().into_data();

        let (_, mut fresh, mut fresh_optim) = setup(dir.path());
        let mut fresh_recorder = RecorderHoi::default();
        let start = load_model_weights(&config, &mut fresh, &mut fresh_optim, Some(&mut fresh_recorder), &Default::default()).unwrap();

        assert_eq!(start, 4);
        assert_eq!(fresh.raw().head.weight.val().into_data(), saved_weights);
        assert_eq!(fresh_optim.scheduler_iteration(), optimizer.scheduler_iteration());
        assert_eq!(fresh_recorder.best_map(), Some(0.5));
        assert_eq!(fresh_optim.groups(), &ParamGroups::partition::<TestBackend, _>(fresh.raw()));
    }

    #[test]
    fn missing_checkpoint_is_a_fresh_start() {
        let dir = tempfile::tempdir().unwrap();
        let (config, mut model, mut optimizer) = setup(dir.path());
        let config = HoiConfig { resume: Some(dir.path().join("nope.pth")), start_epoch: 2, ..config };
        let start = load_model_weights(&config, &mut model, &mut optimizer, None, &Default::default()).unwrap();
        assert_eq!(start, 2);
    }

    #[test]
    fn corrupt_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (config, mut model, mut optimizer) = setup(dir.path());
        fs::write(dir.path().join("checkpoint.mpk"), b"not a record").unwrap();
        let result = load_model_weights(&config, &mut model, &mut optimizer, None, &Default::default());
        assert!(matches!(result, Err(HoiError::Checkpoint { .. })));
    }

    #[test]
    fn missing_frozen_weights_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (config, mut model, mut optimizer) = setup(dir.path());
        let config = HoiConfig { frozen_weights: Some(dir.path().join("detr.mpk")), masks: true, ..config };
        let result = load_model_weights(&config, &mut model, &mut optimizer, None, &Default::default());
        assert!(matches!(result, Err(HoiError::Checkpoint { .. })));
    }
}
