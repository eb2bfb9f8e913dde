use std::sync::Arc;

use burn::{data::dataloader::DataLoader, tensor::backend::{AutodiffBackend, Backend}};
use tracing::{error, info};

use crate::{data::HoiBatch, distributed::{ModelHandle, ResultGatherer}, error::{HoiError, Result}, evaluator::HicoEvaluator, misc::{EpochStats, MetricLogger}, model::{criterion::SetCriterionHoi, postprocess::PostProcessHoi, DetrHoi}, optim::HoiOptimizer};

const PRINT_FREQ: usize = 10;

pub fn train_one_epoch<B: AutodiffBackend>(
    model: &mut ModelHandle<DetrHoi<B>>,
    criterion: &mut SetCriterionHoi,
    data_loader: Arc<dyn DataLoader<B, HoiBatch<B>>>,
    optimizer: &mut HoiOptimizer<B, DetrHoi<B>>,
    epoch: usize,
    clip_max_norm: f64,
) -> Result<EpochStats> {
    let mut logger = MetricLogger::default();
    let num_batches = data_loader.num_items();

    for (iteration, batch) in data_loader.iter().enumerate() {
        let batch_size = batch.targets.len();
        if batch_size == 0 {
            continue;
        }

        let outputs = model.distributed().forward(batch.images);
        let out = criterion.forward(&outputs, &batch.targets);
        let loss_value = out.stats.get("loss").unwrap_or(f64::NAN);
        if !loss_value.is_finite() {
            error!(epoch, "Loss is {}, stopping training: {}", loss_value, serde_json::to_string(&out.stats)?);
            return Err(HoiError::NonFiniteLoss { epoch, value: loss_value });
        }

        let grads = out.loss.backward();
        let grad_norm = optimizer.step(model, grads, clip_max_norm)?;

        for (key, value) in out.stats.iter() {
            logger.update(key, value, batch_size);
        }
        logger.update("lr", optimizer.learning_rates().0, 1);
        if let Some(grad_norm) = grad_norm {
            logger.update("grad_norm", grad_norm, 1);
        }

        if iteration % PRINT_FREQ == 0 {
            info!(epoch, "[{}/{}] loss: {:.4} (avg {:.4})", iteration, num_batches, loss_value, logger.global_avg("loss").unwrap_or(loss_value));
        }
    }

    let stats = logger.summary();
    info!(epoch, "Averaged stats: {}", serde_json::to_string(&stats)?);
    Ok(stats)
}

/// Runs the model over `data_loader` and scores the post-processed triplets.
/// With a gatherer, results of every rank are merged before scoring.
pub fn evaluate_hoi<B: Backend>(
    model: &DetrHoi<B>,
    postprocessors: &PostProcessHoi,
    data_loader: Arc<dyn DataLoader<B, HoiBatch<B>>>,
    mut evaluator: HicoEvaluator,
    gatherer: Option<&dyn ResultGatherer>,
) -> Result<EpochStats> {
    let num_batches = data_loader.num_items();
    for (iteration, batch) in data_loader.iter().enumerate() {
        if batch.targets.is_empty() {
            continue;
        }
        let outputs = model.forward(batch.images);
        let orig_sizes: Vec<[usize; 2]> = batch.targets.iter().map(|target| target.orig_size).collect();
        let detections = postprocessors.forward(&outputs.main, &orig_sizes);
        for (dets, target) in detections.iter().zip(&batch.targets) {
            evaluator.add(dets, target);
        }
        if iteration % PRINT_FREQ == 0 {
            info!("Test: [{}/{}]", iteration, num_batches);
        }
    }
    if let Some(gatherer) = gatherer {
        evaluator.synchronize(gatherer)?;
        info!("Gathered {} images from all ranks", evaluator.num_images());
    }
    Ok(evaluator.evaluate())
}
