use std::{ops::Deref, sync::Arc};

use burn::optim::GradientsParams;
use tracing::info;

use crate::{config::HoiConfig, error::{HoiError, Result}};

/// Cross-process gradient synchronisation, provided by whoever launches the replicas.
pub trait GradientReducer: Send + Sync {
    fn all_reduce(&self, grads: GradientsParams) -> Result<GradientsParams>;
}

/// Collects one serialized payload from every rank, in rank order, on every rank.
pub trait ResultGatherer: Send + Sync {
    fn all_gather(&self, payload: Vec<u8>) -> Result<Vec<Vec<u8>>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributedContext {
    pub enabled: bool,
    pub rank: usize,
    pub world_size: usize,
    pub gpu: usize,
    pub dist_url: String,
}

impl DistributedContext {
    pub fn single_process(dist_url: &str) -> Self {
        Self {
            enabled: false,
            rank: 0,
            world_size: 1,
            gpu: 0,
            dist_url: dist_url.to_string(),
        }
    }

    pub fn get_rank(&self) -> usize {
        self.rank
    }

    pub fn get_world_size(&self) -> usize {
        self.world_size
    }

    pub fn is_main_process(&self) -> bool {
        self.rank == 0
    }
}

/// Reads the launcher environment (`RANK`/`WORLD_SIZE`/`LOCAL_RANK` or `SLURM_PROCID`).
pub fn init_distributed_mode(config: &HoiConfig, use_distributed: bool) -> Result<DistributedContext> {
    init_distributed_mode_with(config, use_distributed, |key| std::env::var(key).ok())
}

pub fn init_distributed_mode_with<F>(config: &HoiConfig, use_distributed: bool, lookup: F) -> Result<DistributedContext>
where
    F: Fn(&str) -> Option<String>,
{
    if !use_distributed {
        return Ok(DistributedContext::single_process(&config.dist_url));
    }

    let parse = |key: &str, value: String| -> Result<usize> {
        value
            .trim()
            .parse::<usize>()
            .map_err(|err| HoiError::Distributed(format!("{key}={value}: {err}")))
    };

    let (rank, world_size, gpu) = match (lookup("RANK"), lookup("WORLD_SIZE"), lookup("SLURM_PROCID")) {
        (Some(rank), Some(world_size), _) => {
            let gpu = match lookup("LOCAL_RANK") {
                Some(local_rank) => parse("LOCAL_RANK", local_rank)?,
                None => 0,
            };
            (parse("RANK", rank)?, parse("WORLD_SIZE", world_size)?, gpu)
        }
        (_, _, Some(procid)) => {
            let rank = parse("SLURM_PROCID", procid)?;
            let devices = lookup("CUDA_VISIBLE_DEVICES")
                .map(|list| list.split(',').filter(|id| !id.trim().is_empty()).count())
                .filter(|count| *count > 0)
                .unwrap_or(1);
            (rank, config.world_size, rank % devices)
        }
        _ => {
            info!("Not using distributed mode");
            return Ok(DistributedContext::single_process(&config.dist_url));
        }
    };

    if world_size == 0 || rank >= world_size {
        return Err(HoiError::Distributed(format!("rank {rank} is outside world size {world_size}")));
    }

    info!("| distributed init (rank {}): {}", rank, config.dist_url);
    Ok(DistributedContext {
        enabled: true,
        rank,
        world_size,
        gpu,
        dist_url: config.dist_url.clone(),
    })
}

pub struct DataParallel {
    pub device_ids: Vec<usize>,
    pub find_unused_parameters: bool,
    reducer: Arc<dyn GradientReducer>,
}

impl DataParallel {
    pub fn new(device_ids: Vec<usize>, find_unused_parameters: bool, reducer: Arc<dyn GradientReducer>) -> Self {
        Self { device_ids, find_unused_parameters, reducer }
    }
}

/// Owns the model once. `raw` is the parameter/checkpoint view, `distributed` the training view.
pub struct ModelHandle<M> {
    module: M,
    replica: Option<DataParallel>,
}

impl<M> ModelHandle<M> {
    pub fn local(module: M) -> Self {
        Self { module, replica: None }
    }

    pub fn data_parallel(module: M, replica: DataParallel) -> Self {
        Self { module, replica: Some(replica) }
    }

    pub fn raw(&self) -> &M {
        &self.module
    }

    pub fn distributed(&self) -> DistributedView<'_, M> {
        DistributedView {
            module: &self.module,
            replica: self.replica.as_ref(),
        }
    }

    pub fn is_distributed(&self) -> bool {
        self.replica.is_some()
    }

    pub fn replica(&self) -> Option<&DataParallel> {
        self.replica.as_ref()
    }

    pub fn into_raw(self) -> M {
        self.module
    }
}

impl<M: Clone> ModelHandle<M> {
    /// Replaces the module with `f(module)`, e.g. after an optimizer step.
    pub fn update<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(M) -> Result<M>,
    {
        self.module = f(self.module.clone())?;
        Ok(())
    }
}

pub struct DistributedView<'a, M> {
    module: &'a M,
    replica: Option<&'a DataParallel>,
}

impl<'a, M> DistributedView<'a, M> {
    pub fn module(&self) -> &'a M {
        self.module
    }

    /// Averages gradients across replicas; identity for a local model.
    pub fn reduce(&self, grads: GradientsParams) -> Result<GradientsParams> {
        match self.replica {
            Some(replica) if !grads.is_empty() => replica.reducer.all_reduce(grads),
            _ => Ok(grads),
        }
    }
}

impl<M> Deref for DistributedView<'_, M> {
    type Target = M;

    fn deref(&self) -> &Self::Target {
        self.module
    }
}
