use std::{fmt::Debug, sync::Arc};

use burn::{data::{dataloader::{batcher::Batcher, DataLoader, DataLoaderBuilder}, dataset::Dataset}, tensor::backend::Backend};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::distributed::DistributedContext;

/// Produces the visiting order of dataset indices for one epoch.
pub trait Sampler: Send + Sync {
    fn indices(&self) -> Vec<usize>;

    fn set_epoch(&mut self, _epoch: usize) {}
}

#[derive(Debug, Clone)]
pub struct SequentialSampler {
    len: usize,
}

impl SequentialSampler {
    pub fn new(len: usize) -> Self {
        Self { len }
    }
}

impl Sampler for SequentialSampler {
    fn indices(&self) -> Vec<usize> {
        (0..self.len).collect()
    }
}

/// Seeded permutation, reshuffled for every epoch.
#[derive(Debug, Clone)]
pub struct RandomSampler {
    len: usize,
    seed: u64,
    epoch: usize,
}

impl RandomSampler {
    pub fn new(len: usize, seed: u64) -> Self {
        Self { len, seed, epoch: 0 }
    }
}

impl Sampler for RandomSampler {
    fn indices(&self) -> Vec<usize> {
        shuffled(self.len, self.seed.wrapping_add(self.epoch as u64))
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }
}

/// Restricts each replica to an equal share of the dataset. The index list is padded
/// by wrapping around so every rank sees `ceil(len / world_size)` samples.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    len: usize,
    num_replicas: usize,
    rank: usize,
    shuffle: bool,
    seed: u64,
    epoch: usize,
}

impl DistributedSampler {
    pub fn new(len: usize, dist: &DistributedContext, shuffle: bool, seed: u64) -> Self {
        Self {
            len,
            num_replicas: dist.world_size.max(1),
            rank: dist.rank,
            shuffle,
            seed,
            epoch: 0,
        }
    }

    pub fn num_samples(&self) -> usize {
        self.len.div_ceil(self.num_replicas)
    }
}

impl Sampler for DistributedSampler {
    fn indices(&self) -> Vec<usize> {
        if self.len == 0 {
            return Vec::new();
        }
        let mut indices = if self.shuffle {
            shuffled(self.len, self.seed.wrapping_add(self.epoch as u64))
        } else {
            (0..self.len).collect()
        };

        let total_size = self.num_samples() * self.num_replicas;
        let mut cursor = 0;
        while indices.len() < total_size {
            indices.push(indices[cursor]);
            cursor += 1;
        }

        indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.num_replicas)
            .collect()
    }

    fn set_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
    }
}

fn shuffled(len: usize, seed: u64) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..len).collect();
    let mut rng = StdRng::seed_from_u64(seed);
    indices.shuffle(&mut rng);
    indices
}

/// Groups sampled indices into batches, dropping the incomplete tail when asked to.
pub fn batch_indices(indices: Vec<usize>, batch_size: usize, drop_last: bool) -> Vec<Vec<usize>> {
    let batch_size = batch_size.max(1);
    indices
        .chunks(batch_size)
        .filter(|chunk| !drop_last || chunk.len() == batch_size)
        .map(|chunk| chunk.to_vec())
        .collect()
}

/// A dataset whose items are whole batches picked by a sampler.
pub struct SampledBatches<I> {
    dataset: Arc<dyn Dataset<I>>,
    batches: Vec<Vec<usize>>,
}

impl<I> SampledBatches<I> {
    pub fn new(dataset: Arc<dyn Dataset<I>>, batches: Vec<Vec<usize>>) -> Self {
        Self { dataset, batches }
    }
}

impl<I: Send + Sync> Dataset<Vec<I>> for SampledBatches<I> {
    fn get(&self, index: usize) -> Option<Vec<I>> {
        self.batches
            .get(index)?
            .iter()
            .map(|&item| self.dataset.get(item))
            .collect()
    }

    fn len(&self) -> usize {
        self.batches.len()
    }
}

/// Feeds one pre-built batch to the wrapped batcher.
#[derive(Clone)]
pub struct FlattenBatcher<Bt> {
    inner: Bt,
}

impl<B, I, O, Bt> Batcher<B, Vec<I>, O> for FlattenBatcher<Bt>
where
    B: Backend,
    Bt: Batcher<B, I, O>,
{
    fn batch(&self, items: Vec<Vec<I>>, device: &B::Device) -> O {
        self.inner.batch(items.into_iter().flatten().collect(), device)
    }
}

pub struct LoaderOptions<'a, B: Backend> {
    pub batch_size: usize,
    pub drop_last: bool,
    pub num_workers: usize,
    pub device: &'a B::Device,
}

/// Builds a loader that yields exactly the batches chosen by `sampler`.
pub fn build_loader<B, I, O, Bt>(
    batcher: Bt,
    dataset: Arc<dyn Dataset<I>>,
    sampler: &dyn Sampler,
    options: LoaderOptions<'_, B>,
) -> Arc<dyn DataLoader<B, O>>
where
    B: Backend,
    I: Send + Sync + Clone + Debug + 'static,
    O: Send + Clone + Debug + 'static,
    Bt: Batcher<B, I, O> + 'static,
{
    let batches = batch_indices(sampler.indices(), options.batch_size, options.drop_last);

    DataLoaderBuilder::new(FlattenBatcher { inner: batcher })
        .batch_size(1)
        .num_workers(options.num_workers)
        .set_device(options.device.clone())
        .build(SampledBatches::new(dataset, batches))
}
