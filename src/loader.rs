use std::sync::Arc;

use burn::{
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    tensor::backend::Backend,
};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::context::TrainingContext;
use crate::dataset::{RawBatch, TtsBatcher, TtsDataset, TtsItem};

/// Splits the dataset into one disjoint shard per replica.
///
/// Indices are shuffled with `seed + epoch`, padded by wrapping around to a
/// multiple of the world size, then strided by rank.
#[derive(Debug, Clone)]
pub struct DistributedSampler {
    num_items: usize,
    rank: usize,
    world_size: usize,
    seed: u64,
    epoch: u64,
}

impl DistributedSampler {
    pub fn new(num_items: usize, rank: usize, world_size: usize, seed: u64) -> Self {
        Self {
            num_items,
            rank,
            world_size: world_size.max(1),
            seed,
            epoch: 0,
        }
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        self.epoch = epoch;
    }

    /// Items every replica sees per epoch
    pub fn num_samples(&self) -> usize {
        self.num_items.div_ceil(self.world_size)
    }

    pub fn indices(&self) -> Vec<usize> {
        if self.num_items == 0 {
            return Vec::new();
        }

        let mut indices: Vec<usize> = (0..self.num_items).collect();
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(self.epoch));
        indices.shuffle(&mut rng);

        let total = self.num_samples() * self.world_size;
        let mut padding = 0;
        while indices.len() < total {
            indices.push(indices[padding % self.num_items]);
            padding += 1;
        }

        indices
            .into_iter()
            .skip(self.rank)
            .step_by(self.world_size)
            .collect()
    }
}

/// Items of one replica's shard, in sampler order, paired with their
/// dataset index
#[derive(Debug, Clone)]
pub struct ShardDataset {
    dataset: Arc<TtsDataset>,
    indices: Vec<usize>,
}

impl ShardDataset {
    pub fn new(dataset: Arc<TtsDataset>, sampler: Option<&DistributedSampler>) -> Self {
        let indices = match sampler {
            Some(sampler) => sampler.indices(),
            None => (0..dataset.len()).collect(),
        };
        Self { dataset, indices }
    }
}

impl Dataset<(usize, TtsItem)> for ShardDataset {
    fn get(&self, index: usize) -> Option<(usize, TtsItem)> {
        let idx = *self.indices.get(index)?;
        self.dataset.get(idx).map(|item| (idx, item))
    }

    fn len(&self) -> usize {
        self.indices.len()
    }
}

/// Batches of one replica's shard, built by burn's data loader.
///
/// The inner loader is rebuilt whenever the epoch changes, so the sampler
/// reshuffles the shard.
pub struct TtsDataLoader<B: Backend> {
    dataset: Arc<TtsDataset>,
    batcher: TtsBatcher<B>,
    batch_size: usize,
    num_workers: usize,
    sampler: Option<DistributedSampler>,
    inner: Arc<dyn DataLoader<RawBatch<B>>>,
}

impl<B: Backend> TtsDataLoader<B> {
    pub fn new(
        dataset: Arc<TtsDataset>,
        batcher: TtsBatcher<B>,
        batch_size: usize,
        num_workers: usize,
        sampler: Option<DistributedSampler>,
    ) -> Self {
        let batch_size = batch_size.max(1);
        let inner = build_inner(&dataset, &batcher, batch_size, num_workers, sampler.as_ref());
        Self {
            dataset,
            batcher,
            batch_size,
            num_workers,
            sampler,
            inner,
        }
    }

    /// Batches of this replica. Order is sequential with no workers; with
    /// workers each one batches its own slice of the shard.
    pub fn iter(&self) -> impl Iterator<Item = RawBatch<B>> + '_ {
        self.inner.iter()
    }

    pub fn num_items(&self) -> usize {
        self.inner.num_items()
    }

    pub fn num_batches(&self) -> usize {
        self.num_items().div_ceil(self.batch_size)
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn sampler(&self) -> Option<&DistributedSampler> {
        self.sampler.as_ref()
    }

    pub fn set_epoch(&mut self, epoch: u64) {
        if let Some(sampler) = self.sampler.as_mut() {
            sampler.set_epoch(epoch);
            self.inner = build_inner(
                &self.dataset,
                &self.batcher,
                self.batch_size,
                self.num_workers,
                self.sampler.as_ref(),
            );
        }
    }

    pub fn dataset(&self) -> &TtsDataset {
        &self.dataset
    }
}

fn build_inner<B: Backend>(
    dataset: &Arc<TtsDataset>,
    batcher: &TtsBatcher<B>,
    batch_size: usize,
    num_workers: usize,
    sampler: Option<&DistributedSampler>,
) -> Arc<dyn DataLoader<RawBatch<B>>> {
    let shard = ShardDataset::new(dataset.clone(), sampler);
    let builder = DataLoaderBuilder::new(batcher.clone()).batch_size(batch_size);
    // zero workers means batching on the caller's thread
    if num_workers > 0 {
        builder.num_workers(num_workers).build(shard)
    } else {
        builder.build(shard)
    }
}

/// Build the train or eval loader, `None` for eval when evaluation is off.
///
/// `B` is the backend the batches live on; training batches use the autodiff
/// backend and evaluation batches its inner backend, both on the context device.
pub fn setup_loader<B, C>(
    ctx: &TrainingContext<C>,
    items: Vec<TtsItem>,
    is_val: bool,
) -> Option<TtsDataLoader<B>>
where
    B: Backend,
    C: Backend<Device = B::Device>,
{
    let config = &ctx.config;
    if is_val && !config.run_eval {
        return None;
    }

    let mut dataset = TtsDataset::new(items, &ctx.characters, config.min_seq_len, config.max_seq_len);
    if !is_val {
        dataset.shuffle_groups(config.batch_group_size * config.batch_size, config.seed);
    }

    let sampler = ctx
        .is_distributed()
        .then(|| DistributedSampler::new(dataset.len(), ctx.rank(), ctx.world_size(), config.seed));

    let (batch_size, num_workers) = if is_val {
        (config.eval_batch_size, config.num_val_loader_workers)
    } else {
        (config.batch_size, config.num_loader_workers)
    };
    let batcher = TtsBatcher::new(ctx.device.clone(), config.r, ctx.speakers.clone());

    Some(TtsDataLoader::new(Arc::new(dataset), batcher, batch_size, num_workers, sampler))
}
