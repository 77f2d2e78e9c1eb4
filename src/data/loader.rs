//! Async prefetching data loader

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use candle_core::Device;
use futures::stream::Stream;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument};

use super::{Dataset, MultiTaskBatch};
use crate::error::{Error, Result};

/// Configuration for [`DataLoader`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataLoaderConfig {
    /// Batch size
    pub batch_size: usize,
    /// Whether to shuffle every epoch
    pub shuffle: bool,
    /// Whether to drop the last incomplete batch
    pub drop_last: bool,
    /// Number of batches built ahead of the consumer
    pub prefetch_factor: usize,
    /// Seed of the shuffle and augmentation RNG
    pub seed: u64,
    /// Random horizontal flips
    pub augment: bool,
}

impl Default for DataLoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 2,
            shuffle: true,
            drop_last: false,
            prefetch_factor: 2,
            seed: 0,
            augment: false,
        }
    }
}

impl DataLoaderConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::config("batch_size must be positive"));
        }
        if self.prefetch_factor == 0 {
            return Err(Error::config("prefetch_factor must be positive"));
        }
        Ok(())
    }
}

/// Loader producing one [`BatchStream`] per epoch
pub struct DataLoader {
    dataset: Arc<dyn Dataset>,
    config: DataLoaderConfig,
    device: Device,
}

impl DataLoader {
    /// Create a loader over `dataset`
    pub fn new(dataset: Arc<dyn Dataset>, config: DataLoaderConfig, device: Device) -> Result<Self> {
        config.validate()?;
        debug!(
            "Creating DataLoader with batch_size={}, shuffle={}, augment={}",
            config.batch_size, config.shuffle, config.augment
        );
        Ok(Self {
            dataset,
            config,
            device,
        })
    }

    /// Batches per epoch
    pub fn num_batches(&self) -> usize {
        let size = self.dataset.len();
        if self.config.drop_last {
            size / self.config.batch_size
        } else {
            size.div_ceil(self.config.batch_size)
        }
    }

    /// Dataset size
    pub fn dataset_size(&self) -> usize {
        self.dataset.len()
    }

    /// Loader settings
    pub fn config(&self) -> &DataLoaderConfig {
        &self.config
    }

    /// Index order of an epoch; a pure function of the seed and `epoch`
    fn create_batches(&self, rng: &mut StdRng) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.config.shuffle {
            indices.shuffle(rng);
        }
        indices
            .chunks(self.config.batch_size)
            .filter(|chunk| !self.config.drop_last || chunk.len() == self.config.batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }

    /// Start producing the batches of `epoch`. Must be called inside a tokio
    /// runtime; dropping the stream stops the producer.
    #[instrument(skip(self))]
    pub fn epoch_stream(&self, epoch: usize) -> BatchStream {
        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(epoch as u64));
        let batches = self.create_batches(&mut rng);
        let total_batches = batches.len();
        let (sender, receiver) = mpsc::channel(self.config.prefetch_factor);

        let dataset = self.dataset.clone();
        let device = self.device.clone();
        let augment = self.config.augment;
        tokio::task::spawn_blocking(move || {
            for (batch_idx, indices) in batches.into_iter().enumerate() {
                let batch = build_batch(dataset.as_ref(), indices, augment, &mut rng, &device);
                if let Err(e) = &batch {
                    error!("Batch {} of epoch {} failed: {}", batch_idx, epoch, e);
                }
                if sender.blocking_send(batch).is_err() {
                    debug!("Batch consumer dropped, stopping producer");
                    break;
                }
            }
        });

        BatchStream {
            receiver,
            batches_received: 0,
            total_batches,
            epoch,
        }
    }
}

fn build_batch(
    dataset: &dyn Dataset,
    indices: Vec<usize>,
    augment: bool,
    rng: &mut StdRng,
    device: &Device,
) -> Result<MultiTaskBatch> {
    let shape = dataset.image_shape();
    let mut samples = Vec::with_capacity(indices.len());
    for &index in &indices {
        let mut sample = dataset.get(index)?;
        if augment && rng.random_bool(0.5) {
            sample.flip_horizontal(shape, dataset.tasks())?;
        }
        samples.push(sample);
    }
    MultiTaskBatch::collate(samples, indices, shape, dataset.tasks(), device)
}

/// Receiving end of one epoch's batches
pub struct BatchStream {
    receiver: mpsc::Receiver<Result<MultiTaskBatch>>,
    batches_received: usize,
    total_batches: usize,
    epoch: usize,
}

impl BatchStream {
    /// Next batch, or `None` once the epoch is exhausted
    pub async fn next_batch(&mut self) -> Option<Result<MultiTaskBatch>> {
        let batch = self.receiver.recv().await;
        if batch.is_some() {
            self.batches_received += 1;
        }
        batch
    }

    /// Batches handed out so far
    pub fn batches_received(&self) -> usize {
        self.batches_received
    }

    /// Batches in this epoch
    pub fn total_batches(&self) -> usize {
        self.total_batches
    }

    /// Epoch number
    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

impl Stream for BatchStream {
    type Item = Result<MultiTaskBatch>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.receiver.poll_recv(cx) {
            Poll::Ready(Some(batch)) => {
                self.batches_received += 1;
                Poll::Ready(Some(batch))
            }
            other => other,
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.total_batches.saturating_sub(self.batches_received);
        (remaining, Some(remaining))
    }
}
