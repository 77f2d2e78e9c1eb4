//! Data loading for multi-task training
//!
//! This module provides the dataset abstraction, a deterministic synthetic
//! scene dataset, batch collation, and an async prefetching loader.

use candle_core::{Device, Tensor};

use crate::error::{Error, Result};
use crate::tasks::{TaskKind, TaskSpec};

pub mod loader;
pub mod synthetic;

pub use loader::{BatchStream, DataLoader, DataLoaderConfig};
pub use synthetic::{SyntheticConfig, SyntheticDataset};

/// Random-access multi-task dataset
pub trait Dataset: Send + Sync {
    /// Number of samples
    fn len(&self) -> usize;

    /// Whether the dataset is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample at `index`
    fn get(&self, index: usize) -> Result<Sample>;

    /// Image layout `(channels, height, width)`
    fn image_shape(&self) -> (usize, usize, usize);

    /// Tasks every sample carries a target for, in index order
    fn tasks(&self) -> &[TaskSpec];
}

/// Target of one task for one sample
#[derive(Debug, Clone, PartialEq)]
pub enum TaskTarget {
    /// Class index, `-1` = ignore
    Label(i64),
    /// Continuous target; all zeros = missing
    Values(Vec<f32>),
}

/// A single image with one target per task
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    /// Row-major `[C, H, W]` pixels
    pub image: Vec<f32>,
    /// Targets in task order
    pub targets: Vec<TaskTarget>,
}

impl Sample {
    /// Mirror the image left to right. Surface normals flip their x component
    /// so they stay consistent with the mirrored scene.
    pub fn flip_horizontal(
        &mut self,
        shape: (usize, usize, usize),
        tasks: &[TaskSpec],
    ) -> Result<()> {
        let (channels, height, width) = shape;
        let expected = channels * height * width;
        if self.image.len() != expected {
            return Err(Error::data(format!(
                "cannot flip image of {} values as {channels}x{height}x{width}",
                self.image.len()
            )));
        }
        for row in 0..channels * height {
            self.image[row * width..(row + 1) * width].reverse();
        }
        for (target, task) in self.targets.iter_mut().zip(tasks) {
            if let (TaskKind::SurfaceNormal, TaskTarget::Values(v)) = (&task.kind, target) {
                if let Some(x) = v.first_mut() {
                    *x = -*x;
                }
            }
        }
        Ok(())
    }
}

/// Collated batch
#[derive(Debug, Clone)]
pub struct MultiTaskBatch {
    /// `[B, C, H, W]` images
    pub images: Tensor,
    /// Per-task targets: `[B]` i64 labels or `[B, dim]` f32 values
    pub targets: Vec<Tensor>,
    /// Dataset indices of the rows
    pub indices: Vec<usize>,
}

impl MultiTaskBatch {
    /// Number of samples
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether the batch has no samples
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Stack samples into tensors on `device`
    pub fn collate(
        samples: Vec<Sample>,
        indices: Vec<usize>,
        shape: (usize, usize, usize),
        tasks: &[TaskSpec],
        device: &Device,
    ) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::data("cannot collate an empty batch"));
        }
        let (channels, height, width) = shape;
        let batch = samples.len();
        let pixels = channels * height * width;

        let mut images = Vec::with_capacity(batch * pixels);
        for sample in &samples {
            if sample.image.len() != pixels {
                return Err(Error::data(format!(
                    "sample has {} pixels, expected {pixels}",
                    sample.image.len()
                )));
            }
            images.extend_from_slice(&sample.image);
        }
        let images = Tensor::from_vec(images, (batch, channels, height, width), device)?;

        let mut targets = Vec::with_capacity(tasks.len());
        for (t, task) in tasks.iter().enumerate() {
            targets.push(collate_task(&samples, t, task, device)?);
        }

        Ok(Self {
            images,
            targets,
            indices,
        })
    }
}

fn collate_task(samples: &[Sample], t: usize, task: &TaskSpec, device: &Device) -> Result<Tensor> {
    let batch = samples.len();
    match &task.kind {
        TaskKind::Classification { .. } => {
            let labels = samples
                .iter()
                .map(|s| match s.targets.get(t) {
                    Some(TaskTarget::Label(l)) => Ok(*l),
                    _ => Err(Error::data(format!("task `{}` expects a class label", task.name))),
                })
                .collect::<Result<Vec<i64>>>()?;
            Ok(Tensor::from_vec(labels, batch, device)?)
        }
        kind => {
            let dim = kind.output_dim();
            let mut values = Vec::with_capacity(batch * dim);
            for sample in samples {
                match sample.targets.get(t) {
                    Some(TaskTarget::Values(v)) if v.len() == dim => values.extend_from_slice(v),
                    _ => {
                        return Err(Error::data(format!(
                            "task `{}` expects {dim} target values",
                            task.name
                        )))
                    }
                }
            }
            Ok(Tensor::from_vec(values, (batch, dim), device)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::scene_tasks;

    fn sample() -> Sample {
        Sample {
            image: (0..12).map(|v| v as f32).collect(),
            targets: vec![
                TaskTarget::Label(4),
                TaskTarget::Values(vec![2.5]),
                TaskTarget::Values(vec![0.6, 0.0, 0.8]),
            ],
        }
    }

    #[test]
    fn test_flip_mirrors_rows_and_normals() {
        let mut s = sample();
        s.flip_horizontal((3, 2, 2), &scene_tasks()).unwrap();
        assert_eq!(&s.image[..4], &[1.0, 0.0, 3.0, 2.0]);
        assert_eq!(s.targets[2], TaskTarget::Values(vec![-0.6, 0.0, 0.8]));
        assert_eq!(s.targets[1], TaskTarget::Values(vec![2.5]));
    }

    #[test]
    fn test_flip_rejects_image_of_wrong_size() {
        let mut s = sample();
        s.image.truncate(10);
        let err = s.flip_horizontal((3, 2, 2), &scene_tasks()).unwrap_err();
        assert!(matches!(err, Error::Data(_)));
        // nothing was mirrored
        assert_eq!(&s.image[..2], &[0.0, 1.0]);
        assert_eq!(s.targets[2], TaskTarget::Values(vec![0.6, 0.0, 0.8]));
    }

    #[test]
    fn test_collate_shapes() {
        let tasks = scene_tasks();
        let batch = MultiTaskBatch::collate(
            vec![sample(), sample()],
            vec![0, 1],
            (3, 2, 2),
            &tasks,
            &Device::Cpu,
        )
        .unwrap();
        assert_eq!(batch.images.dims(), &[2, 3, 2, 2]);
        assert_eq!(batch.targets[0].to_vec1::<i64>().unwrap(), vec![4, 4]);
        assert_eq!(batch.targets[2].dims(), &[2, 3]);
        assert_eq!(batch.len(), 2);
    }

    #[test]
    fn test_collate_rejects_mismatched_target() {
        let mut bad = sample();
        bad.targets[0] = TaskTarget::Values(vec![1.0]);
        let result = MultiTaskBatch::collate(
            vec![bad],
            vec![0],
            (3, 2, 2),
            &scene_tasks(),
            &Device::Cpu,
        );
        assert!(result.is_err());
    }
}
