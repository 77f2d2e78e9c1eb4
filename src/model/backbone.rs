//! Feature extractors
//!
//! A backbone turns `[B, C, H, W]` images into `[B, feature_dim]` embeddings.
//! It owns no tensors: every instance (the shared one and one per task) is a
//! set of [`ParamId::Backbone`] slots in a [`ParamStore`], which is what lets
//! the same code run on live weights, on a clone, and on one-step-ahead fast
//! weights.

use candle_core::{Tensor, D};
use candle_nn::{Linear, Module};

use super::params::{Branch, ParamId, ParamInit, WeightLookup};
use crate::error::{Error, Result};
use crate::utils::math::he_std;

/// Feature extractor evaluated over explicit weights
pub trait Backbone: Send + Sync + std::fmt::Debug {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    /// Embedding width
    fn output_dim(&self) -> usize;

    /// Register the weights of one branch
    fn init_params(&self, branch: Branch, init: &mut ParamInit<'_>) -> Result<()>;

    /// Embed a batch of images using the weights of `branch`
    fn forward(&self, weights: &dyn WeightLookup, branch: Branch, images: &Tensor)
        -> Result<Tensor>;
}

/// Spatial average pooling followed by a linear projection and ReLU
#[derive(Debug, Clone)]
pub struct PooledProjection {
    in_channels: usize,
    feature_dim: usize,
}

impl PooledProjection {
    const WEIGHT: usize = 0;
    const BIAS: usize = 1;

    /// Backbone reading `in_channels` image planes
    pub fn new(in_channels: usize, feature_dim: usize) -> Result<Self> {
        if in_channels == 0 || feature_dim == 0 {
            return Err(Error::config(
                "backbone channels and feature width must be positive",
            ));
        }
        Ok(Self {
            in_channels,
            feature_dim,
        })
    }

    fn weight_id(branch: Branch) -> ParamId {
        ParamId::Backbone {
            branch,
            slot: Self::WEIGHT,
        }
    }

    fn bias_id(branch: Branch) -> ParamId {
        ParamId::Backbone {
            branch,
            slot: Self::BIAS,
        }
    }
}

impl Backbone for PooledProjection {
    fn name(&self) -> &str {
        "pooled_projection"
    }

    fn output_dim(&self) -> usize {
        self.feature_dim
    }

    fn init_params(&self, branch: Branch, init: &mut ParamInit<'_>) -> Result<()> {
        init.normal(
            Self::weight_id(branch),
            &[self.feature_dim, self.in_channels],
            0.0,
            he_std(self.in_channels),
        )?;
        init.constant(Self::bias_id(branch), &[self.feature_dim], 0.0)
    }

    fn forward(
        &self,
        weights: &dyn WeightLookup,
        branch: Branch,
        images: &Tensor,
    ) -> Result<Tensor> {
        let (_, channels, _, _) = images.dims4()?;
        if channels != self.in_channels {
            return Err(Error::invalid_input(format!(
                "backbone expects {} channels, got {channels}",
                self.in_channels
            )));
        }
        let pooled = images.flatten_from(2)?.mean(D::Minus1)?;
        let layer = Linear::new(
            weights.weight(Self::weight_id(branch))?.clone(),
            Some(weights.weight(Self::bias_id(branch))?.clone()),
        );
        Ok(layer.forward(&pooled)?.relu()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::params::ParamStore;
    use candle_core::{DType, Device};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_branches_get_separate_weights() {
        let device = Device::Cpu;
        let backbone = PooledProjection::new(3, 8).unwrap();
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(0);
        let mut init = ParamInit::new(&mut store, &mut rng, &device);
        backbone.init_params(Branch::Shared, &mut init).unwrap();
        backbone.init_params(Branch::Task(0), &mut init).unwrap();
        assert_eq!(store.len(), 4);

        let images = Tensor::ones((2, 3, 4, 4), DType::F32, &device).unwrap();
        let shared = backbone.forward(&store, Branch::Shared, &images).unwrap();
        let task = backbone.forward(&store, Branch::Task(0), &images).unwrap();
        assert_eq!(shared.dims(), &[2, 8]);
        assert_ne!(
            shared.to_vec2::<f32>().unwrap(),
            task.to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_rejects_wrong_channel_count() {
        let device = Device::Cpu;
        let backbone = PooledProjection::new(3, 4).unwrap();
        let mut store = ParamStore::new();
        let mut rng = StdRng::seed_from_u64(0);
        backbone
            .init_params(Branch::Shared, &mut ParamInit::new(&mut store, &mut rng, &device))
            .unwrap();
        let images = Tensor::ones((1, 1, 4, 4), DType::F32, &device).unwrap();
        assert!(backbone.forward(&store, Branch::Shared, &images).is_err());
    }
}
