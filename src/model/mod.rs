//! Gated multi-task network
//!
//! Every task sees two hidden representations of the same image: one from the
//! shared path and one from its own path. The task's gate blends them before
//! the task classifier. The network holds only structure; weights are passed
//! to every forward call so the bilevel trainer can run the same function on
//! the live weights, on the clone, and on the one-step-ahead fast weights.

pub mod backbone;
pub mod params;

pub use backbone::{Backbone, PooledProjection};
pub use params::{Branch, FastWeights, ParamId, ParamInit, ParamStore, WeightLookup};

use candle_core::{Device, Tensor};
use candle_nn::{Linear, Module};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::{Error, Result};
use crate::gate::GateParameters;
use crate::tasks::TaskSpec;
use crate::utils::validation::validate_dropout;

/// Standard deviation of the hidden projection weights
pub const HIDDEN_INIT_STD: f64 = 0.005;
/// Initial value of the hidden projection biases
pub const HIDDEN_INIT_BIAS: f32 = 0.1;
/// Standard deviation of the task classifiers
pub const CLASSIFIER_INIT_STD: f64 = 0.01;

/// Per-call forward state
///
/// Training mode draws dropout masks and v3 Gumbel noise from the borrowed
/// RNG; inference mode is deterministic.
pub struct ForwardContext<'a> {
    rng: Option<&'a mut StdRng>,
}

impl<'a> ForwardContext<'a> {
    /// Training-mode context
    pub fn training(rng: &'a mut StdRng) -> Self {
        Self { rng: Some(rng) }
    }

    /// Inference-mode context
    pub fn inference() -> Self {
        Self { rng: None }
    }

    /// Whether stochastic layers are active
    pub fn is_training(&self) -> bool {
        self.rng.is_some()
    }
}

/// Structure of the gated network
#[derive(Debug)]
pub struct GatedMultiTaskNet {
    backbone: Box<dyn Backbone>,
    tasks: Vec<TaskSpec>,
    hidden_dim: usize,
    dropout: f32,
}

impl GatedMultiTaskNet {
    /// Network with one shared and one per-task instance of `backbone`
    pub fn new(
        backbone: Box<dyn Backbone>,
        tasks: Vec<TaskSpec>,
        hidden_dim: usize,
        dropout: f32,
    ) -> Result<Self> {
        crate::tasks::validate_tasks(&tasks)?;
        validate_dropout(dropout)?;
        if hidden_dim == 0 {
            return Err(Error::config("hidden_dim must be positive"));
        }
        Ok(Self {
            backbone,
            tasks,
            hidden_dim,
            dropout,
        })
    }

    /// Configured tasks, in index order
    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }

    /// Number of tasks
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Width of the fused hidden representation
    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Feature extractor shared by every branch
    pub fn backbone(&self) -> &dyn Backbone {
        self.backbone.as_ref()
    }

    fn branches(&self) -> impl Iterator<Item = Branch> {
        std::iter::once(Branch::Shared).chain((0..self.tasks.len()).map(Branch::Task))
    }

    /// Freshly initialized weights drawn from an RNG seeded with `seed`
    pub fn init_weights(&self, seed: u64, device: &Device) -> Result<ParamStore> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut store = ParamStore::new();
        let mut init = ParamInit::new(&mut store, &mut rng, device);
        let feature_dim = self.backbone.output_dim();

        for branch in self.branches() {
            self.backbone.init_params(branch, &mut init)?;
        }
        for branch in self.branches() {
            init.normal(
                ParamId::HiddenWeight(branch),
                &[self.hidden_dim, feature_dim],
                0.0,
                HIDDEN_INIT_STD,
            )?;
            init.constant(ParamId::HiddenBias(branch), &[self.hidden_dim], HIDDEN_INIT_BIAS)?;
        }
        for (t, task) in self.tasks.iter().enumerate() {
            init.normal(
                ParamId::Classifier(t),
                &[self.hidden_dim, task.output_dim()],
                0.0,
                CLASSIFIER_INIT_STD,
            )?;
        }

        debug!(
            "Initialized {} weight tensors ({} values) with {} backbone",
            store.len(),
            store.num_elements(),
            self.backbone.name()
        );
        Ok(store)
    }

    fn check_gate(&self, gate: &GateParameters) -> Result<()> {
        if gate.task_count() != self.tasks.len() {
            return Err(Error::model(format!(
                "gate covers {} tasks but the network has {}",
                gate.task_count(),
                self.tasks.len()
            )));
        }
        Ok(())
    }

    /// Backbone, linear projection, ReLU and dropout for one branch
    fn hidden(
        &self,
        weights: &dyn WeightLookup,
        branch: Branch,
        images: &Tensor,
        ctx: &mut ForwardContext<'_>,
    ) -> Result<Tensor> {
        let features = self.backbone.forward(weights, branch, images)?;
        let layer = Linear::new(
            weights.weight(ParamId::HiddenWeight(branch))?.clone(),
            Some(weights.weight(ParamId::HiddenBias(branch))?.clone()),
        );
        let hidden = layer.forward(&features)?.relu()?;
        self.dropout(hidden, ctx)
    }

    fn dropout(&self, xs: Tensor, ctx: &mut ForwardContext<'_>) -> Result<Tensor> {
        let rng = match ctx.rng.as_deref_mut() {
            Some(rng) if self.dropout > 0.0 => rng,
            _ => return Ok(xs),
        };
        let keep = 1.0 - self.dropout;
        let scale = 1.0 / keep;
        let mask: Vec<f32> = (0..xs.elem_count())
            .map(|_| if rng.random::<f32>() < keep { scale } else { 0.0 })
            .collect();
        let mask = Tensor::from_vec(mask, xs.dims(), xs.device())?;
        Ok(xs.mul(&mask)?)
    }

    /// Gate blend of the two hidden representations, then the classifier
    fn head(
        &self,
        weights: &dyn WeightLookup,
        gate: &GateParameters,
        task: usize,
        shared: &Tensor,
        specific: &Tensor,
        ctx: &mut ForwardContext<'_>,
    ) -> Result<Tensor> {
        let mix = match ctx.rng.as_deref_mut() {
            Some(rng) => gate.decode_training(task, rng)?,
            None => gate.decode_inference(task)?,
        };
        let mix = mix.reshape((1, 2))?;
        let fused = shared
            .broadcast_mul(&mix.narrow(1, 0, 1)?)?
            .add(&specific.broadcast_mul(&mix.narrow(1, 1, 1)?)?)?;
        Ok(fused.matmul(weights.weight(ParamId::Classifier(task))?)?)
    }

    /// Logits for every task; the shared path is computed once
    pub fn forward(
        &self,
        weights: &dyn WeightLookup,
        gate: &GateParameters,
        images: &Tensor,
        ctx: &mut ForwardContext<'_>,
    ) -> Result<Vec<Tensor>> {
        self.check_gate(gate)?;
        let shared = self.hidden(weights, Branch::Shared, images, ctx)?;
        let mut outputs = Vec::with_capacity(self.tasks.len());
        for task in 0..self.tasks.len() {
            let specific = self.hidden(weights, Branch::Task(task), images, ctx)?;
            outputs.push(self.head(weights, gate, task, &shared, &specific, ctx)?);
        }
        Ok(outputs)
    }

    /// Logits for a single task
    pub fn forward_task(
        &self,
        weights: &dyn WeightLookup,
        gate: &GateParameters,
        images: &Tensor,
        task: usize,
        ctx: &mut ForwardContext<'_>,
    ) -> Result<Tensor> {
        self.check_gate(gate)?;
        if task >= self.tasks.len() {
            return Err(Error::invalid_input(format!(
                "task index {task} out of range for {} tasks",
                self.tasks.len()
            )));
        }
        let shared = self.hidden(weights, Branch::Shared, images, ctx)?;
        let specific = self.hidden(weights, Branch::Task(task), images, ctx)?;
        self.head(weights, gate, task, &shared, &specific, ctx)
    }

    /// Deterministic logits: no dropout, inference gate decode
    pub fn predict(
        &self,
        weights: &dyn WeightLookup,
        gate: &GateParameters,
        images: &Tensor,
    ) -> Result<Vec<Tensor>> {
        self.forward(weights, gate, images, &mut ForwardContext::inference())
    }
}
