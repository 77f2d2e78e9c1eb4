//! Gate parameter store
//!
//! Each task owns a learned gate that decides how much of the shared hidden
//! representation and how much of the task-specific one feed its classifier.
//! Three parameterizations are supported:
//!
//! - **v1**: a 2-vector per task passed through softmax (weights sum to one)
//! - **v2**: a 2-vector per task passed through independent sigmoids
//! - **v3**: a scalar per task; `p = sigmoid(a)` forms `[1 - p, p]`, which is
//!   sharpened by a straight-through hard Gumbel-softmax while training and
//!   hard-thresholded at 0.5 for inference
//!
//! The version is resolved once into a [`GateStrategy`] object; callers never
//! branch on the version string again.

use std::fmt;
use std::str::FromStr;

use candle_core::{DType, Device, Tensor, Var, D};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Gumbel};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::utils::math::{argmax, sigmoid, sigmoid_f32};

/// Temperature of the relaxed one-hot used by v3 during training
pub const DEFAULT_GUMBEL_TEMPERATURE: f64 = 0.1;

/// Gate parameterization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateVersion {
    /// Softmax over (shared, specific)
    V1,
    /// Independent sigmoid per branch
    V2,
    /// Hard Gumbel-softmax over a sigmoid probability
    V3,
}

impl GateVersion {
    /// Canonical name as accepted on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            GateVersion::V1 => "v1",
            GateVersion::V2 => "v2",
            GateVersion::V3 => "v3",
        }
    }
}

impl fmt::Display for GateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GateVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" => Ok(GateVersion::V1),
            "v2" => Ok(GateVersion::V2),
            "v3" => Ok(GateVersion::V3),
            other => Err(Error::config(format!(
                "No correct version parameter! `{other}` is not one of v1, v2, v3"
            ))),
        }
    }
}

/// Decoding strategy for one gate parameterization
pub trait GateStrategy: Send + Sync + fmt::Debug {
    /// Parameterization implemented by this strategy
    fn version(&self) -> GateVersion;

    /// Initial gate state for `task_count` tasks
    fn init_state(&self, task_count: usize, device: &Device) -> Result<Tensor>;

    /// Differentiable `[w_shared, w_specific]` used during training
    fn decode_training(&self, state: &Tensor, task: usize, rng: &mut StdRng) -> Result<Tensor>;

    /// Deterministic `[w_shared, w_specific]` used for prediction
    fn decode_inference(&self, state: &Tensor, task: usize) -> Result<Tensor>;

    /// Raw and decoded values rendered for the per-epoch report
    fn describe(&self, state: &Tensor, task: usize) -> Result<String>;

    /// Decoded values recorded in the epoch history
    fn decoded_values(&self, state: &Tensor, task: usize) -> Result<Vec<f32>>;
}

/// v1: softmax over the task's (shared, specific) pair
#[derive(Debug, Clone, Default)]
pub struct SoftmaxGate;

impl GateStrategy for SoftmaxGate {
    fn version(&self) -> GateVersion {
        GateVersion::V1
    }

    fn init_state(&self, task_count: usize, device: &Device) -> Result<Tensor> {
        Ok(Tensor::full(0.5f32, (task_count, 2), device)?)
    }

    fn decode_training(&self, state: &Tensor, task: usize, _rng: &mut StdRng) -> Result<Tensor> {
        self.decode_inference(state, task)
    }

    fn decode_inference(&self, state: &Tensor, task: usize) -> Result<Tensor> {
        Ok(candle_nn::ops::softmax(&state.get(task)?, D::Minus1)?)
    }

    fn describe(&self, state: &Tensor, task: usize) -> Result<String> {
        let raw = state.get(task)?.to_vec1::<f32>()?;
        let decoded = self.decoded_values(state, task)?;
        Ok(format!("{} {}", format_values(&raw), format_values(&decoded)))
    }

    fn decoded_values(&self, state: &Tensor, task: usize) -> Result<Vec<f32>> {
        Ok(self.decode_inference(state, task)?.to_vec1::<f32>()?)
    }
}

/// v2: independent sigmoid per branch, weights need not sum to one
#[derive(Debug, Clone, Default)]
pub struct SigmoidGate;

impl GateStrategy for SigmoidGate {
    fn version(&self) -> GateVersion {
        GateVersion::V2
    }

    fn init_state(&self, task_count: usize, device: &Device) -> Result<Tensor> {
        Ok(Tensor::full(0.5f32, (task_count, 2), device)?)
    }

    fn decode_training(&self, state: &Tensor, task: usize, _rng: &mut StdRng) -> Result<Tensor> {
        self.decode_inference(state, task)
    }

    fn decode_inference(&self, state: &Tensor, task: usize) -> Result<Tensor> {
        sigmoid(&state.get(task)?)
    }

    fn describe(&self, state: &Tensor, task: usize) -> Result<String> {
        let raw = state.get(task)?.to_vec1::<f32>()?;
        let decoded = self.decoded_values(state, task)?;
        Ok(format!("{} {}", format_values(&raw), format_values(&decoded)))
    }

    fn decoded_values(&self, state: &Tensor, task: usize) -> Result<Vec<f32>> {
        Ok(self.decode_inference(state, task)?.to_vec1::<f32>()?)
    }
}

/// v3: scalar gate, hard Gumbel-softmax selection while training
#[derive(Debug, Clone)]
pub struct GumbelGate {
    temperature: f64,
}

impl GumbelGate {
    /// Create a v3 strategy with the given relaxation temperature
    pub fn new(temperature: f64) -> Self {
        Self { temperature }
    }

    /// `[1 - p, p]` with `p = sigmoid(state[task])`
    fn probabilities(&self, state: &Tensor, task: usize) -> Result<Tensor> {
        let p = sigmoid(&state.get(task)?)?;
        let q = p.affine(-1.0, 1.0)?;
        Ok(Tensor::stack(&[q, p], 0)?)
    }

    fn gumbel_noise(&self, rng: &mut StdRng, device: &Device) -> Result<Tensor> {
        let dist = Gumbel::new(0.0f32, 1.0f32)
            .map_err(|e| Error::internal(format!("invalid Gumbel distribution: {e}")))?;
        let noise: Vec<f32> = (0..2).map(|_| dist.sample(rng)).collect();
        Ok(Tensor::from_vec(noise, 2, device)?)
    }
}

impl GateStrategy for GumbelGate {
    fn version(&self) -> GateVersion {
        GateVersion::V3
    }

    fn init_state(&self, task_count: usize, device: &Device) -> Result<Tensor> {
        Ok(Tensor::zeros(task_count, DType::F32, device)?)
    }

    fn decode_training(&self, state: &Tensor, task: usize, rng: &mut StdRng) -> Result<Tensor> {
        let logits = self.probabilities(state, task)?.log()?;
        let noise = self.gumbel_noise(rng, state.device())?;
        let perturbed = (logits + noise)?.affine(1.0 / self.temperature, 0.0)?;
        let soft = candle_nn::ops::softmax(&perturbed, D::Minus1)?;

        // Straight-through: forward value is one-hot, gradient is the soft one.
        let selected = argmax(&soft.to_vec1::<f32>()?);
        let hard = one_hot_pair(selected, state.device())?;
        Ok(hard.sub(&soft.detach())?.add(&soft)?)
    }

    fn decode_inference(&self, state: &Tensor, task: usize) -> Result<Tensor> {
        let p = sigmoid_f32(state.get(task)?.to_scalar::<f32>()?);
        let selected = if p >= 0.5 { 1 } else { 0 };
        one_hot_pair(selected, state.device())
    }

    fn describe(&self, state: &Tensor, task: usize) -> Result<String> {
        let raw = state.get(task)?.to_scalar::<f32>()?;
        let decoded = self.decoded_values(state, task)?;
        Ok(format!(
            "{} {} {}",
            task,
            format_values(&[raw]),
            format_values(&decoded)
        ))
    }

    fn decoded_values(&self, state: &Tensor, task: usize) -> Result<Vec<f32>> {
        Ok(self.probabilities(state, task)?.to_vec1::<f32>()?)
    }
}

fn one_hot_pair(selected: usize, device: &Device) -> Result<Tensor> {
    let values = if selected == 0 { [1f32, 0.0] } else { [0f32, 1.0] };
    Ok(Tensor::new(&values, device)?)
}

fn format_values(values: &[f32]) -> String {
    let parts: Vec<String> = values.iter().map(|v| format!("{v:.4}")).collect();
    format!("[{}]", parts.join(", "))
}

/// Build the strategy for a parameterization
pub fn create_gate_strategy(version: GateVersion, temperature: f64) -> Box<dyn GateStrategy> {
    match version {
        GateVersion::V1 => Box::new(SoftmaxGate),
        GateVersion::V2 => Box::new(SigmoidGate),
        GateVersion::V3 => Box::new(GumbelGate::new(temperature)),
    }
}

/// Snapshot of one task's gate for the epoch history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateReading {
    /// Task index
    pub task: usize,
    /// Raw parameter values
    pub raw: Vec<f32>,
    /// Decoded mixing values
    pub decoded: Vec<f32>,
}

/// Trainable gate state for every task
///
/// This is the auxiliary model updated by the meta-gradient. It is never
/// registered with the model optimizer.
#[derive(Debug)]
pub struct GateParameters {
    alpha: Var,
    strategy: Box<dyn GateStrategy>,
    task_count: usize,
}

impl GateParameters {
    /// Create gate parameters for `task_count` tasks
    pub fn new(
        task_count: usize,
        version: GateVersion,
        temperature: f64,
        device: &Device,
    ) -> Result<Self> {
        Self::with_strategy(task_count, create_gate_strategy(version, temperature), device)
    }

    /// Create gate parameters from an explicit strategy
    pub fn with_strategy(
        task_count: usize,
        strategy: Box<dyn GateStrategy>,
        device: &Device,
    ) -> Result<Self> {
        if task_count == 0 {
            return Err(Error::config("at least one task is required"));
        }
        let alpha = Var::from_tensor(&strategy.init_state(task_count, device)?)?;
        Ok(Self {
            alpha,
            strategy,
            task_count,
        })
    }

    /// Gate parameterization
    pub fn version(&self) -> GateVersion {
        self.strategy.version()
    }

    /// Number of tasks
    pub fn task_count(&self) -> usize {
        self.task_count
    }

    /// Trainable variable, for the gate optimizer only
    pub fn var(&self) -> &Var {
        &self.alpha
    }

    /// Current gate state
    pub fn state(&self) -> &Tensor {
        self.alpha.as_tensor()
    }

    fn check_task(&self, task: usize) -> Result<()> {
        if task >= self.task_count {
            return Err(Error::invalid_input(format!(
                "task index {task} out of range for {} tasks",
                self.task_count
            )));
        }
        Ok(())
    }

    /// Differentiable mixing weights for training
    pub fn decode_training(&self, task: usize, rng: &mut StdRng) -> Result<Tensor> {
        self.check_task(task)?;
        self.strategy.decode_training(self.state(), task, rng)
    }

    /// Deterministic mixing weights for prediction
    pub fn decode_inference(&self, task: usize) -> Result<Tensor> {
        self.check_task(task)?;
        self.strategy.decode_inference(self.state(), task)
    }

    /// `(w_shared, w_specific)` as used for prediction
    pub fn mixing_weights(&self, task: usize) -> Result<(f32, f32)> {
        let weights = self.decode_inference(task)?.to_vec1::<f32>()?;
        Ok((weights[0], weights[1]))
    }

    /// Flattened copy of the raw gate values
    pub fn snapshot(&self) -> Result<Vec<f32>> {
        Ok(self.state().flatten_all()?.to_vec1::<f32>()?)
    }

    /// Report line for one task
    pub fn describe(&self, task: usize) -> Result<String> {
        self.check_task(task)?;
        self.strategy.describe(self.state(), task)
    }

    /// Raw and decoded values for every task
    pub fn readings(&self) -> Result<Vec<GateReading>> {
        (0..self.task_count)
            .map(|task| {
                let raw = self.state().get(task)?.flatten_all()?.to_vec1::<f32>()?;
                let decoded = self.strategy.decoded_values(self.state(), task)?;
                Ok(GateReading { task, raw, decoded })
            })
            .collect()
    }
}
