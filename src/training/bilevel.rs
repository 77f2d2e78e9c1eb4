//! Bilevel (meta-gradient) training of the gated network
//!
//! Each training iteration pairs one training batch with one validation batch
//! and runs four phases in order:
//!
//! 1. **CLONE**: deep copy of the live weights
//! 2. **INNER_GRAD**: loss of the clone on the training batch, gradients kept
//!    differentiable, fast weights `w - η·∇w` built as graph nodes
//! 3. **GATE_UPDATE**: validation loss of the fast weights, backpropagated
//!    through the inner step into the gate; only the gate optimizer steps
//! 4. **OUTER_UPDATE**: loss of the live weights on the training batch with the
//!    updated gate; only the model optimizer steps
//!
//! The clone and its fast weights are dropped at the end of the iteration.
//!
//! In [`TrainingMode::Joint`] the gate is registered with the model optimizer
//! instead, and each iteration is a single step of weights and gate on the
//! training loss. No clone is made and the validation split is not read.

use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use candle_core::backprop::GradStore;
use candle_core::{Device, Tensor, Var};
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, debug_span, info, instrument, warn};

use super::optimizer::{Adam, AdamConfig, Optimizer, StepOutcome};
use super::report::{gate_lines, ConsoleReport, EpochRecord, TrainingHistory};
use super::scheduler::{LearningRateScheduler, StepScheduler};
use crate::config::{ExperimentConfig, Split, TrainingMode};
use crate::data::{DataLoader, MultiTaskBatch, SyntheticDataset};
use crate::error::{Error, Result};
use crate::gate::GateParameters;
use crate::metrics::{SplitMetrics, SplitSummary};
use crate::model::{
    FastWeights, ForwardContext, GatedMultiTaskNet, ParamId, ParamStore, PooledProjection,
};
use crate::tasks::TaskSpec;
use crate::utils::autograd::enable_higher_order_gradients;

/// Offset separating the dropout/Gumbel stream from the weight-init stream
const NOISE_SEED_OFFSET: u64 = 0x5EED;

/// Optimizer-facing name of the gate parameters
const GATE_PARAM_NAME: &str = "gate.alpha";

/// Phase of a bilevel iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Deep copy of the live weights
    Clone,
    /// Differentiable virtual step of the clone
    InnerGrad,
    /// Gate update from the validation loss of the fast weights
    GateUpdate,
    /// Model update with the new gate
    OuterUpdate,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Clone => "clone",
            Phase::InnerGrad => "inner_grad",
            Phase::GateUpdate => "gate_update",
            Phase::OuterUpdate => "outer_update",
        })
    }
}

/// Per-task, per-epoch loss weights `λ[t][epoch]`
#[derive(Debug, Clone, PartialEq)]
pub struct TaskWeights {
    table: Vec<Vec<f64>>,
}

impl TaskWeights {
    /// Every task weighted 1.0 in every epoch
    pub fn uniform(task_count: usize, total_epochs: usize) -> Self {
        Self::constant(&vec![1.0; task_count], total_epochs)
    }

    /// Fixed per-task weights for every epoch
    pub fn constant(weights: &[f64], total_epochs: usize) -> Self {
        Self {
            table: weights.iter().map(|w| vec![*w; total_epochs]).collect(),
        }
    }

    /// Override one entry
    pub fn set(&mut self, task: usize, epoch: usize, weight: f64) -> Result<()> {
        let slot = self
            .table
            .get_mut(task)
            .and_then(|row| row.get_mut(epoch))
            .ok_or_else(|| {
                Error::invalid_input(format!("no task weight for task {task}, epoch {epoch}"))
            })?;
        *slot = weight;
        Ok(())
    }

    /// Weights of every task for `epoch`
    pub fn for_epoch(&self, epoch: usize) -> Result<Vec<f64>> {
        self.table
            .iter()
            .map(|row| {
                row.get(epoch).copied().ok_or_else(|| {
                    Error::invalid_input(format!("no task weights for epoch {epoch}"))
                })
            })
            .collect()
    }

    /// Number of tasks
    pub fn task_count(&self) -> usize {
        self.table.len()
    }
}

/// `Σ λ_t·L_t` plus the unweighted scalar loss of each task
pub fn weighted_task_loss(
    tasks: &[TaskSpec],
    preds: &[Tensor],
    targets: &[Tensor],
    lambdas: &[f64],
) -> Result<(Tensor, Vec<f64>)> {
    if preds.len() != tasks.len() || targets.len() != tasks.len() || lambdas.len() != tasks.len()
    {
        return Err(Error::invalid_input(
            "predictions, targets and weights must cover every task",
        ));
    }
    let mut total: Option<Tensor> = None;
    let mut per_task = Vec::with_capacity(tasks.len());
    for (t, task) in tasks.iter().enumerate() {
        let loss = task.kind.loss(&preds[t], &targets[t])?;
        per_task.push(loss.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?);
        // Scaled by a tensor product so that λ = 0 keeps the task in the graph
        let lambda = Tensor::new(lambdas[t], loss.device())?.to_dtype(loss.dtype())?;
        let term = loss.mul(&lambda)?;
        total = Some(match total {
            Some(acc) => (acc + term)?,
            None => term,
        });
    }
    let total = total.ok_or_else(|| Error::invalid_input("no tasks to weight"))?;
    Ok((total, per_task))
}

/// Fast weights `w - step·g` for every weight of `store`.
///
/// Gradients are used as they come out of the backward pass: when
/// higher-order gradients are enabled they stay attached to the graph, so the
/// fast weights remain differentiable with respect to anything the loss
/// depended on, the gate included. Weights without a gradient keep their
/// value and are returned as skipped.
pub fn apply_inner_update(
    store: &ParamStore,
    grads: &GradStore,
    step: f64,
) -> Result<(FastWeights, Vec<ParamId>)> {
    let mut fast = FastWeights::new();
    let mut skipped = Vec::new();
    for (id, var) in store.iter() {
        match grads.get(var.as_tensor()) {
            Some(grad) => {
                let updated = var.as_tensor().sub(&grad.affine(step, 0.0)?)?;
                fast.insert(*id, updated);
            }
            None => {
                warn!("{}", Error::gradient_unavailable(id));
                fast.insert(*id, var.as_tensor().clone());
                skipped.push(*id);
            }
        }
    }
    Ok((fast, skipped))
}

/// Result of the inner phase
pub struct InnerStep {
    /// One-step-ahead weights of the clone
    pub fast: FastWeights,
    /// Weights left unchanged for lack of a gradient
    pub skipped: Vec<ParamId>,
    /// Weighted training loss of the clone
    pub loss: f64,
}

/// Result of a full bilevel iteration
#[derive(Debug, Clone)]
pub struct StepReport {
    /// Detached outer-update predictions, one per task
    pub predictions: Vec<Tensor>,
    /// Unweighted outer-update losses, one per task
    pub losses: Vec<f64>,
    /// Weighted validation loss of the fast weights; `None` in joint mode
    pub gate_loss: Option<f64>,
    /// Inner-step weights skipped for lack of a gradient
    pub skipped: usize,
}

/// Training loaders for the three splits
pub struct SplitLoaders {
    /// Inner and outer updates
    pub train: DataLoader,
    /// Gate updates
    pub val: DataLoader,
    /// Per-epoch evaluation
    pub test: DataLoader,
}

impl SplitLoaders {
    /// Synthetic splits described by `config`
    pub fn from_config(config: &ExperimentConfig, device: &Device) -> Result<Self> {
        let make = |split: Split| -> Result<DataLoader> {
            let dataset =
                SyntheticDataset::new(config.synthetic_config(split), config.model.tasks.clone())?;
            DataLoader::new(Arc::new(dataset), config.loader_config(split), device.clone())
        };
        Ok(Self {
            train: make(Split::Train)?,
            val: make(Split::Val)?,
            test: make(Split::Test)?,
        })
    }
}

/// Bilevel trainer owning the live weights, the gate and both optimizers
pub struct BilevelTrainer {
    net: GatedMultiTaskNet,
    weights: ParamStore,
    gate: GateParameters,
    model_optimizer: Adam,
    gate_optimizer: Adam,
    scheduler: StepScheduler,
    task_weights: TaskWeights,
    inner_step_size: f64,
    mode: TrainingMode,
    rng: StdRng,
}

impl BilevelTrainer {
    /// Network with a pooled-projection backbone built from `config`
    pub fn from_config(config: &ExperimentConfig, device: &Device) -> Result<Self> {
        let backbone = PooledProjection::new(config.data.channels, config.model.feature_dim)?;
        let net = GatedMultiTaskNet::new(
            Box::new(backbone),
            config.model.tasks.clone(),
            config.model.hidden_dim,
            config.model.dropout,
        )?;
        Self::new(net, config, device)
    }

    /// Trainer for an existing network structure
    pub fn new(net: GatedMultiTaskNet, config: &ExperimentConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        if net.tasks() != config.model.tasks.as_slice() {
            return Err(Error::config("network tasks differ from the configured tasks"));
        }
        enable_higher_order_gradients();

        let seed = config.training.seed;
        let weights = net.init_weights(seed, device)?;
        let gate = GateParameters::new(
            net.task_count(),
            config.model.gate_version,
            config.model.gumbel_temperature,
            device,
        )?;

        let opt = &config.optimizer;
        let mode = config.training.mode;
        let mut model_params: Vec<(String, Var)> = weights
            .iter()
            .map(|(id, var)| (id.to_string(), var.clone()))
            .collect();
        if mode == TrainingMode::Joint {
            model_params.push((GATE_PARAM_NAME.to_string(), gate.var().clone()));
        }
        let model_optimizer = Adam::new(
            model_params,
            AdamConfig {
                learning_rate: opt.learning_rate,
                beta1: opt.beta1,
                beta2: opt.beta2,
                epsilon: opt.eps,
                weight_decay: opt.weight_decay,
            },
        )?;
        let gate_optimizer = Adam::new(
            vec![(GATE_PARAM_NAME.to_string(), gate.var().clone())],
            AdamConfig {
                learning_rate: opt.gate_learning_rate,
                beta1: opt.beta1,
                beta2: opt.beta2,
                epsilon: opt.eps,
                weight_decay: opt.gate_weight_decay,
            },
        )?;

        let total_epochs = config.training.total_epochs;
        let task_weights = match &config.training.task_weights {
            Some(w) => TaskWeights::constant(w, total_epochs),
            None => TaskWeights::uniform(net.task_count(), total_epochs),
        };

        info!(
            "{} trainer: {} gate, {} tasks, {} weight tensors ({} values)",
            mode,
            gate.version(),
            net.task_count(),
            weights.len(),
            weights.num_elements()
        );

        Ok(Self {
            scheduler: StepScheduler::new(
                opt.learning_rate,
                config.scheduler.step_size,
                config.scheduler.gamma,
            ),
            net,
            weights,
            gate,
            model_optimizer,
            gate_optimizer,
            task_weights,
            inner_step_size: config.bilevel.inner_step_size,
            mode,
            rng: StdRng::seed_from_u64(seed.wrapping_add(NOISE_SEED_OFFSET)),
        })
    }

    /// Network structure
    pub fn net(&self) -> &GatedMultiTaskNet {
        &self.net
    }

    /// Live weights
    pub fn weights(&self) -> &ParamStore {
        &self.weights
    }

    /// Gate parameters
    pub fn gate(&self) -> &GateParameters {
        &self.gate
    }

    /// How the gate is trained
    pub fn mode(&self) -> TrainingMode {
        self.mode
    }

    /// Task loss weights
    pub fn task_weights_mut(&mut self) -> &mut TaskWeights {
        &mut self.task_weights
    }

    /// Current model learning rate
    pub fn learning_rate(&self) -> f64 {
        self.model_optimizer.learning_rate()
    }

    fn report_missing(phase: Phase, outcome: &StepOutcome) {
        for name in &outcome.missing {
            warn!("{} during {}", Error::gradient_unavailable(name), phase);
        }
    }

    /// CLONE: independent copy of the live weights
    pub fn clone_weights(&self) -> Result<ParamStore> {
        let _span = debug_span!("phase", phase = %Phase::Clone).entered();
        self.weights.deep_clone()
    }

    /// INNER_GRAD: differentiable one-step update of `clone` on the training
    /// batch. Touches neither the live weights nor the gate.
    pub fn inner_step(
        &mut self,
        clone: &ParamStore,
        batch: &MultiTaskBatch,
        epoch: usize,
    ) -> Result<InnerStep> {
        let _span = debug_span!("phase", phase = %Phase::InnerGrad).entered();
        let lambdas = self.task_weights.for_epoch(epoch)?;
        let preds = self.net.forward(
            clone,
            &self.gate,
            &batch.images,
            &mut ForwardContext::training(&mut self.rng),
        )?;
        let (loss, _) = weighted_task_loss(self.net.tasks(), &preds, &batch.targets, &lambdas)?;
        let grads = loss.backward()?;
        let (fast, skipped) = apply_inner_update(clone, &grads, self.inner_step_size)?;
        let loss = loss.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        debug!("inner loss {:.6}, {} weights skipped", loss, skipped.len());
        Ok(InnerStep {
            fast,
            skipped,
            loss,
        })
    }

    /// GATE_UPDATE: step the gate on the validation loss of the fast weights
    pub fn gate_step(
        &mut self,
        fast: &FastWeights,
        batch: &MultiTaskBatch,
        epoch: usize,
    ) -> Result<f64> {
        let _span = debug_span!("phase", phase = %Phase::GateUpdate).entered();
        let lambdas = self.task_weights.for_epoch(epoch)?;
        let preds = self.net.forward(
            fast,
            &self.gate,
            &batch.images,
            &mut ForwardContext::training(&mut self.rng),
        )?;
        let (loss, _) = weighted_task_loss(self.net.tasks(), &preds, &batch.targets, &lambdas)?;
        let grads = loss.backward()?;
        let outcome = self.gate_optimizer.step(&grads)?;
        Self::report_missing(Phase::GateUpdate, &outcome);
        let loss = loss.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?;
        debug!("gate loss {:.6}", loss);
        Ok(loss)
    }

    /// OUTER_UPDATE: step the live weights with the current gate. Returns the
    /// detached predictions and per-task losses.
    pub fn outer_step(
        &mut self,
        batch: &MultiTaskBatch,
        epoch: usize,
    ) -> Result<(Vec<Tensor>, Vec<f64>)> {
        let _span = debug_span!("phase", phase = %Phase::OuterUpdate).entered();
        let lambdas = self.task_weights.for_epoch(epoch)?;
        let preds = self.net.forward(
            &self.weights,
            &self.gate,
            &batch.images,
            &mut ForwardContext::training(&mut self.rng),
        )?;
        let (loss, per_task) =
            weighted_task_loss(self.net.tasks(), &preds, &batch.targets, &lambdas)?;
        let grads = loss.backward()?;
        let outcome = self.model_optimizer.step(&grads)?;
        Self::report_missing(Phase::OuterUpdate, &outcome);
        let preds = preds.iter().map(Tensor::detach).collect();
        Ok((preds, per_task))
    }

    /// One training iteration. In joint mode `val` is ignored.
    pub fn train_step(
        &mut self,
        train: &MultiTaskBatch,
        val: &MultiTaskBatch,
        epoch: usize,
    ) -> Result<StepReport> {
        if self.mode == TrainingMode::Joint {
            return self.joint_step(train, epoch);
        }
        let clone = self.clone_weights()?;
        let inner = self.inner_step(&clone, train, epoch)?;
        let gate_loss = self.gate_step(&inner.fast, val, epoch)?;
        let skipped = inner.skipped.len();
        drop(inner);
        drop(clone);
        let (predictions, losses) = self.outer_step(train, epoch)?;
        Ok(StepReport {
            predictions,
            losses,
            gate_loss: Some(gate_loss),
            skipped,
        })
    }

    /// Single-level iteration: weights and gate share one optimizer step on
    /// the training loss
    pub fn joint_step(&mut self, train: &MultiTaskBatch, epoch: usize) -> Result<StepReport> {
        if self.mode != TrainingMode::Joint {
            return Err(Error::config(
                "joint step needs the gate registered with the model optimizer",
            ));
        }
        // outer_step steps the model optimizer, which owns the gate here
        let (predictions, losses) = self.outer_step(train, epoch)?;
        Ok(StepReport {
            predictions,
            losses,
            gate_loss: None,
            skipped: 0,
        })
    }

    /// Train on `min(train, val)` batch pairs, or on every training batch in
    /// joint mode. Returns the training summary (from outer-update
    /// predictions) and the number of skipped inner weights.
    #[instrument(skip(self, train, val))]
    pub async fn train_epoch(
        &mut self,
        epoch: usize,
        train: &DataLoader,
        val: &DataLoader,
    ) -> Result<(SplitSummary, usize)> {
        let (iterations, mut val_stream) = match self.mode {
            TrainingMode::Bilevel => (
                train.num_batches().min(val.num_batches()),
                Some(val.epoch_stream(epoch)),
            ),
            TrainingMode::Joint => (train.num_batches(), None),
        };
        let mut train_stream = train.epoch_stream(epoch);
        let mut metrics = SplitMetrics::new(self.net.tasks());
        let mut skipped = 0;

        for _ in 0..iterations {
            let Some(train_batch) = train_stream.next_batch().await else {
                break;
            };
            let train_batch = train_batch?;
            let step = match val_stream.as_mut() {
                Some(stream) => {
                    let Some(val_batch) = stream.next_batch().await else {
                        break;
                    };
                    self.train_step(&train_batch, &val_batch?, epoch)?
                }
                None => self.joint_step(&train_batch, epoch)?,
            };
            metrics.update(&step.predictions, &train_batch.targets, &step.losses)?;
            skipped += step.skipped;
        }
        Ok((metrics.finish(), skipped))
    }

    /// Loss and metrics of [`GatedMultiTaskNet::predict`] over a split
    #[instrument(skip(self, loader))]
    pub async fn evaluate(&self, loader: &DataLoader, epoch: usize) -> Result<SplitSummary> {
        let mut stream = loader.epoch_stream(epoch);
        let mut metrics = SplitMetrics::new(self.net.tasks());
        while let Some(batch) = stream.next_batch().await {
            let batch = batch?;
            let preds: Vec<Tensor> = self
                .net
                .predict(&self.weights, &self.gate, &batch.images)?
                .iter()
                .map(Tensor::detach)
                .collect();
            let losses = self
                .net
                .tasks()
                .iter()
                .zip(preds.iter().zip(&batch.targets))
                .map(|(task, (pred, target))| {
                    let loss = task.kind.loss(pred, target)?;
                    Ok(loss.to_dtype(candle_core::DType::F64)?.to_scalar::<f64>()?)
                })
                .collect::<Result<Vec<f64>>>()?;
            metrics.update(&preds, &batch.targets, &losses)?;
        }
        Ok(metrics.finish())
    }

    /// Run `total_epochs` epochs, printing the report and collecting history
    pub async fn fit<W: Write>(
        &mut self,
        loaders: &SplitLoaders,
        total_epochs: usize,
        report: &mut ConsoleReport<W>,
    ) -> Result<TrainingHistory> {
        info!("Starting {} training for {} epochs", self.mode, total_epochs);
        report.write_header(self.net.tasks())?;
        let mut history = TrainingHistory::default();

        for epoch in 0..total_epochs {
            let start = Instant::now();
            let learning_rate = self.learning_rate();
            let (train, skipped_gradients) =
                self.train_epoch(epoch, &loaders.train, &loaders.val).await?;
            let test = self.evaluate(&loaders.test, epoch).await?;

            self.scheduler.step();
            self.model_optimizer.set_learning_rate(self.scheduler.get_lr());

            let record = EpochRecord {
                epoch,
                timestamp: Utc::now(),
                learning_rate,
                train,
                test,
                gate_version: self.gate.version(),
                gates: self.gate.readings()?,
                gate_report: gate_lines(&self.gate)?,
                skipped_gradients,
                elapsed_secs: start.elapsed().as_secs_f64(),
            };
            report.write_epoch(&record)?;
            info!(
                "Epoch {}/{} completed in {:.2}s (lr {:.2e})",
                epoch + 1,
                total_epochs,
                record.elapsed_secs,
                learning_rate
            );
            history.push(record);
        }
        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Dataset;
    use crate::gate::GateVersion;
    use crate::model::{Branch, WeightLookup};
    use approx::assert_relative_eq;

    fn small_config(version: GateVersion) -> ExperimentConfig {
        let mut config = ExperimentConfig::default();
        config.model.gate_version = version;
        config.model.feature_dim = 6;
        config.model.hidden_dim = 5;
        config.model.dropout = 0.0;
        config.optimizer.learning_rate = 1e-2;
        config.optimizer.gate_learning_rate = 1e-2;
        config.bilevel.inner_step_size = 1e-1;
        config.training.total_epochs = 2;
        config.training.seed = 17;
        config.data.height = 4;
        config.data.width = 4;
        config
    }

    fn batch(config: &ExperimentConfig, split: Split, indices: &[usize]) -> MultiTaskBatch {
        let dataset =
            SyntheticDataset::new(config.synthetic_config(split), config.model.tasks.clone())
                .unwrap();
        let samples = indices.iter().map(|i| dataset.get(*i).unwrap()).collect();
        MultiTaskBatch::collate(
            samples,
            indices.to_vec(),
            dataset.image_shape(),
            dataset.tasks(),
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_task_weights() {
        let mut weights = TaskWeights::uniform(3, 2);
        assert_eq!(weights.for_epoch(1).unwrap(), vec![1.0; 3]);
        weights.set(2, 1, 0.25).unwrap();
        assert_eq!(weights.for_epoch(1).unwrap(), vec![1.0, 1.0, 0.25]);
        assert!(weights.for_epoch(2).is_err());
        assert!(weights.set(3, 0, 1.0).is_err());
    }

    #[test]
    fn test_weighted_task_loss() {
        let device = Device::Cpu;
        let tasks = vec![TaskSpec::regression("a", 1), TaskSpec::regression("b", 1)];
        let preds = vec![
            Tensor::new(&[[2.0f32]], &device).unwrap(),
            Tensor::new(&[[5.0f32]], &device).unwrap(),
        ];
        let targets = vec![
            Tensor::new(&[[1.0f32]], &device).unwrap(),
            Tensor::new(&[[1.0f32]], &device).unwrap(),
        ];
        let (total, per_task) = weighted_task_loss(&tasks, &preds, &targets, &[2.0, 0.5]).unwrap();
        assert_eq!(per_task, vec![1.0, 4.0]);
        assert_relative_eq!(total.to_scalar::<f32>().unwrap(), 4.0);
    }

    #[test]
    fn test_zero_weighted_task_keeps_gradient_path() {
        let device = Device::Cpu;
        let tasks = vec![TaskSpec::regression("a", 1), TaskSpec::regression("b", 1)];
        let muted = Var::new(&[[2.0f32]], &device).unwrap();
        let preds = vec![
            muted.as_tensor().clone(),
            Tensor::new(&[[5.0f32]], &device).unwrap(),
        ];
        let targets = vec![
            Tensor::new(&[[1.0f32]], &device).unwrap(),
            Tensor::new(&[[1.0f32]], &device).unwrap(),
        ];
        let (total, per_task) = weighted_task_loss(&tasks, &preds, &targets, &[0.0, 1.0]).unwrap();
        assert_eq!(per_task, vec![1.0, 4.0]);
        assert_relative_eq!(total.to_scalar::<f32>().unwrap(), 4.0);

        let grads = total.backward().unwrap();
        let grad = grads.get(muted.as_tensor()).unwrap();
        assert_eq!(grad.to_vec2::<f32>().unwrap(), vec![vec![0.0]]);
    }

    #[test]
    fn test_zero_task_weight_skips_no_inner_weight() {
        let config = small_config(GateVersion::V1);
        let mut trainer = BilevelTrainer::from_config(&config, &Device::Cpu).unwrap();
        trainer.task_weights_mut().set(0, 0, 0.0).unwrap();
        let train = batch(&config, Split::Train, &[0, 1]);

        let clone = trainer.clone_weights().unwrap();
        let inner = trainer.inner_step(&clone, &train, 0).unwrap();
        assert!(inner.skipped.is_empty());

        // the muted task's head has a zero gradient, so its fast weight is unchanged
        let id = ParamId::Classifier(0);
        let before = clone.var(id).unwrap().as_tensor().to_vec2::<f32>().unwrap();
        let after = inner.fast.weight(id).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(before, after);
        let moved = inner.fast.weight(ParamId::Classifier(1)).unwrap().to_vec2::<f32>().unwrap();
        assert_ne!(
            moved,
            clone.var(ParamId::Classifier(1)).unwrap().as_tensor().to_vec2::<f32>().unwrap()
        );
    }

    #[test]
    fn test_inner_update_skips_weights_without_gradient() {
        let device = Device::Cpu;
        let mut store = ParamStore::new();
        let used = ParamId::Classifier(0);
        let unused = ParamId::Classifier(1);
        store.insert(used, &Tensor::new(&[1.0f32, 2.0], &device).unwrap()).unwrap();
        store.insert(unused, &Tensor::new(&[7.0f32], &device).unwrap()).unwrap();

        let loss = store.var(used).unwrap().as_tensor().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        let (fast, skipped) = apply_inner_update(&store, &grads, 0.1).unwrap();

        assert_eq!(skipped, vec![unused]);
        let updated = fast.weight(used).unwrap().to_vec1::<f32>().unwrap();
        assert_relative_eq!(updated[0], 0.8, epsilon = 1e-6);
        assert_relative_eq!(updated[1], 1.6, epsilon = 1e-6);
        assert_eq!(fast.weight(unused).unwrap().to_vec1::<f32>().unwrap(), vec![7.0]);
    }

    #[test]
    fn test_fast_weights_are_differentiable_wrt_gate() {
        enable_higher_order_gradients();
        let device = Device::Cpu;
        let mut store = ParamStore::new();
        let id = ParamId::HiddenBias(Branch::Shared);
        store.insert(id, &Tensor::new(&[1.0f32], &device).unwrap()).unwrap();
        let gate = Var::new(&[2.0f32], &device).unwrap();

        // inner loss (x·h)^2, so ∇x = 2·x·h² and d(fast)/dh = -step·4·x·h
        let x = store.var(id).unwrap().as_tensor();
        let inner = x.mul(gate.as_tensor()).unwrap().sqr().unwrap().sum_all().unwrap();
        let grads = inner.backward().unwrap();
        let (fast, _) = apply_inner_update(&store, &grads, 0.1).unwrap();

        let outer = fast.weight(id).unwrap().sum_all().unwrap();
        let meta = outer.backward().unwrap();
        let dh = meta.get(gate.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert_relative_eq!(dh[0], -0.8, epsilon = 1e-5);
    }

    #[test]
    fn test_phases_touch_only_their_parameters() {
        let config = small_config(GateVersion::V1);
        let mut trainer = BilevelTrainer::from_config(&config, &Device::Cpu).unwrap();
        let train = batch(&config, Split::Train, &[0, 1]);
        let val = batch(&config, Split::Val, &[0, 1]);

        let weights0 = trainer.weights().snapshot().unwrap();
        let gate0 = trainer.gate().snapshot().unwrap();

        let clone = trainer.clone_weights().unwrap();
        assert_eq!(clone.snapshot().unwrap(), weights0);

        let inner = trainer.inner_step(&clone, &train, 0).unwrap();
        assert!(inner.skipped.is_empty());
        assert_eq!(inner.fast.len(), clone.len());
        assert_eq!(trainer.weights().snapshot().unwrap(), weights0);
        assert_eq!(trainer.gate().snapshot().unwrap(), gate0);

        trainer.gate_step(&inner.fast, &val, 0).unwrap();
        let gate1 = trainer.gate().snapshot().unwrap();
        assert_ne!(gate1, gate0);
        assert_eq!(trainer.weights().snapshot().unwrap(), weights0);
        assert_eq!(clone.snapshot().unwrap(), weights0);

        trainer.outer_step(&train, 0).unwrap();
        assert_ne!(trainer.weights().snapshot().unwrap(), weights0);
        assert_eq!(trainer.gate().snapshot().unwrap(), gate1);
    }

    #[test]
    fn test_train_step_is_deterministic() {
        for version in [GateVersion::V1, GateVersion::V2, GateVersion::V3] {
            let mut config = small_config(version);
            config.model.dropout = 0.3;
            let train = batch(&config, Split::Train, &[0, 1, 2]);
            let val = batch(&config, Split::Val, &[3, 4, 5]);

            let run = || {
                let mut trainer = BilevelTrainer::from_config(&config, &Device::Cpu).unwrap();
                for _ in 0..2 {
                    trainer.train_step(&train, &val, 0).unwrap();
                }
                (
                    trainer.weights().snapshot().unwrap(),
                    trainer.gate().snapshot().unwrap(),
                )
            };
            assert_eq!(run(), run(), "gate {version}");
        }
    }

    #[test]
    fn test_v3_predict_uses_hard_gate() {
        let config = small_config(GateVersion::V3);
        let mut trainer = BilevelTrainer::from_config(&config, &Device::Cpu).unwrap();
        let train = batch(&config, Split::Train, &[0, 1]);
        let val = batch(&config, Split::Val, &[0, 1]);
        trainer.train_step(&train, &val, 0).unwrap();
        for t in 0..trainer.net().task_count() {
            let (shared, specific) = trainer.gate().mixing_weights(t).unwrap();
            assert_eq!(shared + specific, 1.0);
            assert!(shared == 0.0 || shared == 1.0);
        }
    }

    #[test]
    fn test_joint_step_moves_weights_and_gate_together() {
        let mut config = small_config(GateVersion::V2);
        config.training.mode = TrainingMode::Joint;
        let mut trainer = BilevelTrainer::from_config(&config, &Device::Cpu).unwrap();
        assert_eq!(trainer.mode(), TrainingMode::Joint);
        assert_eq!(
            trainer.model_optimizer.parameter_count(),
            trainer.weights().len() + 1
        );
        let train = batch(&config, Split::Train, &[0, 1]);
        let val = batch(&config, Split::Val, &[0, 1]);

        let weights0 = trainer.weights().snapshot().unwrap();
        let gate0 = trainer.gate().snapshot().unwrap();
        let report = trainer.train_step(&train, &val, 0).unwrap();

        assert_eq!(report.gate_loss, None);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.losses.len(), 3);
        assert_ne!(trainer.weights().snapshot().unwrap(), weights0);
        assert_ne!(trainer.gate().snapshot().unwrap(), gate0);
        assert_eq!(trainer.gate_optimizer.step_count(), 0);
        assert_eq!(trainer.model_optimizer.step_count(), 1);
    }

    #[test]
    fn test_joint_step_rejected_in_bilevel_mode() {
        let config = small_config(GateVersion::V1);
        let mut trainer = BilevelTrainer::from_config(&config, &Device::Cpu).unwrap();
        let train = batch(&config, Split::Train, &[0, 1]);
        let gate0 = trainer.gate().snapshot().unwrap();
        assert!(matches!(trainer.joint_step(&train, 0), Err(Error::Config(_))));
        assert_eq!(trainer.gate().snapshot().unwrap(), gate0);
        assert_eq!(
            trainer.model_optimizer.parameter_count(),
            trainer.weights().len()
        );
    }

    #[tokio::test]
    async fn test_joint_epoch_uses_every_training_batch() {
        let mut config = small_config(GateVersion::V1);
        config.training.mode = TrainingMode::Joint;
        config.data.train_samples = 6;
        config.data.val_samples = 2;
        config.data.test_samples = 2;
        config.training.batch_size = Some(2);
        let device = Device::Cpu;
        let loaders = SplitLoaders::from_config(&config, &device).unwrap();
        let mut trainer = BilevelTrainer::from_config(&config, &device).unwrap();

        let (summary, skipped) = trainer
            .train_epoch(0, &loaders.train, &loaders.val)
            .await
            .unwrap();
        assert_eq!(summary.batches, 3);
        assert_eq!(skipped, 0);
        assert_eq!(trainer.gate_optimizer.step_count(), 0);
    }

    #[test]
    fn test_constructor_rejects_bad_config() {
        let mut config = small_config(GateVersion::V1);
        config.training.task_weights = Some(vec![1.0, 2.0]);
        assert!(BilevelTrainer::from_config(&config, &Device::Cpu).is_err());

        let config = small_config(GateVersion::V1);
        let net = GatedMultiTaskNet::new(
            Box::new(PooledProjection::new(3, 6).unwrap()),
            vec![TaskSpec::regression("depth", 1)],
            5,
            0.0,
        )
        .unwrap();
        assert!(BilevelTrainer::new(net, &config, &Device::Cpu).is_err());
    }

    #[tokio::test]
    async fn test_epoch_runs_min_of_train_and_val_batches() {
        let mut config = small_config(GateVersion::V2);
        config.data.train_samples = 6;
        config.data.val_samples = 4;
        config.data.test_samples = 3;
        config.training.batch_size = Some(2);
        let device = Device::Cpu;
        let loaders = SplitLoaders::from_config(&config, &device).unwrap();
        let mut trainer = BilevelTrainer::from_config(&config, &device).unwrap();

        let (summary, skipped) = trainer
            .train_epoch(0, &loaders.train, &loaders.val)
            .await
            .unwrap();
        assert_eq!(summary.batches, 2);
        assert_eq!(skipped, 0);
        assert_eq!(summary.tasks.len(), 3);

        let test = trainer.evaluate(&loaders.test, 0).await.unwrap();
        assert_eq!(test.batches, 2);
    }
}
