//! Task quality metrics accumulated over an epoch split
//!
//! Classification tasks accumulate a confusion matrix over the whole split and
//! report mean IoU and pixel accuracy. Regression and surface-normal tasks
//! compute their statistics per batch and report the batch average.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tasks::{normalize_rows, TaskKind, TaskSpec};
use crate::utils::math::argmax;

/// Confusion matrix indexed `[target][prediction]`
#[derive(Debug, Clone)]
pub struct ConfusionMatrix {
    num_classes: usize,
    counts: Vec<u64>,
}

impl ConfusionMatrix {
    /// Empty matrix for `num_classes` classes
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            counts: vec![0; num_classes * num_classes],
        }
    }

    /// Count predictions; targets below zero are ignored
    pub fn update(&mut self, predictions: &[usize], targets: &[i64]) -> Result<()> {
        if predictions.len() != targets.len() {
            return Err(Error::invalid_input(format!(
                "{} predictions for {} targets",
                predictions.len(),
                targets.len()
            )));
        }
        for (&pred, &target) in predictions.iter().zip(targets) {
            if target < 0 {
                continue;
            }
            let target = target as usize;
            if target >= self.num_classes || pred >= self.num_classes {
                return Err(Error::invalid_input(format!(
                    "class index out of range for {} classes",
                    self.num_classes
                )));
            }
            self.counts[target * self.num_classes + pred] += 1;
        }
        Ok(())
    }

    /// `(mean IoU, pixel accuracy)`; classes never seen nor predicted are
    /// left out of the IoU mean
    pub fn miou_and_accuracy(&self) -> (f64, f64) {
        let n = self.num_classes;
        let total: u64 = self.counts.iter().sum();
        if total == 0 {
            return (0.0, 0.0);
        }
        let diag: Vec<u64> = (0..n).map(|c| self.counts[c * n + c]).collect();
        let accuracy = diag.iter().sum::<u64>() as f64 / total as f64;

        let mut iou_sum = 0.0;
        let mut classes = 0usize;
        for c in 0..n {
            let row: u64 = (0..n).map(|p| self.counts[c * n + p]).sum();
            let col: u64 = (0..n).map(|t| self.counts[t * n + c]).sum();
            let union = row + col - diag[c];
            if union > 0 {
                iou_sum += diag[c] as f64 / union as f64;
                classes += 1;
            }
        }
        let miou = if classes > 0 { iou_sum / classes as f64 } else { 0.0 };
        (miou, accuracy)
    }
}

/// Mean absolute and relative error per element, over rows with a non-zero
/// target
pub fn depth_error(pred: &[Vec<f32>], target: &[Vec<f32>]) -> (f64, f64) {
    let mut abs_sum = 0.0f64;
    let mut rel_sum = 0.0f64;
    let mut count = 0usize;
    for (p, t) in pred.iter().zip(target) {
        if t.iter().all(|v| *v == 0.0) {
            continue;
        }
        for (pv, tv) in p.iter().zip(t) {
            let abs = (pv - tv).abs() as f64;
            abs_sum += abs;
            if *tv != 0.0 {
                rel_sum += abs / tv.abs() as f64;
            }
            count += 1;
        }
    }
    if count == 0 {
        return (0.0, 0.0);
    }
    (abs_sum / count as f64, rel_sum / count as f64)
}

/// Angular error statistics of predicted normals, in degrees
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct NormalError {
    /// Mean angle
    pub mean: f64,
    /// Median angle
    pub median: f64,
    /// Fraction of angles below 11.25°
    pub within_11_25: f64,
    /// Fraction of angles below 22.5°
    pub within_22_5: f64,
    /// Fraction of angles below 30°
    pub within_30: f64,
}

/// Angle between unit predictions and targets over rows with a non-zero target
pub fn normal_error(pred_unit: &[Vec<f32>], target: &[Vec<f32>]) -> NormalError {
    let mut angles: Vec<f64> = pred_unit
        .iter()
        .zip(target)
        .filter(|(_, t)| t.iter().any(|v| *v != 0.0))
        .map(|(p, t)| {
            let dot: f32 = p.iter().zip(t).map(|(a, b)| a * b).sum();
            (dot.clamp(-1.0, 1.0) as f64).acos().to_degrees()
        })
        .collect();
    if angles.is_empty() {
        return NormalError::default();
    }
    angles.sort_by(|a, b| a.total_cmp(b));

    let n = angles.len();
    let median = if n % 2 == 1 {
        angles[n / 2]
    } else {
        (angles[n / 2 - 1] + angles[n / 2]) / 2.0
    };
    let within = |limit: f64| angles.iter().filter(|a| **a < limit).count() as f64 / n as f64;
    NormalError {
        mean: angles.iter().sum::<f64>() / n as f64,
        median,
        within_11_25: within(11.25),
        within_22_5: within(22.5),
        within_30: within(30.0),
    }
}

/// Final loss and metric values of one task over a split
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    /// Task name
    pub task: String,
    /// Mean loss over batches
    pub loss: f64,
    /// Metric values in report order
    pub metrics: Vec<f64>,
}

impl TaskSummary {
    /// Loss followed by metrics, as printed
    pub fn fields(&self) -> Vec<f64> {
        std::iter::once(self.loss)
            .chain(self.metrics.iter().copied())
            .collect()
    }
}

/// Per-task summaries of one split (train or test) of an epoch
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SplitSummary {
    /// One entry per task, in task order
    pub tasks: Vec<TaskSummary>,
    /// Number of batches accumulated
    pub batches: usize,
}

#[derive(Debug, Clone)]
enum MetricState {
    Classification(ConfusionMatrix),
    Regression { abs: f64, rel: f64 },
    Normal(NormalError),
}

/// Running loss and metric state of one task
#[derive(Debug, Clone)]
pub struct TaskMetricAccumulator {
    name: String,
    loss_sum: f64,
    batches: usize,
    state: MetricState,
}

impl TaskMetricAccumulator {
    /// Fresh accumulator for a task
    pub fn new(task: &TaskSpec) -> Self {
        let state = match task.kind {
            TaskKind::Classification { num_classes } => {
                MetricState::Classification(ConfusionMatrix::new(num_classes))
            }
            TaskKind::Regression { .. } => MetricState::Regression { abs: 0.0, rel: 0.0 },
            TaskKind::SurfaceNormal => MetricState::Normal(NormalError::default()),
        };
        Self {
            name: task.name.clone(),
            loss_sum: 0.0,
            batches: 0,
            state,
        }
    }

    /// Add one batch of predictions
    pub fn update(&mut self, pred: &Tensor, target: &Tensor, loss: f64) -> Result<()> {
        self.loss_sum += loss;
        self.batches += 1;
        match &mut self.state {
            MetricState::Classification(matrix) => {
                let rows = pred.to_dtype(DType::F32)?.to_vec2::<f32>()?;
                let predictions: Vec<usize> = rows.iter().map(|r| argmax(r)).collect();
                let targets = target.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
                matrix.update(&predictions, &targets)?;
            }
            MetricState::Regression { abs, rel } => {
                let p = pred.to_dtype(DType::F32)?.to_vec2::<f32>()?;
                let t = target.to_dtype(DType::F32)?.to_vec2::<f32>()?;
                let (a, r) = depth_error(&p, &t);
                *abs += a;
                *rel += r;
            }
            MetricState::Normal(sum) => {
                let p = normalize_rows(&pred.to_dtype(DType::F32)?)?.to_vec2::<f32>()?;
                let t = target.to_dtype(DType::F32)?.to_vec2::<f32>()?;
                let e = normal_error(&p, &t);
                sum.mean += e.mean;
                sum.median += e.median;
                sum.within_11_25 += e.within_11_25;
                sum.within_22_5 += e.within_22_5;
                sum.within_30 += e.within_30;
            }
        }
        Ok(())
    }

    /// Averages over the accumulated batches
    pub fn summary(&self) -> TaskSummary {
        let n = self.batches.max(1) as f64;
        let metrics = match &self.state {
            MetricState::Classification(matrix) => {
                let (miou, acc) = matrix.miou_and_accuracy();
                vec![miou, acc]
            }
            MetricState::Regression { abs, rel } => vec![abs / n, rel / n],
            MetricState::Normal(sum) => vec![
                sum.mean / n,
                sum.median / n,
                sum.within_11_25 / n,
                sum.within_22_5 / n,
                sum.within_30 / n,
            ],
        };
        TaskSummary {
            task: self.name.clone(),
            loss: self.loss_sum / n,
            metrics,
        }
    }
}

/// Accumulators for every task of a split
#[derive(Debug, Clone)]
pub struct SplitMetrics {
    tasks: Vec<TaskMetricAccumulator>,
    batches: usize,
}

impl SplitMetrics {
    /// Fresh accumulators for a task list
    pub fn new(tasks: &[TaskSpec]) -> Self {
        Self {
            tasks: tasks.iter().map(TaskMetricAccumulator::new).collect(),
            batches: 0,
        }
    }

    /// Add one batch: predictions, targets and scalar losses in task order
    pub fn update(&mut self, preds: &[Tensor], targets: &[Tensor], losses: &[f64]) -> Result<()> {
        if preds.len() != self.tasks.len()
            || targets.len() != self.tasks.len()
            || losses.len() != self.tasks.len()
        {
            return Err(Error::invalid_input("metric update does not cover every task"));
        }
        for (i, acc) in self.tasks.iter_mut().enumerate() {
            acc.update(&preds[i], &targets[i], losses[i])?;
        }
        self.batches += 1;
        Ok(())
    }

    /// Summaries for every task
    pub fn finish(&self) -> SplitSummary {
        SplitSummary {
            tasks: self.tasks.iter().map(TaskMetricAccumulator::summary).collect(),
            batches: self.batches,
        }
    }
}
