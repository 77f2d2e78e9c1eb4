//! Task definitions and their loss functions
//!
//! Tasks are identified by their position in the configured task list. Each
//! task kind knows its output width, its loss, and the labels of the quality
//! metrics reported for it.

use candle_core::{DType, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Kind of prediction a task makes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Categorical labels (`i64`, `-1` = ignore), cross-entropy loss
    Classification {
        /// Number of classes
        num_classes: usize,
    },
    /// Continuous targets, masked L1 loss; all-zero rows are treated as missing
    Regression {
        /// Target width
        dim: usize,
    },
    /// Unit 3-vectors, masked cosine loss; all-zero rows are treated as missing
    SurfaceNormal,
}

impl TaskKind {
    /// Width of the task's logits
    pub fn output_dim(&self) -> usize {
        match self {
            TaskKind::Classification { num_classes } => *num_classes,
            TaskKind::Regression { dim } => *dim,
            TaskKind::SurfaceNormal => 3,
        }
    }

    /// Labels of the quality metrics, in report order
    pub fn metric_labels(&self) -> &'static [&'static str] {
        match self {
            TaskKind::Classification { .. } => &["MEAN_IOU", "PIX_ACC"],
            TaskKind::Regression { .. } => &["ABS_ERR", "REL_ERR"],
            TaskKind::SurfaceNormal => &["MEAN", "MED", "<11.25", "<22.5", "<30"],
        }
    }

    /// Scalar loss for a batch of predictions
    pub fn loss(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
        match self {
            TaskKind::Classification { num_classes } => cross_entropy(pred, target, *num_classes),
            TaskKind::Regression { .. } => masked_l1(pred, target),
            TaskKind::SurfaceNormal => cosine_loss(pred, target),
        }
    }
}

/// A named task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Task name, upper-cased in the console report
    pub name: String,
    /// Prediction kind
    pub kind: TaskKind,
}

impl TaskSpec {
    /// Classification task
    pub fn classification(name: impl Into<String>, num_classes: usize) -> Self {
        Self {
            name: name.into(),
            kind: TaskKind::Classification { num_classes },
        }
    }

    /// Regression task
    pub fn regression(name: impl Into<String>, dim: usize) -> Self {
        Self {
            name: name.into(),
            kind: TaskKind::Regression { dim },
        }
    }

    /// Surface-normal task
    pub fn surface_normal(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: TaskKind::SurfaceNormal,
        }
    }

    /// Width of the task's logits
    pub fn output_dim(&self) -> usize {
        self.kind.output_dim()
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("task name must not be empty"));
        }
        match self.kind {
            TaskKind::Classification { num_classes } if num_classes < 2 => Err(Error::config(
                format!("task `{}` needs at least 2 classes", self.name),
            )),
            TaskKind::Regression { dim } if dim == 0 => Err(Error::config(format!(
                "task `{}` needs a positive target width",
                self.name
            ))),
            _ => Ok(()),
        }
    }
}

/// Scene-understanding task set: semantic segmentation, depth, surface normal
pub fn scene_tasks() -> Vec<TaskSpec> {
    vec![
        TaskSpec::classification("semantic", 13),
        TaskSpec::regression("depth", 1),
        TaskSpec::surface_normal("normal"),
    ]
}

/// Validate a task list
pub fn validate_tasks(tasks: &[TaskSpec]) -> Result<()> {
    if tasks.is_empty() {
        return Err(Error::config("at least one task is required"));
    }
    for (i, task) in tasks.iter().enumerate() {
        task.validate()?;
        if tasks[..i].iter().any(|t| t.name == task.name) {
            return Err(Error::config(format!("duplicate task name `{}`", task.name)));
        }
    }
    Ok(())
}

fn check_rows(pred: &Tensor, target_rows: usize) -> Result<usize> {
    let (rows, _) = pred.dims2()?;
    if rows != target_rows {
        return Err(Error::invalid_input(format!(
            "prediction has {rows} rows but target has {target_rows}"
        )));
    }
    Ok(rows)
}

/// Row mask (1.0 where any target component is non-zero) and its count
fn valid_rows(target: &Tensor) -> Result<(Vec<f32>, usize)> {
    let rows = target.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    let mask: Vec<f32> = rows
        .iter()
        .map(|r| if r.iter().any(|v| *v != 0.0) { 1.0 } else { 0.0 })
        .collect();
    let count = mask.iter().filter(|m| **m > 0.0).count();
    Ok((mask, count))
}

/// Loss that is zero but still connected to `pred`, used when a batch has no
/// valid targets so every weight keeps a (zero) gradient.
///
/// The product with a zero tensor is kept in the graph, while `affine(0, _)`
/// is pruned by backprop and would leave the weights without gradients.
fn zero_loss(pred: &Tensor) -> Result<Tensor> {
    let sum = pred.sum_all()?;
    Ok(sum.mul(&sum.zeros_like()?)?)
}

/// Mean cross-entropy over labels that are not `-1`
pub fn cross_entropy(logits: &Tensor, labels: &Tensor, num_classes: usize) -> Result<Tensor> {
    let labels = labels.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
    let batch = check_rows(logits, labels.len())?;
    if logits.dim(1)? != num_classes {
        return Err(Error::invalid_input(format!(
            "expected {num_classes} logits per row, got {}",
            logits.dim(1)?
        )));
    }

    let mut one_hot = vec![0f32; batch * num_classes];
    let mut valid = 0usize;
    for (row, &label) in labels.iter().enumerate() {
        if label < 0 {
            continue;
        }
        let label = label as usize;
        if label >= num_classes {
            return Err(Error::invalid_input(format!(
                "label {label} out of range for {num_classes} classes"
            )));
        }
        one_hot[row * num_classes + label] = 1.0;
        valid += 1;
    }
    if valid == 0 {
        return zero_loss(logits);
    }

    let target = Tensor::from_vec(one_hot, (batch, num_classes), logits.device())?;
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    Ok((target * log_probs)?
        .sum_all()?
        .affine(-1.0 / valid as f64, 0.0)?)
}

/// Mean absolute error over rows with a non-zero target
pub fn masked_l1(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let (mask, count) = valid_rows(target)?;
    check_rows(pred, mask.len())?;
    if count == 0 {
        return zero_loss(pred);
    }
    let rows = mask.len();
    let mask = Tensor::from_vec(mask, (rows, 1), pred.device())?;
    let diff = pred.sub(&target.to_dtype(pred.dtype())?)?.abs()?;
    Ok(diff
        .broadcast_mul(&mask)?
        .sum_all()?
        .affine(1.0 / count as f64, 0.0)?)
}

/// `1 - mean cosine similarity` over rows with a non-zero target
pub fn cosine_loss(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let (mask, count) = valid_rows(target)?;
    check_rows(pred, mask.len())?;
    if count == 0 {
        return zero_loss(pred);
    }
    let rows = mask.len();
    let mask = Tensor::from_vec(mask, (rows, 1), pred.device())?;
    let unit = normalize_rows(pred)?;
    let dot = (unit * target.to_dtype(pred.dtype())?)?.broadcast_mul(&mask)?;
    Ok(dot.sum_all()?.affine(-1.0 / count as f64, 1.0)?)
}

/// L2-normalize every row
pub fn normalize_rows(xs: &Tensor) -> Result<Tensor> {
    let norm = (xs.sqr()?.sum_keepdim(1)? + 1e-12)?.sqrt()?;
    Ok(xs.broadcast_div(&norm)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{Device, Var};

    #[test]
    fn test_cross_entropy_uniform_logits() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((2, 4), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[1i64, 3], &device).unwrap();
        let loss = cross_entropy(&logits, &labels, 4).unwrap();
        assert_relative_eq!(loss.to_scalar::<f32>().unwrap(), 4f32.ln(), epsilon = 1e-5);
    }

    #[test]
    fn test_cross_entropy_ignores_negative_labels() {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[2.0f32, 0.0], [0.0, 5.0]], &device).unwrap();
        let labels = Tensor::new(&[0i64, -1], &device).unwrap();
        let loss = cross_entropy(&logits, &labels, 2).unwrap();
        let expected = -(2f32.exp() / (2f32.exp() + 1.0)).ln();
        assert_relative_eq!(loss.to_scalar::<f32>().unwrap(), expected, epsilon = 1e-5);
    }

    #[test]
    fn test_cross_entropy_rejects_out_of_range_label() {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 3), DType::F32, &device).unwrap();
        let labels = Tensor::new(&[3i64], &device).unwrap();
        assert!(cross_entropy(&logits, &labels, 3).is_err());
    }

    #[test]
    fn test_masked_l1_skips_missing_rows() {
        let device = Device::Cpu;
        let pred = Tensor::new(&[[1.0f32], [4.0], [9.0]], &device).unwrap();
        let target = Tensor::new(&[[2.0f32], [0.0], [7.0]], &device).unwrap();
        let loss = masked_l1(&pred, &target).unwrap();
        assert_relative_eq!(loss.to_scalar::<f32>().unwrap(), 1.5, epsilon = 1e-6);
    }

    #[test]
    fn test_cosine_loss_zero_for_aligned_normals() {
        let device = Device::Cpu;
        let pred = Tensor::new(&[[0.0f32, 0.0, 3.0], [2.0, 0.0, 0.0]], &device).unwrap();
        let target = Tensor::new(&[[0.0f32, 0.0, 1.0], [1.0, 0.0, 0.0]], &device).unwrap();
        let loss = cosine_loss(&pred, &target).unwrap();
        assert_relative_eq!(loss.to_scalar::<f32>().unwrap(), 0.0, epsilon = 1e-5);
    }

    #[test]
    fn test_empty_batch_loss_keeps_gradient_path() {
        let device = Device::Cpu;
        let pred = Var::new(&[[1.0f32], [2.0]], &device).unwrap();
        let target = Tensor::zeros((2, 1), DType::F32, &device).unwrap();
        let loss = masked_l1(pred.as_tensor(), &target).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
        let grads = loss.backward().unwrap();
        let grad = grads.get(pred.as_tensor()).unwrap();
        assert_eq!(grad.to_vec2::<f32>().unwrap(), vec![vec![0.0], vec![0.0]]);
    }

    #[test]
    fn test_validate_tasks() {
        assert!(validate_tasks(&scene_tasks()).is_ok());
        assert!(validate_tasks(&[]).is_err());
        let dup = vec![
            TaskSpec::regression("depth", 1),
            TaskSpec::regression("depth", 1),
        ];
        assert!(validate_tasks(&dup).is_err());
        assert!(validate_tasks(&[TaskSpec::classification("c", 1)]).is_err());
    }

    #[test]
    fn test_metric_labels() {
        let tasks = scene_tasks();
        assert_eq!(tasks[0].kind.metric_labels(), &["MEAN_IOU", "PIX_ACC"]);
        assert_eq!(tasks[2].output_dim(), 3);
    }
}
