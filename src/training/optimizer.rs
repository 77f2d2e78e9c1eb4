//! Adam optimizer over an explicit parameter list
//!
//! Weight decay is the classic coupled L2 form: `λ·θ` is added to the gradient
//! before the moment updates. Gradients are detached before use, so a step
//! never extends the autograd graph even when higher-order gradients are on.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Error, Result};

/// Trait for optimizers
pub trait Optimizer {
    /// Optimizer name
    fn name(&self) -> &str;

    /// Update every registered parameter that has a gradient in `grads`
    fn step(&mut self, grads: &GradStore) -> Result<StepOutcome>;

    /// Current learning rate
    fn learning_rate(&self) -> f64;

    /// Set learning rate
    fn set_learning_rate(&mut self, lr: f64);

    /// Number of registered tensors
    fn parameter_count(&self) -> usize;

    /// Steps taken so far
    fn step_count(&self) -> usize;
}

/// Result of one optimizer step
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// Parameters that were updated
    pub updated: usize,
    /// Parameters without a gradient, left unchanged
    pub missing: Vec<String>,
}

/// Adam hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    /// Learning rate
    pub learning_rate: f64,
    /// First moment decay
    pub beta1: f64,
    /// Second moment decay
    pub beta2: f64,
    /// Denominator epsilon
    pub epsilon: f64,
    /// Coupled L2 weight decay
    pub weight_decay: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
        }
    }
}

struct ParamState {
    name: String,
    var: Var,
    momentum: Tensor,
    variance: Tensor,
    /// Updates applied to this parameter; drives its bias correction
    step: usize,
}

/// Adam with optional L2 weight decay
pub struct Adam {
    config: AdamConfig,
    params: Vec<ParamState>,
    step_count: usize,
}

impl Adam {
    /// Optimizer over named variables
    pub fn new(params: Vec<(String, Var)>, config: AdamConfig) -> Result<Self> {
        if params.is_empty() {
            return Err(Error::config("optimizer needs at least one parameter"));
        }
        let params = params
            .into_iter()
            .map(|(name, var)| {
                let zeros = var.as_tensor().zeros_like()?;
                Ok(ParamState {
                    name,
                    var,
                    momentum: zeros.clone(),
                    variance: zeros,
                    step: 0,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            params,
            step_count: 0,
        })
    }

    /// Hyperparameters
    pub fn config(&self) -> &AdamConfig {
        &self.config
    }

    fn update_parameter(&self, state: &mut ParamState, grad: &Tensor) -> Result<()> {
        let c = &self.config;
        let param = state.var.as_tensor().detach();
        let mut grad = grad.detach();
        if c.weight_decay > 0.0 {
            grad = (grad + param.affine(c.weight_decay, 0.0)?)?;
        }

        state.momentum = ((&state.momentum * c.beta1)? + (&grad * (1.0 - c.beta1))?)?;
        state.variance = ((&state.variance * c.beta2)? + (grad.sqr()? * (1.0 - c.beta2))?)?;

        // Steps without a gradient leave the moments untouched, so the bias
        // correction follows this parameter's own update count
        state.step += 1;
        let t = state.step as i32;
        let bias_correction1 = 1.0 - c.beta1.powi(t);
        let bias_correction2 = 1.0 - c.beta2.powi(t);
        let m_hat = (&state.momentum / bias_correction1)?;
        let v_hat = (&state.variance / bias_correction2)?;
        let update = m_hat.div(&(v_hat.sqrt()? + c.epsilon)?)?;

        state.var.set(&param.sub(&(update * c.learning_rate)?)?)?;
        Ok(())
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &str {
        "adam"
    }

    fn step(&mut self, grads: &GradStore) -> Result<StepOutcome> {
        self.step_count += 1;
        let mut outcome = StepOutcome::default();
        let mut params = std::mem::take(&mut self.params);
        let result = params.iter_mut().try_for_each(|state| {
            match grads.get(state.var.as_tensor()) {
                Some(grad) => {
                    self.update_parameter(state, grad)?;
                    outcome.updated += 1;
                }
                None => outcome.missing.push(state.name.clone()),
            }
            Ok::<(), Error>(())
        });
        self.params = params;
        result?;
        trace!(
            "adam step {}: {} updated, {} without gradient",
            self.step_count,
            outcome.updated,
            outcome.missing.len()
        );
        Ok(outcome)
    }

    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.config.learning_rate = lr;
    }

    fn parameter_count(&self) -> usize {
        self.params.len()
    }

    fn step_count(&self) -> usize {
        self.step_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn var(values: &[f32]) -> Var {
        Var::new(values, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_first_step_moves_by_learning_rate() {
        let x = var(&[1.0, -2.0]);
        let mut adam = Adam::new(
            vec![("x".into(), x.clone())],
            AdamConfig {
                learning_rate: 0.1,
                ..Default::default()
            },
        )
        .unwrap();

        // d/dx sum(x^2) = 2x; first Adam step is lr * sign(g)
        let grads = x.as_tensor().sqr().unwrap().sum_all().unwrap().backward().unwrap();
        let outcome = adam.step(&grads).unwrap();
        assert_eq!(outcome.updated, 1);

        let after = x.as_tensor().to_vec1::<f32>().unwrap();
        assert_relative_eq!(after[0], 0.9, epsilon = 1e-5);
        assert_relative_eq!(after[1], -1.9, epsilon = 1e-5);
        assert_eq!(adam.step_count(), 1);
    }

    #[test]
    fn test_weight_decay_shrinks_without_loss_gradient() {
        let x = var(&[3.0]);
        let y = var(&[0.0]);
        let mut adam = Adam::new(
            vec![("x".into(), x.clone()), ("y".into(), y.clone())],
            AdamConfig {
                learning_rate: 0.01,
                weight_decay: 0.5,
                ..Default::default()
            },
        )
        .unwrap();

        // Zero loss gradient for x: only the decay term acts on it
        let zero = Tensor::zeros(1, candle_core::DType::F32, &Device::Cpu).unwrap();
        let loss = (x.as_tensor().mul(&zero).unwrap() + y.as_tensor())
            .unwrap()
            .sum_all()
            .unwrap();
        let grads = loss.backward().unwrap();
        let outcome = adam.step(&grads).unwrap();
        assert_eq!(outcome.updated, 2);
        assert_relative_eq!(x.as_tensor().to_vec1::<f32>().unwrap()[0], 2.99, epsilon = 1e-5);
    }

    #[test]
    fn test_late_parameter_gets_first_step_bias_correction() {
        let x = var(&[1.0]);
        let late = var(&[2.0]);
        let mut adam = Adam::new(
            vec![("x".into(), x.clone()), ("late".into(), late.clone())],
            AdamConfig {
                learning_rate: 0.1,
                ..Default::default()
            },
        )
        .unwrap();

        let grads = x.as_tensor().sum_all().unwrap().backward().unwrap();
        assert_eq!(adam.step(&grads).unwrap().missing, vec!["late".to_string()]);
        assert_eq!(late.as_tensor().to_vec1::<f32>().unwrap(), vec![2.0]);

        // First real update of `late` happens on the optimizer's second step
        // and must still move it by a full learning rate
        let grads = late.as_tensor().sum_all().unwrap().backward().unwrap();
        adam.step(&grads).unwrap();
        assert_eq!(adam.step_count(), 2);
        assert_relative_eq!(late.as_tensor().to_vec1::<f32>().unwrap()[0], 1.9, epsilon = 1e-5);
        assert_relative_eq!(x.as_tensor().to_vec1::<f32>().unwrap()[0], 0.9, epsilon = 1e-5);
    }

    #[test]
    fn test_missing_gradient_is_reported_and_skipped() {
        let x = var(&[1.0]);
        let unused = var(&[5.0]);
        let mut adam = Adam::new(
            vec![("x".into(), x.clone()), ("unused".into(), unused.clone())],
            AdamConfig::default(),
        )
        .unwrap();

        let grads = x.as_tensor().sum_all().unwrap().backward().unwrap();
        let outcome = adam.step(&grads).unwrap();
        assert_eq!(outcome.updated, 1);
        assert_eq!(outcome.missing, vec!["unused".to_string()]);
        assert_eq!(unused.as_tensor().to_vec1::<f32>().unwrap(), vec![5.0]);
    }

    #[test]
    fn test_set_learning_rate() {
        let mut adam = Adam::new(vec![("x".into(), var(&[0.0]))], AdamConfig::default()).unwrap();
        adam.set_learning_rate(0.5);
        assert_eq!(adam.learning_rate(), 0.5);
        assert_eq!(adam.parameter_count(), 1);
        assert!(Adam::new(Vec::new(), AdamConfig::default()).is_err());
    }
}
