//! Utility functions shared across the AMTL system

use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

/// Mathematical utilities
pub mod math {
    use candle_core::Tensor;

    use crate::error::Result;

    /// Calculate He initialization standard deviation
    pub fn he_std(fan_in: usize) -> f64 {
        (2.0 / fan_in as f64).sqrt()
    }

    /// Logistic sigmoid built from elementary ops so it stays twice differentiable
    pub fn sigmoid(xs: &Tensor) -> Result<Tensor> {
        Ok((xs.neg()?.exp()? + 1.0)?.recip()?)
    }

    /// Scalar logistic sigmoid
    pub fn sigmoid_f32(x: f32) -> f32 {
        1.0 / (1.0 + (-x).exp())
    }

    /// Index of the largest value; ties resolve to the first occurrence
    pub fn argmax(values: &[f32]) -> usize {
        let mut best = 0;
        for (i, v) in values.iter().enumerate() {
            if *v > values[best] {
                best = i;
            }
        }
        best
    }
}

/// Seeded parameter initialization
pub mod init {
    use candle_core::{Device, Shape, Tensor};
    use rand::rngs::StdRng;
    use rand_distr::{Distribution, Normal};

    use crate::error::{Error, Result};

    /// Tensor with entries drawn from N(mean, std) using the given RNG
    pub fn normal<S: Into<Shape>>(
        shape: S,
        mean: f64,
        std: f64,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Tensor> {
        let shape = shape.into();
        let dist = Normal::new(mean as f32, std as f32)
            .map_err(|e| Error::internal(format!("invalid normal distribution: {e}")))?;
        let data: Vec<f32> = (0..shape.elem_count()).map(|_| dist.sample(rng)).collect();
        Ok(Tensor::from_vec(data, shape, device)?)
    }

    /// Tensor filled with a constant
    pub fn constant<S: Into<Shape>>(shape: S, value: f32, device: &Device) -> Result<Tensor> {
        Ok(Tensor::full(value, shape, device)?)
    }
}

/// Autograd switches
pub mod autograd {
    /// Environment switch read by candle's backward pass. When set, gradient
    /// tensors keep their own computation graph so they can be differentiated
    /// again.
    pub const DO_NOT_DETACH_ENV: &str = "CANDLE_GRAD_DO_NOT_DETACH";

    /// Keep gradient graphs alive for second-order differentiation.
    ///
    /// candle reads the switch lazily once per thread, so this must run before
    /// the first backward pass of any thread that needs meta-gradients.
    pub fn enable_higher_order_gradients() {
        if std::env::var(DO_NOT_DETACH_ENV).map(|v| v == "1").unwrap_or(false) {
            return;
        }
        std::env::set_var(DO_NOT_DETACH_ENV, "1");
    }
}

/// Validation helpers
pub mod validation {
    use crate::error::{Error, Result};

    /// Validate dropout probability
    pub fn validate_dropout(dropout: f32) -> Result<()> {
        if !(0.0..1.0).contains(&dropout) {
            return Err(Error::config(format!(
                "dropout must be in [0, 1), got {dropout}"
            )));
        }
        Ok(())
    }

    /// Validate a strictly positive rate
    pub fn validate_positive(name: &str, value: f64) -> Result<()> {
        if !(value > 0.0) || !value.is_finite() {
            return Err(Error::config(format!("{name} must be > 0, got {value}")));
        }
        Ok(())
    }
}

/// Write a file atomically by renaming a sibling temp file into place
pub fn write_file_atomic<P: AsRef<Path>>(path: P, content: &[u8]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let temp_path = path.with_extension("tmp");
    fs::write(&temp_path, content)?;
    fs::rename(&temp_path, path).map_err(|e| {
        Error::Io(std::io::Error::new(
            e.kind(),
            format!("failed to move {} into place: {e}", temp_path.display()),
        ))
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{Device, Tensor};
    use rand::SeedableRng;

    #[test]
    fn test_sigmoid_matches_scalar() {
        let xs = Tensor::new(&[-2.0f32, 0.0, 3.0], &Device::Cpu).unwrap();
        let ys = math::sigmoid(&xs).unwrap().to_vec1::<f32>().unwrap();
        for (x, y) in [-2.0f32, 0.0, 3.0].iter().zip(ys) {
            assert_relative_eq!(y, math::sigmoid_f32(*x), epsilon = 1e-6);
        }
    }

    #[test]
    fn test_argmax_prefers_first_tie() {
        assert_eq!(math::argmax(&[0.5, 0.5]), 0);
        assert_eq!(math::argmax(&[0.1, 0.7, 0.2]), 1);
    }

    #[test]
    fn test_seeded_normal_is_reproducible() {
        let mut a = rand::rngs::StdRng::seed_from_u64(7);
        let mut b = rand::rngs::StdRng::seed_from_u64(7);
        let x = init::normal((3, 4), 0.0, 0.01, &mut a, &Device::Cpu).unwrap();
        let y = init::normal((3, 4), 0.0, 0.01, &mut b, &Device::Cpu).unwrap();
        assert_eq!(
            x.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            y.flatten_all().unwrap().to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_write_file_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.json");
        write_file_atomic(&path, b"[]").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "[]");
    }

    #[test]
    fn test_validate_dropout() {
        assert!(validation::validate_dropout(0.5).is_ok());
        assert!(validation::validate_dropout(1.0).is_err());
    }
}
