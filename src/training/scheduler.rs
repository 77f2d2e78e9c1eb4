//! Learning-rate schedules

/// Trait for learning rate schedulers
pub trait LearningRateScheduler {
    /// Scheduler name
    fn name(&self) -> &str;

    /// Advance by one epoch
    fn step(&mut self);

    /// Learning rate for the current epoch
    fn get_lr(&self) -> f64;

    /// Reset to the initial state
    fn reset(&mut self);
}

/// Multiply the base rate by `gamma` every `step_size` epochs
#[derive(Debug, Clone)]
pub struct StepScheduler {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    current_step: usize,
    current_lr: f64,
}

impl StepScheduler {
    /// Create a new step scheduler
    pub fn new(base_lr: f64, step_size: usize, gamma: f64) -> Self {
        Self {
            base_lr,
            step_size: step_size.max(1),
            gamma,
            current_step: 0,
            current_lr: base_lr,
        }
    }

    fn calculate_lr(&self) -> f64 {
        let decays = self.current_step / self.step_size;
        self.base_lr * self.gamma.powi(decays as i32)
    }

    /// Epochs stepped so far
    pub fn current_step(&self) -> usize {
        self.current_step
    }
}

impl LearningRateScheduler for StepScheduler {
    fn name(&self) -> &str {
        "step"
    }

    fn step(&mut self) {
        self.current_step += 1;
        self.current_lr = self.calculate_lr();
    }

    fn get_lr(&self) -> f64 {
        self.current_lr
    }

    fn reset(&mut self) {
        self.current_step = 0;
        self.current_lr = self.base_lr;
    }
}
