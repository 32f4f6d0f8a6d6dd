/// Epoch-indexed schedule for a scalar hyperparameter (learning rate,
/// loss weight, clamp limit).
pub trait Schedule {
    /// Value for the given epoch (0-indexed).
    fn value(&self, epoch: usize) -> f64;
}

/// Linear interpolation from `start` to `end` over `epochs`, then held at
/// `end`.
///
/// `value(e) = start + (end - start) * min(1, e / epochs)`
///
/// With `epochs == 0` the schedule is already at `end` on epoch 0.
pub struct LinearRamp {
    pub start: f64,
    pub end: f64,
    pub epochs: usize,
}

impl LinearRamp {
    pub fn new(start: f64, end: f64, epochs: usize) -> Self {
        Self { start, end, epochs }
    }

    /// Fraction of the ramp completed at `epoch`, in `[0, 1]`.
    pub fn progress(&self, epoch: usize) -> f64 {
        if self.epochs == 0 {
            return 1.0;
        }
        (epoch as f64 / self.epochs as f64).min(1.0)
    }
}

impl Schedule for LinearRamp {
    fn value(&self, epoch: usize) -> f64 {
        self.start + (self.end - self.start) * self.progress(epoch)
    }
}
