use dfw_nn::{LinearRamp, Schedule};

/// Per-epoch loss weight and clamp limit for the training loop.
///
/// `enc_scale(e) = base * min(1, e / A)` ramps the perceptibility penalty
/// in; `limit(e) = max(1, 5 - 4e / A)` shrinks the allowed pixel amplitude
/// from 5 to 1 over the same `A` annealing epochs.
pub struct Annealing {
    enc_scale: LinearRamp,
    limit: LinearRamp,
}

pub const START_LIMIT: f64 = 5.0;
pub const FINAL_LIMIT: f64 = 1.0;

impl Annealing {
    pub fn new(base_enc_scale: f64, annealing_epochs: usize) -> Self {
        Self {
            enc_scale: LinearRamp::new(0.0, base_enc_scale, annealing_epochs),
            limit: LinearRamp::new(START_LIMIT, FINAL_LIMIT, annealing_epochs),
        }
    }

    pub fn enc_scale(&self, epoch: usize) -> f64 {
        self.enc_scale.value(epoch)
    }

    pub fn limit(&self, epoch: usize) -> f64 {
        self.limit.value(epoch).max(FINAL_LIMIT)
    }
}
