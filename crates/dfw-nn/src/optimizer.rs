use crate::Parameter;

/// Updates parameters in place from their accumulated gradients.
///
/// Parameters must be passed in the same order on every call; optimizer
/// state is kept per position. Parameters without a gradient are skipped
/// but keep their slot.
pub trait Optimizer: Send {
    fn step(&mut self, params: &mut [&mut Parameter]);
}

/// Adam optimizer.
///
/// Bias correction uses a per-parameter step count that only advances when
/// that parameter has a gradient, so a parameter that first receives one late
/// starts from step 1.
pub struct Adam {
    pub lr: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    m: Vec<Vec<f64>>,
    v: Vec<Vec<f64>>,
    t: Vec<i32>,
    steps: usize,
}

impl Adam {
    pub fn new(lr: f64) -> Self {
        Self::with_betas(lr, 0.9, 0.999)
    }

    pub fn with_betas(lr: f64, beta1: f64, beta2: f64) -> Self {
        Self {
            lr,
            beta1,
            beta2,
            epsilon: 1e-8,
            m: Vec::new(),
            v: Vec::new(),
            t: Vec::new(),
            steps: 0,
        }
    }

    /// Number of `step` calls so far.
    pub fn steps(&self) -> usize {
        self.steps
    }

    /// Updates applied to the parameter in slot `index`.
    pub fn param_steps(&self, index: usize) -> usize {
        self.t.get(index).map_or(0, |&t| t as usize)
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(1e-3)
    }
}

impl Optimizer for Adam {
    fn step(&mut self, params: &mut [&mut Parameter]) {
        if self.m.is_empty() {
            for p in params.iter() {
                let n = p.data.numel();
                self.m.push(vec![0.0; n]);
                self.v.push(vec![0.0; n]);
                self.t.push(0);
            }
        }
        assert_eq!(
            self.m.len(),
            params.len(),
            "Adam::step: parameter list changed between steps"
        );

        self.steps += 1;

        for (i, p) in params.iter_mut().enumerate() {
            let Some(grad) = p.grad.take() else {
                continue;
            };
            self.t[i] += 1;
            let bc1 = 1.0 - self.beta1.powi(self.t[i]);
            let bc2 = 1.0 - self.beta2.powi(self.t[i]);
            let data = p.data.data_mut();
            let (m, v) = (&mut self.m[i], &mut self.v[i]);
            for (j, &g) in grad.data().iter().enumerate() {
                m[j] = self.beta1 * m[j] + (1.0 - self.beta1) * g;
                v[j] = self.beta2 * v[j] + (1.0 - self.beta2) * g * g;
                let m_hat = m[j] / bc1;
                let v_hat = v[j] / bc2;
                data[j] -= self.lr * m_hat / (v_hat.sqrt() + self.epsilon);
            }
            p.grad = Some(grad);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfw_tensor::Tensor;

    fn quadratic_grad(p: &mut Parameter) {
        // d/dx (x - 3)^2 = 2 (x - 3)
        let g = p.data.map(|x| 2.0 * (x - 3.0));
        p.zero_grad();
        p.accumulate_grad(&g);
    }

    #[test]
    fn adam_minimises_quadratic() {
        let mut p = Parameter::new(Tensor::from_slice(&[0.0, 10.0]));
        let mut opt = Adam::new(0.1);
        for _ in 0..500 {
            quadratic_grad(&mut p);
            opt.step(&mut [&mut p]);
        }
        for &x in p.data.data() {
            assert!((x - 3.0).abs() < 1e-2, "adam ended at {x}");
        }
        assert_eq!(opt.steps(), 500);
    }
}
