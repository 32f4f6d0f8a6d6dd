use dfw_nn::{
    bce_with_logits, bce_with_logits_grad, mean_l2_norm, mean_l2_norm_grad, Adam, LeakyReLU,
    Linear, LinearRamp, Module, Optimizer, Parameter, Residual, Schedule, Sequential,
};
use dfw_tensor::{Shape, Tensor};
use proptest::prelude::*;

const EPS: f64 = 1e-6;

fn batch(data: &[f64], rows: usize) -> Tensor {
    Tensor::new(data.to_vec(), Shape::from_slice(&[rows, data.len() / rows]))
}

/// Finite-difference gradient of `f` at `x`.
fn numeric_grad(x: &Tensor, f: impl Fn(&Tensor) -> f64) -> Tensor {
    let mut grad = Tensor::zeros_like(x);
    for i in 0..x.numel() {
        let mut plus = x.clone();
        plus.data_mut()[i] += EPS;
        let mut minus = x.clone();
        minus.data_mut()[i] -= EPS;
        grad.data_mut()[i] = (f(&plus) - f(&minus)) / (2.0 * EPS);
    }
    grad
}

fn assert_close(analytic: &Tensor, numeric: &Tensor, tol: f64) {
    assert_eq!(analytic.shape(), numeric.shape());
    for (i, (a, n)) in analytic.data().iter().zip(numeric.data()).enumerate() {
        assert!(
            (a - n).abs() < tol,
            "gradient mismatch at {i}: analytic={a}, numeric={n}"
        );
    }
}

/// Checks input and parameter gradients of `module` under the loss
/// `sum(output * weights)`.
fn check_module(mut module: impl Module, input: &Tensor) {
    let out = module.predict(input);
    let weights = Tensor::from_fn(out.shape().clone(), |idx| {
        0.3 + 0.1 * idx.iter().sum::<usize>() as f64
    });
    let loss = |m: &dyn Module, x: &Tensor| m.predict(x).mul(&weights).sum();

    module.zero_grad();
    module.forward(input);
    let grad_input = module.backward(&weights);
    assert_close(&grad_input, &numeric_grad(input, |x| loss(&module, x)), 1e-5);

    let analytic: Vec<Tensor> = module
        .parameters()
        .iter()
        .map(|p| p.grad.clone().unwrap_or_else(|| Tensor::zeros_like(&p.data)))
        .collect();
    for (k, expected) in analytic.iter().enumerate() {
        let original = module.parameters()[k].data.clone();
        let mut numeric = Tensor::zeros_like(&original);
        for i in 0..original.numel() {
            module.parameters_mut()[k].data.data_mut()[i] = original.data()[i] + EPS;
            let plus = loss(&module, input);
            module.parameters_mut()[k].data.data_mut()[i] = original.data()[i] - EPS;
            let minus = loss(&module, input);
            module.parameters_mut()[k].data.data_mut()[i] = original.data()[i];
            numeric.data_mut()[i] = (plus - minus) / (2.0 * EPS);
        }
        assert_close(expected, &numeric, 1e-5);
    }
}

#[test]
fn linear_gradient_check() {
    check_module(Linear::new(3, 2, 42), &batch(&[1.0, 2.0, 3.0, -0.5, 0.2, 0.1], 2));
}

#[test]
fn leaky_relu_gradient_check() {
    check_module(LeakyReLU::default(), &batch(&[1.0, -2.0, 0.3, -0.1], 2));
}

#[test]
fn residual_stack_gradient_check() {
    let branch = Sequential::new(vec![
        Box::new(Linear::new(3, 3, 1)),
        Box::new(LeakyReLU::default()),
        Box::new(Linear::new(3, 3, 2)),
    ]);
    check_module(Residual::new(branch), &batch(&[0.2, -0.4, 0.9, 1.1, 0.0, -0.3], 2));
}

#[test]
fn residual_with_zeroed_output_is_identity() {
    let branch = Sequential::new(vec![
        Box::new(Linear::new(4, 4, 7)),
        Box::new(LeakyReLU::default()),
        Box::new(Linear::zeroed(4, 4)),
    ]);
    let block = Residual::new(branch);
    let x = batch(&[0.1, 0.2, 0.3, 0.4], 1);
    assert_eq!(block.predict(&x), x);
}

#[test]
fn loss_gradients_match_finite_differences() {
    let logits = batch(&[0.3, -1.2, 2.0, 0.0], 2);
    let targets = batch(&[1.0, 0.0, 0.0, 1.0], 2);
    assert_close(
        &bce_with_logits_grad(&logits, &targets),
        &numeric_grad(&logits, |x| bce_with_logits(x, &targets)),
        1e-6,
    );

    let x = batch(&[0.5, -1.0, 2.0, 1.0, 1.0, 0.25], 2);
    assert_close(&mean_l2_norm_grad(&x), &numeric_grad(&x, mean_l2_norm), 1e-6);
}

#[test]
fn named_parameters_are_stable() {
    let model = Sequential::new(vec![
        Box::new(Linear::new(2, 3, 0)),
        Box::new(LeakyReLU::default()),
        Box::new(Linear::new(3, 1, 1)),
    ]);
    let names: Vec<String> = model.named_parameters().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["0.weight", "0.bias", "2.weight", "2.bias"]);
}

fn fit_xor(mut opt: impl Optimizer, epochs: usize) -> (f64, f64) {
    let x = batch(&[0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0], 4);
    let y = batch(&[0.0, 1.0, 1.0, 0.0], 4);
    let mut model = Sequential::new(vec![
        Box::new(Linear::new(2, 8, 11)),
        Box::new(LeakyReLU::default()),
        Box::new(Linear::new(8, 1, 12)),
    ]);

    let initial = bce_with_logits(&model.predict(&x), &y);
    for _ in 0..epochs {
        model.zero_grad();
        let logits = model.forward(&x);
        model.backward(&bce_with_logits_grad(&logits, &y));
        opt.step(&mut model.parameters_mut());
    }
    (initial, bce_with_logits(&model.predict(&x), &y))
}

#[test]
fn adam_learns_xor() {
    let (initial, fin) = fit_xor(Adam::new(0.05), 500);
    assert!(fin < 0.3, "loss {initial} -> {fin}");
}

#[test]
fn adam_bias_correction_starts_when_a_parameter_first_gets_a_gradient() {
    let mut early = Parameter::new(Tensor::from_slice(&[1.0]));
    let mut late = Parameter::new(Tensor::from_slice(&[1.0]));
    let mut opt = Adam::new(1e-3);
    for _ in 0..1000 {
        early.zero_grad();
        early.accumulate_grad(&Tensor::from_slice(&[0.5]));
        opt.step(&mut [&mut early, &mut late]);
    }
    assert_eq!(late.data.data(), &[1.0]);
    assert_eq!(opt.param_steps(1), 0);

    early.zero_grad();
    late.accumulate_grad(&Tensor::from_slice(&[0.3]));
    opt.step(&mut [&mut early, &mut late]);

    // first bias-corrected Adam update is lr * g / |g|
    let moved = 1.0 - late.data.data()[0];
    assert!((moved - 1e-3).abs() < 1e-8, "first update {moved}");
    assert_eq!(opt.param_steps(0), 1000);
    assert_eq!(opt.param_steps(1), 1);
    assert_eq!(opt.steps(), 1001);
}

proptest! {
    #[test]
    fn ramp_stays_between_endpoints(start in -5.0f64..5.0, end in -5.0f64..5.0, epochs in 0usize..50, e in 0usize..100) {
        let ramp = LinearRamp::new(start, end, epochs);
        let v = ramp.value(e);
        prop_assert!(v >= start.min(end) - 1e-12 && v <= start.max(end) + 1e-12);
        if e >= epochs {
            prop_assert!((v - end).abs() < 1e-12);
        }
    }
}
