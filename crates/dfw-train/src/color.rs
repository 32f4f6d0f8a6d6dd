//! Perceptual distance between images in CIELAB (D65 white point).

use dfw_tensor::Tensor;

const WHITE: [f64; 3] = [0.950_47, 1.0, 1.088_83];

fn srgb_to_linear(c: f64) -> f64 {
    if c <= 0.040_45 {
        c / 12.92
    } else {
        ((c + 0.055) / 1.055).powf(2.4)
    }
}

fn lab_f(t: f64) -> f64 {
    const DELTA: f64 = 6.0 / 29.0;
    if t > DELTA * DELTA * DELTA {
        t.cbrt()
    } else {
        t / (3.0 * DELTA * DELTA) + 4.0 / 29.0
    }
}

/// Convert one sRGB pixel with components in `[0, 1]` to `(L*, a*, b*)`.
pub fn rgb_to_lab(rgb: [f64; 3]) -> [f64; 3] {
    let [r, g, b] = rgb.map(|c| srgb_to_linear(c.clamp(0.0, 1.0)));
    let x = 0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b;
    let y = 0.212_672_9 * r + 0.715_152_2 * g + 0.072_175_0 * b;
    let z = 0.019_333_9 * r + 0.119_192_0 * g + 0.950_304_1 * b;

    let fx = lab_f(x / WHITE[0]);
    let fy = lab_f(y / WHITE[1]);
    let fz = lab_f(z / WHITE[2]);
    [116.0 * fy - 16.0, 500.0 * (fx - fy), 200.0 * (fy - fz)]
}

/// Mean per-pixel CIE76 ΔE between two `[C, H, W]` images in `[-1, 1]`.
///
/// Single-channel images are treated as grey.
pub fn lab_distance(a: &Tensor, b: &Tensor) -> f64 {
    assert_eq!(a.shape(), b.shape(), "lab_distance: shape mismatch");
    assert_eq!(a.ndim(), 3, "lab_distance expects [C, H, W]");
    let channels = a.dims()[0];
    assert!(
        channels == 1 || channels == 3,
        "lab_distance supports 1 or 3 channels, got {channels}"
    );
    let plane = a.dims()[1] * a.dims()[2];
    if plane == 0 {
        return 0.0;
    }

    let pixel = |t: &Tensor, p: usize| -> [f64; 3] {
        let v = |ch: usize| (t.data()[ch * plane + p] + 1.0) / 2.0;
        if channels == 1 {
            [v(0); 3]
        } else {
            [v(0), v(1), v(2)]
        }
    };

    let total: f64 = (0..plane)
        .map(|p| {
            let la = rgb_to_lab(pixel(a, p));
            let lb = rgb_to_lab(pixel(b, p));
            la.iter()
                .zip(&lb)
                .map(|(x, y)| (x - y) * (x - y))
                .sum::<f64>()
                .sqrt()
        })
        .sum();
    total / plane as f64
}

/// Mean of [`lab_distance`] over the samples of two `[N, C, H, W]` batches.
pub fn batch_lab_distance(a: &Tensor, b: &Tensor) -> f64 {
    let n = a.batch_len();
    if n == 0 {
        return 0.0;
    }
    (0..n)
        .map(|i| lab_distance(&a.sample(i), &b.sample(i)))
        .sum::<f64>()
        / n as f64
}
