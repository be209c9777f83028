use std::f32::consts::PI;

/// Hann analysis window for a fixed frame size.
///
/// Holds the raised-cosine coefficients together with the coherent gain
/// (mean of the coefficients) needed to undo the window's amplitude loss.
/// A `Window` is immutable; a frame-size change requires building a new one,
/// since the shape depends on the size.
pub struct Window {
    coefficients: Vec<f32>,
    coherent_gain: f32,
}

impl Window {
    /// Builds a Hann window of `n` coefficients. `n` must be at least 2.
    pub fn hann(n: usize) -> Self {
        debug_assert!(n >= 2, "window requires at least 2 coefficients");

        //
        // w[i] = 0.5 * (1 - cos(2π·i / (n - 1))).
        //
        let denom = (n - 1) as f32;
        let coefficients: Vec<f32> = (0..n)
            .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f32 / denom).cos()))
            .collect();

        let coherent_gain = coefficients.iter().sum::<f32>() / n as f32;

        Self {
            coefficients,
            coherent_gain,
        }
    }

    /// Mean of the coefficients; divides back out of the spectrum magnitudes.
    pub fn coherent_gain(&self) -> f32 {
        self.coherent_gain
    }

    /// Multiplies `samples` by the window into `out` (the transform's real
    /// channel). Both slices must match the window length.
    pub fn apply(&self, samples: &[f32], out: &mut [f32]) {
        debug_assert_eq!(samples.len(), self.coefficients.len());
        debug_assert_eq!(out.len(), self.coefficients.len());

        for ((o, &x), &w) in out.iter_mut().zip(samples).zip(&self.coefficients) {
            *o = x * w;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_zero() {
        let w = Window::hann(1024);
        assert_eq!(w.coefficients.len(), 1024);
        assert!(w.coefficients[0].abs() < 1e-7);
        assert!(w.coefficients[1023].abs() < 1e-7);
    }

    #[test]
    fn peak_is_at_center() {
        let w = Window::hann(512);
        // Odd-symmetric around (n-1)/2; the two middle samples straddle 1.0.
        assert!(w.coefficients[255] > 0.9999);
        assert!(w.coefficients[256] > 0.9999);
    }

    #[test]
    fn coherent_gain_matches_closed_form() {
        // Sum of Hann coefficients with the n-1 denominator is (n-1)/2.
        for n in [512usize, 2048, 8192] {
            let w = Window::hann(n);
            let expected = 0.5 * (n as f32 - 1.0) / n as f32;
            assert!((w.coherent_gain() - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn apply_scales_samples() {
        let w = Window::hann(512);
        let samples = vec![1.0f32; 512];
        let mut out = vec![0.0f32; 512];
        w.apply(&samples, &mut out);

        assert_eq!(out, w.coefficients);
    }

    #[test]
    fn shape_depends_on_size() {
        let a = Window::hann(512);
        let b = Window::hann(1024);
        assert!((a.coefficients[100] - b.coefficients[100]).abs() > 1e-3);
    }
}
