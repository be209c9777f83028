//
// Conversion of raw transform output into a single-sided, window-corrected,
// dBFS-scaled magnitude spectrum, plus the shared dBFS helpers.
//

/// Floor applied to every published decibel value.
pub const DB_FLOOR: f32 = -150.0;

/// Substituted for zero amplitudes so the logarithm stays finite.
const EPSILON: f32 = 1e-12;

/// Converts a linear amplitude to decibels-full-scale, floored.
pub fn to_dbfs(amplitude: f32) -> f32 {
    (20.0 * amplitude.max(EPSILON).log10()).max(DB_FLOOR)
}

/// Smoothed RMS level of one raw (unwindowed) frame, in dBFS.
pub fn rms_dbfs(samples: &[f32]) -> f32 {
    debug_assert!(!samples.is_empty());

    let mean_sq = samples.iter().map(|&x| x * x).sum::<f32>() / samples.len() as f32;
    to_dbfs(mean_sq.sqrt())
}

/// Turns transform output into `n/2` dBFS magnitudes in `out`.
///
/// The scaling order is fixed: magnitude, divide by the transform size,
/// divide by the window's coherent gain, double every bin except DC to fold
/// in the discarded negative-frequency half, then convert to floored
/// decibels. A full-scale sine aligned to a bin comes out at 0 dBFS.
pub fn convert(re: &[f32], im: &[f32], coherent_gain: f32, out: &mut [f32]) {
    let n = re.len();
    debug_assert_eq!(im.len(), n);
    debug_assert_eq!(out.len(), n / 2);
    debug_assert!(coherent_gain > 0.0);

    let scale = 1.0 / (n as f32 * coherent_gain);

    for (k, o) in out.iter_mut().enumerate() {
        let magnitude = (re[k] * re[k] + im[k] * im[k]).sqrt() * scale;

        // DC has no mirror to fold in.
        let single_sided = if k == 0 { magnitude } else { 2.0 * magnitude };

        *o = to_dbfs(single_sided);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fft;
    use crate::window::Window;
    use std::f32::consts::PI;

    //
    // Runs a frame through window → transform → converter.
    //
    fn analyze(samples: &[f32]) -> Vec<f32> {
        let n = samples.len();
        let window = Window::hann(n);
        let plan = fft::find_plan(n).unwrap();

        let mut re = vec![0.0f32; n];
        let mut im = vec![0.0f32; n];
        window.apply(samples, &mut re);
        plan.process(&mut re, &mut im);

        let mut out = vec![0.0f32; n / 2];
        convert(&re, &im, window.coherent_gain(), &mut out);
        out
    }

    fn sine(n: usize, sample_rate: f32, freq: f32, amplitude: f32) -> Vec<f32> {
        (0..n)
            .map(|t| amplitude * (2.0 * PI * freq * t as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn silence_sits_at_the_floor() {
        // Frame size 1024 at 44100 Hz: all 512 bins at the floor.
        let bins = analyze(&vec![0.0f32; 1024]);
        assert_eq!(bins.len(), 512);
        assert!(bins.iter().all(|&db| db == DB_FLOOR));
    }

    #[test]
    fn bin_aligned_unit_sine_reads_zero_dbfs() {
        let n = 2048;
        let k0 = 64;
        let samples = sine(n, n as f32, k0 as f32, 1.0);
        let bins = analyze(&samples);

        let peak = bins
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();
        assert_eq!(peak.0, k0);
        assert!(peak.1.abs() < 0.5, "peak at {} dB", peak.1);

        // Everything away from the window main lobe stays far below.
        for (k, &db) in bins.iter().enumerate() {
            if k.abs_diff(k0) > 3 {
                assert!(db < -25.0, "bin {} at {} dB", k, db);
            }
        }
    }

    #[test]
    fn half_amplitude_tone_reads_minus_six_db() {
        // 1000 Hz at 0.5 amplitude, frame size 2048 @ 44100 Hz.
        let n = 2048;
        let sample_rate = 44100.0;
        let samples = sine(n, sample_rate, 1000.0, 0.5);
        let bins = analyze(&samples);

        let expected_bin = (1000.0 / (sample_rate / n as f32)).round() as usize;
        let peak = bins
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap();

        assert_eq!(peak.0, expected_bin);

        // 1000 Hz falls 0.44 bins off-center, so Hann scalloping shaves up
        // to ~1.1 dB off the -6.02 dB ideal.
        assert!(*peak.1 < -5.9 && *peak.1 > -7.6, "peak at {} dB", peak.1);
    }

    #[test]
    fn dc_bin_is_not_doubled() {
        let n = 4;
        // DC bin carries n, bin 1 carries n/2 of an aligned cosine.
        let re = vec![4.0, 2.0, 0.0, 0.0];
        let im = vec![0.0; 4];
        let mut out = vec![0.0f32; 2];
        convert(&re, &im, 1.0, &mut out);

        // DC: 4/4 = 1.0 → 0 dB. Bin 1: (2/4)·2 = 1.0 → 0 dB.
        assert!(out[0].abs() < 1e-3);
        assert!(out[1].abs() < 1e-3);
    }

    #[test]
    fn floor_applies_to_loudness_too() {
        assert_eq!(rms_dbfs(&[0.0f32; 512]), DB_FLOOR);

        // Full-scale DC has RMS 1.0 → 0 dBFS.
        assert!(rms_dbfs(&[1.0f32; 512]).abs() < 1e-4);
    }
}
