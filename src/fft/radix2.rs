use super::InvalidSize;
use num_complex::Complex32;
use std::f32::consts::PI;

//
// Iterative radix-2 (Cooley–Tukey) forward transform over split
// real/imaginary channels.
//
#[derive(Debug)]
pub struct Radix2 {
    n: usize,
}

impl Radix2 {
    /// Creates a plan for size `n`. Only powers of two (≥ 2) are supported.
    pub fn new(n: usize) -> Result<Self, InvalidSize> {
        if n < 2 || !n.is_power_of_two() {
            return Err(InvalidSize(n));
        }
        Ok(Self { n })
    }

    pub fn size(&self) -> usize {
        self.n
    }

    /// Forward transform in place. `re` and `im` must both have length `n`.
    ///
    /// Bin 0 is the DC component; bins `1..n/2` are the positive
    /// frequencies. The negative-frequency mirror in the upper half is left
    /// as computed; callers that want a single-sided spectrum read only the
    /// lower half.
    pub fn process(&self, re: &mut [f32], im: &mut [f32]) {
        let n = self.n;
        assert_eq!(re.len(), n, "real channel length mismatch");
        assert_eq!(im.len(), n, "imaginary channel length mismatch");

        //
        // Bit-reversal permutation.
        //
        let mut j = 0usize;
        for i in 1..n {
            let mut bit = n >> 1;
            while j & bit != 0 {
                j ^= bit;
                bit >>= 1;
            }
            j |= bit;

            if i < j {
                re.swap(i, j);
                im.swap(i, j);
            }
        }

        //
        // Butterfly stages; `len` doubles from 2 up to n. The twiddle for
        // each butterfly advances incrementally from angle -2π/len (the
        // negative sign selects the forward transform).
        //
        let mut len = 2;
        while len <= n {
            let step = Complex32::from_polar(1.0, -2.0 * PI / len as f32);
            let half = len / 2;

            for start in (0..n).step_by(len) {
                let mut w = Complex32::new(1.0, 0.0);

                for k in 0..half {
                    let a = start + k;
                    let b = a + half;

                    let vr = re[b] * w.re - im[b] * w.im;
                    let vi = re[b] * w.im + im[b] * w.re;

                    re[b] = re[a] - vr;
                    im[b] = im[a] - vi;
                    re[a] += vr;
                    im[a] += vi;

                    w *= step;
                }
            }
            len <<= 1;
        }
    }
}
