//! Multi-frame accumulation for captures.
//!
//! `accumulate.comp` applies [`accumulate_texel`] to every pixel: the
//! current render-target color is added to the running sum, and on the
//! finalizing frame the render target is overwritten with the average.

use glam::Vec4;

use crate::ubo::AccumUniform;

/// Result of accumulating one texel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AccumulatedTexel {
    pub sum: Vec4,
    /// New render-target value, only produced when finalizing.
    pub output: Option<Vec4>,
}

/// One texel of the accumulation pass.
pub fn accumulate_texel(sum: Vec4, color: Vec4, control: &AccumUniform) -> AccumulatedTexel {
    let sum = if control.resets() { color } else { sum + color };
    let output = control
        .finalizes()
        .then(|| sum / control.frames.max(1) as f32);
    AccumulatedTexel { sum, output }
}

/// Host-side accumulator image, used by tests and by the in-memory backend.
#[derive(Clone, Debug, PartialEq)]
pub struct Accumulator {
    sum: Vec<Vec4>,
}

impl Accumulator {
    pub fn new(texels: usize) -> Self {
        Self {
            sum: vec![Vec4::ZERO; texels],
        }
    }

    /// Zeroes the sum (rebuilds do this with a clear).
    pub fn clear(&mut self) {
        self.sum.fill(Vec4::ZERO);
    }

    /// Runs the pass over a frame. When finalizing, `frame` receives the
    /// average.
    pub fn apply(&mut self, frame: &mut [Vec4], control: &AccumUniform) {
        debug_assert_eq!(frame.len(), self.sum.len());
        for (sum, color) in self.sum.iter_mut().zip(frame.iter_mut()) {
            let texel = accumulate_texel(*sum, *color, control);
            *sum = texel.sum;
            if let Some(output) = texel.output {
                *color = output;
            }
        }
    }

    pub fn sum(&self) -> &[Vec4] {
        &self.sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(value: f32) -> Vec<Vec4> {
        vec![Vec4::new(value, value * 0.5, 0.25, 1.0); 4]
    }

    #[test]
    fn test_reset_overwrites_stale_sum() {
        let texel = accumulate_texel(Vec4::splat(9.0), Vec4::ONE, &AccumUniform::new(2, true, false));
        assert_eq!(texel.sum, Vec4::ONE);
        assert_eq!(texel.output, None);
    }

    #[test]
    fn test_k_passes_are_k_times_one_pass() {
        let k = 5;
        let mut once = Accumulator::new(4);
        once.apply(&mut frame(0.6), &AccumUniform::new(k, true, false));

        let mut many = Accumulator::new(4);
        for i in 0..k {
            many.apply(&mut frame(0.6), &AccumUniform::new(k, i == 0, false));
        }

        for (a, b) in many.sum().iter().zip(once.sum()) {
            assert!((*a - *b * k as f32).abs().max_element() < 1e-5);
        }
    }

    #[test]
    fn test_finalize_writes_average() {
        let k = 4;
        let mut acc = Accumulator::new(4);
        let frames: Vec<Vec<Vec4>> = (0..k)
            .map(|i| {
                let mut f = frame(i as f32);
                acc.apply(&mut f, &AccumUniform::new(k, i == 0, i == k - 1));
                f
            })
            .collect();
        // (0 + 1 + 2 + 3) / 4
        assert!((frames[3][0].x - 1.5).abs() < 1e-6);
        assert!((frames[2][0].x - 2.0).abs() < 1e-6);
        assert!((acc.sum()[0].x - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_clear() {
        let mut acc = Accumulator::new(2);
        acc.apply(&mut [Vec4::ONE; 2], &AccumUniform::new(1, false, false));
        acc.clear();
        assert!(acc.sum().iter().all(|t| *t == Vec4::ZERO));
    }
}
