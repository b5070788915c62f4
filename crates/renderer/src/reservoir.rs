//! Reservoir resampling, host side.
//!
//! The GLSL passes under `shaders/` run the same arithmetic per pixel:
//! `raygen.rgen` streams candidates into a fresh reservoir and merges the
//! reprojected history, `spatial.comp` merges neighbours into `past`. The
//! functions here are the reference the tests check against.

use glam::{Mat4, UVec2, Vec3};

/// Largest spatial reuse radius in pixels.
pub const SPATIAL_RADIUS: i32 = 5;

/// Neighbour offsets of the spatial pass, visited in this order. The first
/// `M` entries are used.
pub const SPATIAL_OFFSETS: [[i32; 2]; 16] = [
    [-1, 0],
    [1, 0],
    [0, -1],
    [0, 1],
    [-2, -2],
    [2, 2],
    [-2, 2],
    [2, -2],
    [-3, 1],
    [3, -1],
    [1, 3],
    [-1, -3],
    [-5, 0],
    [5, 0],
    [0, -5],
    [0, 5],
];

/// Temporal history may outweigh the current reservoir by at most this factor.
pub const HISTORY_CLAMP: u32 = 20;

/// A candidate light sample: which light, and the point on it.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct LightSample {
    pub light: u32,
    pub position: Vec3,
}

/// Weighted reservoir over light samples.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Reservoir {
    pub sample: Option<LightSample>,
    /// Sum of all candidate weights seen so far.
    pub weight_sum: f32,
    /// Number of candidates seen (`M`).
    pub count: u32,
    /// Target function value of the kept sample at this pixel.
    pub target_pdf: f32,
}

impl Reservoir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Streams one candidate with resampling weight `weight`. `u` is uniform
    /// in `[0, 1)`. Returns whether the candidate replaced the kept sample.
    ///
    /// A candidate is kept when `u * weight_sum < weight`, so of two
    /// candidates with equal weight the first one considered stays unless
    /// `u` selects the second.
    pub fn update(&mut self, sample: LightSample, weight: f32, target_pdf: f32, u: f32) -> bool {
        self.count += 1;
        if weight.is_nan() || weight <= 0.0 {
            return false;
        }
        self.weight_sum += weight;
        if u * self.weight_sum < weight {
            self.sample = Some(sample);
            self.target_pdf = target_pdf;
            true
        } else {
            false
        }
    }

    /// Unbiased contribution weight `W = weight_sum / (M * p_hat)`. Zero when
    /// the reservoir holds nothing usable.
    pub fn contribution_weight(&self) -> f32 {
        let denom = self.count as f32 * self.target_pdf;
        if self.sample.is_none() || denom <= 0.0 {
            0.0
        } else {
            self.weight_sum / denom
        }
    }

    /// Merges `other` into this reservoir. `target_pdf` is the target
    /// function of `other`'s sample evaluated at this pixel.
    ///
    /// When `target_pdf` equals `other.target_pdf` the contributed weight is
    /// exactly `other.weight_sum`.
    pub fn merge(&mut self, other: &Reservoir, target_pdf: f32, u: f32) -> bool {
        let Some(sample) = other.sample else {
            self.count += other.count;
            return false;
        };
        let weight = target_pdf * other.contribution_weight() * other.count as f32;
        let kept = self.update(sample, weight, target_pdf, u);
        // update() counted the merged reservoir as one candidate
        self.count += other.count.saturating_sub(1);
        kept
    }

    /// Replaces the weight sum with the contribution weight, which is what
    /// the shading stage and the next frame consume.
    pub fn finalize_weight(&mut self) -> f32 {
        let w = self.contribution_weight();
        self.weight_sum = w;
        w
    }

    /// Caps a history reservoir's count at `HISTORY_CLAMP` times `current`,
    /// scaling its weight sum by the same factor.
    pub fn clamp_history(&mut self, current: u32) {
        let limit = HISTORY_CLAMP * current.max(1);
        if self.count > limit {
            self.weight_sum *= limit as f32 / self.count as f32;
            self.count = limit;
        }
    }
}

/// Cached geometry of a shading point (`vpos`, `vnorm`, `vmat`).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ShadingPoint {
    pub position: Vec3,
    pub normal: Vec3,
    pub material: u32,
}

/// Geometric consistency test for reusing another pixel's reservoir.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HistoryGate {
    /// Position tolerance per unit of camera distance (minimum one unit).
    pub position_tolerance: f32,
    /// Minimum cosine between the two normals.
    pub normal_cosine: f32,
}

impl Default for HistoryGate {
    fn default() -> Self {
        Self {
            position_tolerance: 0.1,
            normal_cosine: 0.9,
        }
    }
}

impl HistoryGate {
    /// Whether `history` describes the same surface as `current`, seen from
    /// `camera`.
    pub fn accepts(&self, current: &ShadingPoint, history: &ShadingPoint, camera: Vec3) -> bool {
        let distance = current.position.distance(camera).max(1.0);
        current.material == history.material
            && current.position.distance(history.position) <= self.position_tolerance * distance
            && current.normal.dot(history.normal) >= self.normal_cosine
    }
}

/// Projects `position` with last frame's `proj * view` and returns the pixel
/// it covered, or `None` when it was behind the camera or off screen.
pub fn reproject(prev_view_proj: Mat4, position: Vec3, extent: UVec2) -> Option<UVec2> {
    let clip = prev_view_proj * position.extend(1.0);
    if clip.w <= 0.0 {
        return None;
    }
    let ndc = clip.truncate() / clip.w;
    if ndc.x.abs() > 1.0 || ndc.y.abs() > 1.0 {
        return None;
    }
    let uv = (ndc.truncate() * 0.5 + 0.5) * extent.as_vec2();
    let pixel = uv.floor().as_uvec2().min(extent - UVec2::ONE);
    Some(pixel)
}

/// In-bounds neighbours of `pixel` for a merge width of `merge`, in visiting
/// order.
pub fn spatial_neighbours(pixel: UVec2, extent: UVec2, merge: u32) -> Vec<UVec2> {
    SPATIAL_OFFSETS
        .iter()
        .take(merge as usize)
        .filter_map(|&[dx, dy]| {
            let x = pixel.x as i32 + dx;
            let y = pixel.y as i32 + dy;
            (x >= 0 && y >= 0 && (x as u32) < extent.x && (y as u32) < extent.y)
                .then(|| UVec2::new(x as u32, y as u32))
        })
        .collect()
}

/// Merges the accepted neighbours into `center`, first-considered first.
///
/// `target_pdf` evaluates a neighbour's sample at the center pixel and `rng`
/// yields one uniform number per merge.
pub fn spatial_reuse<F, R>(
    center: &Reservoir,
    center_point: &ShadingPoint,
    neighbours: &[(Reservoir, ShadingPoint)],
    camera: Vec3,
    gate: &HistoryGate,
    mut target_pdf: F,
    mut rng: R,
) -> Reservoir
where
    F: FnMut(&LightSample) -> f32,
    R: FnMut() -> f32,
{
    let mut merged = Reservoir::new();
    merged.merge(center, center.target_pdf, rng());
    for (reservoir, point) in neighbours {
        if !gate.accepts(center_point, point, camera) {
            continue;
        }
        let pdf = reservoir.sample.as_ref().map_or(0.0, &mut target_pdf);
        merged.merge(reservoir, pdf, rng());
    }
    merged.finalize_weight();
    merged
}

/// Small hash-based generator matching the shaders' `pcg` sequence.
#[derive(Clone, Copy, Debug)]
pub struct PcgRandom {
    state: u32,
}

impl PcgRandom {
    pub fn new(seed: u32) -> Self {
        Self { state: seed }
    }

    /// Seed of pixel `(x, y)` in frame `frame`.
    pub fn for_pixel(x: u32, y: u32, width: u32, frame: u32) -> Self {
        Self::new(pcg_hash(y.wrapping_mul(width).wrapping_add(x) ^ pcg_hash(frame)))
    }

    pub fn next_u32(&mut self) -> u32 {
        self.state = pcg_hash(self.state);
        self.state
    }

    /// Uniform in `[0, 1)`.
    pub fn next_f32(&mut self) -> f32 {
        (self.next_u32() >> 8) as f32 / (1u32 << 24) as f32
    }
}

/// PCG-RXS-M-XS hash.
pub fn pcg_hash(input: u32) -> u32 {
    let state = input.wrapping_mul(747_796_405).wrapping_add(2_891_336_453);
    let word = ((state >> ((state >> 28) + 4)) ^ state).wrapping_mul(277_803_737);
    (word >> 22) ^ word
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(light: u32) -> LightSample {
        LightSample {
            light,
            position: Vec3::new(light as f32, 4.0, 0.0),
        }
    }

    fn filled(light: u32, weight: f32, pdf: f32, count: u32) -> Reservoir {
        let mut r = Reservoir::new();
        r.update(sample(light), weight, pdf, 0.0);
        r.count = count;
        r
    }

    fn point(position: Vec3) -> ShadingPoint {
        ShadingPoint {
            position,
            normal: Vec3::Y,
            material: 1,
        }
    }

    #[test]
    fn test_first_candidate_is_always_kept() {
        let mut r = Reservoir::new();
        assert!(r.update(sample(0), 0.5, 0.5, 0.999));
        assert_eq!(r.sample, Some(sample(0)));
        assert_eq!(r.count, 1);
    }

    #[test]
    fn test_zero_weight_counts_but_never_selects() {
        let mut r = Reservoir::new();
        assert!(!r.update(sample(0), 0.0, 0.0, 0.0));
        assert_eq!(r.count, 1);
        assert!(r.sample.is_none());
        assert_eq!(r.contribution_weight(), 0.0);
    }

    #[test]
    fn test_equal_weight_tie_keeps_first() {
        let mut r = Reservoir::new();
        r.update(sample(0), 1.0, 1.0, 0.0);
        // u * 2 == 1: not strictly below, the first sample stays
        assert!(!r.update(sample(1), 1.0, 1.0, 0.5));
        assert_eq!(r.sample, Some(sample(0)));
    }

    #[test]
    fn test_merge_conserves_weight() {
        let a = filled(0, 2.5, 0.8, 4);
        let b = filled(1, 1.25, 0.4, 3);

        let mut merged = Reservoir::new();
        merged.merge(&a, a.target_pdf, 0.1);
        merged.merge(&b, b.target_pdf, 0.9);

        assert!((merged.weight_sum - (a.weight_sum + b.weight_sum)).abs() < 1e-5);
        assert_eq!(merged.count, 7);
    }

    #[test]
    fn test_merge_of_empty_reservoir_only_adds_count() {
        let mut r = filled(0, 1.0, 1.0, 2);
        let empty = Reservoir {
            count: 5,
            ..Reservoir::default()
        };
        assert!(!r.merge(&empty, 1.0, 0.0));
        assert_eq!(r.count, 7);
        assert_eq!(r.weight_sum, 1.0);
    }

    #[test]
    fn test_finalize_weight() {
        let mut r = filled(0, 3.0, 0.5, 4);
        let w = r.finalize_weight();
        assert!((w - 1.5).abs() < 1e-6);
        assert_eq!(r.weight_sum, w);
    }

    #[test]
    fn test_history_clamp() {
        let mut history = filled(0, 50.0, 1.0, 50);
        history.clamp_history(1);
        assert_eq!(history.count, 20);
        assert!((history.weight_sum - 20.0).abs() < 1e-4);

        let mut short = filled(0, 5.0, 1.0, 5);
        short.clamp_history(1);
        assert_eq!(short.count, 5);
    }

    #[test]
    fn test_gate_thresholds() {
        let gate = HistoryGate::default();
        let camera = Vec3::new(0.0, 0.0, 10.0);
        let current = point(Vec3::ZERO);

        assert!(gate.accepts(&current, &point(Vec3::new(0.5, 0.0, 0.0)), camera));
        assert!(!gate.accepts(&current, &point(Vec3::new(1.5, 0.0, 0.0)), camera));

        let tilted = ShadingPoint {
            normal: Vec3::new(0.0, 1.0, 1.0).normalize(),
            ..current
        };
        assert!(!gate.accepts(&current, &tilted, camera));

        let other_material = ShadingPoint {
            material: 2,
            ..current
        };
        assert!(!gate.accepts(&current, &other_material, camera));
    }

    #[test]
    fn test_gate_tolerance_has_a_floor() {
        let gate = HistoryGate::default();
        let current = point(Vec3::ZERO);
        // camera closer than one unit still allows 0.1 units
        assert!(gate.accepts(&current, &point(Vec3::new(0.09, 0.0, 0.0)), Vec3::new(0.0, 0.2, 0.0)));
    }

    #[test]
    fn test_reproject_center_and_offscreen() {
        let extent = UVec2::new(100, 50);
        assert_eq!(
            reproject(Mat4::IDENTITY, Vec3::ZERO, extent),
            Some(UVec2::new(50, 25))
        );
        assert_eq!(reproject(Mat4::IDENTITY, Vec3::new(2.0, 0.0, 0.0), extent), None);
        // corner clamps into the image
        assert_eq!(
            reproject(Mat4::IDENTITY, Vec3::new(1.0, 1.0, 0.0), extent),
            Some(UVec2::new(99, 49))
        );
    }

    #[test]
    fn test_reproject_behind_camera() {
        let view_proj = Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0)
            * Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y);
        let extent = UVec2::new(64, 64);
        assert!(reproject(view_proj, Vec3::new(0.0, 0.0, -5.0), extent).is_some());
        assert!(reproject(view_proj, Vec3::new(0.0, 0.0, 5.0), extent).is_none());
    }

    #[test]
    fn test_spatial_neighbours_order_and_bounds() {
        let extent = UVec2::new(8, 8);
        let around = spatial_neighbours(UVec2::new(4, 4), extent, 4);
        assert_eq!(
            around,
            vec![
                UVec2::new(3, 4),
                UVec2::new(5, 4),
                UVec2::new(4, 3),
                UVec2::new(4, 5)
            ]
        );

        let corner = spatial_neighbours(UVec2::ZERO, extent, 4);
        assert_eq!(corner, vec![UVec2::new(1, 0), UVec2::new(0, 1)]);
    }

    #[test]
    fn test_offsets_stay_within_radius() {
        for [dx, dy] in SPATIAL_OFFSETS {
            assert!(dx.abs() <= SPATIAL_RADIUS && dy.abs() <= SPATIAL_RADIUS);
            assert!((dx, dy) != (0, 0));
        }
    }

    #[test]
    fn test_spatial_reuse_skips_rejected_neighbours() {
        let camera = Vec3::new(0.0, 2.0, 5.0);
        let center = filled(0, 1.0, 1.0, 1);
        let accepted = (filled(1, 2.0, 1.0, 1), point(Vec3::new(0.05, 0.0, 0.0)));
        let rejected = (
            filled(2, 100.0, 1.0, 1),
            ShadingPoint {
                material: 9,
                ..point(Vec3::ZERO)
            },
        );

        let merged = spatial_reuse(
            &center,
            &point(Vec3::ZERO),
            &[rejected, accepted],
            camera,
            &HistoryGate::default(),
            |_| 1.0,
            || 0.0,
        );

        assert_eq!(merged.count, 2);
        assert_ne!(merged.sample.map(|s| s.light), Some(2));
        // sum 3 over 2 candidates at p_hat 1
        assert!((merged.weight_sum - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_pcg_is_deterministic_and_in_range() {
        let mut a = PcgRandom::for_pixel(3, 4, 640, 9);
        let mut b = PcgRandom::for_pixel(3, 4, 640, 9);
        for _ in 0..64 {
            let x = a.next_f32();
            assert_eq!(x, b.next_f32());
            assert!((0.0..1.0).contains(&x));
        }
        assert_ne!(pcg_hash(0), pcg_hash(1));
    }
}
