//! Capture scheduling.
//!
//! With capture enabled, frame counters `[tolerance, tolerance + frames - 1)`
//! add the render target into the accumulator, counter
//! `tolerance + frames - 1` adds its own contribution and writes the average
//! back, and the result is read back once the slot that rendered it has
//! retired.
//!
//! A rebuild clears the accumulator, so a rebuild landing inside the window
//! restarts it at the current counter: the capture still averages `frames`
//! renders, all taken at the new size.

use restir_core::RenderConfig;

use crate::SLOT_COUNT;
use crate::ubo::AccumUniform;

/// Which pre-recorded command set a frame submits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CapturePhase {
    /// Generate, spatial reuse, copy out.
    Steady,
    /// Steady work plus the accumulation pass.
    Accumulating,
    /// Accumulation, average written back, copy into the readback buffer.
    Finalizing,
}

impl CapturePhase {
    pub const ALL: [CapturePhase; 3] = [
        CapturePhase::Steady,
        CapturePhase::Accumulating,
        CapturePhase::Finalizing,
    ];

    /// Position in [`CapturePhase::ALL`].
    #[inline]
    pub fn index(self) -> usize {
        match self {
            CapturePhase::Steady => 0,
            CapturePhase::Accumulating => 1,
            CapturePhase::Finalizing => 2,
        }
    }

    #[inline]
    pub fn accumulates(self) -> bool {
        self != CapturePhase::Steady
    }
}

/// When to accumulate and when to capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CaptureSchedule {
    enabled: bool,
    tolerance: u64,
    frames: u64,
    /// First accumulating counter. Starts at `tolerance`.
    start: u64,
}

impl CaptureSchedule {
    /// `frames` is clamped to at least one.
    pub fn new(enabled: bool, tolerance: u64, frames: u64) -> Self {
        Self {
            enabled,
            tolerance,
            frames: frames.max(1),
            start: tolerance,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, 0, 1)
    }

    pub fn from_config(config: &RenderConfig) -> Self {
        Self::new(
            config.capture,
            u64::from(config.tolerance),
            u64::from(config.frames),
        )
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    #[inline]
    pub fn tolerance(&self) -> u64 {
        self.tolerance
    }

    #[inline]
    pub fn frames(&self) -> u64 {
        self.frames
    }

    #[inline]
    pub fn window_start(&self) -> u64 {
        self.start
    }

    /// Moves the accumulation window to begin at `counter` when a rebuild
    /// cleared the accumulator part-way through it. Returns whether the
    /// window moved.
    pub fn restart(&mut self, counter: u64) -> bool {
        let inside = counter > self.start && counter < self.start + self.frames;
        if self.enabled && inside {
            self.start = counter;
        }
        self.enabled && inside
    }

    /// Counter value reached right after the finalizing frame was submitted.
    pub fn capture_frame(&self) -> Option<u64> {
        self.enabled.then_some(self.start + self.frames)
    }

    /// Frame index the saved image is tagged with.
    pub fn capture_tag(&self) -> Option<u64> {
        self.capture_frame()
            .map(|frame| frame.saturating_sub(SLOT_COUNT as u64))
    }

    pub fn phase(&self, counter: u64) -> CapturePhase {
        if !self.enabled {
            return CapturePhase::Steady;
        }
        let last = self.start + self.frames - 1;
        if counter == last {
            CapturePhase::Finalizing
        } else if (self.start..last).contains(&counter) {
            CapturePhase::Accumulating
        } else {
            CapturePhase::Steady
        }
    }

    /// Accumulation control for the frame at `counter`. The first
    /// accumulating frame overwrites whatever the accumulator held.
    pub fn accum_uniform(&self, counter: u64) -> AccumUniform {
        let phase = self.phase(counter);
        AccumUniform::new(
            u32::try_from(self.frames).unwrap_or(u32::MAX),
            phase.accumulates() && counter == self.start,
            phase == CapturePhase::Finalizing,
        )
    }
}

/// A finished capture waiting for its slot's fence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingCapture {
    /// Slot that submitted the finalizing frame.
    pub slot: usize,
    /// Frame index the snapshot is tagged with.
    pub tag: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phases(schedule: &CaptureSchedule, count: u64) -> Vec<CapturePhase> {
        (0..count).map(|c| schedule.phase(c)).collect()
    }

    #[test]
    fn test_disabled_is_always_steady() {
        let schedule = CaptureSchedule::disabled();
        assert!(phases(&schedule, 8).iter().all(|p| *p == CapturePhase::Steady));
        assert_eq!(schedule.capture_frame(), None);
        assert_eq!(schedule.capture_tag(), None);
    }

    #[test]
    fn test_phases_with_tolerance() {
        use CapturePhase::*;
        let schedule = CaptureSchedule::new(true, 2, 3);
        assert_eq!(
            phases(&schedule, 7),
            vec![Steady, Steady, Accumulating, Accumulating, Finalizing, Steady, Steady]
        );
        assert_eq!(schedule.capture_frame(), Some(5));
        assert_eq!(schedule.capture_tag(), Some(2));
    }

    #[test]
    fn test_single_frame_capture_finalizes_immediately() {
        let schedule = CaptureSchedule::new(true, 0, 1);
        assert_eq!(schedule.phase(0), CapturePhase::Finalizing);
        let accum = schedule.accum_uniform(0);
        assert!(accum.resets());
        assert!(accum.finalizes());
        // capture frame 1 is below the slot count
        assert_eq!(schedule.capture_tag(), Some(0));
    }

    #[test]
    fn test_accum_uniform_resets_only_on_first_frame() {
        let schedule = CaptureSchedule::new(true, 0, 6);
        let resets: Vec<bool> = (0..6).map(|c| schedule.accum_uniform(c).resets()).collect();
        assert_eq!(resets, vec![true, false, false, false, false, false]);
        assert!(schedule.accum_uniform(5).finalizes());
        assert_eq!(schedule.accum_uniform(3).frames, 6);
        assert_eq!(schedule.capture_tag(), Some(3));
    }

    #[test]
    fn test_restart_moves_window_past_rebuild() {
        use CapturePhase::*;
        let mut schedule = CaptureSchedule::new(true, 0, 6);
        assert!(schedule.restart(3));
        assert_eq!(schedule.window_start(), 3);
        assert_eq!(phases(&schedule, 3), vec![Steady, Steady, Steady]);
        assert!(schedule.accum_uniform(3).resets());
        assert!(!schedule.accum_uniform(4).resets());
        assert_eq!(schedule.phase(7), Accumulating);
        assert_eq!(schedule.phase(8), Finalizing);
        assert_eq!(schedule.capture_frame(), Some(9));
        assert_eq!(schedule.capture_tag(), Some(6));
        // tolerance reported in snapshot names is unchanged
        assert_eq!(schedule.tolerance(), 0);
    }

    #[test]
    fn test_restart_outside_window_is_ignored() {
        let mut schedule = CaptureSchedule::new(true, 4, 2);
        assert!(!schedule.restart(2));
        assert!(!schedule.restart(4));
        assert!(!schedule.restart(6));
        assert_eq!(schedule.capture_frame(), Some(6));

        let mut disabled = CaptureSchedule::disabled();
        assert!(!disabled.restart(0));
        assert_eq!(disabled.capture_frame(), None);
    }

    #[test]
    fn test_phase_indices_match_all() {
        for (i, phase) in CapturePhase::ALL.iter().enumerate() {
            assert_eq!(phase.index(), i);
        }
    }

    #[test]
    fn test_zero_frames_is_clamped() {
        let schedule = CaptureSchedule::new(true, 1, 0);
        assert_eq!(schedule.frames(), 1);
        assert_eq!(schedule.phase(1), CapturePhase::Finalizing);
    }
}
