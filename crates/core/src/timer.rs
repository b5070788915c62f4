//! Frame timing.

use std::time::{Duration, Instant};

/// Measures per-frame delta time and a rolling frames-per-second figure.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    last_tick: Instant,
    window_start: Instant,
    window_frames: u32,
    fps: f32,
}

impl Timer {
    /// Length of the window the fps figure is averaged over.
    pub const FPS_WINDOW: Duration = Duration::from_secs(1);

    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
            window_start: now,
            window_frames: 0,
            fps: 0.0,
        }
    }

    /// Total elapsed time since the timer was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Advance one frame and return the time since the previous tick in
    /// seconds. Returns `Some(fps)` when a new fps figure is available.
    pub fn tick(&mut self) -> (f32, Option<f32>) {
        let now = Instant::now();
        let delta = (now - self.last_tick).as_secs_f32();
        self.last_tick = now;
        self.window_frames += 1;

        let window = now - self.window_start;
        if window >= Self::FPS_WINDOW {
            self.fps = self.window_frames as f32 / window.as_secs_f32();
            self.window_frames = 0;
            self.window_start = now;
            return (delta, Some(self.fps));
        }
        (delta, None)
    }

    /// Last computed frames-per-second figure.
    pub fn fps(&self) -> f32 {
        self.fps
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_returns_non_negative_delta() {
        let mut timer = Timer::new();
        let (delta, _) = timer.tick();
        assert!(delta >= 0.0);
    }

    #[test]
    fn test_fps_starts_at_zero() {
        let timer = Timer::default();
        assert_eq!(timer.fps(), 0.0);
    }
}
