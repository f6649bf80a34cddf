//! Fixed-timestep clock: camera motion advances in 60 Hz steps while the
//! globe renders once per redraw.

use std::time::Instant;

use tracing::warn;

/// Length of one camera update step, in seconds.
pub const FIXED_DT: f64 = 1.0 / 60.0;

/// Longest frame time accepted; slower frames are clamped so a stall does
/// not queue dozens of steps.
pub const MAX_FRAME_TIME: f64 = 0.25;

/// Accumulator splitting measured frame time into fixed steps.
#[derive(Debug, Clone)]
pub struct FrameClock {
    previous: Instant,
    accumulator: f64,
    total_time: f64,
    frames: u64,
    steps: u64,
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameClock {
    pub fn new() -> Self {
        Self {
            previous: Instant::now(),
            accumulator: 0.0,
            total_time: 0.0,
            frames: 0,
            steps: 0,
        }
    }

    /// Measure the time since the last tick and run `step(FIXED_DT)` as
    /// many times as it covers.
    pub fn tick(&mut self, step: impl FnMut(f64)) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.previous).as_secs_f64();
        self.previous = now;
        self.advance(elapsed, step);
    }

    /// Like [`tick`](Self::tick) with an explicit frame time. Returns the
    /// number of steps run.
    pub fn advance(&mut self, frame_time: f64, mut step: impl FnMut(f64)) -> u32 {
        let mut frame_time = frame_time.max(0.0);
        if frame_time > MAX_FRAME_TIME {
            warn!(
                "Frame time {:.1}ms exceeds maximum, clamping to {:.1}ms",
                frame_time * 1000.0,
                MAX_FRAME_TIME * 1000.0
            );
            frame_time = MAX_FRAME_TIME;
        }
        self.accumulator += frame_time;

        let mut steps = 0;
        while self.accumulator >= FIXED_DT {
            step(FIXED_DT);
            self.total_time += FIXED_DT;
            self.accumulator -= FIXED_DT;
            self.steps += 1;
            steps += 1;
        }
        self.frames += 1;
        steps
    }

    /// Fraction of a step left in the accumulator, in `[0, 1)`.
    pub fn alpha(&self) -> f64 {
        self.accumulator / FIXED_DT
    }

    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    pub fn step_count(&self) -> u64 {
        self.steps
    }

    /// Simulated time in seconds.
    pub fn total_time(&self) -> f64 {
        self.total_time
    }
}
