//! Adaptive tick rate.

use std::time::Duration;

use crate::config::SchedulerConfig;

/// Consecutive slow ticks before the rate drops.
const SLOW_STREAK: u32 = 3;

/// Target frame rate that backs off when ticks run late and climbs back,
/// no higher than the ceiling, while ticks have headroom.
#[derive(Debug, Clone)]
pub struct AdaptiveFrameRate {
    min_fps: u32,
    max_fps: u32,
    fps: u32,
    slow_factor: f64,
    slow_streak: u32,
    fast_streak: u32,
}

impl AdaptiveFrameRate {
    pub fn new(config: &SchedulerConfig) -> Self {
        let min_fps = config.min_fps.max(1);
        let max_fps = config.max_fps.max(min_fps);
        Self {
            min_fps,
            max_fps,
            fps: config.target_fps.clamp(min_fps, max_fps),
            slow_factor: f64::from(config.slow_tick_factor.max(1.0)),
            slow_streak: 0,
            fast_streak: 0,
        }
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.fps))
    }

    /// Record one tick: `gap` since the previous tick started and `busy`
    /// time spent producing this one. Returns the new rate if it changed.
    pub fn record(&mut self, gap: Duration, busy: Duration) -> Option<u32> {
        let interval = self.interval().as_secs_f64();
        if gap.as_secs_f64() > interval * self.slow_factor {
            self.fast_streak = 0;
            self.slow_streak += 1;
            if self.slow_streak >= SLOW_STREAK {
                self.slow_streak = 0;
                let lowered = (self.fps * 4 / 5).max(self.min_fps);
                if lowered != self.fps {
                    self.fps = lowered;
                    return Some(lowered);
                }
            }
            return None;
        }

        self.slow_streak = 0;
        if busy.as_secs_f64() < interval / 2.0 {
            self.fast_streak += 1;
            // About two seconds of headroom before stepping up.
            if self.fast_streak >= self.fps * 2 {
                self.fast_streak = 0;
                let raised = (self.fps + 2).min(self.max_fps);
                if raised != self.fps {
                    self.fps = raised;
                    return Some(raised);
                }
            }
        } else {
            self.fast_streak = 0;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate() -> AdaptiveFrameRate {
        AdaptiveFrameRate::new(&SchedulerConfig::default())
    }

    #[test]
    fn starts_at_target() {
        let r = rate();
        assert_eq!(r.fps(), 30);
        assert_eq!(r.interval(), Duration::from_secs_f64(1.0 / 30.0));
    }

    #[test]
    fn sustained_slow_ticks_lower_to_floor() {
        let mut r = rate();
        let late = Duration::from_millis(100);
        let mut changes = Vec::new();
        for _ in 0..30 {
            if let Some(fps) = r.record(late, Duration::ZERO) {
                changes.push(fps);
            }
        }
        assert_eq!(changes, [24]);
        assert_eq!(r.fps(), 24);
    }

    #[test]
    fn isolated_slow_tick_is_ignored() {
        let mut r = rate();
        let on_time = r.interval();
        assert_eq!(r.record(Duration::from_millis(200), Duration::ZERO), None);
        assert_eq!(r.record(on_time, on_time), None);
        assert_eq!(r.record(Duration::from_millis(200), Duration::ZERO), None);
        assert_eq!(r.fps(), 30);
    }

    #[test]
    fn headroom_raises_up_to_ceiling() {
        let mut r = rate();
        for _ in 0..10_000 {
            let gap = r.interval();
            r.record(gap, Duration::ZERO);
        }
        assert_eq!(r.fps(), 60);
    }

    #[test]
    fn busy_ticks_do_not_raise() {
        let mut r = rate();
        for _ in 0..1000 {
            let gap = r.interval();
            r.record(gap, gap);
        }
        assert_eq!(r.fps(), 30);
    }
}
