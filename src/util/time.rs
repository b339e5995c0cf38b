//! Time utilities for game simulation

use std::time::{Duration, Instant};

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Default simulation rate, ticks per second
pub const DEFAULT_TICK_RATE: u32 = 60;

/// Bounds accepted for a configured tick rate
pub const MIN_TICK_RATE: u32 = 1;
pub const MAX_TICK_RATE: u32 = 240;

/// Period of one tick at the given rate
pub fn tick_period(tick_rate: u32) -> Duration {
    Duration::from_micros(1_000_000 / tick_rate.max(1) as u64)
}

/// Measures the wall-clock step between consecutive ticks
#[derive(Debug, Clone)]
pub struct TickClock {
    last: Instant,
}

impl TickClock {
    pub fn new(now: Instant) -> Self {
        Self { last: now }
    }

    /// Seconds elapsed since the previous call, then restart from `now`
    pub fn step(&mut self, now: Instant) -> f32 {
        let delta = now.saturating_duration_since(self.last).as_secs_f32();
        self.last = now;
        delta
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_period_matches_rate() {
        assert_eq!(tick_period(60), Duration::from_micros(16_666));
        assert_eq!(tick_period(0), Duration::from_secs(1));
    }

    #[test]
    fn tick_clock_measures_steps() {
        let start = Instant::now();
        let mut clock = TickClock::new(start);
        let step = clock.step(start + Duration::from_millis(20));
        assert!((step - 0.02).abs() < 1e-4);
        // a clock that goes backwards never yields negative steps
        assert_eq!(clock.step(start), 0.0);
    }
}
