use std::time::{SystemTime, UNIX_EPOCH};

// Utility class for time-tracking
pub struct TickTimer {
    pub milis: f64,
}

impl TickTimer {
    pub fn new() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Self {
            milis: duration.as_secs() as f64 * 1e3 + duration.subsec_nanos() as f64 / 1e6,
        }
    }

    pub fn tick(&mut self) -> f64 {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        let milis = duration.as_secs() as f64 * 1e3 + duration.subsec_nanos() as f64 / 1e6;
        let diff = milis - self.milis;
        self.milis = milis;
        diff
    }

    pub fn tick_print(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        log::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tick_is_monotonic() {
        let mut timer = TickTimer::new();
        assert!(timer.tick() >= 0.0);
        assert!(timer.tick() >= 0.0);
    }
}
