//! Stage timing.

use std::time::{Duration, Instant};

/// Measures one build stage and prints its duration when finished.
pub struct Timer {
    name: String,
    start: Instant,
}

impl Timer {
    /// Start a new timer with the given stage name.
    pub fn start(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: Instant::now(),
        }
    }

    /// Print the elapsed time and return it.
    pub fn finish(self) -> Duration {
        let elapsed = self.start.elapsed();
        println!("  [{}] {}", format_duration(elapsed), self.name);
        elapsed
    }
}

/// `12.3s` under a minute, `4.5m` above.
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs >= 60.0 {
        format!("{:.1}m", secs / 60.0)
    } else {
        format!("{:.1}s", secs)
    }
}
