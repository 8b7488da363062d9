use std::time::{Duration, Instant};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

fn format_min_sec(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}

/// Rate-limited completion report of one establishment call.
pub struct ConnectProgress {
    enabled: bool,
    start: Instant,
    last: Instant,
    reported: bool,
}

impl ConnectProgress {
    pub fn new(enabled: bool) -> Self {
        let now = Instant::now();
        ConnectProgress {
            enabled,
            start: now,
            last: now,
            reported: false,
        }
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    #[inline]
    pub fn has_reported(&self) -> bool {
        self.reported
    }

    // `done` distances out of `num_ranks` have been fully drained
    pub fn report(&mut self, done: usize, num_ranks: usize) {
        if let Some(line) = self.report_at(Instant::now(), done, num_ranks) {
            log::info!("{}", line);
        }
    }

    pub fn report_at(&mut self, now: Instant, done: usize, num_ranks: usize) -> Option<String> {
        if !self.enabled || done == 0 || num_ranks == 0 {
            return None;
        }
        if now.saturating_duration_since(self.last) <= REPORT_INTERVAL {
            return None;
        }
        let elapsed = now.saturating_duration_since(self.start);
        let remaining =
            elapsed.as_secs_f64() * num_ranks.saturating_sub(done) as f64 / done as f64;
        let line = format!(
            "P2p connect: {:.1}% Elapsed {} Remaining {}",
            done as f64 * 100.0 / num_ranks as f64,
            format_min_sec(elapsed.as_secs()),
            format_min_sec(remaining as u64),
        );
        self.last = now;
        self.reported = true;
        Some(line)
    }

    pub fn summary(&self) -> String {
        let elapsed = self.elapsed();
        format!(
            "P2p connect done in {}.{:06}",
            format_min_sec(elapsed.as_secs()),
            elapsed.subsec_micros()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_at_most_once_per_second() {
        let mut progress = ConnectProgress::new(true);
        let start = progress.start;
        assert!(progress.report_at(start + Duration::from_millis(500), 1, 8).is_none());

        let line = progress
            .report_at(start + Duration::from_millis(2000), 2, 8)
            .unwrap();
        assert_eq!(line, "P2p connect: 25.0% Elapsed 0:02 Remaining 0:06");
        assert!(progress.has_reported());

        assert!(progress.report_at(start + Duration::from_millis(2500), 3, 8).is_none());
        assert!(progress.report_at(start + Duration::from_millis(3100), 4, 8).is_some());
    }

    #[test]
    fn disabled_progress_stays_silent() {
        let mut progress = ConnectProgress::new(false);
        let start = progress.start;
        assert!(progress.report_at(start + Duration::from_secs(10), 1, 2).is_none());
        assert!(!progress.has_reported());
    }
}
