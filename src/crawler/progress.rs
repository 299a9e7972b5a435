//! Throttled progress reporting
//!
//! Speed and ETA are computed over the current run only, so a resumed task
//! reports how fast it is going now rather than averaging in earlier sessions.

use std::time::{Duration, Instant};

/// One progress report
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressReport {
    pub finished: u64,
    pub total: u64,
    /// Percent finished, 0 to 100
    pub percent: f64,
    /// Items per second in this session
    pub speed: f64,
    pub eta: Option<Duration>,
}

#[derive(Debug)]
pub struct ProgressTracker {
    total: u64,
    session_base: u64,
    started: Instant,
    interval: Duration,
    percent_step: f64,
    last_emit: Option<(Instant, f64)>,
    finished_emitted: bool,
}

impl ProgressTracker {
    /// Starts tracking a session that begins with `already_finished` items done
    pub fn new(total: u64, already_finished: u64, interval: Duration, percent_step: f64) -> Self {
        Self::starting_at(total, already_finished, interval, percent_step, Instant::now())
    }

    pub(crate) fn starting_at(
        total: u64,
        already_finished: u64,
        interval: Duration,
        percent_step: f64,
        now: Instant,
    ) -> Self {
        Self {
            total,
            session_base: already_finished,
            started: now,
            interval,
            percent_step,
            last_emit: None,
            finished_emitted: false,
        }
    }

    /// Records the finished count; returns a report if one is due
    pub fn observe(&mut self, finished: u64) -> Option<ProgressReport> {
        self.observe_at(finished, Instant::now())
    }

    pub(crate) fn observe_at(&mut self, finished: u64, now: Instant) -> Option<ProgressReport> {
        let report = self.report_at(finished, now);

        if finished >= self.total {
            if self.finished_emitted {
                return None;
            }
            self.finished_emitted = true;
            self.last_emit = Some((now, report.percent));
            return Some(report);
        }

        let due = match self.last_emit {
            None => true,
            Some((at, percent)) => {
                now.duration_since(at) >= self.interval
                    && (report.percent - percent).abs() >= self.percent_step
            }
        };

        if due {
            self.last_emit = Some((now, report.percent));
            Some(report)
        } else {
            None
        }
    }

    /// Progress as of `now`, without throttling
    pub fn report_at(&self, finished: u64, now: Instant) -> ProgressReport {
        let percent = percent(finished, self.total);
        let elapsed = now.duration_since(self.started).as_secs_f64();
        let done_now = finished.saturating_sub(self.session_base);

        let speed = if elapsed > 0.0 {
            done_now as f64 / elapsed
        } else {
            0.0
        };
        let remaining = self.total.saturating_sub(finished);
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if speed > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / speed))
        } else {
            None
        };

        ProgressReport {
            finished,
            total: self.total,
            percent,
            speed,
            eta,
        }
    }
}

/// Percent of `total` that `finished` represents; an empty task is 100% done
pub fn percent(finished: u64, total: u64) -> f64 {
    if total == 0 {
        return 100.0;
    }
    (finished.min(total) as f64 / total as f64 * 100.0).min(100.0)
}
