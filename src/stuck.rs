//! Detection of replay divergence.
//!
//! When the next record of the recording cannot be delivered, the time the
//! client has been kept waiting is compared against the time the recording
//! itself spent between the last matched record and the pending one. Waiting
//! much longer than the recording did is a strong hint that the client went
//! down a different path than it did while recording. Detection is purely
//! advisory; replay keeps going.

use std::time::{Duration, Instant};

/// Extra wait allowed on top of the recorded gap, so that recordings with
/// long idle periods do not produce false reports.
pub const STUCK_SLACK: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct StuckReport {
    /// How long the replay has been waiting on the pending record.
    pub waited: Duration,
    /// How long the recording waited at the same point.
    pub expected: Duration,
}

/// Tracks how long the head of the look-ahead has been pending. All methods
/// take `now` as an argument so tests can drive the detector with synthetic
/// clocks.
#[derive(Debug)]
pub struct StuckDetector {
    slack: Duration,
    waiting_since: Option<Instant>,
    last_matched_pkt_time: Option<Duration>,
}

impl StuckDetector {
    pub fn new(slack: Duration) -> StuckDetector {
        StuckDetector {
            slack,
            waiting_since: None,
            last_matched_pkt_time: None,
        }
    }

    /// A record became the head of the look-ahead.
    pub fn new_head(&mut self, now: Instant) {
        self.waiting_since = Some(now);
    }

    /// A record was matched; its capture timestamp becomes the reference
    /// point for the next recorded gap.
    pub fn matched(&mut self, pkt_time: Duration) {
        self.last_matched_pkt_time = Some(pkt_time);
    }

    /// Compare wall-clock wait against the recorded gap. Returns a report
    /// when the replay waited more than `gap + slack`, and rearms itself so
    /// the same stuck point is not reported on every call.
    pub fn check(&mut self, now: Instant, pkt_time: Duration) -> Option<StuckReport> {
        let since = self.waiting_since?;
        let expected =
            pkt_time.saturating_sub(self.last_matched_pkt_time.unwrap_or(pkt_time));
        let waited = now.saturating_duration_since(since);
        if waited <= expected + self.slack {
            return None;
        }
        self.waiting_since = Some(now);
        Some(StuckReport { waited, expected })
    }
}
