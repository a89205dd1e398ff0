//! Liveness bookkeeping for a single gateway.
//!
//! The counter only remembers the most recent request and reply instants and
//! the start of the current reply streak. Everything else is derived when a
//! snapshot is taken, so the prober side stays cheap.

use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Durations derived from the request/reply history at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HealthSnapshot {
    /// Time since the last reply while a request is outstanding
    pub wait_time: Duration,

    /// How long the gateway has been judged unreachable, zero when it is not
    pub down_time: Duration,

    /// How long replies have kept arriving, zero when the gateway is down
    pub up_time: Duration,
}

#[derive(Debug)]
struct CounterState {
    start_time: Instant,
    up_since: Option<Instant>,
    last_request: Option<Instant>,
    last_reply: Option<Instant>,
}

/// Thread-safe request/reply tracker for one gateway
#[derive(Debug)]
pub struct HealthCounter {
    max_expected_rtt: Duration,
    state: Mutex<CounterState>,
}

impl HealthCounter {
    /// Create a counter whose history starts now
    pub fn new(max_expected_rtt: Duration) -> Self {
        Self::with_start_time(max_expected_rtt, Instant::now())
    }

    /// Create a counter whose history starts at `start_time`
    pub fn with_start_time(max_expected_rtt: Duration, start_time: Instant) -> Self {
        HealthCounter {
            max_expected_rtt,
            state: Mutex::new(CounterState {
                start_time,
                up_since: None,
                last_request: None,
                last_reply: None,
            }),
        }
    }

    pub fn record_request_sent(&self) {
        self.record_request_sent_at(Instant::now());
    }

    /// Record an echo request sent at `at`.
    ///
    /// Events may be delivered slightly out of order; the stored instant never
    /// moves backwards.
    pub fn record_request_sent_at(&self, at: Instant) {
        let mut state = self.state.lock();
        state.last_request = Some(state.last_request.map_or(at, |prev| prev.max(at)));
    }

    pub fn record_reply_sent(&self) {
        self.record_reply_sent_at(Instant::now());
    }

    /// Record an echo reply received at `at`
    pub fn record_reply_sent_at(&self, at: Instant) {
        let mut state = self.state.lock();
        state.last_reply = Some(state.last_reply.map_or(at, |prev| prev.max(at)));
    }

    pub fn snapshot(&self, reply_timeout: Duration) -> HealthSnapshot {
        self.snapshot_at(reply_timeout, Instant::now())
    }

    /// Evaluate the gateway at `now`.
    ///
    /// A gateway whose outstanding request has waited longer than
    /// `reply_timeout + max_expected_rtt` is down and loses its up streak.
    /// Otherwise the first evaluation starts a new streak with zero up time,
    /// so a single reply never reports as up on the same tick it arrives.
    pub fn snapshot_at(&self, reply_timeout: Duration, now: Instant) -> HealthSnapshot {
        let mut state = self.state.lock();

        let wait_time = match state.last_request {
            Some(request) if state.last_reply.map_or(true, |reply| request > reply) => {
                let since = state.last_reply.unwrap_or(state.start_time);
                truncate_millis(now.saturating_duration_since(since))
            }
            _ => Duration::ZERO,
        };

        if wait_time > reply_timeout.saturating_add(self.max_expected_rtt) {
            state.up_since = None;
            return HealthSnapshot {
                wait_time,
                down_time: wait_time,
                up_time: Duration::ZERO,
            };
        }

        let up_time = match state.up_since {
            Some(since) => truncate_millis(now.saturating_duration_since(since)),
            None => {
                state.up_since = Some(now);
                Duration::ZERO
            }
        };

        HealthSnapshot {
            wait_time,
            down_time: Duration::ZERO,
            up_time,
        }
    }
}

fn truncate_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}
