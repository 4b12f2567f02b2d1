use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::{Duration, Instant},
};

use serde::Serialize;

/// Per-instance gate in front of every connection attempt: a sliding window
/// over recent attempts plus an exponential block on consecutive failures.
/// One instance hammering its endpoint never changes the verdict for another.
pub struct RateLimiter {
    params: Params,
    state: Mutex<HashMap<i64, State>>,
}

#[derive(Clone, Debug)]
pub struct Params {
    pub window: Duration,
    pub max_attempts: usize,
    pub failure_threshold: u32,
    pub initial_block: Duration,
    pub factor: u32,
    pub max_block: Duration,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_attempts: 10,
            failure_threshold: 5,
            initial_block: Duration::from_secs(30),
            factor: 2,
            max_block: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("instance {instance_id} rate limited, retry after {retry_after:?} ({reason})")]
pub struct Error {
    pub instance_id: i64,
    pub retry_after: Duration,
    pub reason: Reason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Reason {
    Blocked,
    WindowExceeded,
}

struct State {
    attempts: VecDeque<Instant>,
    consecutive_failures: u32,
    block_until: Option<Instant>,
    block: Duration,
}

impl State {
    fn new(initial_block: Duration) -> Self {
        Self {
            attempts: VecDeque::new(),
            consecutive_failures: 0,
            block_until: None,
            block: initial_block,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub attempts_in_window: usize,
    pub consecutive_failures: u32,
    pub blocked_for_secs: Option<u64>,
}

impl RateLimiter {
    pub fn new(params: Params) -> Self {
        Self {
            params,
            state: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, instance_id: i64) -> Result<(), Error> {
        self.allow_at(instance_id, Instant::now())
    }

    fn allow_at(&self, instance_id: i64, now: Instant) -> Result<(), Error> {
        let mut state = self.state.lock().expect("limiter lock");
        let entry = state
            .entry(instance_id)
            .or_insert_with(|| State::new(self.params.initial_block));

        if let Some(until) = entry.block_until {
            if now < until {
                return Err(Error {
                    instance_id,
                    retry_after: until - now,
                    reason: Reason::Blocked,
                });
            }

            entry.block_until = None;
        }

        while entry
            .attempts
            .front()
            .is_some_and(|oldest| now - *oldest >= self.params.window)
        {
            entry.attempts.pop_front();
        }

        if entry.attempts.len() >= self.params.max_attempts {
            let oldest = *entry.attempts.front().expect("non-empty window");

            return Err(Error {
                instance_id,
                retry_after: (oldest + self.params.window) - now,
                reason: Reason::WindowExceeded,
            });
        }

        entry.attempts.push_back(now);

        Ok(())
    }

    pub fn record_failure(&self, instance_id: i64) {
        self.record_failure_at(instance_id, Instant::now());
    }

    fn record_failure_at(&self, instance_id: i64, now: Instant) {
        let mut state = self.state.lock().expect("limiter lock");
        let entry = state
            .entry(instance_id)
            .or_insert_with(|| State::new(self.params.initial_block));

        entry.consecutive_failures += 1;

        if entry.consecutive_failures >= self.params.failure_threshold {
            entry.block_until = Some(now + entry.block);
            entry.block = (entry.block * self.params.factor).min(self.params.max_block);
            // The block itself is the penalty; the streak counts once.
            entry.consecutive_failures = 0;
        }
    }

    pub fn record_success(&self, instance_id: i64) {
        let mut state = self.state.lock().expect("limiter lock");
        let entry = state
            .entry(instance_id)
            .or_insert_with(|| State::new(self.params.initial_block));

        entry.consecutive_failures = 0;
        entry.block_until = None;
        entry.block = self.params.initial_block;
    }

    pub fn forget(&self, instance_id: i64) {
        self.state.lock().expect("limiter lock").remove(&instance_id);
    }

    pub fn snapshot(&self, instance_id: i64) -> Snapshot {
        self.snapshot_at(instance_id, Instant::now())
    }

    fn snapshot_at(&self, instance_id: i64, now: Instant) -> Snapshot {
        let state = self.state.lock().expect("limiter lock");

        let Some(entry) = state.get(&instance_id) else {
            return Snapshot {
                attempts_in_window: 0,
                consecutive_failures: 0,
                blocked_for_secs: None,
            };
        };

        Snapshot {
            attempts_in_window: entry
                .attempts
                .iter()
                .filter(|at| now - **at < self.params.window)
                .count(),
            consecutive_failures: entry.consecutive_failures,
            blocked_for_secs: entry
                .block_until
                .filter(|until| *until > now)
                .map(|until| (until - now).as_secs()),
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Params::default())
    }
}
