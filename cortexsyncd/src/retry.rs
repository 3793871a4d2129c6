use std::time::Duration;

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RetryPolicy {
    // attempts in total, the first one included
    pub max_attempts: u32,

    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {

    /*
     * Delay after the n-th failed attempt (n starting at 1): initial,
     * 2x initial, 4x initial, ... capped at max_backoff.
     */
    pub fn backoff(&self, attempt: u32) -> Duration {
	let exp = attempt.saturating_sub(1).min(31);
	self.initial_backoff
	    .checked_mul(1u32 << exp)
	    .unwrap_or(self.max_backoff)
	    .min(self.max_backoff)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Attempting(u32),
    Succeeded,
    Failed,
}

/*
 * Retry drives one logical call through its attempts:
 *
 *   Idle -> Attempting(1) -> ... -> Attempting(n) -> Succeeded | Failed
 *
 * It knows nothing about the transport; the caller reports each attempt's
 * result and is told whether (and after how long) to try again.
 */
#[derive(Debug)]
pub struct Retry {
    policy: RetryPolicy,
    state: RetryState,
}

impl Retry {

    pub fn new(policy: RetryPolicy) -> Self {
	Self{
	    policy: policy,
	    state: RetryState::Idle,
	}
    }

    pub fn state(&self) -> RetryState {
	self.state
    }

    pub fn attempts(&self) -> u32 {
	match self.state {
	    RetryState::Attempting(n) => n,
	    _ => 0,
	}
    }

    pub fn begin(&mut self) {
	if self.state == RetryState::Idle {
	    self.state = RetryState::Attempting(1);
	}
    }

    pub fn succeed(&mut self) {
	self.state = RetryState::Succeeded;
    }

    /*
     * The current attempt failed for good, whatever attempts are left.
     */
    pub fn abandon(&mut self) {
	self.state = RetryState::Failed;
    }

    /*
     * The current attempt failed with a retryable error. Returns the delay
     * before the next attempt, or None once the attempts are used up.
     */
    pub fn backoff(&mut self) -> Option<Duration> {
	match self.state {
	    RetryState::Attempting(n) if n < self.policy.max_attempts => {
		self.state = RetryState::Attempting(n + 1);
		Some(self.policy.backoff(n))
	    },
	    RetryState::Attempting(_) => {
		self.state = RetryState::Failed;
		None
	    },
	    _ => None,
	}
    }
}
