use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Tuning for the system-wide cue transition limiter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransitionLimitConfig {
	/// The counter resets once this much time has passed since the window opened
	pub window_ms: u64,
	/// Calls are rejected while the counter is above this value
	pub threshold: u32,
	/// Amount each call adds to the counter
	pub weight: u32,
}

impl Default for TransitionLimitConfig {
	fn default() -> Self {
		return TransitionLimitConfig {
			window_ms: 300,
			threshold: 6,
			weight: 2,
		};
	}
}

/// Hard cap on cue transitions per unit time, shared by every group on a board.
///
/// Runaway script loops (two groups retriggering each other) hit this and get
/// an error instead of starving the render thread.
#[derive(Debug, Clone)]
pub struct TransitionLimiter {
	config: TransitionLimitConfig,
	window_start: f64,
	count: u32,
}

impl TransitionLimiter {
	pub fn new(config: TransitionLimitConfig) -> Self {
		return TransitionLimiter {
			config,
			window_start: 0.0,
			count: 0,
		};
	}

	/// Records a transition at `now`. Returns `false` if it must be rejected.
	pub fn limit(&mut self, now: f64) -> bool {
		let window = self.config.window_ms as f64 / 1000.0;
		if now - self.window_start > window || now < self.window_start {
			self.window_start = now;
			self.count = 0;
		}

		if self.count > self.config.threshold {
			return false;
		}

		self.count += self.config.weight;
		return true;
	}
}

/// Tuning for the checkpoint store token bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointLimitConfig {
	/// One token is refilled per interval
	pub refill_ms: u64,
	pub burst: u32,
}

impl Default for CheckpointLimitConfig {
	fn default() -> Self {
		return CheckpointLimitConfig {
			refill_ms: 20,
			burst: 300,
		};
	}
}

/// Classic token bucket. Never blocks; callers decide what to do on rejection.
#[derive(Debug)]
pub struct TokenBucket {
	capacity: f64,
	refill_interval: Duration,
	tokens: f64,
	last: Instant,
}

impl TokenBucket {
	pub fn new(refill_interval: Duration, burst: u32) -> Self {
		return TokenBucket {
			capacity: burst as f64,
			refill_interval,
			tokens: burst as f64,
			last: Instant::now(),
		};
	}

	pub fn from_config(config: &CheckpointLimitConfig) -> Self {
		return TokenBucket::new(Duration::from_millis(config.refill_ms.max(1)), config.burst);
	}

	pub fn try_acquire(&mut self) -> bool {
		return self.try_acquire_at(Instant::now());
	}

	pub fn try_acquire_at(&mut self, now: Instant) -> bool {
		let elapsed = now.saturating_duration_since(self.last);
		self.last = now;
		let refilled = elapsed.as_secs_f64() / self.refill_interval.as_secs_f64();
		self.tokens = (self.tokens + refilled).min(self.capacity);

		if self.tokens < 1.0 {
			return false;
		}
		self.tokens -= 1.0;
		return true;
	}
}
