use backoff::backoff::Constant;
use std::time::Duration;

/// Retry policy for push conflicts and instance ledger name collisions.
///
/// Production runs retry push conflicts until they succeed; tests bound them
/// to observe exhaustion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
	/// Maximum push attempts per operation, `None` for unbounded
	pub max_push_attempts: Option<u32>,
	/// Pause before trying a new instance ledger name
	pub allocation_delay: Duration,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_push_attempts: None,
			allocation_delay: Duration::from_secs(1),
		}
	}
}

impl RetryPolicy {
	/// Retry push conflicts at most `attempts` times in total.
	pub fn bounded(attempts: u32) -> Self {
		Self {
			max_push_attempts: Some(attempts),
			..Self::default()
		}
	}

	pub fn with_allocation_delay(mut self, delay: Duration) -> Self {
		self.allocation_delay = delay;
		self
	}

	/// Whether another push may be tried after `attempts` have failed.
	pub fn allows_retry(&self, attempts: u32) -> bool {
		match self.max_push_attempts {
			Some(max) => attempts < max,
			None => true,
		}
	}

	/// Backoff used between instance ledger name candidates.
	pub fn allocation_backoff(&self) -> Constant {
		Constant::new(self.allocation_delay)
	}
}
