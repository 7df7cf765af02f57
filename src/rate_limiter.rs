//! Sliding-window request budget per `(race, endpoint)`.

// std
use std::collections::{HashMap, VecDeque};
// self
use crate::{_prelude::*, config::RateLimiterConfig, model::Endpoint};

/// Sliding-window limiter for a single key.
#[derive(Debug)]
struct Window {
	timestamps: VecDeque<Instant>,
}
impl Window {
	fn new() -> Self {
		Self { timestamps: VecDeque::new() }
	}

	fn allow(&mut self, now: Instant, config: &RateLimiterConfig) -> bool {
		self.prune(now, config.window);

		if self.timestamps.len() as u32 >= config.max_requests_per_window {
			return false;
		}

		self.timestamps.push_back(now);
		true
	}

	fn prune(&mut self, now: Instant, window: Duration) {
		while let Some(&front) = self.timestamps.front() {
			if now.saturating_duration_since(front) > window {
				self.timestamps.pop_front();
			} else {
				break;
			}
		}
	}
}

/// Registry of per-`(race, endpoint)` sliding-window limiters.
#[derive(Debug)]
pub struct RateLimiter {
	config: RateLimiterConfig,
	windows: HashMap<(String, Endpoint), Window>,
}
impl RateLimiter {
	/// Construct an empty registry under the given configuration.
	pub fn new(config: RateLimiterConfig) -> Self {
		Self { config, windows: HashMap::new() }
	}

	/// Whether a request for `(race_id, endpoint)` is allowed at `now`. Prunes
	/// timestamps outside the window and, if allowed, records `now` as a new entry.
	pub fn allow(&mut self, race_id: &str, endpoint: Endpoint, now: Instant) -> bool {
		let window = self
			.windows
			.entry((race_id.to_string(), endpoint))
			.or_insert_with(Window::new);

		window.allow(now, &self.config)
	}
}
