//! Bundles the four per-endpoint caches shared process-wide by the registry.

// crates.io
use tokio::sync::Mutex as AsyncMutex;
// self
use crate::{
	_prelude::*,
	cache::entry::Cache,
	config::CacheConfig,
	model::{Entrant, MoneyFlowTimeline, Pools, Race},
};

/// One [`Cache`] per endpoint payload type, all bounded by the same [`CacheConfig`].
///
/// Shared across every race the registry polls; operations are keyed by race id within
/// each per-endpoint cache, so eviction pressure from one race's endpoints never touches
/// another race's entries in a different endpoint's cache. Each cache is independently
/// locked so fetches for different endpoints of the same race never contend.
#[derive(Debug)]
pub struct Caches {
	/// Cache of race records, keyed by race id.
	pub race: AsyncMutex<Cache<Race>>,
	/// Cache of entrant lists, keyed by race id.
	pub entrants: AsyncMutex<Cache<Vec<Entrant>>>,
	/// Cache of pool totals, keyed by race id.
	pub pools: AsyncMutex<Cache<Pools>>,
	/// Cache of money-flow timelines, keyed by race id.
	pub money_flow: AsyncMutex<Cache<MoneyFlowTimeline>>,
}
impl Caches {
	/// Construct all four caches with the same bounds.
	pub fn new(config: CacheConfig) -> Self {
		Self {
			race: AsyncMutex::new(Cache::new(config.clone())),
			entrants: AsyncMutex::new(Cache::new(config.clone())),
			pools: AsyncMutex::new(Cache::new(config.clone())),
			money_flow: AsyncMutex::new(Cache::new(config)),
		}
	}

	/// Purge entries older than the critical threshold across all four caches.
	///
	/// Driven by the registry's periodic background task.
	pub async fn sweep(&self, now: Instant) {
		self.race.lock().await.sweep(now);
		self.entrants.lock().await.sweep(now);
		self.pools.lock().await.sweep(now);
		self.money_flow.lock().await.sweep(now);
	}
}

#[cfg(test)]
mod tests {
	// self
	use super::*;
	use crate::cache::entry::Validators;

	#[tokio::test]
	async fn sweep_purges_all_four_caches_past_critical_threshold() {
		let config = CacheConfig {
			max_size: 50,
			stale_threshold: Duration::from_secs(1),
			critical_threshold: Duration::from_secs(2),
		};
		let caches = Caches::new(config);
		let now = Instant::now();

		caches.pools.lock().await.put(
			"race-1",
			Pools { currency: "NZD".into(), total_race_pool: 1.0, win_pool: 1.0, place_pool: 1.0 },
			Validators::default(),
			now,
		);

		caches.sweep(now + Duration::from_secs(3)).await;

		assert!(caches.pools.lock().await.is_empty());
	}
}
