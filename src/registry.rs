//! Process-wide registry binding race ids to their coordinator, lifecycle
//! controller, and background tick task.

// std
use std::collections::HashMap;
// crates.io
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use url::Url;
// self
use crate::{
	_prelude::*,
	cache::Caches,
	config::PollingConfig,
	coordinator::Coordinator,
	error_handler::ErrorHandler,
	http::Fetcher,
	lifecycle::{LifecycleController, LifecycleState, Subscriber},
	metrics::MetricsRegistry,
	model::RaceSnapshot,
	rate_limiter::RateLimiter,
	scheduler::SystemClock,
};

struct Entry {
	controller: Arc<LifecycleController<SystemClock>>,
	coordinator: Arc<Coordinator>,
	task: tokio::task::JoinHandle<()>,
}

/// Process-wide registry of active race polling loops.
///
/// Every registered race shares the same [`Caches`], [`RateLimiter`], [`ErrorHandler`],
/// and [`MetricsRegistry`] instances, so eviction pressure and circuit state are
/// correctly scoped per `(race, endpoint)` rather than duplicated per race.
pub struct Registry {
	base_url: Url,
	config: PollingConfig,
	fetcher: Arc<Fetcher>,
	caches: Arc<Caches>,
	limiter: Arc<AsyncMutex<RateLimiter>>,
	error_handler: Arc<AsyncMutex<ErrorHandler>>,
	metrics: Arc<MetricsRegistry>,
	races: RwLock<HashMap<String, Entry>>,
	sweep_task: tokio::task::JoinHandle<()>,
}
impl Registry {
	/// Construct a registry against `base_url` (the race endpoint root, e.g.
	/// `https://api.example.com/api/race`), validating `config` first.
	pub fn new(base_url: Url, config: PollingConfig) -> Result<Self> {
		config.validate()?;

		let caches = Arc::new(Caches::new(config.cache.clone()));
		let sweep_caches = caches.clone();
		let sweep_task = tokio::spawn(async move {
			let mut ticker = tokio::time::interval(Duration::from_secs(60));

			loop {
				ticker.tick().await;
				sweep_caches.sweep(Instant::now()).await;
			}
		});

		Ok(Self {
			fetcher: Arc::new(Fetcher::new(reqwest::Client::new())),
			caches,
			limiter: Arc::new(AsyncMutex::new(RateLimiter::new(config.rate_limiter.clone()))),
			error_handler: Arc::new(AsyncMutex::new(ErrorHandler::new(config.circuit_breaker.clone()))),
			metrics: Arc::new(MetricsRegistry::new()),
			base_url,
			config,
			races: RwLock::new(HashMap::new()),
			sweep_task,
		})
	}

	/// Register a race for polling and spawn its tick loop, starting it immediately.
	///
	/// A race already registered is left untouched; re-register after [`Self::unregister`]
	/// to restart polling for the same id.
	pub async fn register(&self, race_id: impl Into<String>, subscriber: Arc<dyn Subscriber>) {
		let race_id = race_id.into();
		let mut races = self.races.write().await;

		if races.contains_key(&race_id) {
			return;
		}

		let coordinator = Arc::new(Coordinator::new(
			race_id.clone(),
			self.base_url.clone(),
			&self.config,
			self.fetcher.clone(),
			self.caches.clone(),
			self.limiter.clone(),
			self.error_handler.clone(),
			self.metrics.clone(),
		));
		let controller = Arc::new(LifecycleController::new(
			coordinator.clone(),
			subscriber,
			self.metrics.clone(),
			self.config.clone(),
			SystemClock,
		));

		controller.start().await;

		let loop_controller = controller.clone();
		let task = tokio::spawn(async move { loop_controller.run().await });

		races.insert(race_id, Entry { controller, coordinator, task });
	}

	/// Pause a registered race's polling loop without discarding cached state.
	pub async fn pause(&self, race_id: &str) -> Result<()> {
		self.with_controller(race_id, |controller| async move { controller.pause().await }).await
	}

	/// Resume a previously paused race.
	pub async fn resume(&self, race_id: &str) -> Result<()> {
		self.with_controller(race_id, |controller| async move { controller.resume().await }).await
	}

	/// Stop and deregister a race, aborting its tick loop.
	pub async fn unregister(&self, race_id: &str) -> Result<()> {
		let entry = self.races.write().await.remove(race_id);

		match entry {
			Some(entry) => {
				entry.controller.stop().await;
				entry.task.abort();
				Ok(())
			},
			None => Err(Error::NotRegistered { race_id: race_id.to_string() }),
		}
	}

	/// Current lifecycle state for a registered race.
	pub async fn lifecycle_state(&self, race_id: &str) -> Result<LifecycleState> {
		let races = self.races.read().await;
		let entry = races.get(race_id).ok_or_else(|| Error::NotRegistered { race_id: race_id.to_string() })?;

		Ok(entry.controller.state().await)
	}

	/// The most recently reconciled snapshot for a registered race.
	pub async fn snapshot(&self, race_id: &str) -> Result<Arc<RaceSnapshot>> {
		let races = self.races.read().await;
		let entry = races.get(race_id).ok_or_else(|| Error::NotRegistered { race_id: race_id.to_string() })?;

		Ok(entry.coordinator.current_snapshot().await)
	}

	/// Connection-health telemetry for a registered race.
	pub async fn connection_health(&self, race_id: &str) -> Result<crate::metrics::ConnectionHealth> {
		if !self.races.read().await.contains_key(race_id) {
			return Err(Error::NotRegistered { race_id: race_id.to_string() });
		}

		Ok(self.metrics.connection_health(race_id, self.config.max_retries, Instant::now()))
	}

	/// Every currently registered race id.
	pub async fn registered_races(&self) -> Vec<String> {
		self.races.read().await.keys().cloned().collect()
	}

	async fn with_controller<F, Fut>(&self, race_id: &str, f: F) -> Result<()>
	where
		F: FnOnce(Arc<LifecycleController<SystemClock>>) -> Fut,
		Fut: std::future::Future<Output = ()>,
	{
		let controller = {
			let races = self.races.read().await;
			let entry = races.get(race_id).ok_or_else(|| Error::NotRegistered { race_id: race_id.to_string() })?;

			entry.controller.clone()
		};

		f(controller).await;

		Ok(())
	}
}
impl Drop for Registry {
	fn drop(&mut self) {
		self.sweep_task.abort();

		if let Ok(mut races) = self.races.try_write() {
			for entry in races.values() {
				entry.task.abort();
			}
			races.clear();
		}
	}
}
