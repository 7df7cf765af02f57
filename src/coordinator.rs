//! Per-race polling cycle: concurrent endpoint fetches, snapshot reconciliation,
//! and slot-acceptance bookkeeping.

// crates.io
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use url::Url;
// self
use crate::{
	_prelude::*,
	cache::Caches,
	config::PollingConfig,
	error_handler::ErrorHandler,
	http::{FetchOutcome, Fetcher},
	metrics::MetricsRegistry,
	model::{Endpoint, RaceSnapshot, RaceStatus},
	rate_limiter::RateLimiter,
	snapshot,
};

/// Result of one polling cycle, reported upward so the scheduler can pick the
/// next interval and the registry can dispatch to subscribers.
#[derive(Debug)]
pub struct CycleReport {
	/// Status the cycle observed (falls back to `Unknown` if the race endpoint has
	/// never been accepted).
	pub status: RaceStatus,
	/// Time-to-start the cycle observed, used by the scheduler's cadence table.
	pub time_to_start: Duration,
	/// The reconciled snapshot, present iff at least one endpoint's slot was accepted
	/// this cycle; emitted at most once per cycle, only on change.
	pub snapshot: Option<Arc<RaceSnapshot>>,
	/// Set when every critical endpoint (race, entrants, and pools during the active
	/// window) failed outright this cycle, signalling the scheduler to back off.
	pub critical_failure: Option<Error>,
	/// The endpoint `critical_failure` originated from, if any.
	pub failed_endpoint: Option<Endpoint>,
}

/// Orchestrates the four endpoint fetches for a single race, reconciling their
/// outcomes into a [`RaceSnapshot`] shared with subscribers.
///
/// Caches, the rate limiter, the circuit breaker registry, and metrics are process-wide
/// and handed in by the registry so every race's coordinator contends on the same keyed
/// tables rather than owning private copies.
#[derive(Debug)]
pub struct Coordinator {
	race_id: String,
	base_url: Url,
	timeout: Duration,
	fetcher: Arc<Fetcher>,
	caches: Arc<Caches>,
	limiter: Arc<AsyncMutex<RateLimiter>>,
	error_handler: Arc<AsyncMutex<ErrorHandler>>,
	metrics: Arc<MetricsRegistry>,
	snapshot: AsyncMutex<RaceSnapshot>,
	last_money_flow: AsyncMutex<Option<crate::model::MoneyFlowTimeline>>,
}
impl Coordinator {
	/// Construct a coordinator for one race against `base_url` (e.g.
	/// `https://api.example.com/api/race`, with the race id and endpoint suffix
	/// appended per request).
	#[allow(clippy::too_many_arguments)]
	pub fn new(
		race_id: impl Into<String>,
		base_url: Url,
		config: &PollingConfig,
		fetcher: Arc<Fetcher>,
		caches: Arc<Caches>,
		limiter: Arc<AsyncMutex<RateLimiter>>,
		error_handler: Arc<AsyncMutex<ErrorHandler>>,
		metrics: Arc<MetricsRegistry>,
	) -> Self {
		let race_id = race_id.into();

		Self {
			snapshot: AsyncMutex::new(RaceSnapshot::empty(race_id.clone())),
			last_money_flow: AsyncMutex::new(None),
			race_id,
			base_url,
			timeout: config.request_timeout,
			fetcher,
			caches,
			limiter,
			error_handler,
			metrics,
		}
	}

	/// The race id this coordinator drives.
	pub fn race_id(&self) -> &str {
		&self.race_id
	}

	/// The most recently reconciled snapshot, regardless of whether the last cycle
	/// accepted a new slot.
	pub async fn current_snapshot(&self) -> Arc<RaceSnapshot> {
		Arc::new(self.snapshot.lock().await.clone())
	}

	fn endpoint_url(&self, endpoint: Endpoint) -> Url {
		let mut url = self.base_url.clone();
		let suffix = endpoint.path_suffix().trim_start_matches('/');

		{
			let mut segments = url.path_segments_mut().expect("base url must be a base url");

			segments.push(&self.race_id);
			if !suffix.is_empty() {
				segments.extend(suffix.split('/'));
			}
		}

		url
	}

	/// Run one polling cycle: fetch all four endpoints concurrently (each honoring its
	/// own intra-cycle stagger offset), reconcile accepted slots into the snapshot, and
	/// derive `resultsData` from the race record.
	pub async fn run_cycle(&self, cancel: &CancellationToken) -> CycleReport {
		let cycle_start = Instant::now();
		let now = Utc::now();

		self.metrics.cycle_start(&self.race_id, cycle_start);

		let entrant_ids = {
			let snapshot = self.snapshot.lock().await;

			snapshot.entrants.iter().map(|entrant| entrant.entrant_id.clone()).collect::<Vec<_>>()
		};

		let race_fut = self.fetcher.fetch(
			&self.race_id,
			Endpoint::Race,
			self.endpoint_url(Endpoint::Race),
			Endpoint::Race.stagger_offset(),
			self.timeout,
			&self.caches.race,
			&self.limiter,
			&self.error_handler,
			&self.metrics,
			cancel,
		);
		let entrants_fut = self.fetcher.fetch(
			&self.race_id,
			Endpoint::Entrants,
			self.endpoint_url(Endpoint::Entrants),
			Endpoint::Entrants.stagger_offset(),
			self.timeout,
			&self.caches.entrants,
			&self.limiter,
			&self.error_handler,
			&self.metrics,
			cancel,
		);
		let pools_fut = self.fetcher.fetch(
			&self.race_id,
			Endpoint::Pools,
			self.endpoint_url(Endpoint::Pools),
			Endpoint::Pools.stagger_offset(),
			self.timeout,
			&self.caches.pools,
			&self.limiter,
			&self.error_handler,
			&self.metrics,
			cancel,
		);
		let money_flow_fut = async {
			if entrant_ids.is_empty() {
				tracing::debug!(race_id = %self.race_id, "no entrants yet, skipping money-flow fetch");
				return None;
			}

			let mut url = self.endpoint_url(Endpoint::MoneyFlow);

			url.query_pairs_mut().append_pair("entrants", &entrant_ids.join(","));

			Some(
				self.fetcher
					.fetch(
						&self.race_id,
						Endpoint::MoneyFlow,
						url,
						Endpoint::MoneyFlow.stagger_offset(),
						self.timeout,
						&self.caches.money_flow,
						&self.limiter,
						&self.error_handler,
						&self.metrics,
						cancel,
					)
					.await,
			)
		};

		let (race_outcome, entrants_outcome, pools_outcome, money_flow_outcome) =
			tokio::join!(race_fut, entrants_fut, pools_fut, money_flow_fut);

		let mut slot_accepted = false;
		let mut race_failed: Option<(Endpoint, Error)> = None;
		let mut entrants_failed: Option<(Endpoint, Error)> = None;
		let mut pools_failed: Option<(Endpoint, Error)> = None;
		let mut snapshot = self.snapshot.lock().await;

		match race_outcome {
			FetchOutcome::Accepted(race) if snapshot.race.as_ref() != Some(&race) => {
				snapshot.race = Some(race);
				snapshot.last_race_update = Some(now);
				slot_accepted = true;
			},
			FetchOutcome::Accepted(_) | FetchOutcome::NotModified | FetchOutcome::Fallback { .. } | FetchOutcome::Aborted => {},
			FetchOutcome::Failed(err) => race_failed = Some((Endpoint::Race, err)),
		}

		match entrants_outcome {
			FetchOutcome::Accepted(entrants) if snapshot.entrants != entrants => {
				snapshot.entrants = entrants;
				snapshot.last_entrants_update = Some(now);
				slot_accepted = true;
			},
			FetchOutcome::Accepted(_) | FetchOutcome::NotModified | FetchOutcome::Fallback { .. } | FetchOutcome::Aborted => {},
			FetchOutcome::Failed(err) => entrants_failed = Some((Endpoint::Entrants, err)),
		}

		let status = snapshot.race.as_ref().map(|race| race.status).unwrap_or_default();
		let time_to_start =
			snapshot.race.as_ref().map(|race| (race.start_time - now).to_std().unwrap_or(Duration::ZERO)).unwrap_or(Duration::ZERO);
		let pools_is_critical = matches!(status, RaceStatus::Closed | RaceStatus::Running | RaceStatus::Interim)
			|| time_to_start <= Duration::from_secs(20 * 60);

		match pools_outcome {
			FetchOutcome::Accepted(pools) if snapshot.pools.as_ref() != Some(&pools) => {
				snapshot.pools = Some(pools);
				snapshot.last_pool_update = Some(now);
				slot_accepted = true;
			},
			FetchOutcome::Accepted(_) | FetchOutcome::NotModified | FetchOutcome::Fallback { .. } | FetchOutcome::Aborted => {},
			FetchOutcome::Failed(err) if pools_is_critical => pools_failed = Some((Endpoint::Pools, err)),
			FetchOutcome::Failed(_) => {},
		}

		if let Some(FetchOutcome::Accepted(timeline)) = money_flow_outcome {
			let mut last_money_flow = self.last_money_flow.lock().await;

			if last_money_flow.as_ref() != Some(&timeline) {
				if !timeline.documents.is_empty() {
					tracing::trace!(points = timeline.documents.len(), "money-flow timeline advanced");
					snapshot.money_flow_update_trigger += 1;
					slot_accepted = true;
				}
				*last_money_flow = Some(timeline);
			}
		}

		if let Some(results_data) = snapshot.race.as_ref().and_then(|race| snapshot::derive_results(race, now))
			&& snapshot::results_changed(snapshot.results_data.as_ref(), &results_data)
		{
			snapshot.results_data = Some(results_data);
			snapshot.last_results_update = Some(now);
			slot_accepted = true;
		}

		let (failed_endpoint, critical_failure) = match race_failed.or(entrants_failed).or(pools_failed) {
			Some((endpoint, error)) => (Some(endpoint), Some(error)),
			None => (None, None),
		};
		let report_snapshot = if slot_accepted { Some(Arc::new(snapshot.clone())) } else { None };

		drop(snapshot);

		self.metrics.cycle_end(&self.race_id, cycle_start.elapsed(), slot_accepted);

		CycleReport { status, time_to_start, snapshot: report_snapshot, critical_failure, failed_endpoint }
	}
}

#[cfg(test)]
mod tests {
	// crates.io
	use wiremock::{
		Mock, MockServer, ResponseTemplate,
		matchers::{method, path},
	};
	// self
	use super::*;
	use crate::config::{CacheConfig, CircuitBreakerConfig, RateLimiterConfig};

	fn coordinator(server: &MockServer, caches: Arc<Caches>) -> Coordinator {
		let config = PollingConfig { request_timeout: Duration::from_secs(5), ..Default::default() };
		let base_url: Url = format!("{}/api/race", server.uri()).parse().unwrap();

		Coordinator::new(
			"race-1",
			base_url,
			&config,
			Arc::new(Fetcher::new(reqwest::Client::new())),
			caches,
			Arc::new(AsyncMutex::new(RateLimiter::new(RateLimiterConfig::default()))),
			Arc::new(AsyncMutex::new(ErrorHandler::new(CircuitBreakerConfig::default()))),
			Arc::new(MetricsRegistry::new()),
		)
	}

	fn caches() -> Arc<Caches> {
		Arc::new(Caches::new(CacheConfig::default()))
	}

	#[tokio::test]
	async fn first_cycle_accepts_race_and_entrants_and_emits_a_snapshot() {
		let server = MockServer::start().await;

		Mock::given(method("GET"))
			.and(path("/api/race/race-1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"race": {
					"race_id": "race-1",
					"start_time": Utc::now().to_rfc3339(),
					"status": "open",
				},
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/api/race/race-1/entrants"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"entrants": [
					{"entrant_id": "e1", "name": "Horse One", "runner_number": 1},
				],
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/api/race/race-1/pools"))
			.respond_with(ResponseTemplate::new(500))
			.mount(&server)
			.await;

		let coordinator = coordinator(&server, caches());
		let cancel = CancellationToken::new();
		let report = coordinator.run_cycle(&cancel).await;

		let snapshot = report.snapshot.expect("at least one slot accepted");

		assert_eq!(snapshot.entrants.len(), 1);
		assert_eq!(report.status, RaceStatus::Open);
	}

	#[tokio::test]
	async fn money_flow_is_skipped_without_entrants() {
		let server = MockServer::start().await;

		Mock::given(method("GET")).and(path("/api/race/race-1")).respond_with(ResponseTemplate::new(500)).mount(&server).await;
		Mock::given(method("GET"))
			.and(path("/api/race/race-1/entrants"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"entrants": []})))
			.mount(&server)
			.await;
		Mock::given(method("GET")).and(path("/api/race/race-1/pools")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

		let coordinator = coordinator(&server, caches());
		let cancel = CancellationToken::new();
		let report = coordinator.run_cycle(&cancel).await;

		assert!(report.critical_failure.is_some());
	}

	#[tokio::test]
	async fn critical_failure_reports_the_failing_endpoint() {
		let server = MockServer::start().await;

		Mock::given(method("GET")).and(path("/api/race/race-1")).respond_with(ResponseTemplate::new(500)).mount(&server).await;
		Mock::given(method("GET"))
			.and(path("/api/race/race-1/entrants"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"entrants": []})))
			.mount(&server)
			.await;
		Mock::given(method("GET")).and(path("/api/race/race-1/pools")).respond_with(ResponseTemplate::new(500)).mount(&server).await;

		let coordinator = coordinator(&server, caches());
		let cancel = CancellationToken::new();
		let report = coordinator.run_cycle(&cancel).await;

		assert_eq!(report.failed_endpoint, Some(Endpoint::Race));
	}

	#[tokio::test]
	async fn money_flow_trigger_ignores_an_empty_payload_but_bumps_on_the_next_non_empty_one() {
		let server = MockServer::start().await;

		Mock::given(method("GET"))
			.and(path("/api/race/race-1"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"race": {
					"race_id": "race-1",
					"start_time": (Utc::now() + chrono::Duration::hours(2)).to_rfc3339(),
					"status": "open",
				},
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/api/race/race-1/entrants"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"entrants": [{"entrant_id": "e1", "name": "Horse One", "runner_number": 1}],
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/api/race/race-1/pools"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"currency": "NZD", "total_race_pool": 0.0, "win_pool": 0.0, "place_pool": 0.0,
			})))
			.mount(&server)
			.await;
		Mock::given(method("GET"))
			.and(path("/api/race/race-1/money-flow-timeline"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"documents": []})))
			.mount(&server)
			.await;

		let coordinator = coordinator(&server, caches());
		let cancel = CancellationToken::new();

		// First cycle: no entrants yet, so money-flow is skipped entirely.
		let first = coordinator.run_cycle(&cancel).await;
		assert_eq!(first.snapshot.as_ref().unwrap().money_flow_update_trigger, 0);

		// Second cycle: entrants are now known, money-flow returns an empty timeline.
		let second = coordinator.run_cycle(&cancel).await;
		assert_eq!(second.snapshot.as_ref().map_or(0, |s| s.money_flow_update_trigger), 0);

		server.reset().await;
		Mock::given(method("GET")).and(path("/api/race/race-1")).respond_with(ResponseTemplate::new(304)).mount(&server).await;
		Mock::given(method("GET"))
			.and(path("/api/race/race-1/entrants"))
			.respond_with(ResponseTemplate::new(304))
			.mount(&server)
			.await;
		Mock::given(method("GET")).and(path("/api/race/race-1/pools")).respond_with(ResponseTemplate::new(304)).mount(&server).await;
		Mock::given(method("GET"))
			.and(path("/api/race/race-1/money-flow-timeline"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"documents": [{"type": "win", "timestamp": Utc::now().to_rfc3339(), "entrant_id": "e1", "amount": 12.5}],
			})))
			.mount(&server)
			.await;

		let third = coordinator.run_cycle(&cancel).await;
		assert_eq!(third.snapshot.expect("trigger bump accepts a slot").money_flow_update_trigger, 1);
	}
}
