//! Endpoint fetch algorithm: in-flight coalescing, circuit/rate gates, stagger,
//! conditional request, and cache write-back.

// std
use std::{
	collections::HashMap,
	sync::atomic::{AtomicU64, Ordering},
};
// crates.io
use reqwest::Client;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use url::Url;
// self
use crate::{
	_prelude::*,
	cache::{Cache, Freshness},
	error_handler::{Classification, ErrorHandler},
	http::client::{self, RawFetch},
	metrics::MetricsRegistry,
	model::Endpoint,
	rate_limiter::RateLimiter,
};

/// Outcome of one [`Fetcher::fetch`] call, reported to the coordinator for
/// slot-acceptance and trigger-bump decisions.
#[derive(Debug)]
pub enum FetchOutcome<T> {
	/// A non-304 response was parsed and written to the cache.
	Accepted(T),
	/// A 304 refreshed cache metadata; the previous payload stands.
	NotModified,
	/// Request was gated off (circuit open, rate limited) or failed with a cached
	/// substitute available; `freshness` reflects the degraded tier being served.
	Fallback {
		/// Freshness tier of the cached substitute being served.
		freshness: Freshness,
	},
	/// Request was cancelled; never counted or reported upward.
	Aborted,
	/// Request failed and no cached substitute exists.
	Failed(Error),
}

#[derive(Debug)]
struct InFlight {
	lock: AsyncMutex<()>,
	epoch: AtomicU64,
}
impl InFlight {
	fn new() -> Self {
		Self { lock: AsyncMutex::new(()), epoch: AtomicU64::new(0) }
	}
}

/// Performs endpoint fetches on behalf of every race the coordinator drives.
///
/// Holds only the HTTP client and the in-flight coalescing table; caches, rate
/// limiters, and circuit breakers are process-wide and passed in per call so
/// they can be shared across every race's fetchers.
#[derive(Debug)]
pub struct Fetcher {
	client: Client,
	in_flight: AsyncMutex<HashMap<(String, Endpoint), Arc<InFlight>>>,
}
impl Fetcher {
	/// Construct a fetcher around a shared [`reqwest::Client`].
	pub fn new(client: Client) -> Self {
		Self { client, in_flight: AsyncMutex::new(HashMap::new()) }
	}

	/// Run the full fetch algorithm for one endpoint of one race.
	///
	/// `stagger` is the intra-cycle delay applied before issuing the request (0 for
	/// `Race`, 100/200/300 ms for the other three). `limiter`/`breaker` gate the
	/// request; `cache` both supplies conditional validators and receives the
	/// accepted payload.
	#[allow(clippy::too_many_arguments)]
	#[tracing::instrument(skip(self, cache, limiter, breaker, cancel), fields(race_id, endpoint = ?endpoint))]
	pub async fn fetch<T>(
		&self,
		race_id: &str,
		endpoint: Endpoint,
		url: Url,
		stagger: Duration,
		timeout: Duration,
		cache: &AsyncMutex<Cache<T>>,
		limiter: &AsyncMutex<RateLimiter>,
		breaker: &AsyncMutex<ErrorHandler>,
		metrics: &MetricsRegistry,
		cancel: &CancellationToken,
	) -> FetchOutcome<T>
	where
		T: DeserializeOwned + Clone,
	{
		let key = (race_id.to_string(), endpoint);
		let in_flight = {
			let mut table = self.in_flight.lock().await;

			table.entry(key).or_insert_with(|| Arc::new(InFlight::new())).clone()
		};
		let epoch_before = in_flight.epoch.load(Ordering::Acquire);
		let _guard = in_flight.lock.lock().await;

		if in_flight.epoch.load(Ordering::Acquire) != epoch_before {
			tracing::debug!("joined in-flight fetch, reusing freshly written cache entry");

			return self.fallback(race_id, cache).await;
		}

		let now = Instant::now();

		if breaker.lock().await.breaker(race_id, endpoint).should_reject(now) {
			tracing::debug!("circuit open, serving cached fallback");

			return self.fallback(race_id, cache).await;
		}
		if !limiter.lock().await.allow(race_id, endpoint, now) {
			tracing::debug!("rate limited, serving cached fallback");

			return self.fallback(race_id, cache).await;
		}

		if !stagger.is_zero() {
			tokio::select! {
				biased;
				_ = cancel.cancelled() => return FetchOutcome::Aborted,
				_ = tokio::time::sleep(stagger) => {},
			}
		}

		let validators = { cache.lock().await.validators(race_id).cloned().unwrap_or_default() };
		let fetch_started = Instant::now();
		let result = client::fetch(&self.client, url, &validators, timeout, cancel).await;
		let latency = fetch_started.elapsed();

		in_flight.epoch.fetch_add(1, Ordering::AcqRel);

		self.handle_result(race_id, endpoint, result, latency, cache, breaker, metrics, cancel).await
	}

	#[allow(clippy::too_many_arguments)]
	async fn handle_result<T>(
		&self,
		race_id: &str,
		endpoint: Endpoint,
		result: Result<RawFetch>,
		latency: Duration,
		cache: &AsyncMutex<Cache<T>>,
		breaker: &AsyncMutex<ErrorHandler>,
		metrics: &MetricsRegistry,
		_cancel: &CancellationToken,
	) -> FetchOutcome<T>
	where
		T: DeserializeOwned + Clone,
	{
		let now = Instant::now();

		match result {
			Ok(RawFetch::NotModified { validators }) => {
				cache.lock().await.touch(race_id, validators, now);
				breaker.lock().await.breaker(race_id, endpoint).record_success();
				metrics.record_success(race_id, endpoint, latency, now);
				FetchOutcome::NotModified
			},
			Ok(RawFetch::Ok { body, validators }) => match Self::parse_envelope::<T>(endpoint, &body) {
				Ok(data) => {
					cache.lock().await.put(race_id, data.clone(), validators, now);
					breaker.lock().await.breaker(race_id, endpoint).record_success();
					metrics.record_success(race_id, endpoint, latency, now);
					FetchOutcome::Accepted(data)
				},
				Err(err) => {
					tracing::warn!(?endpoint, %err, "endpoint payload failed to parse");
					metrics.record_error(race_id, endpoint, err.to_string(), now);
					self.fallback(race_id, cache).await
				},
			},
			Err(Error::Aborted) => FetchOutcome::Aborted,
			Err(err) => {
				let classification = Classification::classify(&err, false);

				tracing::warn!(?endpoint, ?classification, %err, "endpoint fetch failed");
				metrics.record_error(race_id, endpoint, err.to_string(), now);

				if classification.opens_circuit {
					breaker.lock().await.breaker(race_id, endpoint).record_failure(now);
				}

				match self.fallback(race_id, cache).await {
					FetchOutcome::Failed(_) => FetchOutcome::Failed(err),
					fallback => fallback,
				}
			},
		}
	}

	/// Peel the per-endpoint response envelope documented at the HTTP boundary
	/// before deserializing the payload type: `/api/race/{R}` wraps as `{"race": ...}`
	/// and `/api/race/{R}/entrants` wraps as `{"entrants": [...]}`; pools and
	/// money-flow are already shaped like their payload type (pools additionally
	/// tolerates its own wrapped form via a custom `Deserialize` impl). A response
	/// that is already bare is accepted too, so an origin that skips the documented
	/// wrapper never fails a cycle.
	fn parse_envelope<T>(endpoint: Endpoint, body: &[u8]) -> std::result::Result<T, serde_json::Error>
	where
		T: DeserializeOwned,
	{
		let key = match endpoint {
			Endpoint::Race => Some("race"),
			Endpoint::Entrants => Some("entrants"),
			Endpoint::Pools | Endpoint::MoneyFlow => None,
		};

		let Some(key) = key else {
			return serde_json::from_slice::<T>(body);
		};

		let value: serde_json::Value = serde_json::from_slice(body)?;

		match value {
			serde_json::Value::Object(ref map) if map.contains_key(key) => {
				serde_json::from_value(map[key].clone())
			},
			other => serde_json::from_value(other),
		}
	}

	async fn fallback<T>(&self, race_id: &str, cache: &AsyncMutex<Cache<T>>) -> FetchOutcome<T>
	where
		T: Clone,
	{
		let now = Instant::now();
		let mut cache = cache.lock().await;

		match cache.get(race_id, now) {
			Some((_, freshness)) => FetchOutcome::Fallback { freshness: freshness.degrade_to_acceptable() },
			None => FetchOutcome::Failed(Error::Cache(format!("no cached fallback for '{race_id}'"))),
		}
	}
}
