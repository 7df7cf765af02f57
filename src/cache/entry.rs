//! Cache entry definitions and freshness computation.

// self
use crate::{_prelude::*, config::CacheConfig};

/// Freshness tier derived from an entry's age, per the configured thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Freshness {
	/// `age <= stale_threshold`.
	Fresh,
	/// `stale_threshold < age <= 2 * stale_threshold`.
	Acceptable,
	/// `2 * stale_threshold < age <= critical_threshold`.
	Stale,
	/// `age > critical_threshold`.
	Critical,
}
impl Freshness {
	/// Compute the freshness tier for an age relative to the configured thresholds.
	pub fn from_age(age: Duration, config: &CacheConfig) -> Self {
		if age <= config.stale_threshold {
			Freshness::Fresh
		} else if age <= config.stale_threshold * 2 {
			Freshness::Acceptable
		} else if age <= config.critical_threshold {
			Freshness::Stale
		} else {
			Freshness::Critical
		}
	}

	/// User-visible status label for this tier, per the error-handling design.
	pub fn label(self) -> &'static str {
		match self {
			Freshness::Fresh => "Live",
			Freshness::Acceptable => "Recent",
			Freshness::Stale => "Using recent data",
			Freshness::Critical => "Data may be outdated",
		}
	}

	/// Degrade this tier to at most `Acceptable`, used when serving from a fallback path
	/// (open circuit, rate-limit denial) so the consumer knows the data wasn't pulled fresh.
	pub fn degrade_to_acceptable(self) -> Self {
		match self {
			Freshness::Fresh => Freshness::Acceptable,
			other => other,
		}
	}
}

/// Conditional-request validators carried alongside a cached payload.
#[derive(Clone, Debug, Default)]
pub struct Validators {
	/// `ETag` response header, sent back as `If-None-Match`.
	pub etag: Option<String>,
	/// `Last-Modified` response header, sent back as `If-Modified-Since`.
	pub last_modified: Option<DateTime<Utc>>,
}

/// A single cached value with freshness bookkeeping and conditional-request metadata.
#[derive(Clone, Debug)]
pub struct CacheEntry<T> {
	/// The cached payload.
	pub data: T,
	/// When this entry was first inserted.
	pub inserted_at: Instant,
	/// When this entry's payload or validators were last refreshed.
	pub last_updated_at: Instant,
	/// Number of reads via [`Cache::get`], used to pick an eviction victim.
	pub access_count: u64,
	/// Conditional-request validators for the cached payload.
	pub validators: Validators,
	/// When this entry first crossed the stale threshold, if it has.
	pub stale_since: Option<Instant>,
}
impl<T> CacheEntry<T> {
	fn new(data: T, now: Instant, validators: Validators) -> Self {
		Self { data, inserted_at: now, last_updated_at: now, access_count: 0, validators, stale_since: None }
	}

	/// Age relative to `now`, saturating at zero if `now` predates `last_updated_at`.
	pub fn age(&self, now: Instant) -> Duration {
		now.saturating_duration_since(self.last_updated_at)
	}

	/// Record an access, marking `stale_since` the first time the entry crosses the
	/// stale threshold, and return the freshness tier observed at `now`.
	fn observe(&mut self, now: Instant, config: &CacheConfig) -> Freshness {
		self.access_count += 1;

		let freshness = Freshness::from_age(self.age(now), config);

		if freshness >= Freshness::Stale && self.stale_since.is_none() {
			self.stale_since = Some(now);
		}

		freshness
	}
}

/// Keyed, bounded store of [`CacheEntry`] values for a single payload type.
///
/// One instance covers all races for a given endpoint; `max_size` bounds the number of
/// distinct race keys retained, evicting the entry with the lowest `access_count`
/// (ties broken by the oldest `last_updated_at`).
#[derive(Debug)]
pub struct Cache<T> {
	entries: std::collections::HashMap<String, CacheEntry<T>>,
	config: CacheConfig,
}
impl<T> Cache<T> {
	/// Construct an empty cache bounded by `config`.
	pub fn new(config: CacheConfig) -> Self {
		Self { entries: std::collections::HashMap::new(), config }
	}

	/// Fetch an entry, bumping its access count and computing current freshness.
	pub fn get(&mut self, key: &str, now: Instant) -> Option<(&T, Freshness)> {
		let config = self.config.clone();
		let entry = self.entries.get_mut(key)?;
		let freshness = entry.observe(now, &config);

		Some((&entry.data, freshness))
	}

	/// Peek an entry without bumping its access count (used for fallback reads).
	pub fn peek(&self, key: &str, now: Instant) -> Option<(&T, Freshness)> {
		let entry = self.entries.get(key)?;

		Some((&entry.data, Freshness::from_age(entry.age(now), &self.config)))
	}

	/// Peek the validators of an entry, for composing conditional request headers.
	pub fn validators(&self, key: &str) -> Option<&Validators> {
		self.entries.get(key).map(|entry| &entry.validators)
	}

	/// Insert or overwrite an entry's payload, resetting its freshness clock.
	pub fn put(&mut self, key: &str, data: T, validators: Validators, now: Instant) {
		if !self.entries.contains_key(key) && self.entries.len() >= self.config.max_size {
			self.evict_one();
		}

		self.entries.insert(key.to_string(), CacheEntry::new(data, now, validators));
	}

	/// Refresh freshness metadata after a 304, preserving the existing payload.
	pub fn touch(&mut self, key: &str, validators: Validators, now: Instant) {
		if let Some(entry) = self.entries.get_mut(key) {
			entry.last_updated_at = now;
			entry.stale_since = None;

			if validators.etag.is_some() {
				entry.validators.etag = validators.etag;
			}
			if validators.last_modified.is_some() {
				entry.validators.last_modified = validators.last_modified;
			}
		}
	}

	/// Remove a single entry unconditionally.
	pub fn invalidate(&mut self, key: &str) {
		self.entries.remove(key);
	}

	/// Remove all entries unconditionally.
	pub fn clear(&mut self) {
		self.entries.clear();
	}

	/// Whether a usable fallback entry exists (any freshness tier except `Critical`).
	pub fn can_use_fallback(&self, key: &str, now: Instant) -> bool {
		self.entries
			.get(key)
			.map(|entry| Freshness::from_age(entry.age(now), &self.config) != Freshness::Critical)
			.unwrap_or(false)
	}

	/// Purge entries whose age exceeds the critical threshold. Intended to run on a
	/// periodic sweep rather than on every operation.
	pub fn sweep(&mut self, now: Instant) {
		self.entries.retain(|_, entry| entry.age(now) <= self.config.critical_threshold);
	}

	fn evict_one(&mut self) {
		let victim = self
			.entries
			.iter()
			.min_by_key(|(_, entry)| (entry.access_count, entry.last_updated_at))
			.map(|(key, _)| key.clone());

		if let Some(key) = victim {
			self.entries.remove(&key);
		}
	}

	/// Number of distinct keys currently held.
	pub fn len(&self) -> usize {
		self.entries.len()
	}

	/// Whether the cache holds no entries.
	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}
}
