//! HTTP transport for a single endpoint request: headers, conditional validators,
//! timeout, and cancellation.

// crates.io
use http::{
	StatusCode,
	header::{CACHE_CONTROL, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED},
};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use url::Url;
// self
use crate::{_prelude::*, cache::Validators};

/// Outcome of a single HTTP exchange against an endpoint.
#[derive(Debug)]
pub enum RawFetch {
	/// `304 Not Modified`; no body was transmitted.
	NotModified {
		/// Refreshed validators carried on the 304 response.
		validators: Validators,
	},
	/// `2xx` with a JSON body.
	Ok {
		/// Raw response body, not yet deserialized.
		body: bytes::Bytes,
		/// Validators carried on the response, to store alongside the cached payload.
		validators: Validators,
	},
}

/// Issue a conditional GET, applying `If-None-Match`/`If-Modified-Since` from the
/// supplied validators, honoring `timeout`, and aborting if `cancel` fires first.
pub async fn fetch(
	client: &Client,
	url: Url,
	validators: &Validators,
	timeout: Duration,
	cancel: &CancellationToken,
) -> Result<RawFetch> {
	let mut builder = client.get(url.clone()).timeout(timeout).header(CACHE_CONTROL, "no-cache");

	if let Some(etag) = &validators.etag {
		builder = builder.header(IF_NONE_MATCH, etag.as_str());
	}
	if let Some(last_modified) = validators.last_modified {
		builder = builder.header(IF_MODIFIED_SINCE, httpdate::fmt_http_date(last_modified.into()));
	}

	let start = Instant::now();
	let response = tokio::select! {
		biased;
		_ = cancel.cancelled() => return Err(Error::Aborted),
		result = builder.send() => result?,
	};
	let elapsed = start.elapsed();
	let status = response.status();
	let headers = response.headers().clone();
	let etag = headers.get(ETAG).and_then(|value| value.to_str().ok()).map(str::to_string);
	let last_modified = headers
		.get(LAST_MODIFIED)
		.and_then(|value| value.to_str().ok())
		.and_then(|raw| httpdate::parse_http_date(raw).ok())
		.map(DateTime::<Utc>::from);
	let validators = Validators { etag, last_modified };

	tracing::debug!(%url, %status, elapsed = ?elapsed, "endpoint fetch complete");

	if status == StatusCode::NOT_MODIFIED {
		return Ok(RawFetch::NotModified { validators });
	}
	if !status.is_success() {
		let body = response.text().await.ok();

		return Err(Error::HttpStatus { status, url, body });
	}

	let body = response.bytes().await?;

	Ok(RawFetch::Ok { body, validators })
}
