//! Client for the upstream "recently played" feed.

mod models;

pub use models::{ArtistObject, PlayedItem, RecentlyPlayedPage, TrackObject};

use crate::pipeline::RawPlayRecord;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const RECENTLY_PLAYED_PATH: &str = "/me/player/recently-played";
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Errors from the upstream feed. All of them are fatal for the run; the
/// external orchestrator owns retries.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed upstream payload: {0}")]
    MalformedPayload(String),
}

/// Bearer token valid for one run. It is passed explicitly into the
/// extractor instead of living as process-wide ambient state; the refresh
/// call that produces it is an external collaborator.
#[derive(Clone)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never leak the token into logs.
        f.write_str("AccessToken(***)")
    }
}

/// Source of recently-played records. The HTTP client is the production
/// implementation; tests substitute a stub behind the same trait.
pub trait RecentlyPlayedSource: Send + Sync {
    /// Fetch every play strictly after the `after_ms` epoch-millisecond
    /// watermark, paginating until the feed is exhausted.
    fn fetch_after(&self, after_ms: i64) -> Result<Vec<RawPlayRecord>, UpstreamError>;
}

/// Blocking HTTP client for the recently-played endpoint.
pub struct RecentlyPlayedClient {
    http: reqwest::blocking::Client,
    base_url: String,
    token: AccessToken,
    page_limit: u32,
}

impl RecentlyPlayedClient {
    pub fn new(base_url: &str, token: AccessToken, page_limit: u32) -> Result<Self, UpstreamError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            page_limit,
        })
    }

    fn fetch_page(&self, url: &str, with_params: Option<i64>) -> Result<RecentlyPlayedPage, UpstreamError> {
        let mut request = self
            .http
            .get(url)
            .bearer_auth(self.token.as_str());
        if let Some(after_ms) = with_params {
            request = request.query(&[
                ("after", after_ms.to_string()),
                ("limit", self.page_limit.to_string()),
            ]);
        }
        let response = request.send()?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            return Err(UpstreamError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<RecentlyPlayedPage>()
            .map_err(|e| UpstreamError::MalformedPayload(e.to_string()))
    }
}

impl RecentlyPlayedSource for RecentlyPlayedClient {
    fn fetch_after(&self, after_ms: i64) -> Result<Vec<RawPlayRecord>, UpstreamError> {
        let first_url = format!("{}{}", self.base_url, RECENTLY_PLAYED_PATH);
        let mut records = Vec::new();
        let mut next_url: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = match &next_url {
                // Cursor URLs from the feed already carry their parameters.
                Some(url) => self.fetch_page(url, None)?,
                None => self.fetch_page(&first_url, Some(after_ms))?,
            };

            let items = page.items.ok_or_else(|| {
                UpstreamError::MalformedPayload("response has no 'items' array".to_string())
            })?;
            pages += 1;
            debug!("Fetched page {} with {} items", pages, items.len());

            let exhausted = items.is_empty();
            records.extend(items.into_iter().map(PlayedItem::into_record));

            match page.next {
                Some(url) if !exhausted => next_url = Some(url),
                _ => break,
            }
        }

        info!(
            "Fetched {} recently played tracks across {} page(s)",
            records.len(),
            pages
        );
        Ok(records)
    }
}
