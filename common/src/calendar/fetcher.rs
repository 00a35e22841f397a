// Calendar fetcher: candidate endpoint fallback with bounded retries per attempt

use super::ics;
use crate::config::SourceConfig;
use crate::errors::FetchError;
use crate::models::{Entity, FetchOutcome, RawCalendarDocument};
use crate::retry::RetryStrategy;
use crate::telemetry;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Utc};
use reqwest::{header, Client, StatusCode, Url};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

const ACCEPT: &str = "text/calendar,text/plain;q=0.9,*/*;q=0.8";

/// Source of raw calendar documents, one entity at a time
///
/// Implementations never fail: problems are reported as the document's outcome.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CalendarSource: Send + Sync {
    async fn fetch(&self, entity: &Entity) -> RawCalendarDocument;
}

/// Semester flag for a date: October through February is the winter term (0)
pub fn semester_for(date: NaiveDate) -> u8 {
    match date.month() {
        10..=12 | 1 | 2 => 0,
        _ => 1,
    }
}

/// HTTP calendar fetcher for the publishing service
pub struct CalendarFetcher {
    client: Client,
    base_url: String,
    client_hint: String,
    current_semester: u8,
    entity_timeout: Duration,
    retry: Arc<dyn RetryStrategy>,
    /// Set once the landing page has been requested for session cookies
    session: OnceCell<()>,
}

impl CalendarFetcher {
    pub fn new(config: &SourceConfig, retry: Arc<dyn RetryStrategy>) -> Result<Self, FetchError> {
        let base_url = config.base_url.trim_end_matches('/').to_string();

        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static(ACCEPT));
        if let Ok(referer) = header::HeaderValue::from_str(&format!("{}/", base_url)) {
            headers.insert(header::REFERER, referer);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .cookie_store(true)
            .build()
            .map_err(|e| FetchError::ClientBuild(e.to_string()))?;

        let current_semester = config
            .semester
            .unwrap_or_else(|| semester_for(Utc::now().date_naive()));

        Ok(Self {
            client,
            base_url,
            client_hint: config.client_hint.clone(),
            current_semester,
            entity_timeout: Duration::from_secs(config.entity_timeout_seconds),
            retry,
            session: OnceCell::new(),
        })
    }

    /// Candidate endpoints in the order they are tried
    ///
    /// Explicit entity URL first, then current semester, other semester,
    /// and finally the semester-agnostic endpoint.
    pub fn candidate_urls(&self, entity: &Entity) -> Vec<String> {
        let mut candidates: Vec<String> = Vec::with_capacity(4);
        if let Some(explicit) = entity.calendar_url.as_deref().map(str::trim) {
            if !explicit.is_empty() {
                candidates.push(self.absolute(explicit));
            }
        }

        let hint = entity
            .calendar_hint
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or(&self.client_hint);
        let other_semester = 1 - self.current_semester.min(1);
        for semester in [Some(self.current_semester), Some(other_semester), None] {
            match self.endpoint(entity, hint, semester) {
                Some(url) => candidates.push(url),
                None => warn!(
                    natural_key = %entity.natural_key,
                    "Could not build calendar endpoint URL"
                ),
            }
        }

        let mut seen = std::collections::HashSet::new();
        candidates.retain(|url| seen.insert(url.clone()));
        candidates
    }

    /// Same endpoint asking the site to authenticate the request
    pub fn authenticated_url(url: &str) -> String {
        let separator = if url.contains('?') { '&' } else { '?' };
        format!("{}{}authenticate=true", url, separator)
    }

    /// Request the landing page once so the cookie store holds a site session
    async fn prime_session(&self) {
        self.session
            .get_or_init(|| async {
                let url = format!("{}/", self.base_url);
                match self.client.get(&url).send().await {
                    Ok(response) => {
                        debug!(status = response.status().as_u16(), "Site session primed")
                    }
                    Err(e) => warn!(url = %url, error = %e, "Could not prime site session"),
                }
            })
            .await;
    }

    fn absolute(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            format!("{}/{}", self.base_url, url.trim_start_matches('/'))
        }
    }

    fn endpoint(&self, entity: &Entity, hint: &str, semester: Option<u8>) -> Option<String> {
        let mut url =
            Url::parse(&format!("{}/{}", self.base_url, entity.kind.calendar_script())).ok()?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("ID", entity.natural_key.as_str());
            query.append_pair("KIND", hint);
            if let Some(s) = semester {
                query.append_pair("S", &s.to_string());
            }
        }
        Some(url.to_string())
    }

    /// One HTTP attempt, classified
    async fn attempt(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            return Err(FetchError::RetryableStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        if status.is_client_error() {
            return Err(FetchError::NotFound {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.text().await.map_err(|e| FetchError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if ics::has_calendar_preamble(&body) {
            Ok(body)
        } else {
            Err(FetchError::EndpointMismatch {
                url: url.to_string(),
            })
        }
    }

    /// Try one candidate, retrying transport failures and 5xx/429
    async fn fetch_candidate(&self, url: &str, attempts: &AtomicU32) -> Result<String, FetchError> {
        let mut attempt = 0;
        loop {
            attempts.fetch_add(1, Ordering::Relaxed);
            match self.attempt(url).await {
                Ok(body) => return Ok(body),
                Err(e) if e.is_retryable() => match self.retry.next_delay(attempt) {
                    Some(delay) => {
                        warn!(
                            url = url,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Calendar request failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => return Err(e),
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Try a candidate; a non-calendar body is retried once with authentication
    async fn fetch_endpoint(
        &self,
        url: String,
        attempts: &AtomicU32,
    ) -> Result<(String, String), FetchError> {
        match self.fetch_candidate(&url, attempts).await {
            Ok(body) => Ok((url, body)),
            Err(FetchError::EndpointMismatch { .. }) if !url.contains("authenticate=true") => {
                let authenticated = Self::authenticated_url(&url);
                debug!(url = %url, "Endpoint returned no calendar, retrying with authentication");
                let body = self.fetch_candidate(&authenticated, attempts).await?;
                Ok((authenticated, body))
            }
            Err(e) => Err(e),
        }
    }

    async fn fetch_candidates(&self, entity: &Entity, attempts: &AtomicU32) -> RawCalendarDocument {
        let mut transport_exhausted = false;
        self.prime_session().await;

        for url in self.candidate_urls(entity) {
            match self.fetch_endpoint(url, attempts).await {
                Ok((url, body)) => {
                    let outcome = if ics::has_events(&body) {
                        FetchOutcome::Success
                    } else {
                        FetchOutcome::Empty
                    };
                    debug!(url = %url, outcome = outcome.as_str(), "Calendar endpoint accepted");
                    return RawCalendarDocument {
                        entity: entity.clone(),
                        body,
                        source_url: Some(url),
                        outcome,
                        attempts: attempts.load(Ordering::Relaxed),
                    };
                }
                Err(e) => {
                    if e.is_retryable() {
                        transport_exhausted = true;
                    }
                    debug!(error = %e, "Calendar endpoint rejected, trying next candidate");
                }
            }
        }

        let outcome = if transport_exhausted {
            FetchOutcome::Error
        } else {
            FetchOutcome::NotFound
        };
        RawCalendarDocument::failed(entity.clone(), outcome, attempts.load(Ordering::Relaxed))
    }
}

#[async_trait]
impl CalendarSource for CalendarFetcher {
    #[instrument(skip(self, entity), fields(kind = %entity.kind, natural_key = %entity.natural_key))]
    async fn fetch(&self, entity: &Entity) -> RawCalendarDocument {
        let started = Instant::now();
        let attempts = AtomicU32::new(0);

        let document = match tokio::time::timeout(
            self.entity_timeout,
            self.fetch_candidates(entity, &attempts),
        )
        .await
        {
            Ok(document) => document,
            Err(_) => {
                let attempts = attempts.load(Ordering::Relaxed);
                warn!(
                    timeout_secs = self.entity_timeout.as_secs(),
                    attempts = attempts,
                    "Calendar fetch abandoned after timeout"
                );
                RawCalendarDocument::failed(entity.clone(), FetchOutcome::Error, attempts)
            }
        };

        telemetry::record_fetch(
            entity.kind,
            document.outcome,
            started.elapsed().as_secs_f64(),
        );
        if document.outcome == FetchOutcome::Success {
            debug!(attempts = document.attempts, "Calendar fetched");
        } else {
            info!(
                outcome = document.outcome.as_str(),
                attempts = document.attempts,
                "Calendar not available"
            );
        }
        document
    }
}
