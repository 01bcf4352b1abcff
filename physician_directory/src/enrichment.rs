use std::{
    collections::HashMap,
    sync::{
        Arc, LazyLock, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use futures::{StreamExt, stream::FuturesUnordered};
use regex::Regex;
use reqwest::Client;
use serde::Serialize;

use crate::{
    common::{fetch_text, looks_blocked, truncate_for_log},
    config::EnrichmentConfig,
    error::FetchError,
    rate_limiter::{AdaptiveRateLimiter, run_with_retry},
    store::{DirectoryStore, EnrichmentStatus},
};

static GENDER_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"<span class="scrp-gender-value">\s*([^<]+)\s*<"#).expect("valid gender regex")
});

static GENDER_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)Gender:[^<]*<span[^>]*>\s*([^<]+)\s*").expect("valid gender label regex")
});

/// What a profile lookup found, as opposed to a failure to look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnrichmentOutcome {
    Value(String),
    /// The page was served but carries no recognizable value.
    NoMatch,
    /// The registry has no such practitioner.
    NotFound,
}

#[async_trait]
pub trait EnrichmentSource: Send + Sync {
    async fn fetch(&self, registration_number: &str) -> Result<EnrichmentOutcome, FetchError>;
}

/// Extracts the demographic field from a profile page.
pub fn parse_profile_document(html: &str) -> Result<EnrichmentOutcome, FetchError> {
    let found = GENDER_VALUE
        .captures(html)
        .or_else(|| GENDER_LABEL.captures(html))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim())
        .filter(|v| !v.is_empty());
    if let Some(value) = found {
        return Ok(EnrichmentOutcome::Value(value.to_string()));
    }
    if looks_blocked(html) {
        return Err(FetchError::Blocked(format!(
            "challenge page: {}",
            truncate_for_log(html)
        )));
    }
    if html.contains("No physician found") || html.contains("not found") {
        return Ok(EnrichmentOutcome::NotFound);
    }
    Ok(EnrichmentOutcome::NoMatch)
}

/// Public profile pages, one GET per registration number.
pub struct ProfilePageSource {
    client: Client,
    base_url: String,
}

impl ProfilePageSource {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl EnrichmentSource for ProfilePageSource {
    async fn fetch(&self, registration_number: &str) -> Result<EnrichmentOutcome, FetchError> {
        let request = self
            .client
            .get(&self.base_url)
            .query(&[("cpsonum", registration_number)]);
        let html = fetch_text(request).await?;
        parse_profile_document(&html)
    }
}

/// Latest known enrichment values, shared with whoever projects search results.
pub type EnrichmentProjection = Arc<Mutex<HashMap<String, String>>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnrichmentResult {
    pub registration_number: String,
    pub status: EnrichmentStatus,
    pub value: Option<String>,
    pub error: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnrichmentReport {
    pub requested: usize,
    pub enriched: usize,
    pub not_found: usize,
    pub no_match: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub results: Vec<EnrichmentResult>,
}

impl EnrichmentReport {
    fn absorb(&mut self, result: EnrichmentResult) {
        match result.status {
            EnrichmentStatus::Ok => self.enriched += 1,
            EnrichmentStatus::NotFound => self.not_found += 1,
            EnrichmentStatus::NoMatch => self.no_match += 1,
            EnrichmentStatus::Error => self.failed += 1,
        }
        self.results.push(result);
    }
}

/// Fetches enrichment one record at a time through its own paced client.
pub struct EnrichmentWorker {
    source: Arc<dyn EnrichmentSource>,
    limiter: AdaptiveRateLimiter,
    store: Arc<DirectoryStore>,
    config: EnrichmentConfig,
    projection: EnrichmentProjection,
    shutdown: Arc<AtomicBool>,
}

impl EnrichmentWorker {
    pub fn new(
        source: Arc<dyn EnrichmentSource>,
        store: Arc<DirectoryStore>,
        config: EnrichmentConfig,
    ) -> Self {
        Self {
            source,
            limiter: AdaptiveRateLimiter::new("enrichment", &config.limiter),
            store,
            config,
            projection: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn with_projection(mut self, projection: EnrichmentProjection) -> Self {
        self.projection = projection;
        self
    }

    pub fn projection(&self) -> &EnrichmentProjection {
        &self.projection
    }

    pub async fn enrich_one(&self, registration_number: &str) -> EnrichmentResult {
        let label = format!("enrichment {registration_number}");
        let (result, attempts) = run_with_retry(&self.config.retry, &label, || async move {
            self.limiter.acquire().await;
            let result = self.source.fetch(registration_number).await;
            self.limiter.record_result(&result);
            result
        })
        .await;

        let (status, value, error) = match result {
            Ok(EnrichmentOutcome::Value(v)) => (EnrichmentStatus::Ok, Some(v), None),
            Ok(EnrichmentOutcome::NoMatch) => (EnrichmentStatus::NoMatch, None, None),
            Ok(EnrichmentOutcome::NotFound) | Err(FetchError::NotFound(_)) => {
                (EnrichmentStatus::NotFound, None, None)
            }
            Err(err) => {
                tracing::warn!(
                    "enrichment for {registration_number} failed after {attempts} attempt(s): {err}"
                );
                (EnrichmentStatus::Error, None, Some(err.to_string()))
            }
        };

        if let Err(err) = self
            .store
            .record_enrichment(registration_number, status, value.as_deref())
        {
            tracing::warn!("failed storing enrichment for {registration_number}: {err:#}");
        }
        if let Some(v) = &value {
            let mut guard = match self.projection.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.insert(registration_number.to_string(), v.clone());
        }

        EnrichmentResult {
            registration_number: registration_number.to_string(),
            status,
            value,
            error,
            attempts,
        }
    }

    /// Enriches the given records in small concurrent batches.
    ///
    /// Stops between batches once shutdown is requested; the rest count as cancelled.
    pub async fn enrich(&self, registration_numbers: &[String]) -> EnrichmentReport {
        let mut report = EnrichmentReport {
            requested: registration_numbers.len(),
            ..Default::default()
        };
        let concurrency = self.config.concurrency.max(1);
        for (i, batch) in registration_numbers.chunks(concurrency).enumerate() {
            if self.shutdown.load(Ordering::SeqCst) {
                report.cancelled = registration_numbers.len() - i * concurrency;
                tracing::warn!("enrichment stopped early, {} left", report.cancelled);
                break;
            }
            let mut in_flight: FuturesUnordered<_> =
                batch.iter().map(|reg| self.enrich_one(reg)).collect();
            while let Some(result) = in_flight.next().await {
                report.absorb(result);
            }
        }
        tracing::info!(
            "enrichment: {} requested, {} enriched, {} not found, {} no match, {} failed",
            report.requested,
            report.enriched,
            report.not_found,
            report.no_match,
            report.failed
        );
        report
    }

    /// One low-priority pass over stored records still lacking enrichment.
    pub async fn run_pending(&self, limit: usize) -> anyhow::Result<EnrichmentReport> {
        let pending = self.store.pending_enrichment(limit)?;
        if pending.is_empty() {
            tracing::debug!("no records pending enrichment");
            return Ok(EnrichmentReport::default());
        }
        Ok(self.enrich(&pending).await)
    }
}
