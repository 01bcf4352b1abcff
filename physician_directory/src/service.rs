use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use anyhow::{Context, Result, anyhow};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::Client;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::{
    config::DirectoryConfig,
    constants::USER_AGENT,
    enrichment::{EnrichmentReport, EnrichmentSource, EnrichmentWorker, ProfilePageSource},
    expander::{FailedQuery, RegistryQueryExpander, SearchReport},
    fanout::ParallelFanoutClient,
    geo::{GeoContainmentFilter, haversine_km},
    geocode::{BatchGeocodeReport, GeocodeCache, GeocodeLookup, GeocoderChain},
    models::{Coordinates, PhysicianRecord},
    postal::PostalCode,
    rate_limiter::AdaptiveRateLimiter,
    registry::{HttpRegistryClient, RegistryTransport, SearchFilters},
    store::{DirectoryStore, StoreStats, UpsertSummary},
};

/// Where a radius search is centered.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchCenter {
    Coordinates(Coordinates),
    /// Free-form address or postal code, resolved through the geocode cache.
    Address(String),
}

#[derive(Debug, Clone)]
pub struct RadiusSearchRequest {
    pub center: SearchCenter,
    pub radius_km: f64,
    pub filters: SearchFilters,
    /// Query the registry even for areas already in the store.
    pub refresh: bool,
    /// Resolve missing coordinates of result addresses.
    pub geocode_results: bool,
    /// Run enrichment inline instead of in the background.
    pub wait_for_enrichment: bool,
}

impl RadiusSearchRequest {
    pub fn new(center: SearchCenter, radius_km: f64) -> Self {
        Self {
            center,
            radius_km,
            filters: SearchFilters::default(),
            refresh: false,
            geocode_results: true,
            wait_for_enrichment: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhysicianHit {
    #[serde(flatten)]
    pub record: PhysicianRecord,
    pub coordinates: Option<Coordinates>,
    pub distance_km: Option<f64>,
}

/// Registry expansion outcome without the records themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchSummary {
    pub records: usize,
    pub leaves_resolved: usize,
    pub requests_issued: usize,
    pub codes_visited: usize,
    pub duplicates_skipped: usize,
    pub passes: usize,
    pub partial_coverage: Vec<String>,
    pub failures: Vec<FailedQuery>,
}

impl From<&SearchReport> for SearchSummary {
    fn from(report: &SearchReport) -> Self {
        Self {
            records: report.records.len(),
            leaves_resolved: report.leaves_resolved,
            requests_issued: report.requests_issued,
            codes_visited: report.codes_visited,
            duplicates_skipped: report.duplicates_skipped,
            passes: report.passes,
            partial_coverage: report.partial_coverage.clone(),
            failures: report.failures.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RadiusSearchResponse {
    pub center: Coordinates,
    pub radius_km: f64,
    pub areas: Vec<String>,
    pub used_polygons: bool,
    pub postal_codes_in_range: usize,
    pub queried_prefixes: Vec<String>,
    pub served_from_store: Vec<String>,
    pub physicians: Vec<PhysicianHit>,
    pub with_coordinates: usize,
    pub without_coordinates: usize,
    pub search: Option<SearchSummary>,
    pub upsert: Option<UpsertSummary>,
    pub geocoding: Option<BatchGeocodeReport>,
    pub enrichment_scheduled: bool,
    pub enrichment: Option<EnrichmentReport>,
    pub warnings: Vec<String>,
    /// No failed queries, no partial coverage and no warnings.
    pub complete: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExpandResponse {
    pub seeds: Vec<String>,
    pub search: SearchSummary,
    pub upsert: Option<UpsertSummary>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DirectoryStats {
    #[serde(flatten)]
    pub store: StoreStats,
    pub area_polygons: usize,
    pub postal_code_points: usize,
    pub geocoders: Vec<String>,
}

/// Everything the service talks to, injectable for tests.
pub struct ServiceComponents {
    pub store: Arc<DirectoryStore>,
    pub registry: Arc<dyn RegistryTransport>,
    pub geocoders: GeocoderChain,
    pub enrichment: Arc<dyn EnrichmentSource>,
    pub containment: GeoContainmentFilter,
}

/// Owns storage and network clients for the directory, with an explicit
/// open/shutdown lifecycle.
pub struct DirectoryService {
    config: DirectoryConfig,
    store: Arc<DirectoryStore>,
    expander: Arc<RegistryQueryExpander>,
    geocodes: Arc<GeocodeCache>,
    enrichment: Arc<EnrichmentWorker>,
    containment: GeoContainmentFilter,
    shutdown: Arc<AtomicBool>,
    background: Mutex<Vec<JoinHandle<()>>>,
    show_progress: bool,
}

impl DirectoryService {
    pub fn open(config: DirectoryConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout)
            .build()
            .context("Failed creating HTTP client")?;
        let store = Arc::new(DirectoryStore::open(&config.db_path)?);

        let containment = match &config.postal_points_path {
            Some(points) => GeoContainmentFilter::load(config.areas_path.as_deref(), points)?,
            None => {
                tracing::warn!("no postal-code points configured; radius search needs them");
                GeoContainmentFilter::default()
            }
        };

        let components = ServiceComponents {
            store,
            registry: Arc::new(HttpRegistryClient::new(
                client.clone(),
                config.registry.search_url.clone(),
                config.registry.overflow_sentinel,
            )),
            geocoders: GeocoderChain::from_config(&client, &config.geocoding),
            enrichment: Arc::new(ProfilePageSource::new(
                client,
                config.enrichment.profile_base_url.clone(),
            )),
            containment,
        };
        Ok(Self::with_components(config, components))
    }

    pub fn with_components(config: DirectoryConfig, components: ServiceComponents) -> Self {
        let shutdown = Arc::new(AtomicBool::new(false));
        let limiter = Arc::new(AdaptiveRateLimiter::new(
            "registry",
            &config.registry.limiter,
        ));
        let expander = RegistryQueryExpander::new(
            components.registry,
            limiter,
            SearchFilters::default(),
            config.registry.max_enumerable,
        );
        let geocodes = GeocodeCache::new(
            Arc::clone(&components.store),
            components.geocoders,
            config.geocoding.concurrency,
        );
        let enrichment = EnrichmentWorker::new(
            components.enrichment,
            Arc::clone(&components.store),
            config.enrichment.clone(),
        )
        .with_shutdown(Arc::clone(&shutdown));

        Self {
            store: components.store,
            expander: Arc::new(expander),
            geocodes: Arc::new(geocodes),
            enrichment: Arc::new(enrichment),
            containment: components.containment,
            shutdown,
            background: Mutex::new(Vec::new()),
            show_progress: false,
            config,
        }
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Flag checked between batches; raising it winds work down.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn progress_bar(&self, label: &str) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let progress = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::with_template(&format!(
            "{{spinner:.green}} [{label} {{elapsed_precise}}] [{{bar:40.cyan/blue}}] {{pos}}/{{len}} {{msg}}"
        )) {
            progress.set_style(style.progress_chars("=> "));
        }
        progress
    }

    async fn fan_out(&self, seeds: Vec<PostalCode>, filters: &SearchFilters) -> SearchReport {
        let expander = if filters == self.expander.filters() {
            Arc::clone(&self.expander)
        } else {
            Arc::new(self.expander.with_filters(filters.clone()))
        };
        ParallelFanoutClient::new(expander, self.config.fanout.clone())
            .with_shutdown(Arc::clone(&self.shutdown))
            .with_progress(self.progress_bar("registry"))
            .search(seeds)
            .await
    }

    /// Upserts the expansion's records, then records which of `areas` it
    /// covered completely under `filters`.
    fn reconcile(
        &self,
        report: &SearchReport,
        areas: &[String],
        filters: &SearchFilters,
        warnings: &mut Vec<String>,
    ) -> Option<UpsertSummary> {
        let records = &report.records;
        let summary = match self.store.upsert_batch(records) {
            Ok(summary) => {
                tracing::info!(
                    "reconciled {} records: {} inserted, {} updated, {} unchanged",
                    records.len(),
                    summary.inserted,
                    summary.updated,
                    summary.unchanged
                );
                summary
            }
            Err(err) => {
                tracing::warn!("reconciliation batch rolled back: {err:#}");
                warnings.push(format!("reconciliation failed and was rolled back: {err:#}"));
                return None;
            }
        };

        let incomplete = report.incomplete_areas();
        if !incomplete.is_empty() {
            tracing::info!(
                "not caching incomplete areas: {}",
                incomplete.iter().cloned().collect::<Vec<_>>().join(", ")
            );
        }
        if let Err(err) =
            self.store
                .record_area_search(&filters.cache_key(), areas, &incomplete, records)
        {
            tracing::warn!("failed recording searched areas: {err:#}");
            warnings.push(format!("searched areas were not recorded: {err:#}"));
        }
        Some(summary)
    }

    async fn resolve_center(
        &self,
        center: &SearchCenter,
    ) -> Result<(Coordinates, Option<PostalCode>)> {
        match center {
            SearchCenter::Coordinates(c) if c.is_valid() => Ok((*c, None)),
            SearchCenter::Coordinates(c) => Err(anyhow!("invalid center {}, {}", c.lat, c.lng)),
            SearchCenter::Address(raw) => {
                let postal = PostalCode::parse(raw);
                if let Some(point) = postal.as_ref().and_then(|code| self.containment.point(code)) {
                    return Ok((point.center, postal));
                }
                match self.geocodes.lookup(raw).await {
                    GeocodeLookup::Cached(entry) | GeocodeLookup::Resolved(entry) => {
                        Ok((entry.coordinates, postal))
                    }
                    GeocodeLookup::Unresolved => Err(anyhow!("no geocoder matched {raw:?}")),
                    GeocodeLookup::Failed(err) => {
                        Err(anyhow!("could not geocode search center {raw:?}: {err}"))
                    }
                }
            }
        }
    }

    /// Finds physicians within `radius_km` of a center.
    ///
    /// Areas whose last search with the same filters completed without
    /// failures or partial coverage are served from the store unless
    /// `refresh` is set; the rest are expanded against the registry and
    /// reconciled first.
    pub async fn radius_search(&self, request: RadiusSearchRequest) -> Result<RadiusSearchResponse> {
        if !(request.radius_km.is_finite() && request.radius_km > 0.0) {
            return Err(anyhow!("radius must be positive, got {}", request.radius_km));
        }
        let (center, center_code) = self.resolve_center(&request.center).await?;
        let mut warnings = Vec::new();

        let containment = self.containment.contained(center, request.radius_km);
        let mut areas = containment.areas.clone();
        if areas.is_empty()
            && let Some(code) = &center_code
        {
            warnings.push("no reference area covers the center; using its own area".to_string());
            areas.push(code.fsa().to_string());
        }
        tracing::info!(
            "radius search at {:.4},{:.4} r={}km: {} areas ({} postal codes, polygons={})",
            center.lat,
            center.lng,
            request.radius_km,
            areas.len(),
            containment.postal_codes.len(),
            containment.used_polygons
        );

        let filters_key = request.filters.cache_key();
        let stored = if request.refresh {
            HashSet::new()
        } else {
            self.store.completed_areas(&areas, &filters_key)?
        };
        let (served_from_store, queried): (Vec<String>, Vec<String>) =
            areas.iter().cloned().partition(|a| stored.contains(a));

        let mut search = None;
        let mut upsert = None;
        if !queried.is_empty() {
            let seeds: Vec<PostalCode> =
                queried.iter().filter_map(|a| PostalCode::parse(a)).collect();
            let report = self.fan_out(seeds, &request.filters).await;
            upsert = self.reconcile(&report, &queried, &request.filters, &mut warnings);
            search = Some(SearchSummary::from(&report));
        }

        let mut rows = self.store.physicians_in_searched_areas(&areas, &filters_key)?;
        let mut geocoding = None;
        if request.geocode_results {
            let missing: Vec<String> = rows
                .iter()
                .filter(|r| r.coordinates.is_none())
                .map(|r| r.record.address.clone())
                .collect::<HashSet<_>>()
                .into_iter()
                .collect();
            if !missing.is_empty() {
                let report = self.geocodes.geocode_addresses(&missing).await;
                for row in rows.iter_mut().filter(|r| r.coordinates.is_none()) {
                    row.coordinates = report
                        .results
                        .iter()
                        .find(|g| g.address == row.record.address)
                        .and_then(|g| g.coordinates);
                }
                if report.failed > 0 {
                    warnings.push(format!("{} addresses could not be geocoded", report.failed));
                }
                geocoding = Some(report);
            }
        }

        let mut physicians: Vec<PhysicianHit> = rows
            .into_iter()
            .filter_map(|row| {
                let exact = row.coordinates.map(|c| haversine_km(center, c));
                if exact.is_some_and(|d| d > request.radius_km) {
                    return None;
                }
                Some(PhysicianHit {
                    record: row.record,
                    coordinates: row.coordinates,
                    distance_km: exact.map(|d| (d * 10.0).round() / 10.0),
                })
            })
            .collect();
        physicians.sort_by(|a, b| match (a.distance_km, b.distance_km) {
            (Some(x), Some(y)) => x.total_cmp(&y).then_with(|| a.record.name.cmp(&b.record.name)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.record.name.cmp(&b.record.name),
        });

        let mut enrichment = None;
        let enrichment_scheduled = if request.wait_for_enrichment {
            enrichment = Some(self.enrich_pending(self.config.enrichment.batch_size).await?);
            false
        } else {
            self.spawn_background_enrichment()
        };
        self.apply_projection(&mut physicians);

        let with_coordinates = physicians.iter().filter(|p| p.coordinates.is_some()).count();
        let complete = warnings.is_empty()
            && search
                .as_ref()
                .is_none_or(|s| s.failures.is_empty() && s.partial_coverage.is_empty());
        Ok(RadiusSearchResponse {
            center,
            radius_km: request.radius_km,
            used_polygons: containment.used_polygons,
            postal_codes_in_range: containment.postal_codes.len(),
            areas,
            queried_prefixes: queried,
            served_from_store,
            without_coordinates: physicians.len() - with_coordinates,
            with_coordinates,
            physicians,
            search,
            upsert,
            geocoding,
            enrichment_scheduled,
            enrichment,
            warnings,
            complete,
        })
    }

    fn apply_projection(&self, physicians: &mut [PhysicianHit]) {
        let projection = match self.enrichment.projection().lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        for hit in physicians.iter_mut().filter(|h| !h.record.has_enrichment()) {
            if let Some(value) = hit
                .record
                .registration_number
                .as_ref()
                .and_then(|reg| projection.get(reg))
            {
                hit.record.enrichment = Some(value.clone());
            }
        }
    }

    /// Fan-out expansion of explicit seeds, reconciled into the store.
    pub async fn expand(
        &self,
        seeds: Vec<PostalCode>,
        filters: Option<SearchFilters>,
    ) -> ExpandResponse {
        let filters = filters.unwrap_or_else(|| self.expander.filters().clone());
        let seed_labels = seeds.iter().map(ToString::to_string).collect();
        let areas: Vec<String> = seeds
            .iter()
            .filter(|seed| seed.as_str() == seed.fsa())
            .map(|seed| seed.as_str().to_string())
            .collect();
        let report = self.fan_out(seeds, &filters).await;
        let mut warnings = Vec::new();
        let upsert = self.reconcile(&report, &areas, &filters, &mut warnings);
        ExpandResponse {
            seeds: seed_labels,
            search: SearchSummary::from(&report),
            upsert,
            warnings,
        }
    }

    /// Fetches enrichment for specific registration numbers right away.
    pub async fn fetch_enrichment(&self, registration_numbers: &[String]) -> EnrichmentReport {
        self.enrichment.enrich(registration_numbers).await
    }

    pub async fn enrich_pending(&self, limit: usize) -> Result<EnrichmentReport> {
        self.enrichment.run_pending(limit).await
    }

    pub async fn geocode_addresses(&self, addresses: &[String]) -> BatchGeocodeReport {
        self.geocodes.geocode_addresses(addresses).await
    }

    pub fn stats(&self) -> Result<DirectoryStats> {
        Ok(DirectoryStats {
            store: self.store.stats()?,
            area_polygons: self.containment.area_count(),
            postal_code_points: self.containment.point_count(),
            geocoders: self
                .geocodes
                .chain()
                .provider_ids()
                .into_iter()
                .map(str::to_string)
                .collect(),
        })
    }

    /// Starts a low-priority enrichment pass unless shutdown was requested
    /// or a previous pass is still running.
    pub fn spawn_background_enrichment(&self) -> bool {
        if self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        let mut background = match self.background.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        background.retain(|h| !h.is_finished());
        if !background.is_empty() {
            tracing::debug!("background enrichment already running; not starting another pass");
            return false;
        }
        let worker = Arc::clone(&self.enrichment);
        let limit = self.config.enrichment.batch_size;
        let handle = tokio::spawn(async move {
            match worker.run_pending(limit).await {
                Ok(report) if report.requested > 0 => tracing::info!(
                    "background enrichment: {} enriched, {} failed, {} cancelled",
                    report.enriched,
                    report.failed,
                    report.cancelled
                ),
                Ok(_) => {}
                Err(err) => tracing::warn!("background enrichment failed: {err:#}"),
            }
        });
        background.push(handle);
        true
    }

    /// Waits for background passes started so far to finish.
    pub async fn wait_for_background(&self) {
        let handles: Vec<_> = {
            let mut background = match self.background.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            background.drain(..).collect()
        };
        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!("background task ended abnormally: {err}");
            }
        }
    }

    /// Raises the shutdown flag, drains background work and closes the store.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wait_for_background().await;

        let DirectoryService {
            store,
            expander,
            geocodes,
            enrichment,
            ..
        } = self;
        drop((expander, geocodes, enrichment));
        match Arc::try_unwrap(store) {
            Ok(store) => store.close(),
            Err(_) => {
                tracing::warn!("store still shared at shutdown; leaving it to close on drop");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enrichment::EnrichmentOutcome;
    use crate::error::FetchError;
    use crate::geo::PostalCodePoint;
    use crate::rate_limiter::{LimiterConfig, RetryPolicy};
    use crate::registry::RegistryEntry;
    use crate::test_support::{ScriptedRegistry, TableEnrichment, TableGeocoder, entry};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::time::Duration;

    const CENTER: Coordinates = Coordinates {
        lat: 43.6532,
        lng: -79.3832,
    };

    fn test_config() -> DirectoryConfig {
        let mut config = DirectoryConfig::default();
        config.registry.limiter = LimiterConfig::unpaced();
        config.fanout.batch_delay = Duration::ZERO;
        config.fanout.retry = RetryPolicy::no_delay(2);
        config.geocoding.limiter = LimiterConfig::unpaced();
        config.geocoding.retry = RetryPolicy::no_delay(1);
        config.enrichment.limiter = LimiterConfig::unpaced();
        config.enrichment.retry = RetryPolicy::no_delay(1);
        config
    }

    struct Fixture {
        service: DirectoryService,
        registry: Arc<ScriptedRegistry>,
        geocoder: Arc<TableGeocoder>,
        enrichment: Arc<TableEnrichment>,
    }

    fn listed(name: &str, reg: &str, street: &str, postal: &str) -> RegistryEntry {
        let mut listed = entry(name, Some(reg), street);
        listed.postalcode = Some(postal.into());
        listed
    }

    fn near() -> RegistryEntry {
        listed("Near, Ann", "100", "1 King St W", "M5H 1A1")
    }

    fn far() -> RegistryEntry {
        listed("Far, Bob", "200", "900 Bay St", "M5H 1A2")
    }

    /// M5H and M5J reference points; M5J lies about 0.95 km from `CENTER`.
    fn components(
        registry: Arc<ScriptedRegistry>,
        geocoder: Arc<TableGeocoder>,
        enrichment: Arc<dyn EnrichmentSource>,
    ) -> ServiceComponents {
        let points = vec![
            PostalCodePoint {
                code: "M5H".into(),
                area_prefix: "M5H".into(),
                center: CENTER,
            },
            PostalCodePoint {
                code: "M5J".into(),
                area_prefix: "M5J".into(),
                center: Coordinates::new(43.645, -79.38),
            },
        ];
        ServiceComponents {
            store: Arc::new(DirectoryStore::open_in_memory().unwrap()),
            registry,
            geocoders: GeocoderChain::new(RetryPolicy::no_delay(1))
                .with_provider(geocoder, &LimiterConfig::unpaced()),
            enrichment,
            containment: GeoContainmentFilter::new(Vec::new(), points),
        }
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ScriptedRegistry::default());
        registry.entries("M5H", vec![near(), far()]);
        registry.fail("M5J", FetchError::Malformed("html".into()));

        let geocoder = Arc::new(
            TableGeocoder::new("municipal")
                .with("1 King St W, Toronto, ON, M5H 1A1", 43.6532, -79.3832 + 0.005)
                .with("900 Bay St, Toronto, ON, M5H 1A2", 43.75, -79.3832),
        );
        let enrichment = Arc::new(TableEnrichment::default());
        enrichment.set("100", Ok(EnrichmentOutcome::Value("Female".into())));

        let components = components(registry.clone(), geocoder.clone(), enrichment.clone());
        Fixture {
            service: DirectoryService::with_components(test_config(), components),
            registry,
            geocoder,
            enrichment,
        }
    }

    #[tokio::test]
    async fn radius_search_reconciles_and_filters_by_distance() {
        let f = fixture();
        let mut request = RadiusSearchRequest::new(SearchCenter::Coordinates(CENTER), 2.0);
        request.wait_for_enrichment = true;
        let response = f.service.radius_search(request).await.unwrap();

        assert_eq!(response.areas, vec!["M5H", "M5J"]);
        assert_eq!(response.queried_prefixes, vec!["M5H", "M5J"]);
        assert_eq!(response.upsert.unwrap().inserted, 2);
        assert_eq!(response.physicians.len(), 1);
        let hit = &response.physicians[0];
        assert_eq!(hit.record.name, "Near, Ann");
        assert_eq!(hit.distance_km, Some(0.4));
        assert_eq!(hit.record.enrichment.as_deref(), Some("Female"));

        let search = response.search.unwrap();
        assert_eq!(search.failures.len(), 1);
        assert_eq!(search.failures[0].kind, "malformed");
        assert!(!response.complete);
    }

    #[tokio::test]
    async fn repeated_search_is_served_from_store() {
        let f = fixture();
        let request = RadiusSearchRequest::new(SearchCenter::Coordinates(CENTER), 2.0);
        f.service.radius_search(request.clone()).await.unwrap();
        f.service.wait_for_background().await;
        let calls = f.registry.total_calls();
        let geocodes = f.geocoder.calls();

        let response = f.service.radius_search(request.clone()).await.unwrap();
        assert_eq!(response.served_from_store, vec!["M5H"]);
        assert_eq!(response.queried_prefixes, vec!["M5J"]);
        assert_eq!(f.geocoder.calls(), geocodes);
        assert_eq!(response.physicians.len(), 1);
        // Only the failing prefix is asked again.
        assert_eq!(f.registry.total_calls(), calls + 1);

        let mut refresh = request;
        refresh.refresh = true;
        let response = f.service.radius_search(refresh).await.unwrap();
        assert_eq!(response.upsert.unwrap().unchanged, 2);
    }

    /// A search of M5H alone that leaves result addresses ungeocoded.
    fn m5h_request() -> RadiusSearchRequest {
        let mut request = RadiusSearchRequest::new(SearchCenter::Coordinates(CENTER), 0.5);
        request.geocode_results = false;
        request
    }

    fn names(response: &RadiusSearchResponse) -> Vec<&str> {
        response
            .physicians
            .iter()
            .map(|p| p.record.name.as_str())
            .collect()
    }

    #[tokio::test]
    async fn searches_with_different_filters_are_cached_separately() {
        let f = fixture();
        f.registry
            .specialist_entries("M5H", "Cardiology", vec![near()]);
        let mut cardiology = m5h_request();
        cardiology.filters.specialist_type = Some("Cardiology".into());
        let any = m5h_request();

        let first = f.service.radius_search(cardiology.clone()).await.unwrap();
        assert_eq!(first.queried_prefixes, vec!["M5H"]);
        assert_eq!(names(&first), vec!["Near, Ann"]);
        assert!(first.complete);

        // The filtered pass must not stand in for an unfiltered one.
        let second = f.service.radius_search(any.clone()).await.unwrap();
        assert_eq!(second.queried_prefixes, vec!["M5H"]);
        assert!(second.served_from_store.is_empty());
        assert_eq!(names(&second), vec!["Far, Bob", "Near, Ann"]);

        // Nor may the unfiltered rows leak into a filtered read.
        let third = f.service.radius_search(cardiology).await.unwrap();
        assert_eq!(third.served_from_store, vec!["M5H"]);
        assert_eq!(names(&third), vec!["Near, Ann"]);

        let fourth = f.service.radius_search(any).await.unwrap();
        assert_eq!(fourth.served_from_store, vec!["M5H"]);
        assert_eq!(fourth.physicians.len(), 2);
        assert_eq!(f.registry.calls("M5H"), 2);
    }

    #[tokio::test]
    async fn area_with_failed_leaves_is_searched_again() {
        let f = fixture();
        f.registry.overflow("M5H");
        f.registry.entries("M5H1", vec![near()]);
        f.registry.flaky(
            "M5H2",
            2,
            FetchError::ServerError { status: 503 },
            vec![listed("Second, Sue", "300", "40 Dundas St W", "M5H 2B2")],
        );

        let first = f.service.radius_search(m5h_request()).await.unwrap();
        assert_eq!(first.areas, vec!["M5H"]);
        let search = first.search.as_ref().unwrap();
        assert_eq!(search.failures.len(), 1);
        assert_eq!(search.failures[0].code, "M5H 2");
        assert_eq!(names(&first), vec!["Near, Ann"]);
        assert!(!first.complete);

        let second = f.service.radius_search(m5h_request()).await.unwrap();
        assert!(second.served_from_store.is_empty());
        assert_eq!(second.queried_prefixes, vec!["M5H"]);
        assert_eq!(f.registry.calls("M5H2"), 3);
        assert_eq!(names(&second), vec!["Near, Ann", "Second, Sue"]);
        assert!(second.complete);

        let calls = f.registry.total_calls();
        let third = f.service.radius_search(m5h_request()).await.unwrap();
        assert_eq!(third.served_from_store, vec!["M5H"]);
        assert_eq!(third.physicians.len(), 2);
        assert!(third.complete);
        assert_eq!(f.registry.total_calls(), calls);
    }

    #[tokio::test]
    async fn partial_coverage_keeps_the_area_uncached() {
        let f = fixture();
        for code in ["M5H", "M5H1", "M5H1A", "M5H1A1"] {
            f.registry.overflow(code);
        }

        let first = f.service.radius_search(m5h_request()).await.unwrap();
        let search = first.search.as_ref().unwrap();
        assert_eq!(search.partial_coverage, vec!["M5H 1A1".to_string()]);
        assert!(!first.complete);

        let second = f.service.radius_search(m5h_request()).await.unwrap();
        assert_eq!(second.queried_prefixes, vec!["M5H"]);
        assert!(!second.complete);
    }

    /// Profile source that answers slowly and counts fetches.
    #[derive(Default)]
    struct SlowProfiles {
        fetches: std::sync::Mutex<HashMap<String, u32>>,
    }

    impl SlowProfiles {
        fn fetches(&self, registration: &str) -> u32 {
            self.fetches
                .lock()
                .unwrap()
                .get(registration)
                .copied()
                .unwrap_or(0)
        }
    }

    #[async_trait]
    impl EnrichmentSource for SlowProfiles {
        async fn fetch(&self, registration_number: &str) -> Result<EnrichmentOutcome, FetchError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            *self
                .fetches
                .lock()
                .unwrap()
                .entry(registration_number.to_string())
                .or_insert(0) += 1;
            Ok(EnrichmentOutcome::Value("Female".into()))
        }
    }

    #[tokio::test]
    async fn background_enrichment_runs_one_pass_at_a_time() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry.entries("M5H", vec![near(), far()]);
        let profiles = Arc::new(SlowProfiles::default());
        let service = DirectoryService::with_components(
            test_config(),
            components(
                registry,
                Arc::new(TableGeocoder::new("municipal")),
                profiles.clone(),
            ),
        );

        let first = service.radius_search(m5h_request()).await.unwrap();
        assert!(first.enrichment_scheduled);
        let second = service.radius_search(m5h_request()).await.unwrap();
        assert!(!second.enrichment_scheduled);
        service.wait_for_background().await;
        assert_eq!(profiles.fetches("100"), 1);
        assert_eq!(profiles.fetches("200"), 1);

        // With the earlier pass finished a new one may start; nothing is left to fetch.
        let third = service.radius_search(m5h_request()).await.unwrap();
        assert!(third.enrichment_scheduled);
        service.wait_for_background().await;
        assert_eq!(profiles.fetches("100"), 1);
        service.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn postal_code_center_uses_reference_point() {
        let f = fixture();
        let mut request = RadiusSearchRequest::new(SearchCenter::Address("m5h".into()), 0.5);
        request.geocode_results = false;
        let response = f.service.radius_search(request).await.unwrap();
        assert_eq!(response.center, CENTER);
        assert_eq!(response.areas, vec!["M5H"]);
        assert_eq!(response.without_coordinates, 2);
        assert!(response.physicians.iter().all(|p| p.distance_km.is_none()));
    }

    #[tokio::test]
    async fn shutdown_drains_background_work_and_closes_store() {
        let f = fixture();
        f.service
            .radius_search(RadiusSearchRequest::new(SearchCenter::Coordinates(CENTER), 2.0))
            .await
            .unwrap();
        let stats = f.service.stats().unwrap();
        assert_eq!(stats.store.physicians, 2);
        assert_eq!(stats.postal_code_points, 2);
        assert_eq!(stats.geocoders, vec!["municipal"]);

        f.service.shutdown().await.unwrap();
        assert!(f.enrichment.calls("100") <= 1);
    }

    #[tokio::test]
    async fn rejects_unusable_requests() {
        let f = fixture();
        let bad_radius = RadiusSearchRequest::new(SearchCenter::Coordinates(CENTER), 0.0);
        assert!(f.service.radius_search(bad_radius).await.is_err());
        let unknown = RadiusSearchRequest::new(SearchCenter::Address("Atlantis".into()), 2.0);
        assert!(f.service.radius_search(unknown).await.is_err());
    }
}
