use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures::{StreamExt, stream::FuturesUnordered};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::{
    common::{fetch_text, now_unix_seconds, parse_json_body},
    config::GeocodingConfig,
    error::FetchError,
    models::{Coordinates, GeocodeEntry, normalize_address},
    rate_limiter::{AdaptiveRateLimiter, LimiterConfig, RetryPolicy, run_with_retry},
    store::DirectoryStore,
};

/// Uniform address-in, coordinates-out contract shared by every provider.
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// Stable id, persisted as the source tag of resolved entries.
    fn provider_id(&self) -> &str;

    /// One request. `Ok(None)` means the provider answered without a match.
    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, FetchError>;
}

fn lenient_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn valid(lat: Option<f64>, lng: Option<f64>) -> Option<Coordinates> {
    let c = Coordinates::new(lat?, lng?);
    c.is_valid().then_some(c)
}

fn municipal_rows(v: &Value) -> Result<&[Value], FetchError> {
    match v.get("result").and_then(|r| r.get("rows")) {
        None | Some(Value::Null) => Ok(&[]),
        Some(Value::Array(rows)) => Ok(rows),
        Some(_) => Err(FetchError::Malformed("rows is not an array".to_string())),
    }
}

/// Key string of the first suggestion, if any.
pub fn parse_municipal_suggest(v: &Value) -> Result<Option<String>, FetchError> {
    Ok(municipal_rows(v)?
        .iter()
        .find_map(|row| row.get("KEYSTRING").and_then(|k| k.as_str()))
        .map(str::to_string))
}

/// Coordinates of the best-scoring candidate.
pub fn parse_municipal_candidates(v: &Value) -> Result<Option<Coordinates>, FetchError> {
    let best = municipal_rows(v)?
        .iter()
        .filter_map(|row| {
            let coords = valid(
                lenient_f64(row.get("LATITUDE")),
                lenient_f64(row.get("LONGITUDE")),
            )?;
            Some((lenient_f64(row.get("SCORE")).unwrap_or(0.0), coords))
        })
        .max_by(|a, b| a.0.total_cmp(&b.0));
    Ok(best.map(|(_, coords)| coords))
}

pub fn parse_google_response(v: &Value) -> Result<Option<Coordinates>, FetchError> {
    let status = v.get("status").and_then(|s| s.as_str()).unwrap_or("");
    match status {
        "OK" => {
            let location = v
                .get("results")
                .and_then(|r| r.get(0))
                .and_then(|r| r.get("geometry"))
                .and_then(|g| g.get("location"))
                .ok_or_else(|| FetchError::Malformed("OK without geometry".to_string()))?;
            Ok(valid(
                lenient_f64(location.get("lat")),
                lenient_f64(location.get("lng")),
            ))
        }
        "ZERO_RESULTS" => Ok(None),
        "OVER_QUERY_LIMIT" => Err(FetchError::RateLimited { retry_after: None }),
        "REQUEST_DENIED" => Err(FetchError::Blocked(
            v.get("error_message")
                .and_then(|m| m.as_str())
                .unwrap_or("request denied")
                .to_string(),
        )),
        other => Err(FetchError::Malformed(format!("geocoder status {other:?}"))),
    }
}

pub fn parse_maps_co_response(v: &Value) -> Result<Option<Coordinates>, FetchError> {
    let results = v
        .as_array()
        .ok_or_else(|| FetchError::Malformed("expected an array of places".to_string()))?;
    Ok(results
        .iter()
        .find_map(|place| valid(lenient_f64(place.get("lat")), lenient_f64(place.get("lon")))))
}

/// City suggest/resolve pair: the suggestion's key string is resolved to candidates.
pub struct MunicipalGeocoder {
    client: Client,
    base_url: String,
}

impl MunicipalGeocoder {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self { client, base_url }
    }
}

#[async_trait]
impl Geocoder for MunicipalGeocoder {
    fn provider_id(&self) -> &str {
        "municipal"
    }

    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, FetchError> {
        let suggest = self
            .client
            .get(format!("{}suggest", self.base_url))
            .query(&[
                ("f", "json"),
                ("addressOnly", "0"),
                ("retRowLimit", "5"),
                ("searchString", address),
            ]);
        let body = fetch_text(suggest).await?;
        let Some(key) = parse_municipal_suggest(&parse_json_body(&body)?)? else {
            return Ok(None);
        };

        let resolve = self
            .client
            .get(format!("{}findAddressCandidates", self.base_url))
            .query(&[("f", "json"), ("keyString", key.as_str()), ("retRowLimit", "10")]);
        let body = fetch_text(resolve).await?;
        parse_municipal_candidates(&parse_json_body(&body)?)
    }
}

pub struct GoogleGeocoder {
    client: Client,
    url: String,
    api_key: String,
}

impl GoogleGeocoder {
    pub fn new(client: Client, url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Geocoder for GoogleGeocoder {
    fn provider_id(&self) -> &str {
        "google"
    }

    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, FetchError> {
        let request = self.client.get(&self.url).query(&[
            ("address", address),
            ("region", "ca"),
            ("key", self.api_key.as_str()),
        ]);
        let body = fetch_text(request).await?;
        parse_google_response(&parse_json_body(&body)?)
    }
}

pub struct MapsCoGeocoder {
    client: Client,
    url: String,
    api_key: Option<String>,
}

impl MapsCoGeocoder {
    pub fn new(client: Client, url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            url: url.into(),
            api_key,
        }
    }
}

#[async_trait]
impl Geocoder for MapsCoGeocoder {
    fn provider_id(&self) -> &str {
        "maps_co"
    }

    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, FetchError> {
        let mut request = self.client.get(&self.url).query(&[("q", address)]);
        if let Some(key) = &self.api_key {
            request = request.query(&[("api_key", key.as_str())]);
        }
        let body = fetch_text(request).await?;
        parse_maps_co_response(&parse_json_body(&body)?)
    }
}

struct ChainLink {
    geocoder: Arc<dyn Geocoder>,
    limiter: AdaptiveRateLimiter,
}

/// Providers in priority order. A miss or an error falls through to the next.
pub struct GeocoderChain {
    links: Vec<ChainLink>,
    retry: RetryPolicy,
}

impl GeocoderChain {
    pub fn new(retry: RetryPolicy) -> Self {
        Self {
            links: Vec::new(),
            retry,
        }
    }

    pub fn with_provider(mut self, geocoder: Arc<dyn Geocoder>, limiter: &LimiterConfig) -> Self {
        let name = format!("geocoder:{}", geocoder.provider_id());
        self.links.push(ChainLink {
            geocoder,
            limiter: AdaptiveRateLimiter::new(name, limiter),
        });
        self
    }

    /// Municipal first, then the commercial API (only with a key), then the community API.
    pub fn from_config(client: &Client, config: &GeocodingConfig) -> Self {
        let mut chain = Self::new(config.retry.clone());
        if let Some(url) = &config.municipal_url {
            chain = chain.with_provider(
                Arc::new(MunicipalGeocoder::new(client.clone(), url.clone())),
                &config.limiter,
            );
        }
        if let Some(key) = &config.google_api_key {
            chain = chain.with_provider(
                Arc::new(GoogleGeocoder::new(
                    client.clone(),
                    config.google_url.clone(),
                    key.clone(),
                )),
                &config.limiter,
            );
        }
        if let Some(url) = &config.maps_co_url {
            chain = chain.with_provider(
                Arc::new(MapsCoGeocoder::new(
                    client.clone(),
                    url.clone(),
                    config.maps_co_api_key.clone(),
                )),
                &config.limiter,
            );
        }
        chain
    }

    pub fn provider_ids(&self) -> Vec<&str> {
        self.links.iter().map(|l| l.geocoder.provider_id()).collect()
    }

    /// Returns the coordinates and the id of the provider that resolved them.
    ///
    /// `Ok(None)` when at least one provider answered and none matched;
    /// the last error when every provider failed.
    pub async fn resolve(&self, address: &str) -> Result<Option<(Coordinates, String)>, FetchError> {
        let mut last_err = None;
        let mut answered = false;
        for link in &self.links {
            let id = link.geocoder.provider_id();
            let label = format!("geocode {id}");
            let (result, attempts) = run_with_retry(&self.retry, &label, || async move {
                link.limiter.acquire().await;
                let result = link.geocoder.geocode(address).await;
                link.limiter.record_result(&result);
                result
            })
            .await;
            match result {
                Ok(Some(coords)) => return Ok(Some((coords, id.to_string()))),
                Ok(None) => answered = true,
                Err(err) => {
                    tracing::warn!(
                        "{id} failed for {address:?} after {attempts} attempt(s): {err}"
                    );
                    last_err = Some(err);
                }
            }
        }
        match last_err {
            Some(err) if !answered => Err(err),
            _ => Ok(None),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeocodeLookup {
    Cached(GeocodeEntry),
    Resolved(GeocodeEntry),
    Unresolved,
    Failed(FetchError),
}

impl GeocodeLookup {
    pub fn entry(&self) -> Option<&GeocodeEntry> {
        match self {
            GeocodeLookup::Cached(e) | GeocodeLookup::Resolved(e) => Some(e),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AddressGeocode {
    pub input: String,
    pub address: String,
    pub coordinates: Option<Coordinates>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchGeocodeReport {
    pub results: Vec<AddressGeocode>,
    pub cached: usize,
    pub resolved: usize,
    pub unresolved: usize,
    pub failed: usize,
}

/// Read-through geocode cache: durable store, then in-memory mirror, then providers.
///
/// Only successful resolutions are written back; misses and failures are
/// retried on the next lookup.
pub struct GeocodeCache {
    store: Arc<DirectoryStore>,
    memory: Mutex<HashMap<String, GeocodeEntry>>,
    chain: GeocoderChain,
    concurrency: usize,
}

impl GeocodeCache {
    pub fn new(store: Arc<DirectoryStore>, chain: GeocoderChain, concurrency: usize) -> Self {
        Self {
            store,
            memory: Mutex::new(HashMap::new()),
            chain,
            concurrency: concurrency.max(1),
        }
    }

    pub fn chain(&self) -> &GeocoderChain {
        &self.chain
    }

    /// Cached entry for an already normalized address.
    pub fn cached(&self, address: &str) -> Option<GeocodeEntry> {
        match self.store.get_geocode(address) {
            Ok(Some(entry)) => return Some(entry),
            Ok(None) => {}
            Err(err) => tracing::warn!("geocode store lookup failed: {err:#}"),
        }
        self.with_memory(|m| m.get(address).cloned())
    }

    pub async fn lookup(&self, raw_address: &str) -> GeocodeLookup {
        let address = normalize_address(raw_address);
        if address.is_empty() {
            return GeocodeLookup::Unresolved;
        }
        if let Some(entry) = self.cached(&address) {
            return GeocodeLookup::Cached(entry);
        }
        match self.chain.resolve(&address).await {
            Ok(Some((coordinates, source))) => {
                let entry = GeocodeEntry {
                    address: address.clone(),
                    coordinates,
                    source,
                    geocoded_at_unix: now_unix_seconds(),
                };
                if let Err(err) = self.store.put_geocode(&entry) {
                    tracing::warn!("failed persisting geocode for {address:?}: {err:#}");
                }
                self.with_memory(|m| m.insert(address, entry.clone()));
                GeocodeLookup::Resolved(entry)
            }
            Ok(None) => GeocodeLookup::Unresolved,
            Err(err) => GeocodeLookup::Failed(err),
        }
    }

    /// Geocodes a list of addresses, deduplicated by normalized form.
    ///
    /// Uncached addresses are resolved in sequential chunks of the configured concurrency.
    pub async fn geocode_addresses(&self, inputs: &[String]) -> BatchGeocodeReport {
        let mut unique: Vec<String> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for input in inputs {
            let address = normalize_address(input);
            if seen.insert(address.clone()) {
                unique.push(address);
            }
        }

        let mut outcomes: HashMap<String, GeocodeLookup> = HashMap::new();
        for chunk in unique.chunks(self.concurrency) {
            let mut in_flight: FuturesUnordered<_> = chunk
                .iter()
                .map(|address| async move { (address.clone(), self.lookup(address).await) })
                .collect();
            while let Some((address, outcome)) = in_flight.next().await {
                outcomes.insert(address, outcome);
            }
        }

        let mut report = BatchGeocodeReport::default();
        for outcome in outcomes.values() {
            match outcome {
                GeocodeLookup::Cached(_) => report.cached += 1,
                GeocodeLookup::Resolved(_) => report.resolved += 1,
                GeocodeLookup::Unresolved => report.unresolved += 1,
                GeocodeLookup::Failed(_) => report.failed += 1,
            }
        }
        report.results = inputs
            .iter()
            .map(|input| {
                let address = normalize_address(input);
                let entry = outcomes.get(&address).and_then(GeocodeLookup::entry);
                AddressGeocode {
                    input: input.clone(),
                    coordinates: entry.map(|e| e.coordinates),
                    source: entry.map(|e| e.source.clone()),
                    address,
                }
            })
            .collect();
        tracing::info!(
            "geocoded {} addresses: {} cached, {} resolved, {} unresolved, {} failed",
            unique.len(),
            report.cached,
            report.resolved,
            report.unresolved,
            report.failed
        );
        report
    }

    fn with_memory<R>(&self, f: impl FnOnce(&mut HashMap<String, GeocodeEntry>) -> R) -> R {
        let mut guard = match self.memory.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}
