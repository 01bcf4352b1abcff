//! In-process fakes for the external services.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;

use crate::{
    enrichment::{EnrichmentOutcome, EnrichmentSource},
    error::FetchError,
    geocode::Geocoder,
    models::Coordinates,
    postal::PostalCode,
    registry::{RegistryEntry, RegistryPage, RegistryTransport, SearchFilters},
};

pub fn entry(name: &str, registration: Option<&str>, street: &str) -> RegistryEntry {
    RegistryEntry {
        name: Some(name.to_string()),
        street1: Some(street.to_string()),
        city: Some("Toronto".to_string()),
        province: Some("ON".to_string()),
        cpsonumber: registration.map(str::to_string),
        ..Default::default()
    }
}

#[derive(Debug, Clone)]
enum Script {
    Page(RegistryPage),
    Fail(FetchError),
    /// Fails with the error this many times, then answers with the page.
    Flaky(u32, FetchError, RegistryPage),
}

/// Registry fake keyed by normalized postal code; unknown codes return no entries.
///
/// Pages registered for a specialist type answer only searches filtered on it.
#[derive(Debug, Default)]
pub struct ScriptedRegistry {
    scripts: Mutex<HashMap<String, Script>>,
    specialist_pages: Mutex<HashMap<(String, String), RegistryPage>>,
    calls: Mutex<HashMap<String, u32>>,
    order: Mutex<VecDeque<String>>,
}

impl ScriptedRegistry {
    pub fn overflow(&self, code: &str) {
        self.set(code, Script::Page(RegistryPage::Overflow));
    }

    pub fn entries(&self, code: &str, entries: Vec<RegistryEntry>) {
        self.set(code, Script::Page(RegistryPage::Entries(entries)));
    }

    pub fn fail(&self, code: &str, err: FetchError) {
        self.set(code, Script::Fail(err));
    }

    pub fn flaky(&self, code: &str, failures: u32, err: FetchError, entries: Vec<RegistryEntry>) {
        self.set(
            code,
            Script::Flaky(failures, err, RegistryPage::Entries(entries)),
        );
    }

    pub fn specialist_entries(&self, code: &str, specialist: &str, entries: Vec<RegistryEntry>) {
        self.specialist_pages.lock().unwrap().insert(
            (code.to_string(), specialist.to_string()),
            RegistryPage::Entries(entries),
        );
    }

    fn set(&self, code: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .insert(code.to_string(), script);
    }

    pub fn calls(&self, code: &str) -> u32 {
        self.calls.lock().unwrap().get(code).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u32 {
        self.calls.lock().unwrap().values().sum()
    }

    pub fn max_calls_per_code(&self) -> u32 {
        self.calls.lock().unwrap().values().copied().max().unwrap_or(0)
    }

    pub fn call_order(&self) -> Vec<String> {
        self.order.lock().unwrap().iter().cloned().collect()
    }
}

#[async_trait]
impl RegistryTransport for ScriptedRegistry {
    async fn search(
        &self,
        code: &PostalCode,
        filters: &SearchFilters,
    ) -> Result<RegistryPage, FetchError> {
        let key = code.as_str().to_string();
        let count = {
            let mut calls = self.calls.lock().unwrap();
            let count = calls.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        self.order.lock().unwrap().push_back(key.clone());

        if let Some(specialist) = &filters.specialist_type {
            let pages = self.specialist_pages.lock().unwrap();
            if let Some(page) = pages.get(&(key.clone(), specialist.clone())) {
                return Ok(page.clone());
            }
        }

        let script = self.scripts.lock().unwrap().get(&key).cloned();
        match script {
            None => Ok(RegistryPage::Entries(Vec::new())),
            Some(Script::Page(page)) => Ok(page),
            Some(Script::Fail(err)) => Err(err),
            Some(Script::Flaky(failures, err, page)) => {
                if count <= failures {
                    Err(err)
                } else {
                    Ok(page)
                }
            }
        }
    }
}

/// Geocoder fake answering from a fixed table and counting calls.
#[derive(Debug)]
pub struct TableGeocoder {
    id: &'static str,
    table: HashMap<String, Coordinates>,
    failing: HashMap<String, FetchError>,
    calls: Mutex<u32>,
}

impl TableGeocoder {
    pub fn new(id: &'static str) -> Self {
        Self {
            id,
            table: HashMap::new(),
            failing: HashMap::new(),
            calls: Mutex::new(0),
        }
    }

    pub fn with(mut self, address: &str, lat: f64, lng: f64) -> Self {
        self.table
            .insert(address.to_string(), Coordinates::new(lat, lng));
        self
    }

    pub fn failing(mut self, address: &str, err: FetchError) -> Self {
        self.failing.insert(address.to_string(), err);
        self
    }

    pub fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl Geocoder for TableGeocoder {
    fn provider_id(&self) -> &str {
        self.id
    }

    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, FetchError> {
        *self.calls.lock().unwrap() += 1;
        if let Some(err) = self.failing.get(address) {
            return Err(err.clone());
        }
        Ok(self.table.get(address).copied())
    }
}

/// Enrichment fake keyed by registration number.
#[derive(Debug, Default)]
pub struct TableEnrichment {
    outcomes: Mutex<HashMap<String, Result<EnrichmentOutcome, FetchError>>>,
    calls: Mutex<HashMap<String, u32>>,
}

impl TableEnrichment {
    pub fn set(&self, registration: &str, outcome: Result<EnrichmentOutcome, FetchError>) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(registration.to_string(), outcome);
    }

    pub fn calls(&self, registration: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(registration)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl EnrichmentSource for TableEnrichment {
    async fn fetch(&self, registration_number: &str) -> Result<EnrichmentOutcome, FetchError> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(registration_number.to_string())
            .or_insert(0) += 1;
        self.outcomes
            .lock()
            .unwrap()
            .get(registration_number)
            .cloned()
            .unwrap_or(Ok(EnrichmentOutcome::NoMatch))
    }
}
