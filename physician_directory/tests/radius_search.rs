use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use physician_directory::{
    config::DirectoryConfig,
    enrichment::{EnrichmentOutcome, EnrichmentSource},
    error::FetchError,
    geo::GeoContainmentFilter,
    geocode::{Geocoder, GeocoderChain},
    models::Coordinates,
    postal::PostalCode,
    rate_limiter::{LimiterConfig, RetryPolicy},
    registry::{RegistryEntry, RegistryPage, RegistryTransport, SearchFilters},
    service::{DirectoryService, RadiusSearchRequest, SearchCenter, ServiceComponents},
    store::DirectoryStore,
};

const CENTER: Coordinates = Coordinates {
    lat: 43.6532,
    lng: -79.3832,
};

/// Registry where "M5H" overflows and its children answer from a table.
#[derive(Default)]
struct FakeRegistry {
    calls: AtomicUsize,
}

fn entry(name: &str, reg: &str, street: &str, postal: &str) -> RegistryEntry {
    RegistryEntry {
        name: Some(name.to_string()),
        street1: Some(street.to_string()),
        city: Some("Toronto".to_string()),
        province: Some("ON".to_string()),
        postalcode: Some(postal.to_string()),
        cpsonumber: Some(reg.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl RegistryTransport for FakeRegistry {
    async fn search(
        &self,
        code: &PostalCode,
        _filters: &SearchFilters,
    ) -> Result<RegistryPage, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(match code.as_str() {
            "M5H" => RegistryPage::Overflow,
            "M5H1" => RegistryPage::Entries(vec![
                entry("Adams, Ada", "501", "100 King St W", "M5H 1A1"),
                entry("Brown, Ben", "502", "100 King St W", "M5H 1A1"),
            ]),
            "M5H2" => RegistryPage::Entries(vec![
                entry("Adams, Ada", "501", "100 King St W", "M5H 1A1"),
                entry("Chen, Cal", "503", "40 Dundas St W", "M5H 2B2"),
            ]),
            _ => RegistryPage::Entries(Vec::new()),
        })
    }
}

struct FakeGeocoder {
    table: HashMap<&'static str, Coordinates>,
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl Geocoder for FakeGeocoder {
    fn provider_id(&self) -> &str {
        "fake"
    }

    async fn geocode(&self, address: &str) -> Result<Option<Coordinates>, FetchError> {
        self.calls.lock().unwrap().push(address.to_string());
        Ok(self.table.get(address).copied())
    }
}

struct FakeProfiles;

#[async_trait]
impl EnrichmentSource for FakeProfiles {
    async fn fetch(&self, registration_number: &str) -> Result<EnrichmentOutcome, FetchError> {
        Ok(match registration_number {
            "501" => EnrichmentOutcome::Value("Female".to_string()),
            "502" => EnrichmentOutcome::Value("Male".to_string()),
            _ => EnrichmentOutcome::NoMatch,
        })
    }
}

fn write_reference_data(dir: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let areas = dir.join("fsa.geojson");
    fs::write(
        &areas,
        r#"{"type": "FeatureCollection", "features": [
            {"type": "Feature", "properties": {"CFSAUID": "M5H"},
             "geometry": {"type": "Polygon", "coordinates": [[
                [-79.395, 43.645], [-79.375, 43.645], [-79.375, 43.660], [-79.395, 43.660], [-79.395, 43.645]
             ]]}},
            {"type": "Feature", "properties": {"CFSAUID": "M4W"},
             "geometry": {"type": "Polygon", "coordinates": [[
                [-79.40, 43.75], [-79.37, 43.75], [-79.37, 43.77], [-79.40, 43.77], [-79.40, 43.75]
             ]]}}
        ]}"#,
    )
    .unwrap();

    let points = dir.join("postal_codes.csv");
    fs::write(
        &points,
        "code,lat,lng\nM5H,43.6532,-79.3832\nM5H 1A1,43.6500,-79.3800\nM4W,43.7600,-79.3850\n",
    )
    .unwrap();
    (areas, points)
}

fn config(db_path: &Path) -> DirectoryConfig {
    let mut config = DirectoryConfig {
        db_path: db_path.to_path_buf(),
        ..Default::default()
    };
    config.registry.limiter = LimiterConfig::unpaced();
    config.fanout.batch_delay = Duration::ZERO;
    config.fanout.retry = RetryPolicy::no_delay(2);
    config.enrichment.limiter = LimiterConfig::unpaced();
    config
}

fn service(
    db_path: &Path,
    areas: &Path,
    points: &Path,
    registry: Arc<FakeRegistry>,
    geocoder: Arc<FakeGeocoder>,
) -> DirectoryService {
    let components = ServiceComponents {
        store: Arc::new(DirectoryStore::open(db_path).unwrap()),
        registry,
        geocoders: GeocoderChain::new(RetryPolicy::no_delay(1))
            .with_provider(geocoder, &LimiterConfig::unpaced()),
        enrichment: Arc::new(FakeProfiles),
        containment: GeoContainmentFilter::load(Some(areas), points).unwrap(),
    };
    DirectoryService::with_components(config(db_path), components)
}

fn geocoder() -> Arc<FakeGeocoder> {
    Arc::new(FakeGeocoder {
        table: HashMap::from([
            ("100 King St W, Toronto, ON, M5H 1A1", Coordinates::new(43.6487, -79.3817)),
            ("40 Dundas St W, Toronto, ON, M5H 2B2", Coordinates::new(43.6560, -79.3820)),
        ]),
        calls: Mutex::new(Vec::new()),
    })
}

#[tokio::test]
async fn radius_search_end_to_end_with_persistent_cache() {
    let dir = tempfile::tempdir().unwrap();
    let (areas, points) = write_reference_data(dir.path());
    let db_path = dir.path().join("directory.sqlite");

    let registry = Arc::new(FakeRegistry::default());
    let first_geocoder = geocoder();
    let svc = service(&db_path, &areas, &points, registry.clone(), first_geocoder.clone());

    let mut request = RadiusSearchRequest::new(SearchCenter::Coordinates(CENTER), 2.0);
    request.wait_for_enrichment = true;
    let response = svc.radius_search(request.clone()).await.unwrap();

    assert!(response.used_polygons);
    assert_eq!(response.areas, vec!["M5H"]);
    let search = response.search.as_ref().unwrap();
    assert_eq!(search.records, 3);
    assert_eq!(search.duplicates_skipped, 1);
    assert_eq!(search.leaves_resolved, 10);
    assert!(search.failures.is_empty());
    assert!(response.complete);

    let names: Vec<_> = response
        .physicians
        .iter()
        .map(|p| p.record.name.as_str())
        .collect();
    assert_eq!(names, vec!["Chen, Cal", "Adams, Ada", "Brown, Ben"]);
    assert!(response.physicians.iter().all(|p| p.distance_km.is_some()));
    let ada = &response.physicians[1];
    assert_eq!(ada.record.enrichment.as_deref(), Some("Female"));
    assert_eq!(response.enrichment.as_ref().unwrap().enriched, 2);
    assert_eq!(first_geocoder.calls.lock().unwrap().len(), 2);
    svc.shutdown().await.unwrap();

    // A fresh process over the same database serves the area from disk.
    let again_registry = Arc::new(FakeRegistry::default());
    let second_geocoder = geocoder();
    let svc = service(&db_path, &areas, &points, again_registry.clone(), second_geocoder.clone());
    request.wait_for_enrichment = false;
    let response = svc.radius_search(request).await.unwrap();

    assert_eq!(again_registry.calls.load(Ordering::SeqCst), 0);
    assert!(second_geocoder.calls.lock().unwrap().is_empty());
    assert_eq!(response.served_from_store, vec!["M5H"]);
    assert_eq!(response.physicians.len(), 3);
    assert_eq!(
        response.physicians[1].record.enrichment.as_deref(),
        Some("Female")
    );

    let stats = svc.stats().unwrap();
    assert_eq!(stats.store.physicians, 3);
    assert_eq!(stats.store.geocoded_addresses, 2);
    assert_eq!(stats.store.enriched, 2);
    assert_eq!(stats.area_polygons, 2);
    assert_eq!(stats.postal_code_points, 3);
    svc.shutdown().await.unwrap();
}

#[tokio::test]
async fn batch_geocoding_reuses_cached_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let (areas, points) = write_reference_data(dir.path());
    let db_path = dir.path().join("directory.sqlite");
    let geocoder = geocoder();
    let svc = service(
        &db_path,
        &areas,
        &points,
        Arc::new(FakeRegistry::default()),
        geocoder.clone(),
    );

    let addresses = vec![
        "100 King St W,  Toronto, ON, M5H 1A1".to_string(),
        "1 Nowhere Rd".to_string(),
    ];
    let first = svc.geocode_addresses(&addresses).await;
    assert_eq!((first.resolved, first.unresolved), (1, 1));

    let second = svc.geocode_addresses(&addresses).await;
    assert_eq!((second.cached, second.unresolved), (1, 1));
    // The miss is retried, the hit is not.
    assert_eq!(geocoder.calls.lock().unwrap().len(), 3);
    svc.shutdown().await.unwrap();
}
