use std::{path::PathBuf, time::Duration};

use crate::constants::{
    DEFAULT_DB_FILE, DEFAULT_GOOGLE_GEOCODER_URL, DEFAULT_MAPS_CO_GEOCODER_URL,
    DEFAULT_MAX_ENUMERABLE, DEFAULT_MUNICIPAL_GEOCODER_URL, DEFAULT_OVERFLOW_SENTINEL,
    DEFAULT_PROFILE_BASE_URL, DEFAULT_REGISTRY_SEARCH_URL,
};
use crate::rate_limiter::{LimiterConfig, RetryPolicy};

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub db_path: PathBuf,
    /// GeoJSON area polygons. Without them containment degrades to point-radius.
    pub areas_path: Option<PathBuf>,
    /// Postal-code center points (`.json` or `.csv`).
    pub postal_points_path: Option<PathBuf>,
    pub request_timeout: Duration,
    pub registry: RegistryConfig,
    pub fanout: FanoutConfig,
    pub geocoding: GeocodingConfig,
    pub enrichment: EnrichmentConfig,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_FILE),
            areas_path: None,
            postal_points_path: None,
            request_timeout: Duration::from_secs(15),
            registry: RegistryConfig::default(),
            fanout: FanoutConfig::default(),
            geocoding: GeocodingConfig::default(),
            enrichment: EnrichmentConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub search_url: String,
    pub overflow_sentinel: i64,
    /// Largest page the registry enumerates before answering with the sentinel.
    pub max_enumerable: usize,
    pub limiter: LimiterConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            search_url: DEFAULT_REGISTRY_SEARCH_URL.to_string(),
            overflow_sentinel: DEFAULT_OVERFLOW_SENTINEL,
            max_enumerable: DEFAULT_MAX_ENUMERABLE,
            limiter: LimiterConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub concurrency: usize,
    pub batch_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            batch_delay: Duration::from_millis(200),
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
                multiplier: 2.0,
                max_delay: Duration::from_secs(30),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct GeocodingConfig {
    pub concurrency: usize,
    pub municipal_url: Option<String>,
    pub google_url: String,
    pub google_api_key: Option<String>,
    pub maps_co_url: Option<String>,
    pub maps_co_api_key: Option<String>,
    pub retry: RetryPolicy,
    pub limiter: LimiterConfig,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            municipal_url: Some(DEFAULT_MUNICIPAL_GEOCODER_URL.to_string()),
            google_url: DEFAULT_GOOGLE_GEOCODER_URL.to_string(),
            google_api_key: None,
            maps_co_url: Some(DEFAULT_MAPS_CO_GEOCODER_URL.to_string()),
            maps_co_api_key: None,
            retry: RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_secs(1),
                multiplier: 2.0,
                max_delay: Duration::from_secs(32),
            },
            limiter: LimiterConfig::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnrichmentConfig {
    pub profile_base_url: String,
    pub concurrency: usize,
    /// Records revisited per background pass.
    pub batch_size: usize,
    pub retry: RetryPolicy,
    pub limiter: LimiterConfig,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            profile_base_url: DEFAULT_PROFILE_BASE_URL.to_string(),
            concurrency: 2,
            batch_size: 200,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(2),
                multiplier: 2.0,
                max_delay: Duration::from_secs(30),
            },
            limiter: LimiterConfig::default(),
        }
    }
}
