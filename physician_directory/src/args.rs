use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};

use crate::{
    config::DirectoryConfig,
    constants::{
        DEFAULT_DB_FILE, DEFAULT_GOOGLE_GEOCODER_URL, DEFAULT_MAPS_CO_GEOCODER_URL,
        DEFAULT_MUNICIPAL_GEOCODER_URL, DEFAULT_PROFILE_BASE_URL, DEFAULT_REGISTRY_SEARCH_URL,
    },
    registry::SearchFilters,
};

#[derive(Debug, Parser)]
#[command(name = "physician_directory")]
#[command(about = "Radius search over the provincial physician registry, with a local reconciled cache")]
pub struct Args {
    #[command(flatten)]
    pub common: CommonArgs,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Find physicians within a radius of coordinates, an address or a postal code.
    Search(SearchArgs),
    /// Expand explicit postal-code seeds against the registry and store the results.
    Expand(ExpandArgs),
    /// Fetch profile enrichment for registration numbers or pending records.
    Enrich(EnrichArgs),
    /// Geocode addresses through the cache and provider chain.
    Geocode(GeocodeArgs),
    /// Print store and reference-data statistics.
    Stats,
}

#[derive(clap::Args, Debug, Clone)]
pub struct CommonArgs {
    /// SQLite database holding physicians and geocoded addresses.
    #[arg(long, global = true, default_value = DEFAULT_DB_FILE)]
    pub db_path: PathBuf,

    /// GeoJSON area polygons (FSA boundaries).
    #[arg(long, global = true)]
    pub areas_path: Option<PathBuf>,

    /// Postal-code center points (.json or .csv).
    #[arg(long, global = true)]
    pub postal_points_path: Option<PathBuf>,

    /// Per-request timeout in seconds.
    #[arg(long, global = true, default_value_t = 15)]
    pub timeout_secs: u64,

    /// Registry queries in flight per batch.
    #[arg(long, global = true, default_value_t = 5)]
    pub concurrency: usize,

    /// Pause between registry batches, in milliseconds.
    #[arg(long, global = true, default_value_t = 200)]
    pub batch_delay_ms: u64,

    /// Max attempts per registry query.
    #[arg(long, global = true, default_value_t = 3)]
    pub max_attempts: u32,

    #[arg(long, global = true, default_value = DEFAULT_REGISTRY_SEARCH_URL)]
    pub registry_url: String,

    #[arg(long, global = true, default_value = DEFAULT_PROFILE_BASE_URL)]
    pub profile_url: String,

    #[arg(long, global = true, default_value = DEFAULT_MUNICIPAL_GEOCODER_URL)]
    pub municipal_geocoder_url: String,

    /// Skip the municipal geocoder.
    #[arg(long, global = true, default_value_t = false)]
    pub no_municipal_geocoder: bool,

    #[arg(long, global = true, default_value = DEFAULT_GOOGLE_GEOCODER_URL)]
    pub google_geocoder_url: String,

    /// Commercial geocoder key; the provider is skipped without one.
    #[arg(long, global = true, env = "GOOGLE_MAPS_API_KEY", hide_env_values = true)]
    pub google_api_key: Option<String>,

    #[arg(long, global = true, default_value = DEFAULT_MAPS_CO_GEOCODER_URL)]
    pub maps_co_url: String,

    #[arg(long, global = true, env = "MAPS_CO_API_KEY", hide_env_values = true)]
    pub maps_co_api_key: Option<String>,

    /// Show progress bars on stderr.
    #[arg(long, global = true, default_value_t = false)]
    pub progress: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct FilterArgs {
    /// Registry doctor type filter.
    #[arg(long, default_value = "Any")]
    pub doctor_type: String,

    /// Registry specialist type filter.
    #[arg(long)]
    pub specialist_type: Option<String>,

    /// Language spoken filter.
    #[arg(long, default_value = "ENGLISH")]
    pub language: String,
}

impl FilterArgs {
    pub fn to_filters(&self) -> SearchFilters {
        SearchFilters {
            doctor_type: self.doctor_type.clone(),
            specialist_type: self.specialist_type.clone(),
            language: self.language.clone(),
        }
    }
}

#[derive(clap::Args, Debug, Clone)]
pub struct SearchArgs {
    #[arg(long, requires = "lng", conflicts_with = "address", allow_hyphen_values = true)]
    pub lat: Option<f64>,

    #[arg(long, requires = "lat", allow_hyphen_values = true)]
    pub lng: Option<f64>,

    /// Address or postal code to center the search on.
    #[arg(long, required_unless_present = "lat")]
    pub address: Option<String>,

    #[arg(long, default_value_t = 2.0)]
    pub radius_km: f64,

    #[command(flatten)]
    pub filters: FilterArgs,

    /// Query the registry even for areas already stored.
    #[arg(long, default_value_t = false)]
    pub refresh: bool,

    /// Do not geocode result addresses.
    #[arg(long, default_value_t = false)]
    pub no_geocode: bool,

    /// Run enrichment before printing instead of in the background.
    #[arg(long, default_value_t = false)]
    pub wait_enrichment: bool,
}

#[derive(clap::Args, Debug, Clone)]
pub struct ExpandArgs {
    /// Seed postal codes (FSA or longer), e.g. M5H or "M5H 2".
    #[arg(required = true, num_args = 1..)]
    pub seeds: Vec<String>,

    #[command(flatten)]
    pub filters: FilterArgs,
}

#[derive(clap::Args, Debug, Clone)]
pub struct EnrichArgs {
    /// Registration numbers to fetch.
    #[arg(conflicts_with = "pending")]
    pub registration_numbers: Vec<String>,

    /// Instead, revisit up to N stored records still lacking enrichment.
    #[arg(long, required_unless_present = "registration_numbers")]
    pub pending: Option<usize>,
}

#[derive(clap::Args, Debug, Clone)]
pub struct GeocodeArgs {
    #[arg(required = true, num_args = 1..)]
    pub addresses: Vec<String>,
}

impl CommonArgs {
    pub fn to_config(&self) -> DirectoryConfig {
        let mut config = DirectoryConfig {
            db_path: self.db_path.clone(),
            areas_path: self.areas_path.clone(),
            postal_points_path: self.postal_points_path.clone(),
            request_timeout: Duration::from_secs(self.timeout_secs.max(1)),
            ..Default::default()
        };
        config.registry.search_url = self.registry_url.clone();
        config.fanout.concurrency = self.concurrency.max(1);
        config.fanout.batch_delay = Duration::from_millis(self.batch_delay_ms);
        config.fanout.retry.max_attempts = self.max_attempts.max(1);
        config.enrichment.profile_base_url = self.profile_url.clone();
        config.geocoding.municipal_url =
            (!self.no_municipal_geocoder).then(|| self.municipal_geocoder_url.clone());
        config.geocoding.google_url = self.google_geocoder_url.clone();
        config.geocoding.google_api_key = self.google_api_key.clone();
        config.geocoding.maps_co_url = Some(self.maps_co_url.clone());
        config.geocoding.maps_co_api_key = self.maps_co_api_key.clone();
        config
    }
}
