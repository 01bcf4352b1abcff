pub const DEFAULT_REGISTRY_SEARCH_URL: &str = "https://register.cpso.on.ca/Get-Search-Results/";
pub const DEFAULT_PROFILE_BASE_URL: &str = "https://register.cpso.on.ca/physician-info/";
pub const DEFAULT_MUNICIPAL_GEOCODER_URL: &str = "https://map.toronto.ca/cotgeocoder/rest/geocoder/";
pub const DEFAULT_GOOGLE_GEOCODER_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";
pub const DEFAULT_MAPS_CO_GEOCODER_URL: &str = "https://geocode.maps.co/search";

pub const USER_AGENT: &str = "physician-directory/0.1";

/// `totalcount` value the registry returns when a query matches more rows
/// than it is willing to enumerate.
pub const DEFAULT_OVERFLOW_SENTINEL: i64 = -1;
pub const DEFAULT_MAX_ENUMERABLE: usize = 100;

/// Letters valid in the fifth position of a Canadian postal code
/// (D, F, I, O, Q and U are never used).
pub const POSTAL_LETTERS: &str = "ABCEGHJKLMNPRSTVWXYZ";

pub const KM_PER_DEGREE_LAT: f64 = 111.0;
pub const EARTH_RADIUS_KM: f64 = 6371.0;

pub const DEFAULT_DB_FILE: &str = "physicians.sqlite";
