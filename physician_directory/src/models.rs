use serde::{Deserialize, Serialize};

use crate::common::non_empty;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lng: f64,
}

impl Coordinates {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// A practitioner as reconciled into the directory.
///
/// Identity is the registration number when present, otherwise the
/// `(name, address)` pair. Addresses alone are not unique: several
/// practitioners often share one clinic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhysicianRecord {
    pub name: String,
    pub specialty: Option<String>,
    pub address: String,
    pub phone: Option<String>,
    pub status: Option<String>,
    pub registration_number: Option<String>,
    pub postal_prefix: Option<String>,
    /// Demographic field fetched from the practitioner's profile page.
    pub enrichment: Option<String>,
    pub created_at_unix: Option<i64>,
    pub updated_at_unix: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PhysicianKey {
    Registration(String),
    NameAddress(String, String),
}

impl PhysicianRecord {
    pub fn key(&self) -> PhysicianKey {
        match non_empty(self.registration_number.as_deref()) {
            Some(reg) => PhysicianKey::Registration(reg),
            None => PhysicianKey::NameAddress(self.name.clone(), self.address.clone()),
        }
    }

    /// Trims the registration number; a blank one becomes `None`.
    pub fn normalized(mut self) -> Self {
        self.registration_number = non_empty(self.registration_number.as_deref());
        self
    }

    pub fn has_enrichment(&self) -> bool {
        self.enrichment
            .as_deref()
            .is_some_and(|v| !v.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeEntry {
    /// Normalized address; unique key of the geocode table.
    pub address: String,
    pub coordinates: Coordinates,
    /// Provider that resolved the address.
    pub source: String,
    pub geocoded_at_unix: i64,
}

/// Normalizes an address into the form used as geocode key and stored address.
pub fn normalize_address(raw: &str) -> String {
    raw.split(',')
        .map(|part| part.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(", ")
}
