use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::{
    common::{fetch_text, non_empty, parse_json_body},
    error::FetchError,
    models::{PhysicianRecord, normalize_address},
    postal::{PostalCode, fsa_of},
};

/// Filters sent with every registry search alongside the postal code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub doctor_type: String,
    pub specialist_type: Option<String>,
    pub language: String,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            doctor_type: "Any".to_string(),
            specialist_type: None,
            language: "ENGLISH".to_string(),
        }
    }
}

impl SearchFilters {
    /// Stable identity of a filter set, used to scope cached area searches.
    pub fn cache_key(&self) -> String {
        format!(
            "doctor_type={};specialist_type={};language={}",
            self.doctor_type,
            self.specialist_type.as_deref().unwrap_or_default(),
            self.language
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryPage {
    /// More matches than the registry enumerates; nothing was returned.
    Overflow,
    Entries(Vec<RegistryEntry>),
}

#[async_trait]
pub trait RegistryTransport: Send + Sync {
    /// Issues exactly one search request. Pacing and retries are the caller's concern.
    async fn search(
        &self,
        code: &PostalCode,
        filters: &SearchFilters,
    ) -> Result<RegistryPage, FetchError>;
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RegistryEntry {
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub specialties: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub street1: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub street2: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub street3: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub street4: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub city: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub province: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub postalcode: Option<String>,
    #[serde(default, alias = "phone", deserialize_with = "lenient_string")]
    pub phonenumber: Option<String>,
    #[serde(default, alias = "status", deserialize_with = "lenient_string")]
    pub registrationstatus: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub cpsonumber: Option<String>,
}

/// Accepts strings, numbers and arrays of strings; anything else becomes `None`.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) => non_empty(Some(&s)),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Array(items)) => {
            let parts: Vec<String> = items
                .iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| non_empty(Some(s)))
                .collect();
            (!parts.is_empty()).then(|| parts.join("; "))
        }
        _ => None,
    })
}

impl RegistryEntry {
    pub fn full_address(&self) -> String {
        let parts = [
            &self.street1,
            &self.street2,
            &self.street3,
            &self.street4,
            &self.city,
            &self.province,
            &self.postalcode,
        ];
        let joined = parts
            .iter()
            .filter_map(|p| p.as_deref())
            .collect::<Vec<_>>()
            .join(", ");
        normalize_address(&joined)
    }

    /// Converts an upstream entry; entries without a name or address are dropped.
    pub fn into_record(self, query_code: &PostalCode) -> Option<PhysicianRecord> {
        let address = self.full_address();
        let name = self.name?;
        if address.is_empty() {
            return None;
        }
        let postal_prefix = self
            .postalcode
            .as_deref()
            .and_then(fsa_of)
            .unwrap_or_else(|| query_code.fsa().to_string());
        Some(PhysicianRecord {
            name,
            specialty: self.specialties,
            address,
            phone: self.phonenumber,
            status: self.registrationstatus,
            registration_number: self.cpsonumber,
            postal_prefix: Some(postal_prefix),
            enrichment: None,
            created_at_unix: None,
            updated_at_unix: None,
        })
    }
}

/// Parses a search response body into a page, honouring the overflow sentinel.
pub fn parse_search_response(body: &str, overflow_sentinel: i64) -> Result<RegistryPage, FetchError> {
    let value = parse_json_body(body)?;

    let total = value
        .get("totalcount")
        .and_then(Value::as_i64)
        .ok_or_else(|| FetchError::Malformed("missing totalcount".to_string()))?;
    if total == overflow_sentinel {
        return Ok(RegistryPage::Overflow);
    }

    let entries = match value.get("results") {
        None | Some(Value::Null) => Vec::new(),
        Some(results @ Value::Array(_)) => {
            Vec::<RegistryEntry>::deserialize(results.clone())
                .map_err(|err| FetchError::Malformed(format!("unrecognized entry shape: {err}")))?
        }
        Some(_) => return Err(FetchError::Malformed("results is not an array".to_string())),
    };
    if total > 0 && entries.is_empty() {
        return Err(FetchError::Malformed(format!(
            "totalcount {total} but no results"
        )));
    }
    Ok(RegistryPage::Entries(entries))
}

/// Registry search over HTTP (form POST, JSON response).
pub struct HttpRegistryClient {
    client: Client,
    search_url: String,
    overflow_sentinel: i64,
}

impl HttpRegistryClient {
    pub fn new(client: Client, search_url: impl Into<String>, overflow_sentinel: i64) -> Self {
        Self {
            client,
            search_url: search_url.into(),
            overflow_sentinel,
        }
    }
}

#[async_trait]
impl RegistryTransport for HttpRegistryClient {
    async fn search(
        &self,
        code: &PostalCode,
        filters: &SearchFilters,
    ) -> Result<RegistryPage, FetchError> {
        let mut form = vec![
            ("postalCode", code.to_string()),
            ("doctorType", filters.doctor_type.clone()),
        ];
        if let Some(specialist) = &filters.specialist_type {
            form.push(("SpecialistType", specialist.clone()));
        }
        form.push(("LanguagesSelected", filters.language.clone()));

        let request = self
            .client
            .post(&self.search_url)
            .header("x-requested-with", "XMLHttpRequest")
            .form(&form);
        let body = fetch_text(request).await?;
        parse_search_response(&body, self.overflow_sentinel)
    }
}
