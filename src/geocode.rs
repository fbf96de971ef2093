//! Geocoding enrichment: one forward or reverse lookup per location,
//! decomposed into normalized address components.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{ExtractionOutcome, FieldMap, ItemReport, Phase};
use crate::rate_limit::EndpointLimiter;
use crate::retry::RetryPolicy;

pub const DEFAULT_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";

/// Component types copied into the output, by long name.
const COMPONENT_TYPES: &[&str] = &[
    "street_number",
    "route",
    "locality",
    "postal_code",
    "administrative_area_level_1",
    "administrative_area_level_2",
    "administrative_area_level_3",
    "country",
];

#[derive(Debug, Clone, PartialEq)]
pub enum GeocodeRequest {
    Address(String),
    LatLng { lat: f64, lng: f64 },
}

impl GeocodeRequest {
    pub fn key(&self) -> String {
        match self {
            Self::Address(address) => address.clone(),
            Self::LatLng { lat, lng } => format!("{},{}", lat, lng),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GeocodeResponse {
    pub status: String,
    #[serde(default)]
    pub results: Vec<GeocodeResult>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct GeocodeResult {
    #[serde(default)]
    pub formatted_address: Option<String>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
    #[serde(default)]
    pub address_components: Vec<AddressComponent>,
    #[serde(default)]
    pub place_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Geometry {
    pub location: Option<LatLng>,
}

#[derive(Debug, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Deserialize)]
pub struct AddressComponent {
    pub long_name: String,
    pub short_name: String,
    #[serde(default)]
    pub types: Vec<String>,
}

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("geocode request timed out")]
    Timeout,
    #[error("geocode transport error: {0}")]
    Transport(String),
    #[error("geocode endpoint returned HTTP {0}")]
    Status(u16),
    #[error("invalid geocode response: {0}")]
    Decode(#[from] serde_json::Error),
}

impl GeocodeError {
    fn into_outcome(self) -> ExtractionOutcome {
        match self {
            Self::Status(code) if code != 429 && (400..500).contains(&code) => {
                ExtractionOutcome::FatalFailure(self.to_string())
            }
            _ => ExtractionOutcome::TransientFailure(self.to_string()),
        }
    }
}

#[async_trait]
pub trait GeocodeApi: Send + Sync {
    async fn lookup(&self, request: &GeocodeRequest) -> Result<GeocodeResponse, GeocodeError>;
}

pub struct HttpGeocodeApi {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    region: Option<String>,
}

impl HttpGeocodeApi {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        region: Option<String>,
        timeout: Duration,
    ) -> Result<Self, GeocodeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GeocodeError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            region,
        })
    }
}

#[async_trait]
impl GeocodeApi for HttpGeocodeApi {
    async fn lookup(&self, request: &GeocodeRequest) -> Result<GeocodeResponse, GeocodeError> {
        let mut params = vec![("key", self.api_key.clone())];
        match request {
            GeocodeRequest::Address(address) => params.push(("address", address.clone())),
            GeocodeRequest::LatLng { lat, lng } => params.push(("latlng", format!("{},{}", lat, lng))),
        }
        if let Some(region) = &self.region {
            params.push(("region", region.clone()));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .query(&params)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    GeocodeError::Timeout
                } else {
                    GeocodeError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(GeocodeError::Status(status.as_u16()));
        }
        let body = response
            .text()
            .await
            .map_err(|e| GeocodeError::Transport(e.to_string()))?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// Map an API response onto an outcome.
pub fn classify(response: GeocodeResponse) -> ExtractionOutcome {
    let detail = || match &response.error_message {
        Some(msg) if !msg.is_empty() => format!("{}: {}", response.status, msg),
        _ => response.status.clone(),
    };

    match response.status.as_str() {
        "OK" => match response.results.first() {
            Some(result) => {
                let (fields, missing) = decompose(result);
                if missing.is_empty() {
                    ExtractionOutcome::Success(fields)
                } else {
                    ExtractionOutcome::PartialSuccess { fields, missing }
                }
            }
            None => ExtractionOutcome::NotFound,
        },
        "ZERO_RESULTS" => ExtractionOutcome::NotFound,
        "REQUEST_DENIED" | "INVALID_REQUEST" => ExtractionOutcome::FatalFailure(detail()),
        // OVER_QUERY_LIMIT, UNKNOWN_ERROR and anything unrecognized.
        _ => ExtractionOutcome::TransientFailure(detail()),
    }
}

/// Flatten one result into output fields. Components are keyed by their
/// first type; formatted address and location are required.
pub fn decompose(result: &GeocodeResult) -> (FieldMap, BTreeSet<String>) {
    let mut fields = FieldMap::new();
    let mut missing = BTreeSet::new();

    match result.formatted_address.as_deref().map(str::trim) {
        Some(addr) if !addr.is_empty() => {
            fields.insert("formatted_address".into(), addr.to_string());
        }
        _ => {
            missing.insert("formatted_address".to_string());
        }
    }
    match result.geometry.as_ref().and_then(|g| g.location.as_ref()) {
        Some(loc) => {
            fields.insert("latitude".into(), loc.lat.to_string());
            fields.insert("longitude".into(), loc.lng.to_string());
        }
        None => {
            missing.insert("latitude".to_string());
            missing.insert("longitude".to_string());
        }
    }

    for component in &result.address_components {
        let Some(kind) = component.types.first() else {
            continue;
        };
        if !COMPONENT_TYPES.contains(&kind.as_str()) {
            continue;
        }
        fields
            .entry(kind.clone())
            .or_insert_with(|| component.long_name.clone());
        if kind == "country" {
            fields
                .entry("country_code".into())
                .or_insert_with(|| component.short_name.clone());
        }
    }

    if let Some(place_id) = &result.place_id {
        fields.insert("place_id".into(), place_id.clone());
    }
    (fields, missing)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeocodePolicy {
    #[default]
    ForwardOnly,
    ReverseThenForward,
}

/// What is known about where an item is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Location {
    pub address: Option<String>,
    pub coords: Option<(f64, f64)>,
}

fn default_address_columns() -> Vec<String> {
    vec!["address".into()]
}

fn default_latitude() -> String {
    "latitude".into()
}

fn default_longitude() -> String {
    "longitude".into()
}

/// Which fields describe an item's location.
#[derive(Debug, Clone, Deserialize)]
pub struct LocationColumns {
    #[serde(default = "default_address_columns")]
    pub address: Vec<String>,
    #[serde(default = "default_latitude")]
    pub latitude: String,
    #[serde(default = "default_longitude")]
    pub longitude: String,
    /// Appended to every address, e.g. the country name.
    #[serde(default)]
    pub suffix: Option<String>,
}

impl Default for LocationColumns {
    fn default() -> Self {
        Self {
            address: default_address_columns(),
            latitude: default_latitude(),
            longitude: default_longitude(),
            suffix: None,
        }
    }
}

impl LocationColumns {
    /// `address` with the configured suffix appended.
    pub fn with_suffix(&self, address: &str) -> String {
        match self.suffix.as_deref().filter(|s| !s.is_empty()) {
            Some(suffix) => format!("{}, {}", address, suffix),
            None => address.to_string(),
        }
    }

    pub fn locate(&self, fields: &FieldMap) -> Location {
        let parts: Vec<&str> = self
            .address
            .iter()
            .filter_map(|col| fields.get(col))
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .collect();
        let address = (!parts.is_empty()).then(|| self.with_suffix(&parts.join(", ")));

        let coord = |col: &str| fields.get(col).and_then(|v| v.trim().parse::<f64>().ok());
        let coords = match (coord(&self.latitude), coord(&self.longitude)) {
            (Some(lat), Some(lng))
                if (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lng) =>
            {
                Some((lat, lng))
            }
            _ => None,
        };

        Location { address, coords }
    }
}

pub struct Enricher {
    api: Arc<dyn GeocodeApi>,
    limiter: Option<Arc<EndpointLimiter>>,
    retry: RetryPolicy,
    policy: GeocodePolicy,
}

impl Enricher {
    pub fn new(api: Arc<dyn GeocodeApi>, retry: RetryPolicy, policy: GeocodePolicy) -> Self {
        Self {
            api,
            limiter: None,
            retry,
            policy,
        }
    }

    pub fn with_limiter(mut self, limiter: Option<Arc<EndpointLimiter>>) -> Self {
        self.limiter = limiter;
        self
    }

    fn requests(&self, location: &Location) -> Vec<GeocodeRequest> {
        let forward = location.address.clone().map(GeocodeRequest::Address);
        let reverse = location
            .coords
            .map(|(lat, lng)| GeocodeRequest::LatLng { lat, lng });
        match self.policy {
            GeocodePolicy::ForwardOnly => forward.into_iter().collect(),
            GeocodePolicy::ReverseThenForward => reverse.into_iter().chain(forward).collect(),
        }
    }

    async fn attempt(&self, request: &GeocodeRequest) -> ExtractionOutcome {
        if let Some(limiter) = &self.limiter {
            if let Err(e) = limiter.acquire().await {
                return ExtractionOutcome::TransientFailure(e.to_string());
            }
        }
        match self.api.lookup(request).await {
            Ok(response) => classify(response),
            Err(e) => e.into_outcome(),
        }
    }

    /// Geocode `location` under the configured policy. `None` when the
    /// location offers nothing the policy can look up.
    pub async fn enrich(&self, item_id: &str, location: &Location) -> Option<ItemReport> {
        let requests = self.requests(location);
        let mut attempts = Vec::new();
        let mut last = None;

        for request in &requests {
            let this = self;
            let report = self
                .retry
                .run(item_id, Phase::Geocode, move |_| this.attempt(request))
                .await;
            attempts.extend(report.attempts);
            let outcome = report.outcome;
            if outcome.fields().is_some() {
                debug!(item = item_id, request = %request.key(), "Geocoded");
                return Some(ItemReport { outcome, attempts });
            }
            info!(item = item_id, request = %request.key(), outcome = %outcome.tag(), "Geocode lookup gave no result");
            last = Some(outcome);
        }

        last.map(|outcome| ItemReport { outcome, attempts })
    }
}

/// Short status string recorded next to enriched records.
pub fn geocode_status(outcome: Option<&ExtractionOutcome>) -> String {
    match outcome {
        None => "SKIPPED".into(),
        Some(ExtractionOutcome::Success(_)) => "SUCCESS".into(),
        Some(ExtractionOutcome::PartialSuccess { .. }) => "PARTIAL".into(),
        Some(ExtractionOutcome::NotFound) => "NOT_FOUND".into(),
        Some(ExtractionOutcome::TransientFailure(c) | ExtractionOutcome::FatalFailure(c)) => {
            format!("FAILED: {}", c)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OutcomeTag;
    use crate::testing::{status_body, FakeGeocoder};

    fn fixture() -> String {
        std::fs::read_to_string("tests/fixtures/geocode_ok.json").unwrap()
    }

    fn enricher(api: &FakeGeocoder, policy: GeocodePolicy) -> Enricher {
        Enricher::new(
            Arc::new(api.clone()),
            RetryPolicy::new(3, Duration::from_millis(500)),
            policy,
        )
    }

    fn address(a: &str) -> Location {
        Location {
            address: Some(a.into()),
            coords: None,
        }
    }

    #[test]
    fn ok_response_decomposes_components() {
        let response: GeocodeResponse = serde_json::from_str(&fixture()).unwrap();
        let outcome = classify(response);
        let fields = outcome.fields().unwrap();
        assert_eq!(outcome.tag(), OutcomeTag::Success);
        assert_eq!(fields["formatted_address"], "Via Roma, 1, 20121 Milano MI, Italy");
        assert_eq!(fields["route"], "Via Roma");
        assert_eq!(fields["locality"], "Milano");
        assert_eq!(fields["postal_code"], "20121");
        assert_eq!(fields["country"], "Italy");
        assert_eq!(fields["country_code"], "IT");
        assert_eq!(fields["latitude"], "45.4654219");
        assert!(!fields.contains_key("political"));
    }

    #[test]
    fn status_mapping() {
        let parse = |s: &str| classify(serde_json::from_str(&status_body(s)).unwrap());
        assert_eq!(parse("ZERO_RESULTS"), ExtractionOutcome::NotFound);
        assert_eq!(parse("OVER_QUERY_LIMIT").tag(), OutcomeTag::Transient);
        assert_eq!(parse("SOMETHING_NEW").tag(), OutcomeTag::Transient);
        assert_eq!(parse("REQUEST_DENIED").tag(), OutcomeTag::Fatal);
    }

    #[test]
    fn missing_geometry_is_partial() {
        let body = r#"{"status":"OK","results":[{"formatted_address":"Milano, Italy","address_components":[]}]}"#;
        match classify(serde_json::from_str(body).unwrap()) {
            ExtractionOutcome::PartialSuccess { missing, .. } => {
                assert!(missing.contains("latitude"));
            }
            other => panic!("expected partial, got {:?}", other),
        }
    }

    #[test]
    fn location_from_columns() {
        let columns = LocationColumns {
            address: vec!["Address".into(), "Comune".into()],
            suffix: Some("Italy".into()),
            ..LocationColumns::default()
        };
        let mut fields = FieldMap::new();
        fields.insert("Address".into(), " Via Roma 1 ".into());
        fields.insert("Comune".into(), "Milano".into());
        fields.insert("latitude".into(), "N/A".into());
        fields.insert("longitude".into(), "9.19".into());
        let location = columns.locate(&fields);
        assert_eq!(location.address.as_deref(), Some("Via Roma 1, Milano, Italy"));
        assert_eq!(location.coords, None);
    }

    #[tokio::test(start_paused = true)]
    async fn over_query_limit_then_ok_backs_off() {
        let api = FakeGeocoder::new()
            .respond("Via Roma 1, Milano", &status_body("OVER_QUERY_LIMIT"))
            .respond("Via Roma 1, Milano", &fixture());
        let start = tokio::time::Instant::now();
        let report = enricher(&api, GeocodePolicy::ForwardOnly)
            .enrich("7", &address("Via Roma 1, Milano"))
            .await
            .unwrap();
        assert_eq!(report.outcome.tag(), OutcomeTag::Success);
        assert_eq!(report.attempts.len(), 2);
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(api.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reverse_then_forward_falls_back_to_address() {
        let api = FakeGeocoder::new()
            .respond("45.46,9.19", &status_body("ZERO_RESULTS"))
            .respond("Via Roma 1, Milano", &fixture());
        let location = Location {
            address: Some("Via Roma 1, Milano".into()),
            coords: Some((45.46, 9.19)),
        };
        let report = enricher(&api, GeocodePolicy::ReverseThenForward)
            .enrich("7", &location)
            .await
            .unwrap();
        assert_eq!(report.outcome.tag(), OutcomeTag::Success);
        assert_eq!(api.calls(), vec!["45.46,9.19", "Via Roma 1, Milano"]);
    }

    #[tokio::test(start_paused = true)]
    async fn forward_only_ignores_coordinates() {
        let api = FakeGeocoder::new();
        let location = Location {
            address: None,
            coords: Some((45.46, 9.19)),
        };
        let report = enricher(&api, GeocodePolicy::ForwardOnly)
            .enrich("7", &location)
            .await;
        assert!(report.is_none());
        assert!(api.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_endpoint_exhausts_retries() {
        let api = FakeGeocoder::new().unreachable("Nowhere");
        let report = enricher(&api, GeocodePolicy::ForwardOnly)
            .enrich("7", &address("Nowhere"))
            .await
            .unwrap();
        assert_eq!(report.outcome.tag(), OutcomeTag::Fatal);
        assert_eq!(report.attempts.len(), 4);
        assert!(geocode_status(Some(&report.outcome)).starts_with("FAILED: retries exhausted"));
    }
}
