use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::geo::BoundingBox;

const SEARCH_FIELD_MASK: &str = "places.id";
const DETAIL_FIELD_MASK: &str = "id,displayName,location,addressComponents,\
nationalPhoneNumber,websiteUri,regularOpeningHours.weekdayDescriptions";

/// Coarse first-stage result: an opaque identifier to be enriched by a
/// detail fetch.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: String,
}

/// Normalized point-of-interest record as persisted. Only the name and the
/// coordinates are required; they form the uniqueness key.
#[derive(Debug, Clone, PartialEq)]
pub struct PoiRecord {
    pub name: String,
    pub housenumber: Option<String>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postcode: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub opening_hours: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
}

/// The two call shapes of the external places API.
#[async_trait]
pub trait SearchApi: Send + Sync {
    async fn search_candidates(&self, term: &str, bbox: &BoundingBox)
        -> AppResult<Vec<Candidate>>;

    /// Detail fetch for one candidate. `None` means the API answered but the
    /// response carried nothing usable (no display name, no coordinates).
    async fn place_details(&self, place_id: &str) -> AppResult<Option<PoiRecord>>;
}

#[derive(Clone)]
pub struct SearchService {
    inner: Arc<dyn SearchApi>,
}

impl SearchService {
    pub fn new(config: &AppConfig) -> AppResult<Self> {
        let client = HttpSearchClient::new(
            config.places_api_base.clone(),
            config.places_api_key.clone(),
            config.http_timeout,
        )?;
        Ok(Self {
            inner: Arc::new(client),
        })
    }

    #[cfg(test)]
    pub fn from_api(api: Arc<dyn SearchApi>) -> Self {
        Self { inner: api }
    }

    pub async fn search_candidates(
        &self,
        term: &str,
        bbox: &BoundingBox,
    ) -> AppResult<Vec<Candidate>> {
        self.inner.search_candidates(term, bbox).await
    }

    pub async fn place_details(&self, place_id: &str) -> AppResult<Option<PoiRecord>> {
        self.inner.place_details(place_id).await
    }
}

struct HttpSearchClient {
    http: reqwest::Client,
    base_url: String,
    api_key: SecretString,
}

impl HttpSearchClient {
    fn new(base_url: String, api_key: SecretString, timeout: Duration) -> AppResult<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }
}

#[async_trait]
impl SearchApi for HttpSearchClient {
    async fn search_candidates(
        &self,
        term: &str,
        bbox: &BoundingBox,
    ) -> AppResult<Vec<Candidate>> {
        #[derive(serde::Serialize)]
        struct RequestBody<'a> {
            #[serde(rename = "textQuery")]
            text_query: &'a str,
            #[serde(rename = "locationRestriction")]
            location_restriction: LocationRestriction,
        }

        #[derive(serde::Serialize)]
        struct LocationRestriction {
            rectangle: Rectangle,
        }

        #[derive(serde::Serialize)]
        struct Rectangle {
            low: LatLng,
            high: LatLng,
        }

        #[derive(serde::Serialize)]
        struct LatLng {
            latitude: f64,
            longitude: f64,
        }

        #[derive(Deserialize)]
        struct Response {
            places: Option<Vec<ResponsePlace>>,
        }

        #[derive(Deserialize)]
        struct ResponsePlace {
            id: Option<String>,
        }

        let body = RequestBody {
            text_query: term,
            location_restriction: LocationRestriction {
                rectangle: Rectangle {
                    low: LatLng {
                        latitude: bbox.south,
                        longitude: bbox.west,
                    },
                    high: LatLng {
                        latitude: bbox.north,
                        longitude: bbox.east,
                    },
                },
            },
        };

        let response = self
            .http
            .post(format!("{}/places:searchText", self.base_url))
            .header("X-Goog-Api-Key", self.api_key.expose_secret())
            .header("X-Goog-FieldMask", SEARCH_FIELD_MASK)
            .json(&body)
            .send()
            .await?;
        let response = reject_throttled(response)?.error_for_status()?;

        let parsed: Response = response.json().await?;
        Ok(parsed
            .places
            .unwrap_or_default()
            .into_iter()
            .filter_map(|place| place.id)
            .map(|id| Candidate { id })
            .collect())
    }

    async fn place_details(&self, place_id: &str) -> AppResult<Option<PoiRecord>> {
        let response = self
            .http
            .get(format!("{}/places/{place_id}", self.base_url))
            .header("X-Goog-Api-Key", self.api_key.expose_secret())
            .header("X-Goog-FieldMask", DETAIL_FIELD_MASK)
            .send()
            .await?;
        let response = reject_throttled(response)?.error_for_status()?;

        let detail: DetailResponse = response.json().await?;
        Ok(assemble_record(detail))
    }
}

fn reject_throttled(response: reqwest::Response) -> AppResult<reqwest::Response> {
    if response.status() == StatusCode::TOO_MANY_REQUESTS {
        return Err(AppError::RateLimited);
    }
    Ok(response)
}

#[derive(Deserialize)]
struct DetailResponse {
    #[serde(rename = "displayName")]
    display_name: Option<DisplayName>,
    location: Option<Location>,
    #[serde(rename = "addressComponents", default)]
    address_components: Vec<AddressComponent>,
    #[serde(rename = "nationalPhoneNumber")]
    phone: Option<String>,
    #[serde(rename = "websiteUri")]
    website: Option<String>,
    #[serde(rename = "regularOpeningHours")]
    opening_hours: Option<OpeningHours>,
}

#[derive(Deserialize)]
struct DisplayName {
    text: Option<String>,
}

#[derive(Deserialize)]
struct Location {
    latitude: Option<f64>,
    longitude: Option<f64>,
}

#[derive(Deserialize)]
struct AddressComponent {
    #[serde(rename = "longText")]
    long_text: Option<String>,
    #[serde(rename = "shortText")]
    short_text: Option<String>,
    #[serde(default)]
    types: Vec<String>,
}

#[derive(Deserialize)]
struct OpeningHours {
    #[serde(rename = "weekdayDescriptions", default)]
    weekday_descriptions: Vec<String>,
}

/// Folds a detail response into the persisted shape. A record needs a name
/// and coordinates to be keyable; anything less is dropped.
fn assemble_record(detail: DetailResponse) -> Option<PoiRecord> {
    let name = detail
        .display_name
        .and_then(|display| display.text)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())?;
    let location = detail.location?;
    let (latitude, longitude) = match (location.latitude, location.longitude) {
        (Some(lat), Some(lon)) => (lat, lon),
        _ => return None,
    };

    let mut record = PoiRecord {
        name,
        housenumber: None,
        street: None,
        city: None,
        state: None,
        postcode: None,
        phone: detail.phone,
        website: detail.website,
        opening_hours: detail
            .opening_hours
            .map(|hours| hours.weekday_descriptions.join("; "))
            .filter(|joined| !joined.is_empty()),
        latitude,
        longitude,
    };

    for component in detail.address_components {
        let kind = component.types.first().map(String::as_str);
        match kind {
            Some("street_number") => record.housenumber = component.long_text,
            Some("route") => record.street = component.long_text,
            Some("locality") => record.city = component.long_text,
            Some("administrative_area_level_1") => record.state = component.short_text,
            Some("postal_code") => record.postcode = component.long_text,
            _ => {}
        }
    }

    Some(record)
}
