use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

const SEARCH_TEXT_URL: &str = "https://places.googleapis.com/v1/places:searchText";
const GEOCODE_URL: &str = "https://maps.googleapis.com/maps/api/geocode/json";

pub const FIELD_MASK: &str = "places.id,places.displayName,places.formattedAddress,\
places.nationalPhoneNumber,places.websiteUri,places.rating,places.userRatingCount,\
places.primaryType,places.primaryTypeDisplayName,places.googleMapsUri,places.location,\
nextPageToken";

#[derive(Clone)]
pub struct PlacesClient {
    http: reqwest::Client,
    api_key: Option<String>,
    search_url: String,
    geocode_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone)]
pub struct TextSearch<'a> {
    pub query: &'a str,
    pub center: Option<LatLng>,
    pub radius_meters: f64,
    pub page_size: u32,
    pub page_token: Option<&'a str>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchTextResponse {
    #[serde(default)]
    pub places: Vec<Place>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    pub id: String,
    pub display_name: Option<LocalizedText>,
    pub formatted_address: Option<String>,
    pub national_phone_number: Option<String>,
    pub website_uri: Option<String>,
    pub rating: Option<f64>,
    pub user_rating_count: Option<i64>,
    pub primary_type: Option<String>,
    pub primary_type_display_name: Option<LocalizedText>,
    pub google_maps_uri: Option<String>,
    pub location: Option<LatLng>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LocalizedText {
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResponse {
    status: String,
    #[serde(default)]
    results: Vec<GeocodeResult>,
}

#[derive(Debug, Deserialize)]
struct GeocodeResult {
    geometry: GeocodeGeometry,
}

#[derive(Debug, Deserialize)]
struct GeocodeGeometry {
    location: GeocodeLocation,
}

#[derive(Debug, Deserialize)]
struct GeocodeLocation {
    lat: f64,
    lng: f64,
}

impl PlacesClient {
    pub fn new(api_key: Option<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to create places HTTP client")?;

        Ok(Self {
            http,
            api_key,
            search_url: SEARCH_TEXT_URL.to_string(),
            geocode_url: GEOCODE_URL.to_string(),
        })
    }

    fn require_api_key(&self) -> anyhow::Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| anyhow!("GOOGLE_PLACES_API_KEY is not configured."))
    }

    pub async fn search_text(&self, search: &TextSearch<'_>) -> anyhow::Result<SearchTextResponse> {
        let key = self.require_api_key()?;

        let response = self
            .http
            .post(&self.search_url)
            .header("X-Goog-Api-Key", key)
            .header("X-Goog-FieldMask", FIELD_MASK)
            .json(&search_body(search))
            .send()
            .await
            .context("places text search request failed")?;

        let status = response.status();
        let text = response
            .text()
            .await
            .context("failed to read places response body")?;

        if !status.is_success() {
            return Err(anyhow!(
                "places text search failed with status {}: {}",
                status,
                text
            ));
        }

        serde_json::from_str(&text).context("failed to decode places response")
    }

    /// Resolves a zip code or city name to coordinates. `None` when the
    /// geocoder finds nothing.
    pub async fn geocode(&self, address: &str) -> anyhow::Result<Option<LatLng>> {
        let key = self.require_api_key()?;

        let response = self
            .http
            .get(&self.geocode_url)
            .query(&[("address", address), ("key", key)])
            .send()
            .await
            .context("geocode request failed")?;

        if !response.status().is_success() {
            return Err(anyhow!("geocode failed with status {}", response.status()));
        }

        let body: GeocodeResponse = response
            .json()
            .await
            .context("failed to decode geocode response")?;

        match body.status.as_str() {
            "OK" => Ok(body.results.into_iter().next().map(|result| LatLng {
                latitude: result.geometry.location.lat,
                longitude: result.geometry.location.lng,
            })),
            "ZERO_RESULTS" => Ok(None),
            other => Err(anyhow!("geocode returned status {}", other)),
        }
    }
}

fn search_body(search: &TextSearch<'_>) -> serde_json::Value {
    let mut body = serde_json::json!({
        "textQuery": search.query,
        "pageSize": search.page_size,
    });

    if let Some(center) = search.center {
        body["locationBias"] = serde_json::json!({
            "circle": {
                "center": center,
                "radius": search.radius_meters,
            }
        });
    }
    if let Some(token) = search.page_token {
        body["pageToken"] = serde_json::Value::String(token.to_string());
    }

    body
}
