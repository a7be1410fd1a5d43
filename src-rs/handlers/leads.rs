use axum::extract::{rejection::JsonRejection, Extension, Json, State};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    billing::load_profile,
    error::{AppError, AppResult},
    handlers::{parse_body, required},
    leads::{clamp_radius_km, filter_min_rating, normalize_place},
    middleware::AuthenticatedUser,
    places::{LatLng, TextSearch},
    plans::{effective_plan, plan_limits},
    state::AppState,
};

/// Places text search never returns more than this per page.
const MAX_PAGE_SIZE: u32 = 20;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadSearchRequest {
    pub query: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub zip: Option<String>,
    pub city: Option<String>,
    #[serde(alias = "radius_km")]
    pub radius_km: Option<f64>,
    #[serde(alias = "min_rating")]
    pub min_rating: Option<f64>,
    #[serde(alias = "page_token")]
    pub page_token: Option<String>,
}

impl LeadSearchRequest {
    fn explicit_center(&self) -> Option<LatLng> {
        match (self.lat, self.lng) {
            (Some(latitude), Some(longitude)) if latitude.is_finite() && longitude.is_finite() => {
                Some(LatLng {
                    latitude,
                    longitude,
                })
            }
            _ => None,
        }
    }

    fn location_text(&self) -> Option<&str> {
        [self.zip.as_deref(), self.city.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|value| !value.is_empty())
    }
}

pub fn page_size_for(leads_per_search: u32) -> u32 {
    leads_per_search.clamp(1, MAX_PAGE_SIZE)
}

pub async fn search_leads(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    payload: Result<Json<LeadSearchRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let body = parse_body(payload)?;
    let query = required(body.query.clone(), "query")?;

    let center = match body.explicit_center() {
        Some(center) => Some(center),
        None => match body.location_text() {
            Some(location) => Some(
                state
                    .places
                    .geocode(location)
                    .await?
                    .ok_or_else(|| AppError::bad_request(format!("Could not locate \"{location}\".")))?,
            ),
            None => None,
        },
    };

    let radius_km = clamp_radius_km(body.radius_km);

    let profile = load_profile(&state.store, &user.id).await?;
    let plan = effective_plan(
        profile.as_ref().and_then(|profile| profile.plan.as_deref()),
        profile.as_ref().and_then(|profile| profile.plan_status.as_deref()),
    );
    let limits = plan_limits(plan);

    let response = state
        .places
        .search_text(&TextSearch {
            query: &query,
            center,
            radius_meters: radius_km * 1000.0,
            page_size: page_size_for(limits.leads_per_search),
            page_token: body.page_token.as_deref().filter(|token| !token.is_empty()),
        })
        .await?;

    let leads = response.places.into_iter().map(normalize_place).collect();
    let mut leads = filter_min_rating(leads, body.min_rating);
    leads.truncate(limits.leads_per_search as usize);

    tracing::debug!(
        user_id = %user.id,
        plan = plan.as_str(),
        count = leads.len(),
        "lead search completed"
    );

    Ok(Json(json!({
        "leads": leads,
        "nextPageToken": response.next_page_token,
        "radiusKm": radius_km,
        "center": center,
        "plan": plan.as_str(),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(value: Value) -> LeadSearchRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn explicit_coordinates_take_priority() {
        let body = request(json!({ "query": "plumbers", "lat": 40.0, "lng": -74.0, "zip": "10001" }));
        assert_eq!(
            body.explicit_center(),
            Some(LatLng {
                latitude: 40.0,
                longitude: -74.0
            })
        );

        let partial = request(json!({ "query": "plumbers", "lat": 40.0 }));
        assert_eq!(partial.explicit_center(), None);
    }

    #[test]
    fn zip_is_preferred_over_city() {
        let body = request(json!({ "query": "roofers", "zip": " 94110 ", "city": "Oakland" }));
        assert_eq!(body.location_text(), Some("94110"));

        let city_only = request(json!({ "query": "roofers", "zip": "", "city": "Oakland" }));
        assert_eq!(city_only.location_text(), Some("Oakland"));
    }

    #[test]
    fn snake_case_aliases_are_accepted() {
        let body = request(json!({ "query": "salons", "radius_km": 5.0, "min_rating": 4.0 }));
        assert_eq!(body.radius_km, Some(5.0));
        assert_eq!(body.min_rating, Some(4.0));
    }

    #[test]
    fn page_size_respects_the_places_cap() {
        assert_eq!(page_size_for(20), 20);
        assert_eq!(page_size_for(60), 20);
        assert_eq!(page_size_for(0), 1);
    }
}
