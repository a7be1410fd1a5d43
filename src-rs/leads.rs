use serde::Serialize;

use crate::places::Place;

pub const DEFAULT_RADIUS_KM: f64 = 15.0;
const MIN_RADIUS_KM: f64 = 1.0;
const MAX_RADIUS_KM: f64 = 50.0;

/// Local trades that rarely have an agency behind their web presence.
const UNDERSERVED_CATEGORIES: &[&str] = &[
    "plumb",
    "electric",
    "roof",
    "hvac",
    "heating",
    "landscap",
    "lawn",
    "clean",
    "pest",
    "locksmith",
    "auto repair",
    "car repair",
    "mechanic",
    "painter",
    "painting",
    "contractor",
    "handyman",
    "flooring",
    "moving",
    "towing",
    "salon",
    "barber",
    "tailor",
    "bakery",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lead {
    pub place_id: String,
    pub name: String,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub website: Option<String>,
    pub has_website: bool,
    pub rating: Option<f64>,
    pub review_count: i64,
    pub category: Option<String>,
    pub maps_url: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub opportunity_score: i32,
}

/// Missing or non-finite radius falls back to the default; everything else is
/// clamped to the supported window.
pub fn clamp_radius_km(radius_km: Option<f64>) -> f64 {
    match radius_km {
        Some(value) if value.is_finite() => value.clamp(MIN_RADIUS_KM, MAX_RADIUS_KM),
        _ => DEFAULT_RADIUS_KM,
    }
}

pub fn is_underserved_category(category: Option<&str>) -> bool {
    let Some(category) = category else {
        return false;
    };
    let category = category.to_ascii_lowercase().replace('_', " ");
    UNDERSERVED_CATEGORIES
        .iter()
        .any(|keyword| category.contains(keyword))
}

pub fn opportunity_score(
    has_website: bool,
    rating: Option<f64>,
    category: Option<&str>,
    has_address: bool,
) -> i32 {
    let mut score = 55;
    if !has_website {
        score += 25;
    }
    if let Some(rating) = rating {
        if rating < 3.0 {
            score += 18;
        } else if rating < 4.0 {
            score += 10;
        } else {
            score -= 15;
        }
    }
    if is_underserved_category(category) {
        score += 5;
    }
    if !has_address {
        score -= 5;
    }
    score.clamp(5, 100)
}

pub fn normalize_place(place: Place) -> Lead {
    let website = place.website_uri.filter(|value| !value.trim().is_empty());
    let address = place
        .formatted_address
        .filter(|value| !value.trim().is_empty());
    let category = place
        .primary_type_display_name
        .and_then(|name| name.text)
        .or(place.primary_type);

    let opportunity_score = opportunity_score(
        website.is_some(),
        place.rating,
        category.as_deref(),
        address.is_some(),
    );

    Lead {
        name: place
            .display_name
            .and_then(|name| name.text)
            .unwrap_or_else(|| "Unknown business".to_string()),
        place_id: place.id,
        has_website: website.is_some(),
        website,
        address,
        phone: place.national_phone_number,
        rating: place.rating,
        review_count: place.user_rating_count.unwrap_or(0),
        category,
        maps_url: place.google_maps_uri,
        latitude: place.location.map(|location| location.latitude),
        longitude: place.location.map(|location| location.longitude),
        opportunity_score,
    }
}

/// Drops leads under `min_rating`. Unrated leads are dropped too once a
/// threshold is set.
pub fn filter_min_rating(leads: Vec<Lead>, min_rating: Option<f64>) -> Vec<Lead> {
    match min_rating.filter(|value| *value > 0.0) {
        Some(min_rating) => leads
            .into_iter()
            .filter(|lead| lead.rating.map(|rating| rating >= min_rating).unwrap_or(false))
            .collect(),
        None => leads,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::places::{LatLng, LocalizedText};

    #[test]
    fn radius_is_clamped_and_defaulted() {
        assert_eq!(clamp_radius_km(Some(0.0)), 1.0);
        assert_eq!(clamp_radius_km(None), 15.0);
        assert_eq!(clamp_radius_km(Some(15.0)), 15.0);
        assert_eq!(clamp_radius_km(Some(1000.0)), 50.0);
        assert_eq!(clamp_radius_km(Some(f64::NAN)), 15.0);
    }

    #[test]
    fn score_example_is_clamped_to_one_hundred() {
        // 55 + 25 + 18 + 5 = 103
        assert_eq!(opportunity_score(false, Some(2.5), Some("plumbing"), true), 100);
    }

    #[test]
    fn score_components_apply() {
        assert_eq!(opportunity_score(true, None, None, true), 55);
        assert_eq!(opportunity_score(true, Some(3.5), None, true), 65);
        assert_eq!(opportunity_score(true, Some(4.0), None, true), 40);
        assert_eq!(opportunity_score(true, Some(4.8), None, false), 35);
        assert_eq!(opportunity_score(true, None, Some("Roofing contractor"), true), 60);
    }

    #[test]
    fn score_stays_within_bounds_for_all_inputs() {
        let ratings = [None, Some(0.0), Some(2.9), Some(3.0), Some(3.9), Some(4.0), Some(5.0)];
        let categories = [None, Some("plumber"), Some("law firm")];
        for has_website in [true, false] {
            for has_address in [true, false] {
                for rating in ratings {
                    for category in categories {
                        let score = opportunity_score(has_website, rating, category, has_address);
                        assert!((5..=100).contains(&score), "score {score} out of range");
                    }
                }
            }
        }
    }

    #[test]
    fn category_matching_is_case_and_separator_insensitive() {
        assert!(is_underserved_category(Some("HVAC_contractor")));
        assert!(is_underserved_category(Some("Auto_Repair")));
        assert!(!is_underserved_category(Some("accounting")));
        assert!(!is_underserved_category(None));
    }

    #[test]
    fn place_is_normalized_into_a_lead() {
        let lead = normalize_place(Place {
            id: "p1".to_string(),
            display_name: Some(LocalizedText {
                text: Some("Ace Plumbing".to_string()),
            }),
            formatted_address: Some("1 Main St".to_string()),
            website_uri: Some("  ".to_string()),
            rating: Some(3.2),
            primary_type: Some("plumber".to_string()),
            location: Some(LatLng {
                latitude: 1.0,
                longitude: 2.0,
            }),
            ..Place::default()
        });

        assert_eq!(lead.name, "Ace Plumbing");
        assert!(!lead.has_website);
        assert_eq!(lead.website, None);
        assert_eq!(lead.category.as_deref(), Some("plumber"));
        assert_eq!(lead.review_count, 0);
        assert_eq!(lead.latitude, Some(1.0));
        // 55 + 25 + 10 + 5
        assert_eq!(lead.opportunity_score, 95);
    }

    #[test]
    fn min_rating_filter_drops_low_and_unrated() {
        let base = normalize_place(Place {
            id: "p".to_string(),
            ..Place::default()
        });
        let leads = vec![
            Lead { rating: Some(4.5), place_id: "a".to_string(), ..base.clone() },
            Lead { rating: Some(3.0), place_id: "b".to_string(), ..base.clone() },
            Lead { rating: None, place_id: "c".to_string(), ..base.clone() },
        ];

        let kept = filter_min_rating(leads.clone(), Some(4.0));
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].place_id, "a");

        assert_eq!(filter_min_rating(leads, None).len(), 3);
    }
}
