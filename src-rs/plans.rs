use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::Config;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanId {
    Starter,
    Studio,
    AgencyWaitlist,
}

impl PlanId {
    pub fn as_str(self) -> &'static str {
        match self {
            PlanId::Starter => "starter",
            PlanId::Studio => "studio",
            PlanId::AgencyWaitlist => "agency_waitlist",
        }
    }

    /// Agency seats are handed out manually; checkout needs prior approval.
    pub fn requires_approval(self) -> bool {
        matches!(self, PlanId::AgencyWaitlist)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PlanLimits {
    pub leads_per_search: u32,
    pub sender_seats: i64,
    pub audit_pages: u32,
    pub ai_outreach: bool,
    pub csv_export: bool,
}

pub fn plan_limits(plan_id: PlanId) -> PlanLimits {
    match plan_id {
        PlanId::Starter => PlanLimits {
            leads_per_search: 20,
            sender_seats: 1,
            audit_pages: 1,
            ai_outreach: false,
            csv_export: false,
        },
        PlanId::Studio => PlanLimits {
            leads_per_search: 60,
            sender_seats: 3,
            audit_pages: 10,
            ai_outreach: true,
            csv_export: true,
        },
        PlanId::AgencyWaitlist => PlanLimits {
            leads_per_search: 100,
            sender_seats: 10,
            audit_pages: 25,
            ai_outreach: true,
            csv_export: true,
        },
    }
}

/// Parses a stored or requested plan name. Unknown names fall back to starter.
pub fn resolve_plan_id(plan: Option<&str>) -> PlanId {
    match plan
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
        .as_str()
    {
        "studio" => PlanId::Studio,
        "agency" | "agency_waitlist" => PlanId::AgencyWaitlist,
        _ => PlanId::Starter,
    }
}

/// Substring mapping used when a price id is not one of ours.
pub fn plan_from_metadata(value: Option<&str>) -> Option<PlanId> {
    let value = value?.trim().to_ascii_lowercase();
    if value.contains("studio") {
        Some(PlanId::Studio)
    } else if value.contains("agency") {
        Some(PlanId::AgencyWaitlist)
    } else if value.contains("starter") || value.contains("free") {
        Some(PlanId::Starter)
    } else {
        None
    }
}

/// Collapses processor subscription statuses into the stored plan status.
/// A missing status means the object carried none and is treated as active.
pub fn derive_plan_status(status: Option<&str>) -> String {
    match status.map(str::trim) {
        None | Some("") => "active".to_string(),
        Some("active") | Some("trialing") => "active".to_string(),
        Some(other) => other.to_string(),
    }
}

pub fn is_plan_active(status: Option<&str>) -> bool {
    matches!(
        status
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "active" | "trialing"
    )
}

/// Plan that currently applies to a stored profile. Anything not active runs
/// on starter limits.
pub fn effective_plan(plan: Option<&str>, status: Option<&str>) -> PlanId {
    if is_plan_active(status) {
        resolve_plan_id(plan)
    } else {
        PlanId::Starter
    }
}

#[derive(Clone, Debug)]
pub struct PriceMap {
    by_price_id: HashMap<String, PlanId>,
    by_plan: HashMap<PlanId, String>,
}

impl PriceMap {
    pub fn from_config(config: &Config) -> Self {
        let mut map = Self {
            by_price_id: HashMap::new(),
            by_plan: HashMap::new(),
        };
        map.insert(config.stripe_price_studio.clone(), PlanId::Studio);
        map.insert(config.stripe_price_agency.clone(), PlanId::AgencyWaitlist);
        map
    }

    pub fn get_plan_for_price_id(&self, price_id: Option<&str>) -> Option<PlanId> {
        let price_id = price_id?.trim();
        if price_id.is_empty() {
            return None;
        }
        self.by_price_id.get(price_id).copied()
    }

    pub fn price_for_plan(&self, plan_id: PlanId) -> Option<&str> {
        self.by_plan.get(&plan_id).map(String::as_str)
    }

    /// Price id first, then the metadata substring mapping.
    pub fn resolve_plan(&self, price_id: Option<&str>, metadata_plan: Option<&str>) -> Option<PlanId> {
        self.get_plan_for_price_id(price_id)
            .or_else(|| plan_from_metadata(metadata_plan))
    }

    fn insert(&mut self, price_id: Option<String>, plan_id: PlanId) {
        if let Some(price_id) = price_id.map(|v| v.trim().to_string()) {
            if !price_id.is_empty() {
                self.by_price_id.insert(price_id.clone(), plan_id);
                self.by_plan.insert(plan_id, price_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn price_map() -> PriceMap {
        PriceMap::from_config(&Config::test_default())
    }

    #[test]
    fn configured_prices_map_to_their_tier() {
        let map = price_map();
        assert_eq!(map.get_plan_for_price_id(Some("price_studio")), Some(PlanId::Studio));
        assert_eq!(
            map.get_plan_for_price_id(Some(" price_agency ")),
            Some(PlanId::AgencyWaitlist)
        );
        assert_eq!(map.price_for_plan(PlanId::Studio), Some("price_studio"));
        assert_eq!(map.price_for_plan(PlanId::Starter), None);
    }

    #[test]
    fn unknown_prices_have_no_mapping() {
        let map = price_map();
        assert_eq!(map.get_plan_for_price_id(Some("price_other")), None);
        assert_eq!(map.get_plan_for_price_id(Some("")), None);
        assert_eq!(map.get_plan_for_price_id(None), None);
    }

    #[test]
    fn metadata_mapping_engages_for_unknown_prices() {
        let map = price_map();
        assert_eq!(
            map.resolve_plan(Some("price_other"), Some("Studio Monthly")),
            Some(PlanId::Studio)
        );
        assert_eq!(
            map.resolve_plan(Some("price_other"), Some("agency")),
            Some(PlanId::AgencyWaitlist)
        );
        assert_eq!(map.resolve_plan(None, Some("starter")), Some(PlanId::Starter));
        assert_eq!(map.resolve_plan(None, Some("free-tier")), Some(PlanId::Starter));
        assert_eq!(map.resolve_plan(None, Some("enterprise")), None);
        assert_eq!(map.resolve_plan(None, None), None);
        // A configured price wins over contradictory metadata.
        assert_eq!(
            map.resolve_plan(Some("price_studio"), Some("agency")),
            Some(PlanId::Studio)
        );
    }

    #[test]
    fn processor_statuses_collapse_as_expected() {
        assert_eq!(derive_plan_status(Some("active")), "active");
        assert_eq!(derive_plan_status(Some("trialing")), "active");
        assert_eq!(derive_plan_status(Some("canceled")), "canceled");
        for status in ["incomplete", "incomplete_expired", "past_due", "unpaid", "paused"] {
            assert_eq!(derive_plan_status(Some(status)), status);
        }
        assert_eq!(derive_plan_status(None), "active");
    }

    #[test]
    fn inactive_profiles_run_on_starter_limits() {
        assert_eq!(effective_plan(Some("studio"), Some("active")), PlanId::Studio);
        assert_eq!(effective_plan(Some("studio"), Some("past_due")), PlanId::Starter);
        assert_eq!(effective_plan(None, None), PlanId::Starter);
        assert_eq!(plan_limits(PlanId::Starter).sender_seats, 1);
        assert!(plan_limits(PlanId::Studio).sender_seats > 1);
    }

    #[test]
    fn only_agency_requires_approval() {
        assert!(PlanId::AgencyWaitlist.requires_approval());
        assert!(!PlanId::Studio.requires_approval());
        assert_eq!(resolve_plan_id(Some("agency")), PlanId::AgencyWaitlist);
        assert_eq!(resolve_plan_id(Some("nonsense")), PlanId::Starter);
    }
}
