//! Plan catalog and feature entitlements
//!
//! Prices are in minor currency units (cents). Enterprise is quoted per
//! customer and has no list price.

use serde::Serialize;

use bizpilot_shared::{SubscriptionStatus, SubscriptionTier};

/// Plan used when checkout metadata does not name one
pub const DEFAULT_PLAN_ID: &str = "starter";
pub const DEFAULT_PLAN_NAME: &str = "Starter";

/// Granting every feature, held by enterprise plans only
pub const ALL_FEATURES: &str = "all_features";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Starter,
    Professional,
    Enterprise,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlanPricing {
    pub monthly_cents: i64,
    pub yearly_cents: i64,
}

impl Plan {
    pub const ALL: [Plan; 3] = [Plan::Starter, Plan::Professional, Plan::Enterprise];

    pub fn from_id(plan_id: &str) -> Option<Plan> {
        match plan_id.parse::<SubscriptionTier>().ok()? {
            SubscriptionTier::Starter => Some(Plan::Starter),
            SubscriptionTier::Professional => Some(Plan::Professional),
            SubscriptionTier::Enterprise => Some(Plan::Enterprise),
            SubscriptionTier::Free => None,
        }
    }

    pub fn id(&self) -> &'static str {
        self.tier().as_str()
    }

    pub fn tier(&self) -> SubscriptionTier {
        match self {
            Plan::Starter => SubscriptionTier::Starter,
            Plan::Professional => SubscriptionTier::Professional,
            Plan::Enterprise => SubscriptionTier::Enterprise,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Plan::Starter => "Starter",
            Plan::Professional => "Professional",
            Plan::Enterprise => "Enterprise",
        }
    }

    /// List price, `None` for custom-priced plans
    pub fn pricing(&self) -> Option<PlanPricing> {
        match self {
            Plan::Starter => Some(PlanPricing {
                monthly_cents: 29_900,
                yearly_cents: 299_000,
            }),
            Plan::Professional => Some(PlanPricing {
                monthly_cents: 79_900,
                yearly_cents: 799_000,
            }),
            Plan::Enterprise => None,
        }
    }

    pub fn features(&self) -> &'static [&'static str] {
        match self {
            Plan::Starter => &[
                "voice_ai_basic",
                "recruitment_basic",
                "email_support",
                "basic_analytics",
            ],
            Plan::Professional => &[
                "voice_ai_basic",
                "voice_ai_advanced",
                "recruitment_basic",
                "recruitment_advanced",
                "financial_automation",
                "content_marketing",
                "email_support",
                "priority_support",
                "basic_analytics",
                "advanced_analytics",
                "custom_integrations",
            ],
            Plan::Enterprise => &[ALL_FEATURES],
        }
    }
}

/// Name stored in `subscriptions.plan_name` for a plan id
pub fn plan_display_name(plan_id: &str) -> &'static str {
    Plan::from_id(plan_id)
        .map(|p| p.display_name())
        .unwrap_or(DEFAULT_PLAN_NAME)
}

/// Whether a subscription on `plan_id` in `status` may use `feature`
pub fn has_feature_access(plan_id: &str, status: SubscriptionStatus, feature: &str) -> bool {
    if !status.grants_access() {
        return false;
    }

    let Some(plan) = Plan::from_id(plan_id) else {
        return false;
    };

    let features = plan.features();
    features.contains(&ALL_FEATURES) || features.contains(&feature)
}

/// Render minor units as a whole-unit price, e.g. `29900, "usd"` -> `$299`
pub fn format_minor_units(amount: i64, currency: &str) -> String {
    let symbol = match currency.to_ascii_lowercase().as_str() {
        "usd" => "$",
        "eur" => "€",
        "gbp" => "£",
        _ => "",
    };

    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    let whole = abs / 100;
    let cents = abs % 100;

    let amount_str = if cents == 0 {
        group_thousands(whole)
    } else {
        format!("{}.{:02}", group_thousands(whole), cents)
    };

    if symbol.is_empty() {
        format!("{}{} {}", sign, amount_str, currency.to_ascii_uppercase())
    } else {
        format!("{}{}{}", sign, symbol, amount_str)
    }
}

fn group_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_lookup() {
        assert_eq!(Plan::from_id("starter"), Some(Plan::Starter));
        assert_eq!(Plan::from_id("Professional"), Some(Plan::Professional));
        assert_eq!(Plan::from_id("free"), None);
        assert_eq!(Plan::from_id("platinum"), None);
    }

    #[test]
    fn test_display_name_defaults_to_starter() {
        assert_eq!(plan_display_name("professional"), "Professional");
        assert_eq!(plan_display_name("mystery"), DEFAULT_PLAN_NAME);
    }

    #[test]
    fn test_enterprise_has_no_list_price() {
        assert!(Plan::Enterprise.pricing().is_none());
        assert_eq!(Plan::Starter.pricing().unwrap().monthly_cents, 29_900);
        assert_eq!(Plan::Professional.pricing().unwrap().yearly_cents, 799_000);
    }

    #[test]
    fn test_feature_access_requires_active_status() {
        assert!(has_feature_access(
            "professional",
            SubscriptionStatus::Active,
            "custom_integrations"
        ));
        assert!(!has_feature_access(
            "professional",
            SubscriptionStatus::PastDue,
            "custom_integrations"
        ));
    }

    #[test]
    fn test_starter_lacks_advanced_features() {
        assert!(has_feature_access("starter", SubscriptionStatus::Active, "email_support"));
        assert!(!has_feature_access(
            "starter",
            SubscriptionStatus::Active,
            "advanced_analytics"
        ));
    }

    #[test]
    fn test_enterprise_grants_everything() {
        assert!(has_feature_access(
            "enterprise",
            SubscriptionStatus::Active,
            "anything_at_all"
        ));
    }

    #[test]
    fn test_unknown_plan_grants_nothing() {
        assert!(!has_feature_access("gold", SubscriptionStatus::Active, "email_support"));
    }

    #[test]
    fn test_format_minor_units() {
        assert_eq!(format_minor_units(29_900, "usd"), "$299");
        assert_eq!(format_minor_units(299_000, "USD"), "$2,990");
        assert_eq!(format_minor_units(1_050, "eur"), "€10.50");
        assert_eq!(format_minor_units(-500, "usd"), "-$5");
        assert_eq!(format_minor_units(123_456_789, "jpy"), "1,234,567.89 JPY");
    }
}
