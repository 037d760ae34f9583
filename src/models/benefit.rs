//! Drop reward ("benefit") types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Category of reward a drop hands out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BenefitType {
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[serde(rename = "BADGE")]
    Badge,
    #[serde(rename = "EMOTE")]
    Emote,
    #[serde(rename = "DIRECT_ENTITLEMENT")]
    DirectEntitlement,
}

impl BenefitType {
    pub fn is_badge_or_emote(self) -> bool {
        matches!(self, BenefitType::Badge | BenefitType::Emote)
    }

    pub fn from_distribution_type(s: &str) -> Self {
        match s {
            "BADGE" => BenefitType::Badge,
            "EMOTE" => BenefitType::Emote,
            "DIRECT_ENTITLEMENT" => BenefitType::DirectEntitlement,
            _ => BenefitType::Unknown,
        }
    }
}

/// A single reward attached to a `TimedDrop`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Benefit {
    pub id: String,
    pub name: String,
    #[serde(rename = "imageAssetURL", default)]
    pub image_url: Option<String>,
    #[serde(skip, default = "default_benefit_type")]
    pub benefit_type: BenefitType,
    /// Filled in from the `Inventory` GQL response's `claimed_benefits` map
    /// (benefit id -> last-awarded timestamp); used by `TimedDrop::is_claimed`
    /// as a fallback when the explicit claimed flag wasn't set.
    #[serde(skip)]
    pub last_awarded_at: Option<DateTime<Utc>>,
}

fn default_benefit_type() -> BenefitType {
    BenefitType::Unknown
}

impl Benefit {
    pub fn new(id: String, name: String, image_url: Option<String>, distribution_type: &str) -> Self {
        Self {
            id,
            name,
            image_url,
            benefit_type: BenefitType::from_distribution_type(distribution_type),
            last_awarded_at: None,
        }
    }

    /// Parse one `benefitEdges[]` entry from a `CampaignDetails`/`Inventory`
    /// GQL response: `{"benefit": {"id", "name", "distributionType", "imageAssetURL"}}`.
    pub fn from_gql_edge(edge: &serde_json::Value) -> Option<Self> {
        let data = edge.get("benefit")?;
        let id = data.get("id")?.as_str()?.to_string();
        let name = data.get("name")?.as_str()?.to_string();
        let distribution_type = data.get("distributionType").and_then(|v| v.as_str()).unwrap_or("");
        let image_url = data.get("imageAssetURL").and_then(|v| v.as_str()).map(str::to_string);
        Some(Self::new(id, name, image_url, distribution_type))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn badge_and_emote_are_badge_or_emote() {
        assert!(BenefitType::Badge.is_badge_or_emote());
        assert!(BenefitType::Emote.is_badge_or_emote());
        assert!(!BenefitType::DirectEntitlement.is_badge_or_emote());
        assert!(!BenefitType::Unknown.is_badge_or_emote());
    }

    #[test]
    fn unknown_distribution_type_falls_back() {
        assert_eq!(BenefitType::from_distribution_type("SOMETHING_NEW"), BenefitType::Unknown);
    }
}
