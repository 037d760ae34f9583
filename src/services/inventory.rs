//! Inventory fetch/merge: turns the `Inventory` + `Campaigns` + batched
//! `CampaignDetails` GQL responses into a sorted list of [`DropsCampaign`]s.
//!
//! Ported from `original_source/src/services/inventory_service.py`'s
//! `InventoryService`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::constants::{gql_operations, CAMPAIGN_DETAILS_BATCH};
use crate::error::MinerError;
use crate::gql::{self, GqlClient};
use crate::models::channel::Channel;
use crate::models::{CampaignStatus, DropsCampaign};

pub struct InventoryService {
    gql: GqlClient,
}

impl InventoryService {
    pub fn new(gql: GqlClient) -> Self {
        Self { gql }
    }

    /// Batch-fetch `CampaignDetails` for `campaign_ids`, `CAMPAIGN_DETAILS_BATCH`
    /// at a time, keyed by each campaign's own id. Ported from
    /// `InventoryService.fetch_campaigns`.
    async fn fetch_campaign_details(
        &self,
        user_id: u64,
        campaign_ids: &[String],
    ) -> Result<HashMap<String, Value>, MinerError> {
        let mut out = HashMap::new();
        for chunk in campaign_ids.chunks(CAMPAIGN_DETAILS_BATCH) {
            let ops = gql::campaign_details_batch(user_id, chunk.iter().map(String::as_str));
            let responses = self.gql.query_batch(ops).await?;
            for data in responses {
                let Some(campaign) = data.get("user").and_then(|u| u.get("dropCampaign")) else {
                    continue;
                };
                if campaign.is_null() {
                    continue;
                }
                if let Some(id) = campaign.get("id").and_then(Value::as_str) {
                    out.insert(id.to_string(), campaign.clone());
                }
            }
        }
        Ok(out)
    }

    /// Fetch and assemble the full drop inventory: in-progress campaigns plus
    /// every active/upcoming campaign with its details merged in, sorted
    /// eligible-first. Ported from `InventoryService.fetch_inventory`.
    pub async fn fetch_inventory(&self, user_id: u64) -> Result<Vec<DropsCampaign>, MinerError> {
        let inventory_data = self.gql.query(&gql_operations::INVENTORY, Some(gql::inventory_variables())).await?;
        let inventory = inventory_data
            .get("currentUser")
            .and_then(|u| u.get("inventory"))
            .cloned()
            .unwrap_or(Value::Null);

        let claimed_benefits: HashMap<String, DateTime<Utc>> = inventory
            .get("gameEventDrops")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|b| {
                let id = b.get("id")?.as_str()?.to_string();
                let awarded = b.get("lastAwardedAt")?.as_str()?;
                let dt = DateTime::parse_from_rfc3339(awarded).ok()?.with_timezone(&Utc);
                Some((id, dt))
            })
            .collect();

        let mut merged: HashMap<String, Value> = HashMap::new();
        for campaign in inventory
            .get("dropCampaignsInProgress")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            if let Some(id) = campaign.get("id").and_then(Value::as_str) {
                merged.insert(id.to_string(), campaign.clone());
            }
        }

        let campaigns_data = self.gql.query(&gql_operations::CAMPAIGNS, Some(gql::campaigns_variables())).await?;
        let listed: Vec<&Value> = campaigns_data
            .get("currentUser")
            .and_then(|u| u.get("dropCampaigns"))
            .and_then(Value::as_array)
            .map(|arr| arr.iter().collect())
            .unwrap_or_default();

        let available_ids: Vec<String> = listed
            .iter()
            .filter(|c| matches!(c.get("status").and_then(Value::as_str), Some("ACTIVE") | Some("UPCOMING")))
            .filter_map(|c| c.get("id").and_then(Value::as_str).map(str::to_string))
            .collect();
        for c in &listed {
            if let Some(id) = c.get("id").and_then(Value::as_str) {
                merged.entry(id.to_string()).or_insert_with(|| (*c).clone());
            }
        }

        let details = self.fetch_campaign_details(user_id, &available_ids).await?;
        for (id, detail) in details {
            let combined = match merged.get(&id) {
                Some(existing) => gql::merge_data(&detail, existing)?,
                None => detail,
            };
            merged.insert(id, combined);
        }

        let mut campaigns = Vec::new();
        for data in merged.into_values() {
            if data.get("game").is_none_or_null() {
                continue;
            }
            match DropsCampaign::from_gql(&data, &claimed_benefits) {
                Ok(c) => campaigns.push(c),
                Err(e) => tracing::warn!("skipping unparsable campaign: {}", e),
            }
        }

        // eligible desc (final/most significant), then upcoming?starts_at:ends_at
        // asc, then active desc -- matches the effective order of the three
        // chained stable sorts in the campaigns listing this was ported from.
        campaigns.sort_by(|a, b| {
            b.eligible()
                .cmp(&a.eligible())
                .then_with(|| time_key(a).cmp(&time_key(b)))
                .then_with(|| b.active().cmp(&a.active()))
        });

        Ok(campaigns)
    }

    /// Cheapest-to-finish campaign this channel can currently earn against.
    /// Ported from `InventoryService.get_active_campaign`.
    pub fn get_active_campaign<'a>(
        campaigns: &'a [DropsCampaign],
        channel: Option<&Channel>,
    ) -> Option<&'a DropsCampaign> {
        campaigns
            .iter()
            .filter(|c| c.can_earn(channel))
            .min_by(|a, b| a.remaining_minutes().partial_cmp(&b.remaining_minutes()).unwrap())
    }
}

fn time_key(c: &DropsCampaign) -> DateTime<Utc> {
    if c.status == CampaignStatus::Upcoming {
        c.starts_at
    } else {
        c.ends_at
    }
}

trait IsNoneOrNull {
    fn is_none_or_null(&self) -> bool;
}

impl IsNoneOrNull for Option<&Value> {
    fn is_none_or_null(&self) -> bool {
        match self {
            None => true,
            Some(v) => v.is_null(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn campaign(id: &str, eligible_linked: bool, status: CampaignStatus) -> DropsCampaign {
        let mut c = DropsCampaign::for_tests(Map::new());
        c.id = id.to_string();
        c.linked = eligible_linked;
        c.status = status;
        c
    }

    #[test]
    fn time_key_uses_starts_at_for_upcoming() {
        let mut c = campaign("a", true, CampaignStatus::Upcoming);
        c.starts_at = Utc::now() + chrono::Duration::hours(5);
        assert_eq!(time_key(&c), c.starts_at);
    }

    #[test]
    fn time_key_uses_ends_at_otherwise() {
        let c = campaign("a", true, CampaignStatus::Active);
        assert_eq!(time_key(&c), c.ends_at);
    }
}
