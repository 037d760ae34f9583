//! `TimedDrop`: a single time-gated reward within a campaign.
//!
//! Ported from `original_source/src/models/drop.py`'s `BaseDrop`/`TimedDrop`.
//! Precondition chains are resolved through the owning `DropsCampaign`'s drop
//! map rather than a back-pointer, matching the original's
//! `campaign.timed_drops[precondition_id]` lookup.

use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::MAX_EXTRA_MINUTES;
use crate::error::MinerError;

use super::benefit::Benefit;
use super::campaign::DropsCampaign;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedDrop {
    pub id: String,
    pub name: String,
    pub required_minutes: i32,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub benefits: Vec<Benefit>,
    /// Other drop ids that must be completed before this one can progress.
    #[serde(default)]
    pub precondition_drop_ids: Vec<String>,

    pub real_current_minutes: i32,
    #[serde(default)]
    pub extra_current_minutes: i32,
    #[serde(default)]
    pub(crate) is_claimed_flag: bool,
    /// Server-provided (`self.dropInstanceID`) or client-synthesised
    /// (`user_id#campaign_id#drop_id`) claim id. Server-provided always wins.
    pub claim_id: Option<String>,
}

impl TimedDrop {
    /// Parse one `timeBasedDrops[]` entry from a `CampaignDetails` response.
    /// `claimed_benefits` is the `Inventory` response's benefit-id ->
    /// last-awarded-at map, used as a claimed fallback when the `self` edge
    /// (which requires being logged in as the viewing account) is absent.
    /// Ported from `BaseDrop.__init__`/`TimedDrop.__init__`.
    pub fn from_gql(data: &Value, claimed_benefits: &HashMap<String, DateTime<Utc>>) -> Result<Self, MinerError> {
        let id = data
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| MinerError::Other(anyhow::anyhow!("drop missing id")))?
            .to_string();
        let name = data.get("name").and_then(Value::as_str).unwrap_or_default().to_string();
        let starts_at = parse_time(data, "startAt")?;
        let ends_at = parse_time(data, "endAt")?;

        let mut benefits: Vec<Benefit> = data
            .get("benefitEdges")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Benefit::from_gql_edge)
            .collect();

        let precondition_drop_ids: Vec<String> = data
            .get("preconditionDrops")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|d| d.get("id").and_then(Value::as_str).map(str::to_string))
            .collect();

        let (claim_id, mut is_claimed_flag) = match data.get("self") {
            Some(self_edge) => (
                self_edge.get("dropInstanceID").and_then(Value::as_str).map(str::to_string),
                self_edge.get("isClaimed").and_then(Value::as_bool).unwrap_or(false),
            ),
            None => (None, false),
        };
        if claim_id.is_none() && !is_claimed_flag {
            // No self edge: infer claimed status from whether every benefit
            // was last awarded while this drop's window was active.
            let timestamps: Vec<DateTime<Utc>> = benefits
                .iter()
                .filter_map(|b| claimed_benefits.get(&b.id).copied())
                .collect();
            if !timestamps.is_empty()
                && timestamps.len() == benefits.len()
                && timestamps.iter().all(|t| *t >= starts_at && *t < ends_at)
            {
                is_claimed_flag = true;
            }
            for b in &mut benefits {
                b.last_awarded_at = claimed_benefits.get(&b.id).copied();
            }
        }

        let required_minutes = data
            .get("requiredMinutesWatched")
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32;
        let mut real_current_minutes = data
            .get("self")
            .and_then(|s| s.get("currentMinutesWatched"))
            .and_then(Value::as_i64)
            .unwrap_or(0) as i32;
        if is_claimed_flag {
            // Claimed drops may report inconsistent current minutes.
            real_current_minutes = required_minutes;
        }

        Ok(Self {
            id,
            name,
            required_minutes,
            starts_at,
            ends_at,
            benefits,
            precondition_drop_ids,
            real_current_minutes,
            extra_current_minutes: 0,
            is_claimed_flag,
            claim_id,
        })
    }

    pub fn current_minutes(&self) -> i32 {
        self.real_current_minutes + self.extra_current_minutes
    }

    pub fn remaining_minutes(&self) -> f64 {
        (self.required_minutes - self.current_minutes()).max(0) as f64
    }

    pub fn progress(&self) -> f64 {
        if self.required_minutes <= 0 {
            return 1.0;
        }
        (self.current_minutes() as f64 / self.required_minutes as f64).clamp(0.0, 1.0)
    }

    /// Explicit flag OR every benefit's `last_awarded_at` falls within
    /// `[starts_at, ends_at)` — the claim can be detected even if the
    /// explicit per-drop flag was never populated.
    pub fn is_claimed(&self) -> bool {
        if self.is_claimed_flag {
            return true;
        }
        !self.benefits.is_empty()
            && self.benefits.iter().all(|b| {
                b.last_awarded_at
                    .is_some_and(|t| t >= self.starts_at && t < self.ends_at)
            })
    }

    /// Preconditions-met, time-window, and local-accounting checks that
    /// don't require knowing the channel being watched.
    pub fn base_can_earn(&self, campaign: &DropsCampaign) -> bool {
        let now = Utc::now();
        let preconditions_met = self.precondition_drop_ids.iter().all(|id| {
            campaign
                .timed_drops
                .get(id)
                .map(|d| d.is_claimed())
                .unwrap_or(true)
        });
        let participates = !self.benefits.is_empty()
            || campaign
                .timed_drops
                .values()
                .any(|d| d.precondition_drop_ids.iter().any(|p| p == &self.id));

        preconditions_met
            && participates
            && !self.is_claimed()
            && self.required_minutes > 0
            && self.extra_current_minutes < MAX_EXTRA_MINUTES
            && self.starts_at <= now
            && now < self.ends_at
    }

    /// Full `can_earn`: local eligibility plus the owning campaign's
    /// channel-level earnability.
    pub fn can_earn(&self, campaign: &DropsCampaign, channel: Option<&super::channel::Channel>) -> bool {
        self.base_can_earn(campaign) && campaign.can_earn(channel)
    }

    /// A drop may be claimed while unclaimed, a claim id is known, and the
    /// grace period after the campaign's end hasn't passed.
    pub fn can_claim(&self, campaign_ends_at: DateTime<Utc>) -> bool {
        self.claim_id.is_some()
            && !self.is_claimed()
            && Utc::now() < campaign_ends_at + ChronoDuration::hours(24)
    }

    /// Total required minutes including the longest precondition chain.
    pub fn total_required_minutes(&self, campaign: &DropsCampaign) -> i32 {
        let precondition_total = self
            .precondition_drop_ids
            .iter()
            .filter_map(|id| campaign.timed_drops.get(id))
            .map(|d| d.total_required_minutes(campaign))
            .max()
            .unwrap_or(0);
        self.required_minutes + precondition_total
    }

    /// Total remaining minutes, same recursive shape as
    /// `total_required_minutes`.
    pub fn total_remaining_minutes(&self, campaign: &DropsCampaign) -> f64 {
        let precondition_total = self
            .precondition_drop_ids
            .iter()
            .filter_map(|id| campaign.timed_drops.get(id))
            .map(|d| d.total_remaining_minutes(campaign))
            .fold(0.0_f64, f64::max);
        self.remaining_minutes() + precondition_total
    }

    /// Fraction of the campaign's remaining window needed to finish this
    /// drop, or `+inf` if it can't currently be earned or needs nothing.
    pub fn availability(&self, campaign: &DropsCampaign) -> f64 {
        let remaining = self.total_remaining_minutes(campaign);
        if !self.base_can_earn(campaign) || remaining <= 0.0 {
            return f64::INFINITY;
        }
        let minutes_left = (self.ends_at - Utc::now()).num_seconds() as f64 / 60.0;
        minutes_left / remaining
    }

    /// Synthesize a client-side claim id if the server hasn't reported one
    /// yet. Never overwrites an existing id (server-provided always wins;
    /// call `set_server_claim_id` for that case).
    pub fn generate_claim_id(&mut self, user_id: &str, campaign_id: &str) {
        if self.claim_id.is_none() {
            self.claim_id = Some(format!("{user_id}#{campaign_id}#{}", self.id));
        }
    }

    pub fn set_server_claim_id(&mut self, drop_instance_id: String) {
        self.claim_id = Some(drop_instance_id);
    }

    /// Apply the result of a successful `ClaimDropRewards` call.
    pub fn mark_claimed(&mut self) {
        self.real_current_minutes = self.required_minutes;
        self.extra_current_minutes = 0;
        self.is_claimed_flag = true;
    }

    /// Bump the local "extra" minute counter (watch-loop fallback when the
    /// server stops pushing progress). Returns `true` if this pushed the
    /// drop to the extra-minutes cap, signalling the caller should request a
    /// channel switch.
    pub fn bump_extra_minute(&mut self) -> bool {
        if self.extra_current_minutes < MAX_EXTRA_MINUTES {
            self.extra_current_minutes += 1;
        }
        self.extra_current_minutes >= MAX_EXTRA_MINUTES
    }
}

fn parse_time(data: &Value, field: &str) -> Result<DateTime<Utc>, MinerError> {
    data.get(field)
        .and_then(Value::as_str)
        .ok_or_else(|| MinerError::Other(anyhow::anyhow!("missing field {field}")))
        .and_then(|s| {
            DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| MinerError::Other(anyhow::anyhow!("bad timestamp {field}: {e}")))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::benefit::BenefitType;

    fn benefit() -> Benefit {
        Benefit {
            id: "b1".into(),
            name: "Thing".into(),
            image_url: None,
            benefit_type: BenefitType::DirectEntitlement,
            last_awarded_at: None,
        }
    }

    fn drop(id: &str, required: i32) -> TimedDrop {
        TimedDrop {
            id: id.into(),
            name: id.into(),
            required_minutes: required,
            starts_at: Utc::now() - ChronoDuration::hours(1),
            ends_at: Utc::now() + ChronoDuration::hours(1),
            benefits: vec![benefit()],
            precondition_drop_ids: vec![],
            real_current_minutes: 0,
            extra_current_minutes: 0,
            is_claimed_flag: false,
            claim_id: None,
        }
    }

    fn campaign_with(drops: Vec<TimedDrop>) -> DropsCampaign {
        let mut map = HashMap::new();
        for d in drops {
            map.insert(d.id.clone(), d);
        }
        DropsCampaign::for_tests(map)
    }

    #[test]
    fn progress_clamped_and_zero_required_is_complete() {
        let mut d = drop("d1", 0);
        assert_eq!(d.progress(), 1.0);
        d.required_minutes = 60;
        d.real_current_minutes = 30;
        assert!((d.progress() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn total_required_minutes_chains_through_precondition() {
        let mut second = drop("second", 30);
        second.precondition_drop_ids = vec!["first".into()];
        let campaign = campaign_with(vec![drop("first", 60), second]);
        let second = campaign.timed_drops.get("second").unwrap();
        assert_eq!(second.total_required_minutes(&campaign), 90);
    }

    #[test]
    fn can_claim_respects_grace_period() {
        let mut d = drop("d1", 60);
        d.claim_id = Some("claim-1".into());
        let ends_at = Utc::now() - ChronoDuration::hours(23);
        assert!(d.can_claim(ends_at));
        let long_expired = Utc::now() - ChronoDuration::hours(25);
        assert!(!d.can_claim(long_expired));
    }

    #[test]
    fn bump_extra_minute_signals_at_cap() {
        let mut d = drop("d1", 60);
        d.extra_current_minutes = MAX_EXTRA_MINUTES - 1;
        assert!(d.bump_extra_minute());
        assert_eq!(d.extra_current_minutes, MAX_EXTRA_MINUTES);
    }

    #[test]
    fn is_claimed_detects_via_last_awarded_fallback() {
        let mut d = drop("d1", 60);
        let mut b = benefit();
        b.last_awarded_at = Some(Utc::now());
        d.benefits = vec![b];
        assert!(d.is_claimed());
    }

    #[test]
    fn from_gql_parses_self_edge_and_preconditions() {
        let data = serde_json::json!({
            "id": "drop-1",
            "name": "Cool Drop",
            "startAt": "2026-01-01T00:00:00Z",
            "endAt": "2026-01-02T00:00:00Z",
            "requiredMinutesWatched": 120,
            "benefitEdges": [{"benefit": {"id": "b1", "name": "Reward", "distributionType": "BADGE", "imageAssetURL": "http://x/y.png"}}],
            "preconditionDrops": [{"id": "drop-0"}],
            "self": {"dropInstanceID": "inst-1", "isClaimed": false, "currentMinutesWatched": 30},
        });
        let d = TimedDrop::from_gql(&data, &HashMap::new()).unwrap();
        assert_eq!(d.id, "drop-1");
        assert_eq!(d.required_minutes, 120);
        assert_eq!(d.real_current_minutes, 30);
        assert_eq!(d.precondition_drop_ids, vec!["drop-0".to_string()]);
        assert_eq!(d.claim_id.as_deref(), Some("inst-1"));
        assert!(!d.is_claimed());
    }

    #[test]
    fn from_gql_falls_back_to_claimed_benefits_without_self_edge() {
        let data = serde_json::json!({
            "id": "drop-1",
            "name": "Cool Drop",
            "startAt": "2026-01-01T00:00:00Z",
            "endAt": "2026-01-02T00:00:00Z",
            "requiredMinutesWatched": 120,
            "benefitEdges": [{"benefit": {"id": "b1", "name": "Reward", "distributionType": "BADGE"}}],
            "preconditionDrops": [],
        });
        let mut claimed = HashMap::new();
        claimed.insert("b1".to_string(), Utc::now());
        let d = TimedDrop::from_gql(&data, &claimed).unwrap();
        assert!(d.is_claimed());
        assert_eq!(d.real_current_minutes, 120);
    }
}
