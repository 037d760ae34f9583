//! `DropsCampaign`: a collection of timed drops for one game during one
//! time window, optionally restricted to an ACL of channels.
//!
//! Ported from `original_source/src/models/campaign.py`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::MinerError;

use super::channel::Channel;
use super::drop::TimedDrop;
use super::game::Game;

/// Twitch's campaign lifecycle status, as reported by the GQL API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CampaignStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "UPCOMING")]
    Upcoming,
    #[serde(rename = "EXPIRED")]
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropsCampaign {
    pub id: String,
    pub name: String,
    pub game: Game,
    pub linked: bool,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: CampaignStatus,
    /// `None` means no ACL restriction (any live channel on the game
    /// counts); `Some(channels)` restricts earnability to those channels.
    pub acl: Option<Vec<Channel>>,
    pub timed_drops: HashMap<String, TimedDrop>,
}

impl DropsCampaign {
    /// Parse a `dropCampaign` object as returned by `CampaignDetails` (merged
    /// with the lighter `Campaigns`/`Inventory` listing via `gql::merge_data`).
    /// Ported from `DropsCampaign.__init__`.
    pub fn from_gql(data: &Value, claimed_benefits: &HashMap<String, DateTime<Utc>>) -> Result<Self, MinerError> {
        let id = field_str(data, "id")?;
        let name = field_str(data, "name")?;
        let game = data
            .get("game")
            .and_then(Game::from_gql)
            .ok_or_else(|| MinerError::Other(anyhow::anyhow!("campaign {id} missing game")))?;
        let linked = data
            .get("self")
            .and_then(|s| s.get("isAccountConnected"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let starts_at = parse_time(data, "startAt")?;
        let ends_at = parse_time(data, "endAt")?;
        let status = match data.get("status").and_then(Value::as_str).unwrap_or("") {
            "ACTIVE" => CampaignStatus::Active,
            "UPCOMING" => CampaignStatus::Upcoming,
            _ => CampaignStatus::Expired,
        };

        let acl = data.get("allow").and_then(|allow| {
            let channels = allow.get("channels").and_then(Value::as_array)?;
            let enabled = allow.get("isEnabled").and_then(Value::as_bool).unwrap_or(true);
            if channels.is_empty() || !enabled {
                return None;
            }
            let parsed: Vec<Channel> = channels
                .iter()
                .filter_map(|c| {
                    let id = c.get("id").and_then(Value::as_str)?.parse::<u64>().ok()?;
                    let login = c.get("name").and_then(Value::as_str)?.to_string();
                    Some(Channel::from_acl(id, login))
                })
                .collect();
            Some(parsed)
        });

        let mut timed_drops = HashMap::new();
        for drop_data in data.get("timeBasedDrops").and_then(Value::as_array).into_iter().flatten() {
            let drop = TimedDrop::from_gql(drop_data, claimed_benefits)?;
            timed_drops.insert(drop.id.clone(), drop);
        }

        Ok(Self { id, name, game, linked, starts_at, ends_at, status, acl, timed_drops })
    }

    pub fn valid(&self) -> bool {
        self.status != CampaignStatus::Expired
    }

    pub fn active(&self) -> bool {
        let now = Utc::now();
        self.valid() && self.starts_at <= now && now < self.ends_at
    }

    pub fn upcoming(&self) -> bool {
        self.valid() && Utc::now() < self.starts_at
    }

    pub fn expired(&self) -> bool {
        self.status == CampaignStatus::Expired || Utc::now() >= self.ends_at
    }

    /// Eligible to earn at all: the account is linked to the game, or at
    /// least one drop hands out a badge/emote (those don't require linking).
    pub fn eligible(&self) -> bool {
        self.linked
            || self
                .timed_drops
                .values()
                .any(|d| d.benefits.iter().any(|b| b.benefit_type.is_badge_or_emote()))
    }

    pub fn finished(&self) -> bool {
        self.timed_drops
            .values()
            .all(|d| d.is_claimed() || d.required_minutes <= 0)
    }

    pub fn claimed_drops(&self) -> usize {
        self.timed_drops.values().filter(|d| d.is_claimed()).count()
    }

    pub fn remaining_drops(&self) -> usize {
        self.timed_drops.len() - self.claimed_drops()
    }

    pub fn required_minutes(&self) -> i32 {
        self.timed_drops
            .values()
            .map(|d| d.total_required_minutes(self))
            .max()
            .unwrap_or(0)
    }

    pub fn remaining_minutes(&self) -> f64 {
        self.timed_drops
            .values()
            .map(|d| d.total_remaining_minutes(self))
            .fold(0.0_f64, f64::max)
    }

    /// The drop whose total remaining time is lowest among those that can
    /// currently be earned; the natural "what am I mining right now" pick.
    pub fn first_drop(&self) -> Option<&TimedDrop> {
        self.timed_drops
            .values()
            .filter(|d| d.base_can_earn(self))
            .min_by(|a, b| {
                a.total_remaining_minutes(self)
                    .partial_cmp(&b.total_remaining_minutes(self))
                    .unwrap()
            })
    }

    /// Union of precondition drop ids referenced by any unclaimed drop.
    pub fn preconditions_chain(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self
            .timed_drops
            .values()
            .filter(|d| !d.is_claimed())
            .flat_map(|d| d.precondition_drop_ids.iter().map(|s| s.as_str()))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// `{starts_at, ends_at}` plus every drop's own bounds; feeds the
    /// maintenance task's trigger deque.
    pub fn time_triggers(&self) -> Vec<DateTime<Utc>> {
        let mut triggers = vec![self.starts_at, self.ends_at];
        for d in self.timed_drops.values() {
            triggers.push(d.starts_at);
            triggers.push(d.ends_at);
        }
        triggers
    }

    /// Whether this campaign is earnable against a specific channel (or, if
    /// `None`, against no channel at all — used for local-only checks).
    pub fn can_earn(&self, channel: Option<&Channel>) -> bool {
        let acl_ok = match (&self.acl, channel) {
            (None, _) => true,
            (Some(acl), Some(c)) => acl.iter().any(|ch| ch.id == c.id),
            (Some(_), None) => false,
        };
        let channel_live_on_game = channel.is_some_and(|c| c.online && c.game.as_ref() == Some(&self.game));

        self.eligible()
            && self.active()
            && acl_ok
            && channel_live_on_game
            && self.timed_drops.values().any(|d| d.base_can_earn(self))
    }

    /// Forward-looking variant: will this campaign still have something
    /// earnable at some point before `t`, ignoring which channel is live.
    /// Used to decide which games are worth discovering channels for.
    pub fn can_earn_within(&self, t: DateTime<Utc>) -> bool {
        self.valid()
            && self.starts_at < t
            && self.ends_at > Utc::now()
            && self.timed_drops.values().any(|d| d.base_can_earn(self))
    }

    /// Compute the named drop's own delta from its prior `real_current_minutes`
    /// (clamped so the drop itself stays within `[0, required_minutes]`), then
    /// apply that same delta to every drop in the campaign that can still earn
    /// it -- watching a channel advances every concurrently-earnable drop by
    /// the same amount, not just the one that happened to report progress.
    /// Ported from `TimedDrop.update_minutes` (delta computation) and
    /// `DropsCampaign._update_real_minutes`/`TimedDrop._update_real_minutes`
    /// (broadcast, each gated by its own `can_earn`).
    pub fn update_real_minutes(&mut self, drop_id: &str, new_real_minutes: i32, channel: Option<&Channel>) {
        let delta = {
            let Some(drop) = self.timed_drops.get(drop_id) else { return };
            let mut delta = new_real_minutes - drop.real_current_minutes;
            if delta == 0 {
                return;
            }
            if drop.real_current_minutes + delta < 0 {
                delta = -drop.real_current_minutes;
            } else if drop.real_current_minutes + delta > drop.required_minutes {
                delta = drop.required_minutes - drop.real_current_minutes;
            }
            delta
        };
        if delta == 0 {
            return;
        }

        let earnable_ids: Vec<String> = self
            .timed_drops
            .values()
            .filter(|d| d.can_earn(self, channel))
            .map(|d| d.id.clone())
            .collect();

        for id in earnable_ids {
            if let Some(drop) = self.timed_drops.get_mut(&id) {
                let updated = drop.real_current_minutes + delta;
                if updated < 0 {
                    continue;
                }
                drop.real_current_minutes = updated.min(drop.required_minutes);
                drop.extra_current_minutes = 0;
            }
        }
    }

    /// Add one "extra" minute to every currently-earnable drop (watch-loop
    /// fallback when the server stops reporting progress). Returns `true`
    /// if any drop hit `MAX_EXTRA_MINUTES`, signalling the caller to request
    /// a channel switch.
    pub fn bump_minutes(&mut self, channel: Option<&Channel>) -> bool {
        if !self.can_earn(channel) {
            return false;
        }
        let earnable_ids: Vec<String> = self
            .timed_drops
            .values()
            .filter(|d| d.base_can_earn(self))
            .map(|d| d.id.clone())
            .collect();
        let mut hit_max = false;
        for id in earnable_ids {
            if let Some(drop) = self.timed_drops.get_mut(&id) {
                if drop.bump_extra_minute() {
                    hit_max = true;
                }
            }
        }
        hit_max
    }

    #[cfg(test)]
    pub(crate) fn for_tests(timed_drops: HashMap<String, TimedDrop>) -> Self {
        Self {
            id: "campaign-test".into(),
            name: "Test Campaign".into(),
            game: Game {
                id: "game-1".into(),
                name: "Test Game".into(),
                box_art_url: None,
            },
            linked: true,
            starts_at: Utc::now() - chrono::Duration::hours(1),
            ends_at: Utc::now() + chrono::Duration::hours(1),
            status: CampaignStatus::Active,
            acl: None,
            timed_drops,
        }
    }
}

fn field_str(data: &Value, field: &str) -> Result<String, MinerError> {
    data.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| MinerError::Other(anyhow::anyhow!("missing field {field}")))
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
    use crate::models::benefit::{Benefit, BenefitType};
    use chrono::Duration;

    fn drop(id: &str, required: i32) -> TimedDrop {
        TimedDrop {
            id: id.into(),
            name: id.into(),
            required_minutes: required,
            starts_at: Utc::now() - Duration::hours(1),
            ends_at: Utc::now() + Duration::hours(1),
            benefits: vec![Benefit {
                id: format!("{id}-benefit"),
                name: "Reward".into(),
                image_url: None,
                benefit_type: BenefitType::DirectEntitlement,
                last_awarded_at: None,
            }],
            precondition_drop_ids: vec![],
            real_current_minutes: 0,
            extra_current_minutes: 0,
            is_claimed_flag: false,
            claim_id: None,
        }
    }

    #[test]
    fn eligible_without_linking_if_badge_or_emote() {
        let mut drops = HashMap::new();
        let mut d = drop("d1", 60);
        d.benefits[0].benefit_type = BenefitType::Badge;
        drops.insert(d.id.clone(), d);
        let mut campaign = DropsCampaign::for_tests(drops);
        campaign.linked = false;
        assert!(campaign.eligible());
    }

    #[test]
    fn required_minutes_is_max_across_drops() {
        let mut drops = HashMap::new();
        drops.insert("a".to_string(), drop("a", 30));
        drops.insert("b".to_string(), drop("b", 90));
        let campaign = DropsCampaign::for_tests(drops);
        assert_eq!(campaign.required_minutes(), 90);
    }

    fn live_channel(campaign: &DropsCampaign) -> Channel {
        Channel::from_directory(1, "x".into(), None, Some(campaign.game.clone()), None, true)
    }

    #[test]
    fn update_real_minutes_applies_the_named_drops_own_delta() {
        // "second" already has 60 of its own 90 required minutes; a progress
        // report of 90 is a delta of +30 from second's own prior value, not
        // an absolute "set to 90" -- so second lands at 90 (its own cap),
        // never above it even though the reported value matches it exactly.
        let mut drops = HashMap::new();
        let mut second = drop("second", 90);
        second.real_current_minutes = 60;
        drops.insert("first".to_string(), drop("first", 60));
        drops.insert("second".to_string(), second);
        let mut campaign = DropsCampaign::for_tests(drops);
        let channel = live_channel(&campaign);
        campaign.update_real_minutes("second", 90, Some(&channel));
        assert_eq!(campaign.timed_drops["second"].real_current_minutes, 90);
    }

    #[test]
    fn update_real_minutes_broadcasts_the_delta_not_the_raw_value() {
        // Two unrelated, independently-earnable drops. A progress-report
        // delta of +5 on "a" must bump "b" by the same +5 too (shared
        // watch-minute counter), never jump "b" straight to "complete" just
        // because the *reported* absolute value happens to exceed b's
        // requirement.
        let mut a = drop("a", 30);
        a.real_current_minutes = 20;
        let b = drop("b", 10);
        let mut drops = HashMap::new();
        drops.insert("a".to_string(), a);
        drops.insert("b".to_string(), b);
        let mut campaign = DropsCampaign::for_tests(drops);
        let channel = live_channel(&campaign);
        campaign.update_real_minutes("a", 25, Some(&channel));
        assert_eq!(campaign.timed_drops["a"].real_current_minutes, 25);
        assert_eq!(campaign.timed_drops["b"].real_current_minutes, 5);
        assert!(!campaign.timed_drops["b"].is_claimed());
    }

    #[test]
    fn update_real_minutes_does_not_touch_drops_that_cannot_earn() {
        let mut a = drop("a", 30);
        a.real_current_minutes = 0;
        let mut b = drop("b", 10);
        b.is_claimed_flag = true;
        b.real_current_minutes = 10;
        let mut drops = HashMap::new();
        drops.insert("a".to_string(), a);
        drops.insert("b".to_string(), b);
        let mut campaign = DropsCampaign::for_tests(drops);
        let channel = live_channel(&campaign);
        campaign.update_real_minutes("a", 15, Some(&channel));
        assert_eq!(campaign.timed_drops["a"].real_current_minutes, 15);
        // already-claimed "b" is not earnable, so it's left untouched.
        assert_eq!(campaign.timed_drops["b"].real_current_minutes, 10);
    }

    #[test]
    fn can_earn_requires_channel_live_on_same_game() {
        let mut drops = HashMap::new();
        drops.insert("a".to_string(), drop("a", 30));
        let campaign = DropsCampaign::for_tests(drops);
        let channel = Channel::from_directory(1, "x".into(), None, Some(campaign.game.clone()), None, true);
        assert!(campaign.can_earn(Some(&channel)));

        let mut offline = channel.clone();
        offline.online = false;
        assert!(!campaign.can_earn(Some(&offline)));
    }

    #[test]
    fn from_gql_parses_acl_and_drops() {
        let data = serde_json::json!({
            "id": "camp-1",
            "name": "Campaign One",
            "game": {"id": "123", "displayName": "A Game", "boxArtURL": "http://x/y.jpg"},
            "self": {"isAccountConnected": true},
            "startAt": "2026-01-01T00:00:00Z",
            "endAt": "2026-02-01T00:00:00Z",
            "status": "ACTIVE",
            "allow": {"isEnabled": true, "channels": [{"id": "42", "name": "streamer"}]},
            "timeBasedDrops": [{
                "id": "drop-1",
                "name": "Drop One",
                "startAt": "2026-01-01T00:00:00Z",
                "endAt": "2026-02-01T00:00:00Z",
                "requiredMinutesWatched": 60,
                "benefitEdges": [],
                "preconditionDrops": [],
            }],
        });
        let campaign = DropsCampaign::from_gql(&data, &HashMap::new()).unwrap();
        assert_eq!(campaign.id, "camp-1");
        assert!(campaign.linked);
        assert_eq!(campaign.status, CampaignStatus::Active);
        let acl = campaign.acl.as_ref().expect("acl present");
        assert_eq!(acl[0].id, 42);
        assert_eq!(acl[0].login, "streamer");
        assert!(campaign.timed_drops.contains_key("drop-1"));
    }

    #[test]
    fn from_gql_no_acl_when_disabled_or_empty() {
        let mut data = serde_json::json!({
            "id": "camp-1",
            "name": "Campaign One",
            "game": {"id": "123", "name": "A Game"},
            "startAt": "2026-01-01T00:00:00Z",
            "endAt": "2026-02-01T00:00:00Z",
            "status": "UPCOMING",
            "allow": {"isEnabled": false, "channels": [{"id": "42", "name": "streamer"}]},
            "timeBasedDrops": [],
        });
        let campaign = DropsCampaign::from_gql(&data, &HashMap::new()).unwrap();
        assert!(campaign.acl.is_none());

        data["allow"] = serde_json::json!({"isEnabled": true, "channels": []});
        let campaign = DropsCampaign::from_gql(&data, &HashMap::new()).unwrap();
        assert!(campaign.acl.is_none());
    }
}
