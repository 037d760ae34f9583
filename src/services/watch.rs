//! Channel watching: the spade "minute-watched" heartbeat plus the
//! progress-estimation fallback that runs when the server stops pushing
//! websocket drop-progress updates.
//!
//! The heartbeat mechanics (spade URL scraping, payload shape, pulse send)
//! are ported from the Scotty-Cam watcher module; `can_watch`/`should_switch`
//! and the loop's fallback steps are ported from
//! `original_source/src/services/watch_service.py`'s `WatchService`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex_lite::Regex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;

use crate::auth::Auth;
use crate::constants::{gql_operations, CLIENT_ANDROID_APP, CLIENT_WEB, WATCH_INTERVAL, WATCH_SLEEP_TICK};
use crate::error::MinerError;
use crate::gql::{self, GqlClient};
use crate::http::HttpClient;
use crate::models::channel::Channel;
use crate::models::{DropsCampaign, Game};
use crate::services::channel as channel_service;

static SPADE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#""beacon_?url": ?"(https://video-edge-[\.\w\-/]+\.ts(?:\?allow_stream=true)?)""#)
        .expect("invalid spade pattern regex")
});

static SETTINGS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"src="(https://[\w\.]+/config/settings\.[0-9a-f]{32}\.js)""#).expect("invalid settings pattern regex")
});

#[derive(Debug, Clone, Serialize)]
struct SpadeEvent {
    event: &'static str,
    properties: SpadeProperties,
}

#[derive(Debug, Clone, Serialize)]
struct SpadeProperties {
    broadcast_id: String,
    channel_id: String,
    channel: String,
    hidden: bool,
    live: bool,
    location: &'static str,
    logged_in: bool,
    muted: bool,
    player: &'static str,
    user_id: u64,
}

/// `wanted_games` non-empty, channel online with drops enabled, playing a
/// wanted game, and at least one campaign can earn on it. Ported from
/// `WatchService.can_watch`.
pub fn can_watch(channel: &Channel, wanted_games: &[Game], inventory: &[DropsCampaign]) -> bool {
    if wanted_games.is_empty() || !channel.online || !channel.drops_enabled {
        return false;
    }
    let Some(game) = &channel.game else { return false };
    if !wanted_games.contains(game) {
        return false;
    }
    inventory.iter().any(|c| c.can_earn(Some(channel)))
}

/// Ported from `WatchService.should_switch`.
pub fn should_switch(candidate: &Channel, watching: Option<&Channel>, wanted_games: &[Game]) -> bool {
    let Some(watching) = watching else { return true };
    let candidate_order = channel_service::get_priority(candidate, wanted_games);
    let watching_order = channel_service::get_priority(watching, wanted_games);
    candidate_order < watching_order || (candidate_order == watching_order && candidate.acl_based && !watching.acl_based)
}

/// Owns the watched-channel slot and the heartbeat/fallback loop. Shared via
/// `Arc` between the scheduler (which calls `watch`/`stop_watching`) and the
/// message-handler service (which calls `note_progress`/`restart_watching`).
pub struct Watcher {
    http: HttpClient,
    auth: Arc<Auth>,
    slot: Mutex<Option<Channel>>,
    slot_changed: Notify,
    restart: Notify,
    progress_seen: AtomicBool,
    spade_urls: Mutex<HashMap<u64, String>>,
}

impl Watcher {
    pub fn new(http: HttpClient, auth: Arc<Auth>) -> Arc<Self> {
        Arc::new(Self {
            http,
            auth,
            slot: Mutex::new(None),
            slot_changed: Notify::new(),
            restart: Notify::new(),
            progress_seen: AtomicBool::new(false),
            spade_urls: Mutex::new(HashMap::new()),
        })
    }

    pub async fn current_channel(&self) -> Option<Channel> {
        self.slot.lock().await.clone()
    }

    /// Start watching `channel`, waking the loop's `await_channel` step.
    pub async fn watch(&self, channel: Channel) {
        *self.slot.lock().await = Some(channel);
        self.slot_changed.notify_waiters();
    }

    /// Clear the watched-channel slot and any in-progress drop display state.
    pub async fn stop_watching(&self) {
        *self.slot.lock().await = None;
        self.slot_changed.notify_waiters();
    }

    /// Drop the minute countdown and short-circuit the current sleep.
    pub fn restart_watching(&self) {
        self.restart.notify_waiters();
    }

    /// Called by the message handler on a `drop-progress` websocket event so
    /// the fallback step knows the server is still reporting progress.
    pub fn note_progress(&self) {
        self.progress_seen.store(true, Ordering::SeqCst);
    }

    async fn await_channel(&self) -> Channel {
        loop {
            if let Some(c) = self.slot.lock().await.clone() {
                return c;
            }
            self.slot_changed.notified().await;
        }
    }

    /// Sleep for `delay`, waking early if `restart_watching` fires.
    async fn interruptible_sleep(&self, delay: std::time::Duration) {
        tokio::select! {
            _ = sleep(delay) => {}
            _ = self.restart.notified() => {}
        }
    }

    /// Extract the spade beacon URL from a channel's page HTML, trying the
    /// inline pattern first and falling back to the settings.js bundle.
    pub async fn fetch_spade_url(&self, channel_login: &str) -> Result<String, MinerError> {
        let url = format!("https://www.twitch.tv/{channel_login}");
        let resp = self
            .http
            .inner()
            .get(&url)
            .header("User-Agent", CLIENT_WEB.user_agent)
            .send()
            .await
            .map_err(|e| MinerError::TransportTransient(e.to_string()))?;
        let html = resp
            .text()
            .await
            .map_err(|e| MinerError::Other(anyhow::anyhow!("reading channel page: {e}")))?;

        if let Some(captures) = SPADE_PATTERN.captures(&html) {
            return Ok(captures[1].to_string());
        }

        if let Some(captures) = SETTINGS_PATTERN.captures(&html) {
            let settings_url = captures[1].to_string();
            let settings_resp = self
                .http
                .inner()
                .get(&settings_url)
                .header("User-Agent", CLIENT_WEB.user_agent)
                .send()
                .await
                .map_err(|e| MinerError::TransportTransient(e.to_string()))?;
            let settings_js = settings_resp
                .text()
                .await
                .map_err(|e| MinerError::Other(anyhow::anyhow!("reading settings.js: {e}")))?;
            if let Some(captures) = SPADE_PATTERN.captures(&settings_js) {
                return Ok(captures[1].to_string());
            }
        }

        Err(MinerError::Other(anyhow::anyhow!("could not extract spade url from channel page")))
    }

    async fn spade_url_for(&self, channel: &Channel) -> Result<String, MinerError> {
        if let Some(cached) = self.spade_urls.lock().await.get(&channel.id) {
            return Ok(cached.clone());
        }
        let url = self.fetch_spade_url(&channel.login).await?;
        self.spade_urls.lock().await.insert(channel.id, url.clone());
        Ok(url)
    }

    fn generate_payload(&self, channel: &Channel, user_id: u64) -> String {
        let event = SpadeEvent {
            event: "minute-watched",
            properties: SpadeProperties {
                broadcast_id: String::new(),
                channel_id: channel.id.to_string(),
                channel: channel.login.clone(),
                hidden: false,
                live: true,
                location: "channel",
                logged_in: true,
                muted: false,
                player: "site",
                user_id,
            },
        };
        let json = serde_json::to_string(&[event]).expect("spade event always serializes");
        BASE64.encode(json.as_bytes())
    }

    /// Send one heartbeat. Failures (network error or non-204 response) are
    /// reported as `false`, never as an error — matches the original's
    /// `channel.send_watch()` boolean return.
    async fn send_heartbeat(&self, channel: &Channel) -> bool {
        let spade_url = match self.spade_url_for(channel).await {
            Ok(u) => u,
            Err(e) => {
                tracing::warn!("could not resolve spade url for {}: {}", channel.name(), e);
                return false;
            }
        };
        let user_id = self.auth.snapshot().await.user_id;
        let payload = self.generate_payload(channel, user_id);
        let body = format!("data={payload}");

        let result = self
            .http
            .inner()
            .post(&spade_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("User-Agent", CLIENT_ANDROID_APP.user_agent)
            .header("Client-Id", CLIENT_ANDROID_APP.client_id)
            .body(body)
            .send()
            .await;

        match result {
            Ok(resp) => resp.status().as_u16() == 204,
            Err(e) => {
                tracing::warn!("watch pulse failed for {}: {}", channel.name(), e);
                false
            }
        }
    }

    /// Query `CurrentDrop`, then fall back to bumping the active campaign's
    /// minutes; logs and gives up if neither finds anything to update.
    async fn run_progress_fallback(&self, gql: &GqlClient, channel: &Channel, inventory: &Mutex<Vec<DropsCampaign>>) {
        let variables = gql::current_drop_variables(&channel.id.to_string());
        let drop_update = match gql.query(&gql_operations::CURRENT_DROP, Some(variables)).await {
            Ok(data) => data
                .get("currentUser")
                .and_then(|u| u.get("dropCurrentSession"))
                .filter(|v| !v.is_null())
                .and_then(|ctx| {
                    let drop_id = ctx.get("dropID").and_then(Value::as_str)?.to_string();
                    let minutes = ctx.get("currentMinutesWatched").and_then(Value::as_i64)? as i32;
                    Some((drop_id, minutes))
                }),
            Err(e) => {
                tracing::debug!("current-drop query failed: {}", e);
                None
            }
        };

        let mut campaigns = inventory.lock().await;
        if let Some((drop_id, minutes)) = drop_update {
            if let Some(campaign) = campaigns.iter_mut().find(|c| c.timed_drops.contains_key(&drop_id)) {
                if campaign.timed_drops[&drop_id].can_earn(campaign, Some(channel)) {
                    campaign.update_real_minutes(&drop_id, minutes, Some(channel));
                    tracing::debug!("drop progress from GQL: {} = {}", drop_id, minutes);
                    return;
                }
            }
        }

        if let Some(campaign) = campaigns
            .iter_mut()
            .filter(|c| c.can_earn(Some(channel)))
            .min_by(|a, b| a.remaining_minutes().partial_cmp(&b.remaining_minutes()).unwrap())
        {
            if campaign.bump_minutes(Some(channel)) {
                tracing::debug!("extra minutes capped for {}, requesting resync", campaign.name);
                self.restart_watching();
            }
            return;
        }

        tracing::debug!("no active drop could be determined for {}", channel.name());
    }

    /// The main watch loop. Runs until cancelled by the owning task.
    pub async fn run(self: Arc<Self>, gql: GqlClient, inventory: Arc<Mutex<Vec<DropsCampaign>>>) -> Result<(), MinerError> {
        loop {
            let channel = self.await_channel().await;
            if !channel.online {
                self.stop_watching().await;
                continue;
            }

            let succeeded = self.send_heartbeat(&channel).await;
            if !succeeded {
                tracing::debug!("watch heartbeat failed for {}", channel.name());
            }
            let last_sent = Instant::now();

            self.progress_seen.store(false, Ordering::SeqCst);
            self.interruptible_sleep(WATCH_SLEEP_TICK).await;

            if !self.progress_seen.swap(false, Ordering::SeqCst) {
                self.run_progress_fallback(&gql, &channel, &inventory).await;
            }

            let remainder = WATCH_INTERVAL.saturating_sub(last_sent.elapsed());
            self.interruptible_sleep(remainder).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game(id: &str) -> Game {
        Game { id: id.into(), name: id.into(), box_art_url: None }
    }

    #[test]
    fn cannot_watch_without_wanted_games() {
        let c = Channel::from_directory(1, "a".into(), None, Some(game("1")), None, true);
        assert!(!can_watch(&c, &[], &[]));
    }

    #[test]
    fn cannot_watch_offline_or_drops_disabled() {
        let wanted = vec![game("1")];
        let mut c = Channel::from_directory(1, "a".into(), None, Some(game("1")), None, true);
        c.online = false;
        assert!(!can_watch(&c, &wanted, &[]));
        c.online = true;
        c.drops_enabled = false;
        assert!(!can_watch(&c, &wanted, &[]));
    }

    #[test]
    fn should_switch_true_when_nothing_watched() {
        let c = Channel::from_directory(1, "a".into(), None, Some(game("1")), None, true);
        assert!(should_switch(&c, None, &[game("1")]));
    }

    #[test]
    fn should_switch_prefers_acl_at_equal_priority() {
        let wanted = vec![game("1")];
        let mut candidate = Channel::from_directory(1, "a".into(), None, Some(game("1")), None, true);
        candidate.acl_based = true;
        let watching = Channel::from_directory(2, "b".into(), None, Some(game("1")), None, true);
        assert!(should_switch(&candidate, Some(&watching), &wanted));
    }

    #[test]
    fn should_not_switch_to_lower_priority_game() {
        let wanted = vec![game("1"), game("2")];
        let candidate = Channel::from_directory(1, "a".into(), None, Some(game("2")), None, true);
        let watching = Channel::from_directory(2, "b".into(), None, Some(game("1")), None, true);
        assert!(!should_switch(&candidate, Some(&watching), &wanted));
    }

    #[tokio::test]
    async fn watch_and_stop_update_slot() {
        let path = std::env::temp_dir().join(format!("watch-test-cookies-{}.json", std::process::id()));
        let http = HttpClient::new(1, None, path);
        let auth = Arc::new(Auth::new(http.clone()));
        let watcher = Watcher::new(http, auth);
        let c = Channel::from_directory(1, "a".into(), None, None, None, true);
        watcher.watch(c.clone()).await;
        assert_eq!(watcher.current_channel().await.unwrap().id, 1);
        watcher.stop_watching().await;
        assert!(watcher.current_channel().await.is_none());
    }
}
