//! The mining core's central state machine: decides which campaigns are
//! worth pursuing, which channels to track, and which one to actually watch,
//! re-entering on every inventory refresh, websocket event, and maintenance
//! tick.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;

use crate::auth::Auth;
use crate::constants::{format_topic, gql_operations, websocket_topics, DIRECTORY_QUERY_LIMIT, MAX_CHANNELS};
use crate::error::MinerError;
use crate::gql::{self, GqlClient};
use crate::http::HttpClient;
use crate::models::{Channel, DropsCampaign, Game};
use crate::pool::Pool;
use crate::services::channel as channel_service;
use crate::services::handlers;
use crate::services::inventory::InventoryService;
use crate::services::maintenance;
use crate::services::watch::{self, Watcher};
use crate::settings::Settings;
use crate::websocket::TopicMessage;

/// One node of the scheduler's state machine. `Exit` is terminal: once
/// reached, [`Scheduler::change_state`] refuses every further transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    InventoryFetch,
    GamesUpdate,
    ChannelsCleanup,
    ChannelsFetch,
    ChannelSwitch,
    Exit,
}

/// Owns every piece of mutable mining state and drives the state machine in
/// [`Scheduler::run`]. Shared via `Arc` with the watch loop and the
/// websocket message handlers, which read and mutate the same channel map,
/// inventory, and state field.
pub struct Scheduler {
    pub(crate) http: HttpClient,
    pub(crate) auth: Arc<Auth>,
    pub(crate) gql: GqlClient,
    pub(crate) pool: Arc<Pool>,
    pub(crate) watcher: Arc<Watcher>,
    inventory_service: InventoryService,
    pub(crate) settings: Mutex<Settings>,
    state: Mutex<State>,
    notify: Notify,
    pub(crate) channels: Mutex<HashMap<u64, Channel>>,
    pub(crate) inventory: Arc<Mutex<Vec<DropsCampaign>>>,
    pub(crate) wanted_games: Mutex<Vec<Game>>,
    manual_mode: Mutex<Option<Game>>,
    selected_channel: Mutex<Option<u64>>,
    mnt_triggers: Mutex<VecDeque<DateTime<Utc>>>,
    mnt_task: Mutex<Option<JoinHandle<()>>>,
    /// Set by GAMES_UPDATE on every pass; consumed (and reset) by the next
    /// CHANNELS_CLEANUP. A cleanup reached directly from a maintenance
    /// trigger (bypassing GAMES_UPDATE) sees it still `false` and only prunes
    /// stale channels instead of dropping everything.
    full_cleanup: AtomicBool,
    pub(crate) user_id: u64,
    dump: bool,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        http: HttpClient,
        auth: Arc<Auth>,
        gql: GqlClient,
        pool: Arc<Pool>,
        watcher: Arc<Watcher>,
        settings: Settings,
        user_id: u64,
        dump: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            http,
            auth,
            inventory_service: InventoryService::new(gql.clone()),
            gql,
            pool,
            watcher,
            settings: Mutex::new(settings),
            state: Mutex::new(State::InventoryFetch),
            notify: Notify::new(),
            channels: Mutex::new(HashMap::new()),
            inventory: Arc::new(Mutex::new(Vec::new())),
            wanted_games: Mutex::new(Vec::new()),
            manual_mode: Mutex::new(None),
            selected_channel: Mutex::new(None),
            mnt_triggers: Mutex::new(VecDeque::new()),
            mnt_task: Mutex::new(None),
            full_cleanup: AtomicBool::new(true),
            user_id,
            dump,
        })
    }

    /// Move to `new_state` and wake the driving loop. A no-op once `EXIT`
    /// has been reached.
    pub(crate) async fn change_state(&self, new_state: State) {
        let mut state = self.state.lock().await;
        if *state != State::Exit {
            *state = new_state;
        }
        drop(state);
        self.notify.notify_one();
    }

    async fn is_exit(&self) -> bool {
        matches!(*self.state.lock().await, State::Exit)
    }

    /// Select `channel_id` as the user's explicit watch pick. Picked up by
    /// the next `CHANNEL_SWITCH` pass.
    pub(crate) async fn select_channel(&self, channel_id: u64) {
        *self.selected_channel.lock().await = Some(channel_id);
        self.change_state(State::ChannelSwitch).await;
    }

    pub(crate) fn mnt_triggers(&self) -> &Mutex<VecDeque<DateTime<Utc>>> {
        &self.mnt_triggers
    }

    /// Replace `drop_id`'s claim id with the server-provided one and submit
    /// the `ClaimDropRewards` mutation, marking the drop claimed on success.
    /// Shared by the GAMES_UPDATE sweep and the `drop-claim` websocket
    /// handler so both paths apply the exact same success criteria.
    pub(crate) async fn submit_claim(&self, campaign_id: &str, drop_id: &str) -> Result<(), MinerError> {
        let claim_id = {
            let inventory = self.inventory.lock().await;
            let campaign = inventory
                .iter()
                .find(|c| c.id == campaign_id)
                .ok_or_else(|| MinerError::Other(anyhow::anyhow!("claim: unknown campaign {campaign_id}")))?;
            let drop = campaign
                .timed_drops
                .get(drop_id)
                .ok_or_else(|| MinerError::Other(anyhow::anyhow!("claim: unknown drop {drop_id}")))?;
            drop.claim_id
                .clone()
                .ok_or_else(|| MinerError::Other(anyhow::anyhow!("claim: drop {drop_id} has no claim id yet")))?
        };

        let variables = gql::claim_drop_variables(&claim_id);
        let data = self.gql.query(&gql_operations::CLAIM_DROP, Some(variables)).await?;
        let status = data
            .get("claimDropRewards")
            .and_then(|v| v.get("status"))
            .and_then(Value::as_str)
            .unwrap_or("");

        if status != "ELIGIBLE_FOR_ALL" && status != "DROP_INSTANCE_ALREADY_CLAIMED" {
            return Err(MinerError::GqlFatal(format!("claim rejected with status {status}")));
        }

        let mut inventory = self.inventory.lock().await;
        if let Some(campaign) = inventory.iter_mut().find(|c| c.id == campaign_id) {
            if let Some(drop) = campaign.timed_drops.get_mut(drop_id) {
                drop.mark_claimed();
            }
        }
        Ok(())
    }

    /// Cancel whatever maintenance task is running and spawn a fresh one.
    /// Called once per inventory fetch, matching the trigger deque it was
    /// just rebuilt from.
    async fn restart_maintenance(self: &Arc<Self>) {
        let mut slot = self.mnt_task.lock().await;
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        let scheduler = self.clone();
        *slot = Some(tokio::spawn(async move {
            maintenance::run(scheduler).await;
        }));
    }

    /// Drive the state machine to completion. Spawns the watch loop and the
    /// websocket event dispatcher as supervised background tasks, then loops
    /// over state transitions until `EXIT`.
    pub async fn run(self: Arc<Self>, mut ws_events: mpsc::UnboundedReceiver<TopicMessage>) -> Result<(), MinerError> {
        self.pool.start().await;
        self.pool
            .add_topics(vec![
                format_topic(websocket_topics::USER_DROPS, self.user_id),
                format_topic(websocket_topics::USER_NOTIFICATIONS, self.user_id),
            ])
            .await?;

        let watch_scheduler = self.clone();
        tokio::spawn(async move {
            let watcher = watch_scheduler.watcher.clone();
            if let Err(e) = watcher.run(watch_scheduler.gql.clone(), watch_scheduler.inventory.clone()).await {
                tracing::error!("watch loop exited unexpectedly: {}", e);
                watch_scheduler.change_state(State::Exit).await;
            }
        });

        let dispatch_scheduler = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_events.recv().await {
                let scheduler = dispatch_scheduler.clone();
                tokio::spawn(async move {
                    handlers::dispatch(scheduler, msg).await;
                });
            }
        });

        loop {
            let state = *self.state.lock().await;
            match state {
                State::Idle => {
                    run_idle(&self).await;
                    if !self.is_exit().await {
                        self.notify.notified().await;
                    }
                }
                State::InventoryFetch => run_inventory_fetch(&self).await,
                State::GamesUpdate => run_games_update(&self).await,
                State::ChannelsCleanup => run_channels_cleanup(&self).await,
                State::ChannelsFetch => run_channels_fetch(&self).await,
                State::ChannelSwitch => {
                    let settled = run_channel_switch(&self).await;
                    if settled && !self.is_exit().await {
                        self.notify.notified().await;
                    }
                }
                State::Exit => {
                    self.watcher.stop_watching().await;
                    self.pool.stop().await;
                    if let Some(handle) = self.mnt_task.lock().await.take() {
                        handle.abort();
                    }
                    return Ok(());
                }
            }
        }
    }
}

/// Fetch inventory, rebuild the maintenance trigger deque from it, and
/// restart the maintenance task. Stays in `INVENTORY_FETCH` (retrying after a
/// short pause) if the fetch itself fails.
async fn run_inventory_fetch(scheduler: &Arc<Scheduler>) {
    let campaigns = match scheduler.inventory_service.fetch_inventory(scheduler.user_id).await {
        Ok(campaigns) => campaigns,
        Err(e) => {
            tracing::warn!("inventory fetch failed, retrying shortly: {}", e);
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            return;
        }
    };
    *scheduler.inventory.lock().await = campaigns;

    scheduler.settings.lock().await.save(false).ok();

    if scheduler.dump {
        emit_dump(scheduler).await;
        scheduler.change_state(State::Exit).await;
        return;
    }

    let next_hour = Utc::now() + ChronoDuration::hours(1);
    let mut triggers = std::collections::BTreeSet::new();
    for campaign in scheduler.inventory.lock().await.iter() {
        if campaign.can_earn_within(next_hour) {
            triggers.extend(campaign.time_triggers());
        }
    }
    let now = Utc::now();
    *scheduler.mnt_triggers().lock().await = triggers.into_iter().filter(|t| *t > now).collect();

    scheduler.restart_maintenance().await;
    scheduler.change_state(State::GamesUpdate).await;
}

/// Claim every drop that's ready from non-upcoming campaigns, then recompute
/// `wanted_games` from the settings list and the active manual-mode pick.
async fn run_games_update(scheduler: &Arc<Scheduler>) {
    let claimable: Vec<(String, String)> = {
        let inventory = scheduler.inventory.lock().await;
        inventory
            .iter()
            .filter(|c| !c.upcoming())
            .flat_map(|c| {
                let campaign_id = c.id.clone();
                c.timed_drops
                    .values()
                    .filter(|d| d.can_claim(c.ends_at))
                    .map(move |d| (campaign_id.clone(), d.id.clone()))
            })
            .collect()
    };
    for (campaign_id, drop_id) in claimable {
        if let Err(e) = scheduler.submit_claim(&campaign_id, &drop_id).await {
            tracing::warn!("claiming drop {} failed: {}", drop_id, e);
        }
    }

    let next_hour = Utc::now() + ChronoDuration::hours(1);
    let settings_games = scheduler.settings.lock().await.get().games_to_watch.clone();

    let mut wanted: Vec<Game> = Vec::new();
    {
        let inventory = scheduler.inventory.lock().await;
        for name in &settings_games {
            if wanted.iter().any(|g| g.name.eq_ignore_ascii_case(name)) {
                continue;
            }
            let matching = inventory
                .iter()
                .find(|c| c.game.name.eq_ignore_ascii_case(name) && c.can_earn_within(next_hour))
                .map(|c| c.game.clone());
            if let Some(game) = matching {
                wanted.push(game);
            }
        }

        let mut manual = scheduler.manual_mode.lock().await;
        if let Some(game) = manual.clone() {
            let still_earnable = inventory.iter().any(|c| c.game == game && c.can_earn_within(next_hour));
            if !still_earnable {
                *manual = None;
            } else {
                wanted.retain(|g| g != &game);
                wanted.insert(0, game);
            }
        }
    }

    *scheduler.wanted_games.lock().await = wanted;
    scheduler.full_cleanup.store(true, Ordering::SeqCst);
    scheduler.watcher.restart_watching();
    scheduler.change_state(State::ChannelsCleanup).await;
}

/// Drop every tracked channel (full cleanup, or nothing wanted anymore), or
/// just the ones that went offline / stopped playing a wanted game.
async fn run_channels_cleanup(scheduler: &Arc<Scheduler>) {
    let wanted = scheduler.wanted_games.lock().await.clone();
    let full = scheduler.full_cleanup.swap(false, Ordering::SeqCst);

    let to_remove: Vec<u64> = {
        let channels = scheduler.channels.lock().await;
        if full || wanted.is_empty() {
            channels.keys().copied().collect()
        } else {
            channels
                .values()
                .filter(|c| {
                    let game_not_wanted = c.game.as_ref().map_or(true, |g| !wanted.contains(g));
                    !c.acl_based && (!c.online || game_not_wanted)
                })
                .map(|c| c.id)
                .collect()
        }
    };

    if !to_remove.is_empty() {
        let mut channels = scheduler.channels.lock().await;
        let mut topics = Vec::with_capacity(to_remove.len() * 2);
        for id in &to_remove {
            channels.remove(id);
            topics.push(format_topic(websocket_topics::CHANNEL_STREAM_STATE, *id));
            topics.push(format_topic(websocket_topics::CHANNEL_STREAM_UPDATE, *id));
        }
        drop(channels);
        scheduler.pool.remove_topics(topics).await;
    }

    if wanted.is_empty() {
        scheduler.change_state(State::Idle).await;
    } else {
        scheduler.change_state(State::ChannelsFetch).await;
    }
}

/// Rebuild the tracked-channel set: keep what's already tracked, add ACL
/// channels from earnable wanted-game campaigns (online-checking the new
/// ones), add live directory results for wanted games without an ACL, sort,
/// trim to `MAX_CHANNELS`, and resubscribe.
async fn run_channels_fetch(scheduler: &Arc<Scheduler>) {
    let wanted = scheduler.wanted_games.lock().await.clone();
    let inventory = scheduler.inventory.lock().await.clone();
    let next_hour = Utc::now() + ChronoDuration::hours(1);

    let existing = scheduler.channels.lock().await.clone();
    let mut merged: HashMap<u64, Channel> = existing.clone();

    let mut acl_candidates: HashMap<u64, Channel> = HashMap::new();
    let mut no_acl_games: Vec<Game> = Vec::new();
    for campaign in &inventory {
        if !wanted.contains(&campaign.game) || !campaign.can_earn_within(next_hour) {
            continue;
        }
        match &campaign.acl {
            Some(channels) => {
                for c in channels {
                    acl_candidates.entry(c.id).or_insert_with(|| c.clone());
                }
            }
            None => {
                if !no_acl_games.contains(&campaign.game) {
                    no_acl_games.push(campaign.game.clone());
                }
            }
        }
    }
    acl_candidates.retain(|id, _| !merged.contains_key(id));

    let mut acl_list: Vec<Channel> = acl_candidates.into_values().collect();
    if !acl_list.is_empty() {
        if let Err(e) = channel_service::bulk_check_online(&scheduler.gql, &mut acl_list).await {
            tracing::warn!("bulk online check failed: {}", e);
        }
    }
    for c in acl_list {
        merged.insert(c.id, c);
    }

    for game in &no_acl_games {
        match channel_service::get_live_streams(&scheduler.gql, game, DIRECTORY_QUERY_LIMIT, true).await {
            Ok(streams) => {
                for c in streams {
                    merged.insert(c.id, c);
                }
            }
            Err(e) => tracing::warn!("directory query for {} failed: {}", game.name, e),
        }
    }

    let mut ordered: Vec<Channel> = merged.into_values().collect();
    ordered.sort_by(|a, b| channel_service::sort_key(a, &wanted).cmp(&channel_service::sort_key(b, &wanted)));

    let overflow = if ordered.len() > MAX_CHANNELS {
        ordered.split_off(MAX_CHANNELS)
    } else {
        Vec::new()
    };
    if !overflow.is_empty() {
        let mut topics = Vec::with_capacity(overflow.len() * 2);
        for c in &overflow {
            topics.push(format_topic(websocket_topics::CHANNEL_STREAM_STATE, c.id));
            topics.push(format_topic(websocket_topics::CHANNEL_STREAM_UPDATE, c.id));
        }
        scheduler.pool.remove_topics(topics).await;
    }

    let mut topics = Vec::with_capacity(ordered.len() * 2);
    for c in &ordered {
        topics.push(format_topic(websocket_topics::CHANNEL_STREAM_STATE, c.id));
        topics.push(format_topic(websocket_topics::CHANNEL_STREAM_UPDATE, c.id));
    }
    if let Err(e) = scheduler.pool.add_topics(topics).await {
        tracing::warn!("subscribing channel topics failed: {}", e);
    }

    let new_map = channel_service::index_by_id(ordered);
    *scheduler.channels.lock().await = new_map.clone();

    if let Some(watching) = scheduler.watcher.current_channel().await {
        let keep = new_map
            .get(&watching.id)
            .is_some_and(|c| watch::can_watch(c, &wanted, &inventory));
        if !keep {
            scheduler.watcher.stop_watching().await;
        }
    }

    scheduler.change_state(State::ChannelSwitch).await;
}

/// Pick the channel to watch, in order: the user's explicit pick, the
/// manual-mode game's best channel, then the highest-priority watchable
/// channel. Returns `true` if the scheduler has settled (kept watching,
/// started watching, or has nothing left to do) and should wait for the next
/// external event.
async fn run_channel_switch(scheduler: &Arc<Scheduler>) -> bool {
    let wanted = scheduler.wanted_games.lock().await.clone();
    let inventory = scheduler.inventory.lock().await.clone();
    let channels = scheduler.channels.lock().await.clone();
    let watching = scheduler.watcher.current_channel().await;

    let mut chosen: Option<Channel> = None;

    if let Some(id) = *scheduler.selected_channel.lock().await {
        if let Some(c) = channels.get(&id) {
            if watch::can_watch(c, &wanted, &inventory) {
                if watching.as_ref().map(|w| &w.game) != Some(&c.game) {
                    *scheduler.manual_mode.lock().await = c.game.clone();
                }
                chosen = Some(c.clone());
            }
        }
    }

    if chosen.is_none() {
        let manual_game = scheduler.manual_mode.lock().await.clone();
        if let Some(game) = manual_game {
            let candidate = channels
                .values()
                .find(|c| c.game.as_ref() == Some(&game) && watch::can_watch(c, &wanted, &inventory))
                .cloned();
            if candidate.is_none() {
                *scheduler.manual_mode.lock().await = None;
            }
            chosen = candidate;
        }
    }

    if chosen.is_none() {
        let mut by_priority: Vec<&Channel> = channels.values().collect();
        by_priority.sort_by_key(|c| channel_service::get_priority(c, &wanted));
        chosen = by_priority
            .into_iter()
            .find(|c| watch::can_watch(c, &wanted, &inventory) && watch::should_switch(c, watching.as_ref(), &wanted))
            .cloned();
    }

    if let Some(c) = chosen {
        scheduler.watcher.watch(c).await;
        return true;
    }

    if let Some(w) = &watching {
        if channels.get(&w.id).is_some_and(|c| watch::can_watch(c, &wanted, &inventory)) {
            return true;
        }
    }

    scheduler.change_state(State::Idle).await;
    false
}

/// Print the freshly-fetched campaign list as JSON to stdout for `--dump`
/// mode. Ported from `original_source/src/__main__.py`'s `--dump` branch,
/// which prints the inventory straight to the console rather than entering
/// the normal watch loop.
async fn emit_dump(scheduler: &Arc<Scheduler>) {
    let inventory = scheduler.inventory.lock().await;
    match serde_json::to_string_pretty(&*inventory) {
        Ok(json) => println!("{json}"),
        Err(e) => tracing::error!("failed to serialize inventory dump: {}", e),
    }
}

/// Stop watching and, in one-shot `--dump` mode, request shutdown.
async fn run_idle(scheduler: &Arc<Scheduler>) {
    scheduler.watcher.stop_watching().await;
    if scheduler.dump {
        scheduler.change_state(State::Exit).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_exit_is_distinguishable() {
        assert_eq!(State::Exit, State::Exit);
        assert_ne!(State::Exit, State::Idle);
    }
}
