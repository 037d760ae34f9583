//! Websocket message handlers: route decoded PubSub payloads into domain
//! updates and the side effects they trigger (watch, switch, claim,
//! inventory refresh). Dispatched on a fresh task per message
//! ([`crate::scheduler::Scheduler::run`]), so handlers for the same topic
//! may interleave -- all mutation here goes through the scheduler's shared
//! maps, which is the single source of truth.
//!
//! Ported from `original_source/src/services/message_handlers.py`'s
//! `MessageHandlerService`.

use std::sync::Arc;

use serde_json::Value;

use crate::constants::{
    gql_operations, websocket_topics, BROADCAST_UPDATE_DEBOUNCE, POST_CLAIM_POLL_ATTEMPTS, POST_CLAIM_POLL_INTERVAL,
    POST_CLAIM_SETTLE,
};
use crate::gql;
use crate::models::channel::Channel;
use crate::scheduler::{Scheduler, State};
use crate::services::channel as channel_service;
use crate::services::watch;
use crate::websocket::TopicMessage;

/// Route one decoded topic message to its handler based on the topic
/// template prefix (`<template>.<target_id>`).
pub async fn dispatch(scheduler: Arc<Scheduler>, msg: TopicMessage) {
    let Some((template, target)) = msg.topic.rsplit_once('.') else {
        tracing::warn!("malformed websocket topic: {}", msg.topic);
        return;
    };

    match template {
        websocket_topics::CHANNEL_STREAM_STATE => {
            if let Ok(channel_id) = target.parse::<u64>() {
                process_stream_state(&scheduler, channel_id, msg.payload).await;
            }
        }
        websocket_topics::CHANNEL_STREAM_UPDATE => {
            if let Ok(channel_id) = target.parse::<u64>() {
                process_stream_update(&scheduler, channel_id, msg.payload).await;
            }
        }
        websocket_topics::USER_DROPS => process_drops(&scheduler, msg.payload).await,
        websocket_topics::USER_NOTIFICATIONS => process_notifications(&scheduler, msg.payload).await,
        other => tracing::debug!("unhandled websocket topic template: {}", other),
    }
}

/// `video-playback-by-id` events: viewcount, stream-up, stream-down,
/// commercial. Ported from `MessageHandlerService.process_stream_state`.
async fn process_stream_state(scheduler: &Arc<Scheduler>, channel_id: u64, message: Value) {
    let msg_type = message.get("type").and_then(Value::as_str).unwrap_or("");
    let Some(before) = scheduler.channels.lock().await.get(&channel_id).cloned() else {
        tracing::error!("stream state change for a non-existing channel: {}", channel_id);
        return;
    };

    match msg_type {
        "viewcount" => {
            if !before.online {
                recheck_online(scheduler, channel_id).await;
            } else if let Some(viewers) = message.get("viewers").and_then(Value::as_i64) {
                if let Some(c) = scheduler.channels.lock().await.get_mut(&channel_id) {
                    c.viewers = Some(viewers as i32);
                }
            }
        }
        "stream-down" => {
            let mut after = before.clone();
            after.set_offline();
            scheduler.channels.lock().await.insert(channel_id, after.clone());
            on_channel_update(scheduler, channel_id, before, after).await;
        }
        "stream-up" => recheck_online(scheduler, channel_id).await,
        "commercial" => {}
        other => tracing::warn!("unknown stream state: {}", other),
    }
}

/// `broadcast-settings-update` events (game/title/tags changed). There's no
/// tag information in the payload itself, so just debounce and re-check the
/// channel wholesale -- this eventually calls [`on_channel_update`] once the
/// check resolves. Ported from `MessageHandlerService.process_stream_update`.
async fn process_stream_update(scheduler: &Arc<Scheduler>, channel_id: u64, _message: Value) {
    if scheduler.channels.lock().await.get(&channel_id).is_none() {
        tracing::error!("broadcast settings update for a non-existing channel: {}", channel_id);
        return;
    }
    tokio::time::sleep(BROADCAST_UPDATE_DEBOUNCE).await;
    recheck_online(scheduler, channel_id).await;
}

/// Re-fetch a single channel's live status via `GetStreamInfo` and feed the
/// before/after pair to [`on_channel_update`].
async fn recheck_online(scheduler: &Arc<Scheduler>, channel_id: u64) {
    let Some(before) = scheduler.channels.lock().await.get(&channel_id).cloned() else {
        return;
    };
    let mut probe = before.clone();
    probe.set_offline();
    let mut batch = [probe];
    if let Err(e) = channel_service::bulk_check_online(&scheduler.gql, &mut batch).await {
        tracing::warn!("online re-check failed for channel {}: {}", channel_id, e);
        return;
    }
    let [after] = batch;
    scheduler.channels.lock().await.insert(channel_id, after.clone());
    on_channel_update(scheduler, channel_id, before, after).await;
}

/// Decide whether a channel's online/status change warrants watching it,
/// switching away from it, or nothing at all. Ported from
/// `MessageHandlerService.on_channel_update`.
async fn on_channel_update(scheduler: &Arc<Scheduler>, channel_id: u64, before: Channel, after: Channel) {
    let wanted = scheduler.wanted_games.lock().await.clone();
    let inventory = scheduler.inventory.lock().await.clone();
    let watching = scheduler.watcher.current_channel().await;
    let is_watching_this = watching.as_ref().is_some_and(|w| w.id == channel_id);

    match (before.online, after.online) {
        (false, true) => {
            if watch::can_watch(&after, &wanted, &inventory) && watch::should_switch(&after, watching.as_ref(), &wanted) {
                scheduler.watcher.watch(after.clone()).await;
            } else {
                tracing::info!("{} goes ONLINE", after.name());
            }
        }
        (true, false) => {
            if is_watching_this {
                scheduler.change_state(State::ChannelSwitch).await;
            } else {
                tracing::info!("{} goes OFFLINE", after.name());
            }
        }
        (true, true) => {
            if is_watching_this && !watch::can_watch(&after, &wanted, &inventory) {
                scheduler.change_state(State::ChannelSwitch).await;
            } else if !is_watching_this
                && watch::can_watch(&after, &wanted, &inventory)
                && watch::should_switch(&after, watching.as_ref(), &wanted)
            {
                scheduler.watcher.watch(after.clone()).await;
            }
        }
        (false, false) => tracing::debug!("{} stays OFFLINE", after.name()),
    }
}

/// `user-drop-events` topic: drop-progress and drop-claim. Ported from
/// `MessageHandlerService.process_drops`.
async fn process_drops(scheduler: &Arc<Scheduler>, message: Value) {
    let msg_type = message.get("type").and_then(Value::as_str).unwrap_or("");
    if msg_type != "drop-progress" && msg_type != "drop-claim" {
        return;
    }
    let Some(data) = message.get("data") else { return };
    let Some(drop_id) = data.get("drop_id").and_then(Value::as_str).map(str::to_string) else {
        return;
    };

    if msg_type == "drop-claim" {
        process_drop_claim(scheduler, drop_id, data).await;
        return;
    }

    let Some(current_minutes) = data.get("current_progress_min").and_then(Value::as_i64).map(|v| v as i32) else {
        return;
    };
    let watching = scheduler.watcher.current_channel().await;
    let mut inventory = scheduler.inventory.lock().await;
    if let Some(campaign) = inventory.iter_mut().find(|c| c.timed_drops.contains_key(&drop_id)) {
        let can_earn = campaign
            .timed_drops
            .get(&drop_id)
            .is_some_and(|d| d.can_earn(campaign, watching.as_ref()));
        if can_earn {
            campaign.update_real_minutes(&drop_id, current_minutes, watching.as_ref());
            scheduler.watcher.note_progress();
        }
    }
}

async fn process_drop_claim(scheduler: &Arc<Scheduler>, drop_id: String, data: &Value) {
    let Some(instance_id) = data.get("drop_instance_id").and_then(Value::as_str).map(str::to_string) else {
        return;
    };

    let campaign_id = {
        let inventory = scheduler.inventory.lock().await;
        inventory.iter().find(|c| c.timed_drops.contains_key(&drop_id)).map(|c| c.id.clone())
    };
    let Some(campaign_id) = campaign_id else {
        tracing::error!("received a drop claim id for a non-existing drop: {} (claim id: {})", drop_id, instance_id);
        return;
    };

    {
        let mut inventory = scheduler.inventory.lock().await;
        if let Some(campaign) = inventory.iter_mut().find(|c| c.id == campaign_id) {
            if let Some(drop) = campaign.timed_drops.get_mut(&drop_id) {
                drop.set_server_claim_id(instance_id);
            }
        }
    }
    if let Err(e) = scheduler.submit_claim(&campaign_id, &drop_id).await {
        tracing::warn!("claiming drop {} failed: {}", drop_id, e);
    }

    // About 4-20s after claiming, the next drop in the chain can be started
    // by re-sending the watch payload. Poll CurrentDrop until it stops
    // reporting the drop we just claimed, or we give up.
    tokio::time::sleep(POST_CLAIM_SETTLE).await;
    let watching = scheduler.watcher.current_channel().await;
    if let Some(watching_channel) = &watching {
        for _ in 0..POST_CLAIM_POLL_ATTEMPTS {
            let variables = gql::current_drop_variables(&watching_channel.id.to_string());
            let next_drop_id = scheduler
                .gql
                .query(&gql_operations::CURRENT_DROP, Some(variables))
                .await
                .ok()
                .and_then(|resp| {
                    resp.get("currentUser")
                        .and_then(|u| u.get("dropCurrentSession"))
                        .filter(|v| !v.is_null())
                        .and_then(|ctx| ctx.get("dropID").and_then(Value::as_str).map(str::to_string))
                });
            match next_drop_id {
                Some(id) if id == drop_id => tokio::time::sleep(POST_CLAIM_POLL_INTERVAL).await,
                _ => break,
            }
        }
    }

    let still_earnable = {
        let inventory = scheduler.inventory.lock().await;
        inventory.iter().find(|c| c.id == campaign_id).is_some_and(|c| c.can_earn(watching.as_ref()))
    };
    if still_earnable {
        scheduler.watcher.restart_watching();
    } else {
        scheduler.change_state(State::InventoryFetch).await;
    }
}

/// `onsite-notifications` topic: only the drop-reward reminder triggers
/// anything. Ported from `MessageHandlerService.process_notifications`.
async fn process_notifications(scheduler: &Arc<Scheduler>, message: Value) {
    if message.get("type").and_then(Value::as_str) != Some("create-notification") {
        return;
    }
    let Some(notification) = message.get("data").and_then(|d| d.get("notification")) else {
        return;
    };
    if notification.get("type").and_then(Value::as_str) != Some("user_drop_reward_reminder_notification") {
        return;
    }
    let Some(id) = notification.get("id").and_then(Value::as_str).map(str::to_string) else {
        return;
    };

    scheduler.change_state(State::InventoryFetch).await;

    let variables = gql::notifications_delete_variables(&id);
    if let Err(e) = scheduler.gql.query(&gql_operations::NOTIFICATIONS_DELETE, Some(variables)).await {
        tracing::warn!("failed to delete notification {}: {}", id, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Game;

    fn game(id: &str) -> Game {
        Game { id: id.into(), name: id.into(), box_art_url: None }
    }

    #[test]
    fn topic_split_separates_template_from_target_id() {
        let (template, target) = "video-playback-by-id.123456".rsplit_once('.').unwrap();
        assert_eq!(template, websocket_topics::CHANNEL_STREAM_STATE);
        assert_eq!(target, "123456");
    }

    #[test]
    fn malformed_topic_has_no_dot() {
        assert!("not-a-topic".rsplit_once('.').is_none());
    }

    #[tokio::test]
    async fn on_channel_update_offline_to_online_watches_when_switchable() {
        // Exercised indirectly via can_watch/should_switch, which on_channel_update
        // delegates to; a dedicated Scheduler fixture would need the full HTTP/GQL
        // stack, so the transition matrix itself is covered at the watch-service level.
        let wanted = vec![game("1")];
        let c = Channel::from_directory(1, "a".into(), None, Some(game("1")), None, true);
        assert!(watch::should_switch(&c, None, &wanted));
    }
}
