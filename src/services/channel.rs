//! Channel ordering and discovery: priority by wanted-game order, directory
//! discovery for games without an ACL, and bulk online checks for ACL
//! channels. Ported from `original_source/src/services/channel_service.py`.

use std::collections::HashMap;

use serde_json::Value;

use crate::constants::{gql_operations, ONLINE_CHECK_BATCH};
use crate::error::MinerError;
use crate::gql::GqlClient;
use crate::models::channel::Channel;
use crate::models::Game;

/// Index of `channel.game` within `wanted_games`, or `usize::MAX` if the
/// channel has no game or it isn't wanted. Lower is higher priority.
/// Ported from `ChannelService.get_priority`.
pub fn get_priority(channel: &Channel, wanted_games: &[Game]) -> usize {
    match &channel.game {
        Some(game) => wanted_games.iter().position(|g| g == game).unwrap_or(usize::MAX),
        None => usize::MAX,
    }
}

/// `-1` when viewer count is unknown, mirroring `channel.viewers or -1`.
pub fn get_viewers_key(channel: &Channel) -> i32 {
    channel.viewers.unwrap_or(-1)
}

/// Composite ordering used by `CHANNELS_FETCH` to pick which channels to keep
/// and in what order to scan them for `CHANNEL_SWITCH`: priority ascending is
/// the decisive key, then ACL-based channels before discovered ones, then
/// higher viewer counts. This is the single-key equivalent of the three
/// chained stable `.sort()` calls in the original (viewers, then acl_based,
/// then priority applied last -- and since Python sorts are stable, the last
/// sort applied is the most significant key here).
pub fn sort_key(channel: &Channel, wanted_games: &[Game]) -> (usize, std::cmp::Reverse<bool>, std::cmp::Reverse<i32>) {
    (
        get_priority(channel, wanted_games),
        std::cmp::Reverse(channel.acl_based),
        std::cmp::Reverse(get_viewers_key(channel)),
    )
}

/// Query live, drops-enabled streams for `game`, up to `limit`. Ported from
/// `ChannelService.get_live_streams`.
pub async fn get_live_streams(
    gql: &GqlClient,
    game: &Game,
    limit: u32,
    drops_enabled: bool,
) -> Result<Vec<Channel>, MinerError> {
    let variables = crate::gql::game_directory_variables(&game.slug(), limit);
    let data = gql.query(&gql_operations::GAME_DIRECTORY, Some(variables)).await?;
    let Some(game_data) = data.get("game") else {
        return Ok(Vec::new());
    };

    let edges = game_data
        .get("streams")
        .and_then(|s| s.get("edges"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut channels = Vec::new();
    for edge in edges {
        let Some(node) = edge.get("node") else { continue };
        let Some(broadcaster) = node.get("broadcaster") else { continue };
        if broadcaster.is_null() {
            continue;
        }
        let Some(id) = broadcaster.get("id").and_then(Value::as_str).and_then(|s| s.parse::<u64>().ok()) else {
            continue;
        };
        let Some(login) = broadcaster.get("login").and_then(Value::as_str) else {
            continue;
        };
        let display_name = broadcaster.get("displayName").and_then(Value::as_str).map(str::to_string);
        let viewers = node.get("viewersCount").and_then(Value::as_i64).map(|v| v as i32);
        channels.push(Channel::from_directory(
            id,
            login.to_string(),
            display_name,
            Some(game.clone()),
            viewers,
            drops_enabled,
        ));
    }
    Ok(channels)
}

/// Batch-check whether each of `channels` is live, updating game/viewer state
/// in place for those that are. Channels not currently live are left alone
/// (ACL channels start offline and stay that way until confirmed live).
/// Ported from `ChannelService.bulk_check_online`.
pub async fn bulk_check_online(gql: &GqlClient, channels: &mut [Channel]) -> Result<(), MinerError> {
    for chunk in channels.chunks_mut(ONLINE_CHECK_BATCH) {
        let ops: Vec<_> = chunk
            .iter()
            .map(|c| {
                (
                    &gql_operations::GET_STREAM_INFO,
                    Some(serde_json::json!({"channel": c.login})),
                )
            })
            .collect();
        let responses = gql.query_batch(ops).await?;
        for (channel, data) in chunk.iter_mut().zip(responses) {
            let Some(user) = data.get("user") else { continue };
            let Some(stream) = user.get("stream") else { continue };
            if stream.is_null() {
                continue;
            }
            channel.external_update(stream);
        }
    }
    Ok(())
}

/// Rebuild the id-keyed channel map used by the scheduler from a list,
/// last-write-wins on duplicate ids.
pub fn index_by_id(channels: Vec<Channel>) -> HashMap<u64, Channel> {
    channels.into_iter().map(|c| (c.id, c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn game(id: &str, name: &str) -> Game {
        Game { id: id.to_string(), name: name.to_string(), box_art_url: None }
    }

    #[test]
    fn priority_is_position_in_wanted_games() {
        let wanted = vec![game("1", "Alpha"), game("2", "Beta")];
        let c = Channel::from_directory(1, "x".into(), None, Some(game("2", "Beta")), None, true);
        assert_eq!(get_priority(&c, &wanted), 1);
    }

    #[test]
    fn priority_is_max_when_game_not_wanted() {
        let wanted = vec![game("1", "Alpha")];
        let c = Channel::from_directory(1, "x".into(), None, Some(game("9", "Other")), None, true);
        assert_eq!(get_priority(&c, &wanted), usize::MAX);
    }

    #[test]
    fn viewers_key_defaults_to_negative_one() {
        let c = Channel::from_acl(1, "x".into());
        assert_eq!(get_viewers_key(&c), -1);
    }

    #[test]
    fn sort_key_prefers_priority_then_acl_then_viewers() {
        let wanted = vec![game("1", "Alpha")];
        let high_priority = Channel::from_directory(1, "a".into(), None, Some(game("1", "Alpha")), Some(5), true);
        let low_priority = Channel::from_directory(2, "b".into(), None, Some(game("9", "Other")), Some(500), true);
        assert!(sort_key(&high_priority, &wanted) < sort_key(&low_priority, &wanted));
    }
}
