//! Channel and stream models.
//!
//! Unlike the original's `Channel` object (which holds a live reference back
//! to the client and drives its own GQL/websocket calls), this is a plain
//! data record: the scheduler and channel service own the mutation logic and
//! the active GQL/HTTP handles, per the "global state threaded through
//! constructors" design note.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::game::Game;

/// A Twitch channel as tracked by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: u64,
    pub login: String,
    pub display_name: Option<String>,
    pub game: Option<Game>,
    pub viewers: Option<i32>,
    pub online: bool,
    pub drops_enabled: bool,
    /// True iff this channel was introduced through a campaign's ACL rather
    /// than discovered via a directory query.
    pub acl_based: bool,
}

impl Channel {
    pub fn name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.login)
    }

    pub fn url(&self) -> String {
        format!("https://www.twitch.tv/{}", self.login)
    }

    /// Build a channel entry from a campaign's ACL list. Online/game state is
    /// unknown until `bulk_check_online` fills it in.
    pub fn from_acl(id: u64, login: String) -> Self {
        Self {
            id,
            login,
            display_name: None,
            game: None,
            viewers: None,
            online: false,
            drops_enabled: false,
            acl_based: true,
        }
    }

    /// Build a channel entry from a `GameDirectory` stream edge; directory
    /// results are live by construction.
    pub fn from_directory(
        id: u64,
        login: String,
        display_name: Option<String>,
        game: Option<Game>,
        viewers: Option<i32>,
        drops_enabled: bool,
    ) -> Self {
        Self {
            id,
            login,
            display_name,
            game,
            viewers,
            online: true,
            drops_enabled,
            acl_based: false,
        }
    }

    /// Apply a `stream` sub-object from a `ChannelPointsContext`/stream-check
    /// GQL response (as used by `bulk_check_online`): marks the channel
    /// online and refreshes game/viewer data.
    pub fn external_update(&mut self, stream_data: &Value) {
        self.online = true;
        if let Some(game) = stream_data.get("game") {
            if let (Some(id), Some(name)) = (
                game.get("id").and_then(|v| v.as_str()),
                game.get("displayName")
                    .or_else(|| game.get("name"))
                    .and_then(|v| v.as_str()),
            ) {
                self.game = Some(Game {
                    id: id.to_string(),
                    name: name.to_string(),
                    box_art_url: None,
                });
            }
        }
        if let Some(viewers) = stream_data.get("viewersCount").and_then(|v| v.as_i64()) {
            self.viewers = Some(viewers as i32);
        }
    }

    /// `stream-down` websocket event: the channel went offline.
    pub fn set_offline(&mut self) {
        self.online = false;
        self.viewers = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acl_channels_start_offline_and_acl_based() {
        let c = Channel::from_acl(123, "streamer".into());
        assert!(c.acl_based);
        assert!(!c.online);
    }

    #[test]
    fn directory_channels_start_online() {
        let c = Channel::from_directory(1, "a".into(), None, None, Some(10), true);
        assert!(c.online);
        assert!(!c.acl_based);
    }

    #[test]
    fn set_offline_clears_viewers() {
        let mut c = Channel::from_directory(1, "a".into(), None, None, Some(10), true);
        c.set_offline();
        assert!(!c.online);
        assert_eq!(c.viewers, None);
    }

    #[test]
    fn name_falls_back_to_login() {
        let c = Channel::from_acl(1, "login_only".into());
        assert_eq!(c.name(), "login_only");
    }
}
