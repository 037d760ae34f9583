//! Core constants for the Twitch Miner CLI.
//!
//! This module contains GQL operation definitions, WebSocket topics,
//! and client configuration data ported from the Python reference implementation.

use std::time::Duration;

/// Interval between watch pulses (simulating viewing)
pub const WATCH_INTERVAL: Duration = Duration::from_secs(59);

/// Interval between WebSocket PINGs
pub const PING_INTERVAL: Duration = Duration::from_secs(180); // 3 minutes

/// Maximum WebSocket connections
pub const MAX_WEBSOCKETS: usize = 8;

/// Topics limit per WebSocket
pub const WS_TOPICS_LIMIT: usize = 50;

/// Maximum extra minutes to track locally before forcing a refresh
pub const MAX_EXTRA_MINUTES: i32 = 15;

/// How long to wait for a PONG after a PING before requesting reconnect
pub const PONG_TIMEOUT: Duration = Duration::from_secs(10);

/// Every websocket reserves two topics (Drops + Notifications) keyed by user id
pub const BASE_TOPICS: usize = 2;

/// Total topic slots across the whole pool, minus the two base ones
pub const MAX_TOPICS: usize = MAX_WEBSOCKETS * WS_TOPICS_LIMIT - BASE_TOPICS;

/// Each channel occupies two topics (StreamState, StreamUpdate)
pub const MAX_CHANNELS: usize = MAX_TOPICS / 2;

/// LISTEN/UNLISTEN requests are batched in groups of this size
pub const LISTEN_BATCH_SIZE: usize = 10;

/// Coarse sleep granularity inside the watch loop, so restarts are prompt
pub const WATCH_SLEEP_TICK: Duration = Duration::from_secs(20);

/// Maximum backoff delay for HTTP retries and websocket reconnects
pub const MAX_BACKOFF: Duration = Duration::from_secs(180);

/// Maximum backoff delay for GQL transient retries
pub const GQL_MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Default sliding-window rate limiter capacity for the GQL client.
/// Do not tune without evidence: a higher cap has been observed to cause
/// upstream-side blocking of the whole account.
pub const GQL_RATE_LIMIT_CAPACITY: usize = 5;

/// Default sliding-window rate limiter window for the GQL client
pub const GQL_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(1);

/// How many campaigns to request detail for per `CampaignDetails` batch
pub const CAMPAIGN_DETAILS_BATCH: usize = 20;

/// How many ACL channels to online-check concurrently
pub const ONLINE_CHECK_BATCH: usize = 20;

/// Default live-stream directory query limit per wanted game
pub const DIRECTORY_QUERY_LIMIT: u32 = 30;

/// How long after a campaign ends a drop may still be claimed
pub const CLAIM_GRACE_PERIOD: Duration = Duration::from_secs(24 * 3600);

/// How long the maintenance/inventory loop waits between full reloads
pub const MAINTENANCE_PERIOD: Duration = Duration::from_secs(60 * 60);

/// Debounce before re-checking a channel's online status after a broadcast
/// settings change, so a burst of title/tag edits collapses into one check
pub const BROADCAST_UPDATE_DEBOUNCE: Duration = Duration::from_secs(3);

/// How long to wait after a successful claim before polling for the next drop
pub const POST_CLAIM_SETTLE: Duration = Duration::from_secs(4);

/// Spacing between post-claim current-drop polls
pub const POST_CLAIM_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How many times to poll for the next drop before giving up
pub const POST_CLAIM_POLL_ATTEMPTS: usize = 8;

// =============================================================================
// Endpoints
// =============================================================================

pub const GQL_URL: &str = "https://gql.twitch.tv/gql";
pub const PUBSUB_URL: &str = "wss://pubsub-edge.twitch.tv/v1";
pub const OAUTH_DEVICE_URL: &str = "https://id.twitch.tv/oauth2/device";
pub const OAUTH_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
pub const OAUTH_VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";

// =============================================================================
// Client Configuration
// =============================================================================

/// Client type configuration for Twitch API access.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_url: &'static str,
    pub client_id: &'static str,
    pub user_agent: &'static str,
}

/// Web client configuration (primary)
pub const CLIENT_WEB: ClientInfo = ClientInfo {
    client_url: "https://www.twitch.tv",
    client_id: "kimne78kx3ncx6brgo4mv6wki5h1ko",
    user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36",
};

/// Android app client configuration - bypasses integrity checks!
/// This is what TwitchDropsMiner uses by default.
pub const CLIENT_ANDROID_APP: ClientInfo = ClientInfo {
    client_url: "https://www.twitch.tv",
    client_id: "kd1unb4b3q4t58fwlpcbzcbnm76a8fp",
    user_agent: "Dalvik/2.1.0 (Linux; U; Android 16; SM-S911B Build/TP1A.220624.014) tv.twitch.android.app/25.3.0/2503006",
};

// =============================================================================
// GQL Operations
// =============================================================================

/// A GraphQL operation with its persisted query hash.
#[derive(Debug, Clone)]
pub struct GqlOperation {
    pub name: &'static str,
    pub sha256: &'static str,
}

impl GqlOperation {
    pub const fn new(name: &'static str, sha256: &'static str) -> Self {
        Self { name, sha256 }
    }
}

/// All GQL operations used by the miner.
/// The SHA256 hashes are required for Twitch's persisted query system.
pub mod gql_operations {
    use super::GqlOperation;

    /// Returns stream information for a particular channel
    pub const GET_STREAM_INFO: GqlOperation = GqlOperation::new(
        "VideoPlayerStreamInfoOverlayChannel",
        "198492e0857f6aedead9665c81c5a06d67b25b58034649687124083ff288597d",
    );

    /// Claim channel points
    pub const CLAIM_COMMUNITY_POINTS: GqlOperation = GqlOperation::new(
        "ClaimCommunityPoints",
        "46aaeebe02c99afdf4fc97c7c0cba964124bf6b0af229395f1f6d1feed05b3d0",
    );

    /// Claim a drop reward
    pub const CLAIM_DROP: GqlOperation = GqlOperation::new(
        "DropsPage_ClaimDropRewards",
        "a455deea71bdc9015b78eb49f4acfbce8baa7ccbedd28e549bb025bd0f751930",
    );

    /// Returns current state of points for a channel
    pub const CHANNEL_POINTS_CONTEXT: GqlOperation = GqlOperation::new(
        "ChannelPointsContext",
        "374314de591e69925fce3ddc2bcf085796f56ebb8cad67a0daa3165c03adc345",
    );

    /// Returns all in-progress campaigns (inventory)
    pub const INVENTORY: GqlOperation = GqlOperation::new(
        "Inventory",
        "d86775d0ef16a63a33ad52e80eaff963b2d5b72fada7c991504a57496e1d8e4b",
    );

    /// Returns current drop progress for a watched channel
    pub const CURRENT_DROP: GqlOperation = GqlOperation::new(
        "DropCurrentSessionContext",
        "4d06b702d25d652afb9ef835d2a550031f1cf762b193523a92166f40ea3d142b",
    );

    /// Returns all available campaigns
    pub const CAMPAIGNS: GqlOperation = GqlOperation::new(
        "ViewerDropsDashboard",
        "5a4da2ab3d5b47c9f9ce864e727b2cb346af1e3ea8b897fe8f704a97ff017619",
    );

    /// Returns extended information about a campaign
    pub const CAMPAIGN_DETAILS: GqlOperation = GqlOperation::new(
        "DropCampaignDetails",
        "039277bf98f3130929262cc7c6efd9c141ca3749cb6dca442fc8ead9a53f77c1",
    );

    /// Returns drops available for a channel
    pub const AVAILABLE_DROPS: GqlOperation = GqlOperation::new(
        "DropsHighlightService_AvailableDrops",
        "9a62a09bce5b53e26e64a671e530bc599cb6aab1e5ba3cbd5d85966d3940716f",
    );

    /// Returns stream playback access token
    pub const PLAYBACK_ACCESS_TOKEN: GqlOperation = GqlOperation::new(
        "PlaybackAccessToken",
        "ed230aa1e33e07eebb8928504583da78a5173989fadfb1ac94be06a04f3cdbe9",
    );

    /// Returns live channels for a game
    pub const GAME_DIRECTORY: GqlOperation = GqlOperation::new(
        "DirectoryPage_Game",
        "98a996c3c3ebb1ba4fd65d6671c6028d7ee8d615cb540b0731b3db2a911d3649",
    );

    /// Converts game name to game slug
    pub const SLUG_REDIRECT: GqlOperation = GqlOperation::new(
        "DirectoryGameRedirect",
        "1f0300090caceec51f33c5e20647aceff9017f740f223c3c532ba6fa59f6b6cc",
    );

    /// Dismisses an onsite notification (e.g. the drop-reward reminder)
    pub const NOTIFICATIONS_DELETE: GqlOperation = GqlOperation::new(
        "OnsiteNotifications_DeleteNotification",
        "13d463c831f28ffe17dccf55b3148ed8b3edbbd0ebadd56352f1ff0160616816",
    );
}

// =============================================================================
// WebSocket Topics
// =============================================================================

/// WebSocket topic names for PubSub subscriptions.
pub mod websocket_topics {
    // User topics (use user_id)
    pub const USER_DROPS: &str = "user-drop-events";
    pub const USER_NOTIFICATIONS: &str = "onsite-notifications";
    pub const USER_COMMUNITY_POINTS: &str = "community-points-user-v1";

    // Channel topics (use channel_id)
    pub const CHANNEL_STREAM_STATE: &str = "video-playback-by-id";
    pub const CHANNEL_STREAM_UPDATE: &str = "broadcast-settings-update";
}

/// Format a WebSocket topic string.
pub fn format_topic(topic_name: &str, target_id: u64) -> String {
    format!("{}.{}", topic_name, target_id)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_info() {
        assert_eq!(CLIENT_WEB.client_id, "kimne78kx3ncx6brgo4mv6wki5h1ko");
        assert!(CLIENT_WEB.client_url.starts_with("https://"));
    }

    #[test]
    fn test_gql_operations_hashes() {
        // Verify critical hashes match the Python implementation exactly
        assert_eq!(
            gql_operations::INVENTORY.sha256,
            "d86775d0ef16a63a33ad52e80eaff963b2d5b72fada7c991504a57496e1d8e4b"
        );
        assert_eq!(
            gql_operations::CLAIM_DROP.sha256,
            "a455deea71bdc9015b78eb49f4acfbce8baa7ccbedd28e549bb025bd0f751930"
        );
        assert_eq!(
            gql_operations::CURRENT_DROP.sha256,
            "4d06b702d25d652afb9ef835d2a550031f1cf762b193523a92166f40ea3d142b"
        );
        assert_eq!(
            gql_operations::PLAYBACK_ACCESS_TOKEN.sha256,
            "ed230aa1e33e07eebb8928504583da78a5173989fadfb1ac94be06a04f3cdbe9"
        );
    }

    #[test]
    fn test_websocket_topic_formatting() {
        let topic = format_topic(websocket_topics::USER_DROPS, 12345678);
        assert_eq!(topic, "user-drop-events.12345678");

        let topic = format_topic(websocket_topics::CHANNEL_STREAM_STATE, 87654321);
        assert_eq!(topic, "video-playback-by-id.87654321");
    }

    #[test]
    fn test_intervals() {
        assert_eq!(WATCH_INTERVAL.as_secs(), 59);
        assert_eq!(PING_INTERVAL.as_secs(), 180);
    }
}
