use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ROOM: &str = "global";
pub const MAX_ROOM_CHARS: usize = 64;

pub const DEFAULT_MESSAGE_LIMIT: i64 = 1000;
pub const MAX_MESSAGE_LIMIT: i64 = 5000;
pub const DEFAULT_MAX_MESSAGE_LENGTH: i64 = 8000;
pub const MAX_MAX_MESSAGE_LENGTH: i64 = 50000;
pub const DEFAULT_IMAGE_MAX_BYTES: i64 = 5 * 1024 * 1024;
/// Largest image upload any setting can allow.
pub const MAX_IMAGE_MAX_BYTES: i64 = 64 * 1024 * 1024;

/// Path clients use to open the gateway connection.
pub const WS_PATH: &str = "/api/chat/ws";

/// Avatar used for anonymous senders and senders without a profile picture.
pub const DEFAULT_AVATAR_URL: &str = "/avatar.png";

/// A chat message as seen by clients.
///
/// `id` through `created_at` are persisted. The trailing decoration fields are
/// filled in at read/broadcast time from the profile table and the rank cache
/// and are never written back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub room: String,
    /// 0 for anonymous senders.
    pub user_id: i64,
    pub username: String,
    pub display_name: String,
    pub content: String,
    #[serde(default)]
    pub image_urls: Vec<String>,
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub quota: i64,
    #[serde(default)]
    pub used_quota: i64,
    #[serde(default)]
    pub usage_rank: u32,
    #[serde(default)]
    pub balance_rank: u32,
}

/// Full room configuration, as edited by administrators.
///
/// Values are stored as given; readers go through the `effective_*`
/// accessors, which clamp out-of-range values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomSettings {
    pub enabled: bool,
    pub message_limit: i64,
    pub max_message_length: i64,
    pub announcement: String,
    pub image_enabled: bool,
    pub image_max_bytes: i64,
    /// Budget for the whole attachment tree. 0 disables pruning.
    pub image_cache_max_bytes: i64,
    pub anti_hotlink_enabled: bool,
    pub allowed_referers: Vec<String>,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            message_limit: DEFAULT_MESSAGE_LIMIT,
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
            announcement: String::new(),
            image_enabled: true,
            image_max_bytes: DEFAULT_IMAGE_MAX_BYTES,
            image_cache_max_bytes: 0,
            anti_hotlink_enabled: false,
            allowed_referers: Vec::new(),
        }
    }
}

impl RoomSettings {
    /// Stored messages kept per room, clamped into [1, 5000].
    pub fn effective_message_limit(&self) -> usize {
        clamp_or_default(self.message_limit, DEFAULT_MESSAGE_LIMIT, MAX_MESSAGE_LIMIT) as usize
    }

    /// Maximum content length in characters, clamped into [1, 50000].
    pub fn effective_max_message_length(&self) -> usize {
        clamp_or_default(
            self.max_message_length,
            DEFAULT_MAX_MESSAGE_LENGTH,
            MAX_MAX_MESSAGE_LENGTH,
        ) as usize
    }

    /// Image upload cap in bytes, clamped into [1, 64 MiB].
    pub fn effective_image_max_bytes(&self) -> u64 {
        clamp_or_default(self.image_max_bytes, DEFAULT_IMAGE_MAX_BYTES, MAX_IMAGE_MAX_BYTES) as u64
    }

    /// `None` when the attachment tree is unbounded.
    pub fn cache_budget(&self) -> Option<u64> {
        (self.image_cache_max_bytes > 0).then_some(self.image_cache_max_bytes as u64)
    }

    /// The public subset handed to every client.
    pub fn public_config(&self) -> RoomConfig {
        RoomConfig {
            enabled: self.enabled,
            message_limit: self.effective_message_limit(),
            max_message_length: self.effective_max_message_length(),
            ws_path: WS_PATH.to_string(),
            image_enabled: self.image_enabled,
            announcement: self.announcement.clone(),
        }
    }
}

fn clamp_or_default(value: i64, default: i64, max: i64) -> i64 {
    if value <= 0 { default } else { value.min(max) }
}

/// Room configuration visible to every client (`/config` and the `init` event).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomConfig {
    pub enabled: bool,
    pub message_limit: usize,
    pub max_message_length: usize,
    pub ws_path: String,
    pub image_enabled: bool,
    pub announcement: String,
}

/// Trim a client-supplied room name; empty becomes `"global"`, anything longer
/// than 64 characters is cut.
pub fn normalize_room(room: &str) -> String {
    let room = room.trim();
    if room.is_empty() {
        return DEFAULT_ROOM.to_string();
    }
    room.chars().take(MAX_ROOM_CHARS).collect()
}
