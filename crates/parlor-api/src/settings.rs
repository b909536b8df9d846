use std::sync::{PoisonError, RwLock};

use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use tracing::{info, warn};

use parlor_db::Database;
use parlor_types::api::{AnnouncementRequest, AnnouncementResponse, ApiResponse};
use parlor_types::events::ServerEvent;
use parlor_types::models::{RoomConfig, RoomSettings};

use crate::error::ChatError;
use crate::state::AppState;

const KEY_PREFIX: &str = "chat_room.";

/// In-memory room settings with write-through persistence to the
/// `settings` table.
pub struct SettingsStore {
    current: RwLock<RoomSettings>,
}

impl SettingsStore {
    /// Defaults overlaid with whatever was persisted.
    pub fn load(db: &Database) -> anyhow::Result<Self> {
        let mut settings = RoomSettings::default();
        let stored = db.load_settings()?;
        for (key, value) in &stored {
            if let Some(field) = key.strip_prefix(KEY_PREFIX) {
                apply_field(&mut settings, field, value);
            }
        }

        info!(
            "Chat room settings loaded ({} stored keys, enabled={})",
            stored.len(),
            settings.enabled
        );
        Ok(Self::new(settings))
    }

    pub fn new(settings: RoomSettings) -> Self {
        Self {
            current: RwLock::new(settings),
        }
    }

    pub fn current(&self) -> RoomSettings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Persist and install `next`. Returns the settings it replaced.
    pub fn replace(&self, db: &Database, next: RoomSettings) -> anyhow::Result<RoomSettings> {
        db.save_settings(&to_pairs(&next))?;
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        Ok(std::mem::replace(&mut *current, next))
    }

    pub fn set_announcement(&self, db: &Database, announcement: &str) -> anyhow::Result<()> {
        db.save_settings(&[(key("announcement"), announcement.to_string())])?;
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .announcement = announcement.to_string();
        Ok(())
    }
}

fn key(field: &str) -> String {
    format!("{KEY_PREFIX}{field}")
}

fn to_pairs(settings: &RoomSettings) -> Vec<(String, String)> {
    vec![
        (key("enabled"), settings.enabled.to_string()),
        (key("message_limit"), settings.message_limit.to_string()),
        (key("max_message_length"), settings.max_message_length.to_string()),
        (key("announcement"), settings.announcement.clone()),
        (key("image_enabled"), settings.image_enabled.to_string()),
        (key("image_max_bytes"), settings.image_max_bytes.to_string()),
        (key("image_cache_max_bytes"), settings.image_cache_max_bytes.to_string()),
        (key("anti_hotlink_enabled"), settings.anti_hotlink_enabled.to_string()),
        (
            key("allowed_referers"),
            serde_json::to_string(&settings.allowed_referers).unwrap_or_else(|_| "[]".into()),
        ),
    ]
}

fn apply_field(settings: &mut RoomSettings, field: &str, value: &str) {
    fn parse<T: std::str::FromStr>(field: &str, value: &str, slot: &mut T) {
        match value.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => warn!("Ignoring unparseable setting {}={:?}", field, value),
        }
    }

    match field {
        "enabled" => parse(field, value, &mut settings.enabled),
        "message_limit" => parse(field, value, &mut settings.message_limit),
        "max_message_length" => parse(field, value, &mut settings.max_message_length),
        "announcement" => settings.announcement = value.to_string(),
        "image_enabled" => parse(field, value, &mut settings.image_enabled),
        "image_max_bytes" => parse(field, value, &mut settings.image_max_bytes),
        "image_cache_max_bytes" => parse(field, value, &mut settings.image_cache_max_bytes),
        "anti_hotlink_enabled" => parse(field, value, &mut settings.anti_hotlink_enabled),
        "allowed_referers" => match serde_json::from_str(value) {
            Ok(list) => settings.allowed_referers = list,
            Err(_) => warn!("Ignoring unparseable setting {}={:?}", field, value),
        },
        other => warn!("Unknown chat room setting {}", other),
    }
}

// ── Handlers ────────────────────────────────────────────────────────────

/// GET /config: public subset of the room settings.
pub async fn get_config(State(state): State<AppState>) -> Json<ApiResponse<RoomConfig>> {
    Json(ApiResponse::ok(state.settings.current().public_config()))
}

/// GET /setting: full settings (admin).
pub async fn get_settings(State(state): State<AppState>) -> Json<ApiResponse<RoomSettings>> {
    Json(ApiResponse::ok(state.settings.current()))
}

/// PUT /setting: replace all settings (admin). A changed announcement is
/// pushed to every connection.
pub async fn update_settings(
    State(state): State<AppState>,
    body: Result<Json<RoomSettings>, JsonRejection>,
) -> Result<Json<ApiResponse<RoomSettings>>, ChatError> {
    let Json(next) = body.map_err(|_| ChatError::InvalidRequest)?;
    let announcement = next.announcement.clone();

    let previous = state
        .settings
        .replace(&state.db, next)
        .map_err(ChatError::PersistenceFailed)?;

    if previous.announcement != announcement {
        state
            .hub
            .broadcast_event(&ServerEvent::Announcement { announcement });
    }

    info!("Chat room settings updated");
    Ok(Json(ApiResponse::ok(state.settings.current())))
}

/// POST /announcement: set the announcement and push it (admin).
pub async fn set_announcement(
    State(state): State<AppState>,
    body: Result<Json<AnnouncementRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<AnnouncementResponse>>, ChatError> {
    let Json(req) = body.map_err(|_| ChatError::InvalidRequest)?;

    state
        .settings
        .set_announcement(&state.db, &req.announcement)
        .map_err(ChatError::PersistenceFailed)?;

    state.hub.broadcast_event(&ServerEvent::Announcement {
        announcement: req.announcement.clone(),
    });

    Ok(Json(ApiResponse::ok(AnnouncementResponse {
        announcement: req.announcement,
    })))
}
