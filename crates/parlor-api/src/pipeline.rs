use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use parlor_db::models::{MessageRow, NewMessage};
use parlor_types::api::Caller;
use parlor_types::events::{SendPayload, ServerEvent};
use parlor_types::models::{ChatMessage, normalize_room};

use crate::error::{ChatError, Feature, Validation};
use crate::profiles;
use crate::state::AppState;

/// Validate, persist, trim, enrich and broadcast one message.
///
/// Shared by `POST /messages` and gateway `send` frames. `fallback_room` is
/// the connection's room, used when the payload names none.
pub async fn ingest(
    state: &AppState,
    caller: &Caller,
    payload: SendPayload,
    fallback_room: Option<&str>,
) -> Result<ChatMessage, ChatError> {
    let settings = state.settings.current();
    if !settings.enabled {
        return Err(ChatError::FeatureDisabled(Feature::Room));
    }

    let content = payload.content.trim().to_string();
    let image_urls: Vec<String> = payload
        .image_urls
        .into_iter()
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .collect();
    if content.is_empty() && image_urls.is_empty() {
        return Err(ChatError::ValidationFailed(Validation::Empty));
    }

    let max = settings.effective_max_message_length();
    if content.chars().count() > max {
        return Err(ChatError::ValidationFailed(Validation::TooLong { max }));
    }

    let room = match (payload.room.trim(), fallback_room) {
        ("", Some(fallback)) => normalize_room(fallback),
        (room, _) => normalize_room(room),
    };
    let keep = settings.effective_message_limit();

    let st = state.clone();
    let sender = caller.clone();
    let (row, trimmed) = tokio::task::spawn_blocking(move || {
        let display_name = profiles::display_name_for(&st.db, &sender);
        let row = st.db.insert_message(&NewMessage {
            room: &room,
            user_id: sender.user_id,
            username: &sender.username,
            display_name: &display_name,
            content: &content,
            image_urls: &image_urls,
        })?;

        let trimmed = match st.db.trim_messages(&room, keep) {
            Ok(trimmed) => trimmed,
            Err(e) => {
                warn!("Retention trim failed for room {}: {:#}", room, e);
                Vec::new()
            }
        };
        anyhow::Ok((row, trimmed))
    })
    .await
    .map_err(|e| ChatError::PersistenceFailed(e.into()))?
    .map_err(ChatError::PersistenceFailed)?;

    if !trimmed.is_empty() {
        let urls: Vec<String> = trimmed.into_iter().flat_map(|r| r.image_urls).collect();
        let removed = state.attachments.delete_urls(&urls).await;
        debug!(
            "Trimmed room {} to {} messages, removed {} attachments",
            row.room, keep, removed
        );
    }

    if let Some(budget) = settings.cache_budget() {
        if let Err(e) = state.attachments.prune_to_budget(budget).await {
            warn!("Attachment budget prune failed: {:#}", e);
        }
    }

    let mut message = to_chat_message(row);
    let st = state.clone();
    let message = tokio::task::spawn_blocking(move || {
        profiles::enrich(&st.db, &st.ranks, &mut message);
        message
    })
    .await
    .map_err(|e| ChatError::PersistenceFailed(e.into()))?;

    state
        .hub
        .broadcast_event(&ServerEvent::Message {
            message: message.clone(),
        });

    Ok(message)
}

/// Convert a stored row. Enrichment fields are left at their defaults.
pub fn to_chat_message(row: MessageRow) -> ChatMessage {
    let created_at = DateTime::parse_from_rfc3339(&row.created_at)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|e| {
            error!("Corrupt timestamp {:?} on message {}: {}", row.created_at, row.id, e);
            DateTime::<Utc>::UNIX_EPOCH
        });

    ChatMessage {
        id: row.id,
        room: row.room,
        user_id: row.user_id,
        username: row.username,
        display_name: row.display_name,
        content: row.content,
        image_urls: row.image_urls,
        created_at,
        avatar: String::new(),
        quota: 0,
        used_quota: 0,
        usage_rank: 0,
        balance_rank: 0,
    }
}
