use axum::{
    Extension, Json,
    extract::{Query, State, rejection::JsonRejection},
};
use tracing::warn;

use parlor_types::api::{ApiResponse, Caller, CountResponse, ListMessagesQuery, RoomQuery};
use parlor_types::events::SendPayload;
use parlor_types::models::{ChatMessage, normalize_room};

use crate::error::{ChatError, Feature};
use crate::pipeline::{self, to_chat_message};
use crate::profiles;
use crate::state::AppState;

/// Newest-first page of `room`, enriched. `before_id` of `None` starts at the
/// newest message.
pub async fn load_page(
    state: &AppState,
    room: String,
    limit: usize,
    before_id: Option<i64>,
) -> anyhow::Result<Vec<ChatMessage>> {
    let st = state.clone();
    tokio::task::spawn_blocking(move || {
        let rows = st.db.list_messages(&room, limit, before_id)?;
        let mut messages: Vec<ChatMessage> = rows.into_iter().map(to_chat_message).collect();
        profiles::enrich_all(&st.db, &st.ranks, &mut messages);
        anyhow::Ok(messages)
    })
    .await?
}

/// GET /messages?room=&limit=&before_id=
pub async fn list_messages(
    State(state): State<AppState>,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<ApiResponse<Vec<ChatMessage>>>, ChatError> {
    let settings = state.settings.current();
    if !settings.enabled {
        return Err(ChatError::FeatureDisabled(Feature::Room));
    }

    let mut limit = settings.effective_message_limit();
    if let Some(requested) = query.limit() {
        limit = limit.min(requested);
    }
    let before_id = query.before_id();

    let messages = load_page(&state, normalize_room(&query.room), limit, before_id)
        .await
        .map_err(ChatError::PersistenceFailed)?;

    Ok(Json(ApiResponse::ok(messages)))
}

/// GET /count?room=: a storage error reads as zero rather than failing.
pub async fn message_count(
    State(state): State<AppState>,
    Query(query): Query<RoomQuery>,
) -> Json<ApiResponse<CountResponse>> {
    if !state.settings.current().enabled {
        return Json(ApiResponse::ok(CountResponse {
            count: 0,
            enabled: false,
        }));
    }

    let room = normalize_room(&query.room);
    let st = state.clone();
    let count = match tokio::task::spawn_blocking(move || st.db.count_messages(&room)).await {
        Ok(Ok(count)) => count,
        Ok(Err(e)) => {
            warn!("Failed to count chat messages: {:#}", e);
            0
        }
        Err(e) => {
            warn!("spawn_blocking join error: {}", e);
            0
        }
    };

    Json(ApiResponse::ok(CountResponse {
        count,
        enabled: true,
    }))
}

/// POST /messages: same pipeline as a gateway `send` frame, but the
/// outcome is returned to the caller.
pub async fn post_message(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    body: Result<Json<SendPayload>, JsonRejection>,
) -> Result<Json<ApiResponse<ChatMessage>>, ChatError> {
    let Json(payload) = body.map_err(|_| ChatError::InvalidRequest)?;
    let message = pipeline::ingest(&state, &caller, payload, None).await?;
    Ok(Json(ApiResponse::ok(message)))
}
