use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{
        Query, State,
        ws::{WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderMap, StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tracing::{debug, error, warn};

use parlor_gateway::connection::{
    self, FrameHandler, FrameOutcome, MAX_INCOMING_BYTES, Session,
};
use parlor_gateway::hub::Payload;
use parlor_types::api::{ApiResponse, Caller};
use parlor_types::events::{SendPayload, ServerEvent};
use parlor_types::models::normalize_room;

use crate::attachments::host_and_port;
use crate::error::{ChatError, Feature};
use crate::messages::load_page;
use crate::pipeline;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub room: String,
}

/// Gateway frames run through the same ingestion pipeline as REST posts.
pub struct ChatFrames {
    state: AppState,
}

impl ChatFrames {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }
}

impl FrameHandler for ChatFrames {
    async fn snapshot(&self, session: &Session) -> Option<Payload> {
        let settings = self.state.settings.current();
        let limit = settings.effective_message_limit();
        let messages = match load_page(&self.state, session.room.clone(), limit, None).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Failed to load init snapshot for room {}: {:#}", session.room, e);
                Vec::new()
            }
        };

        let init = ServerEvent::Init {
            room: session.room.clone(),
            config: settings.public_config(),
            messages,
        };
        match init.to_json() {
            Ok(json) => Some(Payload::from(json)),
            Err(e) => {
                error!("Failed to serialize init snapshot: {}", e);
                None
            }
        }
    }

    async fn on_send(&self, session: &Session, payload: SendPayload) -> FrameOutcome {
        match pipeline::ingest(&self.state, &session.caller, payload, Some(&session.room)).await {
            Ok(message) => {
                debug!("Conn {} posted message {}", session.conn_id, message.id);
                FrameOutcome::Accepted
            }
            Err(e) if e.is_user_actionable() => FrameOutcome::Rejected(e.to_string()),
            Err(ChatError::PersistenceFailed(e)) => {
                error!("Dropping message from conn {}: {:#}", session.conn_id, e);
                FrameOutcome::Dropped
            }
            Err(e) => {
                debug!("Dropping message from conn {}: {}", session.conn_id, e);
                FrameOutcome::Dropped
            }
        }
    }
}

/// Browsers always send `Origin`; it must name the host being connected to.
/// Clients that send none are let through.
fn origin_allowed(headers: &HeaderMap) -> bool {
    let Some(origin) = headers.get(header::ORIGIN) else {
        return true;
    };
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());

    let origin_host = origin
        .to_str()
        .ok()
        .and_then(|o| o.parse::<Uri>().ok())
        .and_then(|uri| host_and_port(&uri));

    match (origin_host, host) {
        (Some(origin), Some(host)) => origin.eq_ignore_ascii_case(host),
        _ => false,
    }
}

/// GET /ws?room=&token=: upgrade to the chat gateway.
pub async fn chat_ws(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let settings = state.settings.current();
    if !settings.enabled {
        let body = ApiResponse::<()>::failure(ChatError::FeatureDisabled(Feature::Room).to_string());
        return (StatusCode::FORBIDDEN, Json(body)).into_response();
    }

    if !origin_allowed(&headers) {
        warn!("Rejected gateway handshake from foreign origin {:?}", headers.get(header::ORIGIN));
        return ChatError::Forbidden.into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let room = normalize_room(&query.room);
    let hub = state.hub.clone();
    let handler = Arc::new(ChatFrames::new(state));
    ws.protocols(["chat"])
        .max_message_size(MAX_INCOMING_BYTES)
        .on_upgrade(move |socket| connection::handle_connection(socket, hub, handler, caller, room))
}
