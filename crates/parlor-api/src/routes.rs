use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};

use parlor_types::models::MAX_IMAGE_MAX_BYTES;

use crate::middleware::{identify, require_admin, require_user};
use crate::state::AppState;
use crate::{files, messages, settings, ws};

/// Room left for multipart boundaries and part headers.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Ceiling for multipart bodies: the largest file any setting allows plus
/// framing. The per-kind limits are enforced while streaming.
const UPLOAD_BODY_LIMIT: usize = MAX_IMAGE_MAX_BYTES as usize + MULTIPART_OVERHEAD;

/// Every chat route, nested under `/api/chat`.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/config", get(settings::get_config))
        .route("/count", get(messages::message_count))
        .route(
            "/messages",
            get(messages::list_messages).post(messages::post_message),
        )
        .route("/ws", get(ws::chat_ws))
        .route("/images/{date}/{name}", get(files::get_attachment));

    let upload_routes = Router::new()
        .route("/images", post(files::upload_image))
        .route("/files", post(files::upload_text))
        .route_layer(middleware::from_fn(require_user))
        .layer(DefaultBodyLimit::max(UPLOAD_BODY_LIMIT));

    let admin_routes = Router::new()
        .route("/announcement", post(settings::set_announcement))
        .route(
            "/setting",
            get(settings::get_settings).put(settings::update_settings),
        )
        .route_layer(middleware::from_fn(require_admin));

    let chat = Router::new()
        .merge(public_routes)
        .merge(upload_routes)
        .merge(admin_routes)
        .route_layer(middleware::from_fn_with_state(state.clone(), identify))
        .with_state(state);

    Router::new().nest("/api/chat", chat)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachments::TEXT_MAX_BYTES;
    use parlor_types::models::RoomSettings;

    #[test]
    fn test_body_limit_admits_every_allowed_upload() {
        let settings = RoomSettings {
            image_max_bytes: i64::MAX,
            ..Default::default()
        };
        let largest = settings.effective_image_max_bytes().max(TEXT_MAX_BYTES);
        assert!(largest + MULTIPART_OVERHEAD as u64 <= UPLOAD_BODY_LIMIT as u64);
    }
}
