use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use parlor_types::api::{ApiResponse, UploadResponse};

use crate::attachments::{self, AttachmentKind, StoredAttachment, TEXT_MAX_BYTES};
use crate::error::{ChatError, Feature};
use crate::state::AppState;

const CACHE_FOREVER: &str = "public, max-age=31536000, immutable";

/// Find the `file` field and stream it into the attachment store.
async fn store_upload(
    state: &AppState,
    multipart: &mut Multipart,
    kind: AttachmentKind,
    limit: u64,
) -> Result<(StoredAttachment, Option<String>), ChatError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| ChatError::InvalidRequest)?
    {
        if field.name() != Some("file") {
            continue;
        }
        let original_name = field.file_name().map(str::to_string);
        let stored = state.attachments.store(kind, field, limit).await?;
        return Ok((stored, original_name));
    }
    Err(ChatError::InvalidRequest)
}

/// POST /images: multipart `file`, typed by content.
pub async fn upload_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<UploadResponse>>, ChatError> {
    let settings = state.settings.current();
    if !settings.enabled {
        return Err(ChatError::FeatureDisabled(Feature::Room));
    }
    if !settings.image_enabled {
        return Err(ChatError::FeatureDisabled(Feature::Images));
    }

    let limit = settings.effective_image_max_bytes();
    let (stored, _) = store_upload(&state, &mut multipart, AttachmentKind::Image, limit).await?;
    info!("Image uploaded: {} ({} bytes)", stored.url, stored.bytes);

    Ok(Json(ApiResponse::ok(UploadResponse {
        url: stored.url,
        bytes: stored.bytes,
        content_type: stored.content_type,
        file_name: None,
    })))
}

/// POST /files: multipart `file`, UTF-8 text up to 1 MiB.
pub async fn upload_text(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<ApiResponse<UploadResponse>>, ChatError> {
    if !state.settings.current().enabled {
        return Err(ChatError::FeatureDisabled(Feature::Room));
    }

    let (stored, original_name) =
        store_upload(&state, &mut multipart, AttachmentKind::Text, TEXT_MAX_BYTES).await?;
    info!("Text file uploaded: {} ({} bytes)", stored.url, stored.bytes);

    Ok(Json(ApiResponse::ok(UploadResponse {
        url: stored.url,
        bytes: stored.bytes,
        content_type: stored.content_type,
        file_name: Some(original_name.unwrap_or(stored.file_name)),
    })))
}

/// GET /images/{date}/{name}: streams a stored attachment.
pub async fn get_attachment(
    State(state): State<AppState>,
    Path((date, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ChatError> {
    let referer = headers.get(header::REFERER).and_then(|v| v.to_str().ok());
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    if !attachments::referer_allowed(&state.settings.current(), referer, host) {
        debug!("Hotlink blocked for {}/{} from {:?}", date, name, referer);
        return Err(ChatError::Forbidden);
    }

    let path = state.attachments.resolve(&date, &name).await?;
    let file = tokio::fs::File::open(&path)
        .await
        .map_err(ChatError::AttachmentIoFailed)?;
    let len = file
        .metadata()
        .await
        .map_err(ChatError::AttachmentIoFailed)?
        .len();

    let headers = [
        (
            header::CONTENT_TYPE,
            HeaderValue::from_static(attachments::content_type_for(&name)),
        ),
        (header::CACHE_CONTROL, HeaderValue::from_static(CACHE_FOREVER)),
        (header::CONTENT_LENGTH, HeaderValue::from(len)),
    ];
    Ok((headers, Body::from_stream(ReaderStream::new(file))).into_response())
}
