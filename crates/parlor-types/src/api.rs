use serde::{Deserialize, Serialize};

// -- JWT Claims --

/// JWT claims issued by the host application. Shared by the REST middleware
/// and the gateway handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: i64,
    pub username: String,
    #[serde(default)]
    pub admin: bool,
    pub exp: usize,
}

/// The resolved identity behind a request or connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Caller {
    /// 0 for anonymous callers.
    pub user_id: i64,
    pub username: String,
    pub admin: bool,
}

impl Caller {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_id <= 0
    }
}

impl From<Claims> for Caller {
    fn from(claims: Claims) -> Self {
        Self {
            user_id: claims.sub,
            username: claims.username,
            admin: claims.admin,
        }
    }
}

// -- Response envelope --

/// Envelope for every JSON endpoint. Failures keep HTTP 200 and carry the
/// reason in `message`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: String::new(),
            data: Some(data),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
        }
    }
}

// -- Messages --

/// Paging parameters arrive as raw strings: anything that is not a positive
/// integer counts as absent.
#[derive(Debug, Default, Deserialize)]
pub struct ListMessagesQuery {
    #[serde(default)]
    pub room: String,
    pub limit: Option<String>,
    /// Cursor: only messages with a smaller id are returned.
    pub before_id: Option<String>,
}

impl ListMessagesQuery {
    pub fn limit(&self) -> Option<usize> {
        positive(self.limit.as_deref()).map(|n| n as usize)
    }

    pub fn before_id(&self) -> Option<i64> {
        positive(self.before_id.as_deref())
    }
}

fn positive(raw: Option<&str>) -> Option<i64> {
    raw?.trim().parse::<i64>().ok().filter(|n| *n > 0)
}

#[derive(Debug, Default, Deserialize)]
pub struct RoomQuery {
    #[serde(default)]
    pub room: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: i64,
    pub enabled: bool,
}

// -- Attachments --

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub url: String,
    pub bytes: u64,
    pub content_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

// -- Settings --

#[derive(Debug, Deserialize)]
pub struct AnnouncementRequest {
    pub announcement: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AnnouncementResponse {
    pub announcement: String,
}
