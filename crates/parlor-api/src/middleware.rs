use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    extract::{Query, Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::Deserialize;

use parlor_types::api::{Caller, Claims};

use crate::error::ChatError;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Bearer header first, then `?token=` (browsers cannot set headers on a
/// WebSocket handshake).
fn extract_token(req: &Request) -> Option<String> {
    if let Some(value) = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        if let Some(token) = value.strip_prefix("Bearer ") {
            return Some(token.trim().to_string());
        }
    }

    Query::<TokenQuery>::try_from_uri(req.uri())
        .ok()
        .and_then(|Query(q)| q.token)
        .filter(|t| !t.is_empty())
}

pub fn verify_token(secret: &str, token: &str) -> Result<Caller, ChatError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| Caller::from(data.claims))
    .map_err(|_| ChatError::Unauthorized)
}

/// Mint a token the way the host application does. Used by tests and local
/// tooling.
pub fn create_token(secret: &str, caller: &Caller, ttl: Duration) -> anyhow::Result<String> {
    let exp = SystemTime::now().duration_since(UNIX_EPOCH)? + ttl;
    let claims = Claims {
        sub: caller.user_id,
        username: caller.username.clone(),
        admin: caller.admin,
        exp: exp.as_secs() as usize,
    };
    Ok(encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )?)
}

/// Resolve the caller for every request. No token means anonymous; a bad
/// token is rejected.
pub async fn identify(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ChatError> {
    let caller = match extract_token(&req) {
        Some(token) => verify_token(&state.jwt_secret, &token)?,
        None => Caller::anonymous(),
    };

    req.extensions_mut().insert(caller);
    Ok(next.run(req).await)
}

pub async fn require_user(req: Request, next: Next) -> Result<Response, ChatError> {
    match req.extensions().get::<Caller>() {
        Some(caller) if !caller.is_anonymous() => Ok(next.run(req).await),
        _ => Err(ChatError::Unauthorized),
    }
}

pub async fn require_admin(req: Request, next: Next) -> Result<Response, ChatError> {
    match req.extensions().get::<Caller>() {
        Some(caller) if caller.is_anonymous() => Err(ChatError::Unauthorized),
        Some(caller) if caller.admin => Ok(next.run(req).await),
        Some(_) => Err(ChatError::Forbidden),
        None => Err(ChatError::Unauthorized),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        let caller = Caller {
            user_id: 9,
            username: "nine".into(),
            admin: true,
        };
        let token = create_token("s3cret", &caller, Duration::from_secs(60)).unwrap();
        assert_eq!(verify_token("s3cret", &token).unwrap(), caller);
        assert!(matches!(
            verify_token("other", &token),
            Err(ChatError::Unauthorized)
        ));
    }

    #[test]
    fn test_token_sources() {
        let req = Request::builder()
            .uri("/api/chat/ws?room=a&token=abc")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_token(&req).as_deref(), Some("abc"));

        let req = Request::builder()
            .uri("/api/chat/ws?token=fromquery")
            .header(header::AUTHORIZATION, "Bearer fromheader")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_token(&req).as_deref(), Some("fromheader"));

        let req = Request::builder()
            .uri("/api/chat/config")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(extract_token(&req), None);
    }
}
