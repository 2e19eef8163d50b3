//! Resolves the calling user for the item routes and the WebSocket upgrade.
//!
//! Identity is trusted from a header set by the auth layer in front of this
//! server. Requests without a usable user id get `401`.

use axum::{
    body::Body,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::Response,
};

/// Header carrying the authenticated user id.
pub const USER_HEADER: &str = "X-Todosync-User";

/// Longest accepted user id.
pub const MAX_USER_ID_LEN: usize = 128;

/// The authenticated user, stored in request extensions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserContext(pub String);

/// Reads the user id from `X-Todosync-User` or `Authorization: Bearer`.
///
/// Session issuance is owned by an outer auth layer; by the time a request
/// reaches this server the bearer token *is* the user id.
pub fn user_from_headers(headers: &HeaderMap) -> Result<String, StatusCode> {
    let user = if let Some(val) = headers.get(USER_HEADER) {
        val.to_str()
            .map_err(|_| StatusCode::UNAUTHORIZED)?
            .to_string()
    } else if let Some(val) = headers.get(axum::http::header::AUTHORIZATION) {
        let val_str = val.to_str().map_err(|_| StatusCode::UNAUTHORIZED)?;
        match val_str.strip_prefix("Bearer ") {
            Some(token) => token.to_string(),
            None => return Err(StatusCode::UNAUTHORIZED),
        }
    } else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    validate_user_id(user)
}

/// Rejects empty or oversized user ids.
pub fn validate_user_id(user: String) -> Result<String, StatusCode> {
    let trimmed = user.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_USER_ID_LEN {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(trimmed.to_string())
}

/// Middleware that requires an authenticated user.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let user = user_from_headers(req.headers())?;
    req.extensions_mut().insert(UserContext(user));
    Ok(next.run(req).await)
}
