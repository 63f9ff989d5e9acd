use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::request::Parts,
    middleware::Next,
    response::Response,
};
use tracing::debug;

use super::{cookies::extract_session_token, jwt::JwtKeys};
use crate::error::AppError;

/// Identity established for the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    pub user_id: i64,
}

/// Resolves the session cookie into a [`Principal`] request extension.
///
/// Requests without a cookie, or with a token that fails verification,
/// continue anonymously; handlers that need identity use [`AuthUser`].
pub async fn session_auth(State(keys): State<JwtKeys>, mut req: Request, next: Next) -> Response {
    if let Some(principal) = resolve_principal(&keys, req.headers()) {
        req.extensions_mut().insert(principal);
    }
    next.run(req).await
}

pub fn resolve_principal(keys: &JwtKeys, headers: &axum::http::HeaderMap) -> Option<Principal> {
    let token = extract_session_token(headers)?;
    let subject = match keys.verify(&token) {
        Ok(sub) => sub,
        Err(_) => {
            debug!("session token rejected; continuing anonymously");
            return None;
        }
    };
    match subject.parse::<i64>() {
        Ok(user_id) => Some(Principal { user_id }),
        Err(_) => {
            debug!(%subject, "non-numeric token subject; continuing anonymously");
            None
        }
    }
}

/// Extracts the authenticated user ID, rejecting anonymous requests.
pub struct AuthUser(pub i64);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Principal>()
            .map(|p| AuthUser(p.user_id))
            .ok_or(AppError::Unauthorized)
    }
}
