use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use tracing::{debug, instrument};

use crate::{
    auth::{
        cookies::{clear_session_cookie, session_cookie, set_cookie_header},
        dto::{LoginRequest, MessageResponse, RegisterRequest},
        services,
    },
    error::AppError,
    state::AppState,
};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/logout", post(logout))
}

fn with_session(state: &AppState, token: &str) -> HeaderMap {
    let cookie = session_cookie(token, state.jwt.ttl, state.config.cookie_secure);
    set_cookie_header(&cookie)
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(HeaderMap, Json<MessageResponse>), AppError> {
    let Json(payload) = payload?;
    let token = services::register(state.users.as_ref(), &state.jwt, payload).await?;
    Ok((
        with_session(&state, &token),
        Json(MessageResponse {
            message: "Registration successful",
        }),
    ))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<(HeaderMap, Json<MessageResponse>), AppError> {
    // an unreadable login body fails like any other bad credential
    let Json(payload) = payload.map_err(|rejection| {
        debug!(error = %rejection.body_text(), "rejected login body");
        AppError::InvalidCredentials
    })?;
    let token = services::login(state.users.as_ref(), &state.jwt, payload).await?;
    Ok((
        with_session(&state, &token),
        Json(MessageResponse {
            message: "Login successful",
        }),
    ))
}

#[instrument(skip(state))]
pub async fn logout(State(state): State<AppState>) -> (HeaderMap, Json<MessageResponse>) {
    let cookie = clear_session_cookie(state.config.cookie_secure);
    (
        set_cookie_header(&cookie),
        Json(MessageResponse {
            message: "Logged out",
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_response_serialization() {
        let json = serde_json::to_string(&MessageResponse { message: "Logged out" }).unwrap();
        assert_eq!(json, r#"{"message":"Logged out"}"#);
    }

    #[tokio::test]
    async fn login_sets_session_cookie() {
        let state = AppState::fake();
        services::register(
            state.users.as_ref(),
            &state.jwt,
            RegisterRequest {
                email: "a@x.com".into(),
                username: "alice".into(),
                password: "p1".into(),
            },
        )
        .await
        .unwrap();

        let (headers, Json(body)) = login(
            State(state.clone()),
            Ok(Json(LoginRequest {
                identifier: "alice".into(),
                password: "p1".into(),
            })),
        )
        .await
        .unwrap();
        assert_eq!(body.message, "Login successful");
        let set_cookie = headers
            .get(axum::http::header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert!(set_cookie.starts_with("authToken="));
        assert!(set_cookie.contains("HttpOnly"));
        assert!(set_cookie.contains("SameSite=Lax"));
    }
}
