use axum::{
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    routing::{get, put},
    Json, Router,
};
use tracing::{instrument, warn};

use crate::{
    auth::middleware::AuthUser,
    error::AppError,
    profile::{
        dto::{ProfileResponse, ProfileUpdateRequest},
        services,
    },
    state::AppState,
    storage::ImageUpload,
};

pub fn profile_routes() -> Router<AppState> {
    Router::new()
        .route("/profile/me", get(get_me))
        .route(
            "/profile/update",
            put(update_me).layer(DefaultBodyLimit::max(20 * 1024 * 1024)), // 20MB
        )
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<ProfileResponse>, AppError> {
    let user = services::get_profile(state.users.as_ref(), user_id).await?;
    Ok(Json(user.into()))
}

/// Parts of the `PUT /profile/update` multipart body.
#[derive(Debug, Default)]
struct UpdateForm {
    data: ProfileUpdateRequest,
    avatar: Option<ImageUpload>,
    cover: Option<ImageUpload>,
}

async fn read_form(mut mp: Multipart) -> Result<UpdateForm, AppError> {
    let mut form = UpdateForm::default();
    while let Some(field) = mp.next_field().await.map_err(|e| {
        warn!(error = %e, "malformed multipart body");
        AppError::validation("Malformed multipart body")
    })? {
        let name = field.name().map(|s| s.to_string());
        match name.as_deref() {
            Some("data") => {
                let text = field
                    .text()
                    .await
                    .map_err(|_| AppError::validation("Unreadable profile data"))?;
                if !text.trim().is_empty() {
                    form.data = serde_json::from_str(&text)
                        .map_err(|_| AppError::validation("Invalid profile data"))?;
                }
            }
            Some(part @ ("avatar" | "coverImage")) => {
                let content_type = field
                    .content_type()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "application/octet-stream".into());
                let body = field
                    .bytes()
                    .await
                    .map_err(|_| AppError::validation("Unreadable image upload"))?;
                let upload = Some(ImageUpload { body, content_type });
                if part == "avatar" {
                    form.avatar = upload;
                } else {
                    form.cover = upload;
                }
            }
            _ => {}
        }
    }
    Ok(form)
}

#[instrument(skip(state, mp))]
pub async fn update_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    mp: Result<Multipart, MultipartRejection>,
) -> Result<Json<ProfileResponse>, AppError> {
    let form = read_form(mp?).await?;
    let user = services::update_profile(
        state.users.as_ref(),
        state.images.as_ref(),
        user_id,
        form.data,
        form.avatar,
        form.cover,
    )
    .await?;
    Ok(Json(user.into()))
}
