use tracing::{info, warn};

use crate::{
    auth::{
        password::hash_password,
        repo::{StoreResult, UserRepo, UserTx},
        repo_types::User,
    },
    error::AppError,
    images::services::{discard_uploaded, replace_image},
    profile::dto::ProfileUpdateRequest,
    storage::{ext_from_mime, ImageCategory, ImageStore, ImageUpload},
};

pub const MAX_BIO_CHARS: usize = 500;

pub async fn get_profile(repo: &dyn UserRepo, user_id: i64) -> Result<User, AppError> {
    repo.find_by_id(user_id).await?.ok_or(AppError::UserNotFound)
}

fn non_empty(image: Option<ImageUpload>) -> Option<ImageUpload> {
    image.filter(|i| !i.is_empty())
}

fn check_image(image: &ImageUpload) -> Result<(), AppError> {
    match ext_from_mime(&image.content_type) {
        Some(_) => Ok(()),
        None => Err(AppError::validation("Unsupported image type")),
    }
}

async fn persist(mut tx: Box<dyn UserTx>, user: &User) -> StoreResult<User> {
    let saved = tx.update(user).await?;
    tx.commit().await?;
    Ok(saved)
}

/// Applies a profile update inside one store transaction.
///
/// Nothing is written unless every step succeeds. Images uploaded before a
/// later failure are removed again on a best-effort basis.
pub async fn update_profile(
    repo: &dyn UserRepo,
    images: &dyn ImageStore,
    user_id: i64,
    req: ProfileUpdateRequest,
    avatar: Option<ImageUpload>,
    cover: Option<ImageUpload>,
) -> Result<User, AppError> {
    let mut tx = repo.begin().await?;
    let mut user = tx.lock_by_id(user_id).await?.ok_or(AppError::UserNotFound)?;

    if let Some(name) = req.username.as_deref().map(str::trim).filter(|n| !n.is_empty()) {
        if name != user.username {
            if tx.username_taken_by_other(name, user.id).await? {
                warn!(user_id, username = %name, "username already taken");
                return Err(AppError::UsernameTaken);
            }
            user.username = name.to_string();
        }
    }

    if let Some(bio) = req.bio {
        if bio.chars().count() > MAX_BIO_CHARS {
            return Err(AppError::validation(format!(
                "Bio must be at most {MAX_BIO_CHARS} characters"
            )));
        }
        user.bio = Some(bio);
    }

    if let Some(password) = req.password.filter(|p| !p.trim().is_empty()) {
        user.password_hash = hash_password(&password)?;
    }

    let avatar = non_empty(avatar);
    let cover = non_empty(cover);
    for image in avatar.iter().chain(cover.iter()) {
        check_image(image)?;
    }

    let mut uploaded: Vec<String> = Vec::new();

    if let Some(image) = avatar {
        let public_ref = replace_image(images, user.avatar.as_deref(), image, ImageCategory::Avatar)
            .await
            .map_err(AppError::StorageUnavailable)?;
        uploaded.push(public_ref.clone());
        user.avatar = Some(public_ref);
    }

    if let Some(image) = cover {
        match replace_image(images, user.cover_image.as_deref(), image, ImageCategory::Cover).await {
            Ok(public_ref) => {
                uploaded.push(public_ref.clone());
                user.cover_image = Some(public_ref);
            }
            Err(e) => {
                discard_uploaded(images, &uploaded).await;
                return Err(AppError::StorageUnavailable(e));
            }
        }
    }

    match persist(tx, &user).await {
        Ok(saved) => {
            info!(user_id, "profile updated");
            Ok(saved)
        }
        Err(e) => {
            discard_uploaded(images, &uploaded).await;
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use bytes::Bytes;

    use super::*;
    use crate::{
        auth::{password::verify_password, repo_memory::MemoryUserRepo, repo_types::NewUser},
        storage::MemoryImageStore,
    };

    async fn seed(repo: &MemoryUserRepo, email: &str, username: &str) -> User {
        repo.insert(NewUser {
            email: email.into(),
            username: username.into(),
            password_hash: hash_password("p1").unwrap(),
        })
        .await
        .unwrap()
    }

    fn png() -> Option<ImageUpload> {
        Some(ImageUpload {
            body: Bytes::from_static(b"\x89PNG"),
            content_type: "image/png".into(),
        })
    }

    fn bio(text: &str) -> ProfileUpdateRequest {
        ProfileUpdateRequest {
            bio: Some(text.into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn bio_only_update_leaves_everything_else() {
        let repo = MemoryUserRepo::new();
        let images = MemoryImageStore::new();
        let alice = seed(&repo, "a@x.com", "alice").await;

        let updated = update_profile(&repo, &images, alice.id, bio("hi"), None, None)
            .await
            .unwrap();
        assert_eq!(updated.bio.as_deref(), Some("hi"));

        let stored = repo.find_by_id(alice.id).await.unwrap().unwrap();
        assert_eq!(stored.bio.as_deref(), Some("hi"));
        assert_eq!(stored.username, alice.username);
        assert_eq!(stored.password_hash, alice.password_hash);
        assert_eq!(stored.avatar, None);
        assert_eq!(stored.cover_image, None);
        assert_eq!(stored.created_at, alice.created_at);
        assert!(images.uploaded().is_empty());
    }

    #[tokio::test]
    async fn empty_bio_replaces_existing() {
        let repo = MemoryUserRepo::new();
        let images = MemoryImageStore::new();
        let alice = seed(&repo, "a@x.com", "alice").await;
        update_profile(&repo, &images, alice.id, bio("hi"), None, None).await.unwrap();
        let updated = update_profile(&repo, &images, alice.id, bio(""), None, None)
            .await
            .unwrap();
        assert_eq!(updated.bio.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn taken_username_rolls_back_whole_update() {
        let repo = MemoryUserRepo::new();
        let images = MemoryImageStore::new();
        let alice = seed(&repo, "a@x.com", "alice").await;
        seed(&repo, "b@x.com", "bob").await;

        let req = ProfileUpdateRequest {
            username: Some("bob".into()),
            bio: Some("new bio".into()),
            password: Some("changed".into()),
        };
        let err = update_profile(&repo, &images, alice.id, req, png(), png())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UsernameTaken));

        let stored = repo.find_by_id(alice.id).await.unwrap().unwrap();
        assert_eq!(stored, alice);
        assert!(images.uploaded().is_empty());
    }

    #[tokio::test]
    async fn blank_or_unchanged_username_is_ignored() {
        let repo = MemoryUserRepo::new();
        let images = MemoryImageStore::new();
        let alice = seed(&repo, "a@x.com", "alice").await;
        for name in ["   ", "alice"] {
            let req = ProfileUpdateRequest {
                username: Some(name.into()),
                ..Default::default()
            };
            let updated = update_profile(&repo, &images, alice.id, req, None, None)
                .await
                .unwrap();
            assert_eq!(updated.username, "alice");
        }
    }

    #[tokio::test]
    async fn username_and_password_change() {
        let repo = MemoryUserRepo::new();
        let images = MemoryImageStore::new();
        let alice = seed(&repo, "a@x.com", "alice").await;

        let req = ProfileUpdateRequest {
            username: Some(" alicia ".into()),
            password: Some("p2".into()),
            ..Default::default()
        };
        let updated = update_profile(&repo, &images, alice.id, req, None, None)
            .await
            .unwrap();
        assert_eq!(updated.username, "alicia");
        assert!(verify_password("p2", &updated.password_hash).unwrap());
        assert!(!verify_password("p1", &updated.password_hash).unwrap());
        assert!(repo.find_by_username("alice").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bio_over_limit_is_rejected() {
        let repo = MemoryUserRepo::new();
        let images = MemoryImageStore::new();
        let alice = seed(&repo, "a@x.com", "alice").await;

        let at_limit = "é".repeat(MAX_BIO_CHARS);
        assert!(update_profile(&repo, &images, alice.id, bio(&at_limit), None, None)
            .await
            .is_ok());

        let over = "x".repeat(MAX_BIO_CHARS + 1);
        let err = update_profile(&repo, &images, alice.id, bio(&over), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let stored = repo.find_by_id(alice.id).await.unwrap().unwrap();
        assert_eq!(stored.bio.as_deref(), Some(at_limit.as_str()));
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let repo = MemoryUserRepo::new();
        let images = MemoryImageStore::new();
        let err = update_profile(&repo, &images, 99, bio("hi"), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UserNotFound));
        assert!(matches!(get_profile(&repo, 99).await, Err(AppError::UserNotFound)));

        let pdf = Some(ImageUpload {
            body: Bytes::from_static(b"%PDF"),
            content_type: "application/pdf".into(),
        });
        let err = update_profile(&repo, &images, 99, Default::default(), pdf, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::UserNotFound));
    }

    #[tokio::test]
    async fn avatar_replacement_deletes_previous() {
        let repo = MemoryUserRepo::new();
        let images = MemoryImageStore::new();
        let alice = seed(&repo, "a@x.com", "alice").await;

        let first = update_profile(&repo, &images, alice.id, Default::default(), png(), None)
            .await
            .unwrap();
        let first_ref = first.avatar.clone().unwrap();
        assert!(images.deleted().is_empty());

        let second = update_profile(&repo, &images, alice.id, Default::default(), png(), None)
            .await
            .unwrap();
        assert_eq!(images.deleted(), vec![first_ref.clone()]);
        assert_ne!(second.avatar, Some(first_ref));
        assert_eq!(second.cover_image, None);
    }

    #[tokio::test]
    async fn failed_delete_still_replaces_image() {
        let repo = MemoryUserRepo::new();
        let images = MemoryImageStore::new();
        let alice = seed(&repo, "a@x.com", "alice").await;
        update_profile(&repo, &images, alice.id, Default::default(), None, png())
            .await
            .unwrap();

        images.fail_deletes.store(true, Ordering::SeqCst);
        let updated = update_profile(&repo, &images, alice.id, Default::default(), None, png())
            .await
            .unwrap();
        assert_eq!(images.uploaded().len(), 2);
        assert_eq!(updated.cover_image.as_deref(), images.uploaded().last().map(String::as_str));
    }

    #[tokio::test]
    async fn failed_upload_aborts_without_changes() {
        let repo = MemoryUserRepo::new();
        let images = MemoryImageStore::new();
        let alice = seed(&repo, "a@x.com", "alice").await;

        images.fail_uploads.store(true, Ordering::SeqCst);
        let err = update_profile(&repo, &images, alice.id, bio("hi"), png(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::StorageUnavailable(_)));
        assert_eq!(repo.find_by_id(alice.id).await.unwrap().unwrap(), alice);
    }

    #[tokio::test]
    async fn empty_and_unsupported_files() {
        let repo = MemoryUserRepo::new();
        let images = MemoryImageStore::new();
        let alice = seed(&repo, "a@x.com", "alice").await;

        let empty = Some(ImageUpload {
            body: Bytes::new(),
            content_type: "image/png".into(),
        });
        let updated = update_profile(&repo, &images, alice.id, Default::default(), empty, None)
            .await
            .unwrap();
        assert_eq!(updated.avatar, None);

        let pdf = Some(ImageUpload {
            body: Bytes::from_static(b"%PDF"),
            content_type: "application/pdf".into(),
        });
        let err = update_profile(&repo, &images, alice.id, Default::default(), pdf, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert!(images.uploaded().is_empty());
    }
}
