use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, warn};

use crate::{
    auth::{
        dto::{LoginRequest, RegisterRequest},
        jwt::JwtKeys,
        password::{hash_password, verify_password_or_dummy},
        repo::{normalize_email, UserRepo},
        repo_types::NewUser,
    },
    error::AppError,
};

pub(crate) fn is_valid_email(email: &str) -> bool {
    lazy_static! {
        static ref EMAIL_RE: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
    }
    EMAIL_RE.is_match(email)
}

/// Creates the account and returns a session token for it.
pub async fn register(
    repo: &dyn UserRepo,
    keys: &JwtKeys,
    payload: RegisterRequest,
) -> Result<String, AppError> {
    let email = normalize_email(&payload.email);
    let username = payload.username.trim().to_string();

    if !is_valid_email(&email) {
        warn!("invalid email");
        return Err(AppError::validation("Invalid email"));
    }
    if username.is_empty() {
        return Err(AppError::validation("Username is required"));
    }
    if payload.password.trim().is_empty() {
        return Err(AppError::validation("Password is required"));
    }

    if repo.exists_by_email(&email).await? {
        warn!("email already registered");
        return Err(AppError::EmailTaken);
    }
    if repo.exists_by_username(&username).await? {
        warn!(username = %username, "username already taken");
        return Err(AppError::UsernameTaken);
    }

    let password_hash = hash_password(&payload.password)?;

    // A racing registration still trips the unique constraint here.
    let user = repo
        .insert(NewUser {
            email,
            username,
            password_hash,
        })
        .await?;

    let token = keys.issue(user.id).map_err(AppError::Internal)?;
    info!(user_id = user.id, "user registered");
    Ok(token)
}

/// Verifies credentials and returns a fresh session token. Unknown
/// identifiers and wrong passwords fail identically.
pub async fn login(
    repo: &dyn UserRepo,
    keys: &JwtKeys,
    payload: LoginRequest,
) -> Result<String, AppError> {
    let identifier = payload.identifier.trim();
    if identifier.is_empty() || payload.password.is_empty() {
        return Err(AppError::InvalidCredentials);
    }

    let found = if identifier.contains('@') {
        repo.find_by_email(identifier).await?
    } else {
        repo.find_by_username(identifier).await?
    };

    // Argon2 runs on both paths so response time does not reveal which
    // identifiers exist.
    let stored = found.as_ref().map(|u| u.password_hash.as_str());
    let ok = verify_password_or_dummy(&payload.password, stored);
    let user = match found {
        Some(user) if ok => user,
        Some(user) => {
            warn!(user_id = user.id, "login invalid password");
            return Err(AppError::InvalidCredentials);
        }
        None => {
            warn!("login unknown identifier");
            return Err(AppError::InvalidCredentials);
        }
    };

    let token = keys.issue(user.id).map_err(AppError::Internal)?;
    info!(user_id = user.id, "user logged in");
    Ok(token)
}
