use anyhow::Context;
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use thiserror::Error;

use crate::auth::repo_types::{NewUser, User};

const USER_COLUMNS: &str =
    "id, email, username, password_hash, avatar, cover_image, bio, created_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UniqueField {
    Email,
    Username,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unique constraint violated on {0:?}")]
    Conflict(UniqueField),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Durable store of user records. Owns uniqueness of email and username.
#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn exists_by_email(&self, email: &str) -> StoreResult<bool>;
    async fn exists_by_username(&self, username: &str) -> StoreResult<bool>;
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;
    async fn find_by_username(&self, username: &str) -> StoreResult<Option<User>>;
    async fn find_by_id(&self, id: i64) -> StoreResult<Option<User>>;

    /// Inserts a user; `id` and `created_at` are assigned here.
    async fn insert(&self, new: NewUser) -> StoreResult<User>;

    /// Starts a transaction for a read-check-update sequence.
    async fn begin(&self) -> StoreResult<Box<dyn UserTx>>;
}

/// Open transaction over the user table. Dropping it without `commit`
/// rolls back every change made through it.
#[async_trait]
pub trait UserTx: Send {
    /// Loads the row and holds it locked until the transaction ends.
    async fn lock_by_id(&mut self, id: i64) -> StoreResult<Option<User>>;
    async fn username_taken_by_other(&mut self, username: &str, id: i64) -> StoreResult<bool>;
    async fn update(&mut self, user: &User) -> StoreResult<User>;
    async fn commit(self: Box<Self>) -> StoreResult<()>;
}

/// Postgres-backed user store.
#[derive(Clone)]
pub struct PgUserRepo {
    db: PgPool,
}

impl PgUserRepo {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

fn map_sqlx(err: sqlx::Error, what: &'static str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            match db_err.constraint() {
                Some("users_email_key") => return StoreError::Conflict(UniqueField::Email),
                Some("users_username_key") => return StoreError::Conflict(UniqueField::Username),
                _ => {}
            }
        }
    }
    StoreError::Backend(anyhow::Error::new(err).context(what))
}

#[async_trait]
impl UserRepo for PgUserRepo {
    async fn exists_by_email(&self, email: &str) -> StoreResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE email = $1)")
                .bind(normalize_email(email))
                .fetch_one(&self.db)
                .await
                .map_err(|e| map_sqlx(e, "exists_by_email"))?;
        Ok(exists)
    }

    async fn exists_by_username(&self, username: &str) -> StoreResult<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM users WHERE username = $1)")
                .bind(username)
                .fetch_one(&self.db)
                .await
                .map_err(|e| map_sqlx(e, "exists_by_username"))?;
        Ok(exists)
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        sqlx::query_as::<_, User>(&sql)
            .bind(normalize_email(email))
            .fetch_optional(&self.db)
            .await
            .map_err(|e| map_sqlx(e, "find_by_email"))
    }

    async fn find_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE username = $1");
        sqlx::query_as::<_, User>(&sql)
            .bind(username)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| map_sqlx(e, "find_by_username"))
    }

    async fn find_by_id(&self, id: i64) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await
            .map_err(|e| map_sqlx(e, "find_by_id"))
    }

    async fn insert(&self, new: NewUser) -> StoreResult<User> {
        let sql = format!(
            r#"
            INSERT INTO users (email, username, password_hash)
            VALUES ($1, $2, $3)
            RETURNING {USER_COLUMNS}
            "#
        );
        sqlx::query_as::<_, User>(&sql)
            .bind(normalize_email(&new.email))
            .bind(&new.username)
            .bind(&new.password_hash)
            .fetch_one(&self.db)
            .await
            .map_err(|e| map_sqlx(e, "insert user"))
    }

    async fn begin(&self) -> StoreResult<Box<dyn UserTx>> {
        let tx = self
            .db
            .begin()
            .await
            .context("begin tx")
            .map_err(StoreError::Backend)?;
        Ok(Box::new(PgUserTx { tx }))
    }
}

struct PgUserTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UserTx for PgUserTx {
    async fn lock_by_id(&mut self, id: i64) -> StoreResult<Option<User>> {
        let sql = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 FOR UPDATE");
        sqlx::query_as::<_, User>(&sql)
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx(e, "lock user"))
    }

    async fn username_taken_by_other(&mut self, username: &str, id: i64) -> StoreResult<bool> {
        let taken: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM users WHERE username = $1 AND id <> $2)",
        )
        .bind(username)
        .bind(id)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx(e, "username_taken_by_other"))?;
        Ok(taken)
    }

    async fn update(&mut self, user: &User) -> StoreResult<User> {
        // created_at is never rewritten.
        let sql = format!(
            r#"
            UPDATE users
               SET email = $2, username = $3, password_hash = $4,
                   avatar = $5, cover_image = $6, bio = $7
             WHERE id = $1
            RETURNING {USER_COLUMNS}
            "#
        );
        sqlx::query_as::<_, User>(&sql)
            .bind(user.id)
            .bind(normalize_email(&user.email))
            .bind(&user.username)
            .bind(&user.password_hash)
            .bind(&user.avatar)
            .bind(&user.cover_image)
            .bind(&user.bio)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx(e, "update user"))
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await.map_err(|e| map_sqlx(e, "commit tx"))
    }
}
