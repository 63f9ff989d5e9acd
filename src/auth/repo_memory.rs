use std::{collections::BTreeMap, sync::Arc};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::auth::{
    repo::{normalize_email, StoreError, StoreResult, UniqueField, UserRepo, UserTx},
    repo_types::{NewUser, User},
};

#[derive(Default)]
struct Table {
    next_id: i64,
    rows: BTreeMap<i64, User>,
}

impl Table {
    fn conflict_for(&self, user: &User) -> Option<UniqueField> {
        self.rows.values().filter(|u| u.id != user.id).find_map(|u| {
            if u.email == user.email {
                Some(UniqueField::Email)
            } else if u.username == user.username {
                Some(UniqueField::Username)
            } else {
                None
            }
        })
    }
}

/// In-process user store with the same uniqueness rules as the Postgres
/// schema. A transaction holds the table lock until it commits or drops.
#[derive(Clone, Default)]
pub struct MemoryUserRepo {
    table: Arc<Mutex<Table>>,
}

impl MemoryUserRepo {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.rows.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl UserRepo for MemoryUserRepo {
    async fn exists_by_email(&self, email: &str) -> StoreResult<bool> {
        Ok(self.find_by_email(email).await?.is_some())
    }

    async fn exists_by_username(&self, username: &str) -> StoreResult<bool> {
        Ok(self.find_by_username(username).await?.is_some())
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        let email = normalize_email(email);
        let table = self.table.lock().await;
        Ok(table.rows.values().find(|u| u.email == email).cloned())
    }

    async fn find_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let table = self.table.lock().await;
        Ok(table.rows.values().find(|u| u.username == username).cloned())
    }

    async fn find_by_id(&self, id: i64) -> StoreResult<Option<User>> {
        Ok(self.table.lock().await.rows.get(&id).cloned())
    }

    async fn insert(&self, new: NewUser) -> StoreResult<User> {
        let mut table = self.table.lock().await;
        let user = User {
            id: table.next_id + 1,
            email: normalize_email(&new.email),
            username: new.username,
            password_hash: new.password_hash,
            avatar: None,
            cover_image: None,
            bio: None,
            created_at: OffsetDateTime::now_utc(),
        };
        if let Some(field) = table.conflict_for(&user) {
            return Err(StoreError::Conflict(field));
        }
        table.next_id = user.id;
        table.rows.insert(user.id, user.clone());
        Ok(user)
    }

    async fn begin(&self) -> StoreResult<Box<dyn UserTx>> {
        let guard = self.table.clone().lock_owned().await;
        Ok(Box::new(MemoryUserTx {
            guard,
            staged: BTreeMap::new(),
        }))
    }
}

struct MemoryUserTx {
    guard: OwnedMutexGuard<Table>,
    staged: BTreeMap<i64, User>,
}

impl MemoryUserTx {
    fn current(&self, id: i64) -> Option<&User> {
        self.staged.get(&id).or_else(|| self.guard.rows.get(&id))
    }
}

#[async_trait]
impl UserTx for MemoryUserTx {
    async fn lock_by_id(&mut self, id: i64) -> StoreResult<Option<User>> {
        Ok(self.current(id).cloned())
    }

    async fn username_taken_by_other(&mut self, username: &str, id: i64) -> StoreResult<bool> {
        let taken = self
            .guard
            .rows
            .keys()
            .filter(|other| **other != id)
            .filter_map(|other| self.current(*other))
            .any(|u| u.username == username);
        Ok(taken)
    }

    async fn update(&mut self, user: &User) -> StoreResult<User> {
        let Some(existing) = self.current(user.id) else {
            return Err(anyhow::anyhow!("update of missing user {}", user.id).into());
        };
        let mut next = user.clone();
        next.email = normalize_email(&next.email);
        next.created_at = existing.created_at;

        let mut view = Table::default();
        for id in self.guard.rows.keys() {
            if let Some(u) = self.current(*id) {
                view.rows.insert(*id, u.clone());
            }
        }
        if let Some(field) = view.conflict_for(&next) {
            return Err(StoreError::Conflict(field));
        }
        self.staged.insert(next.id, next.clone());
        Ok(next)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        let MemoryUserTx { mut guard, staged } = *self;
        guard.rows.extend(staged);
        Ok(())
    }
}
