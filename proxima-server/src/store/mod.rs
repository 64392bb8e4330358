//! Persistence seams for the four backend components.
//!
//! Store traits are synchronous: the Postgres backend runs blocking diesel
//! calls and the in-memory backend only takes short map locks. Services call
//! them through [`run_blocking`], which moves the work off the async workers
//! and lets it finish even if the calling request is dropped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use proxima_shared::errors::{AppError, ErrorCode};

use crate::geo::BoundingBox;
use crate::models::{LikeOutcome, LocationRecord, MatchEdge, Message, NewMessage, NewUser, ProfileChanges, User};

pub mod memory;
pub mod postgres;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("email already registered")]
    DuplicateEmail,

    #[error("record not found")]
    NotFound,

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateEmail => AppError::new(ErrorCode::EmailAlreadyExists, "email already registered"),
            StoreError::NotFound => AppError::new(ErrorCode::NotFound, "resource not found"),
            StoreError::Unavailable(msg) => {
                tracing::warn!(error = %msg, "storage unavailable");
                AppError::unavailable("storage temporarily unavailable, retry later")
            }
            StoreError::Backend(msg) => AppError::Internal(anyhow::anyhow!(msg)),
        }
    }
}

pub trait UserStore: Send + Sync {
    fn insert(&self, user: NewUser) -> Result<User, StoreError>;
    fn find_by_id(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    fn find_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    fn find_many(&self, ids: &[Uuid]) -> Result<Vec<User>, StoreError>;
    /// Returns `None` when the user does not exist.
    fn update_profile(&self, id: Uuid, changes: &ProfileChanges) -> Result<Option<User>, StoreError>;

    fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

pub trait LocationStore: Send + Sync {
    /// Last-write-wins by `updated_at`: an older record never replaces a newer one.
    fn upsert(&self, record: LocationRecord) -> Result<(), StoreError>;
    fn get(&self, user_id: Uuid) -> Result<Option<LocationRecord>, StoreError>;
    /// Records inside `area` updated at or after `fresh_since`. The caller
    /// applies the exact distance cut.
    fn candidates(&self, area: &BoundingBox, fresh_since: DateTime<Utc>) -> Result<Vec<LocationRecord>, StoreError>;
    fn prune_stale(&self, before: DateTime<Utc>) -> Result<usize, StoreError>;
}

pub trait LikeStore: Send + Sync {
    /// Inserts liker -> liked (idempotent) and checks the reciprocal edge as
    /// one atomic step for the pair.
    fn like(&self, liker: Uuid, liked: Uuid, at: DateTime<Utc>) -> Result<LikeOutcome, StoreError>;
    /// Mutual partners of `user`, most recent match first.
    fn matches_of(&self, user: Uuid) -> Result<Vec<MatchEdge>, StoreError>;
}

pub trait MessageStore: Send + Sync {
    /// Assigns id and creation time. Creation times never decrease within a room.
    fn append(&self, message: NewMessage) -> Result<Message, StoreError>;
    /// Full room log ordered by creation time, ties by insertion order.
    fn history(&self, room_id: &str) -> Result<Vec<Message>, StoreError>;
}

#[derive(Clone)]
pub struct Stores {
    pub users: Arc<dyn UserStore>,
    pub locations: Arc<dyn LocationStore>,
    pub likes: Arc<dyn LikeStore>,
    pub messages: Arc<dyn MessageStore>,
}

impl Stores {
    pub fn memory(grid_cell_deg: f64) -> Self {
        Self {
            users: Arc::new(memory::MemoryUserStore::default()),
            locations: Arc::new(memory::MemoryLocationStore::new(grid_cell_deg)),
            likes: Arc::new(memory::MemoryLikeStore::default()),
            messages: Arc::new(memory::MemoryMessageStore::default()),
        }
    }

    pub fn postgres(pool: proxima_shared::clients::db::DbPool) -> Self {
        let store = Arc::new(postgres::PgStore::new(pool));
        Self {
            users: store.clone(),
            locations: store.clone(),
            likes: store.clone(),
            messages: store,
        }
    }
}

/// Runs a blocking store call on the blocking pool.
pub async fn run_blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Backend(format!("store task failed: {e}")))?
}
