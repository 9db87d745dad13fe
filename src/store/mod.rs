//! Knowledge base store: durable canonical profiles with optimistic
//! concurrency.
//!
//! Every mutation bumps the profile's revision; writers that raced a
//! concurrent update get [`MatchError::Conflict`](crate::error::MatchError)
//! and retry from a fresh read. The in-memory implementation backs tests;
//! SQLite is the production backend.

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{DogId, DogProfile, DogProfileDelta, DogStatus};

#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch one profile by id.
    async fn get(&self, dog_id: &DogId) -> Result<Option<DogProfile>>;

    /// Merge a normalized delta into the canonical profile, creating it if
    /// absent. Returns the merged profile at its new revision.
    async fn upsert(&self, delta: &DogProfileDelta) -> Result<DogProfile>;

    /// Ids of all profiles currently in `Available` status.
    async fn list_active(&self) -> Result<Vec<DogId>>;

    /// All profiles regardless of status.
    async fn list_profiles(&self) -> Result<Vec<DogProfile>>;

    /// Set availability status. Returns the updated profile, or `None` when
    /// the id is unknown.
    async fn mark_status(&self, dog_id: &DogId, status: DogStatus) -> Result<Option<DogProfile>>;

    /// Persist an embedding computed against `expected_revision`. Fails
    /// with a conflict when the profile has moved on, so a stale vector is
    /// never attached to newer text.
    async fn set_embedding(
        &self,
        dog_id: &DogId,
        vector: &[f32],
        content_hash: &str,
        expected_revision: i64,
    ) -> Result<()>;

    /// Record a successful match outcome, used as a ranking tie-breaker.
    async fn record_match_success(&self, dog_id: &DogId, at: i64) -> Result<()>;
}
