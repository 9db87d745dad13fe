//! SQLite-backed store. Profiles are stored one row per dog with the
//! attribute map, narrative, and provenance as JSON columns and the
//! embedding as a little-endian f32 blob.
//!
//! Writes use compare-and-swap on the revision column: the UPDATE carries
//! `WHERE revision = ?` and zero affected rows means a concurrent writer
//! won, surfaced as a conflict for the caller to retry.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::config::TrustConfig;
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{MatchError, Result};
use crate::models::{
    Attribute, DogId, DogProfile, DogProfileDelta, DogStatus, NarrativeEntry, Provenance,
};
use crate::normalize::merge_delta;
use crate::store::Store;
use std::collections::BTreeMap;
use std::str::FromStr;

pub struct SqliteStore {
    pool: SqlitePool,
    trust: TrustConfig,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool, trust: TrustConfig) -> Self {
        Self { pool, trust }
    }

    fn row_to_profile(row: &sqlx::sqlite::SqliteRow) -> Result<DogProfile> {
        let dog_id: String = row.get("dog_id");
        let attributes_json: String = row.get("attributes_json");
        let narrative_json: String = row.get("narrative_json");
        let provenance_json: String = row.get("provenance_json");
        let status: String = row.get("status");
        let revision: i64 = row.get("revision");
        let embedding: Option<Vec<u8>> = row.get("embedding");
        let embedding_hash: Option<String> = row.get("embedding_hash");
        let last_match_at: Option<i64> = row.get("last_match_at");

        let attributes: BTreeMap<String, Attribute> = serde_json::from_str(&attributes_json)?;
        let narrative: Vec<NarrativeEntry> = serde_json::from_str(&narrative_json)?;
        let provenance: Vec<Provenance> = serde_json::from_str(&provenance_json)?;
        let status = DogStatus::from_str(&status).map_err(MatchError::Validation)?;

        Ok(DogProfile {
            dog_id: DogId(dog_id),
            attributes,
            narrative,
            embedding: embedding.map(|b| blob_to_vec(&b)),
            embedding_hash,
            provenance,
            status,
            revision,
            last_match_at,
        })
    }

    async fn fetch(&self, dog_id: &DogId) -> Result<Option<DogProfile>> {
        let row = sqlx::query("SELECT * FROM dogs WHERE dog_id = ?")
            .bind(dog_id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_profile).transpose()
    }

    async fn write_merged(&self, profile: &DogProfile, expected_revision: i64) -> Result<()> {
        let attributes_json = serde_json::to_string(&profile.attributes)?;
        let narrative_json = serde_json::to_string(&profile.narrative)?;
        let provenance_json = serde_json::to_string(&profile.provenance)?;
        let now = Utc::now().timestamp();

        if expected_revision == 0 {
            let inserted = sqlx::query(
                "INSERT INTO dogs (dog_id, attributes_json, narrative_json, provenance_json,
                                   status, revision, embedding, embedding_hash, last_match_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, NULL, ?)
                 ON CONFLICT(dog_id) DO NOTHING",
            )
            .bind(profile.dog_id.as_str())
            .bind(&attributes_json)
            .bind(&narrative_json)
            .bind(&provenance_json)
            .bind(profile.status.as_str())
            .bind(profile.revision)
            .bind(now)
            .execute(&self.pool)
            .await?;
            if inserted.rows_affected() == 0 {
                // Someone created the row between our read and write.
                return Err(MatchError::Conflict {
                    dog_id: profile.dog_id.to_string(),
                    expected: 0,
                    actual: -1,
                });
            }
            return Ok(());
        }

        let updated = sqlx::query(
            "UPDATE dogs
             SET attributes_json = ?, narrative_json = ?, provenance_json = ?,
                 status = ?, revision = ?, updated_at = ?
             WHERE dog_id = ? AND revision = ?",
        )
        .bind(&attributes_json)
        .bind(&narrative_json)
        .bind(&provenance_json)
        .bind(profile.status.as_str())
        .bind(profile.revision)
        .bind(now)
        .bind(profile.dog_id.as_str())
        .bind(expected_revision)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let actual = self.fetch(&profile.dog_id).await?.map(|p| p.revision).unwrap_or(-1);
            return Err(MatchError::Conflict {
                dog_id: profile.dog_id.to_string(),
                expected: expected_revision,
                actual,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get(&self, dog_id: &DogId) -> Result<Option<DogProfile>> {
        self.fetch(dog_id).await
    }

    async fn upsert(&self, delta: &DogProfileDelta) -> Result<DogProfile> {
        let existing = self.fetch(&delta.dog_id).await?;
        let expected_revision = existing.as_ref().map(|p| p.revision).unwrap_or(0);
        let mut profile = existing.unwrap_or_else(|| DogProfile::new(delta.dog_id.clone()));
        merge_delta(&mut profile, delta, &self.trust);
        profile.revision = expected_revision + 1;
        self.write_merged(&profile, expected_revision).await?;
        Ok(profile)
    }

    async fn list_active(&self) -> Result<Vec<DogId>> {
        let rows = sqlx::query("SELECT dog_id FROM dogs WHERE status = 'available' ORDER BY dog_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| DogId(r.get::<String, _>("dog_id")))
            .collect())
    }

    async fn list_profiles(&self) -> Result<Vec<DogProfile>> {
        let rows = sqlx::query("SELECT * FROM dogs ORDER BY dog_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_profile).collect()
    }

    async fn mark_status(&self, dog_id: &DogId, status: DogStatus) -> Result<Option<DogProfile>> {
        let updated = sqlx::query(
            "UPDATE dogs SET status = ?, revision = revision + 1, updated_at = ? WHERE dog_id = ?",
        )
        .bind(status.as_str())
        .bind(Utc::now().timestamp())
        .bind(dog_id.as_str())
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Ok(None);
        }
        self.fetch(dog_id).await
    }

    async fn set_embedding(
        &self,
        dog_id: &DogId,
        vector: &[f32],
        content_hash: &str,
        expected_revision: i64,
    ) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE dogs
             SET embedding = ?, embedding_hash = ?, revision = revision + 1, updated_at = ?
             WHERE dog_id = ? AND revision = ?",
        )
        .bind(vec_to_blob(vector))
        .bind(content_hash)
        .bind(Utc::now().timestamp())
        .bind(dog_id.as_str())
        .bind(expected_revision)
        .execute(&self.pool)
        .await?;

        if updated.rows_affected() == 0 {
            let actual = self.fetch(dog_id).await?.map(|p| p.revision).unwrap_or(-1);
            return Err(MatchError::Conflict {
                dog_id: dog_id.to_string(),
                expected: expected_revision,
                actual,
            });
        }
        Ok(())
    }

    async fn record_match_success(&self, dog_id: &DogId, at: i64) -> Result<()> {
        sqlx::query(
            "UPDATE dogs SET last_match_at = ?, revision = revision + 1, updated_at = ? WHERE dog_id = ?",
        )
        .bind(at)
        .bind(Utc::now().timestamp())
        .bind(dog_id.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
