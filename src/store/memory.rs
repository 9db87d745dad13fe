//! In-memory store used by tests and ephemeral tooling.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::TrustConfig;
use crate::error::{MatchError, Result};
use crate::models::{DogId, DogProfile, DogProfileDelta, DogStatus};
use crate::normalize::merge_delta;
use crate::store::Store;

pub struct InMemoryStore {
    profiles: RwLock<HashMap<DogId, DogProfile>>,
    trust: TrustConfig,
}

impl InMemoryStore {
    pub fn new(trust: TrustConfig) -> Self {
        Self {
            profiles: RwLock::new(HashMap::new()),
            trust,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new(TrustConfig::default())
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn get(&self, dog_id: &DogId) -> Result<Option<DogProfile>> {
        Ok(self.profiles.read().unwrap().get(dog_id).cloned())
    }

    async fn upsert(&self, delta: &DogProfileDelta) -> Result<DogProfile> {
        let mut profiles = self.profiles.write().unwrap();
        let profile = profiles
            .entry(delta.dog_id.clone())
            .or_insert_with(|| DogProfile::new(delta.dog_id.clone()));
        merge_delta(profile, delta, &self.trust);
        profile.revision += 1;
        Ok(profile.clone())
    }

    async fn list_active(&self) -> Result<Vec<DogId>> {
        let mut ids: Vec<DogId> = self
            .profiles
            .read()
            .unwrap()
            .values()
            .filter(|p| p.status == DogStatus::Available)
            .map(|p| p.dog_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_profiles(&self) -> Result<Vec<DogProfile>> {
        let mut profiles: Vec<DogProfile> =
            self.profiles.read().unwrap().values().cloned().collect();
        profiles.sort_by(|a, b| a.dog_id.cmp(&b.dog_id));
        Ok(profiles)
    }

    async fn mark_status(&self, dog_id: &DogId, status: DogStatus) -> Result<Option<DogProfile>> {
        let mut profiles = self.profiles.write().unwrap();
        match profiles.get_mut(dog_id) {
            Some(profile) => {
                profile.status = status;
                profile.revision += 1;
                Ok(Some(profile.clone()))
            }
            None => Ok(None),
        }
    }

    async fn set_embedding(
        &self,
        dog_id: &DogId,
        vector: &[f32],
        content_hash: &str,
        expected_revision: i64,
    ) -> Result<()> {
        let mut profiles = self.profiles.write().unwrap();
        let profile = profiles.get_mut(dog_id).ok_or_else(|| {
            MatchError::StoreUnavailable(format!("unknown dog: {}", dog_id))
        })?;
        if profile.revision != expected_revision {
            return Err(MatchError::Conflict {
                dog_id: dog_id.to_string(),
                expected: expected_revision,
                actual: profile.revision,
            });
        }
        profile.embedding = Some(vector.to_vec());
        profile.embedding_hash = Some(content_hash.to_string());
        profile.revision += 1;
        Ok(())
    }

    async fn record_match_success(&self, dog_id: &DogId, at: i64) -> Result<()> {
        let mut profiles = self.profiles.write().unwrap();
        if let Some(profile) = profiles.get_mut(dog_id) {
            profile.last_match_at = Some(at);
            profile.revision += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{attr, AttrValue, SourceSystem};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn delta(record_id: &str) -> DogProfileDelta {
        let mut attributes = BTreeMap::new();
        attributes.insert(
            attr::NAME.to_string(),
            AttrValue::Text("Rex".to_string()),
        );
        DogProfileDelta {
            dog_id: DogId::new(SourceSystem::PetPoint, record_id),
            source: SourceSystem::PetPoint,
            source_record_id: record_id.to_string(),
            fetched_at: Utc::now(),
            attributes,
            narrative: Some("A good boy.".to_string()),
            warnings: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_and_bumps_revision() {
        let store = InMemoryStore::default();
        let p1 = store.upsert(&delta("A1")).await.unwrap();
        assert_eq!(p1.revision, 1);
        let p2 = store.upsert(&delta("A1")).await.unwrap();
        assert_eq!(p2.revision, 2);
        assert_eq!(store.list_active().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_set_embedding_revision_check() {
        let store = InMemoryStore::default();
        let p = store.upsert(&delta("A1")).await.unwrap();

        // Stale revision is rejected.
        let err = store
            .set_embedding(&p.dog_id, &[1.0, 0.0], "h", p.revision - 1)
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::Conflict { .. }));

        store
            .set_embedding(&p.dog_id, &[1.0, 0.0], "h", p.revision)
            .await
            .unwrap();
        let stored = store.get(&p.dog_id).await.unwrap().unwrap();
        assert_eq!(stored.embedding.as_deref(), Some([1.0, 0.0].as_slice()));
        assert_eq!(stored.revision, p.revision + 1);
    }

    #[tokio::test]
    async fn test_mark_status_filters_active() {
        let store = InMemoryStore::default();
        let p = store.upsert(&delta("A1")).await.unwrap();
        store.upsert(&delta("A2")).await.unwrap();

        store
            .mark_status(&p.dog_id, DogStatus::Adopted)
            .await
            .unwrap()
            .unwrap();
        let active = store.list_active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].as_str(), "petpoint:A2");

        let missing = store
            .mark_status(&DogId::new(SourceSystem::PetPoint, "nope"), DogStatus::Adopted)
            .await
            .unwrap();
        assert!(missing.is_none());
    }
}
