//! Ingestion pipeline: raw source records through normalization, the
//! trust-rank merge, and embedding refresh.
//!
//! Each record is independent: a validation failure is reported and the
//! batch continues. Revision conflicts from concurrent writers are retried
//! from a fresh read up to a bounded count, then reported.

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{MatchError, Result};
use crate::index::IndexService;
use crate::models::SourceSystem;
use crate::normalize::normalize;
use crate::store::Store;

#[derive(Debug, Default)]
pub struct IngestReport {
    pub ingested: usize,
    pub rejected: usize,
    pub conflicts_exhausted: usize,
    pub field_warnings: usize,
    pub embedded: usize,
    pub embedding_failures: usize,
    pub rejections: Vec<String>,
}

/// Ingest a batch of raw records from one source. When an index service is
/// supplied, changed profiles are re-embedded inline; embedding failures
/// degrade (the profile stays unembedded) and never abort the batch.
pub async fn ingest_records(
    store: &dyn Store,
    index_service: Option<&IndexService>,
    source: SourceSystem,
    records: &[Value],
    max_conflict_retries: u32,
) -> Result<IngestReport> {
    let fetched_at = Utc::now();
    let mut report = IngestReport::default();

    for (position, raw) in records.iter().enumerate() {
        let delta = match normalize(raw, source, fetched_at) {
            Ok(delta) => delta,
            Err(MatchError::Validation(reason)) => {
                warn!(%source, position, %reason, "record rejected");
                report.rejected += 1;
                report.rejections.push(format!("record {}: {}", position, reason));
                continue;
            }
            Err(e) => return Err(e),
        };

        report.field_warnings += delta.warnings.len();
        for w in &delta.warnings {
            warn!(dog_id = %delta.dog_id, field = %w.field, reason = %w.reason, "field dropped");
        }

        let mut attempt: u32 = 0;
        let profile = loop {
            match store.upsert(&delta).await {
                Ok(profile) => break Some(profile),
                Err(MatchError::Conflict { .. }) if attempt < max_conflict_retries => {
                    attempt += 1;
                    warn!(dog_id = %delta.dog_id, attempt, "revision conflict, retrying");
                }
                Err(MatchError::Conflict { .. }) => {
                    report.conflicts_exhausted += 1;
                    report
                        .rejections
                        .push(format!("{}: conflict retries exhausted", delta.dog_id));
                    break None;
                }
                Err(e) => return Err(e),
            }
        };
        let Some(profile) = profile else { continue };
        report.ingested += 1;

        if let Some(service) = index_service {
            match service.upsert(store, &profile).await {
                Ok(crate::index::UpsertOutcome::Computed) => report.embedded += 1,
                Ok(crate::index::UpsertOutcome::Unchanged) => {}
                Err(MatchError::CapabilityUnavailable(reason)) => {
                    warn!(dog_id = %profile.dog_id, %reason, "embedding unavailable, continuing");
                    report.embedding_failures += 1;
                }
                Err(MatchError::Conflict { .. }) => {
                    // A concurrent writer moved the profile; the backfill
                    // will re-embed it.
                    report.embedding_failures += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    info!(
        %source,
        ingested = report.ingested,
        rejected = report.rejected,
        warnings = report.field_warnings,
        embedded = report.embedded,
        "ingestion complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmbeddingConfig, IndexConfig, TrustConfig};
    use crate::embedding::StubProvider;
    use crate::index::VectorIndex;
    use crate::models::{attr, AttrValue, DogId};
    use crate::store::InMemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_batch_tolerates_bad_records() {
        let store = InMemoryStore::new(TrustConfig::default());
        let records = vec![
            json!({"animalID": "A1", "animalName": "Rex"}),
            json!({"animalName": "NoId"}),
            json!({"animalID": "A2", "animalName": "Luna", "animalWeight": "heavy"}),
        ];
        let report = ingest_records(&store, None, SourceSystem::PetPoint, &records, 3)
            .await
            .unwrap();
        assert_eq!(report.ingested, 2);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.field_warnings, 1);
        assert_eq!(store.list_active().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reingest_merges_not_duplicates() {
        let store = InMemoryStore::new(TrustConfig::default());
        let records = vec![json!({"animalID": "A1", "animalName": "Rex"})];
        ingest_records(&store, None, SourceSystem::PetPoint, &records, 3)
            .await
            .unwrap();
        let records2 = vec![json!({"animalID": "A1", "animalBreed": "Beagle"})];
        ingest_records(&store, None, SourceSystem::PetPoint, &records2, 3)
            .await
            .unwrap();

        let profiles = store.list_profiles().await.unwrap();
        assert_eq!(profiles.len(), 1);
        let p = &profiles[0];
        assert_eq!(p.attr(attr::NAME), Some(&AttrValue::Text("Rex".into())));
        assert_eq!(p.attr(attr::BREED), Some(&AttrValue::Text("Beagle".into())));
        assert_eq!(p.provenance.len(), 2);
    }

    #[tokio::test]
    async fn test_inline_embedding_and_idempotence() {
        let store = InMemoryStore::new(TrustConfig::default());
        let index = Arc::new(VectorIndex::new(IndexConfig::default()));
        let service = IndexService::new(
            index.clone(),
            Arc::new(StubProvider::new(32)),
            EmbeddingConfig::default(),
        );

        let records = vec![json!({
            "animalID": "A1",
            "animalName": "Rex",
            "animalDescription": "A friendly beagle."
        })];
        let r1 = ingest_records(&store, Some(&service), SourceSystem::PetPoint, &records, 3)
            .await
            .unwrap();
        assert_eq!(r1.embedded, 1);
        assert_eq!(index.len(), 1);

        // Same content again: merged but not re-embedded.
        let r2 = ingest_records(&store, Some(&service), SourceSystem::PetPoint, &records, 3)
            .await
            .unwrap();
        assert_eq!(r2.ingested, 1);
        assert_eq!(r2.embedded, 0);

        let p = store
            .get(&DogId::new(SourceSystem::PetPoint, "A1"))
            .await
            .unwrap()
            .unwrap();
        assert!(p.embedding.is_some());
        assert_eq!(p.embedding_hash, Some(p.content_hash()));

        // Re-upserting unchanged content into the index is a pure no-op:
        // no embedding write, stored revision untouched.
        let before = p.revision;
        let outcome = service.upsert(&store, &p).await.unwrap();
        assert_eq!(outcome, crate::index::UpsertOutcome::Unchanged);
        let after = store
            .get(&DogId::new(SourceSystem::PetPoint, "A1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(after.revision, before);
    }

    #[tokio::test]
    async fn test_disabled_embedding_degrades() {
        let store = InMemoryStore::new(TrustConfig::default());
        let index = Arc::new(VectorIndex::new(IndexConfig::default()));
        let service = IndexService::new(
            index.clone(),
            Arc::new(crate::embedding::DisabledProvider),
            EmbeddingConfig::default(),
        );

        let records = vec![json!({"animalID": "A1", "animalName": "Rex"})];
        let report = ingest_records(&store, Some(&service), SourceSystem::PetPoint, &records, 3)
            .await
            .unwrap();
        assert_eq!(report.ingested, 1);
        assert_eq!(report.embedding_failures, 1);
        assert!(index.is_empty());
        // Profile is persisted regardless.
        assert_eq!(store.list_active().await.unwrap().len(), 1);
    }
}
