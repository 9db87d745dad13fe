//! Embedding index: per-dog vectors with content-hash idempotence, exact
//! search at small scale and HNSW above a configured threshold.
//!
//! The index is an in-memory projection of the store's persisted
//! embeddings; [`IndexService::load`] rebuilds it at startup. Structural
//! mutations invalidate the HNSW graph, which is rebuilt lazily on the
//! next oversized search.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::config::{EmbeddingConfig, IndexConfig};
use crate::embedding::{cosine_similarity, EmbeddingProvider};
use crate::error::{MatchError, Result};
use crate::models::{DogId, DogProfile};
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new vector was computed and stored.
    Computed,
    /// The profile text was unchanged; the existing vector was kept.
    Unchanged,
}

struct IndexEntry {
    vector: Vec<f32>,
    content_hash: String,
    last_match_at: Option<i64>,
}

struct IndexInner {
    entries: HashMap<DogId, IndexEntry>,
    /// Parallel id list for HNSW node-id -> DogId mapping; rebuilt with the
    /// graph.
    hnsw: Option<(crate::hnsw::Hnsw, Vec<DogId>)>,
}

/// Thread-safe vector index over active dog profiles.
pub struct VectorIndex {
    inner: RwLock<IndexInner>,
    cfg: IndexConfig,
}

impl VectorIndex {
    pub fn new(cfg: IndexConfig) -> Self {
        Self {
            inner: RwLock::new(IndexInner {
                entries: HashMap::new(),
                hnsw: None,
            }),
            cfg,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a vector. Returns [`UpsertOutcome::Unchanged`]
    /// when the content hash matches the stored entry.
    pub fn upsert(&self, dog_id: &DogId, vector: Vec<f32>, content_hash: &str) -> UpsertOutcome {
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.entries.get(&dog_id) {
            if existing.content_hash == content_hash {
                return UpsertOutcome::Unchanged;
            }
        }
        let last_match_at = inner
            .entries
            .get(dog_id)
            .and_then(|e| e.last_match_at);
        inner.entries.insert(
            dog_id.clone(),
            IndexEntry {
                vector,
                content_hash: content_hash.to_string(),
                last_match_at,
            },
        );
        inner.hnsw = None;
        UpsertOutcome::Computed
    }

    pub fn contains_hash(&self, dog_id: &DogId, content_hash: &str) -> bool {
        self.inner
            .read()
            .unwrap()
            .entries
            .get(dog_id)
            .map(|e| e.content_hash == content_hash)
            .unwrap_or(false)
    }

    pub fn remove(&self, dog_id: &DogId) {
        let mut inner = self.inner.write().unwrap();
        if inner.entries.remove(dog_id).is_some() {
            inner.hnsw = None;
        }
    }

    pub fn set_last_match_at(&self, dog_id: &DogId, at: i64) {
        let mut inner = self.inner.write().unwrap();
        if let Some(e) = inner.entries.get_mut(dog_id) {
            e.last_match_at = Some(at);
        }
    }

    /// Beam width for the approximate path: the configured `ef_search`
    /// floor, widened as the recall target approaches 1 so the target
    /// keeps holding when operators raise it.
    fn effective_ef(&self, fetch: usize) -> usize {
        let recall = self.cfg.recall_target.clamp(0.5, 0.999);
        let widened = (fetch as f64 / (1.0 - recall)).ceil() as usize;
        self.cfg.ef_search.max(widened)
    }

    /// K-nearest search restricted to ids accepted by `filter`.
    ///
    /// Exact scan below `brute_force_threshold` entries; HNSW with
    /// oversampling above it, falling back to the exact scan when
    /// post-filtering leaves fewer than `k` results. Ties break by most
    /// recent successful match, then ascending dog id.
    ///
    /// Concurrent searches share a read lock; the write lock is taken
    /// only to rebuild an invalidated graph.
    pub fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: &dyn Fn(&DogId) -> bool,
    ) -> Vec<(DogId, f32)> {
        if k == 0 {
            return Vec::new();
        }

        let needs_build = {
            let inner = self.inner.read().unwrap();
            inner.entries.len() > self.cfg.brute_force_threshold && inner.hnsw.is_none()
        };
        if needs_build {
            let mut inner = self.inner.write().unwrap();
            if inner.entries.len() > self.cfg.brute_force_threshold && inner.hnsw.is_none() {
                inner.hnsw = Some(Self::build_graph(&self.cfg, &inner.entries));
            }
        }

        let inner = self.inner.read().unwrap();
        if inner.entries.len() > self.cfg.brute_force_threshold {
            if let Some((graph, ids)) = inner.hnsw.as_ref() {
                let fetch = k.saturating_mul(self.cfg.oversample).max(k);
                let ef = self.effective_ef(fetch);
                let mut results: Vec<(DogId, f32)> = graph
                    .search(query, fetch, ef)
                    .into_iter()
                    .map(|(node, sim)| (ids[node].clone(), sim))
                    .filter(|(id, _)| filter(id))
                    .collect();
                if results.len() >= k {
                    Self::rank(&mut results, &inner.entries);
                    results.truncate(k);
                    return results;
                }
                debug!(
                    found = results.len(),
                    k, "approximate search under-filled, falling back to exact scan"
                );
            }
        }

        let mut results: Vec<(DogId, f32)> = inner
            .entries
            .iter()
            .filter(|(id, _)| filter(id))
            .map(|(id, e)| (id.clone(), cosine_similarity(query, &e.vector)))
            .collect();
        Self::rank(&mut results, &inner.entries);
        results.truncate(k);
        results
    }

    fn rank(results: &mut [(DogId, f32)], entries: &HashMap<DogId, IndexEntry>) {
        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let la = entries.get(&a.0).and_then(|e| e.last_match_at);
                    let lb = entries.get(&b.0).and_then(|e| e.last_match_at);
                    lb.cmp(&la)
                })
                .then_with(|| a.0.cmp(&b.0))
        });
    }

    fn build_graph(
        cfg: &IndexConfig,
        entries: &HashMap<DogId, IndexEntry>,
    ) -> (crate::hnsw::Hnsw, Vec<DogId>) {
        info!(entries = entries.len(), "building approximate search graph");
        let mut graph = crate::hnsw::Hnsw::new(
            cfg.hnsw_max_connections,
            cfg.hnsw_max_layers,
            cfg.hnsw_ef_construction,
        );
        let mut ids = Vec::with_capacity(entries.len());
        // Deterministic insertion order.
        let mut sorted: Vec<(&DogId, &IndexEntry)> = entries.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        for (id, entry) in sorted {
            graph.insert(entry.vector.clone());
            ids.push(id.clone());
        }
        (graph, ids)
    }
}

/// Couples the index with the embedding provider and the store: computes
/// vectors for changed profiles and persists them alongside the profile.
pub struct IndexService {
    pub index: Arc<VectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
    embed_cfg: EmbeddingConfig,
}

impl IndexService {
    pub fn new(
        index: Arc<VectorIndex>,
        provider: Arc<dyn EmbeddingProvider>,
        embed_cfg: EmbeddingConfig,
    ) -> Self {
        Self {
            index,
            provider,
            embed_cfg,
        }
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    /// Rebuild the in-memory index from embeddings persisted in the store.
    pub async fn load(&self, store: &dyn Store) -> Result<usize> {
        let profiles = store.list_profiles().await?;
        let mut loaded = 0usize;
        for profile in profiles {
            if !matches!(profile.status, crate::models::DogStatus::Available) {
                continue;
            }
            if let (Some(vector), Some(hash)) = (&profile.embedding, &profile.embedding_hash) {
                self.index.upsert(&profile.dog_id, vector.clone(), hash);
                if let Some(at) = profile.last_match_at {
                    self.index.set_last_match_at(&profile.dog_id, at);
                }
                loaded += 1;
            }
        }
        info!(loaded, "vector index loaded from store");
        Ok(loaded)
    }

    /// Embed a profile if its text changed, persist the vector with an
    /// optimistic revision check, and update the index.
    ///
    /// A [`MatchError::CapabilityUnavailable`] from the provider is
    /// reported to the caller but must not abort ingestion; the profile
    /// simply stays unembedded until the next backfill.
    pub async fn upsert(&self, store: &dyn Store, profile: &DogProfile) -> Result<UpsertOutcome> {
        let text = profile.profile_text();
        if text.is_empty() {
            return Ok(UpsertOutcome::Unchanged);
        }
        let hash = crate::models::hash_text(&text);
        if profile.embedding_hash.as_deref() == Some(hash.as_str())
            && self.index.contains_hash(&profile.dog_id, &hash)
        {
            return Ok(UpsertOutcome::Unchanged);
        }

        let vector = if profile.embedding_hash.as_deref() == Some(hash.as_str()) {
            // Persisted vector is current; only the in-memory index is stale.
            profile.embedding.clone().ok_or_else(|| {
                MatchError::StoreUnavailable(format!(
                    "{} has an embedding hash but no vector",
                    profile.dog_id
                ))
            })?
        } else {
            let mut vectors = self.provider.embed(std::slice::from_ref(&text)).await?;
            let vector = vectors.pop().ok_or_else(|| {
                MatchError::CapabilityUnavailable("provider returned no vector".into())
            })?;
            store
                .set_embedding(&profile.dog_id, &vector, &hash, profile.revision)
                .await?;
            vector
        };

        Ok(self.index.upsert(&profile.dog_id, vector, &hash))
    }

    /// Periodic backfill driving the re-embed latency target: every
    /// `period` the pending set is re-embedded, so a profile whose text
    /// changed is back in the index within one period.
    pub async fn run_backfill(self: Arc<Self>, store: Arc<dyn Store>, period: std::time::Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.embed_pending(store.as_ref()).await {
                Ok((embedded, _, failed)) if embedded > 0 || failed > 0 => {
                    info!(embedded, failed, "embedding backfill pass");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "embedding backfill failed"),
            }
        }
    }

    /// Embed all active profiles whose current text hash differs from the
    /// persisted embedding hash. Returns `(embedded, skipped, failed)`.
    pub async fn embed_pending(&self, store: &dyn Store) -> Result<(usize, usize, usize)> {
        let profiles = store.list_profiles().await?;
        let mut embedded = 0usize;
        let mut skipped = 0usize;
        let mut failed = 0usize;

        let batch_size = self.embed_cfg.batch_size.max(1);
        let pending: Vec<DogProfile> = profiles
            .into_iter()
            .filter(|p| matches!(p.status, crate::models::DogStatus::Available))
            .filter(|p| {
                let current = p.content_hash();
                if p.embedding_hash.as_deref() == Some(current.as_str()) {
                    skipped += 1;
                    false
                } else {
                    !p.profile_text().is_empty()
                }
            })
            .collect();

        for chunk in pending.chunks(batch_size) {
            let texts: Vec<String> = chunk.iter().map(|p| p.profile_text()).collect();
            match self.provider.embed(&texts).await {
                Ok(vectors) => {
                    for (profile, vector) in chunk.iter().zip(vectors) {
                        let hash = profile.content_hash();
                        match store
                            .set_embedding(&profile.dog_id, &vector, &hash, profile.revision)
                            .await
                        {
                            Ok(()) => {
                                self.index.upsert(&profile.dog_id, vector, &hash);
                                embedded += 1;
                            }
                            Err(MatchError::Conflict { .. }) => {
                                // Profile changed under us; next backfill picks it up.
                                failed += 1;
                            }
                            Err(e) => return Err(e),
                        }
                    }
                }
                Err(MatchError::CapabilityUnavailable(reason)) => {
                    warn!(%reason, batch = chunk.len(), "embedding batch failed");
                    failed += chunk.len();
                }
                Err(e) => return Err(e),
            }
        }

        Ok((embedded, skipped, failed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::normalize_vec;
    use crate::models::SourceSystem;

    fn idx() -> VectorIndex {
        VectorIndex::new(IndexConfig::default())
    }

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        normalize_vec(&mut v);
        v
    }

    fn id(n: &str) -> DogId {
        DogId::new(SourceSystem::PetPoint, n)
    }

    #[test]
    fn test_upsert_idempotent_by_hash() {
        let index = idx();
        let v = unit(vec![1.0, 0.0]);
        assert_eq!(index.upsert(&id("A1"), v.clone(), "h1"), UpsertOutcome::Computed);
        assert_eq!(index.upsert(&id("A1"), v.clone(), "h1"), UpsertOutcome::Unchanged);
        assert_eq!(index.upsert(&id("A1"), v, "h2"), UpsertOutcome::Computed);
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_search_orders_by_similarity_and_filters() {
        let index = idx();
        index.upsert(&id("A1"), unit(vec![1.0, 0.0]), "h1");
        index.upsert(&id("A2"), unit(vec![0.7, 0.7]), "h2");
        index.upsert(&id("A3"), unit(vec![0.0, 1.0]), "h3");

        let query = unit(vec![1.0, 0.1]);
        let all = index.search(&query, 3, &|_| true);
        assert_eq!(all[0].0, id("A1"));
        assert_eq!(all[2].0, id("A3"));

        let filtered = index.search(&query, 3, &|d| d != &id("A1"));
        assert_eq!(filtered[0].0, id("A2"));
        assert_eq!(filtered.len(), 2);
    }

    #[test]
    fn test_tie_breaks_by_last_match_then_id() {
        let index = idx();
        let v = unit(vec![1.0, 0.0]);
        index.upsert(&id("B"), v.clone(), "h1");
        index.upsert(&id("A"), v.clone(), "h2");
        index.upsert(&id("C"), v.clone(), "h3");
        index.set_last_match_at(&id("C"), 100);

        let results = index.search(&v, 3, &|_| true);
        assert_eq!(results[0].0, id("C"));
        assert_eq!(results[1].0, id("A"));
        assert_eq!(results[2].0, id("B"));
    }

    #[test]
    fn test_remove() {
        let index = idx();
        index.upsert(&id("A1"), unit(vec![1.0, 0.0]), "h1");
        index.remove(&id("A1"));
        assert!(index.is_empty());
        assert!(index.search(&[1.0, 0.0], 1, &|_| true).is_empty());
    }

    #[test]
    fn test_effective_ef_widens_with_recall_target() {
        let base = VectorIndex::new(IndexConfig::default());
        let strict = VectorIndex::new(IndexConfig {
            recall_target: 0.99,
            ..IndexConfig::default()
        });
        let fetch = 20;
        assert!(strict.effective_ef(fetch) > base.effective_ef(fetch));
        // The configured floor always holds.
        assert!(base.effective_ef(1) >= IndexConfig::default().ef_search);
    }

    #[test]
    fn test_search_survives_graph_invalidation_above_threshold() {
        let cfg = IndexConfig {
            brute_force_threshold: 10,
            ..IndexConfig::default()
        };
        let index = VectorIndex::new(cfg);
        for i in 0..20 {
            index.upsert(
                &id(&format!("D{:02}", i)),
                unit(vec![i as f32 + 1.0, 1.0]),
                &format!("h{}", i),
            );
        }
        let target = unit(vec![20.0, 1.0]);
        // First search builds the graph.
        assert_eq!(index.search(&target, 1, &|_| true)[0].0, id("D19"));
        // A removal invalidates the graph; the next search rebuilds it on
        // demand and still answers correctly.
        index.remove(&id("D19"));
        let results = index.search(&target, 1, &|_| true);
        assert_eq!(results[0].0, id("D18"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backfill_loop_embeds_pending_profiles() {
        use crate::config::{EmbeddingConfig, TrustConfig};
        use crate::embedding::StubProvider;
        use crate::models::DogProfileDelta;
        use crate::store::InMemoryStore;
        use std::collections::BTreeMap;

        let store: Arc<dyn Store> = Arc::new(InMemoryStore::new(TrustConfig::default()));
        let mut attributes = BTreeMap::new();
        attributes.insert(
            crate::models::attr::NAME.to_string(),
            crate::models::AttrValue::Text("Rex".into()),
        );
        store
            .upsert(&DogProfileDelta {
                dog_id: id("A1"),
                source: SourceSystem::PetPoint,
                source_record_id: "A1".into(),
                fetched_at: chrono::Utc::now(),
                attributes,
                narrative: Some("A good boy.".into()),
                warnings: Vec::new(),
            })
            .await
            .unwrap();

        let service = Arc::new(IndexService::new(
            Arc::new(VectorIndex::new(IndexConfig::default())),
            Arc::new(StubProvider::new(32)),
            EmbeddingConfig::default(),
        ));
        let handle = tokio::spawn(
            service
                .clone()
                .run_backfill(store.clone(), std::time::Duration::from_secs(60)),
        );

        // The first tick fires immediately; let the loop run one pass.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.abort();

        let profile = store.get(&id("A1")).await.unwrap().unwrap();
        assert!(profile.embedding.is_some());
        assert_eq!(profile.embedding_hash, Some(profile.content_hash()));
        assert_eq!(service.index.len(), 1);
    }

    #[test]
    fn test_approximate_path_above_threshold() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let cfg = IndexConfig {
            brute_force_threshold: 50,
            ..IndexConfig::default()
        };
        let index = VectorIndex::new(cfg);
        let mut rng = StdRng::seed_from_u64(7);
        for i in 0..200 {
            let v = unit((0..16).map(|_| rng.gen::<f32>() - 0.5).collect());
            index.upsert(&id(&format!("D{:04}", i)), v, &format!("h{}", i));
        }
        let target = unit((0..16).map(|_| rng.gen::<f32>() - 0.5).collect());
        index.upsert(&id("TARGET"), target.clone(), "ht");

        let results = index.search(&target, 5, &|_| true);
        assert_eq!(results.len(), 5);
        assert_eq!(results[0].0, id("TARGET"));
    }
}
