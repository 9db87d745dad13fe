//! Matcher: hard-constraint filtering then blended ranking.
//!
//! The score for each qualifying dog blends three signals:
//!   - embedding similarity between the adopter's preference vector and
//!     the dog's profile vector, rescaled to [0, 1];
//!   - household-context fit from a fixed compatibility rule table;
//!   - a preference-confidence adjustment from extracted statements whose
//!     implied attributes the dog satisfies.
//!
//! When no preference vector exists (no free text, or the embedding
//! capability was down) the similarity weight drops out and the remaining
//! weights are renormalized, so ranking still works on structured data
//! alone.

use tracing::debug;

use crate::config::MatchingConfig;
use crate::error::Result;
use crate::index::VectorIndex;
use crate::models::{
    attr, ActivityLevel, AdopterProfile, AttrValue, DogId, DogProfile, HomeType, MatchResponse,
    MatchResult, ScoreSignal, SizeClass,
};
use crate::store::Store;
use std::collections::HashMap;

pub async fn run_match(
    store: &dyn Store,
    index: &VectorIndex,
    cfg: &MatchingConfig,
    adopter: &AdopterProfile,
    limit: usize,
) -> Result<MatchResponse> {
    let limit = limit.max(1);
    let profiles = store.list_profiles().await?;
    let mut qualifying: HashMap<DogId, DogProfile> = HashMap::new();
    for profile in profiles {
        if !matches!(profile.status, crate::models::DogStatus::Available) {
            continue;
        }
        if adopter
            .hard_constraints
            .iter()
            .all(|c| c.satisfied_by(&profile))
        {
            qualifying.insert(profile.dog_id.clone(), profile);
        }
    }

    if qualifying.is_empty() {
        return Ok(MatchResponse {
            results: Vec::new(),
            no_qualifying_candidates: true,
            degraded: adopter.soft_preferences.capability_degraded,
        });
    }

    let query = adopter.soft_preferences.vector.as_deref();

    // Candidate set: index retrieval when a preference vector exists.
    // Qualifiers without an embedding enter at a neutral similarity so
    // embedding lag never hides a dog; embedded dogs that did not make the
    // retrieved top-N stay out. Without a query vector every qualifier is
    // a candidate.
    let mut similarities: HashMap<DogId, Option<f32>> = HashMap::new();
    match query {
        Some(vector) => {
            let fetch = limit.saturating_mul(cfg.candidate_multiplier).max(limit);
            let hits = index.search(vector, fetch, &|id| qualifying.contains_key(id));
            debug!(hits = hits.len(), fetch, "index retrieval");
            for (id, sim) in hits {
                similarities.insert(id, Some(sim));
            }
            for (id, profile) in &qualifying {
                if profile.embedding.is_none() {
                    similarities.entry(id.clone()).or_insert(None);
                }
            }
        }
        None => {
            for id in qualifying.keys() {
                similarities.insert(id.clone(), None);
            }
        }
    }

    // Effective weights; the similarity term participates only when a
    // query vector exists.
    let (w_sim, w_ctx, w_conf) = if query.is_some() {
        (cfg.w_sim, cfg.w_ctx, cfg.w_conf)
    } else {
        (0.0, cfg.w_ctx, cfg.w_conf)
    };
    let total = w_sim + w_ctx + w_conf;
    let (w_sim, w_ctx, w_conf) = (w_sim / total, w_ctx / total, w_conf / total);

    let mut results: Vec<MatchResult> = Vec::with_capacity(similarities.len());
    for (dog_id, sim) in similarities {
        let profile = &qualifying[&dog_id];
        let mut explanation = Vec::new();

        let mut score = 0.0;
        if w_sim > 0.0 {
            // Cosine in [-1, 1] rescaled; unembedded dogs sit at neutral.
            let (sim01, detail) = match sim {
                Some(s) => (
                    ((s + 1.0) / 2.0) as f64,
                    format!("preference-narrative similarity {:.3}", s),
                ),
                None => (0.5, "no embedding yet, neutral similarity".to_string()),
            };
            let contribution = w_sim * sim01;
            score += contribution;
            explanation.push(ScoreSignal {
                signal: "similarity".into(),
                contribution,
                detail,
            });
        }

        let (ctx_fit, ctx_detail) = context_fit(adopter, profile);
        let contribution = w_ctx * ctx_fit;
        score += contribution;
        explanation.push(ScoreSignal {
            signal: "context_fit".into(),
            contribution,
            detail: ctx_detail,
        });

        let (conf_adj, conf_detail) = confidence_adjustment(adopter, profile);
        let contribution = w_conf * conf_adj;
        score += contribution;
        explanation.push(ScoreSignal {
            signal: "preference_confidence".into(),
            contribution,
            detail: conf_detail,
        });

        // Below-threshold statements are surfaced but contribute nothing.
        for s in &adopter.soft_preferences.statements {
            if !s.scoring {
                explanation.push(ScoreSignal {
                    signal: "noted".into(),
                    contribution: 0.0,
                    detail: format!("{} (confidence {:.2}, recorded, not scored)", s.statement, s.confidence),
                });
            }
        }

        results.push(MatchResult {
            dog_id,
            score,
            explanation,
        });
    }

    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.dog_id.cmp(&b.dog_id))
    });
    results.truncate(limit);

    Ok(MatchResponse {
        results,
        no_qualifying_candidates: false,
        degraded: adopter.soft_preferences.capability_degraded,
    })
}

fn flag_fit(dog_flag: Option<bool>) -> f64 {
    match dog_flag {
        Some(true) => 1.0,
        None => 0.5,
        Some(false) => 0.0,
    }
}

/// Household-context fit: the mean of every applicable rule, 0.5 when
/// nothing applies.
fn context_fit(adopter: &AdopterProfile, profile: &DogProfile) -> (f64, String) {
    let ctx = &adopter.household_context;
    let mut scores: Vec<f64> = Vec::new();
    let mut notes: Vec<String> = Vec::new();

    if ctx.cats == Some(true) {
        let s = flag_fit(profile.flag(attr::GOOD_WITH_CATS));
        scores.push(s);
        notes.push(format!("cats at home: {:.1}", s));
    }
    if ctx.dogs == Some(true) {
        let s = flag_fit(profile.flag(attr::GOOD_WITH_DOGS));
        scores.push(s);
        notes.push(format!("dogs at home: {:.1}", s));
    }
    if ctx.children == Some(true) {
        let s = flag_fit(profile.flag(attr::GOOD_WITH_SMALL_CHILDREN));
        scores.push(s);
        notes.push(format!("children at home: {:.1}", s));
    }

    if ctx.home == Some(HomeType::Apartment) {
        if let Some(AttrValue::Text(size)) = profile.attr(attr::SIZE) {
            let s = match SizeClass::parse(size) {
                Some(SizeClass::Small) => 1.0,
                Some(SizeClass::Medium) => 0.6,
                Some(_) => 0.2,
                None => 0.5,
            };
            scores.push(s);
            notes.push(format!("apartment vs size: {:.1}", s));
        }
        if let Some(AttrValue::Text(energy)) = profile.attr(attr::ENERGY_LEVEL) {
            let s = match energy.as_str() {
                "low" => 1.0,
                "moderate" => 0.6,
                "high" => 0.2,
                _ => 0.5,
            };
            scores.push(s);
            notes.push(format!("apartment vs energy: {:.1}", s));
        }
    }

    if let Some(has_yard) = ctx.yard {
        if let Some(needs) = profile.flag(attr::NEEDS_FENCED_YARD) {
            let s = match (has_yard, needs) {
                (true, true) => 1.0,
                (true, false) => 0.8,
                (false, false) => 1.0,
                (false, true) => 0.0,
            };
            scores.push(s);
            notes.push(format!("yard: {:.1}", s));
        }
    }

    if let Some(activity) = ctx.activity_level {
        if let Some(AttrValue::Text(energy)) = profile.attr(attr::ENERGY_LEVEL) {
            let dog = match energy.as_str() {
                "low" => Some(ActivityLevel::Low),
                "moderate" => Some(ActivityLevel::Moderate),
                "high" => Some(ActivityLevel::High),
                _ => None,
            };
            let s = match dog {
                Some(dog) if dog == activity => 1.0,
                Some(ActivityLevel::Moderate) | None => 0.5,
                Some(_) if activity == ActivityLevel::Moderate => 0.5,
                Some(_) => 0.0,
            };
            scores.push(s);
            notes.push(format!("activity vs energy: {:.1}", s));
        }
    }

    if scores.is_empty() {
        return (0.5, "no household context provided".into());
    }
    let fit = scores.iter().sum::<f64>() / scores.len() as f64;
    (fit, notes.join(", "))
}

/// Share of scoring statements whose implied attribute the dog satisfies,
/// confidence-weighted. Neutral when nothing is scorable.
fn confidence_adjustment(adopter: &AdopterProfile, profile: &DogProfile) -> (f64, String) {
    let scorable: Vec<_> = adopter
        .soft_preferences
        .statements
        .iter()
        .filter(|s| s.scoring && s.implies.is_some())
        .collect();
    if scorable.is_empty() {
        return (0.5, "no scorable preference statements".into());
    }

    let mut matched_weight = 0.0;
    let mut total_weight = 0.0;
    let mut matched: Vec<&str> = Vec::new();
    for s in &scorable {
        let implication = s.implies.as_ref().unwrap();
        total_weight += s.confidence;
        if let Some(value) = profile.attr(&implication.attribute) {
            if implication.matches(value) {
                matched_weight += s.confidence;
                matched.push(&s.statement);
            }
        }
    }

    let adj = matched_weight / total_weight;
    let detail = if matched.is_empty() {
        format!("0/{} stated preferences matched", scorable.len())
    } else {
        format!(
            "{}/{} stated preferences matched: {}",
            matched.len(),
            scorable.len(),
            matched.join("; ")
        )
    };
    (adj, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IndexConfig, TrustConfig};
    use crate::embedding::normalize_vec;
    use crate::models::{
        Attribute, HardConstraint, HouseholdContext, Implication, PreferenceStatement,
        SoftPreferences, SourceSystem,
    };
    use crate::store::InMemoryStore;
    use chrono::Utc;

    fn delta(
        record_id: &str,
        attrs: &[(&str, AttrValue)],
        narrative: &str,
    ) -> crate::models::DogProfileDelta {
        crate::models::DogProfileDelta {
            dog_id: DogId::new(SourceSystem::PetPoint, record_id),
            source: SourceSystem::PetPoint,
            source_record_id: record_id.to_string(),
            fetched_at: Utc::now(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            narrative: if narrative.is_empty() {
                None
            } else {
                Some(narrative.to_string())
            },
            warnings: Vec::new(),
        }
    }

    async fn seed(store: &InMemoryStore) {
        store
            .upsert(&delta(
                "CALM",
                &[
                    (attr::ENERGY_LEVEL, AttrValue::Text("low".into())),
                    (attr::GOOD_WITH_CATS, AttrValue::Flag(true)),
                    (attr::SIZE, AttrValue::Text("small".into())),
                ],
                "A calm gentle small dog.",
            ))
            .await
            .unwrap();
        store
            .upsert(&delta(
                "WILD",
                &[
                    (attr::ENERGY_LEVEL, AttrValue::Text("high".into())),
                    (attr::GOOD_WITH_CATS, AttrValue::Flag(false)),
                    (attr::SIZE, AttrValue::Text("large".into())),
                ],
                "A high energy large dog.",
            ))
            .await
            .unwrap();
        store
            .upsert(&delta("PLAIN", &[], "A dog."))
            .await
            .unwrap();
    }

    fn unit(mut v: Vec<f32>) -> Vec<f32> {
        normalize_vec(&mut v);
        v
    }

    #[tokio::test]
    async fn test_hard_constraints_exclude_not_downrank() {
        let store = InMemoryStore::new(TrustConfig::default());
        seed(&store).await;
        let index = VectorIndex::new(IndexConfig::default());

        let adopter = AdopterProfile {
            hard_constraints: vec![HardConstraint::RequireFlag {
                attribute: attr::GOOD_WITH_CATS.to_string(),
            }],
            ..Default::default()
        };
        let resp = run_match(&store, &index, &MatchingConfig::default(), &adopter, 10)
            .await
            .unwrap();

        let ids: Vec<&str> = resp.results.iter().map(|r| r.dog_id.as_str()).collect();
        assert!(!ids.contains(&"petpoint:WILD"), "explicit false is excluded");
        assert!(ids.contains(&"petpoint:CALM"));
        // Unknown flag passes the filter.
        assert!(ids.contains(&"petpoint:PLAIN"));
        assert!(!resp.no_qualifying_candidates);
    }

    #[tokio::test]
    async fn test_no_qualifying_candidates_flagged() {
        let store = InMemoryStore::new(TrustConfig::default());
        // Every dog carries an explicit "not good with cats".
        store
            .upsert(&delta(
                "W1",
                &[(attr::GOOD_WITH_CATS, AttrValue::Flag(false))],
                "",
            ))
            .await
            .unwrap();
        store
            .upsert(&delta(
                "W2",
                &[(attr::GOOD_WITH_CATS, AttrValue::Flag(false))],
                "",
            ))
            .await
            .unwrap();
        let index = VectorIndex::new(IndexConfig::default());

        let adopter = AdopterProfile {
            hard_constraints: vec![HardConstraint::RequireFlag {
                attribute: attr::GOOD_WITH_CATS.to_string(),
            }],
            ..Default::default()
        };
        let resp = run_match(&store, &index, &MatchingConfig::default(), &adopter, 10)
            .await
            .unwrap();
        assert!(resp.results.is_empty());
        assert!(resp.no_qualifying_candidates);
    }

    #[tokio::test]
    async fn test_context_fit_ranks_compatible_dog_first() {
        let store = InMemoryStore::new(TrustConfig::default());
        seed(&store).await;
        let index = VectorIndex::new(IndexConfig::default());

        let adopter = AdopterProfile {
            household_context: HouseholdContext {
                cats: Some(true),
                home: Some(HomeType::Apartment),
                activity_level: Some(ActivityLevel::Low),
                ..Default::default()
            },
            ..Default::default()
        };
        let resp = run_match(&store, &index, &MatchingConfig::default(), &adopter, 10)
            .await
            .unwrap();
        assert_eq!(resp.results[0].dog_id.as_str(), "petpoint:CALM");
        let last = resp.results.last().unwrap();
        assert_eq!(last.dog_id.as_str(), "petpoint:WILD");
        assert!(resp.results[0].score > last.score);
        // Every result carries a decomposed explanation.
        assert!(resp.results.iter().all(|r| !r.explanation.is_empty()));
    }

    #[tokio::test]
    async fn test_similarity_drives_ranking_with_vector() {
        let store = InMemoryStore::new(TrustConfig::default());
        seed(&store).await;
        let index = VectorIndex::new(IndexConfig::default());

        let calm_vec = unit(vec![1.0, 0.0, 0.0]);
        let wild_vec = unit(vec![0.0, 1.0, 0.0]);
        index.upsert(&DogId::new(SourceSystem::PetPoint, "CALM"), calm_vec.clone(), "h1");
        index.upsert(&DogId::new(SourceSystem::PetPoint, "WILD"), wild_vec, "h2");

        let adopter = AdopterProfile {
            soft_preferences: SoftPreferences {
                vector: Some(calm_vec),
                ..Default::default()
            },
            ..Default::default()
        };
        let resp = run_match(&store, &index, &MatchingConfig::default(), &adopter, 2)
            .await
            .unwrap();
        assert_eq!(resp.results[0].dog_id.as_str(), "petpoint:CALM");
        assert!(resp
            .results[0]
            .explanation
            .iter()
            .any(|s| s.signal == "similarity"));
    }

    #[tokio::test]
    async fn test_unretrieved_embedded_dogs_stay_out_of_candidates() {
        let store = InMemoryStore::new(TrustConfig::default());
        let index = VectorIndex::new(IndexConfig::default());

        // One mildly dissimilar dog and two strongly dissimilar ones, all
        // embedded. With a candidate multiplier of 1 only the best is
        // retrieved; the rest must not re-enter scoring at a neutral
        // similarity.
        let query = unit(vec![1.0, 0.0]);
        let vectors = [
            ("NEAR", unit(vec![-0.2, 0.98])),
            ("FAR1", unit(vec![-0.9, 0.44])),
            ("FAR2", unit(vec![-0.9, -0.44])),
        ];
        for (record_id, vector) in &vectors {
            let p = store.upsert(&delta(record_id, &[], "")).await.unwrap();
            store
                .set_embedding(&p.dog_id, vector, record_id, p.revision)
                .await
                .unwrap();
            index.upsert(&p.dog_id, vector.clone(), record_id);
        }

        let cfg = MatchingConfig {
            candidate_multiplier: 1,
            ..MatchingConfig::default()
        };
        let adopter = AdopterProfile {
            soft_preferences: SoftPreferences {
                vector: Some(query),
                ..Default::default()
            },
            ..Default::default()
        };
        let resp = run_match(&store, &index, &cfg, &adopter, 1).await.unwrap();

        assert_eq!(resp.results.len(), 1);
        assert_eq!(resp.results[0].dog_id.as_str(), "petpoint:NEAR");
        // The similarity detail reports the real score, not the
        // no-embedding fallback.
        let sim = resp.results[0]
            .explanation
            .iter()
            .find(|s| s.signal == "similarity")
            .unwrap();
        assert!(!sim.detail.contains("no embedding"));
    }

    #[tokio::test]
    async fn test_unembedded_dog_scored_at_neutral_similarity() {
        let store = InMemoryStore::new(TrustConfig::default());
        let index = VectorIndex::new(IndexConfig::default());

        let query = unit(vec![1.0, 0.0]);
        let p = store.upsert(&delta("EMB", &[], "")).await.unwrap();
        store
            .set_embedding(&p.dog_id, &query, "h", p.revision)
            .await
            .unwrap();
        index.upsert(&p.dog_id, query.clone(), "h");
        store.upsert(&delta("RAW", &[], "")).await.unwrap();

        let adopter = AdopterProfile {
            soft_preferences: SoftPreferences {
                vector: Some(query),
                ..Default::default()
            },
            ..Default::default()
        };
        let resp = run_match(&store, &index, &MatchingConfig::default(), &adopter, 10)
            .await
            .unwrap();

        assert_eq!(resp.results.len(), 2);
        let raw = resp
            .results
            .iter()
            .find(|r| r.dog_id.as_str() == "petpoint:RAW")
            .unwrap();
        let sim = raw
            .explanation
            .iter()
            .find(|s| s.signal == "similarity")
            .unwrap();
        assert!(sim.detail.contains("no embedding"));
    }

    #[tokio::test]
    async fn test_similarity_weight_monotonic_for_top_candidate() {
        let store = InMemoryStore::new(TrustConfig::default());
        seed(&store).await;
        let index = VectorIndex::new(IndexConfig::default());

        let query = unit(vec![1.0, 0.0, 0.0]);
        index.upsert(&DogId::new(SourceSystem::PetPoint, "CALM"), query.clone(), "h1");
        index.upsert(
            &DogId::new(SourceSystem::PetPoint, "WILD"),
            unit(vec![0.0, 1.0, 0.0]),
            "h2",
        );

        let adopter = AdopterProfile {
            soft_preferences: SoftPreferences {
                vector: Some(query),
                ..Default::default()
            },
            ..Default::default()
        };

        let mut score_at = Vec::new();
        for w_sim in [0.2, 0.5, 0.8] {
            let cfg = MatchingConfig {
                w_sim,
                w_ctx: (1.0 - w_sim) * 0.75,
                w_conf: (1.0 - w_sim) * 0.25,
                ..MatchingConfig::default()
            };
            let resp = run_match(&store, &index, &cfg, &adopter, 10).await.unwrap();
            let top = resp
                .results
                .iter()
                .find(|r| r.dog_id.as_str() == "petpoint:CALM")
                .unwrap();
            score_at.push(top.score);
        }
        assert!(score_at[0] < score_at[1] && score_at[1] < score_at[2]);
    }

    #[tokio::test]
    async fn test_degraded_match_without_vector() {
        let store = InMemoryStore::new(TrustConfig::default());
        seed(&store).await;
        let index = VectorIndex::new(IndexConfig::default());

        let adopter = AdopterProfile {
            soft_preferences: SoftPreferences {
                vector: None,
                capability_degraded: true,
                ..Default::default()
            },
            household_context: HouseholdContext {
                cats: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };
        let resp = run_match(&store, &index, &MatchingConfig::default(), &adopter, 10)
            .await
            .unwrap();
        assert!(resp.degraded);
        assert!(!resp.results.is_empty());
        // No similarity signal when there is no vector.
        assert!(resp
            .results
            .iter()
            .all(|r| r.explanation.iter().all(|s| s.signal != "similarity")));
    }

    #[tokio::test]
    async fn test_confidence_adjustment_rewards_implied_match() {
        let store = InMemoryStore::new(TrustConfig::default());
        seed(&store).await;
        let index = VectorIndex::new(IndexConfig::default());

        let statement = PreferenceStatement {
            statement: "prefers a calm, low-energy dog".into(),
            confidence: 0.9,
            source_answer: "I want a calm dog".into(),
            implies: Some(Implication {
                attribute: attr::ENERGY_LEVEL.to_string(),
                value: AttrValue::Text("low".into()),
            }),
            scoring: true,
        };
        let adopter = AdopterProfile {
            soft_preferences: SoftPreferences {
                statements: vec![statement],
                ..Default::default()
            },
            ..Default::default()
        };
        let resp = run_match(&store, &index, &MatchingConfig::default(), &adopter, 10)
            .await
            .unwrap();
        assert_eq!(resp.results[0].dog_id.as_str(), "petpoint:CALM");
        let conf = resp.results[0]
            .explanation
            .iter()
            .find(|s| s.signal == "preference_confidence")
            .unwrap();
        assert!(conf.detail.contains("1/1"));
    }

    #[test]
    fn test_context_fit_neutral_without_context() {
        let profile = DogProfile::new(DogId::new(SourceSystem::PetPoint, "X"));
        let (fit, _) = context_fit(&AdopterProfile::default(), &profile);
        assert_eq!(fit, 0.5);
    }

    #[test]
    fn test_context_fit_unknown_flag_neutral() {
        let adopter = AdopterProfile {
            household_context: HouseholdContext {
                cats: Some(true),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut profile = DogProfile::new(DogId::new(SourceSystem::PetPoint, "X"));
        let (unknown_fit, _) = context_fit(&adopter, &profile);
        assert_eq!(unknown_fit, 0.5);

        profile.attributes.insert(
            attr::GOOD_WITH_CATS.to_string(),
            Attribute {
                value: AttrValue::Flag(true),
                source: SourceSystem::PetPoint,
                fetched_at: Utc::now(),
            },
        );
        let (known_fit, _) = context_fit(&adopter, &profile);
        assert!(known_fit > unknown_fit);
    }
}
