//! Questionnaire interpretation: structured answers into hard constraints
//! and household context, free text into soft preferences.
//!
//! Hard constraints only ever come from structured answers; free text can
//! influence ranking but can never exclude a dog. When the embedding
//! capability is unavailable the interpreter still produces a usable
//! profile and marks it degraded.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use tracing::warn;

use crate::config::MatchingConfig;
use crate::embedding::{mean_vector, EmbeddingProvider};
use crate::error::{MatchError, Result};
use crate::models::{
    attr, ActivityLevel, AdopterProfile, AttrValue, HardConstraint, HomeType, Implication,
    PreferenceStatement, SizeClass,
};

/// One questionnaire answer as submitted by the front-end.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Answer {
    MultipleChoice { question: String, choice: String },
    Scaled { question: String, value: i64 },
    FreeText { question: String, text: String },
}

/// A preference pulled out of free text by an extractor backend.
#[derive(Debug, Clone)]
pub struct ExtractedPreference {
    pub statement: String,
    pub confidence: f64,
    pub implies: Option<Implication>,
}

/// Pluggable free-text preference extraction. A failure here degrades to
/// an empty statement list; it never fails the questionnaire.
#[async_trait]
pub trait PreferenceExtractor: Send + Sync {
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedPreference>>;
}

pub fn create_extractor(cfg: &MatchingConfig) -> Result<Arc<dyn PreferenceExtractor>> {
    match cfg.extractor.as_str() {
        "keyword" => Ok(Arc::new(KeywordExtractor)),
        "disabled" => Ok(Arc::new(DisabledExtractor)),
        other => Err(MatchError::Validation(format!(
            "unknown preference extractor: '{}'",
            other
        ))),
    }
}

pub struct DisabledExtractor;

#[async_trait]
impl PreferenceExtractor for DisabledExtractor {
    async fn extract(&self, _text: &str) -> Result<Vec<ExtractedPreference>> {
        Ok(Vec::new())
    }
}

/// Rule-table extractor: keyword phrases with fixed confidences and, where
/// meaningful, an implied attribute expectation for the scoring term.
pub struct KeywordExtractor;

struct Rule {
    phrases: &'static [&'static str],
    statement: &'static str,
    confidence: f64,
    implies: Option<(&'static str, ImpliedValue)>,
}

enum ImpliedValue {
    Text(&'static str),
    Flag(bool),
    Range(f64, f64),
}

const RULES: &[Rule] = &[
    Rule {
        phrases: &["calm", "low energy", "low-energy", "relaxed", "couch potato", "mellow"],
        statement: "prefers a calm, low-energy dog",
        confidence: 0.9,
        implies: Some((attr::ENERGY_LEVEL, ImpliedValue::Text("low"))),
    },
    Rule {
        phrases: &["active", "running", "jogging", "hiking", "energetic"],
        statement: "prefers an active, high-energy dog",
        confidence: 0.85,
        implies: Some((attr::ENERGY_LEVEL, ImpliedValue::Text("high"))),
    },
    Rule {
        phrases: &["small dog", "little dog", "lap dog"],
        statement: "prefers a small dog",
        confidence: 0.8,
        implies: Some((attr::SIZE, ImpliedValue::Text("small"))),
    },
    Rule {
        phrases: &["big dog", "large dog"],
        statement: "prefers a large dog",
        confidence: 0.8,
        implies: Some((attr::SIZE, ImpliedValue::Text("large"))),
    },
    Rule {
        phrases: &["senior dog", "older dog", "old dog"],
        statement: "open to a senior dog",
        confidence: 0.7,
        implies: Some((attr::AGE_YEARS, ImpliedValue::Range(7.0, 20.0))),
    },
    Rule {
        phrases: &["puppy", "young dog"],
        statement: "prefers a young dog",
        confidence: 0.7,
        implies: Some((attr::AGE_YEARS, ImpliedValue::Range(0.0, 2.0))),
    },
    Rule {
        phrases: &["with cats", "cat friendly", "cat-friendly"],
        statement: "wants a dog that gets along with cats",
        confidence: 0.85,
        implies: Some((attr::GOOD_WITH_CATS, ImpliedValue::Flag(true))),
    },
    Rule {
        phrases: &["with kids", "with children", "kid friendly", "kid-friendly"],
        statement: "wants a dog that is good with children",
        confidence: 0.85,
        implies: Some((attr::GOOD_WITH_SMALL_CHILDREN, ImpliedValue::Flag(true))),
    },
    Rule {
        phrases: &["house trained", "housebroken", "potty trained"],
        statement: "prefers a house-trained dog",
        confidence: 0.8,
        implies: Some((attr::HOUSE_TRAINED, ImpliedValue::Flag(true))),
    },
    Rule {
        phrases: &["quiet", "doesn't bark", "not a barker"],
        statement: "prefers a quiet dog",
        confidence: 0.6,
        implies: Some((attr::ENERGY_LEVEL, ImpliedValue::Text("low"))),
    },
    // Weak signal, retained for explanation only at the default threshold.
    Rule {
        phrases: &["first dog", "first-time owner", "never had a dog"],
        statement: "is a first-time dog owner",
        confidence: 0.35,
        implies: None,
    },
];

#[async_trait]
impl PreferenceExtractor for KeywordExtractor {
    async fn extract(&self, text: &str) -> Result<Vec<ExtractedPreference>> {
        let lower = text.to_lowercase();
        let mut out = Vec::new();
        for rule in RULES {
            if rule.phrases.iter().any(|p| lower.contains(p)) {
                out.push(ExtractedPreference {
                    statement: rule.statement.to_string(),
                    confidence: rule.confidence,
                    implies: rule.implies.as_ref().map(|(key, value)| Implication {
                        attribute: (*key).to_string(),
                        value: match value {
                            ImpliedValue::Text(s) => AttrValue::Text((*s).to_string()),
                            ImpliedValue::Flag(b) => AttrValue::Flag(*b),
                            ImpliedValue::Range(low, high) => AttrValue::Range {
                                low: *low,
                                high: *high,
                            },
                        },
                    }),
                });
            }
        }
        Ok(out)
    }
}

/// Interpret a full questionnaire into an [`AdopterProfile`].
pub async fn interpret(
    answers: &[Answer],
    provider: &dyn EmbeddingProvider,
    extractor: &dyn PreferenceExtractor,
    cfg: &MatchingConfig,
) -> Result<AdopterProfile> {
    let mut profile = AdopterProfile::default();
    let mut free_texts: Vec<String> = Vec::new();

    for answer in answers {
        match answer {
            Answer::MultipleChoice { question, choice } => {
                apply_choice(&mut profile, question, choice);
            }
            Answer::Scaled { question, value } => {
                apply_scaled(&mut profile, question, *value);
            }
            Answer::FreeText { text, .. } => {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    free_texts.push(trimmed.to_string());
                }
            }
        }
    }

    // Soft preferences: extracted statements plus one averaged vector over
    // all free-text answers, equally weighted.
    for text in &free_texts {
        match extractor.extract(text).await {
            Ok(extracted) => {
                for e in extracted {
                    profile.soft_preferences.statements.push(PreferenceStatement {
                        statement: e.statement,
                        confidence: e.confidence,
                        source_answer: text.clone(),
                        implies: e.implies,
                        scoring: e.confidence >= cfg.confidence_threshold,
                    });
                }
            }
            Err(e) => {
                warn!(error = %e, "preference extraction failed, continuing without statements");
            }
        }
    }

    if !free_texts.is_empty() {
        match provider.embed(&free_texts).await {
            Ok(vectors) => {
                profile.soft_preferences.vector = mean_vector(&vectors);
            }
            Err(MatchError::CapabilityUnavailable(reason)) => {
                warn!(%reason, "embedding unavailable, questionnaire degrades to structured-only");
                profile.soft_preferences.capability_degraded = true;
            }
            Err(e) => return Err(e),
        }
    }

    Ok(profile)
}

fn yes(choice: &str) -> bool {
    matches!(choice.to_lowercase().as_str(), "yes" | "y" | "true")
}

fn no(choice: &str) -> bool {
    matches!(choice.to_lowercase().as_str(), "no" | "n" | "false")
}

fn apply_choice(profile: &mut AdopterProfile, question: &str, choice: &str) {
    let ctx = &mut profile.household_context;
    match question {
        "has_children" => {
            if yes(choice) {
                ctx.children = Some(true);
                profile.hard_constraints.push(HardConstraint::RequireFlag {
                    attribute: attr::GOOD_WITH_SMALL_CHILDREN.to_string(),
                });
            } else if no(choice) {
                ctx.children = Some(false);
            }
        }
        "has_cats" => {
            if yes(choice) {
                ctx.cats = Some(true);
                profile.hard_constraints.push(HardConstraint::RequireFlag {
                    attribute: attr::GOOD_WITH_CATS.to_string(),
                });
            } else if no(choice) {
                ctx.cats = Some(false);
            }
        }
        "has_dogs" => {
            if yes(choice) {
                ctx.dogs = Some(true);
                profile.hard_constraints.push(HardConstraint::RequireFlag {
                    attribute: attr::GOOD_WITH_DOGS.to_string(),
                });
            } else if no(choice) {
                ctx.dogs = Some(false);
            }
        }
        "home_type" => match choice.to_lowercase().as_str() {
            "apartment" => ctx.home = Some(HomeType::Apartment),
            "house" => ctx.home = Some(HomeType::House),
            other => warn!(question, choice = other, "unrecognized answer choice, skipping"),
        },
        "has_yard" => {
            if yes(choice) {
                ctx.yard = Some(true);
            } else if no(choice) {
                ctx.yard = Some(false);
                profile.hard_constraints.push(HardConstraint::ForbidFlag {
                    attribute: attr::NEEDS_FENCED_YARD.to_string(),
                });
            }
        }
        "max_size" => match SizeClass::parse(choice) {
            Some(max) => profile
                .hard_constraints
                .push(HardConstraint::SizeAtMost { max }),
            None => warn!(question, choice, "unrecognized size choice, skipping"),
        },
        other => {
            warn!(question = other, "unknown questionnaire question, skipping");
        }
    }
}

fn apply_scaled(profile: &mut AdopterProfile, question: &str, value: i64) {
    match question {
        // 1..=5 self-reported activity.
        "activity_level" => {
            profile.household_context.activity_level = Some(match value {
                i64::MIN..=2 => ActivityLevel::Low,
                3 => ActivityLevel::Moderate,
                _ => ActivityLevel::High,
            });
        }
        "max_age_years" => {
            if value > 0 {
                profile.hard_constraints.push(HardConstraint::NumberAtMost {
                    attribute: attr::AGE_YEARS.to_string(),
                    max: value as f64,
                });
            }
        }
        other => {
            warn!(question = other, "unknown questionnaire question, skipping");
        }
    }
}
