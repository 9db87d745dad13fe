//! Core data models for the knowledge base and matching pipeline.
//!
//! A [`DogProfile`] is the canonical, deduplicated representation of one dog
//! merged across all source systems. An [`AdopterProfile`] is the ephemeral,
//! per-questionnaire representation of an adopter. Both sides meet in the
//! matcher, which produces [`MatchResult`]s wrapped in a [`MatchResponse`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============ Identity & sources ============

/// The external systems that deliver raw dog records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceSystem {
    PetPoint,
    RescueGroups,
    MessageBoard,
}

impl SourceSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceSystem::PetPoint => "petpoint",
            SourceSystem::RescueGroups => "rescuegroups",
            SourceSystem::MessageBoard => "message_board",
        }
    }
}

impl FromStr for SourceSystem {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "petpoint" => Ok(SourceSystem::PetPoint),
            "rescuegroups" => Ok(SourceSystem::RescueGroups),
            "message_board" | "message-board" => Ok(SourceSystem::MessageBoard),
            other => Err(format!(
                "unknown source system: '{}'. Available: petpoint, rescuegroups, message_board",
                other
            )),
        }
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier for a dog, unique across all source systems.
///
/// Formed as `"{source_system}:{source_record_id}"` so that the same record
/// re-ingested from the same source deduplicates to one canonical profile.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DogId(pub String);

impl DogId {
    pub fn new(source: SourceSystem, record_id: &str) -> Self {
        DogId(format!("{}:{}", source.as_str(), record_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============ Attributes ============

/// Canonical attribute keys produced by the normalizer.
///
/// Absence of a key in the attribute map is the explicit "unknown" state;
/// it is never conflated with `Flag(false)`.
pub mod attr {
    pub const NAME: &str = "name";
    pub const BREED: &str = "breed";
    pub const SEX: &str = "sex";
    pub const AGE_YEARS: &str = "age_years";
    pub const WEIGHT_LBS: &str = "weight_lbs";
    pub const SIZE: &str = "size";
    pub const ENERGY_LEVEL: &str = "energy_level";
    pub const GOOD_WITH_CATS: &str = "good_with_cats";
    pub const GOOD_WITH_DOGS: &str = "good_with_dogs";
    pub const GOOD_WITH_SMALL_CHILDREN: &str = "good_with_small_children";
    pub const NEEDS_FENCED_YARD: &str = "needs_fenced_yard";
    pub const HOUSE_TRAINED: &str = "house_trained";
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    Text(String),
    Number(f64),
    Range { low: f64, high: f64 },
    Flag(bool),
}

impl AttrValue {
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            AttrValue::Flag(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Render for profile text and explanations.
    pub fn display(&self) -> String {
        match self {
            AttrValue::Text(s) => s.clone(),
            AttrValue::Number(n) => format!("{}", n),
            AttrValue::Range { low, high } => {
                if (high - low).abs() < f64::EPSILON {
                    format!("{}", low)
                } else {
                    format!("{}-{}", low, high)
                }
            }
            AttrValue::Flag(b) => if *b { "yes" } else { "no" }.to_string(),
        }
    }
}

/// An attribute value plus the source that contributed it.
///
/// The contributing source and fetch time drive the trust-rank merge rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub value: AttrValue,
    pub source: SourceSystem,
    pub fetched_at: DateTime<Utc>,
}

// ============ Dog profile ============

/// Availability state; only `Available` dogs are retrievable by the matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DogStatus {
    Available,
    Pending,
    Adopted,
    Removed,
}

impl DogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DogStatus::Available => "available",
            DogStatus::Pending => "pending",
            DogStatus::Adopted => "adopted",
            DogStatus::Removed => "removed",
        }
    }
}

impl FromStr for DogStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "available" => Ok(DogStatus::Available),
            "pending" => Ok(DogStatus::Pending),
            "adopted" => Ok(DogStatus::Adopted),
            "removed" => Ok(DogStatus::Removed),
            other => Err(format!(
                "unknown status: '{}'. Available: available, pending, adopted, removed",
                other
            )),
        }
    }
}

/// One free-text contribution to a profile, provenance-tagged per source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarrativeEntry {
    pub source: SourceSystem,
    pub source_record_id: String,
    pub fetched_at: DateTime<Utc>,
    pub text: String,
}

impl NarrativeEntry {
    pub fn content_hash(&self) -> String {
        hash_text(&self.text)
    }
}

/// A record of which source contributed data, required for conflict
/// resolution and auditability. Never discarded on merge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: SourceSystem,
    pub source_record_id: String,
    pub fetched_at: DateTime<Utc>,
}

/// The canonical, merged representation of one dog across all sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DogProfile {
    pub dog_id: DogId,
    pub attributes: BTreeMap<String, Attribute>,
    pub narrative: Vec<NarrativeEntry>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub embedding_hash: Option<String>,
    pub provenance: Vec<Provenance>,
    pub status: DogStatus,
    /// Monotonic per-dog revision for optimistic conflict detection.
    pub revision: i64,
    /// Timestamp of the most recent successful match, used as a search
    /// tie-breaker (recorded via the administrative boundary).
    #[serde(default)]
    pub last_match_at: Option<i64>,
}

impl DogProfile {
    pub fn new(dog_id: DogId) -> Self {
        Self {
            dog_id,
            attributes: BTreeMap::new(),
            narrative: Vec::new(),
            embedding: None,
            embedding_hash: None,
            provenance: Vec::new(),
            status: DogStatus::Available,
            revision: 0,
            last_match_at: None,
        }
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key).map(|a| &a.value)
    }

    pub fn flag(&self, key: &str) -> Option<bool> {
        self.attr(key).and_then(AttrValue::as_flag)
    }

    /// Render the canonical text fed to the embedding provider: salient
    /// structured attributes as `Key: value` lines, followed by the
    /// narrative in provenance order.
    pub fn profile_text(&self) -> String {
        const SALIENT: &[(&str, &str)] = &[
            (attr::NAME, "Name"),
            (attr::BREED, "Breed"),
            (attr::SEX, "Sex"),
            (attr::AGE_YEARS, "Age (years)"),
            (attr::WEIGHT_LBS, "Weight (lbs)"),
            (attr::SIZE, "Size"),
            (attr::ENERGY_LEVEL, "Energy level"),
            (attr::GOOD_WITH_CATS, "Good with cats"),
            (attr::GOOD_WITH_DOGS, "Good with dogs"),
            (attr::GOOD_WITH_SMALL_CHILDREN, "Good with small children"),
            (attr::NEEDS_FENCED_YARD, "Needs fenced yard"),
            (attr::HOUSE_TRAINED, "House trained"),
        ];

        let mut parts = Vec::new();
        for (key, label) in SALIENT {
            if let Some(value) = self.attr(key) {
                parts.push(format!("{}: {}", label, value.display()));
            }
        }
        for entry in &self.narrative {
            parts.push(entry.text.clone());
        }
        parts.join("\n")
    }

    /// Content hash of the embedding input; identical text is a no-op on
    /// re-embedding.
    pub fn content_hash(&self) -> String {
        hash_text(&self.profile_text())
    }
}

/// Output of one `normalize` call: the contribution of a single raw record
/// to a canonical profile, before merging.
#[derive(Debug, Clone)]
pub struct DogProfileDelta {
    pub dog_id: DogId,
    pub source: SourceSystem,
    pub source_record_id: String,
    pub fetched_at: DateTime<Utc>,
    pub attributes: BTreeMap<String, AttrValue>,
    pub narrative: Option<String>,
    pub warnings: Vec<FieldWarning>,
}

/// A dropped or malformed field, recorded without failing the record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldWarning {
    pub field: String,
    pub reason: String,
}

// ============ Adopter profile ============

/// Canonical size classes, ordered for "size at most" constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
    XLarge,
}

impl SizeClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SizeClass::Small => "small",
            SizeClass::Medium => "medium",
            SizeClass::Large => "large",
            SizeClass::XLarge => "xlarge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "small" => Some(SizeClass::Small),
            "medium" => Some(SizeClass::Medium),
            "large" => Some(SizeClass::Large),
            "xlarge" | "x-large" | "extra large" => Some(SizeClass::XLarge),
            _ => None,
        }
    }
}

/// A non-negotiable adopter requirement. A dog failing any hard constraint
/// is excluded from results entirely, never down-ranked.
///
/// Exclusion requires an explicit conflicting value on the profile: an
/// unknown attribute passes (absence ≠ false). The merge policy's
/// restrictive-flag bias ensures any source reporting a safety flag makes
/// it explicit on the canonical profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HardConstraint {
    /// The dog must not carry an explicit `Flag(false)` for this attribute
    /// (e.g. `good_with_cats`).
    RequireFlag { attribute: String },
    /// The dog must not carry an explicit `Flag(true)` for this attribute
    /// (e.g. `needs_fenced_yard` when the adopter has no yard).
    ForbidFlag { attribute: String },
    /// A numeric or range attribute must not exceed `max`.
    NumberAtMost { attribute: String, max: f64 },
    /// A numeric or range attribute must not fall below `min`.
    NumberAtLeast { attribute: String, min: f64 },
    /// The dog's size class must be at most `max`.
    SizeAtMost { max: SizeClass },
}

impl HardConstraint {
    pub fn satisfied_by(&self, profile: &DogProfile) -> bool {
        match self {
            HardConstraint::RequireFlag { attribute } => {
                profile.flag(attribute) != Some(false)
            }
            HardConstraint::ForbidFlag { attribute } => {
                profile.flag(attribute) != Some(true)
            }
            HardConstraint::NumberAtMost { attribute, max } => match profile.attr(attribute) {
                Some(AttrValue::Number(n)) => n <= max,
                Some(AttrValue::Range { low, .. }) => low <= max,
                _ => true,
            },
            HardConstraint::NumberAtLeast { attribute, min } => match profile.attr(attribute) {
                Some(AttrValue::Number(n)) => n >= min,
                Some(AttrValue::Range { high, .. }) => high >= min,
                _ => true,
            },
            HardConstraint::SizeAtMost { max } => match profile.attr(attr::SIZE) {
                Some(AttrValue::Text(s)) => match SizeClass::parse(s) {
                    Some(size) => size <= *max,
                    None => true,
                },
                _ => true,
            },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            HardConstraint::RequireFlag { attribute } => {
                format!("must not be flagged '{} = no'", attribute)
            }
            HardConstraint::ForbidFlag { attribute } => {
                format!("must not be flagged '{} = yes'", attribute)
            }
            HardConstraint::NumberAtMost { attribute, max } => {
                format!("{} must be at most {}", attribute, max)
            }
            HardConstraint::NumberAtLeast { attribute, min } => {
                format!("{} must be at least {}", attribute, min)
            }
            HardConstraint::SizeAtMost { max } => {
                format!("size must be at most {}", max.as_str())
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HomeType {
    Apartment,
    House,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Low,
    Moderate,
    High,
}

/// Structured facts about the adopter's household, used both as
/// hard-constraint sources and as scoring modifiers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HouseholdContext {
    #[serde(default)]
    pub children: Option<bool>,
    #[serde(default)]
    pub cats: Option<bool>,
    #[serde(default)]
    pub dogs: Option<bool>,
    #[serde(default)]
    pub home: Option<HomeType>,
    #[serde(default)]
    pub yard: Option<bool>,
    #[serde(default)]
    pub activity_level: Option<ActivityLevel>,
}

/// An attribute expectation implied by an extracted preference statement,
/// used for the preference-confidence scoring term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Implication {
    pub attribute: String,
    pub value: AttrValue,
}

impl Implication {
    /// Whether a dog's attribute value satisfies this implication.
    /// Ranges match on overlap; everything else on equality.
    pub fn matches(&self, dog_value: &AttrValue) -> bool {
        match (&self.value, dog_value) {
            (AttrValue::Range { low, high }, AttrValue::Range { low: dl, high: dh }) => {
                low <= dh && dl <= high
            }
            (AttrValue::Range { low, high }, AttrValue::Number(n)) => low <= n && n <= high,
            (a, b) => a == b,
        }
    }
}

/// One discrete preference extracted from a free-text answer, with
/// provenance back to the answer text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreferenceStatement {
    pub statement: String,
    /// Extraction confidence in [0, 1].
    pub confidence: f64,
    /// The answer text this statement was extracted from.
    pub source_answer: String,
    #[serde(default)]
    pub implies: Option<Implication>,
    /// Whether this statement participates in scoring (above the
    /// confidence threshold). Below-threshold statements are retained for
    /// explanation only.
    pub scoring: bool,
}

/// Soft, vectorized preferences derived from free text. Used only for
/// ranking, never for exclusion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SoftPreferences {
    /// Preference vector in the dog embedding space, weighted-averaged over
    /// all free-text answers. `None` when there was no free text or the
    /// embedding capability was unavailable.
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
    #[serde(default)]
    pub statements: Vec<PreferenceStatement>,
    /// Set when the embedding capability failed and matching degraded to
    /// structured-only scoring.
    #[serde(default)]
    pub capability_degraded: bool,
}

/// The ephemeral, per-questionnaire representation of an adopter. Never
/// persisted by the core.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdopterProfile {
    #[serde(default)]
    pub hard_constraints: Vec<HardConstraint>,
    #[serde(default)]
    pub soft_preferences: SoftPreferences,
    #[serde(default)]
    pub household_context: HouseholdContext,
}

// ============ Match results ============

/// One scoring term's contribution to a result, for user-facing
/// justification. The explanation is a decomposable list, not an opaque
/// number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreSignal {
    pub signal: String,
    pub contribution: f64,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResult {
    pub dog_id: DogId,
    /// Blended score in [0, 1].
    pub score: f64,
    pub explanation: Vec<ScoreSignal>,
}

/// The ranked response for one match request — the wire contract consumed
/// by the conversational front-end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchResponse {
    pub results: Vec<MatchResult>,
    /// Distinguished signal: no dog passed hard-constraint filtering. Not
    /// an error; the caller may suggest relaxing constraints.
    pub no_qualifying_candidates: bool,
    /// The embedding capability was unavailable and ranking used
    /// structured context only.
    pub degraded: bool,
}

pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile_with(key: &str, value: AttrValue) -> DogProfile {
        let mut p = DogProfile::new(DogId::new(SourceSystem::PetPoint, "A1"));
        p.attributes.insert(
            key.to_string(),
            Attribute {
                value,
                source: SourceSystem::PetPoint,
                fetched_at: Utc::now(),
            },
        );
        p
    }

    #[test]
    fn test_require_flag_unknown_passes() {
        let c = HardConstraint::RequireFlag {
            attribute: attr::GOOD_WITH_CATS.to_string(),
        };
        let p = DogProfile::new(DogId::new(SourceSystem::PetPoint, "A1"));
        assert!(c.satisfied_by(&p), "absence of a flag is not a violation");
    }

    #[test]
    fn test_require_flag_explicit_false_fails() {
        let c = HardConstraint::RequireFlag {
            attribute: attr::GOOD_WITH_CATS.to_string(),
        };
        let p = profile_with(attr::GOOD_WITH_CATS, AttrValue::Flag(false));
        assert!(!c.satisfied_by(&p));
    }

    #[test]
    fn test_size_at_most() {
        let c = HardConstraint::SizeAtMost {
            max: SizeClass::Medium,
        };
        assert!(c.satisfied_by(&profile_with(attr::SIZE, AttrValue::Text("small".into()))));
        assert!(c.satisfied_by(&profile_with(attr::SIZE, AttrValue::Text("medium".into()))));
        assert!(!c.satisfied_by(&profile_with(attr::SIZE, AttrValue::Text("large".into()))));
    }

    #[test]
    fn test_number_at_most_range_uses_low_bound() {
        let c = HardConstraint::NumberAtMost {
            attribute: attr::AGE_YEARS.to_string(),
            max: 5.0,
        };
        // Only an explicit violation excludes: a range starting below max passes.
        assert!(c.satisfied_by(&profile_with(
            attr::AGE_YEARS,
            AttrValue::Range {
                low: 4.0,
                high: 6.0
            }
        )));
        assert!(!c.satisfied_by(&profile_with(
            attr::AGE_YEARS,
            AttrValue::Range {
                low: 7.0,
                high: 9.0
            }
        )));
    }

    #[test]
    fn test_implication_range_overlap() {
        let imp = Implication {
            attribute: attr::AGE_YEARS.to_string(),
            value: AttrValue::Range {
                low: 0.0,
                high: 2.0,
            },
        };
        assert!(imp.matches(&AttrValue::Range {
            low: 1.0,
            high: 3.0
        }));
        assert!(imp.matches(&AttrValue::Number(1.5)));
        assert!(!imp.matches(&AttrValue::Number(4.0)));
    }

    #[test]
    fn test_profile_text_salient_order_and_narrative() {
        let mut p = profile_with(attr::BREED, AttrValue::Text("Beagle".into()));
        p.narrative.push(NarrativeEntry {
            source: SourceSystem::MessageBoard,
            source_record_id: "post-1".into(),
            fetched_at: Utc::now(),
            text: "A sweet, calm boy.".into(),
        });
        let text = p.profile_text();
        assert!(text.starts_with("Breed: Beagle"));
        assert!(text.contains("A sweet, calm boy."));
    }

    #[test]
    fn test_content_hash_stable() {
        let p = profile_with(attr::BREED, AttrValue::Text("Beagle".into()));
        assert_eq!(p.content_hash(), p.content_hash());
    }

    #[test]
    fn test_dog_id_composite() {
        let id = DogId::new(SourceSystem::RescueGroups, "987");
        assert_eq!(id.as_str(), "rescuegroups:987");
    }

    #[test]
    fn test_status_roundtrip() {
        for s in ["available", "pending", "adopted", "removed"] {
            assert_eq!(DogStatus::from_str(s).unwrap().as_str(), s);
        }
        assert!(DogStatus::from_str("lost").is_err());
    }
}
