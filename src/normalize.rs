//! Record normalization: source-specific raw records into canonical
//! [`DogProfileDelta`]s, plus the trust-rank merge that folds a delta into
//! a canonical [`DogProfile`].
//!
//! Normalization is tolerant by design: an unknown or malformed field is
//! dropped with a [`FieldWarning`], never a reason to reject the record. A
//! record is rejected only when its source identifier is missing, because
//! without one there is no stable [`DogId`].

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::config::TrustConfig;
use crate::error::{MatchError, Result};
use crate::models::{
    attr, AttrValue, Attribute, DogId, DogProfile, DogProfileDelta, FieldWarning, NarrativeEntry,
    Provenance, SourceSystem,
};

/// Normalize one raw record from `source` into a delta against the
/// canonical profile it identifies.
pub fn normalize(
    raw: &Value,
    source: SourceSystem,
    fetched_at: DateTime<Utc>,
) -> Result<DogProfileDelta> {
    match source {
        SourceSystem::PetPoint => normalize_petpoint(raw, fetched_at),
        SourceSystem::RescueGroups => normalize_rescuegroups(raw, fetched_at),
        SourceSystem::MessageBoard => normalize_message_board(raw, fetched_at),
    }
}

struct DeltaBuilder {
    attributes: BTreeMap<String, AttrValue>,
    warnings: Vec<FieldWarning>,
}

impl DeltaBuilder {
    fn new() -> Self {
        Self {
            attributes: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    fn warn(&mut self, field: &str, reason: impl Into<String>) {
        self.warnings.push(FieldWarning {
            field: field.to_string(),
            reason: reason.into(),
        });
    }

    fn set(&mut self, key: &str, value: AttrValue) {
        self.attributes.insert(key.to_string(), value);
    }

    fn text_field(&mut self, raw: &Value, field: &str, key: &str) {
        match raw.get(field) {
            None | Some(Value::Null) => {}
            Some(Value::String(s)) if !s.trim().is_empty() => {
                self.set(key, AttrValue::Text(s.trim().to_string()));
            }
            Some(Value::String(_)) => {}
            Some(other) => self.warn(field, format!("expected string, got {}", json_kind(other))),
        }
    }

    fn number_field(&mut self, raw: &Value, field: &str, key: &str) {
        match raw.get(field) {
            None | Some(Value::Null) => {}
            Some(Value::Number(n)) => {
                if let Some(v) = n.as_f64() {
                    if v >= 0.0 {
                        self.set(key, AttrValue::Number(v));
                    } else {
                        self.warn(field, "negative value");
                    }
                }
            }
            Some(Value::String(s)) => match s.trim().parse::<f64>() {
                Ok(v) if v >= 0.0 => self.set(key, AttrValue::Number(v)),
                _ => self.warn(field, format!("unparseable number: '{}'", s)),
            },
            Some(other) => self.warn(field, format!("expected number, got {}", json_kind(other))),
        }
    }

    fn flag_field(&mut self, raw: &Value, field: &str, key: &str) {
        match raw.get(field) {
            None | Some(Value::Null) => {}
            Some(Value::Bool(b)) => self.set(key, AttrValue::Flag(*b)),
            Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
                "yes" | "true" | "y" | "1" => self.set(key, AttrValue::Flag(true)),
                "no" | "false" | "n" | "0" => self.set(key, AttrValue::Flag(false)),
                "" | "unknown" => {}
                _ => self.warn(field, format!("unparseable flag: '{}'", s)),
            },
            Some(other) => self.warn(field, format!("expected flag, got {}", json_kind(other))),
        }
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn required_id(raw: &Value, field: &str) -> Result<String> {
    match raw.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.trim().to_string()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(MatchError::Validation(format!(
            "record has no usable '{}' identifier",
            field
        ))),
    }
}

fn opt_str<'a>(raw: &'a Value, field: &str) -> Option<&'a str> {
    raw.get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

// ---- PetPoint ----

fn normalize_petpoint(raw: &Value, fetched_at: DateTime<Utc>) -> Result<DogProfileDelta> {
    let record_id = required_id(raw, "animalID")?;
    let mut b = DeltaBuilder::new();

    b.text_field(raw, "animalName", attr::NAME);
    b.text_field(raw, "animalBreed", attr::BREED);
    b.number_field(raw, "animalWeight", attr::WEIGHT_LBS);
    b.flag_field(raw, "animalOKWithCats", attr::GOOD_WITH_CATS);
    b.flag_field(raw, "animalOKWithDogs", attr::GOOD_WITH_DOGS);
    b.flag_field(raw, "animalOKWithKids", attr::GOOD_WITH_SMALL_CHILDREN);
    b.flag_field(raw, "animalHousetrained", attr::HOUSE_TRAINED);
    b.flag_field(raw, "animalNeedsFence", attr::NEEDS_FENCED_YARD);

    if let Some(sex) = opt_str(raw, "animalSex") {
        match sex.to_lowercase().as_str() {
            "m" | "male" => b.set(attr::SEX, AttrValue::Text("male".into())),
            "f" | "female" => b.set(attr::SEX, AttrValue::Text("female".into())),
            other => b.warn("animalSex", format!("unrecognized sex: '{}'", other)),
        }
    }

    // PetPoint reports age in whole months.
    match raw.get("animalAge") {
        None | Some(Value::Null) => {}
        Some(v) => {
            let months = v
                .as_f64()
                .or_else(|| v.as_str().and_then(|s| s.trim().parse().ok()));
            match months {
                Some(m) if m >= 0.0 => {
                    b.set(attr::AGE_YEARS, AttrValue::Number(round2(m / 12.0)))
                }
                _ => b.warn("animalAge", "unparseable age in months"),
            }
        }
    }

    if let Some(size) = opt_str(raw, "animalGeneralSizePotential") {
        match crate::models::SizeClass::parse(size) {
            Some(s) => b.set(attr::SIZE, AttrValue::Text(s.as_str().to_string())),
            None => b.warn("animalGeneralSizePotential", format!("unrecognized size: '{}'", size)),
        }
    }

    if let Some(energy) = opt_str(raw, "animalEnergyLevel") {
        match parse_energy(energy) {
            Some(e) => b.set(attr::ENERGY_LEVEL, AttrValue::Text(e.into())),
            None => b.warn("animalEnergyLevel", format!("unrecognized energy level: '{}'", energy)),
        }
    }

    let narrative = opt_str(raw, "animalDescription").map(str::to_string);

    Ok(DogProfileDelta {
        dog_id: DogId::new(SourceSystem::PetPoint, &record_id),
        source: SourceSystem::PetPoint,
        source_record_id: record_id,
        fetched_at,
        attributes: b.attributes,
        narrative,
        warnings: b.warnings,
    })
}

// ---- RescueGroups ----

fn normalize_rescuegroups(raw: &Value, fetched_at: DateTime<Utc>) -> Result<DogProfileDelta> {
    let record_id = required_id(raw, "id")?;
    let mut b = DeltaBuilder::new();

    b.text_field(raw, "name", attr::NAME);
    b.text_field(raw, "breedPrimary", attr::BREED);
    b.number_field(raw, "weightPounds", attr::WEIGHT_LBS);
    b.flag_field(raw, "isCatsOk", attr::GOOD_WITH_CATS);
    b.flag_field(raw, "isDogsOk", attr::GOOD_WITH_DOGS);
    b.flag_field(raw, "isKidsOk", attr::GOOD_WITH_SMALL_CHILDREN);
    b.flag_field(raw, "isHousetrained", attr::HOUSE_TRAINED);
    b.flag_field(raw, "isYardRequired", attr::NEEDS_FENCED_YARD);

    if let Some(sex) = opt_str(raw, "sex") {
        match sex.to_lowercase().as_str() {
            "m" | "male" => b.set(attr::SEX, AttrValue::Text("male".into())),
            "f" | "female" => b.set(attr::SEX, AttrValue::Text("female".into())),
            other => b.warn("sex", format!("unrecognized sex: '{}'", other)),
        }
    }

    // Prefer an exact birth date; fall back to the coarse age group mapped
    // to a year range so numeric age constraints stay comparable across
    // sources.
    if let Some(birth) = opt_str(raw, "birthDate") {
        match chrono::NaiveDate::parse_from_str(birth, "%Y-%m-%d") {
            Ok(date) => {
                let days = (fetched_at.date_naive() - date).num_days();
                if days >= 0 {
                    b.set(attr::AGE_YEARS, AttrValue::Number(round2(days as f64 / 365.25)));
                } else {
                    b.warn("birthDate", "birth date in the future");
                }
            }
            Err(_) => b.warn("birthDate", format!("unparseable date: '{}'", birth)),
        }
    } else if let Some(group) = opt_str(raw, "ageGroup") {
        match group.to_lowercase().as_str() {
            "baby" => b.set(attr::AGE_YEARS, AttrValue::Range { low: 0.0, high: 0.5 }),
            "young" => b.set(attr::AGE_YEARS, AttrValue::Range { low: 0.5, high: 2.0 }),
            "adult" => b.set(attr::AGE_YEARS, AttrValue::Range { low: 2.0, high: 7.0 }),
            "senior" => b.set(attr::AGE_YEARS, AttrValue::Range { low: 7.0, high: 20.0 }),
            other => b.warn("ageGroup", format!("unrecognized age group: '{}'", other)),
        }
    }

    if let Some(size) = opt_str(raw, "sizeGroup") {
        match crate::models::SizeClass::parse(size) {
            Some(s) => b.set(attr::SIZE, AttrValue::Text(s.as_str().to_string())),
            None => b.warn("sizeGroup", format!("unrecognized size: '{}'", size)),
        }
    }

    if let Some(energy) = opt_str(raw, "activityLevel") {
        match parse_energy(energy) {
            Some(e) => b.set(attr::ENERGY_LEVEL, AttrValue::Text(e.into())),
            None => b.warn("activityLevel", format!("unrecognized energy level: '{}'", energy)),
        }
    }

    let narrative = opt_str(raw, "descriptionText").map(str::to_string);

    Ok(DogProfileDelta {
        dog_id: DogId::new(SourceSystem::RescueGroups, &record_id),
        source: SourceSystem::RescueGroups,
        source_record_id: record_id,
        fetched_at,
        attributes: b.attributes,
        narrative,
        warnings: b.warnings,
    })
}

// ---- Message boards ----

const BREED_PATTERNS: &[(&str, &str)] = &[
    ("lab", "Labrador Retriever"),
    ("labrador", "Labrador Retriever"),
    ("golden", "Golden Retriever"),
    ("german shepherd", "German Shepherd"),
    ("gsd", "German Shepherd"),
    ("pit", "Pit Bull Terrier"),
    ("pittie", "Pit Bull Terrier"),
    ("beagle", "Beagle"),
    ("chihuahua", "Chihuahua"),
    ("husky", "Siberian Husky"),
    ("poodle", "Poodle"),
    ("boxer", "Boxer"),
    ("dachshund", "Dachshund"),
    ("terrier", "Terrier"),
    ("shepherd", "Shepherd"),
    ("hound", "Hound"),
];

fn age_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(\d+)[\s-]*(year|month)s?[\s-]*old\b").unwrap())
}

fn normalize_message_board(raw: &Value, fetched_at: DateTime<Utc>) -> Result<DogProfileDelta> {
    let url = opt_str(raw, "source_url")
        .ok_or_else(|| MatchError::Validation("message-board post has no source_url".into()))?;
    let title = opt_str(raw, "title").unwrap_or("");
    if title.is_empty() && opt_str(raw, "body").is_none() {
        return Err(MatchError::Validation(
            "message-board post has neither title nor body".into(),
        ));
    }
    let record_id = format!("{}/{}", url, title);

    let mut b = DeltaBuilder::new();
    let body = opt_str(raw, "body").unwrap_or("");
    let text = format!("{} {}", title, body);
    let lower = text.to_lowercase();

    for (pattern, breed) in BREED_PATTERNS {
        if lower.contains(pattern) {
            b.set(attr::BREED, AttrValue::Text((*breed).to_string()));
            break;
        }
    }

    if let Some(caps) = age_regex().captures(&lower) {
        let n: f64 = caps[1].parse().unwrap_or(0.0);
        let years = if caps[2].starts_with("month") { n / 12.0 } else { n };
        if years > 0.0 {
            b.set(attr::AGE_YEARS, AttrValue::Number(round2(years)));
        }
    }

    if lower.contains(" she ") || lower.contains("female") || lower.contains(" her ") {
        b.set(attr::SEX, AttrValue::Text("female".into()));
    } else if lower.contains(" he ") || lower.contains("male") || lower.contains(" his ") {
        b.set(attr::SEX, AttrValue::Text("male".into()));
    }

    // Negated phrases first so "not good with cats" does not match the
    // positive pattern.
    for (negative, positive, key) in [
        ("not good with cats", "good with cats", attr::GOOD_WITH_CATS),
        ("no cats", "loves cats", attr::GOOD_WITH_CATS),
        ("not good with dogs", "good with dogs", attr::GOOD_WITH_DOGS),
        ("no other dogs", "loves other dogs", attr::GOOD_WITH_DOGS),
        ("not good with kids", "good with kids", attr::GOOD_WITH_SMALL_CHILDREN),
        ("no young children", "good with children", attr::GOOD_WITH_SMALL_CHILDREN),
    ] {
        if lower.contains(negative) {
            b.set(key, AttrValue::Flag(false));
        } else if lower.contains(positive) && b.attributes.get(key).is_none() {
            b.set(key, AttrValue::Flag(true));
        }
    }

    if lower.contains("needs a fenced yard") || lower.contains("fenced yard required") {
        b.set(attr::NEEDS_FENCED_YARD, AttrValue::Flag(true));
    }
    if lower.contains("house trained") || lower.contains("housebroken") {
        b.set(attr::HOUSE_TRAINED, AttrValue::Flag(true));
    }

    if lower.contains("high energy") || lower.contains("very active") {
        b.set(attr::ENERGY_LEVEL, AttrValue::Text("high".into()));
    } else if lower.contains("calm") || lower.contains("couch potato") || lower.contains("low energy") {
        b.set(attr::ENERGY_LEVEL, AttrValue::Text("low".into()));
    }

    let narrative = if body.is_empty() { title.to_string() } else { body.to_string() };

    Ok(DogProfileDelta {
        dog_id: DogId::new(SourceSystem::MessageBoard, &record_id),
        source: SourceSystem::MessageBoard,
        source_record_id: record_id,
        fetched_at,
        attributes: b.attributes,
        narrative: Some(narrative),
        warnings: b.warnings,
    })
}

fn parse_energy(s: &str) -> Option<&'static str> {
    match s.to_lowercase().as_str() {
        "low" | "lazy" => Some("low"),
        "moderate" | "medium" => Some("moderate"),
        "high" | "very high" => Some("high"),
        _ => None,
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

// ---- Merge ----

/// Safety flags where the restrictive value always wins, regardless of
/// source trust. A single "not good with cats" report makes the canonical
/// profile restrictive until corrected upstream.
fn restrictive_value(key: &str) -> Option<bool> {
    match key {
        attr::GOOD_WITH_CATS | attr::GOOD_WITH_DOGS | attr::GOOD_WITH_SMALL_CHILDREN => Some(false),
        attr::NEEDS_FENCED_YARD => Some(true),
        _ => None,
    }
}

/// Fold a normalized delta into a canonical profile.
///
/// Per attribute: a restrictive safety flag wins unconditionally; otherwise
/// higher trust rank wins, then later fetch time, then the lexicographically
/// smaller source name. The rule depends only on the stored `(source,
/// fetched_at)` of each side, so merging the same set of deltas in any
/// order yields the same profile.
pub fn merge_delta(profile: &mut DogProfile, delta: &DogProfileDelta, trust: &TrustConfig) {
    for (key, value) in &delta.attributes {
        let incoming = Attribute {
            value: value.clone(),
            source: delta.source,
            fetched_at: delta.fetched_at,
        };
        match profile.attributes.get(key) {
            None => {
                profile.attributes.insert(key.clone(), incoming);
            }
            Some(existing) => {
                if should_replace(key, existing, &incoming, trust) {
                    profile.attributes.insert(key.clone(), incoming);
                }
            }
        }
    }

    if let Some(text) = &delta.narrative {
        let entry = NarrativeEntry {
            source: delta.source,
            source_record_id: delta.source_record_id.clone(),
            fetched_at: delta.fetched_at,
            text: text.clone(),
        };
        // Same source + record replaces its previous contribution; distinct
        // sources accumulate.
        profile
            .narrative
            .retain(|n| !(n.source == entry.source && n.source_record_id == entry.source_record_id));
        profile.narrative.push(entry);
        profile.narrative.sort_by(|a, b| {
            (a.fetched_at, a.source.as_str(), &a.source_record_id)
                .cmp(&(b.fetched_at, b.source.as_str(), &b.source_record_id))
        });
    }

    let prov = Provenance {
        source: delta.source,
        source_record_id: delta.source_record_id.clone(),
        fetched_at: delta.fetched_at,
    };
    if !profile
        .provenance
        .iter()
        .any(|p| p.source == prov.source && p.source_record_id == prov.source_record_id && p.fetched_at == prov.fetched_at)
    {
        profile.provenance.push(prov);
        profile.provenance.sort_by(|a, b| {
            (a.fetched_at, a.source.as_str(), &a.source_record_id)
                .cmp(&(b.fetched_at, b.source.as_str(), &b.source_record_id))
        });
    }
}

fn should_replace(key: &str, existing: &Attribute, incoming: &Attribute, trust: &TrustConfig) -> bool {
    if let Some(restrictive) = restrictive_value(key) {
        let existing_restrictive = existing.value.as_flag() == Some(restrictive);
        let incoming_restrictive = incoming.value.as_flag() == Some(restrictive);
        if existing_restrictive != incoming_restrictive {
            return incoming_restrictive;
        }
    }

    let (er, ir) = (trust.rank(existing.source), trust.rank(incoming.source));
    if ir != er {
        return ir > er;
    }
    if incoming.fetched_at != existing.fetched_at {
        return incoming.fetched_at > existing.fetched_at;
    }
    incoming.source.as_str() < existing.source.as_str()
}
