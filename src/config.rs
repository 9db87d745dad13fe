use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::models::SourceSystem;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub matching: MatchingConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_dims")]
    pub dims: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: default_dims(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_dims() -> usize {
    256
}
fn default_batch_size() -> usize {
    32
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

/// Scoring weights and pipeline knobs for the matcher and the
/// questionnaire interpreter.
#[derive(Debug, Deserialize, Clone)]
pub struct MatchingConfig {
    /// Weight of embedding similarity in the blended score.
    #[serde(default = "default_w_sim")]
    pub w_sim: f64,
    /// Weight of household-context fit in the blended score.
    #[serde(default = "default_w_ctx")]
    pub w_ctx: f64,
    /// Weight of the preference-confidence adjustment in the blended score.
    #[serde(default = "default_w_conf")]
    pub w_conf: f64,
    /// Candidates retrieved from the index are `candidate_multiplier × limit`.
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    /// Extracted statements below this confidence are recorded for
    /// explanation but excluded from scoring.
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Bounded retry count for revision conflicts during ingestion.
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,
    /// Preference extractor backend: `keyword` or `disabled`.
    #[serde(default = "default_extractor")]
    pub extractor: String,
    /// Target latency for re-embedding after a narrative change: the
    /// server's backfill loop runs at this period and the matcher
    /// tolerates index staleness within the same window.
    #[serde(default = "default_reembed_target_secs")]
    pub reembed_target_secs: u64,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            w_sim: default_w_sim(),
            w_ctx: default_w_ctx(),
            w_conf: default_w_conf(),
            candidate_multiplier: default_candidate_multiplier(),
            confidence_threshold: default_confidence_threshold(),
            max_conflict_retries: default_max_conflict_retries(),
            extractor: default_extractor(),
            reembed_target_secs: default_reembed_target_secs(),
        }
    }
}

fn default_w_sim() -> f64 {
    0.6
}
fn default_w_ctx() -> f64 {
    0.3
}
fn default_w_conf() -> f64 {
    0.1
}
fn default_candidate_multiplier() -> usize {
    5
}
fn default_confidence_threshold() -> f64 {
    0.4
}
fn default_max_conflict_retries() -> u32 {
    3
}
fn default_extractor() -> String {
    "keyword".to_string()
}
fn default_reembed_target_secs() -> u64 {
    60
}

/// Vector index parameters.
///
/// Below `brute_force_threshold` active profiles, search is an exact scan
/// over filtered candidates. Above it, an HNSW graph is used; `ef_search`
/// and `oversample` are tuned so that the configured recall target holds.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_brute_force_threshold")]
    pub brute_force_threshold: usize,
    #[serde(default = "default_recall_target")]
    pub recall_target: f64,
    #[serde(default = "default_hnsw_max_connections")]
    pub hnsw_max_connections: usize,
    #[serde(default = "default_hnsw_max_layers")]
    pub hnsw_max_layers: usize,
    #[serde(default = "default_hnsw_ef_construction")]
    pub hnsw_ef_construction: usize,
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    /// The approximate path over-fetches `oversample × k` candidates before
    /// applying the attribute filter.
    #[serde(default = "default_oversample")]
    pub oversample: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            brute_force_threshold: default_brute_force_threshold(),
            recall_target: default_recall_target(),
            hnsw_max_connections: default_hnsw_max_connections(),
            hnsw_max_layers: default_hnsw_max_layers(),
            hnsw_ef_construction: default_hnsw_ef_construction(),
            ef_search: default_ef_search(),
            oversample: default_oversample(),
        }
    }
}

fn default_brute_force_threshold() -> usize {
    5000
}
fn default_recall_target() -> f64 {
    0.95
}
fn default_hnsw_max_connections() -> usize {
    16
}
fn default_hnsw_max_layers() -> usize {
    4
}
fn default_hnsw_ef_construction() -> usize {
    200
}
fn default_ef_search() -> usize {
    128
}
fn default_oversample() -> usize {
    4
}

/// Per-source trust ranks used by the merge policy.
///
/// Structured fields from a source are overwritten only by a source with an
/// equal-or-higher rank. PetPoint and RescueGroups default to the same rank
/// and can be split here if one export proves more reliable; message-board
/// inferences rank below both.
#[derive(Debug, Deserialize, Clone)]
pub struct TrustConfig {
    #[serde(default = "default_shelter_rank")]
    pub petpoint: u32,
    #[serde(default = "default_shelter_rank")]
    pub rescuegroups: u32,
    #[serde(default = "default_board_rank")]
    pub message_board: u32,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            petpoint: default_shelter_rank(),
            rescuegroups: default_shelter_rank(),
            message_board: default_board_rank(),
        }
    }
}

impl TrustConfig {
    pub fn rank(&self, source: SourceSystem) -> u32 {
        match source {
            SourceSystem::PetPoint => self.petpoint,
            SourceSystem::RescueGroups => self.rescuegroups,
            SourceSystem::MessageBoard => self.message_board,
        }
    }
}

fn default_shelter_rank() -> u32 {
    2
}
fn default_board_rank() -> u32 {
    1
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7420".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate matching weights
    let m = &config.matching;
    if m.w_sim < 0.0 || m.w_ctx < 0.0 || m.w_conf < 0.0 {
        anyhow::bail!("matching weights must be non-negative");
    }
    if m.w_sim + m.w_ctx + m.w_conf <= 0.0 {
        anyhow::bail!("matching weights must not all be zero");
    }
    if !(0.0..=1.0).contains(&m.confidence_threshold) {
        anyhow::bail!("matching.confidence_threshold must be in [0.0, 1.0]");
    }
    if m.candidate_multiplier < 1 {
        anyhow::bail!("matching.candidate_multiplier must be >= 1");
    }
    match m.extractor.as_str() {
        "keyword" | "disabled" => {}
        other => anyhow::bail!(
            "Unknown preference extractor: '{}'. Must be keyword or disabled.",
            other
        ),
    }

    // Validate index
    if !(0.5..=1.0).contains(&config.index.recall_target) {
        anyhow::bail!("index.recall_target must be in [0.5, 1.0]");
    }
    if config.index.recall_target < 0.95 {
        anyhow::bail!("index.recall_target must be >= 0.95 for approximate search");
    }

    // Validate embedding
    if config.embedding.is_enabled() && config.embedding.dims == 0 {
        anyhow::bail!(
            "embedding.dims must be > 0 when provider is '{}'",
            config.embedding.provider
        );
    }
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "stub" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, or stub.",
            other
        ),
    }
    if config.embedding.provider == "openai" && config.embedding.model.is_none() {
        anyhow::bail!("embedding.model must be specified when provider is 'openai'");
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_minimal_config_defaults() {
        let f = write_config("[db]\npath = \"/tmp/smatch.sqlite\"\n");
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.matching.w_sim, 0.6);
        assert_eq!(cfg.matching.w_ctx, 0.3);
        assert_eq!(cfg.matching.w_conf, 0.1);
        assert_eq!(cfg.matching.candidate_multiplier, 5);
        assert_eq!(cfg.index.brute_force_threshold, 5000);
        assert_eq!(cfg.trust.petpoint, cfg.trust.rescuegroups);
        assert!(cfg.trust.message_board < cfg.trust.petpoint);
        assert!(!cfg.embedding.is_enabled());
    }

    #[test]
    fn test_rejects_negative_weight() {
        let f = write_config("[db]\npath = \"/tmp/x.sqlite\"\n\n[matching]\nw_sim = -0.5\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_rejects_low_recall_target() {
        let f = write_config("[db]\npath = \"/tmp/x.sqlite\"\n\n[index]\nrecall_target = 0.8\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let f = write_config("[db]\npath = \"/tmp/x.sqlite\"\n\n[embedding]\nprovider = \"magic\"\n");
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_openai_requires_model() {
        let f = write_config("[db]\npath = \"/tmp/x.sqlite\"\n\n[embedding]\nprovider = \"openai\"\n");
        assert!(load_config(f.path()).is_err());
    }
}
