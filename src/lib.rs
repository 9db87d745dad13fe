//! sheltermatch: knowledge base and matching core for shelter dog
//! adoption.
//!
//! Raw records from shelter management systems and rescue message boards
//! are normalized into canonical dog profiles, merged with per-source
//! trust ranks, embedded, and served to adopters through a
//! questionnaire-driven matcher.
//!
//! ```text
//!   raw records ──> normalize ──> merge ──> DogProfile ──> embed ──> index
//!                                              │                      │
//!   questionnaire ──> interpret ──> AdopterProfile ──> matcher <──────┘
//!                                                         │
//!                                                 ranked results
//! ```
//!
//! Modules:
//! - [`normalize`]: per-source field mapping and the trust-rank merge
//! - [`store`]: durable canonical profiles with optimistic concurrency
//! - [`embedding`] / [`index`]: profile vectors and nearest-neighbor search
//! - [`questionnaire`]: answers into constraints and soft preferences
//! - [`matcher`]: hard-constraint filtering and blended ranking
//! - [`server`]: the HTTP surface for the conversational front-end

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod hnsw;
pub mod index;
pub mod ingest;
pub mod matcher;
pub mod migrate;
pub mod models;
pub mod normalize;
pub mod questionnaire;
pub mod server;
pub mod store;
