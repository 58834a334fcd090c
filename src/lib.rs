//! Multi-strategy natural-language to SQL engine.
//!
//! Questions are answered by a deterministic pattern library when a pattern is
//! confident enough, otherwise by several language-model generation paths run
//! concurrently. Every chosen statement goes through a five-stage validation
//! pipeline before it is returned.

pub mod confidence;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod feedback;
pub mod generation;
pub mod llm;
pub mod metadata;
pub mod patterns;
pub mod session;
pub mod stats;
pub mod validation;

pub use config::EngineConfig;
pub use engine::{QueryEngine, QueryEngineBuilder};
pub use error::{EngineError, Explanation, Result};
pub use session::{CandidateSource, GenerationPath, QuerySession, SqlCandidate};
