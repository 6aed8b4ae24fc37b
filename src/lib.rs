//! historag - history question answering over a local passage corpus
//!
//! Retrieval-evaluation-escalation pipeline with:
//! - Two-channel ranking (vector distance + BM25) with adaptive weights
//! - Confidence-gated escalation to live web retrieval
//! - Per-user generation parameters tuned by particle swarm search

pub mod types;
pub mod error;
pub mod config;
pub mod scoring;
pub mod lexical;
pub mod classifier;
pub mod weights;
pub mod ranker;
pub mod escalation;
pub mod mailbox;
pub mod evaluator;
pub mod crawler;
pub mod profile;
pub mod optimizer;
pub mod generation;
pub mod profile_service;
pub mod search;
pub mod runtime;
pub mod server;

pub use types::*;
pub use error::PipelineError;
pub use config::{ConfigError, EngineConfig};
pub use classifier::QueryClassifier;
pub use weights::AdaptiveWeightPolicy;
pub use ranker::{CandidateRanker, ConfidenceLog, ConfidenceSink};
pub use escalation::{EscalationCoordinator, EscalationState};
pub use mailbox::{Envelope, Phase, PostOffice, Service};
pub use optimizer::{GenerationParams, OptimizerError, ParameterOptimizer};
pub use profile::{ProfileStore, UserProfile};
pub use runtime::Pipeline;

#[cfg(test)]
mod tests;
