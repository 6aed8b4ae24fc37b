//! Core type definitions for candidate ranking and escalation

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Correlation id threaded through every message of one query's pipeline
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Local,    // passage from the local corpus index
    External, // freshly scraped text
}

/// Text passage proposed as possibly relevant to a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    /// Index into the local corpus; `None` for external text
    #[serde(default)]
    pub id: Option<usize>,
    pub text: String,
    /// Raw vector-index distance; only local candidates carry one
    #[serde(default)]
    pub distance: Option<f64>,
    #[serde(default = "default_origin")]
    pub origin: Origin,
}

fn default_origin() -> Origin {
    Origin::Local
}

impl Candidate {
    pub fn local(id: usize, text: impl Into<String>, distance: f64) -> Self {
        Self {
            id: Some(id),
            text: text.into(),
            distance: Some(distance),
            origin: Origin::Local,
        }
    }

    pub fn external(text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
            distance: None,
            origin: Origin::External,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Factual,
    Procedural,
    Conceptual,
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryType::Factual => write!(f, "factual"),
            QueryType::Procedural => write!(f, "procedural"),
            QueryType::Conceptual => write!(f, "conceptual"),
        }
    }
}

/// Channel blend for one candidate; always sums to 1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Weights {
    pub semantic: f64,
    pub lexical: f64,
}

impl Weights {
    /// Rescale so both weights sum to 1. Non-positive totals fall back to an even split.
    pub fn normalized(semantic: f64, lexical: f64) -> Self {
        let total = semantic + lexical;
        if total <= f64::EPSILON {
            return Self { semantic: 0.5, lexical: 0.5 };
        }
        Self {
            semantic: semantic / total,
            lexical: lexical / total,
        }
    }

    pub fn lexical_only() -> Self {
        Self { semantic: 0.0, lexical: 1.0 }
    }
}

/// Candidate with its per-channel scores and blended final score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedCandidate {
    pub candidate: Candidate,
    pub semantic_score: f64, // 0.0-1.0
    pub lexical_score: f64,  // 0.0-1.0
    pub weights: Weights,
    /// Provenance multiplier: 1.0 for local passages, the trust discount for external ones
    pub trust: f64,
    pub final_score: f64,
}

impl RankedCandidate {
    pub fn new(candidate: Candidate, semantic_score: f64, lexical_score: f64, weights: Weights, trust: f64) -> Self {
        let final_score =
            trust * (weights.semantic * semantic_score + weights.lexical * lexical_score);
        Self {
            candidate,
            semantic_score,
            lexical_score,
            weights,
            trust,
            final_score,
        }
    }

    pub fn origin(&self) -> Origin {
        self.candidate.origin
    }
}

/// Output of one ranking pass
#[derive(Debug, Clone)]
pub struct Ranking {
    pub query_type: QueryType,
    pub query_tokens: Vec<String>,
    pub candidates: Vec<RankedCandidate>, // sorted by final_score, descending
    pub confidence: f64,
}

impl Ranking {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }
}

/// Sort descending by final score. Stable, so ties keep their input order.
pub fn sort_by_final_score(candidates: &mut [RankedCandidate]) {
    candidates.sort_by(|a, b| b.final_score.total_cmp(&a.final_score));
}

// ---------------------------------------------------------------------------
// Message payloads exchanged between services
// ---------------------------------------------------------------------------

/// Ranking request: a query plus raw local-index candidates
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankingRequest {
    #[serde(default)]
    pub request_id: Option<RequestId>,
    pub query: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
}

/// Escalation request sent to the external-retrieval collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeRequest {
    pub request_id: RequestId,
    pub query: String,
    pub max_chunks: usize,
}

/// External-retrieval result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeResponse {
    #[serde(default)]
    pub request_id: Option<RequestId>,
    pub query: String,
    #[serde(default)]
    pub scraped_data: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextSources {
    #[serde(rename = "local")]
    Local,
    #[serde(rename = "local+external")]
    LocalAndExternal,
}

impl ContextSources {
    pub fn of(candidates: &[RankedCandidate]) -> Self {
        if candidates.iter().any(|c| c.origin() == Origin::External) {
            ContextSources::LocalAndExternal
        } else {
            ContextSources::Local
        }
    }
}

/// Final context handed to answer generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptContext {
    pub request_id: RequestId,
    pub query: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub context: String, // space-joined top-N texts
    pub sources: ContextSources,
}

/// Answer delivered back to the query originator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalAnswer {
    pub request_id: RequestId,
    pub answer: String,
}
