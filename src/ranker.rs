//! Multi-signal candidate ranking (semantic distance + BM25)

use crate::classifier::QueryClassifier;
use crate::lexical::{tokenize, Bm25Index};
use crate::scoring::{normalize, Normalization};
use crate::types::*;
use crate::weights::AdaptiveWeightPolicy;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Receives every confidence value the ranker computes
pub trait ConfidenceSink: Send + Sync {
    fn record(&self, query_type: QueryType, confidence: f64);
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ConfidenceSummary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub below_threshold: usize,
}

/// In-memory confidence history, bounded to the most recent entries
pub struct ConfidenceLog {
    capacity: usize,
    entries: Mutex<VecDeque<(QueryType, f64)>>,
}

impl ConfidenceLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn values(&self) -> Vec<f64> {
        match self.entries.lock() {
            Ok(entries) => entries.iter().map(|(_, c)| *c).collect(),
            Err(poisoned) => poisoned.into_inner().iter().map(|(_, c)| *c).collect(),
        }
    }

    pub fn summary(&self, threshold: f64) -> ConfidenceSummary {
        let values = self.values();
        if values.is_empty() {
            return ConfidenceSummary::default();
        }
        ConfidenceSummary {
            count: values.len(),
            mean: values.iter().sum::<f64>() / values.len() as f64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            below_threshold: values.iter().filter(|c| **c < threshold).count(),
        }
    }
}

impl ConfidenceSink for ConfidenceLog {
    fn record(&self, query_type: QueryType, confidence: f64) {
        if self.capacity == 0 {
            return;
        }
        let mut entries = match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        };
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back((query_type, confidence));
    }
}

pub struct CandidateRanker {
    classifier: QueryClassifier,
    policy: AdaptiveWeightPolicy,
    /// Applied to both local channels
    normalization: Normalization,
    sink: Option<Arc<dyn ConfidenceSink>>,
}

impl CandidateRanker {
    pub fn new(classifier: QueryClassifier, policy: AdaptiveWeightPolicy) -> Self {
        Self {
            classifier,
            policy,
            normalization: Normalization::Robust,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn ConfidenceSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn classify(&self, query: &str) -> QueryType {
        self.classifier.classify(query)
    }

    /// Rank local candidates against the query.
    ///
    /// Similarity is `1/(1+distance)`; the lexical channel is BM25 over the
    /// whole corpus, looked up by candidate id. Both are robust-scaled and
    /// blended with per-candidate adaptive weights.
    pub fn rank(&self, query: &str, candidates: Vec<Candidate>, index: &Bm25Index) -> Ranking {
        let query_type = self.classifier.classify(query);
        let query_tokens = tokenize(query);

        if candidates.is_empty() {
            info!("No candidates for '{}'; confidence 0", query);
            self.record(query_type, 0.0);
            return Ranking {
                query_type,
                query_tokens,
                candidates: Vec::new(),
                confidence: 0.0,
            };
        }

        let similarities: Vec<f64> = candidates
            .iter()
            .map(|c| c.distance.map(|d| 1.0 / (1.0 + d.max(0.0))).unwrap_or(0.0))
            .collect();
        let semantic = normalize(&similarities, self.normalization);

        let corpus_scores = index.scores(&query_tokens).unwrap_or_else(|e| {
            warn!("Lexical scoring failed for '{}': {}", query, e);
            Vec::new()
        });
        let raw_lexical: Vec<f64> = candidates
            .iter()
            .map(|c| c.id.and_then(|id| corpus_scores.get(id).copied()).unwrap_or(0.0))
            .collect();
        let lexical = normalize(&raw_lexical, self.normalization);

        debug!("semantic={:?} lexical={:?}", semantic, lexical);

        let mut ranked: Vec<RankedCandidate> = candidates
            .into_iter()
            .zip(semantic.into_iter().zip(lexical))
            .map(|(candidate, (sem, lex))| {
                let weights = self.policy.weights(query_type, &candidate.text);
                RankedCandidate::new(candidate, sem, lex, weights, 1.0)
            })
            .collect();

        sort_by_final_score(&mut ranked);
        let confidence = ranked.first().map(|c| c.final_score).unwrap_or(0.0);
        self.record(query_type, confidence);

        info!(
            "Ranked {} candidates for {} query: confidence {:.3}",
            ranked.len(),
            query_type,
            confidence
        );

        Ranking {
            query_type,
            query_tokens,
            candidates: ranked,
            confidence,
        }
    }

    fn record(&self, query_type: QueryType, confidence: f64) {
        if let Some(ref sink) = self.sink {
            sink.record(query_type, confidence);
        }
    }
}
