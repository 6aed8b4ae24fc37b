//! Confidence-gated escalation to external retrieval
//!
//! A ranked query either answers immediately (confidence at or above the
//! threshold) or parks a [`PendingQuery`] and asks the crawler for more text.
//! When the crawler replies, external chunks are scored against a BM25 index
//! built from just the retrieved set, sigmoid-scaled, trust-discounted, and
//! merged with every local candidate before the final top-N cut.
//!
//! Pending entries are keyed by request id. Entries nobody answers are
//! evicted by [`EscalationCoordinator::sweep`] and answered with local context.

use crate::config::EngineConfig;
use crate::lexical::Bm25Index;
use crate::scoring::sigmoid;
use crate::types::*;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationState {
    RankedHighConfidence,
    RankedLowConfidencePending,
    MergedFinal,
    /// Pending entry swept after its TTL; answered with local context only
    Expired,
}

/// Parked state for a query awaiting external retrieval
#[derive(Debug, Clone)]
pub struct PendingQuery {
    pub query: String,
    pub user_id: Option<String>,
    pub candidates: Vec<RankedCandidate>, // all local results, ranked
    pub created_at: Instant,
    pub originator: String,
    pub query_tokens: Vec<String>,
}

/// Final context plus where to send it
#[derive(Debug, Clone)]
pub struct Answer {
    pub state: EscalationState,
    pub originator: String,
    pub context: PromptContext,
    pub selected: Vec<RankedCandidate>,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Answer(Answer),
    Escalate(ScrapeRequest),
}

impl Decision {
    pub fn state(&self) -> EscalationState {
        match self {
            Decision::Answer(answer) => answer.state,
            Decision::Escalate(_) => EscalationState::RankedLowConfidencePending,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EscalationSettings {
    pub confidence_threshold: f64,
    pub top_n: usize,
    pub max_chunks: usize,
    pub sigmoid_steepness: f64,
    pub trust_discount: f64,
    pub pending_ttl: Duration,
}

impl From<&EngineConfig> for EscalationSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            top_n: config.top_n,
            max_chunks: config.max_chunks,
            sigmoid_steepness: config.sigmoid_steepness,
            trust_discount: config.trust_discount,
            pending_ttl: config.pending_ttl(),
        }
    }
}

impl Default for EscalationSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

/// Owns the pending-escalation table. Single owner, single task: no locking.
pub struct EscalationCoordinator {
    settings: EscalationSettings,
    pending: HashMap<RequestId, PendingQuery>,
}

impl EscalationCoordinator {
    pub fn new(settings: EscalationSettings) -> Self {
        Self {
            settings,
            pending: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &EscalationSettings {
        &self.settings
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending(&self, request_id: &RequestId) -> Option<&PendingQuery> {
        self.pending.get(request_id)
    }

    /// Gate a fresh ranking on its confidence
    pub fn decide(
        &mut self,
        request_id: RequestId,
        query: &str,
        user_id: Option<String>,
        ranking: Ranking,
        originator: &str,
        now: Instant,
    ) -> Decision {
        if ranking.confidence >= self.settings.confidence_threshold {
            info!(
                "Confidence {:.3} >= {:.2} for '{}'; answering locally",
                ranking.confidence, self.settings.confidence_threshold, query
            );
            return Decision::Answer(self.finalize(
                EscalationState::RankedHighConfidence,
                request_id,
                query,
                user_id,
                originator.to_string(),
                ranking.candidates,
            ));
        }

        info!(
            "Confidence {:.3} < {:.2} for '{}'; requesting external retrieval",
            ranking.confidence, self.settings.confidence_threshold, query
        );
        let previous = self.pending.insert(
            request_id,
            PendingQuery {
                query: query.to_string(),
                user_id,
                candidates: ranking.candidates,
                created_at: now,
                originator: originator.to_string(),
                query_tokens: ranking.query_tokens,
            },
        );
        if previous.is_some() {
            warn!("Request {} was already pending; replaced", request_id);
        }

        Decision::Escalate(ScrapeRequest {
            request_id,
            query: query.to_string(),
            max_chunks: self.settings.max_chunks,
        })
    }

    /// Merge an external-retrieval result into its pending query.
    ///
    /// Returns `None` when nothing is pending for the response.
    pub fn resolve(&mut self, response: ScrapeResponse) -> Option<Answer> {
        let Some((request_id, state)) = self.take_pending(&response) else {
            warn!(
                "External result for '{}' matches no pending query; discarding",
                response.query
            );
            return None;
        };

        info!(
            "Merging {} external chunks into {} local candidates for '{}'",
            response.scraped_data.len(),
            state.candidates.len(),
            state.query
        );

        let mut pool = state.candidates;
        pool.extend(self.score_external(response.scraped_data, &state.query_tokens));

        Some(self.finalize(
            EscalationState::MergedFinal,
            request_id,
            &state.query,
            state.user_id,
            state.originator,
            pool,
        ))
    }

    /// Evict entries older than the TTL and answer them with local context
    pub fn sweep(&mut self, now: Instant) -> Vec<Answer> {
        let ttl = self.settings.pending_ttl;
        let expired: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.created_at) >= ttl)
            .map(|(id, _)| *id)
            .collect();

        let removed: Vec<(RequestId, PendingQuery)> = expired
            .into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|p| (id, p)))
            .collect();

        removed
            .into_iter()
            .map(|(id, p)| {
                warn!("Escalation for '{}' timed out after {:?}; answering locally", p.query, ttl);
                self.finalize(EscalationState::Expired, id, &p.query, p.user_id, p.originator, p.candidates)
            })
            .collect()
    }

    /// Request id wins; responses without one fall back to the oldest
    /// pending entry with the same query text.
    fn take_pending(&mut self, response: &ScrapeResponse) -> Option<(RequestId, PendingQuery)> {
        let request_id = match response.request_id {
            Some(id) => id,
            None => self
                .pending
                .iter()
                .filter(|(_, p)| p.query == response.query)
                .min_by_key(|(_, p)| p.created_at)
                .map(|(id, _)| *id)?,
        };
        self.pending.remove(&request_id).map(|p| (request_id, p))
    }

    /// Lexical-only scoring for scraped text, discounted for provenance
    fn score_external(&self, chunks: Vec<String>, query_tokens: &[String]) -> Vec<RankedCandidate> {
        if chunks.is_empty() {
            return Vec::new();
        }
        let raw = match Bm25Index::build(&chunks).and_then(|index| index.scores(query_tokens)) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Could not index {} external chunks: {}", chunks.len(), e);
                vec![0.0; chunks.len()]
            }
        };
        let scaled = sigmoid(&raw, self.settings.sigmoid_steepness, None);

        chunks
            .into_iter()
            .zip(scaled)
            .map(|(text, lexical)| {
                RankedCandidate::new(
                    Candidate::external(text),
                    0.0,
                    lexical,
                    Weights::lexical_only(),
                    self.settings.trust_discount,
                )
            })
            .collect()
    }

    fn finalize(
        &self,
        state: EscalationState,
        request_id: RequestId,
        query: &str,
        user_id: Option<String>,
        originator: String,
        mut pool: Vec<RankedCandidate>,
    ) -> Answer {
        sort_by_final_score(&mut pool);
        pool.truncate(self.settings.top_n);

        let context = pool
            .iter()
            .map(|c| c.candidate.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        Answer {
            state,
            originator,
            context: PromptContext {
                request_id,
                query: query.to_string(),
                user_id,
                context,
                sources: ContextSources::of(&pool),
            },
            selected: pool,
        }
    }
}
