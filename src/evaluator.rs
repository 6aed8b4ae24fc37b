//! Evaluation service: ranks incoming candidates and runs the escalation protocol

use crate::error::PipelineError;
use crate::escalation::{Answer, Decision, EscalationCoordinator};
use crate::lexical::Bm25Index;
use crate::mailbox::{Envelope, Phase, PostOffice, Service, CRAWLER, EVALUATOR, PROMPT};
use crate::ranker::CandidateRanker;
use crate::types::*;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub struct EvaluationService {
    ranker: CandidateRanker,
    coordinator: EscalationCoordinator,
    index: Arc<Bm25Index>,
    post: PostOffice,
}

impl EvaluationService {
    pub fn new(
        ranker: CandidateRanker,
        coordinator: EscalationCoordinator,
        index: Arc<Bm25Index>,
        post: PostOffice,
    ) -> Self {
        Self {
            ranker,
            coordinator,
            index,
            post,
        }
    }

    pub fn coordinator(&self) -> &EscalationCoordinator {
        &self.coordinator
    }

    async fn handle_ranking(&mut self, envelope: &Envelope) -> Result<()> {
        let request: RankingRequest = envelope.parse()?;
        let request_id = request.request_id.unwrap_or_default();
        info!(
            "Evaluating '{}' ({} candidates, request {})",
            request.query,
            request.candidates.len(),
            request_id
        );

        // Lazy TTL check on every new request
        self.flush_expired();

        let ranking = self.ranker.rank(&request.query, request.candidates, &self.index);
        let decision = self.coordinator.decide(
            request_id,
            &request.query,
            request.user_id,
            ranking,
            envelope.originator(),
            Instant::now(),
        );

        match decision {
            Decision::Answer(answer) => self.send_answer(answer),
            Decision::Escalate(scrape) => {
                let envelope = Envelope::new(EVALUATOR, CRAWLER, Phase::ScrapeRequest, &scrape)?;
                self.post.send(envelope)?;
                Ok(())
            }
        }
    }

    async fn handle_scrape_result(&mut self, envelope: &Envelope) -> Result<()> {
        let response: ScrapeResponse = envelope.parse()?;
        match self.coordinator.resolve(response) {
            Some(answer) => self.send_answer(answer),
            None => Ok(()),
        }
    }

    fn send_answer(&self, answer: Answer) -> Result<()> {
        info!(
            "Context for '{}' ready ({:?}, {} passages, sources {:?})",
            answer.context.query,
            answer.state,
            answer.selected.len(),
            answer.context.sources
        );
        let envelope = Envelope::new(EVALUATOR, PROMPT, Phase::Prompt, &answer.context)?
            .reply_to(answer.originator);
        self.post.send(envelope)?;
        Ok(())
    }

    fn flush_expired(&mut self) {
        for answer in self.coordinator.sweep(Instant::now()) {
            if let Err(e) = self.send_answer(answer) {
                warn!("Failed to deliver expired escalation: {:#}", e);
            }
        }
    }
}

#[async_trait]
impl Service for EvaluationService {
    fn name(&self) -> &'static str {
        "evaluation"
    }

    async fn handle(&mut self, envelope: Envelope) -> Result<()> {
        match envelope.phase {
            Phase::Evaluation => self.handle_ranking(&envelope).await,
            Phase::ScrapeResult => self.handle_scrape_result(&envelope).await,
            other => Err(PipelineError::UnexpectedPhase(other.to_string()).into()),
        }
    }

    async fn on_idle(&mut self) -> Result<()> {
        self.flush_expired();
        Ok(())
    }
}
