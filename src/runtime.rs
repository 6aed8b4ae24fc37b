//! Wires the four services onto one post office and spawns their loops

use crate::classifier::{QueryClassifier, YearDetector};
use crate::config::EngineConfig;
use crate::crawler::{CrawlerService, ExternalRetriever};
use crate::escalation::{EscalationCoordinator, EscalationSettings};
use crate::evaluator::EvaluationService;
use crate::generation::{CompletionClient, PromptService};
use crate::lexical::Bm25Index;
use crate::mailbox::{run_service, PostOffice, CRAWLER, EVALUATOR, PROFILE, PROMPT};
use crate::optimizer::ParameterOptimizer;
use crate::profile::{InteractionUpdater, ProfileStore};
use crate::profile_service::ProfileService;
use crate::ranker::{CandidateRanker, ConfidenceLog};
use crate::weights::AdaptiveWeightPolicy;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Confidence values kept for `/stats`
const CONFIDENCE_HISTORY: usize = 1000;

/// External collaborators the pipeline talks to
pub struct Collaborators {
    pub retriever: Box<dyn ExternalRetriever>,
    pub completion: Box<dyn CompletionClient>,
}

pub struct Pipeline {
    pub post: PostOffice,
    pub confidence: Arc<ConfidenceLog>,
    pub handles: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Register every mailbox, then spawn each service loop
    pub fn start(
        config: &EngineConfig,
        index: Arc<Bm25Index>,
        profiles: ProfileStore,
        collaborators: Collaborators,
    ) -> Self {
        let post = PostOffice::new();
        let confidence = Arc::new(ConfidenceLog::new(CONFIDENCE_HISTORY));
        let receive_timeout = config.receive_timeout();

        let ranker = CandidateRanker::new(
            QueryClassifier::with_entity_detector(Box::new(YearDetector)),
            AdaptiveWeightPolicy::from_config(config),
        )
        .with_sink(confidence.clone());
        let evaluation = EvaluationService::new(
            ranker,
            EscalationCoordinator::new(EscalationSettings::from(config)),
            index,
            post.clone(),
        );
        let crawler = CrawlerService::new(collaborators.retriever, post.clone());
        let prompt = PromptService::new(collaborators.completion, post.clone(), &config.generation);
        let profile = ProfileService::new(
            profiles,
            InteractionUpdater::new(config.reoptimize_every),
            ParameterOptimizer::new(config.pso.clone()),
            post.clone(),
        );

        let handles = vec![
            tokio::spawn(run_service(evaluation, post.register(EVALUATOR), receive_timeout)),
            tokio::spawn(run_service(crawler, post.register(CRAWLER), receive_timeout)),
            tokio::spawn(run_service(prompt, post.register(PROMPT), receive_timeout)),
            tokio::spawn(run_service(profile, post.register(PROFILE), receive_timeout)),
        ];
        info!("Pipeline started with {} services", handles.len());

        Self {
            post,
            confidence,
            handles,
        }
    }

    /// Close every service mailbox and wait for the loops to drain
    pub async fn shutdown(self) {
        for address in [EVALUATOR, CRAWLER, PROMPT, PROFILE] {
            self.post.unregister(address);
        }
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                warn!("Service task ended abnormally: {}", e);
            }
        }
        info!("Pipeline stopped");
    }
}
