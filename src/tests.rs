//! Pipeline tests across services

use crate::config::EngineConfig;
use crate::crawler::ExternalRetriever;
use crate::escalation::{EscalationCoordinator, EscalationSettings};
use crate::evaluator::EvaluationService;
use crate::generation::CompletionClient;
use crate::lexical::Bm25Index;
use crate::mailbox::{run_service, Mailbox, Received, CRAWLER, EVALUATOR, PROMPT};
use crate::optimizer::{heuristic_params, GenerationParams};
use crate::profile::{OptimizationStatus, ProfileStore};
use crate::runtime::{Collaborators, Pipeline};
use crate::*;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

const CORPUS: [&str; 4] = [
    "José Martí murió en Dos Ríos en 1895",
    "La guerra de independencia comenzó en 1868 en La Demajagua",
    "El azúcar dominó la economía colonial del siglo diecinueve",
    "Carlos Manuel de Céspedes liberó a sus esclavos al iniciar la guerra",
];

fn corpus_index() -> Arc<Bm25Index> {
    Arc::new(Bm25Index::build(&CORPUS).unwrap())
}

fn evaluation_service(post: &PostOffice) -> EvaluationService {
    EvaluationService::new(
        CandidateRanker::new(QueryClassifier::new(), AdaptiveWeightPolicy::default()),
        EscalationCoordinator::new(EscalationSettings::default()),
        corpus_index(),
        post.clone(),
    )
}

fn ranking_envelope(query: &str, candidates: Vec<Candidate>) -> (RequestId, Envelope) {
    let request_id = RequestId::new();
    let request = RankingRequest {
        request_id: Some(request_id),
        query: query.to_string(),
        user_id: None,
        candidates,
    };
    let envelope = Envelope::new("asker", EVALUATOR, Phase::Evaluation, &request).unwrap();
    (request_id, envelope)
}

async fn expect_message(inbox: &mut Mailbox, phase: Phase) -> Envelope {
    match inbox.recv_timeout(Duration::from_secs(2)).await {
        Received::Message(env) => {
            assert_eq!(env.phase, phase);
            env
        }
        other => panic!("expected {} message, got {:?}", phase, other),
    }
}

async fn expect_silence(inbox: &mut Mailbox) {
    assert!(matches!(
        inbox.recv_timeout(Duration::from_millis(50)).await,
        Received::Idle
    ));
}

#[tokio::test]
async fn test_low_confidence_escalates_once() {
    let post = PostOffice::new();
    let mut crawler = post.register(CRAWLER);
    let mut prompt = post.register(PROMPT);
    let mut svc = evaluation_service(&post);

    // A single candidate scales to 0.5, under the 0.8 gate
    let (request_id, envelope) = ranking_envelope(
        "¿Dónde murió Martí?",
        vec![Candidate::local(0, CORPUS[0], 0.4)],
    );
    assert_ok!(svc.handle(envelope).await);

    let scrape: ScrapeRequest = expect_message(&mut crawler, Phase::ScrapeRequest).await.parse().unwrap();
    assert_eq!(scrape.request_id, request_id);
    assert_eq!(scrape.max_chunks, 10);
    assert_eq!(svc.coordinator().pending_len(), 1);
    expect_silence(&mut crawler).await;
    expect_silence(&mut prompt).await;
}

#[tokio::test]
async fn test_high_confidence_answers_locally() {
    let post = PostOffice::new();
    let mut crawler = post.register(CRAWLER);
    let mut prompt = post.register(PROMPT);
    let mut svc = evaluation_service(&post);

    // Candidate 1 wins both channels, so its blended score is 1.0
    let (request_id, envelope) = ranking_envelope(
        "¿Cuándo comenzó la guerra de independencia?",
        vec![
            Candidate::local(1, CORPUS[1], 0.1),
            Candidate::local(2, CORPUS[2], 3.0),
            Candidate::local(0, CORPUS[0], 2.5),
        ],
    );
    assert_ok!(svc.handle(envelope).await);

    let env = expect_message(&mut prompt, Phase::Prompt).await;
    assert_eq!(env.originator(), "asker");
    let ctx: PromptContext = env.parse().unwrap();
    assert_eq!(ctx.request_id, request_id);
    assert_eq!(ctx.sources, ContextSources::Local);
    assert!(ctx.context.starts_with(CORPUS[1]));
    assert_eq!(svc.coordinator().pending_len(), 0);
    expect_silence(&mut crawler).await;
}

#[tokio::test]
async fn test_scrape_result_merges_and_answers_originator() {
    let post = PostOffice::new();
    let mut crawler = post.register(CRAWLER);
    let mut prompt = post.register(PROMPT);
    let mut svc = evaluation_service(&post);

    let (request_id, envelope) = ranking_envelope(
        "¿Dónde murió Martí?",
        vec![Candidate::local(0, CORPUS[0], 0.4)],
    );
    assert_ok!(svc.handle(envelope).await);
    let _ = expect_message(&mut crawler, Phase::ScrapeRequest).await;

    let response = ScrapeResponse {
        request_id: Some(request_id),
        query: "¿Dónde murió Martí?".to_string(),
        scraped_data: vec![
            "Martí murió en combate en Dos Ríos".to_string(),
            "Texto sin relación alguna".to_string(),
        ],
    };
    let reply = Envelope::new(CRAWLER, EVALUATOR, Phase::ScrapeResult, &response).unwrap();
    assert_ok!(svc.handle(reply).await);

    let env = expect_message(&mut prompt, Phase::Prompt).await;
    assert_eq!(env.originator(), "asker");
    let ctx: PromptContext = env.parse().unwrap();
    assert_eq!(ctx.request_id, request_id);
    assert_eq!(ctx.sources, ContextSources::LocalAndExternal);
    assert!(ctx.context.contains("en combate"));
    assert_eq!(svc.coordinator().pending_len(), 0);
}

#[tokio::test]
async fn test_unmatched_scrape_result_is_dropped() {
    let post = PostOffice::new();
    let mut prompt = post.register(PROMPT);
    let _crawler = post.register(CRAWLER);
    let mut svc = evaluation_service(&post);

    let response = ScrapeResponse {
        request_id: Some(RequestId::new()),
        query: "¿Quién ganó?".to_string(),
        scraped_data: vec!["algo".to_string()],
    };
    let reply = Envelope::new(CRAWLER, EVALUATOR, Phase::ScrapeResult, &response).unwrap();
    assert_ok!(svc.handle(reply).await);

    expect_silence(&mut prompt).await;
    assert_eq!(svc.coordinator().pending_len(), 0);
}

#[tokio::test]
async fn test_malformed_payload_does_not_stop_service() {
    let post = PostOffice::new();
    let mut crawler = post.register(CRAWLER);
    let _prompt = post.register(PROMPT);
    let inbox = post.register(EVALUATOR);
    let handle = tokio::spawn(run_service(
        evaluation_service(&post),
        inbox,
        Duration::from_millis(20),
    ));

    let broken = Envelope {
        from: "asker".to_string(),
        to: EVALUATOR.to_string(),
        phase: Phase::Evaluation,
        body: "{\"query\": ".to_string(),
        reply_to: None,
    };
    post.send(broken).unwrap();

    let (request_id, envelope) = ranking_envelope(
        "¿Dónde murió Martí?",
        vec![Candidate::local(0, CORPUS[0], 0.4)],
    );
    post.send(envelope).unwrap();

    let scrape: ScrapeRequest = expect_message(&mut crawler, Phase::ScrapeRequest).await.parse().unwrap();
    assert_eq!(scrape.request_id, request_id);

    post.unregister(EVALUATOR);
    handle.await.unwrap();
}

#[test]
fn test_optimized_profile_returns_cached_params() {
    let optimizer = ParameterOptimizer::new(EngineConfig::default().pso);
    let mut profile = UserProfile::new("ana");
    let mut cached = heuristic_params(&profile);
    cached.temperature = 42.0;
    profile.metadata.optimization_status = OptimizationStatus::Optimized;
    profile.metadata.optimized_params = Some(cached.clone());

    let params = optimizer.optimize(&mut profile).unwrap();
    assert_eq!(params, cached);
}

struct CannedRetriever;

#[async_trait]
impl ExternalRetriever for CannedRetriever {
    fn name(&self) -> &'static str {
        "canned"
    }

    async fn retrieve(&self, _query: &str, max_chunks: usize) -> anyhow::Result<Vec<String>> {
        Ok(vec!["Martí cayó en Dos Ríos el 19 de mayo de 1895".to_string()]
            .into_iter()
            .take(max_chunks)
            .collect())
    }
}

/// Answers with the prompt itself so tests can see the context
struct EchoCompletion;

#[async_trait]
impl CompletionClient for EchoCompletion {
    async fn complete(&self, prompt: &str, _params: &GenerationParams) -> anyhow::Result<String> {
        Ok(prompt.to_string())
    }
}

#[tokio::test]
async fn test_end_to_end_escalated_question() {
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        receive_timeout_ms: 20,
        ..EngineConfig::default()
    };
    let pipeline = Pipeline::start(
        &config,
        corpus_index(),
        ProfileStore::open(dir.path()).unwrap(),
        Collaborators {
            retriever: Box::new(CannedRetriever),
            completion: Box::new(EchoCompletion),
        },
    );
    let mut asker = pipeline.post.register("asker");

    let (request_id, envelope) = ranking_envelope(
        "¿Dónde murió Martí?",
        vec![Candidate::local(0, CORPUS[0], 0.4)],
    );
    pipeline.post.send(envelope).unwrap();

    let answer: FinalAnswer = expect_message(&mut asker, Phase::Final).await.parse().unwrap();
    assert_eq!(answer.request_id, request_id);
    assert!(answer.answer.contains("19 de mayo de 1895"));
    assert!(answer.answer.contains(CORPUS[0]));

    let summary = pipeline.confidence.summary(config.confidence_threshold);
    assert_eq!(summary.count, 1);
    assert_eq!(summary.below_threshold, 1);

    pipeline.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_escalation_expires_on_idle_tick() {
    let post = PostOffice::new();
    let mut crawler = post.register(CRAWLER);
    let mut prompt = post.register(PROMPT);
    let service = EvaluationService::new(
        CandidateRanker::new(QueryClassifier::new(), AdaptiveWeightPolicy::default()),
        EscalationCoordinator::new(EscalationSettings {
            pending_ttl: Duration::from_millis(30),
            ..Default::default()
        }),
        corpus_index(),
        post.clone(),
    );
    let handle = tokio::spawn(run_service(service, post.register(EVALUATOR), Duration::from_millis(10)));

    let (request_id, envelope) = ranking_envelope(
        "¿Dónde murió Martí?",
        vec![Candidate::local(0, CORPUS[0], 0.4)],
    );
    post.send(envelope).unwrap();

    // The crawler never answers; only idle ticks can release the request
    let _ = expect_message(&mut crawler, Phase::ScrapeRequest).await;
    let env = expect_message(&mut prompt, Phase::Prompt).await;
    assert_eq!(env.originator(), "asker");
    let ctx: PromptContext = env.parse().unwrap();
    assert_eq!(ctx.request_id, request_id);
    assert_eq!(ctx.sources, ContextSources::Local);
    assert_eq!(ctx.context, CORPUS[0]);
    expect_silence(&mut prompt).await;

    post.unregister(EVALUATOR);
    handle.await.unwrap();
}

#[tokio::test]
async fn test_burst_of_escalations_all_answered() {
    const BURST: usize = 600;
    let dir = tempfile::tempdir().unwrap();
    let config = EngineConfig {
        receive_timeout_ms: 20,
        ..EngineConfig::default()
    };
    let pipeline = Pipeline::start(
        &config,
        corpus_index(),
        ProfileStore::open(dir.path()).unwrap(),
        Collaborators {
            retriever: Box::new(CannedRetriever),
            completion: Box::new(EchoCompletion),
        },
    );
    let mut asker = pipeline.post.register("asker");

    // Everything is queued before the asker reads a single answer
    let mut expected = HashSet::new();
    for _ in 0..BURST {
        let (request_id, envelope) = ranking_envelope(
            "¿Dónde murió Martí?",
            vec![Candidate::local(0, CORPUS[0], 0.4)],
        );
        expected.insert(request_id);
        pipeline.post.send(envelope).unwrap();
    }

    let mut answered = HashSet::new();
    while answered.len() < BURST {
        match asker.recv_timeout(Duration::from_secs(5)).await {
            Received::Message(env) => {
                let answer: FinalAnswer = env.parse().unwrap();
                answered.insert(answer.request_id);
            }
            other => panic!("only {} of {} answered, then {:?}", answered.len(), BURST, other),
        }
    }
    assert_eq!(answered, expected);
    assert_eq!(pipeline.confidence.summary(config.confidence_threshold).count, BURST);

    pipeline.shutdown().await;
}
