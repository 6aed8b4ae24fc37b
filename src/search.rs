//! Candidate retrieval for `/ask`: the local passage corpus and the vector-search client

use crate::lexical::{tokenize, Bm25Index};
use crate::types::Candidate;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Passage store; candidate ids are positions in this list
#[derive(Debug, Clone, Default)]
pub struct Corpus {
    texts: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CorpusEntry {
    Plain(String),
    Object { text: String },
}

impl Corpus {
    pub fn new(texts: Vec<String>) -> Self {
        Self { texts }
    }

    /// JSON array of strings or of `{"text": ...}` objects
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read corpus {}", path.display()))?;
        let entries: Vec<CorpusEntry> = serde_json::from_str(&content)
            .with_context(|| format!("Invalid corpus JSON {}", path.display()))?;
        let texts = entries
            .into_iter()
            .map(|e| match e {
                CorpusEntry::Plain(text) | CorpusEntry::Object { text } => text,
            })
            .collect::<Vec<_>>();
        info!("Loaded {} passages from {}", texts.len(), path.display());
        Ok(Self { texts })
    }

    pub fn texts(&self) -> &[String] {
        &self.texts
    }

    pub fn get(&self, id: usize) -> Option<&str> {
        self.texts.get(id).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    pub fn build_index(&self) -> Result<Bm25Index> {
        Bm25Index::build(&self.texts).context("Failed to index corpus passages")
    }
}

/// Produces local candidates for a query
#[async_trait]
pub trait CandidateSearch: Send + Sync {
    fn name(&self) -> &'static str;

    async fn search(&self, query: &str, k: usize) -> Result<Vec<Candidate>>;
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    candidates: Vec<SearchHit>,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    id: usize,
    distance: f64,
    #[serde(default)]
    text: Option<String>,
}

/// HTTP client for a nearest-neighbour service returning L2 distances
pub struct HttpSemanticSearch {
    service_url: String,
    corpus: Arc<Corpus>,
    client: reqwest::Client,
}

impl HttpSemanticSearch {
    pub fn new(service_url: String, corpus: Arc<Corpus>) -> Self {
        Self {
            service_url,
            corpus,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CandidateSearch for HttpSemanticSearch {
    fn name(&self) -> &'static str {
        "semantic"
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<Candidate>> {
        let url = format!(
            "{}/search?q={}&k={}",
            self.service_url,
            urlencoding::encode(query),
            k
        );
        debug!("Querying semantic service {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to send request to semantic service at {}", self.service_url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Semantic service error {}: {}", status, body);
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .context("Failed to parse semantic service response")?;

        // Hits that are neither in the corpus nor carry text are dropped
        Ok(parsed
            .candidates
            .into_iter()
            .filter_map(|hit| {
                let text = hit.text.or_else(|| self.corpus.get(hit.id).map(str::to_string))?;
                Some(Candidate::local(hit.id, text, hit.distance))
            })
            .collect())
    }
}

/// Top-k corpus passages by BM25. Used when no vector service is configured.
///
/// Each hit carries a distance proxy `max/score - 1`, so the ranker's
/// `1/(1+d)` similarity comes out as the BM25 score relative to the best hit.
pub struct CorpusSearch {
    corpus: Arc<Corpus>,
    index: Arc<Bm25Index>,
}

impl CorpusSearch {
    pub fn new(corpus: Arc<Corpus>, index: Arc<Bm25Index>) -> Self {
        Self { corpus, index }
    }
}

#[async_trait]
impl CandidateSearch for CorpusSearch {
    fn name(&self) -> &'static str {
        "corpus"
    }

    async fn search(&self, query: &str, k: usize) -> Result<Vec<Candidate>> {
        let scores = self.index.scores(&tokenize(query))?;
        let mut ids: Vec<usize> = (0..scores.len()).filter(|&i| scores[i] > 0.0).collect();
        ids.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
        ids.truncate(k);

        let Some(best) = ids.first().map(|&id| scores[id]) else {
            debug!("No corpus passage shares a term with '{}'", query);
            return Ok(Vec::new());
        };

        Ok(ids
            .into_iter()
            .filter_map(|id| {
                let distance = best / scores[id] - 1.0;
                self.corpus
                    .get(id)
                    .map(|text| Candidate::local(id, text.to_string(), distance))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_corpus_accepts_both_shapes() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"["uno", {{"text": "dos"}}]"#).unwrap();
        let corpus = Corpus::load(file.path()).unwrap();
        assert_eq!(corpus.texts(), &["uno".to_string(), "dos".to_string()]);
        assert_eq!(corpus.get(1), Some("dos"));
        assert_eq!(corpus.get(2), None);
    }

    #[tokio::test]
    async fn test_corpus_search_orders_by_bm25() {
        let corpus = Arc::new(Corpus::new(vec![
            "la guerra de los diez años".to_string(),
            "poemas de amor".to_string(),
            "la guerra y la guerra".to_string(),
        ]));
        let index = Arc::new(corpus.build_index().unwrap());
        let search = CorpusSearch::new(corpus, index);

        let hits = search.search("guerra", 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, Some(2));
        assert_eq!(hits[0].distance, Some(0.0));
        assert!(hits[1].distance.unwrap() > 0.0);

        assert!(search.search("astronomía", 5).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corpus_hits_can_clear_the_confidence_gate() {
        use crate::classifier::QueryClassifier;
        use crate::config::EngineConfig;
        use crate::ranker::CandidateRanker;
        use crate::weights::AdaptiveWeightPolicy;

        let corpus = Arc::new(Corpus::new(vec![
            "La guerra de independencia comenzó en 1868 en La Demajagua".to_string(),
            "El azúcar dominó la economía colonial".to_string(),
            "José Martí murió en Dos Ríos en 1895".to_string(),
            "La guerra terminó con la intervención".to_string(),
        ]));
        let index = Arc::new(corpus.build_index().unwrap());
        let search = CorpusSearch::new(corpus, index.clone());

        let query = "¿Cuándo comenzó la guerra de independencia?";
        let hits = search.search(query, 10).await.unwrap();
        assert!(hits.len() >= 2);

        let ranker = CandidateRanker::new(QueryClassifier::new(), AdaptiveWeightPolicy::default());
        let ranking = ranker.rank(query, hits, &index);
        assert_eq!(ranking.candidates[0].candidate.id, Some(0));
        assert!(ranking.confidence >= EngineConfig::default().confidence_threshold);
    }
}
