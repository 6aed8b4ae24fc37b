//! External retrieval: scraping-service client and the crawler mailbox service

use crate::error::PipelineError;
use crate::mailbox::{Envelope, Phase, PostOffice, Service, CRAWLER};
use crate::types::{ScrapeRequest, ScrapeResponse};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Source of fresh text for low-confidence queries
#[async_trait]
pub trait ExternalRetriever: Send + Sync {
    fn name(&self) -> &'static str;

    async fn retrieve(&self, query: &str, max_chunks: usize) -> Result<Vec<String>>;
}

/// Request to the scraping service
#[derive(Debug, Serialize)]
struct ScrapeServiceRequest<'a> {
    query: &'a str,
    max_chunks: usize,
}

/// Response from the scraping service
#[derive(Debug, Deserialize)]
struct ScrapeServiceResponse {
    #[serde(default)]
    chunks: Vec<String>,
    #[serde(default)]
    urls: Vec<String>,
}

/// HTTP client for a search-and-scrape service
pub struct HttpRetriever {
    service_url: String,
    client: reqwest::Client,
}

impl HttpRetriever {
    pub fn new(service_url: String) -> Self {
        Self {
            service_url,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ExternalRetriever for HttpRetriever {
    fn name(&self) -> &'static str {
        "http_scraper"
    }

    async fn retrieve(&self, query: &str, max_chunks: usize) -> Result<Vec<String>> {
        let url = format!("{}/scrape", self.service_url);
        let response = self
            .client
            .post(&url)
            .json(&ScrapeServiceRequest { query, max_chunks })
            .send()
            .await
            .with_context(|| format!("Failed to send request to scraping service at {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Scraping service error {}: {}", status, body);
        }

        let parsed: ScrapeServiceResponse = response
            .json()
            .await
            .context("Failed to parse scraping service response")?;

        info!(
            "Scraped {} chunks from {} pages for '{}'",
            parsed.chunks.len(),
            parsed.urls.len(),
            query
        );

        Ok(parsed
            .chunks
            .into_iter()
            .filter(|c| !c.trim().is_empty())
            .take(max_chunks)
            .collect())
    }
}

/// Answers `scrape_request` messages. Retriever failures still reply, with no
/// chunks, so the pending query resolves on local context.
pub struct CrawlerService {
    retriever: Box<dyn ExternalRetriever>,
    post: PostOffice,
}

impl CrawlerService {
    pub fn new(retriever: Box<dyn ExternalRetriever>, post: PostOffice) -> Self {
        Self { retriever, post }
    }
}

#[async_trait]
impl Service for CrawlerService {
    fn name(&self) -> &'static str {
        "crawler"
    }

    async fn handle(&mut self, envelope: Envelope) -> Result<()> {
        if envelope.phase != Phase::ScrapeRequest {
            return Err(PipelineError::UnexpectedPhase(envelope.phase.to_string()).into());
        }
        let request: ScrapeRequest = envelope.parse()?;

        let scraped_data = match self.retriever.retrieve(&request.query, request.max_chunks).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!("{} failed for '{}': {:#}", self.retriever.name(), request.query, e);
                Vec::new()
            }
        };

        let response = ScrapeResponse {
            request_id: Some(request.request_id),
            query: request.query,
            scraped_data,
        };
        let reply = Envelope::new(CRAWLER, envelope.originator(), Phase::ScrapeResult, &response)?;
        self.post.send(reply)?;
        Ok(())
    }
}
