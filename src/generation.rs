//! Answer generation: chat-completions client, personalized prompt, prompt service

use crate::config::GenerationConfig;
use crate::error::PipelineError;
use crate::mailbox::{Envelope, Phase, PostOffice, Service, PROMPT};
use crate::optimizer::{heuristic_params, GenerationParams};
use crate::profile::UserProfile;
use crate::types::{FinalAnswer, PromptContext};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const FALLBACK_ANSWER: &str = "No se pudo generar una respuesta. Por favor intenta nuevamente.";

/// Text generation backend
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, prompt: &str, params: &GenerationParams) -> Result<String>;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f64,
    top_p: f64,
    repetition_penalty: f64,
    max_tokens: u32,
    stream: bool,
}

/// OpenAI-style `/chat/completions` endpoint
pub struct HttpCompletionClient {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpCompletionClient {
    pub fn new(endpoint: String, config: &GenerationConfig) -> Self {
        Self {
            endpoint,
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: params.temperature,
            top_p: params.nucleus_p,
            repetition_penalty: params.repetition_penalty,
            max_tokens: params.max_length,
            stream: false,
        };

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send request to completion service at {}", self.endpoint))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Completion service error {}: {}", status, body);
        }

        let data: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse completion response")?;
        Ok(extract_content(&data))
    }
}

/// `message.content`, else `choices[0].message.content`, else the raw JSON
pub fn extract_content(data: &serde_json::Value) -> String {
    if let Some(content) = data.pointer("/message/content").and_then(|c| c.as_str()) {
        return content.to_string();
    }
    if let Some(content) = data.pointer("/choices/0/message/content").and_then(|c| c.as_str()) {
        return content.to_string();
    }
    data.to_string()
}

pub fn render_prompt(query: &str, context: &str, params: &GenerationParams) -> String {
    let affinity = params
        .topic_affinity
        .iter()
        .map(|(topic, value)| format!("{}: {:.2}", topic, value))
        .collect::<Vec<_>>()
        .join(", ");
    let criticism = serde_json::to_value(params.source_criticism)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    format!(
        "[INST] Eres un asistente experto en historia que responde preguntas de manera altamente personalizada.\n\
         Sigue estrictamente estas directrices:\n\n\
         ### Perfil de usuario y preferencias:\n\
         - Estilo de comunicación: {style}\n\
         - Nivel de humor: {humor:.2} (0: serio, 1: humorístico)\n\
         - Formalidad: {formality:.2} (0: coloquial, 1: académico)\n\
         - Temas preferidos: {preferred}\n\
         - Temas evitados: {disliked}\n\
         - Tipos de respuesta preferidos: {response_types}\n\n\
         ### Enfoque histórico requerido:\n\
         - Perspectiva historiográfica: {approach}\n\
         - Tratamiento de fuentes: {criticism}\n\
         - Preferencia de evidencia: {evidence}\n\
         - Manejo de controversias: {controversy}\n\
         - Enfoque temporal: {temporal}\n\n\
         ### Instrucciones clave:\n\
         1. Respuesta basada ÚNICAMENTE en: {context}\n\
         2. Adapta el tono usando humor={humor:.2} y formalidad={formality:.2}\n\
         3. Formato principal: {response_types}\n\
         4. Afinidad temática: {affinity}\n\
         5. Evita: {disliked}\n\
         6. Limita la respuesta a {max_length} tokens\n\n\
         ### Pregunta:\n\
         {query}\n\
         [/INST]\n\n\
         Respuesta personalizada:",
        style = params.style,
        humor = params.humor_level,
        formality = params.formality_level,
        preferred = params.preferred_topics.join(", "),
        disliked = params.disliked_topics.join(", "),
        response_types = params.response_types.join(", "),
        approach = params.historiographical_approach,
        criticism = criticism,
        evidence = params.evidence_preference.join(", "),
        controversy = params.controversy_handling,
        temporal = params.temporal_focus,
        context = context,
        affinity = affinity,
        max_length = params.max_length,
        query = query,
    )
}

/// Body of a `params` message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserParams {
    pub user_id: String,
    pub params: GenerationParams,
}

/// Turns ranked context into the final answer
pub struct PromptService {
    client: Box<dyn CompletionClient>,
    post: PostOffice,
    params: HashMap<String, GenerationParams>,
    defaults: GenerationParams,
    max_retries: u32,
    backoff: Duration,
}

impl PromptService {
    pub fn new(client: Box<dyn CompletionClient>, post: PostOffice, config: &GenerationConfig) -> Self {
        Self {
            client,
            post,
            params: HashMap::new(),
            defaults: heuristic_params(&UserProfile::new("anonymous")),
            max_retries: config.max_retries.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }

    fn params_for(&self, user_id: Option<&str>) -> &GenerationParams {
        user_id
            .and_then(|id| self.params.get(id))
            .unwrap_or(&self.defaults)
    }

    /// Bounded retries with exponential backoff, then the fallback text
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> String {
        let mut delay = self.backoff;
        for attempt in 1..=self.max_retries {
            match self.client.complete(prompt, params).await {
                Ok(answer) => return answer,
                Err(e) => {
                    warn!("Generation attempt {}/{} failed: {:#}", attempt, self.max_retries, e);
                    if attempt < self.max_retries {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        FALLBACK_ANSWER.to_string()
    }
}

#[async_trait]
impl Service for PromptService {
    fn name(&self) -> &'static str {
        "prompt"
    }

    async fn handle(&mut self, envelope: Envelope) -> Result<()> {
        match envelope.phase {
            Phase::Params => {
                let update: UserParams = envelope.parse()?;
                debug!("Stored generation params for {}", update.user_id);
                self.params.insert(update.user_id, update.params);
                Ok(())
            }
            Phase::Prompt => {
                let ctx: PromptContext = envelope.parse()?;
                let params = self.params_for(ctx.user_id.as_deref());
                let prompt = render_prompt(&ctx.query, &ctx.context, params);
                let answer = self.generate(&prompt, params).await;
                info!("Answer ready for request {} ({} chars)", ctx.request_id, answer.len());

                let reply = Envelope::new(
                    PROMPT,
                    envelope.originator(),
                    Phase::Final,
                    &FinalAnswer {
                        request_id: ctx.request_id,
                        answer,
                    },
                )?;
                self.post.send(reply)?;
                Ok(())
            }
            other => Err(PipelineError::UnexpectedPhase(other.to_string()).into()),
        }
    }
}
