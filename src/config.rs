//! Engine configuration: TOML file, then `HISTORAG_*` environment overrides

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Upper bound on the adaptive-weight bump
pub const MAX_LENGTH_BUMP: f64 = 0.1;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("confidence_threshold must be within [0, 1], got {0}")]
    Threshold(f64),
    #[error("top_n must be at least 1")]
    TopN,
    #[error("trust_discount must be within (0, 1], got {0}")]
    TrustDiscount(f64),
    #[error("length_bump must be within [0, {MAX_LENGTH_BUMP}], got {0}")]
    LengthBump(f64),
    #[error("short_text_chars ({short}) must not exceed long_text_chars ({long})")]
    LengthThresholds { short: usize, long: usize },
    #[error("pso needs at least one particle and one iteration")]
    Swarm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Escalation gate on the ranking confidence
    pub confidence_threshold: f64,
    /// Context size handed to generation
    pub top_n: usize,
    /// Chunks requested from the external retriever
    pub max_chunks: usize,
    pub sigmoid_steepness: f64,
    /// Multiplier applied to external candidate scores
    pub trust_discount: f64,
    /// Adaptive-weight adjustment for long/short candidates
    pub length_bump: f64,
    pub long_text_chars: usize,
    pub short_text_chars: usize,
    /// Pending escalations older than this are answered with local context
    pub pending_ttl_secs: u64,
    /// Mailbox receive timeout; an idle tick, not an error
    pub receive_timeout_ms: u64,
    /// How long the HTTP front door waits for a final answer
    pub answer_timeout_secs: u64,
    /// Reset the optimization cache every N interactions (0 = never)
    pub reoptimize_every: u64,
    pub pso: PsoConfig,
    pub generation: GenerationConfig,
    pub services: ServiceConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.8,
            top_n: 10,
            max_chunks: 10,
            sigmoid_steepness: 10.0,
            trust_discount: 0.8,
            length_bump: 0.05,
            long_text_chars: 300,
            short_text_chars: 100,
            pending_ttl_secs: 60,
            receive_timeout_ms: 10_000,
            answer_timeout_secs: 120,
            reoptimize_every: 25,
            pso: PsoConfig::default(),
            generation: GenerationConfig::default(),
            services: ServiceConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PsoConfig {
    pub particles: usize,
    pub iterations: usize,
    pub inertia: f64,
    pub cognitive: f64,
    pub social: f64,
    pub seed: Option<u64>,
}

impl Default for PsoConfig {
    fn default() -> Self {
        Self {
            particles: 15,
            iterations: 20,
            inertia: 0.9,
            cognitive: 0.5,
            social: 0.3,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub max_retries: u32,
    /// Base delay; doubles after every failed attempt
    pub backoff_ms: u64,
    pub model: String,
    pub api_key: Option<String>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1_000,
            model: "free".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub port: u16,
    pub corpus_path: String,
    pub profile_dir: String,
    pub completion_url: String,
    pub scraper_url: String,
    pub semantic_url: Option<String>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            corpus_path: "data/corpus.json".to_string(),
            profile_dir: "data/user_profiles".to_string(),
            completion_url: "http://127.0.0.1:8090/chat/completions".to_string(),
            scraper_url: "http://127.0.0.1:8085".to_string(),
            semantic_url: None,
        }
    }
}

impl EngineConfig {
    /// Load from an optional TOML file, apply env overrides, validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed reading config file: {}", path.display()))?;
                toml::from_str(&content)
                    .with_context(|| format!("Invalid TOML config: {}", path.display()))?
            }
            None => EngineConfig::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        override_from_env("HISTORAG_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);
        override_from_env("HISTORAG_TOP_N", &mut self.top_n);
        override_from_env("HISTORAG_MAX_CHUNKS", &mut self.max_chunks);
        override_from_env("HISTORAG_SIGMOID_STEEPNESS", &mut self.sigmoid_steepness);
        override_from_env("HISTORAG_TRUST_DISCOUNT", &mut self.trust_discount);
        override_from_env("HISTORAG_LENGTH_BUMP", &mut self.length_bump);
        override_from_env("HISTORAG_PENDING_TTL_SECS", &mut self.pending_ttl_secs);
        override_from_env("HISTORAG_PSO_PARTICLES", &mut self.pso.particles);
        override_from_env("HISTORAG_PSO_ITERATIONS", &mut self.pso.iterations);
        override_from_env("HISTORAG_PORT", &mut self.services.port);
        override_from_env("HISTORAG_CORPUS_PATH", &mut self.services.corpus_path);
        override_from_env("HISTORAG_PROFILE_DIR", &mut self.services.profile_dir);
        override_from_env("HISTORAG_COMPLETION_URL", &mut self.services.completion_url);
        override_from_env("HISTORAG_SCRAPER_URL", &mut self.services.scraper_url);
        if let Ok(url) = std::env::var("HISTORAG_SEMANTIC_URL") {
            self.services.semantic_url = Some(url);
        }
        if let Ok(key) = std::env::var("HISTORAG_API_KEY") {
            self.generation.api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Threshold(self.confidence_threshold));
        }
        if self.top_n == 0 {
            return Err(ConfigError::TopN);
        }
        if !(self.trust_discount > 0.0 && self.trust_discount <= 1.0) {
            return Err(ConfigError::TrustDiscount(self.trust_discount));
        }
        if !(0.0..=MAX_LENGTH_BUMP).contains(&self.length_bump) {
            return Err(ConfigError::LengthBump(self.length_bump));
        }
        if self.short_text_chars > self.long_text_chars {
            return Err(ConfigError::LengthThresholds {
                short: self.short_text_chars,
                long: self.long_text_chars,
            });
        }
        if self.pso.particles == 0 || self.pso.iterations == 0 {
            return Err(ConfigError::Swarm);
        }
        Ok(())
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn answer_timeout(&self) -> Duration {
        Duration::from_secs(self.answer_timeout_secs)
    }
}

fn override_from_env<T: std::str::FromStr>(key: &str, target: &mut T) {
    if let Ok(raw) = std::env::var(key) {
        match raw.parse() {
            Ok(value) => *target = value,
            Err(_) => tracing::warn!("Ignoring unparseable {}={}", key, raw),
        }
    }
}
