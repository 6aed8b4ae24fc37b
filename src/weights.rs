//! Adaptive semantic/lexical weighting by query type and passage length

use crate::config::{EngineConfig, MAX_LENGTH_BUMP};
use crate::types::{QueryType, Weights};

#[derive(Debug, Clone)]
pub struct AdaptiveWeightPolicy {
    pub length_bump: f64,
    pub long_text_chars: usize,
    pub short_text_chars: usize,
}

impl Default for AdaptiveWeightPolicy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl AdaptiveWeightPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            length_bump: config.length_bump.clamp(0.0, MAX_LENGTH_BUMP),
            long_text_chars: config.long_text_chars,
            short_text_chars: config.short_text_chars,
        }
    }

    /// Fixed point per query type, before length adjustment
    pub fn base(query_type: QueryType) -> Weights {
        match query_type {
            QueryType::Factual => Weights { semantic: 0.6, lexical: 0.4 },
            QueryType::Conceptual => Weights { semantic: 0.7, lexical: 0.3 },
            QueryType::Procedural => Weights { semantic: 0.5, lexical: 0.5 },
        }
    }

    /// Long passages lean semantic, short ones lean lexical; result sums to 1
    pub fn weights(&self, query_type: QueryType, candidate_text: &str) -> Weights {
        let Weights { mut semantic, mut lexical } = Self::base(query_type);
        let chars = candidate_text.chars().count();
        if chars > self.long_text_chars {
            semantic += self.length_bump;
        } else if chars < self.short_text_chars {
            lexical += self.length_bump;
        }
        Weights::normalized(semantic, lexical)
    }
}
