//! Lexical query-type classification

use crate::types::QueryType;

const FACTUAL_MARKERS: &[&str] = &["quién", "cuándo", "dónde", "cuántos", "cuántas", "en qué año"];
const PROCEDURAL_MARKERS: &[&str] = &["cómo", "pasos", "proceso", "método"];
const CONCEPTUAL_MARKERS: &[&str] = &[
    "por qué",
    "causas",
    "consecuencias",
    "impacto",
    "efectos",
    "explica",
    "diferencia",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Person,
    Date,
    Location,
    Other,
}

/// Pluggable named-entity detection; person/date/location count as factual signals
pub trait EntityDetector: Send + Sync {
    fn detect(&self, query: &str) -> Vec<EntityKind>;
}

/// Flags three- or four-digit numbers as years
pub struct YearDetector;

impl EntityDetector for YearDetector {
    fn detect(&self, query: &str) -> Vec<EntityKind> {
        query
            .split(|c: char| !c.is_ascii_digit())
            .filter(|run| (3..=4).contains(&run.len()))
            .map(|_| EntityKind::Date)
            .collect()
    }
}

pub struct QueryClassifier {
    entity_detector: Option<Box<dyn EntityDetector>>,
}

impl Default for QueryClassifier {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClassifier {
    pub fn new() -> Self {
        Self { entity_detector: None }
    }

    pub fn with_entity_detector(detector: Box<dyn EntityDetector>) -> Self {
        Self {
            entity_detector: Some(detector),
        }
    }

    /// First marker list with a hit wins (factual, procedural, conceptual).
    /// Nothing matching means conceptual.
    pub fn classify(&self, query: &str) -> QueryType {
        let lowered = query.to_lowercase();
        let hits = |markers: &[&str]| markers.iter().any(|m| lowered.contains(m));

        if hits(FACTUAL_MARKERS) || self.has_factual_entity(query) {
            QueryType::Factual
        } else if hits(PROCEDURAL_MARKERS) {
            QueryType::Procedural
        } else {
            if !hits(CONCEPTUAL_MARKERS) {
                tracing::debug!("No type markers in query, defaulting to conceptual");
            }
            QueryType::Conceptual
        }
    }

    fn has_factual_entity(&self, query: &str) -> bool {
        match &self.entity_detector {
            Some(detector) => detector.detect(query).iter().any(|kind| {
                matches!(kind, EntityKind::Person | EntityKind::Date | EntityKind::Location)
            }),
            None => false,
        }
    }
}
