//! Per-user preference profiles: model, JSON store, interaction updates

use crate::optimizer::GenerationParams;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Weight given to each new observation of humor/formality
const ADAPTATION_FACTOR: f64 = 0.3;
const STYLE_DECAY: f64 = 0.95;
const STYLE_HISTORY_LIMIT: usize = 50;
const TOPIC_DECAY: f64 = 0.98;
const NEUTRAL_AFFINITY: f64 = 0.5;
const TOPIC_POSITIVE_STEP: f64 = 0.1;
const TOPIC_NEGATIVE_STEP: f64 = -0.25;
const MAX_ENGAGEMENT_SECS: f64 = 300.0;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub preferences: Preferences,
    pub interaction_history: InteractionHistory,
    pub metadata: ProfileMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Preferences {
    pub communication: Communication,
    pub history_specific: HistoryPreferences,
    pub topics: TopicPreferences,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Communication {
    pub humor: f64,     // 0 serious .. 1 humorous
    pub formality: f64, // 0 colloquial .. 1 academic
    pub style: String,
    pub tone: String,
    #[serde(default)]
    pub style_weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub style_history: Vec<StyleObservation>,
}

impl Communication {
    /// Style with the highest weight, else the declared style
    pub fn dominant_style(&self) -> &str {
        self.style_weights
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(style, _)| style.as_str())
            .unwrap_or(self.style.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StyleObservation {
    pub style: String,
    pub timestamp: DateTime<Utc>,
    pub confidence: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SourceCriticism {
    Basic,
    Intermediate,
    Advanced,
}

impl SourceCriticism {
    fn harder(self) -> Self {
        match self {
            SourceCriticism::Basic => SourceCriticism::Intermediate,
            _ => SourceCriticism::Advanced,
        }
    }

    fn easier(self) -> Self {
        match self {
            SourceCriticism::Advanced => SourceCriticism::Intermediate,
            _ => SourceCriticism::Basic,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryPreferences {
    pub historiographical_approach: String,
    pub source_criticism: SourceCriticism,
    pub evidence_preference: Vec<String>,
    pub controversy_handling: String, // neutral/critical/debate
    pub temporal_focus: String,       // chronological/thematic/comparative
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TopicPreferences {
    pub preferred: Vec<String>,
    pub disliked: Vec<String>,
    /// topic -> affinity in [0,1]; untouched topics drift back to 0.5
    pub affinity: BTreeMap<String, f64>,
}

impl TopicPreferences {
    /// Explicit preferences, then topics with affinity above neutral, strongest first
    pub fn preferred_topics(&self) -> Vec<String> {
        self.merged(&self.preferred, |a| a > NEUTRAL_AFFINITY, |a, b| b.total_cmp(&a))
    }

    /// Explicit dislikes, then topics with affinity below neutral, weakest first
    pub fn disliked_topics(&self) -> Vec<String> {
        self.merged(&self.disliked, |a| a < NEUTRAL_AFFINITY, |a, b| a.total_cmp(&b))
    }

    fn merged(
        &self,
        explicit: &[String],
        keep: impl Fn(f64) -> bool,
        order: impl Fn(f64, f64) -> std::cmp::Ordering,
    ) -> Vec<String> {
        let mut learned: Vec<(&String, f64)> = self
            .affinity
            .iter()
            .filter(|&(topic, &a)| keep(a) && !explicit.contains(topic))
            .map(|(topic, &a)| (topic, a))
            .collect();
        learned.sort_by(|x, y| order(x.1, y.1));

        let mut topics = explicit.to_vec();
        topics.extend(learned.into_iter().map(|(topic, _)| topic.clone()));
        topics
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionHistory {
    pub total_interactions: u64,
    pub last_interaction: Option<DateTime<Utc>>,
    pub preferred_response_types: Vec<String>,
    pub engagement_metrics: EngagementMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngagementMetrics {
    pub avg_engagement: f64,
    pub last_engagement: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OptimizationStatus {
    Unoptimized,
    Optimized,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileMetadata {
    pub is_new_user: bool,
    pub profile_version: String,
    pub optimization_status: OptimizationStatus,
    #[serde(default)]
    pub optimized_params: Option<GenerationParams>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            created_at: now,
            last_updated: now,
            preferences: Preferences {
                communication: Communication {
                    humor: 0.5,
                    formality: 0.5,
                    style: "neutral".to_string(),
                    tone: "neutral".to_string(),
                    style_weights: BTreeMap::new(),
                    style_history: Vec::new(),
                },
                history_specific: HistoryPreferences {
                    historiographical_approach: "social".to_string(),
                    source_criticism: SourceCriticism::Intermediate,
                    evidence_preference: vec!["primary".to_string(), "visual".to_string()],
                    controversy_handling: "neutral".to_string(),
                    temporal_focus: "thematic".to_string(),
                },
                topics: TopicPreferences::default(),
            },
            interaction_history: InteractionHistory {
                total_interactions: 0,
                last_interaction: None,
                preferred_response_types: Vec::new(),
                engagement_metrics: EngagementMetrics {
                    avg_engagement: 0.5,
                    last_engagement: 0.5,
                },
            },
            metadata: ProfileMetadata {
                is_new_user: true,
                profile_version: "2.0".to_string(),
                optimization_status: OptimizationStatus::Unoptimized,
                optimized_params: None,
            },
        }
    }

    pub fn avg_engagement(&self) -> f64 {
        self.interaction_history.engagement_metrics.avg_engagement
    }

    /// Drop the cached generation parameters so the next request re-optimizes
    pub fn invalidate_optimization(&mut self) {
        self.metadata.optimization_status = OptimizationStatus::Unoptimized;
        self.metadata.optimized_params = None;
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TopicReaction {
    Positive,
    Negative,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CriticismFeedback {
    TooSimple,
    TooComplex,
}

/// Signals observed after one completed interaction
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Interaction {
    pub humor_score: Option<f64>,
    pub formality_level: Option<f64>,
    pub response_style: Option<String>,
    pub style_confidence: Option<f64>,
    pub topics: HashMap<String, TopicReaction>,
    /// Seconds the user spent with the answer
    pub engagement_time: Option<f64>,
    pub response_type: Option<String>,
    pub historical_focus: Option<String>,
    pub source_criticism_feedback: Option<CriticismFeedback>,
}

/// Applies an [`Interaction`] to a profile
#[derive(Debug, Clone)]
pub struct InteractionUpdater {
    /// Reset the optimization cache every N interactions; 0 disables
    pub reoptimize_every: u64,
}

impl InteractionUpdater {
    pub fn new(reoptimize_every: u64) -> Self {
        Self { reoptimize_every }
    }

    pub fn apply(&self, profile: &mut UserProfile, interaction: &Interaction) {
        update_communication(profile, interaction);
        update_topics(profile, interaction);
        update_engagement(profile, interaction);
        update_history_preferences(profile, interaction);
        profile.metadata.is_new_user = false;

        let total = profile.interaction_history.total_interactions;
        if self.reoptimize_every > 0 && total % self.reoptimize_every == 0 {
            debug!("Resetting optimization cache for {} after {} interactions", profile.user_id, total);
            profile.invalidate_optimization();
        }
    }
}

fn update_communication(profile: &mut UserProfile, interaction: &Interaction) {
    let prefs = &mut profile.preferences.communication;

    if let Some(humor) = interaction.humor_score {
        prefs.humor = blend(prefs.humor, humor.clamp(0.0, 1.0));
    }
    if let Some(formality) = interaction.formality_level {
        prefs.formality = blend(prefs.formality, formality.clamp(0.0, 1.0));
    }

    let style = interaction
        .response_style
        .clone()
        .unwrap_or_else(|| "neutral".to_string());
    let confidence = interaction.style_confidence.unwrap_or(0.7).clamp(0.0, 1.0);

    for weight in prefs.style_weights.values_mut() {
        *weight *= STYLE_DECAY;
    }
    *prefs.style_weights.entry(style.clone()).or_insert(0.0) += confidence;
    let total: f64 = prefs.style_weights.values().sum();
    if total > 0.0 {
        for weight in prefs.style_weights.values_mut() {
            *weight /= total;
        }
    }

    prefs.style_history.push(StyleObservation {
        style,
        timestamp: Utc::now(),
        confidence,
    });
    if prefs.style_history.len() > STYLE_HISTORY_LIMIT {
        let excess = prefs.style_history.len() - STYLE_HISTORY_LIMIT;
        prefs.style_history.drain(..excess);
    }
}

fn update_topics(profile: &mut UserProfile, interaction: &Interaction) {
    if interaction.topics.is_empty() {
        return;
    }
    let affinity = &mut profile.preferences.topics.affinity;

    for (topic, reaction) in &interaction.topics {
        let step = match reaction {
            TopicReaction::Positive => TOPIC_POSITIVE_STEP,
            TopicReaction::Negative => TOPIC_NEGATIVE_STEP,
        };
        let value = affinity.entry(topic.clone()).or_insert(NEUTRAL_AFFINITY);
        *value = (*value + step).clamp(0.0, 1.0);
    }

    for (topic, value) in affinity.iter_mut() {
        if !interaction.topics.contains_key(topic) {
            *value = (*value - NEUTRAL_AFFINITY) * TOPIC_DECAY + NEUTRAL_AFFINITY;
        }
    }
}

fn update_engagement(profile: &mut UserProfile, interaction: &Interaction) {
    let history = &mut profile.interaction_history;
    history.total_interactions += 1;
    history.last_interaction = Some(Utc::now());

    let response_type = interaction
        .response_type
        .clone()
        .unwrap_or_else(|| "standard".to_string());
    if !history.preferred_response_types.contains(&response_type) {
        history.preferred_response_types.push(response_type);
    }

    let seconds = interaction.engagement_time.unwrap_or(0.0).clamp(0.0, MAX_ENGAGEMENT_SECS);
    let normalized = seconds / MAX_ENGAGEMENT_SECS;
    let metrics = &mut history.engagement_metrics;
    metrics.last_engagement = normalized;
    metrics.avg_engagement = 0.9 * metrics.avg_engagement + 0.1 * normalized;
}

fn update_history_preferences(profile: &mut UserProfile, interaction: &Interaction) {
    let prefs = &mut profile.preferences.history_specific;
    if let Some(ref focus) = interaction.historical_focus {
        prefs.historiographical_approach = focus.clone();
    }
    match interaction.source_criticism_feedback {
        Some(CriticismFeedback::TooSimple) => prefs.source_criticism = prefs.source_criticism.harder(),
        Some(CriticismFeedback::TooComplex) => prefs.source_criticism = prefs.source_criticism.easier(),
        None => {}
    }
}

fn blend(current: f64, observed: f64) -> f64 {
    current * (1.0 - ADAPTATION_FACTOR) + observed * ADAPTATION_FACTOR
}

/// One JSON file per user under a base directory
#[derive(Debug, Clone)]
pub struct ProfileStore {
    base_dir: PathBuf,
}

impl ProfileStore {
    pub fn open(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create profile directory {}", base_dir.display()))?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Percent-encoded, so distinct ids never share a file and `/` cannot
    /// leave the store directory
    fn path_for(&self, user_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", urlencoding::encode(user_id)))
    }

    pub fn load(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let path = self.path_for(user_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed reading profile {}", path.display()))?;
        let profile = serde_json::from_str(&content)
            .with_context(|| format!("Invalid profile JSON {}", path.display()))?;
        Ok(Some(profile))
    }

    /// Existing profile, or a fresh default one persisted on first contact
    pub fn get_or_create(&self, user_id: &str) -> Result<UserProfile> {
        if let Some(profile) = self.load(user_id)? {
            return Ok(profile);
        }
        info!("Creating default profile for {}", user_id);
        let mut profile = UserProfile::new(user_id);
        self.save(&mut profile)?;
        Ok(profile)
    }

    pub fn save(&self, profile: &mut UserProfile) -> Result<()> {
        profile.last_updated = Utc::now();
        let path = self.path_for(&profile.user_id);
        let json = serde_json::to_string_pretty(profile)?;
        std::fs::write(&path, json).with_context(|| format!("Failed writing profile {}", path.display()))?;
        Ok(())
    }

    pub fn invalidate_optimization(&self, user_id: &str) -> Result<()> {
        let mut profile = self.get_or_create(user_id)?;
        profile.invalidate_optimization();
        self.save(&mut profile)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_creates_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::open(dir.path()).unwrap();
        let created = store.get_or_create("ana").unwrap();
        assert!(created.metadata.is_new_user);
        let loaded = store.load("ana").unwrap().unwrap();
        assert_eq!(loaded.user_id, "ana");
        assert_eq!(loaded.preferences, created.preferences);
    }

    #[test]
    fn test_user_id_cannot_escape_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::open(dir.path()).unwrap();
        store.get_or_create("../evil").unwrap();
        assert!(dir.path().join("..%2Fevil.json").exists());
        assert!(!dir.path().parent().unwrap().join("evil.json").exists());
    }

    #[test]
    fn test_similar_user_ids_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::open(dir.path()).unwrap();
        for user_id in ["ana.p", "ana_p", "ana/p", "ana p"] {
            let mut profile = store.get_or_create(user_id).unwrap();
            profile.preferences.communication.humor = 0.9;
            store.save(&mut profile).unwrap();
        }

        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 4);
        let loaded = store.load("ana_p").unwrap().unwrap();
        assert_eq!(loaded.user_id, "ana_p");
        assert!(store.load("ana-p").unwrap().is_none());
    }

    #[test]
    fn test_humor_and_formality_move_toward_observation() {
        let mut profile = UserProfile::new("u");
        let updater = InteractionUpdater::new(0);
        updater.apply(
            &mut profile,
            &Interaction {
                humor_score: Some(1.0),
                formality_level: Some(0.0),
                ..Default::default()
            },
        );
        let comm = &profile.preferences.communication;
        assert!((comm.humor - 0.65).abs() < 1e-12);
        assert!((comm.formality - 0.35).abs() < 1e-12);
    }

    #[test]
    fn test_style_weights_stay_normalized() {
        let mut profile = UserProfile::new("u");
        let updater = InteractionUpdater::new(0);
        for style in ["narrative", "academic", "narrative", "gossip"] {
            updater.apply(
                &mut profile,
                &Interaction {
                    response_style: Some(style.to_string()),
                    style_confidence: Some(0.9),
                    ..Default::default()
                },
            );
        }
        let comm = &profile.preferences.communication;
        let total: f64 = comm.style_weights.values().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert_eq!(comm.dominant_style(), "narrative");
        assert_eq!(comm.style_history.len(), 4);
    }

    #[test]
    fn test_topic_affinity_updates_and_decay() {
        let mut profile = UserProfile::new("u");
        let updater = InteractionUpdater::new(0);
        let mut topics = HashMap::new();
        topics.insert("colonia".to_string(), TopicReaction::Positive);
        topics.insert("economía".to_string(), TopicReaction::Negative);
        updater.apply(&mut profile, &Interaction { topics, ..Default::default() });

        let affinity = &profile.preferences.topics.affinity;
        assert!((affinity["colonia"] - 0.6).abs() < 1e-12);
        assert!((affinity["economía"] - 0.25).abs() < 1e-12);

        let mut topics = HashMap::new();
        topics.insert("independencia".to_string(), TopicReaction::Positive);
        updater.apply(&mut profile, &Interaction { topics, ..Default::default() });
        let affinity = &profile.preferences.topics.affinity;
        assert!((affinity["colonia"] - (0.1 * 0.98 + 0.5)).abs() < 1e-12);
        assert!(affinity["economía"] > 0.25 && affinity["economía"] < 0.5);
    }

    #[test]
    fn test_engagement_moving_average() {
        let mut profile = UserProfile::new("u");
        let updater = InteractionUpdater::new(0);
        updater.apply(
            &mut profile,
            &Interaction {
                engagement_time: Some(900.0),
                ..Default::default()
            },
        );
        let history = &profile.interaction_history;
        assert_eq!(history.total_interactions, 1);
        assert_eq!(history.engagement_metrics.last_engagement, 1.0);
        assert!((history.engagement_metrics.avg_engagement - 0.55).abs() < 1e-12);
        assert_eq!(history.preferred_response_types, vec!["standard".to_string()]);
    }

    #[test]
    fn test_source_criticism_steps() {
        let mut profile = UserProfile::new("u");
        let updater = InteractionUpdater::new(0);
        let too_simple = Interaction {
            source_criticism_feedback: Some(CriticismFeedback::TooSimple),
            ..Default::default()
        };
        updater.apply(&mut profile, &too_simple);
        updater.apply(&mut profile, &too_simple);
        assert_eq!(
            profile.preferences.history_specific.source_criticism,
            SourceCriticism::Advanced
        );
        updater.apply(
            &mut profile,
            &Interaction {
                source_criticism_feedback: Some(CriticismFeedback::TooComplex),
                historical_focus: Some("económico".to_string()),
                ..Default::default()
            },
        );
        let prefs = &profile.preferences.history_specific;
        assert_eq!(prefs.source_criticism, SourceCriticism::Intermediate);
        assert_eq!(prefs.historiographical_approach, "económico");
    }

    #[test]
    fn test_periodic_reoptimization_trigger() {
        let mut profile = UserProfile::new("u");
        profile.metadata.optimization_status = OptimizationStatus::Optimized;
        let updater = InteractionUpdater::new(2);
        updater.apply(&mut profile, &Interaction::default());
        assert_eq!(profile.metadata.optimization_status, OptimizationStatus::Optimized);
        updater.apply(&mut profile, &Interaction::default());
        assert_eq!(profile.metadata.optimization_status, OptimizationStatus::Unoptimized);
    }
}
