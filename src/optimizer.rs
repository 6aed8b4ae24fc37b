//! Generation-parameter search: particle swarm over the sampling knobs of a user profile

use crate::config::PsoConfig;
use crate::profile::{OptimizationStatus, SourceCriticism, UserProfile};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Lower/upper bounds of (temperature, nucleus_p, repetition_penalty)
pub const LOWER_BOUNDS: [f64; 3] = [0.1, 0.5, 1.0];
pub const UPPER_BOUNDS: [f64; 3] = [1.0, 1.0, 2.0];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationParams {
    pub temperature: f64,
    pub nucleus_p: f64,
    pub repetition_penalty: f64,
    pub max_length: u32,
    pub style: String,
    pub humor_level: f64,
    pub formality_level: f64,
    pub preferred_topics: Vec<String>,
    pub disliked_topics: Vec<String>,
    pub response_types: Vec<String>,
    pub topic_affinity: BTreeMap<String, f64>,
    pub historiographical_approach: String,
    pub source_criticism: SourceCriticism,
    pub evidence_preference: Vec<String>,
    pub controversy_handling: String,
    pub temporal_focus: String,
}

impl GenerationParams {
    /// Searched knobs plus a direct readout of everything else in the profile
    fn from_profile(profile: &UserProfile, temperature: f64, nucleus_p: f64, repetition_penalty: f64) -> Self {
        let comm = &profile.preferences.communication;
        let history = &profile.preferences.history_specific;
        let topics = &profile.preferences.topics;
        Self {
            temperature,
            nucleus_p,
            repetition_penalty,
            max_length: max_length_for(profile.avg_engagement()),
            style: comm.dominant_style().to_string(),
            humor_level: comm.humor,
            formality_level: comm.formality,
            preferred_topics: topics.preferred_topics(),
            disliked_topics: topics.disliked_topics(),
            response_types: profile.interaction_history.preferred_response_types.clone(),
            topic_affinity: topics.affinity.clone(),
            historiographical_approach: history.historiographical_approach.clone(),
            source_criticism: history.source_criticism,
            evidence_preference: history.evidence_preference.clone(),
            controversy_handling: history.controversy_handling.clone(),
            temporal_focus: history.temporal_focus.clone(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum OptimizerError {
    #[error("swarm needs at least one particle and one iteration")]
    EmptySwarm,
    #[error("profile value {field} is not finite")]
    NonFiniteProfile { field: &'static str },
}

/// Linear in engagement, truncated, so always within [150, 350]
pub fn max_length_for(engagement: f64) -> u32 {
    (150.0 + engagement.clamp(0.0, 1.0) * 200.0) as u32
}

/// Predicted engagement of a (temperature, nucleus_p) pair for this profile, in [0,1]
pub fn simulated_engagement(profile: &UserProfile, temperature: f64, nucleus_p: f64) -> f64 {
    let comm = &profile.preferences.communication;
    let humor_match = 1.0 - (comm.humor - temperature).abs();
    let formality_match = 1.0 - (comm.formality - (1.0 - nucleus_p)).abs();
    (0.4 * humor_match + 0.3 * formality_match + 0.3 * profile.avg_engagement()).clamp(0.0, 1.0)
}

/// Deterministic derivation, used when no search result is available
pub fn heuristic_params(profile: &UserProfile) -> GenerationParams {
    let comm = &profile.preferences.communication;
    let engagement = profile.avg_engagement();

    let mut temperature = 0.7 + (comm.humor - 0.5) * 0.4;
    if engagement < 0.3 {
        temperature -= 0.1;
    } else if engagement > 0.7 {
        temperature += 0.1;
    }
    let temperature = temperature.clamp(LOWER_BOUNDS[0], UPPER_BOUNDS[0]);
    let nucleus_p = (0.9 - comm.formality * 0.4).clamp(LOWER_BOUNDS[1], UPPER_BOUNDS[1]);
    let repetition_penalty = (1.2 + 0.6 * (1.0 - engagement)).clamp(LOWER_BOUNDS[2], UPPER_BOUNDS[2]);

    GenerationParams::from_profile(profile, temperature, nucleus_p, repetition_penalty)
}

struct Particle {
    position: [f64; 3],
    velocity: [f64; 3],
    best_position: [f64; 3],
    best_cost: f64,
}

pub struct ParameterOptimizer {
    config: PsoConfig,
}

impl ParameterOptimizer {
    pub fn new(config: PsoConfig) -> Self {
        Self { config }
    }

    /// Cached parameters when the profile is already optimized, else a fresh
    /// search whose result is stored back into the profile.
    pub fn optimize(&self, profile: &mut UserProfile) -> Result<GenerationParams, OptimizerError> {
        if profile.metadata.optimization_status == OptimizationStatus::Optimized {
            if let Some(ref cached) = profile.metadata.optimized_params {
                debug!("Using cached generation params for {}", profile.user_id);
                return Ok(cached.clone());
            }
        }

        let [temperature, nucleus_p, repetition_penalty] = self.search(profile)?;
        let params = GenerationParams::from_profile(profile, temperature, nucleus_p, repetition_penalty);
        info!(
            "Optimized params for {}: temperature={:.3} nucleus_p={:.3} repetition_penalty={:.3}",
            profile.user_id, temperature, nucleus_p, repetition_penalty
        );

        profile.metadata.optimization_status = OptimizationStatus::Optimized;
        profile.metadata.optimized_params = Some(params.clone());
        Ok(params)
    }

    /// Like [`optimize`](Self::optimize), falling back to `defaults` on failure
    pub fn optimize_or(&self, profile: &mut UserProfile, defaults: GenerationParams) -> GenerationParams {
        match self.optimize(profile) {
            Ok(params) => params,
            Err(e) => {
                warn!("Optimization failed for {}: {}; using defaults", profile.user_id, e);
                defaults
            }
        }
    }

    fn search(&self, profile: &UserProfile) -> Result<[f64; 3], OptimizerError> {
        if self.config.particles == 0 || self.config.iterations == 0 {
            return Err(OptimizerError::EmptySwarm);
        }
        let comm = &profile.preferences.communication;
        for (field, value) in [
            ("humor", comm.humor),
            ("formality", comm.formality),
            ("avg_engagement", profile.avg_engagement()),
        ] {
            if !value.is_finite() {
                return Err(OptimizerError::NonFiniteProfile { field });
            }
        }

        let mut rng = match self.config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let cost = |p: &[f64; 3]| 1.0 - simulated_engagement(profile, p[0], p[1]);

        let mut swarm: Vec<Particle> = (0..self.config.particles)
            .map(|_| {
                let mut position = [0.0; 3];
                let mut velocity = [0.0; 3];
                for d in 0..3 {
                    let span = UPPER_BOUNDS[d] - LOWER_BOUNDS[d];
                    position[d] = rng.gen_range(LOWER_BOUNDS[d]..=UPPER_BOUNDS[d]);
                    velocity[d] = rng.gen_range(-span..=span) * 0.1;
                }
                let best_cost = cost(&position);
                Particle {
                    position,
                    velocity,
                    best_position: position,
                    best_cost,
                }
            })
            .collect();

        let (mut global_best, mut global_cost) = swarm
            .iter()
            .min_by(|a, b| a.best_cost.total_cmp(&b.best_cost))
            .map(|p| (p.best_position, p.best_cost))
            .ok_or(OptimizerError::EmptySwarm)?;

        for iteration in 0..self.config.iterations {
            for particle in swarm.iter_mut() {
                for d in 0..3 {
                    let r1: f64 = rng.gen();
                    let r2: f64 = rng.gen();
                    particle.velocity[d] = self.config.inertia * particle.velocity[d]
                        + self.config.cognitive * r1 * (particle.best_position[d] - particle.position[d])
                        + self.config.social * r2 * (global_best[d] - particle.position[d]);
                    particle.position[d] =
                        (particle.position[d] + particle.velocity[d]).clamp(LOWER_BOUNDS[d], UPPER_BOUNDS[d]);
                }
                let c = cost(&particle.position);
                if c < particle.best_cost {
                    particle.best_cost = c;
                    particle.best_position = particle.position;
                }
                if c < global_cost {
                    global_cost = c;
                    global_best = particle.position;
                }
            }
            debug!("PSO iteration {}: best cost {:.4}", iteration, global_cost);
        }

        Ok(global_best)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(particles: usize, iterations: usize) -> ParameterOptimizer {
        ParameterOptimizer::new(PsoConfig {
            particles,
            iterations,
            seed: Some(7),
            ..PsoConfig::default()
        })
    }

    #[test]
    fn test_search_stays_in_bounds_and_tracks_profile() {
        let mut profile = UserProfile::new("u");
        profile.preferences.communication.humor = 0.8;
        profile.preferences.communication.formality = 0.2;

        let params = seeded(30, 60).optimize(&mut profile).unwrap();
        assert!((LOWER_BOUNDS[0]..=UPPER_BOUNDS[0]).contains(&params.temperature));
        assert!((LOWER_BOUNDS[1]..=UPPER_BOUNDS[1]).contains(&params.nucleus_p));
        assert!((LOWER_BOUNDS[2]..=UPPER_BOUNDS[2]).contains(&params.repetition_penalty));
        assert!((params.temperature - 0.8).abs() < 0.1);
        assert!((params.nucleus_p - 0.8).abs() < 0.1);
        assert_eq!(params.max_length, 250);
        assert_eq!(profile.metadata.optimization_status, OptimizationStatus::Optimized);
        assert_eq!(profile.metadata.optimized_params.as_ref(), Some(&params));
    }

    #[test]
    fn test_same_seed_same_result() {
        let mut a = UserProfile::new("a");
        let mut b = UserProfile::new("b");
        let pa = seeded(15, 20).optimize(&mut a).unwrap();
        let pb = seeded(15, 20).optimize(&mut b).unwrap();
        assert_eq!(pa.temperature, pb.temperature);
        assert_eq!(pa.nucleus_p, pb.nucleus_p);
        assert_eq!(pa.repetition_penalty, pb.repetition_penalty);
    }

    #[test]
    fn test_cached_params_returned_unchanged() {
        let mut profile = UserProfile::new("u");
        let mut cached = heuristic_params(&profile);
        // Outside the search bounds, so a fresh search could never produce it
        cached.temperature = 42.0;
        profile.metadata.optimization_status = OptimizationStatus::Optimized;
        profile.metadata.optimized_params = Some(cached.clone());

        let params = seeded(15, 20).optimize(&mut profile).unwrap();
        assert_eq!(params, cached);
    }

    #[test]
    fn test_empty_swarm_falls_back() {
        let mut profile = UserProfile::new("u");
        let optimizer = seeded(0, 20);
        assert_eq!(optimizer.optimize(&mut profile), Err(OptimizerError::EmptySwarm));

        let defaults = heuristic_params(&profile);
        assert_eq!(optimizer.optimize_or(&mut profile, defaults.clone()), defaults);
        assert_eq!(profile.metadata.optimization_status, OptimizationStatus::Unoptimized);
    }

    #[test]
    fn test_non_finite_profile_rejected() {
        let mut profile = UserProfile::new("u");
        profile.preferences.communication.humor = f64::NAN;
        assert_eq!(
            seeded(5, 5).optimize(&mut profile),
            Err(OptimizerError::NonFiniteProfile { field: "humor" })
        );
    }

    #[test]
    fn test_engagement_and_length() {
        let mut profile = UserProfile::new("u");
        profile.preferences.communication.humor = 0.3;
        profile.preferences.communication.formality = 0.6;
        profile.interaction_history.engagement_metrics.avg_engagement = 1.0;
        let perfect = simulated_engagement(&profile, 0.3, 0.4);
        assert!((perfect - 1.0).abs() < 1e-12);
        assert_eq!(max_length_for(0.0), 150);
        assert_eq!(max_length_for(1.0), 350);
        assert_eq!(max_length_for(7.0), 350);
        assert_eq!(max_length_for(0.4999), 249);
        assert_eq!(max_length_for(0.5), 250);
    }

    #[test]
    fn test_params_carry_topics_learned_from_affinity() {
        let mut profile = UserProfile::new("u");
        let topics = &mut profile.preferences.topics;
        topics.disliked.push("deportes".to_string());
        topics.affinity.insert("colonia".to_string(), 0.6);
        topics.affinity.insert("independencia".to_string(), 0.9);
        topics.affinity.insert("economía".to_string(), 0.25);
        topics.affinity.insert("arte".to_string(), 0.5);

        let params = heuristic_params(&profile);
        assert_eq!(params.preferred_topics, vec!["independencia", "colonia"]);
        assert_eq!(params.disliked_topics, vec!["deportes", "economía"]);
    }

    #[test]
    fn test_heuristic_params() {
        let mut profile = UserProfile::new("u");
        profile.preferences.communication.humor = 1.0;
        profile.preferences.communication.formality = 1.0;
        profile.interaction_history.engagement_metrics.avg_engagement = 0.9;
        let params = heuristic_params(&profile);
        assert!((params.temperature - 1.0).abs() < 1e-12);
        assert!((params.nucleus_p - 0.5).abs() < 1e-12);
        assert!((params.repetition_penalty - 1.26).abs() < 1e-12);
        assert_eq!(params.style, "neutral");
    }
}
