//! Profile service: folds interactions into profiles and pushes fresh generation params

use crate::error::PipelineError;
use crate::generation::UserParams;
use crate::mailbox::{Envelope, Phase, PostOffice, Service, PROFILE, PROMPT};
use crate::optimizer::{heuristic_params, ParameterOptimizer};
use crate::profile::{Interaction, InteractionUpdater, ProfileStore};
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Body of an `interaction` message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionReport {
    pub user_id: String,
    #[serde(flatten)]
    pub interaction: Interaction,
}

pub struct ProfileService {
    store: ProfileStore,
    updater: InteractionUpdater,
    optimizer: ParameterOptimizer,
    post: PostOffice,
}

impl ProfileService {
    pub fn new(
        store: ProfileStore,
        updater: InteractionUpdater,
        optimizer: ParameterOptimizer,
        post: PostOffice,
    ) -> Self {
        Self {
            store,
            updater,
            optimizer,
            post,
        }
    }
}

#[async_trait]
impl Service for ProfileService {
    fn name(&self) -> &'static str {
        "profile"
    }

    async fn handle(&mut self, envelope: Envelope) -> Result<()> {
        if envelope.phase != Phase::Interaction {
            return Err(PipelineError::UnexpectedPhase(envelope.phase.to_string()).into());
        }
        let report: InteractionReport = envelope.parse()?;

        let mut profile = self.store.get_or_create(&report.user_id)?;
        self.updater.apply(&mut profile, &report.interaction);
        let defaults = heuristic_params(&profile);
        let params = self.optimizer.optimize_or(&mut profile, defaults);
        self.store.save(&mut profile)?;
        info!(
            "Profile {} updated ({} interactions)",
            profile.user_id, profile.interaction_history.total_interactions
        );

        let update = UserParams {
            user_id: report.user_id,
            params,
        };
        self.post.send(Envelope::new(PROFILE, PROMPT, Phase::Params, &update)?)?;
        Ok(())
    }
}
