pub mod multi_fidelity;
pub mod random;

use rand::Rng;

use crate::config::{Mode, ResourceAcquisition};
use crate::errors::{Result, TuneError};
use crate::ledger::{Ledger, LedgerState, Observation, TrialId, TrialStatus};
use crate::library::{ConfigSpace, Configuration};
use crate::output::SearcherState;
use crate::rungs::RungLevels;

pub use multi_fidelity::MultiFidelitySearcher;
pub use random::RandomSearcher;

const MAX_RANDOM_DRAWS: usize = 100;

pub trait Searcher: Send + Sync {
    fn get_config(&self) -> Result<Configuration>;

    fn ledger(&self) -> &Ledger;

    fn mode(&self) -> Mode;

    fn register_pending(
        &self,
        trial_id: TrialId,
        config: Option<&Configuration>,
        resource: u32,
    ) -> Result<()> {
        if self.ledger().register_pending(trial_id, config, resource)? {
            log::trace!("Trial {} pending at resource {}", trial_id, resource);
        }
        Ok(())
    }

    fn on_trial_result(&self, observation: Observation) -> Result<()> {
        self.ledger().record_observation(observation)
    }

    fn evaluation_failed(&self, trial_id: TrialId) -> Result<()> {
        let removed = self.ledger().finish_trial(trial_id, TrialStatus::Failed)?;
        log::info!(
            "Trial {} failed, {} pending evaluations removed",
            trial_id,
            removed
        );
        Ok(())
    }

    fn trial_finished(&self, trial_id: TrialId, status: TrialStatus) -> Result<()> {
        self.ledger().finish_trial(trial_id, status).map(|_| ())
    }

    fn remove_case(&self, trial_id: TrialId, resource: u32) -> Result<()> {
        self.ledger()
            .remove_observation(trial_id, resource)
            .map(|_| ())
    }

    fn get_state(&self) -> SearcherState {
        SearcherState {
            ledger: self.ledger().snapshot(),
            model_cache: None,
            points_to_evaluate: Vec::new(),
        }
    }
}

impl ResourceAcquisition {
    pub fn target_resource(&self, snapshot: &LedgerState, rungs: &RungLevels, dim: usize) -> u32 {
        match self {
            ResourceAcquisition::Bohb => rungs
                .levels()
                .iter()
                .rev()
                .copied()
                .find(|r| snapshot.num_training_observations_at(*r) >= dim)
                .unwrap_or_else(|| rungs.first()),
            ResourceAcquisition::First => rungs.first(),
        }
    }
}

pub(crate) fn draw_new_configuration<R: Rng>(
    space: &ConfigSpace,
    state: &LedgerState,
    rng: &mut R,
) -> Result<Configuration> {
    space.validate_domains()?;
    for _ in 0..MAX_RANDOM_DRAWS {
        let config = space.random_configuration(rng);
        if !state.contains_configuration(&config) {
            return Ok(config);
        }
    }
    Err(TuneError::SearchSpaceExhausted(MAX_RANDOM_DRAWS))
}
