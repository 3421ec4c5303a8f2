use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    config::Mode,
    errors::Result,
    ledger::Ledger,
    library::{ConfigSpace, Configuration},
};

use super::{draw_new_configuration, Searcher};

pub struct RandomSearcher<R: Rng + Send = StdRng> {
    space: ConfigSpace,
    mode: Mode,
    ledger: Ledger,
    rng: Mutex<R>,
}

impl RandomSearcher {
    pub fn new(space: ConfigSpace, mode: Mode) -> Self {
        Self::new_with_rng(space, mode, StdRng::from_entropy())
    }

    pub fn with_seed(space: ConfigSpace, mode: Mode, seed: u64) -> Self {
        Self::new_with_rng(space, mode, StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng + Send> RandomSearcher<R> {
    pub fn new_with_rng(space: ConfigSpace, mode: Mode, rng: R) -> Self {
        Self {
            space,
            mode,
            ledger: Ledger::new(),
            rng: Mutex::new(rng),
        }
    }

    pub fn space(&self) -> &ConfigSpace {
        &self.space
    }
}

impl<R: Rng + Send> Searcher for RandomSearcher<R> {
    fn get_config(&self) -> Result<Configuration> {
        let mut rng = self.rng.lock();
        self.ledger
            .read(|state| draw_new_configuration(&self.space, state, &mut *rng))
    }

    fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn mode(&self) -> Mode {
        self.mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::TuneError;
    use crate::ledger::{Observation, TrialStatus};

    #[test]
    fn suggestions_stay_in_space_and_never_repeat() {
        let space = ConfigSpace::new()
            .add_i32_range(0..=2, "layers")
            .add_choice(["relu", "tanh"], "activation");
        let searcher = RandomSearcher::with_seed(space.clone(), Mode::Min, 7);
        for trial_id in 0..6 {
            let config = searcher.get_config().unwrap();
            space.validate(&config).unwrap();
            searcher
                .register_pending(trial_id, Some(&config), 1)
                .unwrap();
        }
        assert!(matches!(
            searcher.get_config(),
            Err(TuneError::SearchSpaceExhausted(_))
        ));
    }

    #[test]
    fn degenerate_domains_are_errors_not_panics() {
        for space in [
            ConfigSpace::new().add_f64_range(0.5..0.5, "x"),
            ConfigSpace::new().add_log_f64_range(0.0..1.0, "lr"),
            ConfigSpace::new().add_choice(Vec::<String>::new(), "activation"),
        ] {
            let searcher = RandomSearcher::with_seed(space, Mode::Min, 3);
            assert!(matches!(
                searcher.get_config(),
                Err(TuneError::InvalidConfiguration(_))
            ));
        }
    }

    #[test]
    fn bookkeeping_goes_through_the_ledger() {
        let space = ConfigSpace::new().add_f64_range(0.0..1.0, "x");
        let searcher = RandomSearcher::with_seed(space, Mode::Max, 1);
        let config = searcher.get_config().unwrap();
        searcher.register_pending(0, Some(&config), 3).unwrap();
        searcher.register_pending(0, None, 3).unwrap();
        searcher
            .on_trial_result(Observation {
                trial_id: 0,
                resource: 3,
                metric: 0.9,
                elapsed_time: 1.,
            })
            .unwrap();
        assert!(searcher.ledger().read(|s| s.is_observed(0, 3)));
        searcher.evaluation_failed(0).unwrap();
        let status = searcher.ledger().read(|s| s.trial(0).map(|t| t.status));
        assert_eq!(status, Some(TrialStatus::Failed));
        assert_eq!(searcher.ledger().read(|s| s.training_observations().count()), 0);
    }
}
