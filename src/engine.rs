use crate::config::Config;
use crate::sampler::{Sampler, build_sampler};
use crate::selector::Policy;
use crate::state::{State, group_size};
use anyhow::{Context, Result};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::Bernoulli;
use rmp_serde::{decode, encode};
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Simulation engine.
///
/// Holds the configuration, belief state, hidden ground truth, and random
/// number generator, and provides methods to run, save, and load
/// screening simulations.
#[derive(Serialize, Deserialize)]
pub struct Engine {
    cfg: Config,
    state: State,
    /// True infection status per patient, hidden from the selectors.
    truth: Vec<bool>,
    cycle: usize,
    rng: ChaCha12Rng,
}

/// Outcome of one testing cycle, as written to trajectory files.
#[derive(Debug, Serialize, Deserialize)]
pub struct Record {
    pub cycle: usize,
    /// Number of tests consumed this cycle.
    pub tests_used: usize,
    pub all_cleared: bool,
    /// Posterior marginal the cycle's decision was based on.
    pub marginal: Vec<f64>,
}

impl Engine {
    /// Create a new `Engine` with the given configuration and a ground
    /// truth drawn from the infection-rate prior.
    pub fn generate_initial_condition(cfg: Config) -> Result<Self> {
        let rng = ChaCha12Rng::try_from_os_rng()?;
        Self::with_rng(cfg, rng)
    }

    fn with_rng(cfg: Config, mut rng: ChaCha12Rng) -> Result<Self> {
        let mut truth = Vec::with_capacity(cfg.model.num_patients);
        for patient in 0..cfg.model.num_patients {
            let rate = cfg.model.prior_infection_rate.rate_for(patient);
            truth.push(Bernoulli::new(rate)?.sample(&mut rng));
        }

        let state = State::new(&cfg.model);

        Ok(Self {
            cfg,
            state,
            truth,
            cycle: 0,
            rng,
        })
    }

    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    /// Perform testing cycles and save the resulting records to a binary
    /// file, stopping early once the run is cleared or out of budget.
    pub fn run_simulation<P: AsRef<Path>>(&mut self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);

        let policy =
            Policy::from_config(&self.cfg.policy).context("failed to construct policy")?;
        let sampler = build_sampler(self.cfg.policy.sampler);

        for _ in 0..self.cfg.output.cycles_per_file {
            if self.state.all_cleared {
                log::info!("all statuses cleared after {} cycles", self.cycle);
                break;
            }
            if self.cycle >= self.cfg.model.max_cycles {
                log::warn!("cycle budget exhausted before clearing");
                break;
            }

            let record = self
                .perform_cycle(&policy, sampler.as_ref())
                .context("failed to perform cycle")?;
            log::info!("cycle {} used {} tests", record.cycle, record.tests_used);

            encode::write(&mut writer, &record).context("failed to serialize record")?;
        }

        writer.flush().context("failed to flush writer stream")?;

        Ok(())
    }

    /// Save a checkpoint of the entire engine state.
    ///
    /// Can be used to resume the simulation later.
    pub fn save_checkpoint<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let mut writer = BufWriter::new(file);
        encode::write(&mut writer, &self).context("failed to serialize engine")?;
        Ok(())
    }

    /// Load a previously saved engine checkpoint.
    pub fn load_checkpoint<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);
        let engine = decode::from_read(&mut reader).context("failed to deserialize engine")?;
        Ok(engine)
    }

    fn perform_cycle(&mut self, policy: &Policy, sampler: &dyn Sampler) -> Result<Record> {
        // Refresh this cycle's testing capacity.
        self.state.extra_tests_needed = self.cfg.model.tests_per_cycle;

        // Refresh the posterior from the accumulated history.
        sampler
            .produce(&mut self.rng, &mut self.state)
            .context("failed to refresh posterior")?;

        let marginal = self.state.marginal();

        // Let the scheduled selector queue new groups.
        let selector = policy.stage(self.cycle);
        if selector.needs_posterior() && self.state.particles.len() < 2 {
            log::warn!("posterior collapsed to a single hypothesis");
        }
        selector
            .select(&mut self.rng, &mut self.state)
            .context("failed to select groups")?;

        // Resolve the queued groups against the hidden ground truth.
        let tests_used = self
            .resolve_pending()
            .context("failed to resolve queued tests")?;

        let record = Record {
            cycle: self.cycle,
            tests_used,
            all_cleared: self.state.all_cleared,
            marginal,
        };
        self.cycle += 1;

        Ok(record)
    }

    /// Simulated wet lab: each queued group returns a noisy pooled result.
    fn resolve_pending(&mut self) -> Result<usize> {
        let pending = self.state.take_pending();
        let tests_used = pending.len();
        for (group, needs_clearing) in pending {
            let pooled_positive = group
                .iter()
                .zip(&self.truth)
                .any(|(&member, &infected)| member && infected);
            let size = group_size(&group);
            let prob_positive = if pooled_positive {
                self.cfg.model.sensitivity.for_size(size)
            } else {
                1.0 - self.cfg.model.specificity.for_size(size)
            };
            let result = Bernoulli::new(prob_positive)?.sample(&mut self.rng);
            self.state.record_result(group, result, needs_clearing);
        }
        Ok(tests_used)
    }
}
