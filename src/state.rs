use crate::config::{ModelConfig, RatePrior, SizeParam};
use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// A group is a membership mask over the patient population.
pub type Group = Vec<bool>;

/// Shared belief and session state of one screening run.
///
/// Holds the particle approximation of the posterior over infection
/// states, the testing history, and the queue of groups waiting to be
/// tested. Mutated by exactly one sampler and one selector call per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct State {
    pub num_patients: usize,
    pub max_group_size: usize,
    /// Testing capacity left in the current cycle.
    pub extra_tests_needed: usize,

    pub prior_infection_rate: RatePrior,
    pub prior_sensitivity: SizeParam,
    pub prior_specificity: SizeParam,

    /// Posterior weights, aligned with `particles` by insertion order.
    pub particle_weights: Vec<f64>,
    /// Hypothesized infection-status vectors, one row per particle.
    pub particles: Vec<Vec<bool>>,

    pub past_groups: Vec<Group>,
    pub past_test_results: Vec<bool>,
    /// Indices of past groups that tested positive and await clearing.
    pub to_clear_positives: Vec<usize>,
    /// Set once no further testing is needed.
    pub all_cleared: bool,

    pending_groups: Vec<Group>,
    pending_needs_clearing: Vec<bool>,
}

impl State {
    pub fn new(model: &ModelConfig) -> Self {
        Self {
            num_patients: model.num_patients,
            max_group_size: model.max_group_size,
            extra_tests_needed: model.tests_per_cycle,
            prior_infection_rate: model.prior_infection_rate.clone(),
            prior_sensitivity: model.sensitivity.clone(),
            prior_specificity: model.specificity.clone(),
            particle_weights: Vec::new(),
            particles: Vec::new(),
            past_groups: Vec::new(),
            past_test_results: Vec::new(),
            to_clear_positives: Vec::new(),
            all_cleared: false,
            pending_groups: Vec::new(),
            pending_needs_clearing: Vec::new(),
        }
    }

    /// Per-patient infection probability under the current posterior.
    ///
    /// Falls back to the prior rates while no sampler has run yet.
    pub fn marginal(&self) -> Vec<f64> {
        if self.particles.is_empty() {
            return (0..self.num_patients)
                .map(|patient| self.prior_infection_rate.rate_for(patient))
                .collect();
        }
        let mut marginal = vec![0.0; self.num_patients];
        for (weight, particle) in self.particle_weights.iter().zip(&self.particles) {
            for (val, &infected) in marginal.iter_mut().zip(particle) {
                if infected {
                    *val += weight;
                }
            }
        }
        marginal
    }

    /// Queue a batch of groups for testing.
    ///
    /// Groups flagged with `results_need_clearing` that come back positive
    /// are tracked in `to_clear_positives` until a selector resolves them.
    pub fn add_groups_to_test(
        &mut self,
        groups: Vec<Group>,
        results_need_clearing: bool,
    ) -> Result<()> {
        for group in &groups {
            if group.len() != self.num_patients {
                bail!(
                    "group length must be {}, but is {}",
                    self.num_patients,
                    group.len()
                );
            }
            if !group.iter().any(|&member| member) {
                bail!("cannot queue an empty group");
            }
        }
        self.extra_tests_needed = self.extra_tests_needed.saturating_sub(groups.len());
        self.pending_needs_clearing
            .extend(std::iter::repeat_n(results_need_clearing, groups.len()));
        self.pending_groups.extend(groups);
        Ok(())
    }

    /// Drop the pending-positive bookkeeping once a selector has resolved
    /// every group in it.
    pub fn update_to_clear_positives(&mut self) {
        self.to_clear_positives.clear();
    }

    /// Take the queued groups together with their clearing flags.
    pub fn take_pending(&mut self) -> Vec<(Group, bool)> {
        let groups = std::mem::take(&mut self.pending_groups);
        let flags = std::mem::take(&mut self.pending_needs_clearing);
        groups.into_iter().zip(flags).collect()
    }

    /// Append one test outcome to the history.
    pub fn record_result(&mut self, group: Group, result: bool, needs_clearing: bool) {
        let index = self.past_groups.len();
        self.past_groups.push(group);
        self.past_test_results.push(result);
        if needs_clearing && result {
            self.to_clear_positives.push(index);
        }
    }
}

/// Number of patients pooled in a group.
pub fn group_size(group: &[bool]) -> usize {
    group.iter().filter(|&&member| member).count()
}

/// Indices of the patients pooled in a group.
pub fn group_members(group: &[bool]) -> Vec<usize> {
    group
        .iter()
        .enumerate()
        .filter_map(|(patient, &member)| member.then_some(patient))
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_state(num_patients: usize) -> State {
        State::new(&ModelConfig {
            num_patients,
            max_group_size: num_patients,
            tests_per_cycle: 4,
            max_cycles: 16,
            prior_infection_rate: RatePrior::Scalar(0.1),
            sensitivity: SizeParam::Scalar(0.95),
            specificity: SizeParam::Scalar(0.98),
        })
    }

    #[test]
    fn marginal_weights_particles() {
        let mut state = test_state(3);
        state.particles = vec![
            vec![true, false, false],
            vec![true, true, false],
            vec![false, false, false],
        ];
        state.particle_weights = vec![0.5, 0.25, 0.25];

        let marginal = state.marginal();
        assert!((marginal[0] - 0.75).abs() < 1e-12);
        assert!((marginal[1] - 0.25).abs() < 1e-12);
        assert_eq!(marginal[2], 0.0);
    }

    #[test]
    fn marginal_falls_back_to_prior() {
        let state = test_state(2);
        assert_eq!(state.marginal(), vec![0.1, 0.1]);
    }

    #[test]
    fn empty_groups_are_rejected() {
        let mut state = test_state(3);
        let result = state.add_groups_to_test(vec![vec![false, false, false]], false);
        assert!(result.is_err());
    }

    #[test]
    fn queueing_consumes_capacity() {
        let mut state = test_state(4);
        state.extra_tests_needed = 3;
        state
            .add_groups_to_test(vec![vec![true, true, false, false]], false)
            .unwrap();
        assert_eq!(state.extra_tests_needed, 2);
        assert_eq!(state.take_pending().len(), 1);
    }

    #[test]
    fn positive_cleared_results_are_tracked() {
        let mut state = test_state(2);
        state.record_result(vec![true, false], true, true);
        state.record_result(vec![false, true], true, false);
        state.record_result(vec![true, true], false, true);
        assert_eq!(state.to_clear_positives, vec![0]);

        state.update_to_clear_positives();
        assert!(state.to_clear_positives.is_empty());
    }

    #[test]
    fn group_helpers() {
        let group = vec![true, false, true, false];
        assert_eq!(group_size(&group), 2);
        assert_eq!(group_members(&group), vec![0, 2]);
    }
}
