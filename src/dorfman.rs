use crate::config::SizeParam;
use crate::selector::GroupSelector;
use crate::state::State;
use anyhow::{Result, bail};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;

/// Pool-specific optimal Dorfman grouping driven by posterior marginals.
///
/// Patients whose marginal already sits outside the cut-off band are
/// considered resolved and skipped. The rest are sorted by marginal and
/// carved into groups whose size minimizes the expected number of tests
/// per patient under a pool-then-retest cost model.
pub struct InformativeDorfman {
    cut_off_low: f64,
    cut_off_high: f64,
    /// Cap the queued groups to the cycle's testing capacity instead of
    /// queueing the whole grouping at once.
    modified: bool,
}

impl InformativeDorfman {
    pub fn new(cut_off_low: f64, cut_off_high: f64, modified: bool) -> Result<Self> {
        if !(0.0..=1.0).contains(&cut_off_low)
            || !(0.0..=1.0).contains(&cut_off_high)
            || cut_off_low >= cut_off_high
        {
            bail!("cut-offs must satisfy 0 <= cut_off_low < cut_off_high <= 1");
        }
        Ok(Self {
            cut_off_low,
            cut_off_high,
            modified,
        })
    }
}

impl GroupSelector for InformativeDorfman {
    fn select(&self, rng: &mut ChaCha12Rng, state: &mut State) -> Result<()> {
        let marginal = state.marginal();
        let mut eligible: Vec<usize> = (0..state.num_patients)
            .filter(|&patient| {
                marginal[patient] > self.cut_off_low && marginal[patient] < self.cut_off_high
            })
            .collect();
        if eligible.is_empty() {
            // everyone's status is already decided
            state.all_cleared = true;
            return Ok(());
        }
        eligible.sort_by(|&a, &b| marginal[a].total_cmp(&marginal[b]));
        let sorted_marginal: Vec<f64> = eligible.iter().map(|&patient| marginal[patient]).collect();

        let mut groups: Vec<Vec<bool>> = Vec::new();
        let mut cursor = 0;
        while cursor < eligible.len() {
            let horizon = (eligible.len() - cursor).min(state.max_group_size);
            let size = best_group_size(
                &sorted_marginal[cursor..cursor + horizon],
                &state.prior_sensitivity,
                &state.prior_specificity,
            );
            let mut group = vec![false; state.num_patients];
            for &patient in &eligible[cursor..cursor + size] {
                group[patient] = true;
            }
            groups.push(group);
            cursor += size;
        }

        // The sort orders groups by prevalence; shuffle so capacity cuts
        // and later attribution do not systematically favor low marginals.
        groups.shuffle(rng);
        if self.modified {
            groups.truncate(state.extra_tests_needed);
        }
        state.add_groups_to_test(groups, true)
    }
}

/// Size minimizing the expected number of tests per pooled patient.
///
/// `marginals` is the ascending tail of eligible marginals, already capped
/// at the maximum group size. A pool of size `s` costs one test plus `s`
/// retests when it triggers, which happens with probability
/// `sens_s + (1 - sens_s - spec_s) * prod(1 - marginal)`. A group of size
/// 1 costs exactly one test; the general formula does not apply there.
pub(crate) fn best_group_size(
    marginals: &[f64],
    sensitivity: &SizeParam,
    specificity: &SizeParam,
) -> usize {
    let mut best_size = 1;
    let mut best_cost = f64::INFINITY;
    let mut prob_all_negative = 1.0;
    for size in 1..=marginals.len() {
        prob_all_negative *= 1.0 - marginals[size - 1];
        let cost = if size == 1 {
            1.0
        } else {
            let sens = sensitivity.for_size(size);
            let spec = specificity.for_size(size);
            let prob_retest = sens + (1.0 - sens - spec) * prob_all_negative;
            (1.0 + size as f64 * prob_retest) / size as f64
        };
        if cost < best_cost {
            best_cost = cost;
            best_size = size;
        }
    }
    best_size
}
