use crate::config::SizeParam;
use crate::metrics::{binary_entropy, entropy};
use crate::selector::GroupSelector;
use crate::state::State;
use anyhow::{Result, bail};
use rand::prelude::*;
use rand_chacha::ChaCha12Rng;
use rand_distr::StandardNormal;

/// Minimal objective gain required to keep growing a group.
const ACCEPT_TOLERANCE: f64 = 1e-6;

/// Merges identical particles and sums their weights.
///
/// Each particle is projected onto one random direction; particles whose
/// projections are bit-identical are treated as equal. This is a stochastic
/// uniqueness test, not an exact one, but a false merge requires two
/// distinct particles to hit the same float, which is negligible for a
/// generic direction.
pub fn collapse_particles(
    rng: &mut ChaCha12Rng,
    particle_weights: &[f64],
    particles: &[Vec<bool>],
) -> (Vec<f64>, Vec<Vec<bool>>) {
    if particles.len() < 2 {
        return (particle_weights.to_vec(), particles.to_vec());
    }
    let num_patients = particles[0].len();

    let alpha: Vec<f64> = (0..num_patients).map(|_| rng.sample(StandardNormal)).collect();
    let keys: Vec<f64> = particles
        .iter()
        .map(|particle| {
            particle
                .iter()
                .zip(&alpha)
                .filter_map(|(&member, &dir)| member.then_some(dir))
                .sum()
        })
        .collect();

    let mut order: Vec<usize> = (0..particles.len()).collect();
    order.sort_by(|&a, &b| keys[a].total_cmp(&keys[b]));

    let mut new_weights: Vec<f64> = Vec::new();
    let mut new_particles: Vec<Vec<bool>> = Vec::new();
    let mut prev_key = f64::NAN;
    for &index in &order {
        if let Some(last) = new_weights.last_mut()
            && keys[index] == prev_key
        {
            *last += particle_weights[index];
        } else {
            new_weights.push(particle_weights[index]);
            new_particles.push(particles[index].clone());
            prev_key = keys[index];
        }
    }
    (new_weights, new_particles)
}

/// Probability of a negative and a positive result for one particle.
fn outcome_probabilities(positive_in_group: bool, specificity: f64, rho: f64) -> (f64, f64) {
    let indicator = if positive_in_group { 1.0 } else { 0.0 };
    let prob_negative = specificity - rho * indicator;
    (prob_negative, 1.0 - prob_negative)
}

/// Doubles an outcome table's state space with one more test.
fn extend_table(
    prev_table: &[Vec<f64>],
    positives: &[bool],
    specificity: f64,
    rho: f64,
) -> Vec<Vec<f64>> {
    prev_table
        .iter()
        .zip(positives)
        .map(|(row, &positive)| {
            let (prob_neg, prob_pos) = outcome_probabilities(positive, specificity, rho);
            row.iter()
                .map(|&prob| prob * prob_neg)
                .chain(row.iter().map(|&prob| prob * prob_pos))
                .collect()
        })
        .collect()
}

/// One evaluated change to the group under construction, with the
/// quantities needed if the group were committed afterwards.
struct MiStep {
    group: Vec<bool>,
    /// Per particle, whether the updated group pools an infected patient.
    positives: Vec<bool>,
    objective: f64,
    /// `[num_particles, 2^(k+1)]` outcome table were this group committed.
    table: Vec<Vec<f64>>,
    cond_entropy: f64,
}

/// Greedy search context for one testing cycle.
///
/// Carries the collapsed posterior and, as groups are committed, the
/// joint outcome-probability table and cumulative conditional entropy of
/// the committed groups.
struct MiSearch<'a> {
    particle_weights: Vec<f64>,
    particles: Vec<Vec<bool>>,
    sensitivity: &'a SizeParam,
    specificity: &'a SizeParam,
    /// `[num_particles, 2^k]` for the k groups committed so far.
    prev_table: Vec<Vec<f64>>,
    prev_cond_entropy: f64,
}

impl MiSearch<'_> {
    /// Scores every one-patient change to the group under construction
    /// and applies the best one.
    ///
    /// Candidates are the absent patients when growing, the current
    /// members when backtracking. Each is scored by the entropy of the
    /// joint outcome table it would produce minus the accumulated
    /// conditional entropy, with sensitivity and specificity resolved
    /// for the resulting group size. Ties go to the lowest patient index.
    fn joint_mi_criterion(
        &self,
        cur_group: &[bool],
        cur_positives: &[bool],
        backtracking: bool,
    ) -> Result<MiStep> {
        let members = cur_group.iter().filter(|&&member| member).count();
        let group_size = if backtracking { members - 1 } else { members + 1 };
        let sensitivity = self.sensitivity.for_size(group_size);
        let specificity = self.specificity.for_size(group_size);

        let mut candidates: Vec<usize> = Vec::new();
        let mut positive_in_groups: Vec<Vec<bool>> = Vec::new();
        if backtracking {
            // Removing a patient can turn positives negative, so the
            // pooled status is recomputed from scratch per candidate.
            for patient in (0..cur_group.len()).filter(|&patient| cur_group[patient]) {
                let positives = self
                    .particles
                    .iter()
                    .map(|particle| {
                        particle.iter().zip(cur_group).enumerate().any(
                            |(other, (&infected, &member))| {
                                member && other != patient && infected
                            },
                        )
                    })
                    .collect();
                candidates.push(patient);
                positive_in_groups.push(positives);
            }
        } else {
            // Adding a patient only ever turns negatives positive, so
            // the previous pooled status extends directly.
            for patient in (0..cur_group.len()).filter(|&patient| !cur_group[patient]) {
                let positives = self
                    .particles
                    .iter()
                    .zip(cur_positives)
                    .map(|(particle, &positive)| positive || particle[patient])
                    .collect();
                candidates.push(patient);
                positive_in_groups.push(positives);
            }
        }
        let entropy_spec = binary_entropy(specificity);
        let gamma = binary_entropy(sensitivity) - entropy_spec;
        let rho = specificity + sensitivity - 1.0;

        let mut best: Option<(usize, f64, f64)> = None;
        for (candidate, positives) in positive_in_groups.iter().enumerate() {
            let positive_mass: f64 = positives
                .iter()
                .zip(&self.particle_weights)
                .filter_map(|(&positive, &weight)| positive.then_some(weight))
                .sum();
            let cond_entropy = self.prev_cond_entropy + entropy_spec + gamma * positive_mass;
            let objective = self.whole_entropy(positives, specificity, rho) - cond_entropy;
            if best.is_none_or(|(_, best_objective, _)| objective > best_objective) {
                best = Some((candidate, objective, cond_entropy));
            }
        }
        let Some((chosen, objective, cond_entropy)) = best else {
            bail!("no candidate patients left to consider");
        };

        let mut group = cur_group.to_vec();
        group[candidates[chosen]] = !backtracking;
        let positives = positive_in_groups.swap_remove(chosen);
        let table = extend_table(&self.prev_table, &positives, specificity, rho);

        Ok(MiStep {
            group,
            positives,
            objective,
            table,
            cond_entropy,
        })
    }

    /// Entropy of the joint outcome distribution of the committed groups
    /// plus one more test with the given per-particle positivity.
    fn whole_entropy(&self, positives: &[bool], specificity: f64, rho: f64) -> f64 {
        let prev_states = self.prev_table[0].len();
        let mut cells = vec![0.0; 2 * prev_states];
        for ((&positive, &weight), row) in positives
            .iter()
            .zip(&self.particle_weights)
            .zip(&self.prev_table)
        {
            let (prob_neg, prob_pos) = outcome_probabilities(positive, specificity, rho);
            for (outcome, &prob) in row.iter().enumerate() {
                cells[outcome] += prob * weight * prob_neg;
                cells[prev_states + outcome] += prob * weight * prob_pos;
            }
        }
        entropy(&cells)
    }

    /// Makes a finished group's table and conditional entropy the
    /// baseline for the next group.
    fn commit(&mut self, step: MiStep) -> Vec<bool> {
        self.prev_table = step.table;
        self.prev_cond_entropy = step.cond_entropy;
        step.group
    }
}

/// Greedy group selector maximizing the mutual information between test
/// outcomes and the infection state.
///
/// Groups are committed sequentially within a cycle; each committed
/// group's joint outcome table conditions the search for the next one.
/// This is a greedy approximation, not a joint optimum.
pub struct MaxMutualInformation {
    forward_iterations: usize,
    backward_iterations: usize,
}

impl MaxMutualInformation {
    pub fn new(forward_iterations: usize, backward_iterations: usize) -> Result<Self> {
        if forward_iterations <= backward_iterations {
            bail!("forward iterations must be greater than backward iterations");
        }
        Ok(Self {
            forward_iterations,
            backward_iterations,
        })
    }
}

impl GroupSelector for MaxMutualInformation {
    fn needs_posterior(&self) -> bool {
        true
    }

    /// Forward-backward search for groups with large mutual information.
    fn select(&self, rng: &mut ChaCha12Rng, state: &mut State) -> Result<()> {
        let (particle_weights, particles) =
            collapse_particles(rng, &state.particle_weights, &state.particles);
        if particles.is_empty() {
            bail!("posterior holds no particles");
        }
        let num_particles = particles.len();

        let mut search = MiSearch {
            particle_weights,
            particles,
            sensitivity: &state.prior_sensitivity,
            specificity: &state.prior_specificity,
            prev_table: vec![vec![1.0]; num_particles],
            prev_cond_entropy: 0.0,
        };
        let mut chosen_groups: Vec<Vec<bool>> = Vec::new();

        while chosen_groups.len() < state.extra_tests_needed {
            let mut proposal = MiStep {
                group: vec![false; state.num_patients],
                positives: vec![false; num_particles],
                objective: -1.0,
                table: Vec::new(),
                cond_entropy: 0.0,
            };
            let mut committed: Option<MiStep> = None;
            let mut group_size = 0;
            let mut best_objective = -1.0;
            let forward = self.forward_iterations;
            let mut backward = self.backward_iterations;

            // Grow while a full forward-backward step still fits.
            while group_size + forward - backward <= state.max_group_size {
                for (steps, backtracking) in [(forward, false), (backward, true)] {
                    for _ in 0..steps {
                        proposal = search.joint_mi_criterion(
                            &proposal.group,
                            &proposal.positives,
                            backtracking,
                        )?;
                    }
                }

                if proposal.objective > best_objective + ACCEPT_TOLERANCE {
                    best_objective = proposal.objective;
                    group_size += forward - backward;
                    committed = Some(MiStep {
                        group: proposal.group.clone(),
                        positives: proposal.positives.clone(),
                        objective: proposal.objective,
                        table: proposal.table.clone(),
                        cond_entropy: proposal.cond_entropy,
                    });
                    // Raise the backward count just enough to keep the
                    // upper bound on group size reachable, while leaving
                    // net positive progress per step.
                    backward =
                        backward.max((group_size + forward).saturating_sub(state.max_group_size));
                    backward = backward.min(forward - 1);
                } else {
                    break;
                }
            }

            let Some(committed) = committed else {
                bail!("failed to form a group within the size constraints");
            };
            chosen_groups.push(search.commit(committed));
        }

        state.add_groups_to_test(chosen_groups, false)
    }
}
