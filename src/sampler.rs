use crate::config::{MAX_EXHAUSTIVE_PATIENTS, SamplerKind};
use crate::decoder::DorfmanDecoder;
use crate::state::{State, group_size};
use anyhow::{Result, bail};
use rand_chacha::ChaCha12Rng;

/// Refreshes the particle approximation of the posterior from the testing
/// history. The decision layer treats this as an oracle.
pub trait Sampler {
    fn produce(&self, rng: &mut ChaCha12Rng, state: &mut State) -> Result<()>;
}

pub fn build_sampler(kind: SamplerKind) -> Box<dyn Sampler> {
    match kind {
        SamplerKind::Exhaustive => Box::new(ExhaustiveSampler),
        SamplerKind::DorfmanDecoder => Box::new(DorfmanDecoder),
    }
}

/// Exact Bayesian posterior by enumeration of all infection vectors.
///
/// Only feasible for small populations; the configuration bounds
/// `num_patients` when this sampler is selected.
pub struct ExhaustiveSampler;

impl Sampler for ExhaustiveSampler {
    fn produce(&self, _rng: &mut ChaCha12Rng, state: &mut State) -> Result<()> {
        let num_patients = state.num_patients;
        if num_patients > MAX_EXHAUSTIVE_PATIENTS {
            bail!("exhaustive sampler supports at most {MAX_EXHAUSTIVE_PATIENTS} patients");
        }

        let mut particles: Vec<Vec<bool>> = Vec::new();
        let mut weights: Vec<f64> = Vec::new();
        for code in 0..(1usize << num_patients) {
            let particle: Vec<bool> = (0..num_patients).map(|bit| code >> bit & 1 == 1).collect();
            let weight = prior_probability(state, &particle) * likelihood(state, &particle);
            // inconsistent hypotheses carry no weight and only slow the
            // selectors down
            if weight > 0.0 {
                particles.push(particle);
                weights.push(weight);
            }
        }

        let total: f64 = weights.iter().sum();
        if total <= 0.0 {
            bail!("every infection hypothesis is inconsistent with the recorded results");
        }
        for weight in &mut weights {
            *weight /= total;
        }

        state.particle_weights = weights;
        state.particles = particles;
        Ok(())
    }
}

fn prior_probability(state: &State, particle: &[bool]) -> f64 {
    particle
        .iter()
        .enumerate()
        .map(|(patient, &infected)| {
            let rate = state.prior_infection_rate.rate_for(patient);
            if infected { rate } else { 1.0 - rate }
        })
        .product()
}

fn likelihood(state: &State, particle: &[bool]) -> f64 {
    state
        .past_groups
        .iter()
        .zip(&state.past_test_results)
        .map(|(group, &result)| {
            let pooled_positive = group
                .iter()
                .zip(particle)
                .any(|(&member, &infected)| member && infected);
            let size = group_size(group);
            if pooled_positive {
                let sens = state.prior_sensitivity.for_size(size);
                if result { sens } else { 1.0 - sens }
            } else {
                let spec = state.prior_specificity.for_size(size);
                if result { 1.0 - spec } else { spec }
            }
        })
        .product()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SizeParam;
    use crate::state::tests::test_state;
    use rand::SeedableRng;

    fn rng() -> ChaCha12Rng {
        ChaCha12Rng::seed_from_u64(0)
    }

    #[test]
    fn posterior_without_evidence_matches_the_prior() {
        let mut state = test_state(3);
        ExhaustiveSampler.produce(&mut rng(), &mut state).unwrap();

        assert_eq!(state.particles.len(), 8);
        let total: f64 = state.particle_weights.iter().sum();
        assert!((total - 1.0).abs() < 1e-12);
        for marginal in state.marginal() {
            assert!((marginal - 0.1).abs() < 1e-12);
        }
    }

    #[test]
    fn perfect_negative_pool_excludes_its_members() {
        let mut state = test_state(4);
        state.prior_sensitivity = SizeParam::Scalar(1.0);
        state.prior_specificity = SizeParam::Scalar(1.0);
        state.record_result(vec![true, true, false, false], false, false);

        ExhaustiveSampler.produce(&mut rng(), &mut state).unwrap();

        let marginal = state.marginal();
        assert_eq!(marginal[0], 0.0);
        assert_eq!(marginal[1], 0.0);
        assert!(marginal[2] > 0.0);
    }

    #[test]
    fn positive_pool_raises_member_marginals() {
        let mut state = test_state(4);
        state.record_result(vec![true, true, false, false], true, false);

        ExhaustiveSampler.produce(&mut rng(), &mut state).unwrap();

        let marginal = state.marginal();
        assert!(marginal[0] > 0.1);
        assert!(marginal[1] > 0.1);
        assert!((marginal[3] - 0.1).abs() < 1e-9);
    }

    #[test]
    fn contradictory_perfect_results_are_an_error() {
        let mut state = test_state(2);
        state.prior_sensitivity = SizeParam::Scalar(1.0);
        state.prior_specificity = SizeParam::Scalar(1.0);
        state.record_result(vec![true, false], true, false);
        state.record_result(vec![true, false], false, false);

        assert!(ExhaustiveSampler.produce(&mut rng(), &mut state).is_err());
    }
}
