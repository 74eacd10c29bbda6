use crate::sampler::Sampler;
use crate::state::{State, group_size};
use anyhow::Result;
use rand_chacha::ChaCha12Rng;

/// Deterministic Dorfman decoding.
///
/// Produces a single degenerate particle marking exactly the patients
/// that returned a positive individual test. Pooled evidence is ignored,
/// matching how classical Dorfman protocols read out results.
pub struct DorfmanDecoder;

impl Sampler for DorfmanDecoder {
    fn produce(&self, _rng: &mut ChaCha12Rng, state: &mut State) -> Result<()> {
        let mut particle = vec![false; state.num_patients];
        for (group, &result) in state.past_groups.iter().zip(&state.past_test_results) {
            if result && group_size(group) == 1 {
                for (patient, &member) in group.iter().enumerate() {
                    if member {
                        particle[patient] = true;
                    }
                }
            }
        }
        state.particle_weights = vec![1.0];
        state.particles = vec![particle];
        Ok(())
    }
}
