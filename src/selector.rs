use crate::config::{PolicyConfig, StageConfig};
use crate::dorfman::InformativeDorfman;
use crate::mutual_information::MaxMutualInformation;
use crate::split::{Split, SplitPositive, TwoStageMatrix};
use crate::state::State;
use anyhow::{Context, Result, bail};
use rand_chacha::ChaCha12Rng;

/// A strategy that decides which groups to test next.
///
/// One call per testing cycle: reads the belief state, queues new groups
/// (or marks the run cleared), consuming the supplied random stream in a
/// fixed order.
pub trait GroupSelector {
    /// Whether the strategy requires a particle-weighted posterior, or can
    /// operate from raw marginals and history alone.
    fn needs_posterior(&self) -> bool {
        false
    }

    fn select(&self, rng: &mut ChaCha12Rng, state: &mut State) -> Result<()>;
}

/// The ordered selector stages of a run.
pub struct Policy {
    stages: Vec<Box<dyn GroupSelector>>,
}

impl Policy {
    pub fn from_config(cfg: &PolicyConfig) -> Result<Self> {
        if cfg.stages.is_empty() {
            bail!("policy must have at least one stage");
        }
        let stages = cfg
            .stages
            .iter()
            .enumerate()
            .map(|(i_stage, stage)| {
                build_stage(stage).with_context(|| format!("failed to build stage {i_stage}"))
            })
            .collect::<Result<_>>()?;
        Ok(Self { stages })
    }

    /// Selector in charge of a cycle; cycles past the last stage reuse it.
    pub fn stage(&self, cycle: usize) -> &dyn GroupSelector {
        let index = cycle.min(self.stages.len() - 1);
        self.stages[index].as_ref()
    }
}

fn build_stage(stage: &StageConfig) -> Result<Box<dyn GroupSelector>> {
    Ok(match *stage {
        StageConfig::MaxMutualInformation {
            forward_iterations,
            backward_iterations,
        } => Box::new(MaxMutualInformation::new(
            forward_iterations,
            backward_iterations,
        )?),
        StageConfig::InformativeDorfman {
            cut_off_low,
            cut_off_high,
            modified,
        } => Box::new(InformativeDorfman::new(cut_off_low, cut_off_high, modified)?),
        StageConfig::Split { split_factor } => Box::new(Split::new(split_factor)?),
        StageConfig::SplitPositive { split_factor } => Box::new(SplitPositive::new(split_factor)?),
        StageConfig::TwoStageMatrix => Box::new(TwoStageMatrix),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SamplerKind;

    #[test]
    fn later_cycles_reuse_the_last_stage() {
        let policy = Policy::from_config(&PolicyConfig {
            sampler: SamplerKind::Exhaustive,
            stages: vec![
                StageConfig::Split {
                    split_factor: Some(4),
                },
                StageConfig::SplitPositive { split_factor: None },
            ],
        })
        .unwrap();

        assert!(!policy.stage(0).needs_posterior());
        assert!(!policy.stage(1).needs_posterior());
        assert!(!policy.stage(7).needs_posterior());
    }

    #[test]
    fn mutual_information_stage_needs_posterior() {
        let policy = Policy::from_config(&PolicyConfig {
            sampler: SamplerKind::Exhaustive,
            stages: vec![StageConfig::MaxMutualInformation {
                forward_iterations: 1,
                backward_iterations: 0,
            }],
        })
        .unwrap();
        assert!(policy.stage(0).needs_posterior());
    }
}
