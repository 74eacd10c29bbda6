use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::{fmt::Debug, fs, ops::RangeBounds, path::Path};

/// Largest population the exhaustive posterior sampler accepts.
///
/// It enumerates all `2^num_patients` infection vectors.
pub const MAX_EXHAUSTIVE_PATIENTS: usize = 16;

/// Simulation configuration parameters.
///
/// Loaded from a TOML file and validated before use.
/// See [`Config::from_file`] for loading.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub policy: PolicyConfig,
    pub output: OutputConfig,
}

/// Parameters of the screening problem and the testing device.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Number of patients in the screened population.
    pub num_patients: usize,
    /// Largest number of patients that may be pooled into one test.
    pub max_group_size: usize,
    /// Number of tests the device can run per testing cycle.
    pub tests_per_cycle: usize,
    /// Testing cycle budget per run.
    pub max_cycles: usize,

    /// Prior infection rate, uniform or per patient.
    pub prior_infection_rate: RatePrior,
    /// Test sensitivity, constant or indexed by group size.
    pub sensitivity: SizeParam,
    /// Test specificity, constant or indexed by group size.
    pub specificity: SizeParam,
}

/// Sampler choice and the ordered group selector stages.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub sampler: SamplerKind,
    pub stages: Vec<StageConfig>,
}

#[derive(Debug, PartialEq, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplerKind {
    Exhaustive,
    DorfmanDecoder,
}

/// One group selector stage; cycle `i` uses stage `i`, later cycles reuse
/// the last stage.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StageConfig {
    MaxMutualInformation {
        forward_iterations: usize,
        backward_iterations: usize,
    },
    InformativeDorfman {
        #[serde(default)]
        cut_off_low: f64,
        #[serde(default = "default_cut_off_high")]
        cut_off_high: f64,
        #[serde(default)]
        modified: bool,
    },
    Split {
        split_factor: Option<usize>,
    },
    SplitPositive {
        split_factor: Option<usize>,
    },
    TwoStageMatrix,
}

fn default_cut_off_high() -> f64 {
    1.0
}

#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Number of cycle records written per trajectory file.
    pub cycles_per_file: usize,
}

/// A test parameter that is either constant or depends on the group size.
///
/// The table form is indexed by group size, entry 0 applying to groups of
/// size 1. Sizes at or beyond the table length resolve to the last entry.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeParam {
    Scalar(f64),
    PerSize(Vec<f64>),
}

impl SizeParam {
    /// Resolve the parameter value for a group of `size` patients.
    pub fn for_size(&self, size: usize) -> f64 {
        match self {
            SizeParam::Scalar(val) => *val,
            SizeParam::PerSize(vals) => vals[size.min(vals.len()).saturating_sub(1)],
        }
    }

    fn validate(&self) -> Result<()> {
        let vals = match self {
            SizeParam::Scalar(val) => std::slice::from_ref(val),
            SizeParam::PerSize(vals) => vals.as_slice(),
        };
        if vals.is_empty() {
            bail!("parameter table must have at least one entry");
        }
        for &val in vals {
            check_num(val, 0.0..=1.0).context("invalid probability")?;
        }
        Ok(())
    }
}

/// An infection rate prior that is either uniform or per patient.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RatePrior {
    Scalar(f64),
    PerPatient(Vec<f64>),
}

impl RatePrior {
    /// The uniform rate, or `None` for a per-patient prior.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            RatePrior::Scalar(rate) => Some(*rate),
            RatePrior::PerPatient(_) => None,
        }
    }

    /// Prior infection rate of one patient.
    pub fn rate_for(&self, patient: usize) -> f64 {
        match self {
            RatePrior::Scalar(rate) => *rate,
            RatePrior::PerPatient(rates) => rates[patient],
        }
    }

    fn validate(&self, num_patients: usize) -> Result<()> {
        let rates = match self {
            RatePrior::Scalar(rate) => std::slice::from_ref(rate),
            RatePrior::PerPatient(rates) => {
                if rates.len() != num_patients {
                    bail!(
                        "per-patient prior must have {num_patients} entries, but has {}",
                        rates.len()
                    );
                }
                rates.as_slice()
            }
        };
        for &rate in rates {
            if !(rate > 0.0 && rate < 1.0) {
                bail!("infection rate must be in the open interval (0, 1), but is {rate}");
            }
        }
        Ok(())
    }
}

impl Config {
    /// Load a [`Config`] from a file.
    ///
    /// The file must be TOML-encoded and contain a serialized [`Config`].
    /// Performs validation on all parameters before returning.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, deserialized,
    /// or if the configuration values are invalid.
    pub fn from_file<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let contents =
            fs::read_to_string(file).with_context(|| format!("failed to read {file:?}"))?;

        let config: Config = toml::from_str(&contents).context("failed to deserialize config")?;

        config.validate().context("failed to validate config")?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let model = &self.model;

        check_num(model.num_patients, 1..10_000).context("invalid number of patients")?;
        check_num(model.max_group_size, 1..=model.num_patients)
            .context("invalid maximum group size")?;
        check_num(model.tests_per_cycle, 1..=12).context("invalid number of tests per cycle")?;
        check_num(model.max_cycles, 1..10_000).context("invalid cycle budget")?;
        check_num(self.output.cycles_per_file, 1..10_000)
            .context("invalid number of cycles per file")?;

        model
            .prior_infection_rate
            .validate(model.num_patients)
            .context("invalid infection rate prior")?;
        model.sensitivity.validate().context("invalid sensitivity")?;
        model.specificity.validate().context("invalid specificity")?;

        if self.policy.stages.is_empty() {
            bail!("policy must have at least one stage");
        }
        for (i_stage, stage) in self.policy.stages.iter().enumerate() {
            self.validate_stage(stage)
                .with_context(|| format!("invalid policy stage {i_stage}"))?;
        }

        if self.policy.sampler == SamplerKind::Exhaustive
            && model.num_patients > MAX_EXHAUSTIVE_PATIENTS
        {
            bail!(
                "the exhaustive sampler enumerates 2^num_patients states \
                 and supports at most {MAX_EXHAUSTIVE_PATIENTS} patients"
            );
        }

        Ok(())
    }

    fn validate_stage(&self, stage: &StageConfig) -> Result<()> {
        match *stage {
            StageConfig::MaxMutualInformation {
                forward_iterations,
                backward_iterations,
            } => {
                if forward_iterations <= backward_iterations {
                    bail!("forward iterations must be greater than backward iterations");
                }
                if forward_iterations - backward_iterations > self.model.max_group_size {
                    bail!("one forward-backward step must fit within the maximum group size");
                }
                if self.policy.sampler != SamplerKind::Exhaustive {
                    bail!("max_mutual_information requires a posterior sampler");
                }
            }
            StageConfig::InformativeDorfman {
                cut_off_low,
                cut_off_high,
                ..
            } => {
                if !(0.0..=1.0).contains(&cut_off_low)
                    || !(0.0..=1.0).contains(&cut_off_high)
                    || cut_off_low >= cut_off_high
                {
                    bail!("cut-offs must satisfy 0 <= cut_off_low < cut_off_high <= 1");
                }
            }
            StageConfig::Split { split_factor } => {
                if split_factor == Some(0) {
                    bail!("split factor must be at least 1");
                }
                if split_factor.is_none() && self.model.prior_infection_rate.as_scalar().is_none() {
                    bail!(
                        "splitting cannot be used with individual infection rates; \
                         consider using informative dorfman instead"
                    );
                }
            }
            StageConfig::SplitPositive { split_factor } => {
                if let Some(factor) = split_factor
                    && factor < 2
                {
                    bail!("split factor must be at least 2");
                }
            }
            StageConfig::TwoStageMatrix => {}
        }
        Ok(())
    }
}

fn check_num<T, R>(num: T, range: R) -> Result<()>
where
    T: PartialOrd + Debug,
    R: RangeBounds<T> + Debug,
{
    if !range.contains(&num) {
        bail!("number must be in the range {range:?}, but is {num:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            model: ModelConfig {
                num_patients: 8,
                max_group_size: 4,
                tests_per_cycle: 2,
                max_cycles: 16,
                prior_infection_rate: RatePrior::Scalar(0.05),
                sensitivity: SizeParam::Scalar(0.95),
                specificity: SizeParam::Scalar(0.98),
            },
            policy: PolicyConfig {
                sampler: SamplerKind::Exhaustive,
                stages: vec![StageConfig::Split { split_factor: None }],
            },
            output: OutputConfig { cycles_per_file: 8 },
        }
    }

    #[test]
    fn scalar_param_ignores_size() {
        let param = SizeParam::Scalar(0.9);
        assert_eq!(param.for_size(1), 0.9);
        assert_eq!(param.for_size(100), 0.9);
    }

    #[test]
    fn size_table_clamps_to_last_entry() {
        let param = SizeParam::PerSize(vec![0.99, 0.97, 0.95]);
        assert_eq!(param.for_size(1), 0.99);
        assert_eq!(param.for_size(2), 0.97);
        assert_eq!(param.for_size(3), 0.95);
        assert_eq!(param.for_size(4), 0.95);
        assert_eq!(param.for_size(100), 0.95);
    }

    #[test]
    fn untagged_params_parse_from_toml() {
        #[derive(Deserialize)]
        struct Probe {
            scalar: SizeParam,
            table: SizeParam,
        }
        let probe: Probe = toml::from_str("scalar = 0.95\ntable = [0.99, 0.97]\n").unwrap();
        assert_eq!(probe.scalar, SizeParam::Scalar(0.95));
        assert_eq!(probe.table, SizeParam::PerSize(vec![0.99, 0.97]));
    }

    #[test]
    fn validate_accepts_base_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn validate_rejects_backward_not_below_forward() {
        let mut cfg = base_config();
        cfg.policy.stages = vec![StageConfig::MaxMutualInformation {
            forward_iterations: 1,
            backward_iterations: 1,
        }];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_vector_prior_for_plain_split() {
        let mut cfg = base_config();
        cfg.model.prior_infection_rate = RatePrior::PerPatient(vec![0.05; 8]);
        cfg.policy.stages = vec![StageConfig::Split { split_factor: None }];
        assert!(cfg.validate().is_err());

        cfg.policy.stages = vec![StageConfig::Split {
            split_factor: Some(4),
        }];
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn validate_rejects_oversized_exhaustive_population() {
        let mut cfg = base_config();
        cfg.model.num_patients = MAX_EXHAUSTIVE_PATIENTS + 1;
        assert!(cfg.validate().is_err());

        cfg.policy.sampler = SamplerKind::DorfmanDecoder;
        assert!(cfg.validate().is_ok());
    }
}
