use crate::config::Config;
use crate::engine::Record;
use crate::stats::Accumulator;
use anyhow::{Context, Result, bail};
use rmp_serde::decode;
use std::{
    fs::File,
    io::{BufReader, BufWriter},
    path::Path,
};

pub trait Obs {
    fn update(&mut self, record: &Record) -> Result<()>;
    fn report(&self) -> serde_json::Value;
}

/// Tests consumed per cycle.
pub struct TestsPerCycle {
    acc: Accumulator,
    total: u64,
}

impl TestsPerCycle {
    pub fn new() -> Self {
        Self {
            acc: Accumulator::new(),
            total: 0,
        }
    }
}

impl Obs for TestsPerCycle {
    fn update(&mut self, record: &Record) -> Result<()> {
        self.acc.add(record.tests_used as f64);
        self.total += record.tests_used as u64;
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({
            "tests_per_cycle": self.acc.report(),
            "total_tests": self.total,
        })
    }
}

/// First cycle at which the run reported clearance, if any.
pub struct ClearanceCycle {
    cleared_at: Option<usize>,
}

impl ClearanceCycle {
    pub fn new() -> Self {
        Self { cleared_at: None }
    }
}

impl Obs for ClearanceCycle {
    fn update(&mut self, record: &Record) -> Result<()> {
        if record.all_cleared && self.cleared_at.is_none() {
            self.cleared_at = Some(record.cycle);
        }
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({ "clearance_cycle": self.cleared_at })
    }
}

/// Expected number of infected patients under the working posterior.
pub struct PosteriorMass {
    acc: Accumulator,
}

impl PosteriorMass {
    pub fn new() -> Self {
        Self {
            acc: Accumulator::new(),
        }
    }
}

impl Obs for PosteriorMass {
    fn update(&mut self, record: &Record) -> Result<()> {
        self.acc.add(record.marginal.iter().sum());
        Ok(())
    }

    fn report(&self) -> serde_json::Value {
        serde_json::json!({ "posterior_mass": self.acc.report() })
    }
}

pub struct Analyzer {
    cfg: Config,
    obs_ptr_vec: Vec<Box<dyn Obs>>,
}

impl Analyzer {
    pub fn new(cfg: Config) -> Self {
        let mut obs_ptr_vec: Vec<Box<dyn Obs>> = Vec::new();
        obs_ptr_vec.push(Box::new(TestsPerCycle::new()));
        obs_ptr_vec.push(Box::new(ClearanceCycle::new()));
        obs_ptr_vec.push(Box::new(PosteriorMass::new()));
        Self { cfg, obs_ptr_vec }
    }

    pub fn add_file<P: AsRef<Path>>(&mut self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
        let mut reader = BufReader::new(file);

        // Cleared runs write fewer than cycles_per_file records, so read
        // to the end of the stream.
        for _ in 0..self.cfg.output.cycles_per_file {
            let Ok(record) = decode::from_read::<_, Record>(&mut reader) else {
                break;
            };
            if record.marginal.len() != self.cfg.model.num_patients {
                bail!(
                    "record marginal length {} does not match the configured population",
                    record.marginal.len()
                );
            }
            for obs in &mut self.obs_ptr_vec {
                obs.update(&record).context("failed to update observable")?;
            }
        }
        Ok(())
    }

    pub fn save_results<P: AsRef<Path>>(&self, file: P) -> Result<()> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        let writer = BufWriter::new(file);

        let reports: Vec<_> = self.obs_ptr_vec.iter().map(|obs| obs.report()).collect();
        serde_json::to_writer_pretty(writer, &reports)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(cycle: usize, tests_used: usize, all_cleared: bool) -> Record {
        Record {
            cycle,
            tests_used,
            all_cleared,
            marginal: vec![0.25, 0.5],
        }
    }

    #[test]
    fn tests_per_cycle_tracks_mean_and_total() {
        let mut obs = TestsPerCycle::new();
        obs.update(&record(0, 4, false)).unwrap();
        obs.update(&record(1, 2, false)).unwrap();

        let report = obs.report();
        assert_eq!(report["total_tests"], 6);
        assert_eq!(report["tests_per_cycle"]["mean"], 3.0);
    }

    #[test]
    fn clearance_cycle_keeps_the_first_hit() {
        let mut obs = ClearanceCycle::new();
        obs.update(&record(0, 3, false)).unwrap();
        assert_eq!(obs.report()["clearance_cycle"], serde_json::Value::Null);

        obs.update(&record(1, 1, true)).unwrap();
        obs.update(&record(2, 0, true)).unwrap();
        assert_eq!(obs.report()["clearance_cycle"], 1);
    }

    #[test]
    fn posterior_mass_averages_the_marginal_sum() {
        let mut obs = PosteriorMass::new();
        obs.update(&record(0, 1, false)).unwrap();

        let report = obs.report();
        assert_eq!(report["posterior_mass"]["mean"], 0.75);
    }
}
