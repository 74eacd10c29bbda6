use crate::selector::GroupSelector;
use crate::state::{State, group_members};
use anyhow::{Result, bail};
use rand_chacha::ChaCha12Rng;

/// Contiguous index ranges splitting `len` items into `parts` chunks.
///
/// The first `len % parts` chunks get one extra item; chunks past `len`
/// come out empty and are skipped by the callers.
fn chunk_bounds(len: usize, parts: usize) -> Vec<(usize, usize)> {
    let base = len / parts;
    let extra = len % parts;
    let mut bounds = Vec::with_capacity(parts);
    let mut start = 0;
    for chunk in 0..parts {
        let size = base + usize::from(chunk < extra);
        bounds.push((start, start + size));
        start += size;
    }
    bounds
}

/// Partitions the whole population into contiguous groups.
///
/// Without an explicit factor the group size follows the classical
/// Dorfman rule derived from the scalar prior infection rate.
pub struct Split {
    split_factor: Option<usize>,
}

impl Split {
    pub fn new(split_factor: Option<usize>) -> Result<Self> {
        if split_factor == Some(0) {
            bail!("split factor must be at least 1");
        }
        Ok(Self { split_factor })
    }
}

impl GroupSelector for Split {
    fn select(&self, _rng: &mut ChaCha12Rng, state: &mut State) -> Result<()> {
        let split_factor = match self.split_factor {
            None => {
                let Some(rate) = state.prior_infection_rate.as_scalar() else {
                    bail!(
                        "splitting cannot be used with individual infection rates; \
                         consider using informative dorfman instead"
                    );
                };
                let group_size = 1 + (1.0 / rate.sqrt()).ceil() as usize;
                let group_size = group_size.min(state.max_group_size);
                state.num_patients.div_ceil(group_size)
            }
            // An explicit factor is raised until no group exceeds the
            // maximum group size.
            Some(factor) => factor.max(state.num_patients.div_ceil(state.max_group_size)),
        };

        let mut groups: Vec<Vec<bool>> = Vec::new();
        for (start, end) in chunk_bounds(state.num_patients, split_factor) {
            if start == end {
                continue;
            }
            let mut group = vec![false; state.num_patients];
            group[start..end].fill(true);
            groups.push(group);
        }
        state.add_groups_to_test(groups, true)
    }
}

/// Splits the past groups that tested positive and still await clearing.
///
/// Without an explicit factor every positive group is broken down into
/// singletons, as in classical Dorfman retesting.
pub struct SplitPositive {
    split_factor: Option<usize>,
}

impl SplitPositive {
    pub fn new(split_factor: Option<usize>) -> Result<Self> {
        if let Some(factor) = split_factor
            && factor < 2
        {
            bail!("split factor must be at least 2");
        }
        Ok(Self { split_factor })
    }
}

impl GroupSelector for SplitPositive {
    fn select(&self, _rng: &mut ChaCha12Rng, state: &mut State) -> Result<()> {
        let mut new_groups: Vec<Vec<bool>> = Vec::new();
        for &index in &state.to_clear_positives {
            let members = group_members(&state.past_groups[index]);
            // a positive singleton leaves nothing to split
            if members.len() < 2 {
                continue;
            }
            let factor = self.split_factor.unwrap_or(members.len());
            for (start, end) in chunk_bounds(members.len(), factor) {
                if start == end {
                    continue;
                }
                let mut group = vec![false; state.num_patients];
                for &patient in &members[start..end] {
                    group[patient] = true;
                }
                new_groups.push(group);
            }
        }

        if new_groups.is_empty() {
            state.all_cleared = true;
            return Ok(());
        }
        state.add_groups_to_test(new_groups, true)?;
        state.update_to_clear_positives();
        Ok(())
    }
}

/// Second stage of a fixed 8 x 12 assay matrix screen.
///
/// The first round tests 8 row pools and 12 column pools. Patients at the
/// intersection of a positive row and a positive column are retested
/// individually; if rows and columns disagree about the presence of
/// positives, everyone in any positive pool is retested.
pub struct TwoStageMatrix;

const NUM_ROWS: usize = 8;
const NUM_COLS: usize = 12;

impl GroupSelector for TwoStageMatrix {
    fn select(&self, _rng: &mut ChaCha12Rng, state: &mut State) -> Result<()> {
        if state.past_groups.len() != NUM_ROWS + NUM_COLS {
            state.all_cleared = true;
            return Ok(());
        }

        let mut positive_count = vec![0usize; state.num_patients];
        for (group, &result) in state.past_groups.iter().zip(&state.past_test_results) {
            if !result {
                continue;
            }
            for (patient, &member) in group.iter().enumerate() {
                if member {
                    positive_count[patient] += 1;
                }
            }
        }
        let rows_positive = state.past_test_results[..NUM_ROWS].iter().any(|&res| res);
        let cols_positive = state.past_test_results[NUM_ROWS..].iter().any(|&res| res);

        // A positive block facing an all-negative one means a test error
        // somewhere; fall back to retesting every implicated patient.
        let threshold = if rows_positive != cols_positive { 1 } else { 2 };
        let new_groups: Vec<Vec<bool>> = (0..state.num_patients)
            .filter(|&patient| positive_count[patient] >= threshold)
            .map(|patient| {
                let mut group = vec![false; state.num_patients];
                group[patient] = true;
                group
            })
            .collect();

        if new_groups.is_empty() {
            state.all_cleared = true;
            return Ok(());
        }
        log::info!("added {} individual retests", new_groups.len());
        state.add_groups_to_test(new_groups, false)
    }
}
