/// Entropy of a Bernoulli variable with success probability `p`, in nats.
///
/// Uses the convention `0 * ln(0) = 0`, so the result is exactly 0.0 at
/// `p = 0` and `p = 1` rather than NaN.
pub fn binary_entropy(p: f64) -> f64 {
    neg_x_ln_x(p) + neg_x_ln_x(1.0 - p)
}

/// Shannon entropy of a probability table, in nats.
///
/// Cells with zero probability contribute nothing.
pub fn entropy(table: &[f64]) -> f64 {
    table.iter().map(|&p| neg_x_ln_x(p)).sum()
}

fn neg_x_ln_x(x: f64) -> f64 {
    if x > 0.0 { -x * x.ln() } else { 0.0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOL: f64 = 1e-12;

    #[test]
    fn binary_entropy_is_zero_at_endpoints() {
        assert_eq!(binary_entropy(0.0), 0.0);
        assert_eq!(binary_entropy(1.0), 0.0);
    }

    #[test]
    fn binary_entropy_is_symmetric() {
        for p in [0.1, 0.25, 0.4, 0.49] {
            assert!((binary_entropy(p) - binary_entropy(1.0 - p)).abs() < TOL);
        }
    }

    #[test]
    fn binary_entropy_is_maximal_at_one_half() {
        let max = binary_entropy(0.5);
        assert!((max - 2.0f64.ln()).abs() < TOL);
        for p in [0.0, 0.2, 0.45, 0.55, 0.8, 1.0] {
            assert!(binary_entropy(p) <= max);
        }
    }

    #[test]
    fn entropy_tolerates_zero_cells() {
        let table = [0.5, 0.5, 0.0, 0.0];
        let val = entropy(&table);
        assert!(val.is_finite());
        assert!((val - 2.0f64.ln()).abs() < TOL);
    }

    #[test]
    fn entropy_of_uniform_table() {
        let table = [0.25; 4];
        assert!((entropy(&table) - 4.0f64.ln()).abs() < TOL);
    }
}
