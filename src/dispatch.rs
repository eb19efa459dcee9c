use std::fmt::Debug;

use crate::types::ConfigError;

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Weighted action selection over cumulative probability bounds.
///
/// The table must cover the full [0, 1) interval: construction fails unless
/// the weights sum to 1.0 within tolerance, so a misconfigured mix is caught
/// before any traffic is generated.
#[derive(Debug)]
pub struct ActionTable<A: Copy + Debug> {
    // (action, cumulative upper bound), bounds strictly increasing to 1.0
    entries: Vec<(A, f64)>,
}

impl<A: Copy + Debug> ActionTable<A> {
    pub fn new(weights: &[(A, f64)]) -> Result<Self, ConfigError> {
        if weights.is_empty() {
            return Err(ConfigError::EmptyTable);
        }
        for (action, weight) in weights {
            if *weight < 0.0 {
                return Err(ConfigError::NegativeWeight(format!("{:?}", action), *weight));
            }
        }
        let sum: f64 = weights.iter().map(|(_, weight)| weight).sum();
        if (sum - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::NonExhaustiveTable(sum));
        }

        let mut entries = Vec::with_capacity(weights.len());
        let mut cumulative = 0.0;
        for (action, weight) in weights {
            cumulative += weight;
            entries.push((*action, cumulative));
        }
        // pin the final bound so rounding can never leave a gap at the top
        if let Some(last) = entries.last_mut() {
            last.1 = 1.0;
        }

        Ok(Self { entries })
    }

    /// Deterministic given the draw: the same draw always selects the same
    /// action, so seeded runs are reproducible.
    pub fn select(&self, draw: f64) -> A {
        debug_assert!((0.0..1.0).contains(&draw), "draw {} outside [0,1)", draw);
        for (action, bound) in &self.entries {
            if draw < *bound {
                return *action;
            }
        }
        self.entries[self.entries.len() - 1].0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    enum Action {
        A,
        B,
        C,
    }

    #[test]
    fn rejects_non_exhaustive_table() {
        let err = ActionTable::new(&[(Action::A, 0.5), (Action::B, 0.3)]).unwrap_err();
        assert!(matches!(err, ConfigError::NonExhaustiveTable(_)));
    }

    #[test]
    fn rejects_empty_table() {
        let err = ActionTable::<Action>::new(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyTable));
    }

    #[test]
    fn rejects_negative_weight() {
        let err =
            ActionTable::new(&[(Action::A, 1.2), (Action::B, -0.2)]).unwrap_err();
        assert!(matches!(err, ConfigError::NegativeWeight(_, _)));
    }

    #[test]
    fn select_is_deterministic_at_bounds() {
        let table =
            ActionTable::new(&[(Action::A, 0.5), (Action::B, 0.3), (Action::C, 0.2)]).unwrap();
        assert_eq!(table.select(0.0), Action::A);
        assert_eq!(table.select(0.4999), Action::A);
        assert_eq!(table.select(0.5), Action::B);
        assert_eq!(table.select(0.7999), Action::B);
        assert_eq!(table.select(0.8), Action::C);
        assert_eq!(table.select(0.9999), Action::C);
    }

    #[test]
    fn uniform_sweep_reproduces_configured_proportions() {
        let table =
            ActionTable::new(&[(Action::A, 0.5), (Action::B, 0.3), (Action::C, 0.2)]).unwrap();
        let draws = 10_000;
        let (mut a, mut b, mut c) = (0, 0, 0);
        for i in 0..draws {
            match table.select(i as f64 / draws as f64) {
                Action::A => a += 1,
                Action::B => b += 1,
                Action::C => c += 1,
            }
        }
        // within ±2% of expected over 10k draws
        assert!((a as f64 - 5000.0).abs() <= 200.0, "A selected {} times", a);
        assert!((b as f64 - 3000.0).abs() <= 200.0, "B selected {} times", b);
        assert!((c as f64 - 2000.0).abs() <= 200.0, "C selected {} times", c);
    }

    #[test]
    fn seeded_rng_draws_stay_within_tolerance() {
        let table =
            ActionTable::new(&[(Action::A, 0.5), (Action::B, 0.3), (Action::C, 0.2)]).unwrap();
        let mut rng = StdRng::seed_from_u64(1234);
        let draws = 10_000;
        let mut counts = [0usize; 3];
        for _ in 0..draws {
            match table.select(rng.gen()) {
                Action::A => counts[0] += 1,
                Action::B => counts[1] += 1,
                Action::C => counts[2] += 1,
            }
        }
        for (count, expected) in counts.iter().zip([5000.0, 3000.0, 2000.0]) {
            assert!((*count as f64 - expected).abs() <= 200.0);
        }
    }
}
