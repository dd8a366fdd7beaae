//! Preference-flow ranking.
//!
//! Pairwise preferences are folded into a flow matrix, normalized to a
//! row-stochastic form, damped, and run through power iteration to a
//! stationary distribution. The weights are non-negative, sum to one, and
//! reward items that receive net preference flow.
//!
//! The engine is generic over the item key so the same machinery ranks
//! shared entities (by id) and participants (karma nominations).

#![deny(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// One directed preference between two ranked items. `value` in [0, 1] is
/// the share of flow toward `alpha`; above 0.5 favors alpha over beta.
#[derive(Clone, Debug, PartialEq)]
pub struct PairwisePreference<K> {
    pub alpha: K,
    pub beta: K,
    pub value: f64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RankingConfig {
    /// Damping factor in (0, 1]; 1 means no damping.
    pub damping: f64,
    /// Convergence threshold on the Euclidean norm of the iterate delta.
    pub epsilon: f64,
    /// Iteration budget. Hitting it is not an error: the best iterate is
    /// returned and the run is flagged unconverged.
    pub max_iterations: usize,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            damping: 0.99,
            epsilon: 0.001,
            max_iterations: 1000,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RankingError {
    #[error("cannot rank fewer than two items (got {0})")]
    InsufficientItems(usize),
    #[error("cannot rank without participants")]
    NoParticipants,
}

/// Result of a ranking run. Weights sum to one within epsilon.
#[derive(Clone, Debug)]
pub struct Ranking<K: Ord> {
    pub weights: BTreeMap<K, f64>,
    pub iterations: usize,
    pub converged: bool,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RankingEngine {
    config: RankingConfig,
}

impl RankingEngine {
    pub fn new(config: RankingConfig) -> Self {
        Self { config }
    }

    /// Ranks `items` under the given preferences.
    ///
    /// Items map to matrix indices by ascending key. Preferences whose
    /// endpoints are not both in `items` are skipped; they typically refer
    /// to deactivated entities and carry no weight in the current round.
    pub fn rank<K>(
        &self,
        items: &[K],
        preferences: &[PairwisePreference<K>],
        participants: usize,
    ) -> Result<Ranking<K>, RankingError>
    where
        K: Clone + Ord + Debug,
    {
        if items.len() < 2 {
            return Err(RankingError::InsufficientItems(items.len()));
        }
        if participants == 0 {
            return Err(RankingError::NoParticipants);
        }

        let mut keys: Vec<K> = items.to_vec();
        keys.sort();
        keys.dedup();
        let index: BTreeMap<K, usize> = keys.iter().cloned().zip(0..).collect();

        let mut matrix = build_matrix(&index, preferences, participants);
        normalize_and_damp(&mut matrix, self.config.damping);
        let (weights, iterations, converged) =
            power_iterate(&matrix, self.config.epsilon, self.config.max_iterations);

        if converged {
            debug!(items = keys.len(), iterations, "ranking converged");
        } else {
            warn!(
                items = keys.len(),
                iterations, "ranking hit iteration cap, returning best iterate"
            );
        }

        Ok(Ranking {
            weights: keys.into_iter().zip(weights).collect(),
            iterations,
            converged,
        })
    }
}

/// Builds the raw flow matrix: a uniform neutral flow on every
/// off-diagonal pair, stated preferences layered on top with one
/// participant's neutral share removed, and diagonals set to the column
/// sums so self-weight tracks inbound flow.
fn build_matrix<K>(
    index: &BTreeMap<K, usize>,
    preferences: &[PairwisePreference<K>],
    participants: usize,
) -> Vec<Vec<f64>>
where
    K: Ord + Debug,
{
    let n = index.len();
    // Halved because each pair contributes in both directions.
    let implicit = (1.0 / participants as f64) / 2.0;

    let mut matrix = vec![vec![implicit * participants as f64; n]; n];
    for (i, row) in matrix.iter_mut().enumerate() {
        row[i] = 0.0;
    }

    for pref in preferences {
        let (Some(&a), Some(&b)) = (index.get(&pref.alpha), index.get(&pref.beta)) else {
            debug!(?pref, "skipping preference over unranked item");
            continue;
        };
        if a == b {
            continue;
        }
        matrix[b][a] += pref.value - implicit;
        matrix[a][b] += (1.0 - pref.value) - implicit;
    }

    for i in 0..n {
        matrix[i][i] = (0..n).map(|r| matrix[r][i]).sum();
    }
    matrix
}

/// Row-normalizes to a stochastic matrix and applies damping in place:
/// `M' = d * M + (1 - d) / n`.
fn normalize_and_damp(matrix: &mut [Vec<f64>], damping: f64) {
    let n = matrix.len();
    for row in matrix.iter_mut() {
        let sum: f64 = row.iter().sum();
        for x in row.iter_mut() {
            *x = *x / sum * damping + (1.0 - damping) / n as f64;
        }
    }
}

/// Left power iteration from the uniform vector. Returns the final
/// iterate, the iteration count, and whether the delta dropped below
/// epsilon before the budget ran out.
fn power_iterate(matrix: &[Vec<f64>], epsilon: f64, max_iterations: usize) -> (Vec<f64>, usize, bool) {
    let n = matrix.len();
    let mut current = vec![1.0 / n as f64; n];

    for iteration in 0..max_iterations {
        let mut next = vec![0.0; n];
        for (i, row) in matrix.iter().enumerate() {
            for (j, m) in row.iter().enumerate() {
                next[j] += current[i] * m;
            }
        }
        let delta: f64 = next
            .iter()
            .zip(&current)
            .map(|(a, b)| (a - b) * (a - b))
            .sum::<f64>()
            .sqrt();
        current = next;
        if delta < epsilon {
            return (current, iteration + 1, true);
        }
    }

    (current, max_iterations, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn engine() -> RankingEngine {
        RankingEngine::new(RankingConfig {
            damping: 1.0,
            epsilon: 1e-6,
            max_iterations: 1000,
        })
    }

    fn pref(alpha: i64, beta: i64, value: f64) -> PairwisePreference<i64> {
        PairwisePreference { alpha, beta, value }
    }

    #[test]
    fn fewer_than_two_items_is_an_error() {
        let err = engine().rank::<i64>(&[1], &[], 3).unwrap_err();
        assert_eq!(err, RankingError::InsufficientItems(1));
    }

    #[test]
    fn zero_participants_is_an_error() {
        let err = engine().rank(&[1, 2], &[], 0).unwrap_err();
        assert_eq!(err, RankingError::NoParticipants);
    }

    #[test]
    fn no_stated_preferences_is_uniform() {
        let ranking = engine().rank(&[1, 2, 3], &[], 4).unwrap();
        for weight in ranking.weights.values() {
            assert!((weight - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn preferred_item_ranks_first() {
        // 1 over 2, 2 over 3: expect strict ordering 1 > 2 > 3.
        let prefs = vec![pref(1, 2, 1.0), pref(2, 3, 1.0)];
        let ranking = engine().rank(&[1, 2, 3], &prefs, 2).unwrap();
        let w = &ranking.weights;
        assert!(w[&1] > w[&2]);
        assert!(w[&2] > w[&3]);
    }

    #[test]
    fn symmetric_cycle_stays_uniform() {
        let prefs = vec![pref(1, 2, 1.0), pref(2, 3, 1.0), pref(3, 1, 1.0)];
        let ranking = engine().rank(&[1, 2, 3], &prefs, 3).unwrap();
        for weight in ranking.weights.values() {
            assert!((weight - 1.0 / 3.0).abs() < 1e-3);
        }
    }

    #[test]
    fn mild_preference_moves_weights_mildly() {
        let strong = engine().rank(&[1, 2], &[pref(1, 2, 1.0)], 2).unwrap();
        let mild = engine().rank(&[1, 2], &[pref(1, 2, 0.7)], 2).unwrap();
        assert!(strong.weights[&1] > mild.weights[&1]);
        assert!(mild.weights[&1] > mild.weights[&2]);
    }

    #[test]
    fn preferences_over_unranked_items_are_skipped() {
        let prefs = vec![pref(1, 99, 1.0)];
        let ranking = engine().rank(&[1, 2], &prefs, 2).unwrap();
        assert!((ranking.weights[&1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn iteration_cap_still_returns_weights() {
        let capped = RankingEngine::new(RankingConfig {
            damping: 1.0,
            epsilon: 1e-12,
            max_iterations: 1,
        });
        let ranking = capped.rank(&[1, 2], &[pref(1, 2, 1.0)], 2).unwrap();
        assert!(!ranking.converged);
        assert_eq!(ranking.iterations, 1);
        let total: f64 = ranking.weights.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    proptest! {
        #[test]
        fn weights_are_a_distribution(
            values in proptest::collection::vec(0.0f64..=1.0, 0..12),
            participants in 1usize..8,
        ) {
            let items: Vec<i64> = (0..5).collect();
            let prefs: Vec<_> = values
                .iter()
                .enumerate()
                .map(|(i, &v)| pref((i as i64) % 5, ((i as i64) + 1) % 5, v))
                .collect();
            let ranking = engine().rank(&items, &prefs, participants).unwrap();
            let total: f64 = ranking.weights.values().sum();
            prop_assert!((total - 1.0).abs() < 1e-6);
            for weight in ranking.weights.values() {
                prop_assert!(*weight >= -1e-12);
            }
        }
    }
}
