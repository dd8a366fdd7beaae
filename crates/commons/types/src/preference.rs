//! Preference inputs and their canonical stored form.
//!
//! A stored preference is always ordered `alpha < beta`, with `value`
//! expressing flow from beta to alpha (above 0.5 favors alpha). Callers
//! may submit either form; `normalize` maps both onto the canonical one.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{EntityId, ParticipantId, ScopeId};

/// Canonical pairwise preference. One row per
/// `(scope, participant, alpha, beta)`; resubmission overwrites.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Preference {
    pub scope: ScopeId,
    pub participant: ParticipantId,
    pub alpha: EntityId,
    pub beta: EntityId,
    pub value: f64,
}

impl Preference {
    /// Deduplication key. Later writes with the same key replace earlier ones.
    pub fn key(&self) -> (ScopeId, ParticipantId, EntityId, EntityId) {
        (
            self.scope.clone(),
            self.participant.clone(),
            self.alpha,
            self.beta,
        )
    }
}

/// Caller-facing preference submission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "form", rename_all = "snake_case")]
pub enum PreferenceInput {
    /// "I prefer `target` over `source` with strength `value`."
    Directional {
        source: EntityId,
        target: EntityId,
        value: f64,
    },
    /// Already canonically ordered; rejected if it is not.
    Canonical {
        alpha: EntityId,
        beta: EntityId,
        value: f64,
    },
}

#[derive(Debug, Error, PartialEq)]
pub enum PreferenceError {
    #[error("preference value {0} outside [0, 1]")]
    ValueOutOfRange(f64),
    #[error("canonical pair out of order: alpha {alpha} must precede beta {beta}")]
    OutOfOrder { alpha: EntityId, beta: EntityId },
}

impl PreferenceInput {
    /// Maps the input onto the canonical stored form.
    ///
    /// Directional inputs targeting their own source carry no information
    /// and normalize to `None`. A canonical input that is not ordered
    /// `alpha < beta` is a caller error rather than something to silently
    /// reorder, since the value's meaning would flip.
    pub fn normalize(
        self,
        scope: ScopeId,
        participant: ParticipantId,
    ) -> Result<Option<Preference>, PreferenceError> {
        let (alpha, beta, value) = match self {
            PreferenceInput::Directional {
                source,
                target,
                value,
            } => {
                if !(0.0..=1.0).contains(&value) {
                    return Err(PreferenceError::ValueOutOfRange(value));
                }
                if source == target {
                    return Ok(None);
                }
                if target < source {
                    (target, source, value)
                } else {
                    (source, target, 1.0 - value)
                }
            }
            PreferenceInput::Canonical { alpha, beta, value } => {
                if !(0.0..=1.0).contains(&value) {
                    return Err(PreferenceError::ValueOutOfRange(value));
                }
                if alpha >= beta {
                    return Err(PreferenceError::OutOfOrder { alpha, beta });
                }
                (alpha, beta, value)
            }
        };
        Ok(Some(Preference {
            scope,
            participant,
            alpha,
            beta,
            value,
        }))
    }
}

/// Merges `incoming` into `current`, replacing rows with the same canonical
/// key. Order within the result is stable over `current` with replaced rows
/// updated in place and new rows appended.
pub fn merge_preferences(current: &[Preference], incoming: Vec<Preference>) -> Vec<Preference> {
    let mut merged: Vec<Preference> = current.to_vec();
    for pref in incoming {
        match merged.iter_mut().find(|p| p.key() == pref.key()) {
            Some(existing) => *existing = pref,
            None => merged.push(pref),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> ScopeId {
        ScopeId::new("house-1")
    }

    fn alice() -> ParticipantId {
        ParticipantId::new("alice")
    }

    #[test]
    fn directional_toward_higher_id_flips_value() {
        let pref = PreferenceInput::Directional {
            source: EntityId(1),
            target: EntityId(2),
            value: 0.8,
        }
        .normalize(scope(), alice())
        .unwrap()
        .unwrap();
        assert_eq!(pref.alpha, EntityId(1));
        assert_eq!(pref.beta, EntityId(2));
        assert!((pref.value - 0.2).abs() < 1e-12);
    }

    #[test]
    fn directional_toward_lower_id_keeps_value() {
        let pref = PreferenceInput::Directional {
            source: EntityId(5),
            target: EntityId(2),
            value: 0.8,
        }
        .normalize(scope(), alice())
        .unwrap()
        .unwrap();
        assert_eq!(pref.alpha, EntityId(2));
        assert_eq!(pref.beta, EntityId(5));
        assert!((pref.value - 0.8).abs() < 1e-12);
    }

    #[test]
    fn self_referential_input_is_dropped() {
        let out = PreferenceInput::Directional {
            source: EntityId(3),
            target: EntityId(3),
            value: 0.9,
        }
        .normalize(scope(), alice())
        .unwrap();
        assert!(out.is_none());
    }

    #[test]
    fn out_of_order_canonical_is_rejected() {
        let err = PreferenceInput::Canonical {
            alpha: EntityId(4),
            beta: EntityId(2),
            value: 0.5,
        }
        .normalize(scope(), alice())
        .unwrap_err();
        assert_eq!(
            err,
            PreferenceError::OutOfOrder {
                alpha: EntityId(4),
                beta: EntityId(2)
            }
        );
    }

    #[test]
    fn value_outside_unit_interval_is_rejected() {
        let err = PreferenceInput::Directional {
            source: EntityId(1),
            target: EntityId(2),
            value: 1.5,
        }
        .normalize(scope(), alice())
        .unwrap_err();
        assert_eq!(err, PreferenceError::ValueOutOfRange(1.5));
    }

    #[test]
    fn merge_replaces_by_canonical_key() {
        let first = PreferenceInput::Directional {
            source: EntityId(2),
            target: EntityId(1),
            value: 0.7,
        }
        .normalize(scope(), alice())
        .unwrap()
        .unwrap();
        let second = PreferenceInput::Directional {
            source: EntityId(1),
            target: EntityId(2),
            value: 0.9,
        }
        .normalize(scope(), alice())
        .unwrap()
        .unwrap();

        let merged = merge_preferences(&[first], vec![second.clone()]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0], second);
    }
}
