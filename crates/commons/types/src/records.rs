//! Domain records shared across the engines.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ClaimId, EntityId, ParticipantId, PollId, ScopeId};

/// A rankable shared entity (chore, duty, rotation slot). Identity is the
/// `(scope, name)` pair; inactive entities are excluded from rankings and
/// emissions but their history is retained.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub scope: ScopeId,
    pub name: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

/// Roster membership as seen through the roster provider.
///
/// A participant is active once `activated_at` has passed, and voting when
/// additionally not exempt. Exempt participants keep earning and claiming
/// but do not count toward quorum bases.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub scope: ScopeId,
    pub id: ParticipantId,
    pub activated_at: Option<DateTime<Utc>>,
    pub exempt_at: Option<DateTime<Utc>>,
}

impl Participant {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.activated_at, Some(t) if t <= now)
    }

    pub fn is_exempt(&self, now: DateTime<Utc>) -> bool {
        matches!(self.exempt_at, Some(t) if t <= now)
    }

    pub fn is_voting(&self, now: DateTime<Utc>) -> bool {
        self.is_active(now) && !self.is_exempt(now)
    }
}

/// Declared absence window. Overlapping breaks exclude the participant
/// from emission eligibility and shrink their penalty quota.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BreakInterval {
    pub participant: ParticipantId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A time-boxed vote window. Immutable once created.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Poll {
    pub id: PollId,
    pub scope: ScopeId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteChoice {
    Yay,
    Nay,
}

/// One ballot. `voter_hash` is the salted participant digest, so the
/// stored record carries no raw identity.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Vote {
    pub poll: PollId,
    pub voter_hash: String,
    pub choice: VoteChoice,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub yays: usize,
    pub nays: usize,
}

impl VoteTally {
    /// Majority with a severity-scaled floor on affirmative votes.
    pub fn passes(&self, min_yays: usize) -> bool {
        self.yays > self.nays && self.yays >= min_yays
    }
}

/// One slice of periodic value emission attributed to an entity.
/// Append-only; `ranking` and `participants` tag the snapshot used.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValueEvent {
    pub scope: ScopeId,
    pub entity: EntityId,
    pub valued_at: DateTime<Utc>,
    pub amount: f64,
    pub ranking: f64,
    pub participants: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimKind {
    Completion,
    Dispute,
    Purchase,
}

/// A poll-backed assertion awaiting community validation.
///
/// `entity` is set for completions, `target` for disputes; purchases use
/// `quantity`. `valid` stays `None` until the claim is resolved, after
/// which the record is immutable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,
    pub scope: ScopeId,
    pub kind: ClaimKind,
    pub initiator: ParticipantId,
    pub entity: Option<EntityId>,
    pub target: Option<ParticipantId>,
    pub value: f64,
    pub quantity: Option<u32>,
    pub poll: PollId,
    pub opened_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub valid: Option<bool>,
    pub fulfilled_at: Option<DateTime<Utc>>,
    pub fulfilled_by: Option<ParticipantId>,
}

impl Claim {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerCategory {
    Baseline,
    Regeneration,
    Penalty,
    Dispute,
    Karma,
    Adjustment,
}

/// Signed reputation ledger entry. Balances are derived by summation,
/// never stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub scope: ScopeId,
    pub participant: ParticipantId,
    pub occurred_at: DateTime<Utc>,
    pub amount: f64,
    pub category: LedgerCategory,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

/// Directed peer-recognition edge for the karma ranking.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KarmaNomination {
    pub scope: ScopeId,
    pub giver: ParticipantId,
    pub receiver: ParticipantId,
    pub given_at: DateTime<Utc>,
}

/// Credit to the scope's shared purchase account. Purchases draw against
/// the running balance; only events, never balances, are stored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccountEvent {
    pub scope: ScopeId,
    pub amount: f64,
    pub occurred_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn participant_activation_gates_activity() {
        let p = Participant {
            scope: ScopeId::new("s"),
            id: ParticipantId::new("a"),
            activated_at: Some(at(10)),
            exempt_at: None,
        };
        assert!(!p.is_active(at(5)));
        assert!(p.is_active(at(10)));
        assert!(p.is_voting(at(15)));
    }

    #[test]
    fn exemption_removes_voting_but_not_activity() {
        let p = Participant {
            scope: ScopeId::new("s"),
            id: ParticipantId::new("a"),
            activated_at: Some(at(1)),
            exempt_at: Some(at(10)),
        };
        assert!(p.is_voting(at(5)));
        assert!(p.is_active(at(15)));
        assert!(!p.is_voting(at(15)));
    }

    #[test]
    fn tally_requires_majority_and_floor() {
        let t = VoteTally { yays: 2, nays: 1 };
        assert!(t.passes(2));
        assert!(!t.passes(3));
        let tied = VoteTally { yays: 2, nays: 2 };
        assert!(!tied.passes(1));
    }
}
