//! Commons core types.
//!
//! Shared identifiers, domain records, preference normalization, and the
//! calendar-period arithmetic used by the accrual and ledger engines.
//! Everything here is plain data: engines live in their own crates and
//! persistence lives behind the `commons-storage` contract.

#![deny(unsafe_code)]

pub mod ids;
pub mod period;
pub mod preference;
pub mod records;

pub use ids::{ClaimId, EntityId, ParticipantId, PollId, ScopeId};
pub use preference::{Preference, PreferenceError, PreferenceInput};
pub use records::{
    AccountEvent, BreakInterval, Claim, ClaimKind, Entity, KarmaNomination, LedgerCategory,
    LedgerEvent, Participant, Poll, ValueEvent, Vote, VoteChoice, VoteTally,
};
