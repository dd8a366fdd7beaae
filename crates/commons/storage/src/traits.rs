//! Async persistence contract.
//!
//! Engines depend on these traits only; the in-memory implementation in
//! this crate is the reference for semantics (conditional writes surface
//! [`StorageError::Conflict`], queries never mutate). Roster and catalog
//! are read-only provider traits because membership and the entity
//! catalog are owned by the embedding platform, not by this core.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use commons_types::{
    AccountEvent, BreakInterval, Claim, ClaimId, Entity, EntityId, KarmaNomination, LedgerEvent,
    Participant, ParticipantId, Poll, PollId, Preference, ScopeId, ValueEvent, Vote,
};

use crate::error::StorageResult;

#[async_trait]
pub trait PreferenceStore: Send + Sync {
    /// Inserts or replaces rows keyed by `(scope, participant, alpha, beta)`.
    async fn upsert_preferences(&self, preferences: Vec<Preference>) -> StorageResult<()>;

    async fn list_preferences(&self, scope: &ScopeId) -> StorageResult<Vec<Preference>>;
}

#[async_trait]
pub trait PollStore: Send + Sync {
    async fn insert_poll(&self, poll: Poll) -> StorageResult<()>;

    async fn get_poll(&self, id: PollId) -> StorageResult<Poll>;

    /// Inserts or replaces the ballot keyed by `(poll, voter_hash)`.
    async fn upsert_vote(&self, vote: Vote) -> StorageResult<()>;

    async fn list_votes(&self, poll: PollId) -> StorageResult<Vec<Vote>>;
}

#[async_trait]
pub trait ValueStore: Send + Sync {
    async fn append_value_event(&self, event: ValueEvent) -> StorageResult<()>;

    /// Events for one entity with `valued_at` in the half-open `(from, to]`.
    async fn list_value_events(
        &self,
        scope: &ScopeId,
        entity: EntityId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<ValueEvent>>;

    /// Timestamp of the most recent emission in the scope, across entities.
    async fn last_valued_at(&self, scope: &ScopeId) -> StorageResult<Option<DateTime<Utc>>>;
}

#[async_trait]
pub trait ClaimStore: Send + Sync {
    async fn insert_claim(&self, claim: Claim) -> StorageResult<()>;

    async fn get_claim(&self, id: ClaimId) -> StorageResult<Claim>;

    /// Marks a claim resolved. Fails `Conflict` when the claim is already
    /// resolved, so exactly one concurrent resolver wins.
    async fn resolve_claim(
        &self,
        id: ClaimId,
        resolved_at: DateTime<Utc>,
        valid: bool,
        value: f64,
    ) -> StorageResult<Claim>;

    /// Records who physically completed an approved purchase. Fails
    /// `Conflict` when the claim is already fulfilled.
    async fn fulfill_claim(
        &self,
        id: ClaimId,
        by: ParticipantId,
        at: DateTime<Utc>,
    ) -> StorageResult<Claim>;

    async fn list_open_claims(&self, scope: &ScopeId) -> StorageResult<Vec<Claim>>;

    /// All claims touching one entity, any state, oldest first.
    async fn list_claims_for_entity(
        &self,
        scope: &ScopeId,
        entity: EntityId,
    ) -> StorageResult<Vec<Claim>>;

    /// Claims resolved within `(from, to]`, any kind.
    async fn list_resolved_claims(
        &self,
        scope: &ScopeId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Claim>>;

    /// Every claim in the scope, oldest first. Purchase accounting sums
    /// over these.
    async fn list_claims(&self, scope: &ScopeId) -> StorageResult<Vec<Claim>>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append_ledger_event(&self, event: LedgerEvent) -> StorageResult<()>;

    /// Appends unless the participant already has an event of the same
    /// category at or after `window_start`; fails `Conflict` otherwise.
    /// Backs the once-per-period ledger routines.
    async fn append_ledger_event_unique(
        &self,
        event: LedgerEvent,
        window_start: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Events with `occurred_at <= to`, optionally for one participant.
    async fn list_ledger_events(
        &self,
        scope: &ScopeId,
        participant: Option<&ParticipantId>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<LedgerEvent>>;
}

#[async_trait]
pub trait KarmaStore: Send + Sync {
    async fn append_nomination(&self, nomination: KarmaNomination) -> StorageResult<()>;

    /// Nominations with `given_at` in the half-open `(from, to]`.
    async fn list_nominations(
        &self,
        scope: &ScopeId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<KarmaNomination>>;
}

#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn append_account_event(&self, event: AccountEvent) -> StorageResult<()>;

    async fn list_account_events(
        &self,
        scope: &ScopeId,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<AccountEvent>>;
}

#[async_trait]
pub trait RosterProvider: Send + Sync {
    async fn list_participants(&self, scope: &ScopeId) -> StorageResult<Vec<Participant>>;

    async fn list_breaks(&self, scope: &ScopeId) -> StorageResult<Vec<BreakInterval>>;
}

#[async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn list_entities(&self, scope: &ScopeId) -> StorageResult<Vec<Entity>>;

    async fn get_entity(&self, scope: &ScopeId, id: EntityId) -> StorageResult<Entity>;
}

/// Everything the engines need, behind one handle.
pub trait CommonsStorage:
    PreferenceStore
    + PollStore
    + ValueStore
    + ClaimStore
    + LedgerStore
    + KarmaStore
    + AccountStore
    + RosterProvider
    + CatalogProvider
{
}

impl<T> CommonsStorage for T where
    T: PreferenceStore
        + PollStore
        + ValueStore
        + ClaimStore
        + LedgerStore
        + KarmaStore
        + AccountStore
        + RosterProvider
        + CatalogProvider
{
}
