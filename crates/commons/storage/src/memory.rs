//! In-memory reference implementation.
//!
//! Single `RwLock` over plain collections. Intended for tests and as the
//! semantic reference for real backends; no attempt at per-table locking.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use commons_types::{
    AccountEvent, BreakInterval, Claim, ClaimId, Entity, EntityId, KarmaNomination, LedgerEvent,
    Participant, ParticipantId, Poll, PollId, Preference, ScopeId, ValueEvent, Vote,
};
use tokio::sync::RwLock;

use crate::error::{StorageError, StorageResult};
use crate::traits::{
    AccountStore, CatalogProvider, ClaimStore, KarmaStore, LedgerStore, PollStore,
    PreferenceStore, RosterProvider, ValueStore,
};

#[derive(Default)]
struct State {
    preferences: Vec<Preference>,
    polls: HashMap<PollId, Poll>,
    votes: Vec<Vote>,
    value_events: Vec<ValueEvent>,
    claims: HashMap<ClaimId, Claim>,
    ledger: Vec<LedgerEvent>,
    nominations: Vec<KarmaNomination>,
    account_events: Vec<AccountEvent>,
    participants: Vec<Participant>,
    breaks: Vec<BreakInterval>,
    entities: Vec<Entity>,
    next_entity_id: i64,
}

#[derive(Default)]
pub struct InMemoryStorage {
    state: RwLock<State>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    // Roster and catalog mutators. Real deployments source these from the
    // platform; the reference implementation exposes them for setup.

    pub async fn add_participant(&self, participant: Participant) {
        let mut state = self.state.write().await;
        state
            .participants
            .retain(|p| !(p.scope == participant.scope && p.id == participant.id));
        state.participants.push(participant);
    }

    pub async fn add_break(&self, interval: BreakInterval) {
        self.state.write().await.breaks.push(interval);
    }

    pub async fn create_entity(
        &self,
        scope: ScopeId,
        name: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Entity {
        let mut state = self.state.write().await;
        state.next_entity_id += 1;
        let entity = Entity {
            id: EntityId(state.next_entity_id),
            scope,
            name: name.into(),
            active: true,
            created_at,
        };
        state.entities.push(entity.clone());
        entity
    }

    pub async fn set_entity_active(&self, scope: &ScopeId, id: EntityId, active: bool) {
        let mut state = self.state.write().await;
        if let Some(entity) = state
            .entities
            .iter_mut()
            .find(|e| e.scope == *scope && e.id == id)
        {
            entity.active = active;
        }
    }
}

#[async_trait]
impl PreferenceStore for InMemoryStorage {
    async fn upsert_preferences(&self, preferences: Vec<Preference>) -> StorageResult<()> {
        let mut state = self.state.write().await;
        for pref in preferences {
            match state.preferences.iter_mut().find(|p| p.key() == pref.key()) {
                Some(existing) => *existing = pref,
                None => state.preferences.push(pref),
            }
        }
        Ok(())
    }

    async fn list_preferences(&self, scope: &ScopeId) -> StorageResult<Vec<Preference>> {
        let state = self.state.read().await;
        Ok(state
            .preferences
            .iter()
            .filter(|p| p.scope == *scope)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl PollStore for InMemoryStorage {
    async fn insert_poll(&self, poll: Poll) -> StorageResult<()> {
        let mut state = self.state.write().await;
        if state.polls.contains_key(&poll.id) {
            return Err(StorageError::Conflict(format!("poll {} exists", poll.id)));
        }
        state.polls.insert(poll.id, poll);
        Ok(())
    }

    async fn get_poll(&self, id: PollId) -> StorageResult<Poll> {
        let state = self.state.read().await;
        state
            .polls
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("poll {id}")))
    }

    async fn upsert_vote(&self, vote: Vote) -> StorageResult<()> {
        let mut state = self.state.write().await;
        match state
            .votes
            .iter_mut()
            .find(|v| v.poll == vote.poll && v.voter_hash == vote.voter_hash)
        {
            Some(existing) => *existing = vote,
            None => state.votes.push(vote),
        }
        Ok(())
    }

    async fn list_votes(&self, poll: PollId) -> StorageResult<Vec<Vote>> {
        let state = self.state.read().await;
        Ok(state.votes.iter().filter(|v| v.poll == poll).cloned().collect())
    }
}

#[async_trait]
impl ValueStore for InMemoryStorage {
    async fn append_value_event(&self, event: ValueEvent) -> StorageResult<()> {
        self.state.write().await.value_events.push(event);
        Ok(())
    }

    async fn list_value_events(
        &self,
        scope: &ScopeId,
        entity: EntityId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<ValueEvent>> {
        let state = self.state.read().await;
        Ok(state
            .value_events
            .iter()
            .filter(|e| {
                e.scope == *scope && e.entity == entity && e.valued_at > from && e.valued_at <= to
            })
            .cloned()
            .collect())
    }

    async fn last_valued_at(&self, scope: &ScopeId) -> StorageResult<Option<DateTime<Utc>>> {
        let state = self.state.read().await;
        Ok(state
            .value_events
            .iter()
            .filter(|e| e.scope == *scope)
            .map(|e| e.valued_at)
            .max())
    }
}

#[async_trait]
impl ClaimStore for InMemoryStorage {
    async fn insert_claim(&self, claim: Claim) -> StorageResult<()> {
        let mut state = self.state.write().await;
        if state.claims.contains_key(&claim.id) {
            return Err(StorageError::Conflict(format!("claim {} exists", claim.id)));
        }
        state.claims.insert(claim.id, claim);
        Ok(())
    }

    async fn get_claim(&self, id: ClaimId) -> StorageResult<Claim> {
        let state = self.state.read().await;
        state
            .claims
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("claim {id}")))
    }

    async fn resolve_claim(
        &self,
        id: ClaimId,
        resolved_at: DateTime<Utc>,
        valid: bool,
        value: f64,
    ) -> StorageResult<Claim> {
        let mut state = self.state.write().await;
        let claim = state
            .claims
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("claim {id}")))?;
        if claim.resolved_at.is_some() {
            return Err(StorageError::Conflict(format!("claim {id} already resolved")));
        }
        claim.resolved_at = Some(resolved_at);
        claim.valid = Some(valid);
        claim.value = value;
        Ok(claim.clone())
    }

    async fn fulfill_claim(
        &self,
        id: ClaimId,
        by: ParticipantId,
        at: DateTime<Utc>,
    ) -> StorageResult<Claim> {
        let mut state = self.state.write().await;
        let claim = state
            .claims
            .get_mut(&id)
            .ok_or_else(|| StorageError::NotFound(format!("claim {id}")))?;
        if claim.fulfilled_at.is_some() {
            return Err(StorageError::Conflict(format!("claim {id} already fulfilled")));
        }
        claim.fulfilled_at = Some(at);
        claim.fulfilled_by = Some(by);
        Ok(claim.clone())
    }

    async fn list_open_claims(&self, scope: &ScopeId) -> StorageResult<Vec<Claim>> {
        let state = self.state.read().await;
        let mut claims: Vec<Claim> = state
            .claims
            .values()
            .filter(|c| c.scope == *scope && c.resolved_at.is_none())
            .cloned()
            .collect();
        claims.sort_by_key(|c| c.opened_at);
        Ok(claims)
    }

    async fn list_claims_for_entity(
        &self,
        scope: &ScopeId,
        entity: EntityId,
    ) -> StorageResult<Vec<Claim>> {
        let state = self.state.read().await;
        let mut claims: Vec<Claim> = state
            .claims
            .values()
            .filter(|c| c.scope == *scope && c.entity == Some(entity))
            .cloned()
            .collect();
        claims.sort_by_key(|c| c.opened_at);
        Ok(claims)
    }

    async fn list_resolved_claims(
        &self,
        scope: &ScopeId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<Claim>> {
        let state = self.state.read().await;
        let mut claims: Vec<Claim> = state
            .claims
            .values()
            .filter(|c| {
                c.scope == *scope
                    && matches!(c.resolved_at, Some(t) if t > from && t <= to)
            })
            .cloned()
            .collect();
        claims.sort_by_key(|c| c.resolved_at);
        Ok(claims)
    }

    async fn list_claims(&self, scope: &ScopeId) -> StorageResult<Vec<Claim>> {
        let state = self.state.read().await;
        let mut claims: Vec<Claim> = state
            .claims
            .values()
            .filter(|c| c.scope == *scope)
            .cloned()
            .collect();
        claims.sort_by_key(|c| c.opened_at);
        Ok(claims)
    }
}

#[async_trait]
impl LedgerStore for InMemoryStorage {
    async fn append_ledger_event(&self, event: LedgerEvent) -> StorageResult<()> {
        self.state.write().await.ledger.push(event);
        Ok(())
    }

    async fn append_ledger_event_unique(
        &self,
        event: LedgerEvent,
        window_start: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let duplicate = state.ledger.iter().any(|e| {
            e.scope == event.scope
                && e.participant == event.participant
                && e.category == event.category
                && e.occurred_at >= window_start
        });
        if duplicate {
            return Err(StorageError::Conflict(format!(
                "{:?} event for {} already recorded this period",
                event.category, event.participant
            )));
        }
        state.ledger.push(event);
        Ok(())
    }

    async fn list_ledger_events(
        &self,
        scope: &ScopeId,
        participant: Option<&ParticipantId>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<LedgerEvent>> {
        let state = self.state.read().await;
        Ok(state
            .ledger
            .iter()
            .filter(|e| {
                e.scope == *scope
                    && e.occurred_at <= to
                    && participant.map_or(true, |p| e.participant == *p)
            })
            .cloned()
            .collect())
    }
}

#[async_trait]
impl KarmaStore for InMemoryStorage {
    async fn append_nomination(&self, nomination: KarmaNomination) -> StorageResult<()> {
        self.state.write().await.nominations.push(nomination);
        Ok(())
    }

    async fn list_nominations(
        &self,
        scope: &ScopeId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<KarmaNomination>> {
        let state = self.state.read().await;
        Ok(state
            .nominations
            .iter()
            .filter(|n| n.scope == *scope && n.given_at > from && n.given_at <= to)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AccountStore for InMemoryStorage {
    async fn append_account_event(&self, event: AccountEvent) -> StorageResult<()> {
        self.state.write().await.account_events.push(event);
        Ok(())
    }

    async fn list_account_events(
        &self,
        scope: &ScopeId,
        to: DateTime<Utc>,
    ) -> StorageResult<Vec<AccountEvent>> {
        let state = self.state.read().await;
        Ok(state
            .account_events
            .iter()
            .filter(|e| e.scope == *scope && e.occurred_at <= to)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RosterProvider for InMemoryStorage {
    async fn list_participants(&self, scope: &ScopeId) -> StorageResult<Vec<Participant>> {
        let state = self.state.read().await;
        Ok(state
            .participants
            .iter()
            .filter(|p| p.scope == *scope)
            .cloned()
            .collect())
    }

    async fn list_breaks(&self, scope: &ScopeId) -> StorageResult<Vec<BreakInterval>> {
        let state = self.state.read().await;
        let participants: Vec<&ParticipantId> = state
            .participants
            .iter()
            .filter(|p| p.scope == *scope)
            .map(|p| &p.id)
            .collect();
        Ok(state
            .breaks
            .iter()
            .filter(|b| participants.contains(&&b.participant))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl CatalogProvider for InMemoryStorage {
    async fn list_entities(&self, scope: &ScopeId) -> StorageResult<Vec<Entity>> {
        let state = self.state.read().await;
        Ok(state
            .entities
            .iter()
            .filter(|e| e.scope == *scope)
            .cloned()
            .collect())
    }

    async fn get_entity(&self, scope: &ScopeId, id: EntityId) -> StorageResult<Entity> {
        let state = self.state.read().await;
        state
            .entities
            .iter()
            .find(|e| e.scope == *scope && e.id == id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("entity {id} in scope {scope}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use commons_types::LedgerCategory;

    fn scope() -> ScopeId {
        ScopeId::new("house")
    }

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn preferences_upsert_by_canonical_key() {
        let store = InMemoryStorage::new();
        let mut pref = Preference {
            scope: scope(),
            participant: ParticipantId::new("alice"),
            alpha: EntityId(1),
            beta: EntityId(2),
            value: 0.6,
        };
        store.upsert_preferences(vec![pref.clone()]).await.unwrap();
        pref.value = 0.9;
        store.upsert_preferences(vec![pref.clone()]).await.unwrap();

        let stored = store.list_preferences(&scope()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!((stored[0].value - 0.9).abs() < 1e-12);
    }

    #[tokio::test]
    async fn second_resolution_conflicts() {
        let store = InMemoryStorage::new();
        let claim = Claim {
            id: ClaimId::generate(),
            scope: scope(),
            kind: commons_types::ClaimKind::Completion,
            initiator: ParticipantId::new("alice"),
            entity: Some(EntityId(1)),
            target: None,
            value: 10.0,
            quantity: None,
            poll: PollId::generate(),
            opened_at: at(1, 12),
            resolved_at: None,
            valid: None,
            fulfilled_at: None,
            fulfilled_by: None,
        };
        store.insert_claim(claim.clone()).await.unwrap();

        store
            .resolve_claim(claim.id, at(2, 12), true, 10.0)
            .await
            .unwrap();
        let err = store
            .resolve_claim(claim.id, at(2, 13), false, 0.0)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn unique_ledger_append_is_once_per_window() {
        let store = InMemoryStorage::new();
        let event = LedgerEvent {
            scope: scope(),
            participant: ParticipantId::new("alice"),
            occurred_at: at(5, 0),
            amount: 0.5,
            category: LedgerCategory::Regeneration,
            metadata: Default::default(),
        };
        store
            .append_ledger_event_unique(event.clone(), at(1, 0))
            .await
            .unwrap();
        let err = store
            .append_ledger_event_unique(event, at(1, 0))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict(_)));
    }

    #[tokio::test]
    async fn entity_ids_are_assigned_in_order() {
        let store = InMemoryStorage::new();
        let a = store.create_entity(scope(), "dishes", at(1, 0)).await;
        let b = store.create_entity(scope(), "sweeping", at(1, 0)).await;
        assert!(a.id < b.id);
        assert_eq!(store.list_entities(&scope()).await.unwrap().len(), 2);
    }
}
