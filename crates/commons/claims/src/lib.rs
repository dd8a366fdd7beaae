//! Claim, dispute, and purchase resolution.
//!
//! Every claim is backed by a poll. Opening runs the precondition rules
//! for the claim's kind; resolution tallies the poll against a quorum
//! that scales with severity, then settles the economic consequences.
//! Resolution is guarded by a conditional store update, so exactly one
//! concurrent resolver wins.

#![deny(unsafe_code)]

pub mod rules;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use commons_accrual::{AccrualEngine, AccrualError};
use commons_polls::{PollEngine, PollError};
use commons_storage::{CommonsStorage, StorageError};
use commons_types::{
    AccountEvent, Claim, ClaimId, ClaimKind, EntityId, LedgerCategory, LedgerEvent, ParticipantId,
    PollId, ScopeId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use rules::{
    ClaimRule, NoSelfTarget, NonZeroCompletionValue, RuleContext, SingleOpenDispute,
    SufficientAccountBalance,
};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClaimConfig {
    /// Affirmative-vote floor for completion claims.
    pub completion_min_votes: usize,
    /// Quorum ratio for disputes, against the voting participant count.
    pub dispute_quorum: f64,
    /// Raised quorum when the dispute would push the target below the
    /// critical balance.
    pub dispute_quorum_critical: f64,
    pub critical_balance: f64,
    /// One affirmative vote required per this much purchase value.
    pub purchase_vote_unit: f64,
    pub completion_poll_minutes: i64,
    pub dispute_poll_hours: i64,
    pub purchase_poll_hours: i64,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            completion_min_votes: 2,
            dispute_quorum: 0.4,
            dispute_quorum_critical: 0.7,
            critical_balance: 2.0,
            purchase_vote_unit: 50.0,
            completion_poll_minutes: 30,
            dispute_poll_hours: 72,
            purchase_poll_hours: 6,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error("cannot claim an entity with no accrued value")]
    ZeroValueClaim,
    #[error("cannot dispute oneself")]
    SelfTarget,
    #[error("an open dispute already exists for this pair")]
    DuplicateDispute,
    #[error("insufficient funds: needed {needed}, available {available}")]
    InsufficientFunds { needed: f64, available: f64 },
    #[error("invalid claim draft: {0}")]
    InvalidDraft(&'static str),
    #[error("poll {poll} open until {end}")]
    PollOpen { poll: PollId, end: DateTime<Utc> },
    #[error("claim {0} already resolved")]
    AlreadyResolved(ClaimId),
    #[error("claim {0} is not an approved, unfulfilled purchase")]
    NotFulfillable(ClaimId),
    #[error(transparent)]
    Accrual(#[from] AccrualError),
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// What a caller asserts when opening a claim. The engine fills in the
/// value for completions (snapshot of accrued value) and purchases
/// (unit price times quantity).
#[derive(Clone, Debug)]
pub struct ClaimDraft {
    pub scope: ScopeId,
    pub kind: ClaimKind,
    pub initiator: ParticipantId,
    pub entity: Option<EntityId>,
    pub target: Option<ParticipantId>,
    pub value: f64,
    pub quantity: Option<u32>,
}

/// Shared purchase account balance: credits minus every purchase claim
/// not marked invalid, as of `at`.
pub async fn account_balance(
    store: &dyn CommonsStorage,
    scope: &ScopeId,
    at: DateTime<Utc>,
) -> Result<f64, StorageError> {
    let credits: f64 = store
        .list_account_events(scope, at)
        .await?
        .iter()
        .map(|e| e.amount)
        .sum();
    let spent: f64 = store
        .list_claims(scope)
        .await?
        .iter()
        .filter(|c| c.kind == ClaimKind::Purchase && c.opened_at <= at && c.valid != Some(false))
        .map(|c| c.value)
        .sum();
    Ok(credits - spent)
}

pub struct ClaimEngine {
    store: Arc<dyn CommonsStorage>,
    polls: Arc<PollEngine>,
    accrual: Arc<AccrualEngine>,
    config: ClaimConfig,
    rules: Vec<Arc<dyn ClaimRule>>,
}

impl ClaimEngine {
    /// Engine with the built-in rule set.
    pub fn new(
        store: Arc<dyn CommonsStorage>,
        polls: Arc<PollEngine>,
        accrual: Arc<AccrualEngine>,
        config: ClaimConfig,
    ) -> Self {
        Self {
            store,
            polls,
            accrual,
            config,
            rules: vec![
                Arc::new(NoSelfTarget),
                Arc::new(SingleOpenDispute),
                Arc::new(SufficientAccountBalance),
                Arc::new(NonZeroCompletionValue),
            ],
        }
    }

    /// Installs an additional precondition rule.
    pub fn with_rule(mut self, rule: Arc<dyn ClaimRule>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Opens a poll-backed claim after running the precondition rules.
    pub async fn open(&self, mut draft: ClaimDraft, now: DateTime<Utc>) -> Result<Claim, ClaimError> {
        let poll_duration = match draft.kind {
            ClaimKind::Completion => {
                let entity = draft
                    .entity
                    .ok_or(ClaimError::InvalidDraft("completion claims need an entity"))?;
                draft.value = self.accrual.current_value(&draft.scope, entity, now).await?;
                Duration::minutes(self.config.completion_poll_minutes)
            }
            ClaimKind::Dispute => {
                if draft.target.is_none() {
                    return Err(ClaimError::InvalidDraft("disputes need a target"));
                }
                if draft.value <= 0.0 {
                    return Err(ClaimError::InvalidDraft("dispute value must be positive"));
                }
                Duration::hours(self.config.dispute_poll_hours)
            }
            ClaimKind::Purchase => {
                if draft.value <= 0.0 {
                    return Err(ClaimError::InvalidDraft("purchase price must be positive"));
                }
                draft.value *= draft.quantity.unwrap_or(1).max(1) as f64;
                Duration::hours(self.config.purchase_poll_hours)
            }
        };

        let ctx = RuleContext {
            store: &*self.store,
            draft: &draft,
            now,
            config: &self.config,
        };
        for rule in &self.rules {
            rule.check(&ctx).await.map_err(|err| {
                warn!(rule = rule.name(), %err, "claim rejected");
                err
            })?;
        }

        let poll = self.polls.create_poll(draft.scope.clone(), now, poll_duration).await?;
        let claim = Claim {
            id: ClaimId::generate(),
            scope: draft.scope,
            kind: draft.kind,
            initiator: draft.initiator,
            entity: draft.entity,
            target: draft.target,
            value: draft.value,
            quantity: draft.quantity,
            poll: poll.id,
            opened_at: now,
            resolved_at: None,
            valid: None,
            fulfilled_at: None,
            fulfilled_by: None,
        };
        self.store.insert_claim(claim.clone()).await?;
        info!(claim = %claim.id, kind = ?claim.kind, value = claim.value, "claim opened");
        Ok(claim)
    }

    /// Resolves one claim against its poll result and settles the
    /// outcome. Fails `PollOpen` before the poll ends and
    /// `AlreadyResolved` ever after.
    pub async fn resolve(&self, id: ClaimId, now: DateTime<Utc>) -> Result<Claim, ClaimError> {
        let claim = self.store.get_claim(id).await?;
        if claim.is_resolved() {
            return Err(ClaimError::AlreadyResolved(id));
        }
        let poll = self.polls.get_poll(claim.poll).await?;
        if now < poll.end {
            return Err(ClaimError::PollOpen {
                poll: poll.id,
                end: poll.end,
            });
        }

        let tally = self.polls.result_counts(claim.poll).await?;
        let min_votes = self.min_votes(&claim, now).await?;
        let valid = tally.passes(min_votes);

        // A valid completion re-snapshots accrued value as of the open
        // time; the poll-window snapshot is only an estimate.
        let value = match (claim.kind, claim.entity) {
            (ClaimKind::Completion, Some(entity)) if valid => {
                self.accrual
                    .current_value(&claim.scope, entity, claim.opened_at)
                    .await?
            }
            (ClaimKind::Completion, _) => 0.0,
            _ => claim.value,
        };

        let resolved = self
            .store
            .resolve_claim(id, now, valid, value)
            .await
            .map_err(|err| match err {
                StorageError::Conflict(_) => ClaimError::AlreadyResolved(id),
                other => ClaimError::Storage(other),
            })?;

        self.settle(&resolved, now).await?;
        info!(
            claim = %id,
            kind = ?resolved.kind,
            valid,
            value = resolved.value,
            yays = tally.yays,
            nays = tally.nays,
            min_votes,
            "claim resolved"
        );
        Ok(resolved)
    }

    /// Resolves every open claim whose poll has ended. Row failures are
    /// logged and skipped so one bad claim cannot wedge the batch.
    pub async fn resolve_batch(
        &self,
        scope: &ScopeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Claim>, ClaimError> {
        let mut resolved = Vec::new();
        for claim in self.store.list_open_claims(scope).await? {
            let poll = self.polls.get_poll(claim.poll).await?;
            if poll.end > now {
                continue;
            }
            match self.resolve(claim.id, now).await {
                Ok(claim) => resolved.push(claim),
                Err(err) => warn!(claim = %claim.id, %err, "batch resolution skipped claim"),
            }
        }
        Ok(resolved)
    }

    async fn min_votes(&self, claim: &Claim, now: DateTime<Utc>) -> Result<usize, ClaimError> {
        match claim.kind {
            ClaimKind::Completion => Ok(self.config.completion_min_votes),
            ClaimKind::Dispute => {
                let voting = self.voting_count(&claim.scope, now).await?;
                let ratio = match &claim.target {
                    Some(target) => {
                        let balance = self.reputation_balance(&claim.scope, target, now).await?;
                        if balance - claim.value < self.config.critical_balance {
                            self.config.dispute_quorum_critical
                        } else {
                            self.config.dispute_quorum
                        }
                    }
                    None => self.config.dispute_quorum,
                };
                Ok((ratio * voting as f64).ceil() as usize)
            }
            ClaimKind::Purchase => {
                let votes = (claim.value / self.config.purchase_vote_unit).ceil() as usize;
                Ok(votes.max(1))
            }
        }
    }

    /// Dispute settlement: the loser pays. A valid dispute debits the
    /// target, an invalid one debits the initiator, both by the claim
    /// value. Purchases settle implicitly through the derived account
    /// balance.
    async fn settle(&self, claim: &Claim, now: DateTime<Utc>) -> Result<(), ClaimError> {
        if claim.kind != ClaimKind::Dispute {
            return Ok(());
        }
        let debited = match (claim.valid, &claim.target) {
            (Some(true), Some(target)) => target.clone(),
            _ => claim.initiator.clone(),
        };
        let mut metadata = std::collections::BTreeMap::new();
        metadata.insert("claim".to_string(), claim.id.to_string());
        self.store
            .append_ledger_event(LedgerEvent {
                scope: claim.scope.clone(),
                participant: debited,
                occurred_at: now,
                amount: -claim.value,
                category: LedgerCategory::Dispute,
                metadata,
            })
            .await?;
        Ok(())
    }

    async fn voting_count(&self, scope: &ScopeId, now: DateTime<Utc>) -> Result<usize, ClaimError> {
        let roster = self.store.list_participants(scope).await?;
        Ok(roster.iter().filter(|p| p.is_voting(now)).count())
    }

    async fn reputation_balance(
        &self,
        scope: &ScopeId,
        participant: &ParticipantId,
        at: DateTime<Utc>,
    ) -> Result<f64, ClaimError> {
        let events = self
            .store
            .list_ledger_events(scope, Some(participant), at)
            .await?;
        Ok(events
            .iter()
            .filter(|e| e.category != LedgerCategory::Adjustment)
            .map(|e| e.amount)
            .sum())
    }

    // Purchase account

    /// Credits the scope's shared account.
    pub async fn load_account(
        &self,
        scope: &ScopeId,
        amount: f64,
        at: DateTime<Utc>,
    ) -> Result<(), ClaimError> {
        self.store
            .append_account_event(AccountEvent {
                scope: scope.clone(),
                amount,
                occurred_at: at,
            })
            .await?;
        info!(%scope, amount, "account loaded");
        Ok(())
    }

    pub async fn account_balance(
        &self,
        scope: &ScopeId,
        at: DateTime<Utc>,
    ) -> Result<f64, ClaimError> {
        Ok(account_balance(&*self.store, scope, at).await?)
    }

    /// Marks an approved purchase as physically completed.
    pub async fn fulfill(
        &self,
        id: ClaimId,
        by: ParticipantId,
        at: DateTime<Utc>,
    ) -> Result<Claim, ClaimError> {
        let claim = self.store.get_claim(id).await?;
        if claim.kind != ClaimKind::Purchase
            || claim.valid != Some(true)
            || claim.fulfilled_at.is_some()
        {
            return Err(ClaimError::NotFulfillable(id));
        }
        Ok(self.store.fulfill_claim(id, by, at).await?)
    }

    /// Purchases still awaiting physical fulfillment: everything not
    /// rejected and not yet fulfilled, pending polls included.
    pub async fn unfulfilled_purchases(
        &self,
        scope: &ScopeId,
        at: DateTime<Utc>,
    ) -> Result<Vec<Claim>, ClaimError> {
        Ok(self
            .store
            .list_claims(scope)
            .await?
            .into_iter()
            .filter(|c| {
                c.kind == ClaimKind::Purchase
                    && c.opened_at <= at
                    && c.valid != Some(false)
                    && c.fulfilled_at.is_none()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use commons_accrual::AccrualConfig;
    use commons_polls::PollConfig;
    use commons_ranking::RankingEngine;
    use commons_storage::{ClaimStore, InMemoryStorage, LedgerStore, ValueStore};
    use commons_types::{Participant, ValueEvent, VoteChoice};

    fn scope() -> ScopeId {
        ScopeId::new("house")
    }

    fn pid(id: &str) -> ParticipantId {
        ParticipantId::new(id)
    }

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, d, h, 0, 0).unwrap()
    }

    struct Fixture {
        store: Arc<InMemoryStorage>,
        engine: ClaimEngine,
        polls: Arc<PollEngine>,
    }

    async fn setup(residents: &[&str]) -> Fixture {
        let store = Arc::new(InMemoryStorage::new());
        for id in residents {
            store
                .add_participant(Participant {
                    scope: scope(),
                    id: pid(id),
                    activated_at: Some(at(1, 0)),
                    exempt_at: None,
                })
                .await;
        }
        let polls = Arc::new(PollEngine::new(store.clone(), PollConfig::default()));
        let accrual = Arc::new(AccrualEngine::new(
            store.clone(),
            RankingEngine::default(),
            AccrualConfig::default(),
        ));
        let engine = ClaimEngine::new(store.clone(), polls.clone(), accrual, ClaimConfig::default());
        Fixture { store, engine, polls }
    }

    async fn accrue(store: &InMemoryStorage, entity: EntityId, day: u32, amount: f64) {
        store
            .append_value_event(ValueEvent {
                scope: scope(),
                entity,
                valued_at: at(day, 0),
                amount,
                ranking: 1.0,
                participants: 2,
            })
            .await
            .unwrap();
    }

    async fn vote(fx: &Fixture, claim: &Claim, voter: &str, choice: VoteChoice, t: DateTime<Utc>) {
        fx.polls
            .submit_vote(claim.poll, &pid(voter), choice, t)
            .await
            .unwrap();
    }

    async fn poll_end(fx: &Fixture, claim: &Claim) -> DateTime<Utc> {
        fx.polls.get_poll(claim.poll).await.unwrap().end
    }

    fn completion_draft(entity: EntityId, initiator: &str) -> ClaimDraft {
        ClaimDraft {
            scope: scope(),
            kind: ClaimKind::Completion,
            initiator: pid(initiator),
            entity: Some(entity),
            target: None,
            value: 0.0,
            quantity: None,
        }
    }

    fn dispute_draft(initiator: &str, target: &str, value: f64) -> ClaimDraft {
        ClaimDraft {
            scope: scope(),
            kind: ClaimKind::Dispute,
            initiator: pid(initiator),
            entity: None,
            target: Some(pid(target)),
            value,
            quantity: None,
        }
    }

    fn purchase_draft(initiator: &str, price: f64, quantity: u32) -> ClaimDraft {
        ClaimDraft {
            scope: scope(),
            kind: ClaimKind::Purchase,
            initiator: pid(initiator),
            entity: None,
            target: None,
            value: price,
            quantity: Some(quantity),
        }
    }

    async fn balance(fx: &Fixture, who: &str, t: DateTime<Utc>) -> f64 {
        fx.store
            .list_ledger_events(&scope(), Some(&pid(who)), t)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.category != LedgerCategory::Adjustment)
            .map(|e| e.amount)
            .sum()
    }

    #[tokio::test]
    async fn completion_claim_snapshots_and_revalidates_value() {
        let fx = setup(&["alice", "bob", "carol"]).await;
        let entity = fx.store.create_entity(scope(), "dishes", at(1, 0)).await;
        accrue(&fx.store, entity.id, 5, 10.0).await;
        accrue(&fx.store, entity.id, 8, 15.0).await;

        let claim = fx.engine.open(completion_draft(entity.id, "alice"), at(10, 0)).await.unwrap();
        assert!((claim.value - 25.0).abs() < 1e-9);

        let end = poll_end(&fx, &claim).await;
        vote(&fx, &claim, "bob", VoteChoice::Yay, at(10, 0)).await;
        vote(&fx, &claim, "carol", VoteChoice::Yay, at(10, 0)).await;

        let resolved = fx.engine.resolve(claim.id, end).await.unwrap();
        assert_eq!(resolved.valid, Some(true));
        assert!((resolved.value - 25.0).abs() < 1e-9);

        let err = fx.engine.resolve(claim.id, end).await.unwrap_err();
        assert!(matches!(err, ClaimError::AlreadyResolved(_)));
    }

    #[tokio::test]
    async fn completion_without_quorum_is_invalid_and_worthless() {
        let fx = setup(&["alice", "bob"]).await;
        let entity = fx.store.create_entity(scope(), "dishes", at(1, 0)).await;
        accrue(&fx.store, entity.id, 5, 10.0).await;

        let claim = fx.engine.open(completion_draft(entity.id, "alice"), at(10, 0)).await.unwrap();
        let end = poll_end(&fx, &claim).await;
        vote(&fx, &claim, "bob", VoteChoice::Yay, at(10, 0)).await;

        let resolved = fx.engine.resolve(claim.id, end).await.unwrap();
        assert_eq!(resolved.valid, Some(false));
        assert_eq!(resolved.value, 0.0);
    }

    #[tokio::test]
    async fn cannot_resolve_before_the_poll_closes() {
        let fx = setup(&["alice", "bob"]).await;
        let entity = fx.store.create_entity(scope(), "dishes", at(1, 0)).await;
        accrue(&fx.store, entity.id, 5, 10.0).await;

        let claim = fx.engine.open(completion_draft(entity.id, "alice"), at(10, 0)).await.unwrap();
        let err = fx.engine.resolve(claim.id, at(10, 0)).await.unwrap_err();
        assert!(matches!(err, ClaimError::PollOpen { .. }));
    }

    #[tokio::test]
    async fn zero_value_completion_is_rejected_at_open() {
        let fx = setup(&["alice"]).await;
        let entity = fx.store.create_entity(scope(), "dishes", at(1, 0)).await;

        let err = fx.engine.open(completion_draft(entity.id, "alice"), at(10, 0)).await.unwrap_err();
        assert!(matches!(err, ClaimError::ZeroValueClaim));
    }

    #[tokio::test]
    async fn self_dispute_and_duplicate_dispute_are_rejected() {
        let fx = setup(&["alice", "bob"]).await;

        let err = fx.engine.open(dispute_draft("alice", "alice", 1.0), at(10, 0)).await.unwrap_err();
        assert!(matches!(err, ClaimError::SelfTarget));

        fx.engine.open(dispute_draft("alice", "bob", 1.0), at(10, 0)).await.unwrap();
        let err = fx.engine.open(dispute_draft("alice", "bob", 1.0), at(10, 1)).await.unwrap_err();
        assert!(matches!(err, ClaimError::DuplicateDispute));
    }

    #[tokio::test]
    async fn valid_dispute_debits_the_target() {
        let fx = setup(&["alice", "bob", "carol", "dave", "erin"]).await;
        // Five voting participants: baseline quorum is ceil(0.4 * 5) = 2.
        for who in ["alice", "bob"] {
            fx.store
                .append_ledger_event(LedgerEvent {
                    scope: scope(),
                    participant: pid(who),
                    occurred_at: at(1, 0),
                    amount: 5.0,
                    category: LedgerCategory::Baseline,
                    metadata: Default::default(),
                })
                .await
                .unwrap();
        }

        let claim = fx.engine.open(dispute_draft("alice", "bob", 1.0), at(10, 0)).await.unwrap();
        let end = poll_end(&fx, &claim).await;
        for who in ["alice", "carol", "dave"] {
            vote(&fx, &claim, who, VoteChoice::Yay, at(10, 0)).await;
        }
        vote(&fx, &claim, "bob", VoteChoice::Nay, at(10, 0)).await;

        let resolved = fx.engine.resolve(claim.id, end).await.unwrap();
        assert_eq!(resolved.valid, Some(true));
        assert!((balance(&fx, "bob", end).await - 4.0).abs() < 1e-9);
        assert!((balance(&fx, "alice", end).await - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failed_dispute_debits_the_initiator() {
        let fx = setup(&["alice", "bob", "carol", "dave", "erin"]).await;
        fx.store
            .append_ledger_event(LedgerEvent {
                scope: scope(),
                participant: pid("bob"),
                occurred_at: at(1, 0),
                amount: 5.0,
                category: LedgerCategory::Baseline,
                metadata: Default::default(),
            })
            .await
            .unwrap();

        let claim = fx.engine.open(dispute_draft("alice", "bob", 1.0), at(10, 0)).await.unwrap();
        let end = poll_end(&fx, &claim).await;
        // One yay against a quorum of two.
        vote(&fx, &claim, "alice", VoteChoice::Yay, at(10, 0)).await;

        let resolved = fx.engine.resolve(claim.id, end).await.unwrap();
        assert_eq!(resolved.valid, Some(false));
        assert!((balance(&fx, "alice", end).await - (-1.0)).abs() < 1e-9);
        assert!((balance(&fx, "bob", end).await - 5.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn dispute_below_critical_balance_needs_the_raised_quorum() {
        let fx = setup(&["alice", "bob", "carol", "dave", "erin"]).await;
        fx.store
            .append_ledger_event(LedgerEvent {
                scope: scope(),
                participant: pid("bob"),
                occurred_at: at(1, 0),
                amount: 2.5,
                category: LedgerCategory::Baseline,
                metadata: Default::default(),
            })
            .await
            .unwrap();

        // 2.5 - 1.0 drops below 2.0, so quorum is ceil(0.7 * 5) = 4.
        let claim = fx.engine.open(dispute_draft("alice", "bob", 1.0), at(10, 0)).await.unwrap();
        let end = poll_end(&fx, &claim).await;
        for who in ["alice", "carol", "dave"] {
            vote(&fx, &claim, who, VoteChoice::Yay, at(10, 0)).await;
        }

        let resolved = fx.engine.resolve(claim.id, end).await.unwrap();
        assert_eq!(resolved.valid, Some(false));
    }

    #[tokio::test]
    async fn purchases_draw_against_the_shared_account() {
        let fx = setup(&["alice", "bob"]).await;
        fx.engine.load_account(&scope(), 100.0, at(1, 0)).await.unwrap();

        let claim = fx.engine.open(purchase_draft("alice", 10.0, 3), at(10, 0)).await.unwrap();
        assert!((claim.value - 30.0).abs() < 1e-9);
        assert!((fx.engine.account_balance(&scope(), at(10, 0)).await.unwrap() - 70.0).abs() < 1e-9);

        let err = fx.engine.open(purchase_draft("alice", 80.0, 1), at(10, 1)).await.unwrap_err();
        assert!(matches!(err, ClaimError::InsufficientFunds { .. }));
    }

    #[tokio::test]
    async fn non_positive_values_are_rejected_at_open() {
        let fx = setup(&["alice", "bob"]).await;
        fx.engine.load_account(&scope(), 100.0, at(1, 0)).await.unwrap();

        // A negative price would otherwise inflate the derived balance.
        let err = fx.engine.open(purchase_draft("alice", -10.0, 2), at(10, 0)).await.unwrap_err();
        assert!(matches!(err, ClaimError::InvalidDraft(_)));

        let err = fx.engine.open(dispute_draft("alice", "bob", 0.0), at(10, 0)).await.unwrap_err();
        assert!(matches!(err, ClaimError::InvalidDraft(_)));

        assert!((fx.engine.account_balance(&scope(), at(10, 1)).await.unwrap() - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn rejected_purchase_restores_the_balance() {
        let fx = setup(&["alice", "bob"]).await;
        fx.engine.load_account(&scope(), 100.0, at(1, 0)).await.unwrap();

        let claim = fx.engine.open(purchase_draft("alice", 10.0, 1), at(10, 0)).await.unwrap();
        let end = poll_end(&fx, &claim).await;
        vote(&fx, &claim, "alice", VoteChoice::Yay, at(10, 0)).await;
        vote(&fx, &claim, "bob", VoteChoice::Nay, at(10, 0)).await;

        let resolved = fx.engine.resolve(claim.id, end).await.unwrap();
        assert_eq!(resolved.valid, Some(false));
        assert!((fx.engine.account_balance(&scope(), end).await.unwrap() - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn large_purchases_need_one_vote_per_unit() {
        let fx = setup(&["alice", "bob"]).await;
        fx.engine.load_account(&scope(), 100.0, at(1, 0)).await.unwrap();

        // 60.0 at a 50.0 unit: two affirmative votes required.
        let claim = fx.engine.open(purchase_draft("alice", 60.0, 1), at(10, 0)).await.unwrap();
        let end = poll_end(&fx, &claim).await;
        vote(&fx, &claim, "alice", VoteChoice::Yay, at(10, 0)).await;

        let resolved = fx.engine.resolve(claim.id, end).await.unwrap();
        assert_eq!(resolved.valid, Some(false));
    }

    #[tokio::test]
    async fn batch_resolution_skips_open_polls() {
        let fx = setup(&["alice", "bob", "carol"]).await;
        fx.engine.load_account(&scope(), 100.0, at(1, 0)).await.unwrap();

        let early = fx.engine.open(purchase_draft("alice", 10.0, 1), at(10, 0)).await.unwrap();
        let late = fx.engine.open(purchase_draft("alice", 10.0, 1), at(10, 5)).await.unwrap();
        vote(&fx, &early, "alice", VoteChoice::Yay, at(10, 0)).await;

        let cutoff = poll_end(&fx, &early).await;
        let resolved = fx.engine.resolve_batch(&scope(), cutoff).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, early.id);

        let late = fx.store.get_claim(late.id).await.unwrap();
        assert!(!late.is_resolved());
    }

    #[tokio::test]
    async fn fulfillment_tracks_approved_purchases() {
        let fx = setup(&["alice", "bob"]).await;
        fx.engine.load_account(&scope(), 100.0, at(1, 0)).await.unwrap();

        let claim = fx.engine.open(purchase_draft("alice", 10.0, 1), at(10, 0)).await.unwrap();
        let end = poll_end(&fx, &claim).await;

        // Pending purchases count as unfulfilled.
        assert_eq!(fx.engine.unfulfilled_purchases(&scope(), at(10, 1)).await.unwrap().len(), 1);

        vote(&fx, &claim, "alice", VoteChoice::Yay, at(10, 0)).await;
        fx.engine.resolve(claim.id, end).await.unwrap();

        let fulfilled = fx.engine.fulfill(claim.id, pid("bob"), end).await.unwrap();
        assert_eq!(fulfilled.fulfilled_by, Some(pid("bob")));
        assert_eq!(fx.engine.unfulfilled_purchases(&scope(), end).await.unwrap().len(), 0);

        let err = fx.engine.fulfill(claim.id, pid("bob"), end).await.unwrap_err();
        assert!(matches!(err, ClaimError::NotFulfillable(_)));
    }
}
