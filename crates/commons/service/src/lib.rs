//! Service facade.
//!
//! One struct wiring every engine over a shared storage handle. This is
//! the seam a presentation or notification layer calls; it validates and
//! routes but adds no domain semantics of its own.

#![deny(unsafe_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use commons_accrual::{AccrualConfig, AccrualEngine, AccrualError, RankedEntity, ValuedEntity};
use commons_claims::{ClaimConfig, ClaimDraft, ClaimEngine, ClaimError};
use commons_ledger::{KarmaAward, LedgerConfig, LedgerEngine, LedgerError};
use commons_polls::{PollConfig, PollEngine, PollError};
use commons_ranking::{RankingConfig, RankingEngine};
use commons_storage::{CommonsStorage, StorageError};
use commons_types::{
    Claim, ClaimId, ParticipantId, PollId, Preference, PreferenceError, PreferenceInput, ScopeId,
    VoteChoice,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub ranking: RankingConfig,
    pub polls: PollConfig,
    pub accrual: AccrualConfig,
    pub claims: ClaimConfig,
    pub ledger: LedgerConfig,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Preference(#[from] PreferenceError),
    #[error(transparent)]
    Accrual(#[from] AccrualError),
    #[error(transparent)]
    Claim(#[from] ClaimError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct CommonsService {
    store: Arc<dyn CommonsStorage>,
    polls: Arc<PollEngine>,
    accrual: Arc<AccrualEngine>,
    claims: ClaimEngine,
    ledger: LedgerEngine,
}

impl CommonsService {
    pub fn new(store: Arc<dyn CommonsStorage>, config: ServiceConfig) -> Self {
        let ranker = RankingEngine::new(config.ranking);
        let polls = Arc::new(PollEngine::new(store.clone(), config.polls));
        let accrual = Arc::new(AccrualEngine::new(store.clone(), ranker, config.accrual));
        let claims = ClaimEngine::new(
            store.clone(),
            polls.clone(),
            accrual.clone(),
            config.claims,
        );
        let ledger = LedgerEngine::new(store.clone(), accrual.clone(), ranker, config.ledger);
        Self {
            store,
            polls,
            accrual,
            claims,
            ledger,
        }
    }

    pub fn claims(&self) -> &ClaimEngine {
        &self.claims
    }

    pub fn ledger(&self) -> &LedgerEngine {
        &self.ledger
    }

    pub fn accrual(&self) -> &AccrualEngine {
        &self.accrual
    }

    pub fn polls(&self) -> &PollEngine {
        &self.polls
    }

    // Preferences and rankings

    /// Normalizes and persists a preference submission. Self-referential
    /// inputs are dropped; the count of stored rows is returned.
    pub async fn submit_preferences(
        &self,
        scope: &ScopeId,
        participant: &ParticipantId,
        inputs: Vec<PreferenceInput>,
    ) -> Result<usize, ServiceError> {
        let preferences = self.normalize(scope, participant, inputs)?;
        let count = preferences.len();
        self.store.upsert_preferences(preferences).await?;
        debug!(%scope, %participant, count, "preferences stored");
        Ok(count)
    }

    pub async fn current_rankings(
        &self,
        scope: &ScopeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<RankedEntity>, ServiceError> {
        Ok(self.accrual.current_rankings(scope, now).await?)
    }

    /// Rankings as they would look if `inputs` were submitted. Nothing is
    /// persisted.
    pub async fn proposed_rankings(
        &self,
        scope: &ScopeId,
        participant: &ParticipantId,
        now: DateTime<Utc>,
        inputs: Vec<PreferenceInput>,
    ) -> Result<Vec<RankedEntity>, ServiceError> {
        let candidate = self.normalize(scope, participant, inputs)?;
        Ok(self.accrual.proposed_rankings(scope, now, candidate).await?)
    }

    fn normalize(
        &self,
        scope: &ScopeId,
        participant: &ParticipantId,
        inputs: Vec<PreferenceInput>,
    ) -> Result<Vec<Preference>, ServiceError> {
        let mut preferences = Vec::with_capacity(inputs.len());
        for input in inputs {
            if let Some(pref) = input.normalize(scope.clone(), participant.clone())? {
                preferences.push(pref);
            }
        }
        Ok(preferences)
    }

    // Accrual

    /// Accrual tick: emits any due value and returns per-entity totals.
    pub async fn run_accrual(
        &self,
        scope: &ScopeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ValuedEntity>, ServiceError> {
        Ok(self.accrual.updated_values(scope, now).await?)
    }

    pub async fn current_values(
        &self,
        scope: &ScopeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ValuedEntity>, ServiceError> {
        Ok(self.accrual.current_values(scope, now).await?)
    }

    // Claims

    pub async fn open_claim(
        &self,
        draft: ClaimDraft,
        now: DateTime<Utc>,
    ) -> Result<Claim, ServiceError> {
        Ok(self.claims.open(draft, now).await?)
    }

    pub async fn resolve_claim(
        &self,
        id: ClaimId,
        now: DateTime<Utc>,
    ) -> Result<Claim, ServiceError> {
        Ok(self.claims.resolve(id, now).await?)
    }

    /// Resolves every claim whose poll has ended.
    pub async fn resolve_due(
        &self,
        scope: &ScopeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Claim>, ServiceError> {
        Ok(self.claims.resolve_batch(scope, now).await?)
    }

    pub async fn submit_vote(
        &self,
        poll: PollId,
        participant: &ParticipantId,
        choice: VoteChoice,
        now: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        Ok(self.polls.submit_vote(poll, participant, choice, now).await?)
    }

    // Ledger

    pub async fn balance(
        &self,
        scope: &ScopeId,
        participant: &ParticipantId,
        at: DateTime<Utc>,
    ) -> Result<f64, ServiceError> {
        Ok(self.ledger.balance(scope, participant, at).await?)
    }

    /// Monthly maintenance for a scope: initialise newly active
    /// participants, regenerate, apply shortfall penalties, and
    /// distribute karma rewards. Safe to call repeatedly.
    pub async fn run_monthly_routines(
        &self,
        scope: &ScopeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<KarmaAward>, ServiceError> {
        let roster = self.store.list_participants(scope).await?;
        for participant in roster.iter().filter(|p| p.is_active(now)) {
            self.ledger.initialise(scope, &participant.id, now).await?;
            self.ledger.regenerate(scope, &participant.id, now).await?;
            self.ledger.penalty(scope, &participant.id, now).await?;
        }
        Ok(self.ledger.reward_karma(scope, now).await?)
    }
}
