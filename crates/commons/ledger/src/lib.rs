//! Reputation ledger.
//!
//! Balances are derived by summing signed append-only events, never
//! stored. The periodic routines (regeneration, penalty, karma reward)
//! are idempotent per calendar month: a lost race on the underlying
//! conditional append is swallowed as a no-op.
//!
//! Adjustment events denominate accrued claim value, not reputation, and
//! are excluded from every balance here; they exist so gifts can move
//! period entitlement between participants.

#![deny(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use commons_accrual::{AccrualEngine, AccrualError};
use commons_ranking::{PairwisePreference, RankingEngine, RankingError};
use commons_storage::{CommonsStorage, StorageError};
use commons_types::period::{month_start, prev_month_start};
use commons_types::{
    ClaimKind, KarmaNomination, LedgerCategory, LedgerEvent, ParticipantId, ScopeId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Starting balance granted on first initialisation.
    pub baseline: f64,
    /// Hard ceiling on any participant's balance.
    pub cap: f64,
    /// Monthly regeneration amount.
    pub regeneration: f64,
    /// Monthly accrued-value quota backing the penalty computation.
    pub quota: f64,
    /// Shortfalls are floored to multiples of this before conversion.
    pub penalty_increment: f64,
    /// Grace period after month start before penalties apply.
    pub penalty_delay_hours: i64,
    /// Grace period after month start before karma rewards apply.
    pub karma_delay_hours: i64,
    pub karma_reward: f64,
    /// One karma winner per this many active participants.
    pub karma_winner_divisor: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            baseline: 5.0,
            cap: 5.0,
            regeneration: 0.5,
            quota: 100.0,
            penalty_increment: 10.0,
            penalty_delay_hours: 72,
            karma_delay_hours: 72,
            karma_reward: 1.0,
            karma_winner_divisor: 3,
        }
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("insufficient earned value: requested {requested}, available {available}")]
    InsufficientFunds { requested: f64, available: f64 },
    #[error("gift amounts must be positive (got {0})")]
    InvalidAmount(f64),
    #[error("cannot nominate oneself")]
    SelfNomination,
    #[error(transparent)]
    Accrual(#[from] AccrualError),
    #[error(transparent)]
    Ranking(#[from] RankingError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A karma winner and the ranking weight that earned the reward.
#[derive(Clone, Debug)]
pub struct KarmaAward {
    pub participant: ParticipantId,
    pub amount: f64,
    pub ranking: f64,
}

pub struct LedgerEngine {
    store: Arc<dyn CommonsStorage>,
    accrual: Arc<AccrualEngine>,
    ranker: RankingEngine,
    config: LedgerConfig,
}

impl LedgerEngine {
    pub fn new(
        store: Arc<dyn CommonsStorage>,
        accrual: Arc<AccrualEngine>,
        ranker: RankingEngine,
        config: LedgerConfig,
    ) -> Self {
        Self {
            store,
            accrual,
            ranker,
            config,
        }
    }

    /// Reputation balance as of `at`.
    pub async fn balance(
        &self,
        scope: &ScopeId,
        participant: &ParticipantId,
        at: DateTime<Utc>,
    ) -> Result<f64, LedgerError> {
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

    /// Whether any reputation event exists for the participant. Presence
    /// is what gates initialisation and regeneration, not the balance.
    async fn initialised(
        &self,
        scope: &ScopeId,
        participant: &ParticipantId,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let events = self
            .store
            .list_ledger_events(scope, Some(participant), at)
            .await?;
        Ok(events
            .iter()
            .any(|e| e.category != LedgerCategory::Adjustment))
    }

    /// Grants the baseline to a participant with no ledger history.
    /// Applied at most once ever, even if the balance later hits zero.
    pub async fn initialise(
        &self,
        scope: &ScopeId,
        participant: &ParticipantId,
        at: DateTime<Utc>,
    ) -> Result<Option<LedgerEvent>, LedgerError> {
        if self.initialised(scope, participant, at).await? {
            return Ok(None);
        }
        let event = LedgerEvent {
            scope: scope.clone(),
            participant: participant.clone(),
            occurred_at: at,
            amount: self.config.baseline,
            category: LedgerCategory::Baseline,
            metadata: BTreeMap::new(),
        };
        // An all-time uniqueness window makes the grant conditional, so a
        // raced second initialise loses at the store instead of
        // double-applying the baseline.
        match self
            .store
            .append_ledger_event_unique(event.clone(), DateTime::<Utc>::MIN_UTC)
            .await
        {
            Ok(()) => {
                info!(%scope, %participant, baseline = self.config.baseline, "participant initialised");
                Ok(Some(event))
            }
            Err(StorageError::Conflict(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Monthly regeneration: initialised participants under the cap gain
    /// up to the regeneration amount, at most once per calendar month.
    pub async fn regenerate(
        &self,
        scope: &ScopeId,
        participant: &ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEvent>, LedgerError> {
        if !self.initialised(scope, participant, now).await? {
            return Ok(None);
        }
        let balance = self.balance(scope, participant, now).await?;
        if balance >= self.config.cap {
            return Ok(None);
        }
        let amount = self.config.regeneration.min(self.config.cap - balance);
        let event = LedgerEvent {
            scope: scope.clone(),
            participant: participant.clone(),
            occurred_at: now,
            amount,
            category: LedgerCategory::Regeneration,
            metadata: BTreeMap::new(),
        };
        match self
            .store
            .append_ledger_event_unique(event.clone(), month_start(now))
            .await
        {
            Ok(()) => Ok(Some(event)),
            Err(StorageError::Conflict(_)) => {
                debug!(%participant, "regeneration already applied this month");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Accrued claim value earned in `[from, to]`: valid completion
    /// claims plus gift adjustments.
    pub async fn earned_value(
        &self,
        scope: &ScopeId,
        participant: &ParticipantId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<f64, LedgerError> {
        let claimed: f64 = self
            .store
            .list_claims(scope)
            .await?
            .iter()
            .filter(|c| {
                c.kind == ClaimKind::Completion
                    && c.initiator == *participant
                    && c.valid == Some(true)
                    && c.opened_at >= from
                    && c.opened_at <= to
            })
            .map(|c| c.value)
            .sum();
        let adjusted: f64 = self
            .store
            .list_ledger_events(scope, Some(participant), to)
            .await?
            .iter()
            .filter(|e| e.category == LedgerCategory::Adjustment && e.occurred_at >= from)
            .map(|e| e.amount)
            .sum();
        Ok(claimed + adjusted)
    }

    /// Monthly shortfall penalty, applied once per month after the grace
    /// delay. The prior month's earned value is compared to the quota
    /// scaled by presence; each whole increment of shortfall costs half a
    /// reputation unit. Never-initialised participants are skipped.
    pub async fn penalty(
        &self,
        scope: &ScopeId,
        participant: &ParticipantId,
        now: DateTime<Utc>,
    ) -> Result<Option<LedgerEvent>, LedgerError> {
        let penalty_time = month_start(now) + Duration::hours(self.config.penalty_delay_hours);
        if now < penalty_time {
            return Ok(None);
        }
        if !self.initialised(scope, participant, penalty_time).await? {
            return Ok(None);
        }

        let amount = self.compute_penalty(scope, participant, penalty_time).await?;
        let event = LedgerEvent {
            scope: scope.clone(),
            participant: participant.clone(),
            occurred_at: penalty_time,
            amount: -amount,
            category: LedgerCategory::Penalty,
            metadata: BTreeMap::new(),
        };
        match self
            .store
            .append_ledger_event_unique(event.clone(), month_start(now))
            .await
        {
            Ok(()) => {
                if amount > 0.0 {
                    info!(%scope, %participant, amount, "shortfall penalty applied");
                }
                Ok(Some(event))
            }
            Err(StorageError::Conflict(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn compute_penalty(
        &self,
        scope: &ScopeId,
        participant: &ParticipantId,
        penalty_time: DateTime<Utc>,
    ) -> Result<f64, LedgerError> {
        let prev_start = prev_month_start(penalty_time);
        let prev_end = month_start(penalty_time) - Duration::milliseconds(1);

        let earned = self
            .earned_value(scope, participant, prev_start, prev_end)
            .await?;
        let presence = self
            .accrual
            .active_fraction(scope, participant, prev_end)
            .await?;

        let owed = self.config.quota * presence;
        let deficiency = (owed - earned).max(0.0);
        let increments = (deficiency / self.config.penalty_increment).floor();
        Ok(increments * self.config.penalty_increment / (2.0 * self.config.penalty_increment))
    }

    /// Transfers earned claim value between participants as a zero-sum
    /// adjustment pair. Gated by the giver's month-to-date earnings;
    /// reputation balances are untouched.
    pub async fn gift(
        &self,
        scope: &ScopeId,
        from: &ParticipantId,
        to: &ParticipantId,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if value <= 0.0 {
            return Err(LedgerError::InvalidAmount(value));
        }
        let available = self.earned_value(scope, from, month_start(at), at).await?;
        if available < value {
            return Err(LedgerError::InsufficientFunds {
                requested: value,
                available,
            });
        }
        for (participant, amount) in [(from, -value), (to, value)] {
            self.store
                .append_ledger_event(LedgerEvent {
                    scope: scope.clone(),
                    participant: participant.clone(),
                    occurred_at: at,
                    amount,
                    category: LedgerCategory::Adjustment,
                    metadata: BTreeMap::new(),
                })
                .await?;
        }
        info!(%scope, %from, %to, value, "earned value gifted");
        Ok(())
    }

    /// Records a directed peer nomination.
    pub async fn nominate(
        &self,
        scope: &ScopeId,
        giver: &ParticipantId,
        receiver: &ParticipantId,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        if giver == receiver {
            return Err(LedgerError::SelfNomination);
        }
        self.store
            .append_nomination(KarmaNomination {
                scope: scope.clone(),
                giver: giver.clone(),
                receiver: receiver.clone(),
                given_at: at,
            })
            .await?;
        Ok(())
    }

    /// Ranks active participants by nomination flow in `(from, to]`.
    pub async fn karma_rankings(
        &self,
        scope: &ScopeId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<(ParticipantId, f64)>, LedgerError> {
        let roster = self.store.list_participants(scope).await?;
        let participants: Vec<ParticipantId> = roster
            .iter()
            .filter(|p| p.is_active(to))
            .map(|p| p.id.clone())
            .collect();
        // Repeated nominations from the same giver collapse to one edge;
        // each stated edge consumes one implicit flow share, so duplicates
        // would push matrix entries negative.
        let edges: BTreeSet<(ParticipantId, ParticipantId)> = self
            .store
            .list_nominations(scope, from, to)
            .await?
            .into_iter()
            .map(|n| (n.receiver, n.giver))
            .collect();
        let preferences: Vec<PairwisePreference<ParticipantId>> = edges
            .into_iter()
            .map(|(receiver, giver)| PairwisePreference {
                alpha: receiver,
                beta: giver,
                value: 1.0,
            })
            .collect();

        let ranking = self
            .ranker
            .rank(&participants, &preferences, participants.len())?;
        let mut ranked: Vec<(ParticipantId, f64)> = ranking.weights.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        Ok(ranked)
    }

    /// Winner budget: one per `karma_winner_divisor` active participants,
    /// bounded by the number of distinct nomination recipients.
    pub async fn karma_winner_count(
        &self,
        scope: &ScopeId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<usize, LedgerError> {
        let roster = self.store.list_participants(scope).await?;
        let active = roster.iter().filter(|p| p.is_active(to)).count();
        let recipients: BTreeSet<ParticipantId> = self
            .store
            .list_nominations(scope, from, to)
            .await?
            .into_iter()
            .map(|n| n.receiver)
            .collect();
        Ok((active / self.config.karma_winner_divisor).min(recipients.len()))
    }

    /// Rewards the prior month's top nomination recipients, once per
    /// month after the karma grace delay. Rewards are clipped at the cap
    /// and the winner's ranking weight is recorded on the event.
    pub async fn reward_karma(
        &self,
        scope: &ScopeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<KarmaAward>, LedgerError> {
        let karma_time = month_start(now) + Duration::hours(self.config.karma_delay_hours);
        if now < karma_time {
            return Ok(Vec::new());
        }
        let from = prev_month_start(now);
        let to = month_start(now);

        let winners = self.karma_winner_count(scope, from, to).await?;
        if winners == 0 {
            return Ok(Vec::new());
        }

        let recipients: BTreeSet<ParticipantId> = self
            .store
            .list_nominations(scope, from, to)
            .await?
            .into_iter()
            .map(|n| n.receiver)
            .collect();
        let rankings = self.karma_rankings(scope, from, to).await?;

        let mut awards = Vec::new();
        for (participant, ranking) in rankings
            .into_iter()
            .filter(|(p, _)| recipients.contains(p))
            .take(winners)
        {
            let balance = self.balance(scope, &participant, now).await?;
            let amount = self
                .config
                .karma_reward
                .min(self.config.cap - balance)
                .max(0.0);

            let mut metadata = BTreeMap::new();
            metadata.insert("ranking".to_string(), ranking.to_string());
            let event = LedgerEvent {
                scope: scope.clone(),
                participant: participant.clone(),
                occurred_at: now,
                amount,
                category: LedgerCategory::Karma,
                metadata,
            };
            match self
                .store
                .append_ledger_event_unique(event, month_start(now))
                .await
            {
                Ok(()) => awards.push(KarmaAward {
                    participant,
                    amount,
                    ranking,
                }),
                Err(StorageError::Conflict(_)) => {
                    debug!(%participant, "karma already rewarded this month");
                }
                Err(err) => return Err(err.into()),
            }
        }

        if !awards.is_empty() {
            info!(%scope, winners = awards.len(), "karma rewards distributed");
        }
        Ok(awards)
    }
}
