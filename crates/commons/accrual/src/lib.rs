//! Periodic value emission.
//!
//! Value accrues to shared entities in proportion to the current
//! preference ranking. Each emission covers the whole hours elapsed since
//! the previous one, scaled against the hours of the calendar month so a
//! full month of ticks emits exactly one month's pool per eligible
//! participant. Entities hold their accrued value until a claim consumes
//! it.

#![deny(unsafe_code)]

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, Utc};
use commons_ranking::{PairwisePreference, RankingEngine, RankingError};
use commons_storage::{CommonsStorage, StorageError};
use commons_types::period::{day_start, days_in_month, hours_in_month, month_start, next_month_start};
use commons_types::{Entity, EntityId, ParticipantId, Preference, ScopeId, ValueEvent};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct AccrualConfig {
    /// Monthly value budget per eligible participant.
    pub points_per_participant: f64,
    /// Emission multiplier, a tuning knob for operators.
    pub inflation_factor: f64,
    /// Interval assumed for the very first emission in a scope.
    pub bootstrap_hours: i64,
}

impl Default for AccrualConfig {
    fn default() -> Self {
        Self {
            points_per_participant: 100.0,
            inflation_factor: 1.0,
            bootstrap_hours: 72,
        }
    }
}

#[derive(Debug, Error)]
pub enum AccrualError {
    #[error(transparent)]
    Ranking(#[from] RankingError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// An entity paired with its current ranking weight.
#[derive(Clone, Debug)]
pub struct RankedEntity {
    pub entity: Entity,
    pub ranking: f64,
}

/// An entity paired with its accrued, unclaimed value.
#[derive(Clone, Debug)]
pub struct ValuedEntity {
    pub entity: Entity,
    pub value: f64,
}

pub struct AccrualEngine {
    store: Arc<dyn CommonsStorage>,
    ranker: RankingEngine,
    config: AccrualConfig,
}

impl AccrualEngine {
    pub fn new(
        store: Arc<dyn CommonsStorage>,
        ranker: RankingEngine,
        config: AccrualConfig,
    ) -> Self {
        Self {
            store,
            ranker,
            config,
        }
    }

    /// Rankings over the scope's active entities, best first.
    pub async fn current_rankings(
        &self,
        scope: &ScopeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<RankedEntity>, AccrualError> {
        let preferences = self.store.list_preferences(scope).await?;
        self.rank_with(scope, now, preferences).await
    }

    /// Rankings as they would look after merging `candidate` into the
    /// stored preferences. Nothing is persisted.
    pub async fn proposed_rankings(
        &self,
        scope: &ScopeId,
        now: DateTime<Utc>,
        candidate: Vec<Preference>,
    ) -> Result<Vec<RankedEntity>, AccrualError> {
        let current = self.store.list_preferences(scope).await?;
        let merged = commons_types::preference::merge_preferences(&current, candidate);
        self.rank_with(scope, now, merged).await
    }

    async fn rank_with(
        &self,
        scope: &ScopeId,
        now: DateTime<Utc>,
        preferences: Vec<Preference>,
    ) -> Result<Vec<RankedEntity>, AccrualError> {
        let entities: Vec<Entity> = self
            .store
            .list_entities(scope)
            .await?
            .into_iter()
            .filter(|e| e.active)
            .collect();
        let participants = self.active_count(scope, now).await?;

        let items: Vec<EntityId> = entities.iter().map(|e| e.id).collect();
        let pairwise: Vec<PairwisePreference<EntityId>> = preferences
            .into_iter()
            .map(|p| PairwisePreference {
                alpha: p.alpha,
                beta: p.beta,
                value: p.value,
            })
            .collect();

        let ranking = self.ranker.rank(&items, &pairwise, participants)?;
        let mut ranked: Vec<RankedEntity> = entities
            .into_iter()
            .map(|entity| {
                let ranking = ranking.weights.get(&entity.id).copied().unwrap_or(0.0);
                RankedEntity { entity, ranking }
            })
            .collect();
        ranked.sort_by(|a, b| b.ranking.total_cmp(&a.ranking));
        Ok(ranked)
    }

    /// Fraction of a monthly budget covered by the time since the last
    /// emission. Whole hours only; under one hour the scalar is zero and
    /// the tick is a no-op. Intervals spanning a month boundary are split
    /// at each month start and every segment is scaled by its own month's
    /// hour count.
    pub async fn interval_scalar(
        &self,
        scope: &ScopeId,
        now: DateTime<Utc>,
    ) -> Result<f64, AccrualError> {
        let last = match self.store.last_valued_at(scope).await? {
            Some(t) => t,
            None => now - Duration::hours(self.config.bootstrap_hours),
        };
        let whole_hours = (now - last).num_hours();
        if whole_hours < 1 {
            return Ok(0.0);
        }

        let end = last + Duration::hours(whole_hours);
        let mut cursor = last;
        let mut scalar = 0.0;
        while cursor < end {
            let boundary = next_month_start(cursor).min(end);
            let segment_hours =
                (boundary - cursor).num_seconds() as f64 / 3600.0;
            scalar += segment_hours / hours_in_month(cursor) as f64;
            cursor = boundary;
        }
        Ok(scalar)
    }

    /// Runs one emission: pools `eligible x budget x scalar x inflation`
    /// and splits it across active entities by ranking. Returns the
    /// appended events; an empty result means the scalar was zero.
    pub async fn emit(
        &self,
        scope: &ScopeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ValueEvent>, AccrualError> {
        let scalar = self.interval_scalar(scope, now).await?;
        if scalar == 0.0 {
            debug!(%scope, "emission skipped, under one hour since last run");
            return Ok(Vec::new());
        }

        let eligible = self.eligible_count(scope, now).await?;
        let pool = eligible as f64
            * self.config.points_per_participant
            * scalar
            * self.config.inflation_factor;
        let rankings = self.current_rankings(scope, now).await?;

        let mut events = Vec::with_capacity(rankings.len());
        for ranked in rankings {
            let event = ValueEvent {
                scope: scope.clone(),
                entity: ranked.entity.id,
                valued_at: now,
                amount: ranked.ranking * pool,
                ranking: ranked.ranking,
                participants: eligible,
            };
            self.store.append_value_event(event.clone()).await?;
            events.push(event);
        }

        info!(%scope, eligible, scalar, pool, entities = events.len(), "value emitted");
        Ok(events)
    }

    /// Accrued unclaimed value for one entity: value events after the
    /// latest claim not marked invalid (pending claims hold the window)
    /// up to `at`.
    pub async fn current_value(
        &self,
        scope: &ScopeId,
        entity: EntityId,
        at: DateTime<Utc>,
    ) -> Result<f64, AccrualError> {
        let record = self.store.get_entity(scope, entity).await?;
        let claims = self.store.list_claims_for_entity(scope, entity).await?;
        let boundary = claims
            .iter()
            .filter(|c| c.opened_at < at && c.valid != Some(false))
            .map(|c| c.opened_at)
            .max()
            .unwrap_or(record.created_at)
            .max(record.created_at);

        let events = self
            .store
            .list_value_events(scope, entity, boundary, at)
            .await?;
        Ok(events.iter().map(|e| e.amount).sum())
    }

    /// Accrued values for every active entity, largest first.
    pub async fn current_values(
        &self,
        scope: &ScopeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ValuedEntity>, AccrualError> {
        let mut valued = Vec::new();
        for entity in self.store.list_entities(scope).await? {
            if !entity.active {
                continue;
            }
            let value = self.current_value(scope, entity.id, now).await?;
            valued.push(ValuedEntity { entity, value });
        }
        valued.sort_by(|a, b| b.value.total_cmp(&a.value));
        Ok(valued)
    }

    /// Accrual tick: reads current values first, then emits, then sums
    /// the two so a concurrent reader never sees the new emission twice.
    pub async fn updated_values(
        &self,
        scope: &ScopeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ValuedEntity>, AccrualError> {
        let mut valued = self.current_values(scope, now).await?;
        let emitted = self.emit(scope, now).await?;
        for entry in valued.iter_mut() {
            if let Some(event) = emitted.iter().find(|e| e.entity == entry.entity.id) {
                entry.value += event.amount;
            }
        }
        valued.sort_by(|a, b| b.value.total_cmp(&a.value));
        Ok(valued)
    }

    async fn active_count(
        &self,
        scope: &ScopeId,
        now: DateTime<Utc>,
    ) -> Result<usize, AccrualError> {
        let roster = self.store.list_participants(scope).await?;
        Ok(roster.iter().filter(|p| p.is_active(now)).count())
    }

    /// Active participants not currently on a declared break.
    pub async fn eligible_count(
        &self,
        scope: &ScopeId,
        now: DateTime<Utc>,
    ) -> Result<usize, AccrualError> {
        let roster = self.store.list_participants(scope).await?;
        let breaks = self.store.list_breaks(scope).await?;
        Ok(roster
            .iter()
            .filter(|p| p.is_active(now))
            .filter(|p| {
                !breaks
                    .iter()
                    .any(|b| b.participant == p.id && b.start <= now && b.end > now)
            })
            .count())
    }

    /// Share of the month containing `at` the participant was present
    /// for, at day granularity. Declared breaks and the pre-activation
    /// stretch of the joining month count as absent.
    pub async fn active_fraction(
        &self,
        scope: &ScopeId,
        participant: &ParticipantId,
        at: DateTime<Utc>,
    ) -> Result<f64, AccrualError> {
        let window_start = month_start(at);
        let window_end = next_month_start(at);
        let days = days_in_month(at) as u32;

        let mut intervals: Vec<(DateTime<Utc>, DateTime<Utc>)> = self
            .store
            .list_breaks(scope)
            .await?
            .into_iter()
            .filter(|b| b.participant == *participant && b.start < window_end && b.end > window_start)
            .map(|b| (b.start, b.end))
            .collect();

        let roster = self.store.list_participants(scope).await?;
        match roster.iter().find(|p| p.id == *participant) {
            Some(p) => match p.activated_at {
                Some(activated) if activated > window_start => {
                    intervals.push((window_start, day_start(activated)));
                }
                Some(_) => {}
                None => return Ok(0.0),
            },
            None => return Ok(0.0),
        }

        // Day-index union as a bitmask; a break covers the consecutive
        // run of calendar days it touches, at its own time of day.
        let mut absent: u64 = 0;
        for (start, end) in intervals {
            let start = start.max(window_start);
            let end = end.min(window_end);
            if end <= start {
                continue;
            }
            let first = start.day0() as u64;
            let seconds = (end - start).num_seconds();
            let len = (seconds + 86_399) / 86_400;
            absent |= ((1u64 << len) - 1) << first;
        }

        let absent_days = absent.count_ones().min(days);
        Ok((days - absent_days) as f64 / days as f64)
    }
}
