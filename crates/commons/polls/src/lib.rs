//! Time-windowed quorum votes.
//!
//! A poll is an immutable `[start, end]` window. Ballots are upserted by
//! `(poll, voter_hash)` so revoting replaces rather than stacks, and only
//! ballots submitted within the window count toward the tally. Voters are
//! stored as salted blake3 digests; the raw participant id never lands in
//! the vote table.

#![deny(unsafe_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use commons_storage::{PollStore, StorageError};
use commons_types::{ParticipantId, Poll, PollId, ScopeId, Vote, VoteChoice, VoteTally};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollConfig {
    /// Salt mixed into voter digests. Injected per deployment; rotating it
    /// unlinks all historical ballots.
    pub voter_salt: String,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            voter_salt: "commons-poll-salt".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("poll {poll} closed at {end}")]
    PollClosed { poll: PollId, end: DateTime<Utc> },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct PollEngine {
    store: Arc<dyn PollStore>,
    config: PollConfig,
}

impl PollEngine {
    pub fn new(store: Arc<dyn PollStore>, config: PollConfig) -> Self {
        Self { store, config }
    }

    /// Salted digest standing in for the participant in vote records.
    pub fn voter_hash(&self, participant: &ParticipantId) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.config.voter_salt.as_bytes());
        hasher.update(b":");
        hasher.update(participant.0.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    pub async fn create_poll(
        &self,
        scope: ScopeId,
        start: DateTime<Utc>,
        duration: Duration,
    ) -> Result<Poll, PollError> {
        let poll = Poll {
            id: PollId::generate(),
            scope,
            start,
            end: start + duration,
        };
        self.store.insert_poll(poll.clone()).await?;
        debug!(poll = %poll.id, start = %poll.start, end = %poll.end, "poll created");
        Ok(poll)
    }

    /// Records or replaces the participant's ballot. Late submissions fail
    /// `PollClosed`; early ones are accepted but a ballot only counts if
    /// its final submission time falls inside the window.
    pub async fn submit_vote(
        &self,
        poll_id: PollId,
        participant: &ParticipantId,
        choice: VoteChoice,
        submitted_at: DateTime<Utc>,
    ) -> Result<(), PollError> {
        let poll = self.store.get_poll(poll_id).await?;
        if submitted_at > poll.end {
            return Err(PollError::PollClosed {
                poll: poll_id,
                end: poll.end,
            });
        }
        self.store
            .upsert_vote(Vote {
                poll: poll_id,
                voter_hash: self.voter_hash(participant),
                choice,
                submitted_at,
            })
            .await?;
        Ok(())
    }

    /// Tallies distinct in-window ballots.
    pub async fn result_counts(&self, poll_id: PollId) -> Result<VoteTally, PollError> {
        let poll = self.store.get_poll(poll_id).await?;
        let votes = self.store.list_votes(poll_id).await?;
        let mut tally = VoteTally::default();
        for vote in votes {
            if vote.submitted_at < poll.start || vote.submitted_at > poll.end {
                continue;
            }
            match vote.choice {
                VoteChoice::Yay => tally.yays += 1,
                VoteChoice::Nay => tally.nays += 1,
            }
        }
        Ok(tally)
    }

    pub async fn get_poll(&self, poll_id: PollId) -> Result<Poll, PollError> {
        Ok(self.store.get_poll(poll_id).await?)
    }
}
