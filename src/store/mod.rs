//! Tally store backends.
//!
//! Every backend runs a vote as one unit: poll lookup, option membership,
//! dedup reservation, vote append and both counter increments either all
//! happen or none do.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    guard::VoterIdentity,
    models::{Ballot, Poll, PollDraft, Tallies, Vote},
};

pub mod memory;
pub mod postgres;

#[cfg(test)]
pub use memory::Fault;
pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Error, Debug)]
pub enum StoreError {
    /// Safe to retry: the unit either did not commit or is protected by the
    /// uniqueness constraint.
    #[error("store unavailable: {0}")]
    Transient(String),

    #[error("store failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteOutcome {
    Recorded { vote: Vote, tallies: Tallies },
    Duplicate,
    Closed,
    UnknownPoll,
    ForeignOption,
}

/// Keyset position in the active poll listing, ordered newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollCursor {
    pub created_at: DateTime<Utc>,
    pub id: Uuid,
}

impl PollCursor {
    pub fn after(poll: &Poll) -> Self {
        Self {
            created_at: poll.created_at,
            id: poll.id,
        }
    }

    pub fn encode(&self) -> String {
        format!("{}.{}", self.created_at.timestamp_micros(), self.id)
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let (micros, id) = raw.split_once('.')?;
        let created_at = DateTime::from_timestamp_micros(micros.parse().ok()?)?;

        Some(Self {
            created_at,
            id: id.parse().ok()?,
        })
    }

    /// Whether `poll` sorts strictly after this cursor.
    pub fn precedes(&self, poll: &Poll) -> bool {
        (poll.created_at, poll.id) < (self.created_at, self.id)
    }
}

#[async_trait]
pub trait PollStore: Send + Sync + 'static {
    fn backend_tag(&self) -> &'static str {
        "unknown"
    }

    /// Stores the poll and all of its options in one unit.
    async fn insert_poll(&self, draft: &PollDraft) -> Result<Poll, StoreError>;
    async fn fetch_poll(&self, id: Uuid) -> Result<Option<Poll>, StoreError>;
    async fn fetch_active_page(
        &self,
        after: Option<PollCursor>,
        limit: usize,
    ) -> Result<Vec<Poll>, StoreError>;
    async fn deactivate_poll(&self, id: Uuid) -> Result<Option<Poll>, StoreError>;
    /// Removes the poll together with its options and votes.
    async fn remove_poll(&self, id: Uuid) -> Result<bool, StoreError>;

    async fn record_vote(&self, ballot: &Ballot) -> Result<VoteOutcome, StoreError>;
    async fn has_voted(&self, poll_id: Uuid, voter: &VoterIdentity) -> Result<bool, StoreError>;
    async fn fetch_tallies(&self, poll_id: Uuid) -> Result<Option<Tallies>, StoreError>;
    /// Recomputes every counter of the poll from its vote log.
    async fn rebuild_tallies(&self, poll_id: Uuid) -> Result<Option<Tallies>, StoreError>;
}
