// models.rs
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::guard::VoterIdentity;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Poll {
    pub id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub creator_email: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    pub total_votes: i64,
    pub options: Vec<PollOption>,
}

impl Poll {
    pub fn tallies(&self) -> Tallies {
        Tallies::new(
            self.id,
            self.options.iter().map(|option| (option.id, option.vote_count)),
            self.total_votes,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PollOption {
    pub id: Uuid,
    pub poll_id: Uuid,
    pub option_text: String,
    pub position: i32,
    pub vote_count: i64,
}

/// A recorded ballot. Never mutated after insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Vote {
    pub id: Uuid,
    pub poll_id: Uuid,
    pub option_id: Uuid,
    pub voter_identity: String,
    pub created_at: DateTime<Utc>,
}

/// Poll contents that passed validation and are ready to be stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollDraft {
    pub title: String,
    pub description: Option<String>,
    pub creator_email: Option<String>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ballot {
    pub poll_id: Uuid,
    pub option_id: Uuid,
    pub voter: VoterIdentity,
}

#[derive(Debug, Deserialize)]
pub struct VoteRequest {
    pub poll_id: Uuid,
    pub option_id: Uuid,
}

/// Current vote counts for one poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tallies {
    pub poll_id: Uuid,
    pub counts: BTreeMap<Uuid, i64>,
    pub total: i64,
}

impl Tallies {
    pub fn new(poll_id: Uuid, counts: impl IntoIterator<Item = (Uuid, i64)>, total: i64) -> Self {
        Self {
            poll_id,
            counts: counts.into_iter().collect(),
            total,
        }
    }

    pub fn count_for(&self, option_id: Uuid) -> Option<i64> {
        self.counts.get(&option_id).copied()
    }

    pub fn option_sum(&self) -> i64 {
        self.counts.values().sum()
    }

    /// The stored total must always equal the sum of the option counts.
    pub fn is_consistent(&self) -> bool {
        self.option_sum() == self.total
    }
}

/// New absolute counts after one accepted vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TallyDelta {
    pub poll_id: Uuid,
    pub option_id: Uuid,
    pub option_votes: i64,
    pub total_votes: i64,
    pub sequence: u64,
    pub at: DateTime<Utc>,
}

impl TallyDelta {
    pub fn from_vote(vote: &Vote, tallies: &Tallies) -> Self {
        Self {
            poll_id: vote.poll_id,
            option_id: vote.option_id,
            option_votes: tallies.count_for(vote.option_id).unwrap_or_default(),
            total_votes: tallies.total,
            sequence: 0,
            at: vote.created_at,
        }
    }
}

/// Terminal, expected refusals of a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Rejection {
    DuplicateVote,
    PollClosed,
}

impl Rejection {
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::DuplicateVote => "DuplicateVote",
            Rejection::PollClosed => "PollClosed",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Rejection::DuplicateVote => "You have already voted on this poll",
            Rejection::PollClosed => "This poll is no longer accepting votes",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CastOutcome {
    Accepted(Tallies),
    Rejected(Rejection),
}

impl CastOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CastOutcome::Accepted(_))
    }
}

#[derive(Debug, Serialize)]
pub struct PollPage {
    pub polls: Vec<Poll>,
    pub next_cursor: Option<String>,
}
