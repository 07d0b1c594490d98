//! In-memory store.
//!
//! Each poll lives behind its own lock, so votes on different polls never
//! contend. The poll map lock is held only to look a poll up, insert it or
//! remove it.
#[cfg(test)]
use std::collections::VecDeque;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use uuid::Uuid;

use super::{PollCursor, PollStore, StoreError, VoteOutcome};
use crate::{
    guard::{Reservation, ReservationBook, VoterIdentity},
    models::{Ballot, Poll, PollDraft, PollOption, Tallies, Vote},
};

/// Failure injected into the next [`PollStore::record_vote`] call.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The store is unreachable; nothing is written.
    Unavailable,
    /// The vote commits but the acknowledgement is lost.
    LostAck,
}

#[derive(Debug)]
struct PollRecord {
    poll: Poll,
    reservations: ReservationBook,
    votes: Vec<Vote>,
    removed: bool,
}

#[derive(Default)]
pub struct MemoryStore {
    polls: RwLock<HashMap<Uuid, Arc<Mutex<PollRecord>>>>,
    #[cfg(test)]
    faults: Mutex<VecDeque<Fault>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn inject_fault(&self, fault: Fault) {
        lock(&self.faults).push_back(fault);
    }

    #[cfg(test)]
    pub(crate) fn vote_count(&self, poll_id: Uuid) -> usize {
        self.record(poll_id)
            .map(|record| {
                let record = lock(&record);
                record.votes.len()
            })
            .unwrap_or_default()
    }

    fn record(&self, id: Uuid) -> Option<Arc<Mutex<PollRecord>>> {
        self.polls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    #[cfg(test)]
    fn next_fault(&self) -> Option<Fault> {
        lock(&self.faults).pop_front()
    }

    #[cfg(test)]
    pub(crate) fn skew_total(&self, poll_id: Uuid, by: i64) {
        if let Some(record) = self.record(poll_id) {
            lock(&record).poll.total_votes += by;
        }
    }
}

#[async_trait]
impl PollStore for MemoryStore {
    fn backend_tag(&self) -> &'static str {
        "memory"
    }

    async fn insert_poll(&self, draft: &PollDraft) -> Result<Poll, StoreError> {
        let id = Uuid::new_v4();
        // Listing cursors carry microseconds, as Postgres timestamps do.
        let created_at = Utc::now().trunc_subsecs(6);
        let options = draft
            .options
            .iter()
            .enumerate()
            .map(|(position, text)| PollOption {
                id: Uuid::new_v4(),
                poll_id: id,
                option_text: text.clone(),
                position: position as i32,
                vote_count: 0,
            })
            .collect();

        let poll = Poll {
            id,
            title: draft.title.clone(),
            description: draft.description.clone(),
            creator_email: draft.creator_email.clone(),
            created_at,
            is_active: true,
            total_votes: 0,
            options,
        };

        let record = PollRecord {
            poll: poll.clone(),
            reservations: ReservationBook::default(),
            votes: Vec::new(),
            removed: false,
        };

        self.polls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(Mutex::new(record)));

        Ok(poll)
    }

    async fn fetch_poll(&self, id: Uuid) -> Result<Option<Poll>, StoreError> {
        Ok(self.record(id).map(|record| {
            let record = lock(&record);
            record.poll.clone()
        }))
    }

    async fn fetch_active_page(
        &self,
        after: Option<PollCursor>,
        limit: usize,
    ) -> Result<Vec<Poll>, StoreError> {
        let records: Vec<_> = self
            .polls
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut polls: Vec<Poll> = records
            .iter()
            .map(|record| lock(record).poll.clone())
            .filter(|poll| poll.is_active)
            .filter(|poll| after.map_or(true, |cursor| cursor.precedes(poll)))
            .collect();

        polls.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        polls.truncate(limit);

        Ok(polls)
    }

    async fn deactivate_poll(&self, id: Uuid) -> Result<Option<Poll>, StoreError> {
        Ok(self.record(id).map(|record| {
            let mut record = lock(&record);
            record.poll.is_active = false;
            record.poll.clone()
        }))
    }

    async fn remove_poll(&self, id: Uuid) -> Result<bool, StoreError> {
        let removed = self
            .polls
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);

        // A vote still holding the record must observe the removal.
        match removed {
            Some(record) => {
                lock(&record).removed = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_vote(&self, ballot: &Ballot) -> Result<VoteOutcome, StoreError> {
        #[cfg(test)]
        let fault = self.next_fault();
        #[cfg(test)]
        if fault == Some(Fault::Unavailable) {
            return Err(StoreError::Transient("injected: store unavailable".into()));
        }

        let Some(record) = self.record(ballot.poll_id) else {
            return Ok(VoteOutcome::UnknownPoll);
        };
        let mut record = lock(&record);

        if record.removed {
            return Ok(VoteOutcome::UnknownPoll);
        }
        if !record.poll.is_active {
            return Ok(VoteOutcome::Closed);
        }
        let Some(index) = record
            .poll
            .options
            .iter()
            .position(|option| option.id == ballot.option_id)
        else {
            return Ok(VoteOutcome::ForeignOption);
        };

        if record.reservations.check_and_reserve(&ballot.voter) == Reservation::AlreadyVoted {
            return Ok(VoteOutcome::Duplicate);
        }

        let vote = Vote {
            id: Uuid::new_v4(),
            poll_id: ballot.poll_id,
            option_id: ballot.option_id,
            voter_identity: ballot.voter.to_string(),
            created_at: Utc::now(),
        };
        record.votes.push(vote.clone());
        record.poll.options[index].vote_count += 1;
        record.poll.total_votes += 1;
        let tallies = record.poll.tallies();

        #[cfg(test)]
        if fault == Some(Fault::LostAck) {
            return Err(StoreError::Transient("injected: acknowledgement lost".into()));
        }

        Ok(VoteOutcome::Recorded { vote, tallies })
    }

    async fn has_voted(&self, poll_id: Uuid, voter: &VoterIdentity) -> Result<bool, StoreError> {
        Ok(self.record(poll_id).is_some_and(|record| {
            let record = lock(&record);
            record.reservations.contains(voter)
        }))
    }

    async fn fetch_tallies(&self, poll_id: Uuid) -> Result<Option<Tallies>, StoreError> {
        Ok(self.record(poll_id).map(|record| {
            let record = lock(&record);
            record.poll.tallies()
        }))
    }

    async fn rebuild_tallies(&self, poll_id: Uuid) -> Result<Option<Tallies>, StoreError> {
        Ok(self.record(poll_id).map(|record| {
            let mut guard = lock(&record);
            let PollRecord { poll, votes, .. } = &mut *guard;

            for option in poll.options.iter_mut() {
                option.vote_count = votes
                    .iter()
                    .filter(|vote| vote.option_id == option.id)
                    .count() as i64;
            }
            poll.total_votes = votes.len() as i64;

            poll.tallies()
        }))
    }
}
