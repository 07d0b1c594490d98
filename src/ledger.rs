//! # Vote ledger
//!
//! Accepts votes and answers tally queries.
//!
//! A vote is one unit in the store (see [`PollStore::record_vote`]): the
//! dedup reservation, the vote row and both counter increments commit
//! together or not at all. Only after the commit does the ledger publish a
//! delta, so notification can never undo or fail a vote.
//!
//! Retrying after [`LedgerError::Transient`] is always safe. Either the
//! first attempt never committed and the retry is accepted, or it did and
//! the retry is rejected as a duplicate.
use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    error::LedgerError,
    guard::VoterIdentity,
    models::{Ballot, CastOutcome, Rejection, Tallies, TallyDelta},
    notifier::ChangeNotifier,
    store::{PollStore, VoteOutcome},
};

#[derive(Clone)]
pub struct VoteLedger {
    store: Arc<dyn PollStore>,
    notifier: ChangeNotifier,
}

impl VoteLedger {
    pub fn new(store: Arc<dyn PollStore>, notifier: ChangeNotifier) -> Self {
        Self { store, notifier }
    }

    pub fn notifier(&self) -> &ChangeNotifier {
        &self.notifier
    }

    pub async fn cast_vote(
        &self,
        poll_id: Uuid,
        option_id: Uuid,
        voter: &VoterIdentity,
    ) -> Result<CastOutcome, LedgerError> {
        let ballot = Ballot {
            poll_id,
            option_id,
            voter: voter.clone(),
        };

        let outcome = self.store.record_vote(&ballot).await.map_err(|err| {
            warn!(%poll_id, %option_id, "Vote not recorded: {err}");
            LedgerError::from(err)
        })?;

        match outcome {
            VoteOutcome::Recorded { vote, tallies } => {
                info!(%poll_id, %option_id, total = tallies.total, "Vote accepted");

                let delivered = self.notifier.publish(TallyDelta::from_vote(&vote, &tallies));
                if delivered > 0 {
                    info!(%poll_id, delivered, "Tally delta published");
                }

                Ok(CastOutcome::Accepted(tallies))
            }
            VoteOutcome::Duplicate => {
                info!(%poll_id, "Duplicate vote rejected");
                Ok(CastOutcome::Rejected(Rejection::DuplicateVote))
            }
            VoteOutcome::Closed => {
                info!(%poll_id, "Vote on closed poll rejected");
                Ok(CastOutcome::Rejected(Rejection::PollClosed))
            }
            VoteOutcome::UnknownPoll => Err(LedgerError::NotFound("poll", poll_id)),
            VoteOutcome::ForeignOption => Err(LedgerError::Validation(format!(
                "option {option_id} does not belong to poll {poll_id}"
            ))),
        }
    }

    /// Current tallies. A total that disagrees with the option counts is a
    /// data-integrity bug: it is logged and repaired from the vote log
    /// before anything is returned.
    pub async fn get_tallies(&self, poll_id: Uuid) -> Result<Tallies, LedgerError> {
        let tallies = self
            .store
            .fetch_tallies(poll_id)
            .await?
            .ok_or(LedgerError::NotFound("poll", poll_id))?;

        if tallies.is_consistent() {
            return Ok(tallies);
        }

        error!(
            %poll_id,
            total = tallies.total,
            option_sum = tallies.option_sum(),
            "ConsistencyViolation: poll total diverges from option counts, reconciling"
        );
        self.reconcile(poll_id).await
    }

    pub async fn reconcile(&self, poll_id: Uuid) -> Result<Tallies, LedgerError> {
        let tallies = self
            .store
            .rebuild_tallies(poll_id)
            .await?
            .ok_or(LedgerError::NotFound("poll", poll_id))?;

        if !tallies.is_consistent() {
            return Err(LedgerError::Internal(format!(
                "poll {poll_id} still inconsistent after reconciliation"
            )));
        }

        info!(%poll_id, total = tallies.total, "Tallies reconciled from vote log");
        Ok(tallies)
    }

    /// Server-side answer to the client's "already voted" hint.
    pub async fn has_voted(&self, poll_id: Uuid, voter: &VoterIdentity) -> Result<bool, LedgerError> {
        Ok(self.store.has_voted(poll_id, voter).await?)
    }
}
