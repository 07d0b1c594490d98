// src/store/postgres.rs
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Postgres, Transaction};
use uuid::Uuid;

use super::{PollCursor, PollStore, StoreError, VoteOutcome};
use crate::{
    guard::{Reservation, VoterIdentity},
    models::{Ballot, Poll, PollDraft, PollOption, Tallies, Vote},
};

const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const ADMIN_SHUTDOWN: &str = "57P01";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        let transient = match &err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => true,
            sqlx::Error::Database(db) => matches!(
                db.code().as_deref(),
                Some(SERIALIZATION_FAILURE | DEADLOCK_DETECTED | ADMIN_SHUTDOWN)
            ),
            _ => false,
        };

        if transient {
            StoreError::Transient(err.to_string())
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PollRow {
    id: Uuid,
    title: String,
    description: Option<String>,
    creator_email: Option<String>,
    created_at: DateTime<Utc>,
    is_active: bool,
    total_votes: i64,
}

impl PollRow {
    fn into_poll(self, options: Vec<PollOption>) -> Poll {
        Poll {
            id: self.id,
            title: self.title,
            description: self.description,
            creator_email: self.creator_email,
            created_at: self.created_at,
            is_active: self.is_active,
            total_votes: self.total_votes,
            options,
        }
    }
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Read-only transaction seeing one consistent snapshot, so a poll and
    /// its options are never read from different commits.
    async fn snapshot(&self) -> Result<Transaction<'_, Postgres>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

/// Inserts the vote unless the voter already holds a reservation on the
/// poll. The `votes_one_per_voter` constraint makes this race free.
async fn check_and_reserve(conn: &mut PgConnection, vote: &Vote) -> Result<Reservation, sqlx::Error> {
    let inserted: Option<Uuid> = sqlx::query_scalar(
        r#"
        INSERT INTO votes (id, poll_id, option_id, voter_identity, created_at)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (poll_id, voter_identity) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(vote.id)
    .bind(vote.poll_id)
    .bind(vote.option_id)
    .bind(&vote.voter_identity)
    .bind(vote.created_at)
    .fetch_optional(conn)
    .await?;

    Ok(match inserted {
        Some(_) => Reservation::Granted,
        None => Reservation::AlreadyVoted,
    })
}

// Single statement, single snapshot: the total and the option counts agree.
async fn tallies_in(conn: &mut PgConnection, poll_id: Uuid) -> Result<Option<Tallies>, sqlx::Error> {
    let rows: Vec<(i64, Uuid, i64)> = sqlx::query_as(
        r#"
        SELECT p.total_votes, o.id, o.vote_count
        FROM polls p
        JOIN poll_options o ON o.poll_id = p.id
        WHERE p.id = $1
        "#,
    )
    .bind(poll_id)
    .fetch_all(conn)
    .await?;

    let Some(&(total, _, _)) = rows.first() else {
        return Ok(None);
    };

    Ok(Some(Tallies::new(
        poll_id,
        rows.into_iter().map(|(_, option_id, count)| (option_id, count)),
        total,
    )))
}

async fn options_of(conn: &mut PgConnection, poll_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<PollOption>>, sqlx::Error> {
    let options: Vec<PollOption> = sqlx::query_as(
        r#"
        SELECT id, poll_id, option_text, position, vote_count
        FROM poll_options
        WHERE poll_id = ANY($1)
        ORDER BY poll_id, position
        "#,
    )
    .bind(poll_ids)
    .fetch_all(conn)
    .await?;

    let mut grouped: HashMap<Uuid, Vec<PollOption>> = HashMap::new();
    for option in options {
        grouped.entry(option.poll_id).or_default().push(option);
    }

    Ok(grouped)
}

#[async_trait]
impl PollStore for PgStore {
    fn backend_tag(&self) -> &'static str {
        "postgres"
    }

    async fn insert_poll(&self, draft: &PollDraft) -> Result<Poll, StoreError> {
        let mut tx = self.pool.begin().await?;
        let poll_id = Uuid::new_v4();

        let row: PollRow = sqlx::query_as(
            r#"
            INSERT INTO polls (id, title, description, creator_email, created_at, is_active, total_votes)
            VALUES ($1, $2, $3, $4, $5, TRUE, 0)
            RETURNING id, title, description, creator_email, created_at, is_active, total_votes
            "#,
        )
        .bind(poll_id)
        .bind(&draft.title)
        .bind(&draft.description)
        .bind(&draft.creator_email)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        let mut options = Vec::with_capacity(draft.options.len());
        for (position, text) in draft.options.iter().enumerate() {
            let option: PollOption = sqlx::query_as(
                r#"
                INSERT INTO poll_options (id, poll_id, option_text, position, vote_count)
                VALUES ($1, $2, $3, $4, 0)
                RETURNING id, poll_id, option_text, position, vote_count
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(poll_id)
            .bind(text)
            .bind(position as i32)
            .fetch_one(&mut *tx)
            .await?;

            options.push(option);
        }

        tx.commit().await?;

        Ok(row.into_poll(options))
    }

    async fn fetch_poll(&self, id: Uuid) -> Result<Option<Poll>, StoreError> {
        let mut tx = self.snapshot().await?;

        let row: Option<PollRow> = sqlx::query_as(
            r#"
            SELECT id, title, description, creator_email, created_at, is_active, total_votes
            FROM polls
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let mut options = options_of(&mut tx, &[id]).await?;
        tx.commit().await?;

        Ok(Some(row.into_poll(options.remove(&id).unwrap_or_default())))
    }

    async fn fetch_active_page(
        &self,
        after: Option<PollCursor>,
        limit: usize,
    ) -> Result<Vec<Poll>, StoreError> {
        let mut tx = self.snapshot().await?;

        let rows: Vec<PollRow> = sqlx::query_as(
            r#"
            SELECT id, title, description, creator_email, created_at, is_active, total_votes
            FROM polls
            WHERE is_active
              AND ($1::timestamptz IS NULL OR (created_at, id) < ($1, $2))
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(after.map(|cursor| cursor.created_at))
        .bind(after.map(|cursor| cursor.id))
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let ids: Vec<Uuid> = rows.iter().map(|row| row.id).collect();
        let mut options = options_of(&mut tx, &ids).await?;
        tx.commit().await?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let poll_options = options.remove(&row.id).unwrap_or_default();
                row.into_poll(poll_options)
            })
            .collect())
    }

    async fn deactivate_poll(&self, id: Uuid) -> Result<Option<Poll>, StoreError> {
        let updated = sqlx::query("UPDATE polls SET is_active = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if updated.rows_affected() == 0 {
            return Ok(None);
        }

        self.fetch_poll(id).await
    }

    async fn remove_poll(&self, id: Uuid) -> Result<bool, StoreError> {
        // Options and votes go with it through ON DELETE CASCADE.
        let deleted = sqlx::query("DELETE FROM polls WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(deleted.rows_affected() > 0)
    }

    async fn record_vote(&self, ballot: &Ballot) -> Result<VoteOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        // The poll row is locked first, before any foreign key check touches
        // it. Close, delete and rebuild wait for this vote to commit.
        let active: Option<bool> =
            sqlx::query_scalar("SELECT is_active FROM polls WHERE id = $1 FOR NO KEY UPDATE")
                .bind(ballot.poll_id)
                .fetch_optional(&mut *tx)
                .await?;

        match active {
            None => return Ok(VoteOutcome::UnknownPoll),
            Some(false) => return Ok(VoteOutcome::Closed),
            Some(true) => {}
        }

        let owned: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM poll_options WHERE id = $1 AND poll_id = $2")
                .bind(ballot.option_id)
                .bind(ballot.poll_id)
                .fetch_optional(&mut *tx)
                .await?;

        if owned.is_none() {
            return Ok(VoteOutcome::ForeignOption);
        }

        let vote = Vote {
            id: Uuid::new_v4(),
            poll_id: ballot.poll_id,
            option_id: ballot.option_id,
            voter_identity: ballot.voter.to_string(),
            created_at: Utc::now(),
        };

        if check_and_reserve(&mut tx, &vote).await? == Reservation::AlreadyVoted {
            tx.rollback().await?;
            return Ok(VoteOutcome::Duplicate);
        }

        sqlx::query("UPDATE poll_options SET vote_count = vote_count + 1 WHERE id = $1")
            .bind(vote.option_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE polls SET total_votes = total_votes + 1 WHERE id = $1")
            .bind(vote.poll_id)
            .execute(&mut *tx)
            .await?;

        let tallies = tallies_in(&mut tx, vote.poll_id)
            .await?
            .ok_or_else(|| StoreError::Backend(format!("poll {} vanished mid-vote", vote.poll_id)))?;

        tx.commit().await?;

        Ok(VoteOutcome::Recorded { vote, tallies })
    }

    async fn has_voted(&self, poll_id: Uuid, voter: &VoterIdentity) -> Result<bool, StoreError> {
        let voted: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM votes WHERE poll_id = $1 AND voter_identity = $2)",
        )
        .bind(poll_id)
        .bind(voter.as_str())
        .fetch_one(&self.pool)
        .await?;

        Ok(voted)
    }

    async fn fetch_tallies(&self, poll_id: Uuid) -> Result<Option<Tallies>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(tallies_in(&mut conn, poll_id).await?)
    }

    async fn rebuild_tallies(&self, poll_id: Uuid) -> Result<Option<Tallies>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Same lock as record_vote, so no vote is half way through while the
        // counters are recomputed.
        let locked: Option<Uuid> =
            sqlx::query_scalar("SELECT id FROM polls WHERE id = $1 FOR NO KEY UPDATE")
                .bind(poll_id)
                .fetch_optional(&mut *tx)
                .await?;

        if locked.is_none() {
            return Ok(None);
        }

        sqlx::query(
            r#"
            UPDATE poll_options o
            SET vote_count = (SELECT COUNT(*) FROM votes v WHERE v.option_id = o.id AND v.poll_id = o.poll_id)
            WHERE o.poll_id = $1
            "#,
        )
        .bind(poll_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "UPDATE polls SET total_votes = (SELECT COUNT(*) FROM votes WHERE poll_id = $1) WHERE id = $1",
        )
        .bind(poll_id)
        .execute(&mut *tx)
        .await?;

        let tallies = tallies_in(&mut tx, poll_id).await?;
        tx.commit().await?;

        Ok(tallies)
    }
}
