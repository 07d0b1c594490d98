//! Poll and option registry.
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::{
    error::LedgerError,
    models::{Poll, PollDraft, PollPage},
    notifier::ChangeNotifier,
    store::{PollCursor, PollStore},
};

pub const MIN_OPTIONS: usize = 2;
pub const MAX_OPTIONS: usize = 6;
pub const TITLE_MIN_CHARS: usize = 5;
pub const TITLE_MAX_CHARS: usize = 100;
pub const DESCRIPTION_MAX_CHARS: usize = 500;
pub const OPTION_MAX_CHARS: usize = 200;
pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct NewPoll {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub options: Vec<String>,
    #[serde(default, alias = "creatorEmail")]
    pub creator_email: Option<String>,
}

impl NewPoll {
    /// Trims every field, drops blank options and checks the limits.
    pub fn validate(self) -> Result<PollDraft, LedgerError> {
        let title = self.title.trim().to_string();
        let title_chars = title.chars().count();
        if !(TITLE_MIN_CHARS..=TITLE_MAX_CHARS).contains(&title_chars) {
            return Err(LedgerError::validation(format!(
                "title must be between {TITLE_MIN_CHARS} and {TITLE_MAX_CHARS} characters"
            )));
        }

        let description = non_blank(self.description);
        if description
            .as_ref()
            .is_some_and(|text| text.chars().count() > DESCRIPTION_MAX_CHARS)
        {
            return Err(LedgerError::validation(format!(
                "description must be at most {DESCRIPTION_MAX_CHARS} characters"
            )));
        }

        let creator_email = non_blank(self.creator_email);
        if creator_email
            .as_deref()
            .is_some_and(|email| !looks_like_email(email))
        {
            return Err(LedgerError::validation("creator email is not a valid address"));
        }

        let options: Vec<String> = self
            .options
            .into_iter()
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .collect();

        if !(MIN_OPTIONS..=MAX_OPTIONS).contains(&options.len()) {
            return Err(LedgerError::validation(format!(
                "a poll needs between {MIN_OPTIONS} and {MAX_OPTIONS} non-empty options, got {}",
                options.len()
            )));
        }
        if options
            .iter()
            .any(|text| text.chars().count() > OPTION_MAX_CHARS)
        {
            return Err(LedgerError::validation(format!(
                "options must be at most {OPTION_MAX_CHARS} characters"
            )));
        }

        Ok(PollDraft {
            title,
            description,
            creator_email,
            options,
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn looks_like_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };

    !local.is_empty()
        && !email.chars().any(char::is_whitespace)
        && !domain.contains('@')
        && domain.split('.').count() >= 2
        && domain.split('.').all(|label| !label.is_empty())
}

#[derive(Clone)]
pub struct Registry {
    store: Arc<dyn PollStore>,
    notifier: ChangeNotifier,
}

impl Registry {
    pub fn new(store: Arc<dyn PollStore>, notifier: ChangeNotifier) -> Self {
        Self { store, notifier }
    }

    pub async fn create_poll(&self, request: NewPoll) -> Result<Poll, LedgerError> {
        let draft = request.validate()?;
        let poll = self.store.insert_poll(&draft).await?;

        info!(poll_id = %poll.id, options = poll.options.len(), "Poll created");
        Ok(poll)
    }

    pub async fn get_poll(&self, id: Uuid) -> Result<Poll, LedgerError> {
        self.store
            .fetch_poll(id)
            .await?
            .ok_or(LedgerError::NotFound("poll", id))
    }

    /// Pager over active polls, newest first.
    pub fn active_polls(&self, page_size: usize) -> ActivePolls {
        ActivePolls::new(self.store.clone(), None, page_size)
    }

    /// One page of the active listing, resumed from an encoded cursor.
    pub async fn list_active(
        &self,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<PollPage, LedgerError> {
        let after = cursor
            .map(|raw| {
                PollCursor::decode(raw).ok_or_else(|| LedgerError::validation("invalid cursor"))
            })
            .transpose()?;
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE);
        if !(1..=MAX_PAGE_SIZE).contains(&limit) {
            return Err(LedgerError::validation(format!(
                "limit must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        let mut pager = ActivePolls::new(self.store.clone(), after, limit);
        let polls = pager.next_page().await?.unwrap_or_default();

        Ok(PollPage {
            next_cursor: pager.cursor(),
            polls,
        })
    }

    /// Soft delete: the poll stays readable but accepts no more votes.
    pub async fn close_poll(&self, id: Uuid) -> Result<Poll, LedgerError> {
        let poll = self
            .store
            .deactivate_poll(id)
            .await?
            .ok_or(LedgerError::NotFound("poll", id))?;

        info!(poll_id = %id, "Poll closed");
        Ok(poll)
    }

    pub async fn delete_poll(&self, id: Uuid) -> Result<(), LedgerError> {
        if !self.store.remove_poll(id).await? {
            return Err(LedgerError::NotFound("poll", id));
        }

        self.notifier.close(id);
        info!(poll_id = %id, "Poll deleted");
        Ok(())
    }
}

/// Lazy, finite and restartable walk over the active polls.
pub struct ActivePolls {
    store: Arc<dyn PollStore>,
    after: Option<PollCursor>,
    page_size: usize,
    exhausted: bool,
}

impl ActivePolls {
    pub fn new(store: Arc<dyn PollStore>, after: Option<PollCursor>, page_size: usize) -> Self {
        Self {
            store,
            after,
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
            exhausted: false,
        }
    }

    pub async fn next_page(&mut self) -> Result<Option<Vec<Poll>>, LedgerError> {
        if self.exhausted {
            return Ok(None);
        }

        let page = self
            .store
            .fetch_active_page(self.after, self.page_size)
            .await?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.after = Some(PollCursor::after(last));
        }

        if page.is_empty() {
            Ok(None)
        } else {
            Ok(Some(page))
        }
    }

    /// Where a new pager should resume, `None` once the walk is complete.
    pub fn cursor(&self) -> Option<String> {
        if self.exhausted {
            None
        } else {
            self.after.map(|cursor| cursor.encode())
        }
    }
}
