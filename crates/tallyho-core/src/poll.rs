use crate::error::CoreError;
use crate::leaderboard;
use crate::observability::{self, CloseSource};
use crate::retry::with_retry;
use crate::scoring;
use crate::AppState;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tallyho_db::polls::{self, NewPoll};
use tallyho_db::{votes, DbConn};
use tallyho_models::{LeaderboardEntry, PointAward, Poll, PollResults, PollState, SelectionSet};

pub const MIN_POLL_OPTIONS: usize = 2;
pub const MAX_POLL_OPTIONS: usize = 25;

/// Input for a new poll. Text fields are trimmed before validation.
#[derive(Debug, Clone)]
pub struct CreatePoll {
    pub guild_id: i64,
    pub category: String,
    pub question: String,
    pub description: Option<String>,
    pub creator_id: i64,
    pub options: Vec<String>,
    pub max_selections: u32,
    pub duration: Duration,
    pub show_votes_while_active: bool,
}

impl CreatePoll {
    fn normalized(self) -> Result<Self, CoreError> {
        let category = self.category.trim().to_string();
        if category.is_empty() {
            return Err(CoreError::Validation("category must not be empty".into()));
        }
        let question = self.question.trim().to_string();
        if question.is_empty() {
            return Err(CoreError::Validation("question must not be empty".into()));
        }
        let options: Vec<String> = self.options.iter().map(|o| o.trim().to_string()).collect();
        if options.len() < MIN_POLL_OPTIONS || options.len() > MAX_POLL_OPTIONS {
            return Err(CoreError::Validation(format!(
                "a poll needs between {MIN_POLL_OPTIONS} and {MAX_POLL_OPTIONS} options, got {}",
                options.len()
            )));
        }
        if let Some(pos) = options.iter().position(|o| o.is_empty()) {
            return Err(CoreError::Validation(format!("option {pos} has no text")));
        }
        if self.max_selections < 1 || self.max_selections as usize > options.len() {
            return Err(CoreError::Validation(format!(
                "max_selections must be between 1 and {}, got {}",
                options.len(),
                self.max_selections
            )));
        }
        if self.duration <= Duration::zero() {
            return Err(CoreError::Validation("duration must be positive".into()));
        }
        let description = self
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty());

        Ok(Self {
            category,
            question,
            description,
            options,
            ..self
        })
    }
}

/// Result of revealing a poll: the revealed poll, the points each voter was
/// awarded, and the scope's leaderboard after the awards were applied.
#[derive(Debug, Clone, Serialize)]
pub struct RevealOutcome {
    pub poll: Poll,
    pub awards: Vec<PointAward>,
    pub leaderboard: Vec<LeaderboardEntry>,
}

pub(crate) async fn load_poll(conn: &mut DbConn, poll_id: i64) -> Result<Poll, CoreError> {
    polls::get_poll(conn, poll_id)
        .await?
        .ok_or(CoreError::PollNotFound(poll_id))
}

pub async fn create_poll(state: &AppState, request: CreatePoll) -> Result<Poll, CoreError> {
    let request = request.normalized()?;
    let poll = with_retry(state.retry(), "create_poll", || create_poll_once(state, &request)).await?;
    observability::poll_created();
    tracing::info!(
        poll_id = poll.id,
        guild_id = poll.guild_id,
        category = %poll.category,
        end_time = %poll.end_time,
        "poll created"
    );
    Ok(poll)
}

async fn create_poll_once(state: &AppState, request: &CreatePoll) -> Result<Poll, CoreError> {
    let now = Utc::now();
    let end_time = now
        .checked_add_signed(request.duration)
        .ok_or_else(|| CoreError::Validation("duration is too long".into()))?;
    let already_open = || {
        CoreError::Validation(format!(
            "an open poll already exists for category '{}'",
            request.category
        ))
    };

    let mut tx = tallyho_db::begin_write(&state.db).await?;
    if polls::find_open_poll(&mut *tx, request.guild_id, &request.category)
        .await?
        .is_some()
    {
        return Err(already_open());
    }
    let inserted = polls::insert_poll(
        &mut *tx,
        &NewPoll {
            guild_id: request.guild_id,
            category: &request.category,
            question: &request.question,
            description: request.description.as_deref(),
            creator_id: request.creator_id,
            options: &request.options,
            max_selections: request.max_selections,
            end_time,
            created_at: now,
            show_votes_while_active: request.show_votes_while_active,
        },
    )
    .await;
    let poll = match inserted {
        Ok(poll) => poll,
        Err(err) if err.is_unique_violation() => return Err(already_open()),
        Err(err) => return Err(err.into()),
    };
    tx.commit().await?;
    Ok(poll)
}

pub async fn get_poll(state: &AppState, poll_id: i64) -> Result<Poll, CoreError> {
    with_retry(state.retry(), "get_poll", || async {
        let mut conn = state.db.acquire().await?;
        load_poll(&mut conn, poll_id).await
    })
    .await
}

pub async fn find_open_poll(
    state: &AppState,
    guild_id: i64,
    category: &str,
) -> Result<Option<Poll>, CoreError> {
    with_retry(state.retry(), "find_open_poll", || async {
        let mut conn = state.db.acquire().await?;
        Ok::<_, CoreError>(polls::find_open_poll(&mut conn, guild_id, category).await?)
    })
    .await
}

pub async fn find_latest_poll(
    state: &AppState,
    guild_id: i64,
    category: &str,
    include_closed: bool,
) -> Result<Option<Poll>, CoreError> {
    with_retry(state.retry(), "find_latest_poll", || async {
        let mut conn = state.db.acquire().await?;
        Ok::<_, CoreError>(polls::find_latest_poll(&mut conn, guild_id, category, include_closed).await?)
    })
    .await
}

pub async fn list_open_polls(state: &AppState) -> Result<Vec<Poll>, CoreError> {
    with_retry(state.retry(), "list_open_polls", || async {
        let mut conn = state.db.acquire().await?;
        Ok::<_, CoreError>(polls::list_open_polls(&mut conn).await?)
    })
    .await
}

/// Administratively close an open poll. Closing a poll that is already closed
/// or revealed is a no-op that returns the poll unchanged.
pub async fn close_poll(state: &AppState, poll_id: i64) -> Result<Poll, CoreError> {
    let (poll, _) = close_poll_at(state, poll_id, Utc::now(), CloseSource::Admin).await?;
    Ok(poll)
}

/// Returns the poll and whether this call performed the transition.
pub(crate) async fn close_poll_at(
    state: &AppState,
    poll_id: i64,
    now: DateTime<Utc>,
    source: CloseSource,
) -> Result<(Poll, bool), CoreError> {
    let (poll, closed) =
        with_retry(state.retry(), "close_poll", || close_once(state, poll_id, now)).await?;
    if closed {
        observability::poll_closed(source);
        tracing::info!(poll_id, ?source, "poll closed");
    }
    Ok((poll, closed))
}

async fn close_once(
    state: &AppState,
    poll_id: i64,
    now: DateTime<Utc>,
) -> Result<(Poll, bool), CoreError> {
    let mut tx = tallyho_db::begin_write(&state.db).await?;
    let poll = load_poll(&mut tx, poll_id).await?;
    if !poll.state.can_transition_to(PollState::Closed) {
        return Ok((poll, false));
    }
    let closed = polls::mark_closed(&mut tx, poll_id, now).await?;
    let poll = load_poll(&mut tx, poll_id).await?;
    tx.commit().await?;
    Ok((poll, closed))
}

/// Change the end time of an open poll. The new end must fall after the
/// poll's creation; it may lie in the past, in which case the next sweep
/// closes the poll.
pub async fn set_end_time(
    state: &AppState,
    poll_id: i64,
    end_time: DateTime<Utc>,
) -> Result<Poll, CoreError> {
    let poll = with_retry(state.retry(), "set_end_time", || async {
        let mut tx = tallyho_db::begin_write(&state.db).await?;
        let poll = load_poll(&mut tx, poll_id).await?;
        if !poll.is_open() {
            return Err(CoreError::PollNotOpen(poll_id));
        }
        if end_time <= poll.created_at {
            return Err(CoreError::Validation(
                "end time must be after the poll was created".into(),
            ));
        }
        if !polls::update_end_time(&mut tx, poll_id, end_time).await? {
            return Err(CoreError::PollNotOpen(poll_id));
        }
        let poll = load_poll(&mut tx, poll_id).await?;
        tx.commit().await?;
        Ok::<_, CoreError>(poll)
    })
    .await?;
    tracing::info!(poll_id, end_time = %poll.end_time, "poll end time changed");
    Ok(poll)
}

/// Reveal the correct answers of a closed poll and award points.
pub async fn reveal_poll(
    state: &AppState,
    poll_id: i64,
    correct_answers: &[u32],
) -> Result<RevealOutcome, CoreError> {
    reveal(state, poll_id, correct_answers, false).await
}

/// Like [`reveal_poll`], but an open poll is closed first in the same
/// transaction.
pub async fn close_and_reveal_poll(
    state: &AppState,
    poll_id: i64,
    correct_answers: &[u32],
) -> Result<RevealOutcome, CoreError> {
    reveal(state, poll_id, correct_answers, true).await
}

async fn reveal(
    state: &AppState,
    poll_id: i64,
    correct_answers: &[u32],
    close_if_open: bool,
) -> Result<RevealOutcome, CoreError> {
    // A poll's scope never changes, so it is safe to read it before locking.
    let scope = get_poll(state, poll_id).await?;
    let key = (scope.guild_id, scope.category.clone());

    let outcome = state
        .locks
        .scopes
        .run(
            key,
            with_retry(state.retry(), "reveal_poll", || {
                reveal_once(state, poll_id, correct_answers, close_if_open)
            }),
        )
        .await?;

    observability::poll_revealed();
    tracing::info!(
        poll_id,
        guild_id = outcome.poll.guild_id,
        category = %outcome.poll.category,
        awarded = outcome.awards.iter().filter(|a| a.points > 0).count(),
        "poll revealed"
    );
    Ok(outcome)
}

async fn reveal_once(
    state: &AppState,
    poll_id: i64,
    correct_answers: &[u32],
    close_if_open: bool,
) -> Result<RevealOutcome, CoreError> {
    let now = Utc::now();
    let mut tx = tallyho_db::begin_write(&state.db).await?;
    let poll = load_poll(&mut tx, poll_id).await?;
    if poll.state == PollState::Revealed {
        return Err(CoreError::PollAlreadyRevealed(poll_id));
    }
    let mut current = poll.state;
    if current.can_transition_to(PollState::Closed) {
        if !close_if_open {
            return Err(CoreError::PollNotClosed(poll_id));
        }
        polls::mark_closed(&mut tx, poll_id, now).await?;
        current = PollState::Closed;
    }
    if !current.can_transition_to(PollState::Revealed) {
        return Err(CoreError::PollNotClosed(poll_id));
    }

    let correct = SelectionSet::try_from_indices(correct_answers, poll.option_count(), poll.option_count())
        .map_err(|e| CoreError::Validation(format!("invalid correct answers: {e}")))?;
    if !polls::mark_revealed(&mut tx, poll_id, correct.as_slice()).await? {
        return Err(CoreError::PollAlreadyRevealed(poll_id));
    }

    let poll = load_poll(&mut tx, poll_id).await?;
    let awards = scoring::compute_points_for(&mut tx, &poll).await?;
    let leaderboard =
        leaderboard::apply_point_deltas_in(&mut tx, poll.guild_id, &poll.category, &awards, now)
            .await?;
    tx.commit().await?;

    Ok(RevealOutcome {
        poll,
        awards,
        leaderboard,
    })
}

/// Vote tallies for a poll. Per-option counts stay hidden while the poll is
/// open unless the poll was created to show them; correct answers appear
/// only once revealed.
pub async fn poll_results(state: &AppState, poll_id: i64) -> Result<PollResults, CoreError> {
    with_retry(state.retry(), "poll_results", || async {
        let mut conn = state.db.acquire().await?;
        let poll = load_poll(&mut conn, poll_id).await?;
        let votes = votes::list_votes(&mut conn, poll_id).await?;

        let mut counts = vec![0u64; poll.option_count()];
        let mut total_votes = 0u64;
        for vote in &votes {
            if vote.selections.is_empty() {
                continue;
            }
            total_votes += 1;
            for index in vote.selections.iter() {
                if let Some(count) = counts.get_mut(index as usize) {
                    *count += 1;
                }
            }
        }

        let counts_visible = !poll.is_open() || poll.show_votes_while_active;
        Ok::<_, CoreError>(PollResults {
            poll_id,
            state: poll.state,
            total_votes,
            votes_per_option: counts_visible.then_some(counts),
            correct_answers: if poll.is_revealed() {
                poll.correct_answers.clone()
            } else {
                None
            },
        })
    })
    .await
}
