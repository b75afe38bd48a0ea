use crate::error::CoreError;
use crate::observability;
use crate::poll::load_poll;
use crate::retry::with_retry;
use crate::AppState;
use chrono::{DateTime, Utc};
use tallyho_db::{votes, DbConn};
use tallyho_models::{Poll, SelectionSet, Toggle};

async fn poll_accepting_votes(
    conn: &mut DbConn,
    poll_id: i64,
    now: DateTime<Utc>,
) -> Result<Poll, CoreError> {
    let poll = load_poll(conn, poll_id).await?;
    if !poll.accepts_votes_at(now) {
        return Err(CoreError::PollNotOpen(poll_id));
    }
    Ok(poll)
}

/// Toggle one option for a participant and return the resulting set.
///
/// Selecting an option when the set is already at the poll's limit evicts the
/// oldest selection.
pub async fn toggle_selection(
    state: &AppState,
    poll_id: i64,
    participant_id: i64,
    option_index: u32,
) -> Result<SelectionSet, CoreError> {
    let selections = state
        .locks
        .votes
        .run(
            (poll_id, participant_id),
            with_retry(state.retry(), "toggle_selection", || {
                toggle_once(state, poll_id, participant_id, option_index)
            }),
        )
        .await?;
    observability::vote_recorded();
    Ok(selections)
}

async fn toggle_once(
    state: &AppState,
    poll_id: i64,
    participant_id: i64,
    option_index: u32,
) -> Result<SelectionSet, CoreError> {
    let now = Utc::now();
    let mut tx = tallyho_db::begin_write(&state.db).await?;
    let poll = poll_accepting_votes(&mut tx, poll_id, now).await?;
    if !poll.has_option(option_index) {
        return Err(CoreError::InvalidSelection(format!(
            "option {option_index} does not exist (poll has {} options)",
            poll.option_count()
        )));
    }

    let mut selections = votes::get_vote(&mut tx, poll_id, participant_id)
        .await?
        .map(|vote| vote.selections)
        .unwrap_or_default();
    match selections.toggle(option_index, poll.max_selections as usize) {
        Toggle::Added {
            evicted: Some(evicted),
        } => {
            tracing::debug!(poll_id, participant_id, option_index, evicted, "selection added, oldest evicted");
        }
        change => {
            tracing::debug!(poll_id, participant_id, option_index, ?change, "selection toggled");
        }
    }

    let vote = votes::upsert_vote(&mut tx, poll_id, participant_id, &selections, now).await?;
    tx.commit().await?;
    Ok(vote.selections)
}

/// Replace a participant's whole selection set. An empty slice clears it.
pub async fn replace_selections(
    state: &AppState,
    poll_id: i64,
    participant_id: i64,
    indices: &[u32],
) -> Result<SelectionSet, CoreError> {
    let selections = state
        .locks
        .votes
        .run(
            (poll_id, participant_id),
            with_retry(state.retry(), "replace_selections", || async {
                let now = Utc::now();
                let mut tx = tallyho_db::begin_write(&state.db).await?;
                let poll = poll_accepting_votes(&mut tx, poll_id, now).await?;
                let selections = SelectionSet::try_from_indices(
                    indices,
                    poll.option_count(),
                    poll.max_selections as usize,
                )?;
                let vote =
                    votes::upsert_vote(&mut tx, poll_id, participant_id, &selections, now).await?;
                tx.commit().await?;
                Ok::<_, CoreError>(vote.selections)
            }),
        )
        .await?;
    observability::vote_recorded();
    tracing::debug!(poll_id, participant_id, count = selections.len(), "selections replaced");
    Ok(selections)
}

/// A participant's current selections; empty when they never voted.
pub async fn get_selections(
    state: &AppState,
    poll_id: i64,
    participant_id: i64,
) -> Result<SelectionSet, CoreError> {
    with_retry(state.retry(), "get_selections", || async {
        let mut conn = state.db.acquire().await?;
        Ok::<_, CoreError>(votes::get_vote(&mut conn, poll_id, participant_id)
            .await?
            .map(|vote| vote.selections)
            .unwrap_or_default())
    })
    .await
}
