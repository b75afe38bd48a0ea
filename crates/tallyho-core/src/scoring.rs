use crate::error::CoreError;
use crate::poll::load_poll;
use crate::retry::with_retry;
use crate::AppState;
use tallyho_db::{votes, DbConn};
use tallyho_models::{PointAward, Poll, SelectionSet, Vote};

/// One point per selected option that is also correct. A vote is successful
/// when it earned at least one point.
pub fn score_selection(selection: &SelectionSet, correct: &SelectionSet) -> (i64, bool) {
    let points = selection.overlap(correct) as i64;
    (points, points > 0)
}

pub fn award_for(vote: &Vote, correct: &SelectionSet) -> PointAward {
    let (points, successful) = score_selection(&vote.selections, correct);
    PointAward {
        participant_id: vote.participant_id,
        points,
        successful,
    }
}

/// Awards for every voter on a revealed poll, ordered by participant.
pub async fn compute_points(state: &AppState, poll_id: i64) -> Result<Vec<PointAward>, CoreError> {
    with_retry(state.retry(), "compute_points", || async {
        let mut conn = state.db.acquire().await?;
        let poll = load_poll(&mut conn, poll_id).await?;
        compute_points_for(&mut conn, &poll).await
    })
    .await
}

pub(crate) async fn compute_points_for(
    conn: &mut DbConn,
    poll: &Poll,
) -> Result<Vec<PointAward>, CoreError> {
    if !poll.is_revealed() {
        return Err(CoreError::PollNotRevealed(poll.id));
    }
    let correct = poll.correct_set();
    let votes = votes::list_votes(conn, poll.id).await?;
    Ok(votes.iter().map(|vote| award_for(vote, &correct)).collect())
}
