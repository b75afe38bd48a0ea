use crate::{datetime_from_db_millis, datetime_to_db_millis, DbConn, DbError};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use tallyho_models::{SelectionSet, Vote};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct VoteRow {
    pub poll_id: i64,
    pub participant_id: i64,
    pub selections: Json<Vec<u32>>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<VoteRow> for Vote {
    type Error = DbError;

    fn try_from(row: VoteRow) -> Result<Self, Self::Error> {
        let Json(selections) = row.selections;
        Ok(Vote {
            poll_id: row.poll_id,
            participant_id: row.participant_id,
            selections: SelectionSet::from_unordered(&selections),
            created_at: datetime_from_db_millis(row.created_at)?,
            updated_at: datetime_from_db_millis(row.updated_at)?,
        })
    }
}

pub async fn get_vote(
    conn: &mut DbConn,
    poll_id: i64,
    participant_id: i64,
) -> Result<Option<Vote>, DbError> {
    let row = sqlx::query_as::<_, VoteRow>(
        "SELECT poll_id, participant_id, selections, created_at, updated_at
         FROM votes WHERE poll_id = ?1 AND participant_id = ?2",
    )
    .bind(poll_id)
    .bind(participant_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(Vote::try_from).transpose()
}

/// Store the participant's full selection set, creating the row on first use.
pub async fn upsert_vote(
    conn: &mut DbConn,
    poll_id: i64,
    participant_id: i64,
    selections: &SelectionSet,
    now: DateTime<Utc>,
) -> Result<Vote, DbError> {
    let now = datetime_to_db_millis(now);
    let row = sqlx::query_as::<_, VoteRow>(
        "INSERT INTO votes (poll_id, participant_id, selections, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)
         ON CONFLICT (poll_id, participant_id)
         DO UPDATE SET selections = excluded.selections, updated_at = excluded.updated_at
         RETURNING poll_id, participant_id, selections, created_at, updated_at",
    )
    .bind(poll_id)
    .bind(participant_id)
    .bind(Json(selections.as_slice()))
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Vote::try_from(row)
}

/// Every vote row on a poll, ordered by participant.
pub async fn list_votes(conn: &mut DbConn, poll_id: i64) -> Result<Vec<Vote>, DbError> {
    let rows = sqlx::query_as::<_, VoteRow>(
        "SELECT poll_id, participant_id, selections, created_at, updated_at
         FROM votes WHERE poll_id = ?1
         ORDER BY participant_id ASC",
    )
    .bind(poll_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(Vote::try_from).collect()
}
