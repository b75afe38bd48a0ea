use crate::{datetime_from_db_millis, datetime_to_db_millis, DbConn, DbError};
use chrono::{DateTime, Utc};
use tallyho_models::LeaderboardEntry;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LeaderboardRow {
    pub guild_id: i64,
    pub category: String,
    pub participant_id: i64,
    pub points: i64,
    pub total_successful: i64,
    pub rank: i64,
    pub last_updated: i64,
}

impl TryFrom<LeaderboardRow> for LeaderboardEntry {
    type Error = DbError;

    fn try_from(row: LeaderboardRow) -> Result<Self, Self::Error> {
        Ok(LeaderboardEntry {
            guild_id: row.guild_id,
            category: row.category,
            participant_id: row.participant_id,
            points: row.points,
            total_successful: row.total_successful,
            rank: row.rank,
            last_updated: datetime_from_db_millis(row.last_updated)?,
        })
    }
}

/// Every entry in a (guild, category) scope, in stored rank order.
pub async fn list_scope(
    conn: &mut DbConn,
    guild_id: i64,
    category: &str,
) -> Result<Vec<LeaderboardEntry>, DbError> {
    let rows = sqlx::query_as::<_, LeaderboardRow>(
        "SELECT guild_id, category, participant_id, points, total_successful, rank, last_updated
         FROM leaderboard_entries
         WHERE guild_id = ?1 AND category = ?2
         ORDER BY rank ASC, participant_id ASC",
    )
    .bind(guild_id)
    .bind(category)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(LeaderboardEntry::try_from).collect()
}

pub async fn top_entries(
    conn: &mut DbConn,
    guild_id: i64,
    category: &str,
    limit: i64,
) -> Result<Vec<LeaderboardEntry>, DbError> {
    let rows = sqlx::query_as::<_, LeaderboardRow>(
        "SELECT guild_id, category, participant_id, points, total_successful, rank, last_updated
         FROM leaderboard_entries
         WHERE guild_id = ?1 AND category = ?2
         ORDER BY rank ASC, participant_id ASC
         LIMIT ?3",
    )
    .bind(guild_id)
    .bind(category)
    .bind(limit.max(0))
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(LeaderboardEntry::try_from).collect()
}

pub async fn get_entry(
    conn: &mut DbConn,
    guild_id: i64,
    category: &str,
    participant_id: i64,
) -> Result<Option<LeaderboardEntry>, DbError> {
    let row = sqlx::query_as::<_, LeaderboardRow>(
        "SELECT guild_id, category, participant_id, points, total_successful, rank, last_updated
         FROM leaderboard_entries
         WHERE guild_id = ?1 AND category = ?2 AND participant_id = ?3",
    )
    .bind(guild_id)
    .bind(category)
    .bind(participant_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.map(LeaderboardEntry::try_from).transpose()
}

/// Add to a participant's running totals, creating the entry if needed.
/// New entries start unranked (rank 0) until the scope is re-ranked.
pub async fn add_points(
    conn: &mut DbConn,
    guild_id: i64,
    category: &str,
    participant_id: i64,
    points: i64,
    successful: i64,
    now: DateTime<Utc>,
) -> Result<LeaderboardEntry, DbError> {
    let row = sqlx::query_as::<_, LeaderboardRow>(
        "INSERT INTO leaderboard_entries
            (guild_id, category, participant_id, points, total_successful, rank, last_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6)
         ON CONFLICT (guild_id, category, participant_id) DO UPDATE SET
            points = leaderboard_entries.points + excluded.points,
            total_successful = leaderboard_entries.total_successful + excluded.total_successful,
            last_updated = excluded.last_updated
         RETURNING guild_id, category, participant_id, points, total_successful, rank, last_updated",
    )
    .bind(guild_id)
    .bind(category)
    .bind(participant_id)
    .bind(points)
    .bind(successful)
    .bind(datetime_to_db_millis(now))
    .fetch_one(&mut *conn)
    .await?;
    LeaderboardEntry::try_from(row)
}

pub async fn set_rank(
    conn: &mut DbConn,
    guild_id: i64,
    category: &str,
    participant_id: i64,
    rank: i64,
) -> Result<(), DbError> {
    let result = sqlx::query(
        "UPDATE leaderboard_entries SET rank = ?4
         WHERE guild_id = ?1 AND category = ?2 AND participant_id = ?3",
    )
    .bind(guild_id)
    .bind(category)
    .bind(participant_id)
    .bind(rank)
    .execute(&mut *conn)
    .await?;
    if result.rows_affected() == 0 {
        return Err(DbError::NotFound);
    }
    Ok(())
}

pub async fn insert_entry(conn: &mut DbConn, entry: &LeaderboardEntry) -> Result<(), DbError> {
    sqlx::query(
        "INSERT INTO leaderboard_entries
            (guild_id, category, participant_id, points, total_successful, rank, last_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
    )
    .bind(entry.guild_id)
    .bind(&entry.category)
    .bind(entry.participant_id)
    .bind(entry.points)
    .bind(entry.total_successful)
    .bind(entry.rank)
    .bind(datetime_to_db_millis(entry.last_updated))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete_scope(conn: &mut DbConn, guild_id: i64, category: &str) -> Result<u64, DbError> {
    let result = sqlx::query("DELETE FROM leaderboard_entries WHERE guild_id = ?1 AND category = ?2")
        .bind(guild_id)
        .bind(category)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
