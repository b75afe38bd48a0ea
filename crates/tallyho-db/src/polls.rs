use crate::{datetime_from_db_millis, datetime_to_db_millis, index_from_db, DbConn, DbError};
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use std::collections::HashMap;
use tallyho_models::{Poll, PollOption, PollState};

/// Upper bound on bound parameters per `IN (...)` query.
const MAX_IDS_PER_QUERY: usize = 500;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PollRow {
    pub id: i64,
    pub guild_id: i64,
    pub category: String,
    pub question: String,
    pub description: Option<String>,
    pub creator_id: i64,
    pub max_selections: i64,
    pub end_time: i64,
    pub created_at: i64,
    pub state: String,
    pub correct_answers: Option<Json<Vec<u32>>>,
    pub show_votes_while_active: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PollOptionRow {
    pub poll_id: i64,
    pub idx: i64,
    pub text: String,
}

impl PollRow {
    fn into_poll(self, options: Vec<PollOptionRow>) -> Result<Poll, DbError> {
        let state = self
            .state
            .parse::<PollState>()
            .map_err(|e| DbError::Corrupt(e.to_string()))?;
        let max_selections = u32::try_from(self.max_selections).map_err(|_| {
            DbError::Corrupt(format!("invalid max_selections: {}", self.max_selections))
        })?;
        let options = options
            .into_iter()
            .map(|row| {
                Ok(PollOption {
                    poll_id: row.poll_id,
                    index: index_from_db(row.idx)?,
                    text: row.text,
                })
            })
            .collect::<Result<Vec<_>, DbError>>()?;

        Ok(Poll {
            id: self.id,
            guild_id: self.guild_id,
            category: self.category,
            question: self.question,
            description: self.description,
            creator_id: self.creator_id,
            options,
            max_selections,
            end_time: datetime_from_db_millis(self.end_time)?,
            created_at: datetime_from_db_millis(self.created_at)?,
            state,
            correct_answers: self.correct_answers.map(|Json(answers)| answers),
            show_votes_while_active: self.show_votes_while_active,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewPoll<'a> {
    pub guild_id: i64,
    pub category: &'a str,
    pub question: &'a str,
    pub description: Option<&'a str>,
    pub creator_id: i64,
    pub options: &'a [String],
    pub max_selections: u32,
    pub end_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub show_votes_while_active: bool,
}

const POLL_COLUMNS: &str = "id, guild_id, category, question, description, creator_id, \
     max_selections, end_time, created_at, state, correct_answers, show_votes_while_active";

/// Insert a poll and its options. Callers run this inside a transaction so a
/// failed option insert does not leave a poll without options behind.
pub async fn insert_poll(conn: &mut DbConn, new: &NewPoll<'_>) -> Result<Poll, DbError> {
    let sql = format!(
        "INSERT INTO polls (guild_id, category, question, description, creator_id,
                            max_selections, end_time, created_at, state, show_votes_while_active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'open', ?9)
         RETURNING {POLL_COLUMNS}"
    );
    let row = sqlx::query_as::<_, PollRow>(&sql)
        .bind(new.guild_id)
        .bind(new.category)
        .bind(new.question)
        .bind(new.description)
        .bind(new.creator_id)
        .bind(i64::from(new.max_selections))
        .bind(datetime_to_db_millis(new.end_time))
        .bind(datetime_to_db_millis(new.created_at))
        .bind(new.show_votes_while_active)
        .fetch_one(&mut *conn)
        .await?;

    let mut options = Vec::with_capacity(new.options.len());
    for (idx, text) in new.options.iter().enumerate() {
        let option = sqlx::query_as::<_, PollOptionRow>(
            "INSERT INTO poll_options (poll_id, idx, text)
             VALUES (?1, ?2, ?3)
             RETURNING poll_id, idx, text",
        )
        .bind(row.id)
        .bind(idx as i64)
        .bind(text)
        .fetch_one(&mut *conn)
        .await?;
        options.push(option);
    }

    row.into_poll(options)
}

pub async fn get_poll(conn: &mut DbConn, poll_id: i64) -> Result<Option<Poll>, DbError> {
    let sql = format!("SELECT {POLL_COLUMNS} FROM polls WHERE id = ?1");
    let row = sqlx::query_as::<_, PollRow>(&sql)
        .bind(poll_id)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => Ok(hydrate(conn, vec![row]).await?.pop()),
        None => Ok(None),
    }
}

pub async fn find_open_poll(
    conn: &mut DbConn,
    guild_id: i64,
    category: &str,
) -> Result<Option<Poll>, DbError> {
    let sql = format!(
        "SELECT {POLL_COLUMNS} FROM polls
         WHERE guild_id = ?1 AND category = ?2 AND state = 'open'
         LIMIT 1"
    );
    let row = sqlx::query_as::<_, PollRow>(&sql)
        .bind(guild_id)
        .bind(category)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => Ok(hydrate(conn, vec![row]).await?.pop()),
        None => Ok(None),
    }
}

/// Most recent poll in the scope by creation time. With `include_closed`
/// unset only an open poll qualifies.
pub async fn find_latest_poll(
    conn: &mut DbConn,
    guild_id: i64,
    category: &str,
    include_closed: bool,
) -> Result<Option<Poll>, DbError> {
    let sql = format!(
        "SELECT {POLL_COLUMNS} FROM polls
         WHERE guild_id = ?1 AND category = ?2 AND (?3 OR state = 'open')
         ORDER BY created_at DESC, id DESC
         LIMIT 1"
    );
    let row = sqlx::query_as::<_, PollRow>(&sql)
        .bind(guild_id)
        .bind(category)
        .bind(include_closed)
        .fetch_optional(&mut *conn)
        .await?;
    match row {
        Some(row) => Ok(hydrate(conn, vec![row]).await?.pop()),
        None => Ok(None),
    }
}

pub async fn list_open_polls(conn: &mut DbConn) -> Result<Vec<Poll>, DbError> {
    let sql = format!(
        "SELECT {POLL_COLUMNS} FROM polls
         WHERE state = 'open'
         ORDER BY end_time ASC, id ASC"
    );
    let rows = sqlx::query_as::<_, PollRow>(&sql)
        .fetch_all(&mut *conn)
        .await?;
    hydrate(conn, rows).await
}

pub async fn list_revealed_polls(
    conn: &mut DbConn,
    guild_id: i64,
    category: &str,
) -> Result<Vec<Poll>, DbError> {
    let sql = format!(
        "SELECT {POLL_COLUMNS} FROM polls
         WHERE guild_id = ?1 AND category = ?2 AND state = 'revealed'
         ORDER BY created_at ASC, id ASC"
    );
    let rows = sqlx::query_as::<_, PollRow>(&sql)
        .bind(guild_id)
        .bind(category)
        .fetch_all(&mut *conn)
        .await?;
    hydrate(conn, rows).await
}

/// Move an open poll to closed, pulling its end time forward to `now` if it
/// had not yet expired. Returns false when the poll was not open.
pub async fn mark_closed(conn: &mut DbConn, poll_id: i64, now: DateTime<Utc>) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE polls
         SET state = 'closed', end_time = MIN(end_time, ?2)
         WHERE id = ?1 AND state = 'open'",
    )
    .bind(poll_id)
    .bind(datetime_to_db_millis(now))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Move a closed poll to revealed and record its answers. Returns false when
/// the poll was not closed, which is how a racing reveal loses.
pub async fn mark_revealed(
    conn: &mut DbConn,
    poll_id: i64,
    correct_answers: &[u32],
) -> Result<bool, DbError> {
    let result = sqlx::query(
        "UPDATE polls
         SET state = 'revealed', correct_answers = ?2
         WHERE id = ?1 AND state = 'closed'",
    )
    .bind(poll_id)
    .bind(Json(correct_answers.to_vec()))
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn update_end_time(
    conn: &mut DbConn,
    poll_id: i64,
    end_time: DateTime<Utc>,
) -> Result<bool, DbError> {
    let result = sqlx::query("UPDATE polls SET end_time = ?2 WHERE id = ?1 AND state = 'open'")
        .bind(poll_id)
        .bind(datetime_to_db_millis(end_time))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

async fn hydrate(conn: &mut DbConn, rows: Vec<PollRow>) -> Result<Vec<Poll>, DbError> {
    if rows.is_empty() {
        return Ok(Vec::new());
    }
    let ids: Vec<i64> = rows.iter().map(|row| row.id).collect();
    let mut options = load_options(conn, &ids).await?;
    rows.into_iter()
        .map(|row| {
            let opts = options.remove(&row.id).unwrap_or_default();
            row.into_poll(opts)
        })
        .collect()
}

async fn load_options(
    conn: &mut DbConn,
    poll_ids: &[i64],
) -> Result<HashMap<i64, Vec<PollOptionRow>>, DbError> {
    let mut by_poll: HashMap<i64, Vec<PollOptionRow>> = HashMap::new();
    for chunk in poll_ids.chunks(MAX_IDS_PER_QUERY) {
        let placeholders: Vec<String> = (1..=chunk.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "SELECT poll_id, idx, text FROM poll_options
             WHERE poll_id IN ({})
             ORDER BY poll_id ASC, idx ASC",
            placeholders.join(", ")
        );
        let mut query = sqlx::query_as::<_, PollOptionRow>(&sql);
        for id in chunk {
            query = query.bind(id);
        }
        for row in query.fetch_all(&mut *conn).await? {
            by_poll.entry(row.poll_id).or_default().push(row);
        }
    }
    Ok(by_poll)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::DbPool;
    use chrono::Duration;

    pub(crate) async fn test_pool() -> DbPool {
        let pool = crate::create_pool("sqlite::memory:", 1).await.unwrap();
        crate::run_migrations(&pool).await.unwrap();
        pool
    }

    pub(crate) async fn seed_poll(conn: &mut DbConn, guild_id: i64, category: &str) -> Poll {
        let options = vec!["red".to_string(), "green".to_string(), "blue".to_string()];
        let now = Utc::now();
        insert_poll(
            conn,
            &NewPoll {
                guild_id,
                category,
                question: "Favourite colour?",
                description: None,
                creator_id: 1,
                options: &options,
                max_selections: 2,
                end_time: now + Duration::hours(1),
                created_at: now,
                show_votes_while_active: false,
            },
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_insert_poll_returns_options_in_order() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let poll = seed_poll(&mut conn, 100, "trivia").await;
        assert_eq!(poll.state, PollState::Open);
        assert_eq!(poll.options.len(), 3);
        assert_eq!(poll.options[2].index, 2);
        assert_eq!(poll.options[2].text, "blue");
        assert!(poll.correct_answers.is_none());

        let fetched = get_poll(&mut conn, poll.id).await.unwrap().unwrap();
        assert_eq!(fetched, poll);
    }

    #[tokio::test]
    async fn test_get_poll_not_found() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        assert!(get_poll(&mut conn, 999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_second_open_poll_in_scope_violates_unique_index() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        seed_poll(&mut conn, 100, "trivia").await;

        let options = vec!["a".to_string(), "b".to_string()];
        let now = Utc::now();
        let err = insert_poll(
            &mut conn,
            &NewPoll {
                guild_id: 100,
                category: "trivia",
                question: "Again?",
                description: None,
                creator_id: 1,
                options: &options,
                max_selections: 1,
                end_time: now + Duration::hours(1),
                created_at: now,
                show_votes_while_active: false,
            },
        )
        .await
        .unwrap_err();
        assert!(err.is_unique_violation());

        // Other categories and guilds are independent.
        seed_poll(&mut conn, 100, "pvp").await;
        seed_poll(&mut conn, 200, "trivia").await;
    }

    #[tokio::test]
    async fn test_mark_closed_is_conditional() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let poll = seed_poll(&mut conn, 100, "trivia").await;
        let now = Utc::now();

        assert!(mark_closed(&mut conn, poll.id, now).await.unwrap());
        assert!(!mark_closed(&mut conn, poll.id, now).await.unwrap());

        let closed = get_poll(&mut conn, poll.id).await.unwrap().unwrap();
        assert_eq!(closed.state, PollState::Closed);
        assert!(closed.end_time <= poll.end_time);
        assert!(find_open_poll(&mut conn, 100, "trivia").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_closed_keeps_earlier_end_time() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let poll = seed_poll(&mut conn, 100, "trivia").await;
        let past = poll.created_at - Duration::minutes(5);
        update_end_time(&mut conn, poll.id, past).await.unwrap();

        mark_closed(&mut conn, poll.id, Utc::now()).await.unwrap();
        let closed = get_poll(&mut conn, poll.id).await.unwrap().unwrap();
        assert_eq!(closed.end_time, past);
    }

    #[tokio::test]
    async fn test_mark_revealed_requires_closed() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let poll = seed_poll(&mut conn, 100, "trivia").await;

        assert!(!mark_revealed(&mut conn, poll.id, &[1]).await.unwrap());
        mark_closed(&mut conn, poll.id, Utc::now()).await.unwrap();
        assert!(mark_revealed(&mut conn, poll.id, &[1]).await.unwrap());
        assert!(!mark_revealed(&mut conn, poll.id, &[2]).await.unwrap());

        let revealed = get_poll(&mut conn, poll.id).await.unwrap().unwrap();
        assert_eq!(revealed.state, PollState::Revealed);
        assert_eq!(revealed.correct_answers, Some(vec![1]));
    }

    #[tokio::test]
    async fn test_find_latest_poll_respects_include_closed() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let first = seed_poll(&mut conn, 100, "trivia").await;
        mark_closed(&mut conn, first.id, Utc::now()).await.unwrap();

        assert!(find_latest_poll(&mut conn, 100, "trivia", false)
            .await
            .unwrap()
            .is_none());
        let latest = find_latest_poll(&mut conn, 100, "trivia", true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, first.id);

        let second = seed_poll(&mut conn, 100, "trivia").await;
        let latest = find_latest_poll(&mut conn, 100, "trivia", false)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, second.id);
    }

    #[tokio::test]
    async fn test_list_open_and_revealed_polls() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let a = seed_poll(&mut conn, 100, "trivia").await;
        let b = seed_poll(&mut conn, 100, "pvp").await;
        mark_closed(&mut conn, a.id, Utc::now()).await.unwrap();
        mark_revealed(&mut conn, a.id, &[0]).await.unwrap();

        let open = list_open_polls(&mut conn).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, b.id);
        assert_eq!(open[0].options.len(), 3);

        let revealed = list_revealed_polls(&mut conn, 100, "trivia").await.unwrap();
        assert_eq!(revealed.len(), 1);
        assert_eq!(revealed[0].id, a.id);
        assert!(list_revealed_polls(&mut conn, 100, "pvp").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_end_time_only_while_open() {
        let pool = test_pool().await;
        let mut conn = pool.acquire().await.unwrap();
        let poll = seed_poll(&mut conn, 100, "trivia").await;
        let later = poll.end_time + Duration::hours(2);
        assert!(update_end_time(&mut conn, poll.id, later).await.unwrap());
        mark_closed(&mut conn, poll.id, Utc::now()).await.unwrap();
        assert!(!update_end_time(&mut conn, poll.id, later).await.unwrap());
    }
}
