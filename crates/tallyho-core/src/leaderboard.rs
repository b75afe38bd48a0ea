use crate::error::CoreError;
use crate::retry::with_retry;
use crate::scoring;
use crate::AppState;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use tallyho_db::leaderboard as store;
use tallyho_db::polls;
use tallyho_db::DbConn;
use tallyho_models::{LeaderboardEntry, ParticipantStats, PointAward};

/// Running (points, successful polls) per participant.
type Totals = BTreeMap<i64, (i64, i64)>;

fn accumulate(totals: &mut Totals, awards: &[PointAward]) {
    for award in awards {
        let entry = totals.entry(award.participant_id).or_insert((0, 0));
        entry.0 += award.points;
        entry.1 += i64::from(award.successful);
    }
}

/// Sort a scope by points, then successful polls, then participant id, and
/// assign competition ranks (1, 2, 2, 4). Both the incremental and the full
/// rebuild paths rank through here.
pub fn rank_entries(entries: &mut [LeaderboardEntry]) {
    entries.sort_by(|a, b| {
        b.points
            .cmp(&a.points)
            .then(b.total_successful.cmp(&a.total_successful))
            .then(a.participant_id.cmp(&b.participant_id))
    });

    let mut previous: Option<(i64, i64)> = None;
    let mut rank = 0;
    for (position, entry) in entries.iter_mut().enumerate() {
        let key = (entry.points, entry.total_successful);
        if previous != Some(key) {
            rank = position as i64 + 1;
            previous = Some(key);
        }
        entry.rank = rank;
    }
}

/// Add awards to a scope and re-rank it.
pub async fn apply_point_deltas(
    state: &AppState,
    guild_id: i64,
    category: &str,
    deltas: &[PointAward],
) -> Result<Vec<LeaderboardEntry>, CoreError> {
    if let Some(negative) = deltas.iter().find(|d| d.points < 0) {
        return Err(CoreError::Validation(format!(
            "negative points for participant {}",
            negative.participant_id
        )));
    }
    if let Some(mismatched) = deltas.iter().find(|d| d.successful != (d.points > 0)) {
        return Err(CoreError::Validation(format!(
            "participant {} is marked successful={} with {} points",
            mismatched.participant_id, mismatched.successful, mismatched.points
        )));
    }

    state
        .locks
        .scopes
        .run(
            (guild_id, category.to_string()),
            with_retry(state.retry(), "apply_point_deltas", || async {
                let mut tx = tallyho_db::begin_write(&state.db).await?;
                let entries =
                    apply_point_deltas_in(&mut tx, guild_id, category, deltas, Utc::now()).await?;
                tx.commit().await?;
                Ok::<_, CoreError>(entries)
            }),
        )
        .await
}

/// Caller holds the scope lock and owns the transaction.
pub(crate) async fn apply_point_deltas_in(
    conn: &mut DbConn,
    guild_id: i64,
    category: &str,
    deltas: &[PointAward],
    now: DateTime<Utc>,
) -> Result<Vec<LeaderboardEntry>, CoreError> {
    let mut merged = Totals::new();
    accumulate(&mut merged, deltas);

    // Entries exist only for participants who have earned a point.
    for (participant_id, (points, successful)) in merged {
        if points == 0 {
            continue;
        }
        store::add_points(conn, guild_id, category, participant_id, points, successful, now).await?;
    }
    rerank_scope(conn, guild_id, category).await
}

async fn rerank_scope(
    conn: &mut DbConn,
    guild_id: i64,
    category: &str,
) -> Result<Vec<LeaderboardEntry>, CoreError> {
    let mut entries = store::list_scope(conn, guild_id, category).await?;
    let stored: HashMap<i64, i64> = entries
        .iter()
        .map(|entry| (entry.participant_id, entry.rank))
        .collect();

    rank_entries(&mut entries);
    for entry in &entries {
        if stored.get(&entry.participant_id) != Some(&entry.rank) {
            store::set_rank(conn, guild_id, category, entry.participant_id, entry.rank).await?;
        }
    }
    Ok(entries)
}

/// Top `limit` entries of a scope, best first.
pub async fn get_leaderboard(
    state: &AppState,
    guild_id: i64,
    category: &str,
    limit: i64,
) -> Result<Vec<LeaderboardEntry>, CoreError> {
    with_retry(state.retry(), "get_leaderboard", || async {
        let mut conn = state.db.acquire().await?;
        Ok::<_, CoreError>(store::top_entries(&mut conn, guild_id, category, limit).await?)
    })
    .await
}

pub async fn participant_stats(
    state: &AppState,
    guild_id: i64,
    category: &str,
    participant_id: i64,
) -> Result<ParticipantStats, CoreError> {
    with_retry(state.retry(), "participant_stats", || async {
        let mut conn = state.db.acquire().await?;
        let entry = store::get_entry(&mut conn, guild_id, category, participant_id).await?;
        Ok::<_, CoreError>(
            entry
                .as_ref()
                .map(ParticipantStats::from)
                .unwrap_or_else(|| ParticipantStats::unranked(participant_id)),
        )
    })
    .await
}

/// Throw away a scope's entries and rebuild them from every revealed poll.
pub async fn force_full_refresh(
    state: &AppState,
    guild_id: i64,
    category: &str,
) -> Result<Vec<LeaderboardEntry>, CoreError> {
    let entries = state
        .locks
        .scopes
        .run(
            (guild_id, category.to_string()),
            with_retry(state.retry(), "force_full_refresh", || async {
                let mut tx = tallyho_db::begin_write(&state.db).await?;
                let entries = rebuild_scope_in(&mut tx, guild_id, category, Utc::now()).await?;
                tx.commit().await?;
                Ok::<_, CoreError>(entries)
            }),
        )
        .await?;
    tracing::info!(guild_id, category, entries = entries.len(), "leaderboard rebuilt");
    Ok(entries)
}

async fn rebuild_scope_in(
    conn: &mut DbConn,
    guild_id: i64,
    category: &str,
    now: DateTime<Utc>,
) -> Result<Vec<LeaderboardEntry>, CoreError> {
    let revealed = polls::list_revealed_polls(conn, guild_id, category).await?;
    let mut totals = Totals::new();
    for poll in &revealed {
        let awards = scoring::compute_points_for(conn, poll).await?;
        accumulate(&mut totals, &awards);
    }

    let removed = store::delete_scope(conn, guild_id, category).await?;
    tracing::debug!(guild_id, category, removed, polls = revealed.len(), "rebuilding leaderboard scope");

    let mut entries: Vec<LeaderboardEntry> = totals
        .into_iter()
        .filter(|(_, (points, _))| *points > 0)
        .map(|(participant_id, (points, total_successful))| LeaderboardEntry {
            guild_id,
            category: category.to_string(),
            participant_id,
            points,
            total_successful,
            rank: 0,
            last_updated: now,
        })
        .collect();
    rank_entries(&mut entries);
    for entry in &entries {
        store::insert_entry(conn, entry).await?;
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::close_and_reveal_poll;
    use crate::test_support::{open_poll, test_state};
    use crate::vote::replace_selections;
    use proptest::prelude::*;

    fn entry(participant_id: i64, points: i64, total_successful: i64) -> LeaderboardEntry {
        LeaderboardEntry {
            guild_id: 100,
            category: "trivia".into(),
            participant_id,
            points,
            total_successful,
            rank: 0,
            last_updated: Utc::now(),
        }
    }

    fn award(participant_id: i64, points: i64) -> PointAward {
        PointAward {
            participant_id,
            points,
            successful: points > 0,
        }
    }

    fn ranked(entries: &[LeaderboardEntry]) -> Vec<(i64, i64, i64, i64)> {
        entries
            .iter()
            .map(|e| (e.participant_id, e.points, e.total_successful, e.rank))
            .collect()
    }

    #[test]
    fn test_rank_entries_uses_competition_ranking() {
        let mut entries = vec![entry(4, 3, 2), entry(1, 5, 2), entry(3, 3, 2), entry(2, 3, 3)];
        rank_entries(&mut entries);
        assert_eq!(
            ranked(&entries),
            vec![(1, 5, 2, 1), (2, 3, 3, 2), (3, 3, 2, 3), (4, 3, 2, 3)]
        );
    }

    #[test]
    fn test_rank_entries_after_tie_skips_ranks() {
        let mut entries = vec![entry(3, 7, 2), entry(1, 10, 3), entry(2, 10, 3)];
        rank_entries(&mut entries);
        let ranks: Vec<i64> = entries.iter().map(|e| e.rank).collect();
        assert_eq!(ranks, vec![1, 1, 3]);
    }

    #[tokio::test]
    async fn test_apply_point_deltas_merges_and_ranks() {
        let state = test_state().await;
        let entries = apply_point_deltas(
            &state,
            100,
            "trivia",
            &[award(1, 1), award(2, 3), award(1, 1), award(3, 0)],
        )
        .await
        .unwrap();
        assert_eq!(ranked(&entries), vec![(2, 3, 1, 1), (1, 2, 2, 2)]);

        let entries = apply_point_deltas(&state, 100, "trivia", &[award(1, 2)]).await.unwrap();
        assert_eq!(ranked(&entries), vec![(1, 4, 3, 1), (2, 3, 1, 2)]);

        // Other scopes are untouched.
        assert!(get_leaderboard(&state, 100, "pvp", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_point_deltas_rejects_negative_points() {
        let state = test_state().await;
        let err = apply_point_deltas(&state, 100, "trivia", &[award(1, -1)]).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert!(get_leaderboard(&state, 100, "trivia", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_apply_point_deltas_rejects_success_without_points() {
        let state = test_state().await;
        apply_point_deltas(&state, 100, "trivia", &[award(1, 3)]).await.unwrap();

        for bad in [
            PointAward { participant_id: 1, points: 0, successful: true },
            PointAward { participant_id: 1, points: 2, successful: false },
        ] {
            let err = apply_point_deltas(&state, 100, "trivia", &[bad]).await.unwrap_err();
            assert!(matches!(err, CoreError::Validation(_)), "accepted {bad:?}");
        }

        let stats = participant_stats(&state, 100, "trivia", 1).await.unwrap();
        assert_eq!(stats.points, 3);
        assert_eq!(stats.total_successful, 1);
    }

    #[tokio::test]
    async fn test_get_leaderboard_limit_and_stats() {
        let state = test_state().await;
        apply_point_deltas(&state, 100, "trivia", &[award(1, 1), award(2, 2), award(3, 3)])
            .await
            .unwrap();

        let top = get_leaderboard(&state, 100, "trivia", 2).await.unwrap();
        let ids: Vec<i64> = top.iter().map(|e| e.participant_id).collect();
        assert_eq!(ids, vec![3, 2]);

        let stats = participant_stats(&state, 100, "trivia", 1).await.unwrap();
        assert_eq!(stats.points, 1);
        assert_eq!(stats.rank, Some(3));

        let absent = participant_stats(&state, 100, "trivia", 42).await.unwrap();
        assert_eq!(absent, ParticipantStats::unranked(42));
    }

    #[tokio::test]
    async fn test_full_refresh_repairs_drift() {
        let state = test_state().await;
        let poll = open_poll(&state, 100, "trivia", 3, 2).await;
        replace_selections(&state, poll.id, 1, &[0, 1]).await.unwrap();
        replace_selections(&state, poll.id, 2, &[2]).await.unwrap();
        let outcome = close_and_reveal_poll(&state, poll.id, &[0, 1]).await.unwrap();

        // Manual tampering that the rebuild must undo.
        apply_point_deltas(&state, 100, "trivia", &[award(2, 7)]).await.unwrap();

        let rebuilt = force_full_refresh(&state, 100, "trivia").await.unwrap();
        assert_eq!(ranked(&rebuilt), ranked(&outcome.leaderboard));
        assert_eq!(ranked(&rebuilt), vec![(1, 2, 1, 1)]);

        let stored = get_leaderboard(&state, 100, "trivia", 10).await.unwrap();
        assert_eq!(ranked(&stored), ranked(&rebuilt));
    }

    #[tokio::test]
    async fn test_full_refresh_of_empty_scope() {
        let state = test_state().await;
        assert!(force_full_refresh(&state, 100, "trivia").await.unwrap().is_empty());
    }

    /// One generated poll: correct option mask and (participant, selection mask) votes.
    #[derive(Debug, Clone)]
    struct GeneratedPoll {
        correct: u8,
        votes: Vec<(i64, u8)>,
    }

    const GENERATED_OPTIONS: u32 = 4;

    fn mask_to_indices(mask: u8) -> Vec<u32> {
        (0..GENERATED_OPTIONS).filter(|i| mask & (1 << i) != 0).collect()
    }

    fn arb_poll() -> impl Strategy<Value = GeneratedPoll> {
        (0u8..16, prop::collection::vec((1i64..6, 0u8..16), 0..8))
            .prop_map(|(correct, votes)| GeneratedPoll { correct, votes })
    }

    async fn run_polls(polls: &[GeneratedPoll]) -> (Vec<LeaderboardEntry>, Vec<LeaderboardEntry>, i64) {
        let state = test_state().await;
        let mut awarded = 0;
        for generated in polls {
            let poll = open_poll(&state, 100, "trivia", GENERATED_OPTIONS as usize, GENERATED_OPTIONS).await;
            for (participant, mask) in &generated.votes {
                replace_selections(&state, poll.id, *participant, &mask_to_indices(*mask))
                    .await
                    .unwrap();
            }
            let outcome = close_and_reveal_poll(&state, poll.id, &mask_to_indices(generated.correct))
                .await
                .unwrap();
            awarded += outcome.awards.iter().map(|a| a.points).sum::<i64>();
        }
        let incremental = get_leaderboard(&state, 100, "trivia", i64::MAX).await.unwrap();
        let rebuilt = force_full_refresh(&state, 100, "trivia").await.unwrap();
        (incremental, rebuilt, awarded)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Property: a full rebuild reproduces exactly what incremental
        /// updates produced, and the board holds every point ever awarded.
        #[test]
        fn prop_incremental_matches_full_refresh(polls in prop::collection::vec(arb_poll(), 1..5)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            let (incremental, rebuilt, awarded) = runtime.block_on(run_polls(&polls));

            prop_assert_eq!(ranked(&incremental), ranked(&rebuilt));
            prop_assert_eq!(incremental.iter().map(|e| e.points).sum::<i64>(), awarded);
            prop_assert!(incremental.iter().all(|e| e.points > 0));
        }
    }
}
