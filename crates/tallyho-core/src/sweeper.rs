use crate::error::CoreError;
use crate::observability::{self, CloseSource};
use crate::poll;
use crate::AppState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

/// Default time between sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SweepFailure {
    pub poll_id: i64,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SweepReport {
    /// Polls this sweep moved from open to closed.
    pub closed: Vec<i64>,
    pub failed: Vec<SweepFailure>,
}

/// Open polls whose end time is at or before `now`.
pub fn expired_poll_ids(now: DateTime<Utc>, open_polls: &[tallyho_models::Poll]) -> Vec<i64> {
    open_polls
        .iter()
        .filter(|poll| poll.is_open() && poll.end_time <= now)
        .map(|poll| poll.id)
        .collect()
}

/// Close every expired poll. A failure on one poll is recorded and the rest
/// are still attempted.
pub async fn sweep(state: &AppState, now: DateTime<Utc>) -> Result<SweepReport, CoreError> {
    sweep_with(state, now, move |poll_id| {
        poll::close_poll_at(state, poll_id, now, CloseSource::Sweeper)
    })
    .await
}

async fn sweep_with<F, Fut>(
    state: &AppState,
    now: DateTime<Utc>,
    close: F,
) -> Result<SweepReport, CoreError>
where
    F: Fn(i64) -> Fut,
    Fut: Future<Output = Result<(tallyho_models::Poll, bool), CoreError>>,
{
    let open = poll::list_open_polls(state).await?;
    let mut report = SweepReport::default();

    for poll_id in expired_poll_ids(now, &open) {
        match close(poll_id).await {
            Ok((_, true)) => report.closed.push(poll_id),
            Ok((_, false)) => {
                tracing::debug!(poll_id, "poll already closed before sweep reached it");
            }
            Err(err) => {
                observability::sweep_failure();
                tracing::warn!(poll_id, error = %err, "sweeper failed to close poll");
                report.failed.push(SweepFailure {
                    poll_id,
                    error: err.to_string(),
                });
            }
        }
    }
    Ok(report)
}

/// Sweep on a fixed interval until `shutdown` is notified.
pub async fn run(state: AppState, interval: Duration, shutdown: Arc<Notify>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!(interval_secs = interval.as_secs_f64(), "sweeper started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match sweep(&state, Utc::now()).await {
                    Ok(report) if !report.closed.is_empty() || !report.failed.is_empty() => {
                        tracing::info!(
                            closed = report.closed.len(),
                            failed = report.failed.len(),
                            "sweep finished"
                        );
                    }
                    Ok(_) => tracing::debug!("sweep found nothing to close"),
                    Err(err) => tracing::error!(error = %err, "sweep failed"),
                }
            }
            _ = shutdown.notified() => {
                tracing::info!("sweeper stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::{close_poll, get_poll};
    use crate::test_support::{expire, open_poll, test_state};
    use tallyho_models::PollState;

    #[tokio::test]
    async fn test_expired_poll_ids_is_pure_filter() {
        let state = test_state().await;
        let a = open_poll(&state, 100, "a", 2, 1).await;
        let mut b = a.clone();
        b.id = a.id + 1;
        b.end_time = a.end_time + chrono::Duration::hours(1);
        let mut closed = a.clone();
        closed.id = a.id + 2;
        closed.state = PollState::Closed;
        let polls = vec![a.clone(), b.clone(), closed];

        assert!(expired_poll_ids(a.created_at, &polls).is_empty());
        assert_eq!(expired_poll_ids(a.end_time, &polls), vec![a.id]);
        assert_eq!(expired_poll_ids(b.end_time, &polls), vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_sweep_closes_only_expired_polls() {
        let state = test_state().await;
        let expired = open_poll(&state, 100, "trivia", 3, 1).await;
        let running = open_poll(&state, 100, "pvp", 3, 1).await;
        let already_closed = open_poll(&state, 100, "misc", 3, 1).await;
        expire(&state, expired.id).await;
        close_poll(&state, already_closed.id).await.unwrap();

        let report = sweep(&state, Utc::now()).await.unwrap();
        assert_eq!(report.closed, vec![expired.id]);
        assert!(report.failed.is_empty());

        assert_eq!(get_poll(&state, expired.id).await.unwrap().state, PollState::Closed);
        assert_eq!(get_poll(&state, running.id).await.unwrap().state, PollState::Open);

        let again = sweep(&state, Utc::now()).await.unwrap();
        assert!(again.closed.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_keeps_going_after_one_poll_fails() {
        let state = test_state().await;
        let broken = open_poll(&state, 100, "trivia", 3, 1).await;
        let healthy = open_poll(&state, 100, "pvp", 3, 1).await;
        expire(&state, broken.id).await;
        expire(&state, healthy.id).await;
        let failures_before = observability::engine_metrics_snapshot().sweep_failures;

        let now = Utc::now();
        let broken_id = broken.id;
        let state_ref = &state;
        let report = sweep_with(&state, now, move |poll_id| async move {
            if poll_id == broken_id {
                return Err(CoreError::Storage(tallyho_db::DbError::Sqlx(
                    sqlx::Error::PoolTimedOut,
                )));
            }
            poll::close_poll_at(state_ref, poll_id, now, CloseSource::Sweeper).await
        })
        .await
        .unwrap();

        assert_eq!(report.closed, vec![healthy.id]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].poll_id, broken.id);
        assert!(observability::engine_metrics_snapshot().sweep_failures > failures_before);

        assert_eq!(get_poll(&state, broken.id).await.unwrap().state, PollState::Open);
        assert_eq!(get_poll(&state, healthy.id).await.unwrap().state, PollState::Closed);

        // The next regular sweep picks up the poll that failed.
        let retry = sweep(&state, Utc::now()).await.unwrap();
        assert_eq!(retry.closed, vec![broken.id]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let state = test_state().await;
        let poll = open_poll(&state, 100, "trivia", 3, 1).await;
        expire(&state, poll.id).await;

        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(run(state.clone(), Duration::from_millis(10), shutdown.clone()));

        let mut closed = false;
        for _ in 0..100 {
            if get_poll(&state, poll.id).await.unwrap().state == PollState::Closed {
                closed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(closed);

        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
