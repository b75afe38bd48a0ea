use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

const OPERATION_FALLBACK: &str = "other";
const MAX_OPERATION_LEN: usize = 64;
const MAX_OPERATION_KEYS: usize = 64;

static POLLS_CREATED: AtomicU64 = AtomicU64::new(0);
static POLLS_CLOSED_BY_ADMIN: AtomicU64 = AtomicU64::new(0);
static POLLS_CLOSED_BY_SWEEPER: AtomicU64 = AtomicU64::new(0);
static POLLS_REVEALED: AtomicU64 = AtomicU64::new(0);
static VOTES_RECORDED: AtomicU64 = AtomicU64::new(0);
static SWEEP_FAILURES: AtomicU64 = AtomicU64::new(0);
static STORAGE_RETRIES_BY_OPERATION: OnceLock<Mutex<HashMap<String, u64>>> = OnceLock::new();

/// Who moved a poll from open to closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseSource {
    Admin,
    Sweeper,
}

fn lock_retries() -> std::sync::MutexGuard<'static, HashMap<String, u64>> {
    match STORAGE_RETRIES_BY_OPERATION
        .get_or_init(|| Mutex::new(HashMap::new()))
        .lock()
    {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn normalize_operation(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.len() > MAX_OPERATION_LEN {
        return OPERATION_FALLBACK.to_string();
    }
    if !trimmed
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_')
    {
        return OPERATION_FALLBACK.to_string();
    }
    trimmed.to_string()
}

pub fn poll_created() {
    POLLS_CREATED.fetch_add(1, Ordering::Relaxed);
}

pub fn poll_closed(source: CloseSource) {
    match source {
        CloseSource::Admin => POLLS_CLOSED_BY_ADMIN.fetch_add(1, Ordering::Relaxed),
        CloseSource::Sweeper => POLLS_CLOSED_BY_SWEEPER.fetch_add(1, Ordering::Relaxed),
    };
}

pub fn poll_revealed() {
    POLLS_REVEALED.fetch_add(1, Ordering::Relaxed);
}

pub fn vote_recorded() {
    VOTES_RECORDED.fetch_add(1, Ordering::Relaxed);
}

pub fn sweep_failure() {
    SWEEP_FAILURES.fetch_add(1, Ordering::Relaxed);
}

pub fn storage_retry(operation: &str) {
    let mut normalized = normalize_operation(operation);
    let mut by_operation = lock_retries();
    if !by_operation.contains_key(&normalized) && by_operation.len() >= MAX_OPERATION_KEYS {
        normalized = OPERATION_FALLBACK.to_string();
    }
    let entry = by_operation.entry(normalized).or_insert(0);
    *entry = entry.saturating_add(1);
}

#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct EngineMetricsSnapshot {
    pub polls_created: u64,
    pub polls_closed_by_admin: u64,
    pub polls_closed_by_sweeper: u64,
    pub polls_revealed: u64,
    pub votes_recorded: u64,
    pub sweep_failures: u64,
    pub storage_retries: Vec<(String, u64)>,
}

pub fn engine_metrics_snapshot() -> EngineMetricsSnapshot {
    let mut storage_retries: Vec<(String, u64)> = lock_retries()
        .iter()
        .map(|(operation, count)| (operation.clone(), *count))
        .collect();
    storage_retries.sort_by(|a, b| a.0.cmp(&b.0));

    EngineMetricsSnapshot {
        polls_created: POLLS_CREATED.load(Ordering::Relaxed),
        polls_closed_by_admin: POLLS_CLOSED_BY_ADMIN.load(Ordering::Relaxed),
        polls_closed_by_sweeper: POLLS_CLOSED_BY_SWEEPER.load(Ordering::Relaxed),
        polls_revealed: POLLS_REVEALED.load(Ordering::Relaxed),
        votes_recorded: VOTES_RECORDED.load(Ordering::Relaxed),
        sweep_failures: SWEEP_FAILURES.load(Ordering::Relaxed),
        storage_retries,
    }
}
