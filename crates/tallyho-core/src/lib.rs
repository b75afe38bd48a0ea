pub mod duration;
pub mod error;
pub mod leaderboard;
pub mod locks;
pub mod observability;
pub mod poll;
pub mod retry;
pub mod scoring;
pub mod sweeper;
pub mod vote;

pub use error::{CoreError, ErrorKind};
pub use retry::RetryPolicy;

use std::sync::Arc;
use tallyho_db::DbPool;

/// Default number of rows returned by leaderboard queries.
pub const DEFAULT_LEADERBOARD_LIMIT: i64 = 10;

#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub retry: RetryPolicy,
}

/// Shared handle passed to every engine operation. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub db: DbPool,
    pub config: EngineConfig,
    pub locks: Arc<locks::EngineLocks>,
}

impl AppState {
    pub fn new(db: DbPool, config: EngineConfig) -> Self {
        Self {
            db,
            config,
            locks: Arc::new(locks::EngineLocks::new()),
        }
    }

    pub(crate) fn retry(&self) -> RetryPolicy {
        self.config.retry
    }
}
