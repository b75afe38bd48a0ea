use crate::selection::SelectionSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A participant's current selections on one poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub poll_id: i64,
    pub participant_id: i64,
    pub selections: SelectionSet,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
