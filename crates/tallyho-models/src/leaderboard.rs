use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub guild_id: i64,
    pub category: String,
    pub participant_id: i64,
    pub points: i64,
    /// Polls in which the participant picked at least one correct option.
    pub total_successful: i64,
    /// Competition rank within the (guild, category) scope, 1-based.
    pub rank: i64,
    pub last_updated: DateTime<Utc>,
}

/// Points earned by one participant on one revealed poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointAward {
    pub participant_id: i64,
    pub points: i64,
    pub successful: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantStats {
    pub participant_id: i64,
    pub points: i64,
    pub total_successful: i64,
    pub rank: Option<i64>,
}

impl ParticipantStats {
    pub fn unranked(participant_id: i64) -> Self {
        Self {
            participant_id,
            points: 0,
            total_successful: 0,
            rank: None,
        }
    }
}

impl From<&LeaderboardEntry> for ParticipantStats {
    fn from(entry: &LeaderboardEntry) -> Self {
        Self {
            participant_id: entry.participant_id,
            points: entry.points,
            total_successful: entry.total_successful,
            rank: Some(entry.rank),
        }
    }
}
