use crate::selection::SelectionSet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a poll. Transitions only move forward:
/// `Open -> Closed -> Revealed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollState {
    Open,
    Closed,
    Revealed,
}

impl PollState {
    pub fn as_str(self) -> &'static str {
        match self {
            PollState::Open => "open",
            PollState::Closed => "closed",
            PollState::Revealed => "revealed",
        }
    }

    /// Whether `self -> next` is a legal forward transition.
    pub fn can_transition_to(self, next: PollState) -> bool {
        matches!(
            (self, next),
            (PollState::Open, PollState::Closed) | (PollState::Closed, PollState::Revealed)
        )
    }
}

impl fmt::Display for PollState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown poll state: {0}")]
pub struct UnknownPollState(pub String);

impl FromStr for PollState {
    type Err = UnknownPollState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PollState::Open),
            "closed" => Ok(PollState::Closed),
            "revealed" => Ok(PollState::Revealed),
            other => Err(UnknownPollState(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Poll {
    pub id: i64,
    pub guild_id: i64,
    /// Poll sub-type within the guild. One open poll per (guild, category).
    pub category: String,
    pub question: String,
    pub description: Option<String>,
    pub creator_id: i64,
    pub options: Vec<PollOption>,
    pub max_selections: u32,
    pub end_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub state: PollState,
    /// Set exactly once, when the poll is revealed.
    pub correct_answers: Option<Vec<u32>>,
    pub show_votes_while_active: bool,
}

impl Poll {
    pub fn is_open(&self) -> bool {
        self.state == PollState::Open
    }

    pub fn is_revealed(&self) -> bool {
        self.state == PollState::Revealed
    }

    /// A poll takes votes while it is open and its end time has not passed.
    pub fn accepts_votes_at(&self, now: DateTime<Utc>) -> bool {
        self.is_open() && now < self.end_time
    }

    pub fn option_count(&self) -> usize {
        self.options.len()
    }

    pub fn has_option(&self, index: u32) -> bool {
        (index as usize) < self.options.len()
    }

    /// Correct answers as a selection, empty for ungraded polls.
    pub fn correct_set(&self) -> SelectionSet {
        self.correct_answers
            .as_deref()
            .map(SelectionSet::from_unordered)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollOption {
    pub poll_id: i64,
    pub index: u32,
    pub text: String,
}

/// Aggregated view of a poll's votes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollResults {
    pub poll_id: i64,
    pub state: PollState,
    pub total_votes: u64,
    /// Per-option vote counts in option order. `None` while the poll is open
    /// and its counts are hidden.
    pub votes_per_option: Option<Vec<u64>>,
    /// Only present once the poll is revealed.
    pub correct_answers: Option<Vec<u32>>,
}
