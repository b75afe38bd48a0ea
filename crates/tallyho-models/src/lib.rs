pub mod leaderboard;
pub mod poll;
pub mod selection;
pub mod vote;

pub use leaderboard::{LeaderboardEntry, ParticipantStats, PointAward};
pub use poll::{Poll, PollOption, PollResults, PollState};
pub use selection::{SelectionError, SelectionSet, Toggle};
pub use vote::Vote;
