use clap::{Parser, Subcommand};
use tallyho_core::duration::DEFAULT_POLL_DURATION;
use tallyho_core::DEFAULT_LEADERBOARD_LIMIT;

/// tallyho - poll and leaderboard engine
#[derive(Parser, Debug)]
#[command(name = "tallyho")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "tallyho.toml")]
    pub config: String,

    /// Override `database.url` from the config file
    #[arg(long)]
    pub database_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the expiry sweeper until interrupted
    Run,

    /// Open a new poll
    CreatePoll {
        #[arg(long)]
        guild: i64,
        #[arg(long)]
        category: String,
        #[arg(long)]
        question: String,
        #[arg(long)]
        description: Option<String>,
        /// Participant id of the poll's creator
        #[arg(long, default_value_t = 0)]
        creator: i64,
        /// Option text; repeat once per option
        #[arg(long = "option", required = true)]
        options: Vec<String>,
        #[arg(long, default_value_t = 1)]
        max_selections: u32,
        /// How long the poll stays open, e.g. 1d12h30m
        #[arg(long, default_value = DEFAULT_POLL_DURATION)]
        duration: String,
        /// Show per-option counts while the poll is still open
        #[arg(long)]
        show_votes: bool,
    },

    /// Close an open poll
    Close { poll: i64 },

    /// Reveal the correct answers of a poll and award points
    Reveal {
        poll: i64,
        /// Correct option indices, comma separated
        #[arg(long, value_delimiter = ',')]
        correct: Vec<u32>,
        /// Close the poll first if it is still open
        #[arg(long)]
        close: bool,
    },

    /// Change when an open poll ends, e.g. 2024-06-01T12:00:00Z
    SetEnd { poll: i64, end_time: String },

    /// Toggle one option for a participant
    Toggle {
        poll: i64,
        participant: i64,
        option: u32,
    },

    /// Replace a participant's selections (comma separated, empty clears)
    Vote {
        poll: i64,
        participant: i64,
        #[arg(value_delimiter = ',')]
        options: Vec<u32>,
    },

    /// Show a poll with its current tallies
    Results { poll: i64 },

    /// Show the top of a leaderboard
    Leaderboard {
        guild: i64,
        category: String,
        #[arg(long, default_value_t = DEFAULT_LEADERBOARD_LIMIT)]
        limit: i64,
    },

    /// Show one participant's standing
    Stats {
        guild: i64,
        category: String,
        participant: i64,
    },

    /// Rebuild a leaderboard from every revealed poll
    Refresh { guild: i64, category: String },

    /// Close every expired poll once and exit
    Sweep,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_create_poll_with_repeated_options() {
        let args = Args::try_parse_from([
            "tallyho",
            "create-poll",
            "--guild",
            "100",
            "--category",
            "trivia",
            "--question",
            "Pick one",
            "--option",
            "red",
            "--option",
            "blue",
        ])
        .unwrap();
        match args.command {
            Command::CreatePoll {
                options,
                duration,
                max_selections,
                ..
            } => {
                assert_eq!(options, vec!["red", "blue"]);
                assert_eq!(duration, DEFAULT_POLL_DURATION);
                assert_eq!(max_selections, 1);
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(args.config, "tallyho.toml");
    }

    #[test]
    fn test_parses_reveal_answer_list() {
        let args = Args::try_parse_from(["tallyho", "reveal", "7", "--correct", "0,2", "--close"]).unwrap();
        match args.command {
            Command::Reveal { poll, correct, close } => {
                assert_eq!(poll, 7);
                assert_eq!(correct, vec![0, 2]);
                assert!(close);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
