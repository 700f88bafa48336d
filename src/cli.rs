use clap::{Parser, Subcommand};

/// quotad: quota accounting and usage metering for API tokens
#[derive(Parser)]
#[command(name = "quotad", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the metering service and status API
    Serve {
        /// Port to bind (overrides QUOTA_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Inspect tokens
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },

    /// Charge or refund quota directly
    Quota {
        #[command(subcommand)]
        command: QuotaCommands,
    },

    /// Inspect accounts
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },
}

#[derive(Subcommand)]
pub enum TokenCommands {
    /// Show a token's counters and status
    Show {
        #[arg(long)]
        id: i64,
    },
    /// Run the key validation checks against a token key
    Validate {
        #[arg(long)]
        key: String,
    },
}

#[derive(Subcommand)]
pub enum QuotaCommands {
    /// Reserve an estimated cost against a token and its account
    PreConsume {
        #[arg(long)]
        token_id: i64,
        #[arg(long)]
        amount: i64,
    },
    /// Apply a signed adjustment (positive charges, negative refunds)
    PostConsume {
        #[arg(long)]
        token_id: i64,
        #[arg(long, allow_hyphen_values = true)]
        amount: i64,
    },
}

#[derive(Subcommand)]
pub enum AccountCommands {
    /// Show an account's quota counters
    Show {
        #[arg(long)]
        id: i64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_defaults_to_serve() {
        let cli = Cli::parse_from(["quotad"]);
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_post_consume_accepts_negative_amount() {
        let cli = Cli::parse_from(["quotad", "quota", "post-consume", "--token-id", "4", "--amount", "-20"]);
        match cli.command {
            Some(Commands::Quota {
                command: QuotaCommands::PostConsume { token_id, amount },
            }) => {
                assert_eq!(token_id, 4);
                assert_eq!(amount, -20);
            }
            _ => panic!("expected quota post-consume"),
        }
    }

    #[test]
    fn test_help_is_handled_by_the_parser() {
        // main parses arguments before reading any environment config
        let err = Cli::try_parse_from(["quotad", "--help"]).err().unwrap();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
        let err = Cli::try_parse_from(["quotad", "token", "--help"]).err().unwrap();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
