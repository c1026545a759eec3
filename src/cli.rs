use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Command-line options for mailwatch.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Config file (defaults to $MAILWATCH_CONFIG, then the user config dir).
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Keep every enabled account connected and print new mail as JSON lines.
    Watch {
        /// Only these accounts (default: all enabled).
        #[arg(long = "account", short = 'a')]
        accounts: Vec<String>,
    },
    /// Log in and out once to check an account's settings.
    Test {
        #[arg(long, short)]
        account: String,
    },
    /// Retrieve past messages for one account and print them as JSON lines.
    Sync {
        #[arg(long, short)]
        account: String,
        /// How far back to go; omit for the whole mailbox.
        #[arg(long)]
        days: Option<u32>,
    },
    /// Show the provider profile each configured account maps to.
    Providers,
}
