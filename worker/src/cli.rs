//! CLI argument parsing for the contact-import-worker binary.

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "contact-import-worker", about = "Contact import pipeline worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start handlers and phase workers (default if no subcommand given)
    Serve {
        /// Only run the request handlers, leave phase work to other processes
        #[arg(long)]
        no_workers: bool,
    },
    /// Run database migrations and exit
    Migrate,
}
