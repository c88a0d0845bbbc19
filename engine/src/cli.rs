//! CLI interface for Shield
//!
//! Defines the commands and global flags using clap's derive API.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Shield privacy pipeline
///
/// Turns a natural-language privacy request into a verified pipeline of
/// redaction tools and runs it against a video or audio file.
#[derive(Parser, Debug)]
#[command(name = "shield")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Plan and execute a privacy request against a media file
    Run {
        /// The request, e.g. "blur all faces"
        request: String,

        /// Video, audio or frame directory to process
        #[arg(short, long, value_name = "PATH")]
        input: PathBuf,
    },

    /// Print the manifest a request would run, without executing it
    Plan {
        /// The request to plan
        request: String,
    },

    /// List registered tools
    Tools,
}
