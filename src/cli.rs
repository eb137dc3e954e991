//! Command-line interface schema for medorg.
//!
//! Defines clap structs/enums for global flags and subcommands.
//! Long-form command text is sourced from `help_text`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod help_text;

/// Media-library custodian: fingerprints, backups, and duplicate handling
#[derive(Parser, Debug)]
#[command(
    name = "medorg",
    about,
    long_about = help_text::ROOT_LONG_ABOUT,
    disable_version_flag = true
)]
pub struct Cli {
    /// Change to directory before operating
    #[arg(short = 'C', value_name = "DIRECTORY", global = true)]
    pub directory: Option<PathBuf>,

    /// Path to the global config (defaults to a fixed file under $HOME)
    #[arg(long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Increase verbosity (-v for info, -vv for debug).
    /// Takes precedence over RUST_LOG.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Bring sidecar checksums up to date for one or more trees
    #[command(long_about = help_text::CHECK_LONG_ABOUT)]
    Check {
        /// Directories to walk
        #[arg(value_name = "DIR")]
        dirs: Vec<PathBuf>,

        /// Recompute every checksum and report content drift
        #[arg(long)]
        validate: bool,
    },

    /// Replicate source trees onto a destination volume
    #[command(long_about = help_text::BACKUP_LONG_ABOUT)]
    Backup {
        /// One or more source directories followed by the destination
        #[arg(value_name = "DIR")]
        paths: Vec<PathBuf>,

        /// Delete destination files no source explains
        #[arg(long)]
        delete_orphans: bool,

        /// Number of parallel copy workers
        #[arg(long, value_name = "N")]
        workers: Option<usize>,
    },

    /// Tag source records whose content already exists on a labeled volume
    #[command(long_about = help_text::DISCOVER_LONG_ABOUT)]
    Discover {
        /// A path on the backup volume
        #[arg(long, value_name = "DIR")]
        volume: PathBuf,

        /// Source directories to tag
        #[arg(value_name = "DIR")]
        dirs: Vec<PathBuf>,
    },

    /// Report files with identical content
    #[command(long_about = help_text::DUPES_LONG_ABOUT)]
    Dupes {
        /// One or two trees to compare
        #[arg(value_name = "DIR")]
        dirs: Vec<PathBuf>,
    },

    /// Add or remove tags on files in one directory
    #[command(long_about = help_text::TAG_LONG_ABOUT)]
    Tag {
        /// The directory holding the files
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Files to tag (names, not paths)
        #[arg(value_name = "FILE")]
        files: Vec<String>,

        /// Tag to add (repeatable)
        #[arg(long = "add", value_name = "TAG")]
        add: Vec<String>,

        /// Tag to remove (repeatable)
        #[arg(long = "remove", value_name = "TAG")]
        remove: Vec<String>,
    },

    /// Apply filename rules and prune duplicates
    #[command(long_about = help_text::AUTOFIX_LONG_ABOUT)]
    Autofix {
        /// Directories to fix
        #[arg(value_name = "DIR")]
        dirs: Vec<PathBuf>,

        /// Apply the configured rename rules
        #[arg(long)]
        rename: bool,

        /// Delete all but the best-scoring copy of duplicated content
        #[arg(long)]
        delete_dupes: bool,
    },
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}
