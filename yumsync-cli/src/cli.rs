use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "yumsync",
    version,
    about = "Simplified yum mirror management",
    arg_required_else_help = true
)]
pub struct Args {
    /// Path to the Yumfile
    #[arg(short = 'f', long, default_value = "./Yumfile", global = true)]
    pub file: PathBuf,

    /// Directory for cached upstream metadata
    #[arg(short = 'c', long, default_value = "./.yumsync-cache", global = true)]
    pub cache: PathBuf,

    /// Limit the number of parallel downloads
    #[arg(short = 'j', long, default_value_t = 3, global = true)]
    pub parallel: usize,

    /// Print debug output
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Suppress everything except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a Yumfile's syntax
    Validate,

    /// List repositories in a Yumfile
    List,

    /// Synchronize repos described in a Yumfile
    Sync {
        /// Only synchronize the repo with this id
        repo_id: Option<String>,
    },
}
