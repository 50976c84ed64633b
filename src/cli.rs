use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Notes directory to index
    #[clap(long, global = true, default_value = ".")]
    pub notes: PathBuf,

    /// Data directory holding config.yaml and the embedding cache.
    /// Defaults to $NOTEINDEX_BASE_PATH or ~/.local/share/noteindex
    #[clap(long, global = true)]
    pub base_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Bring the embedding cache up to date with the notes
    Index {
        /// Drop the cache and embed every note again
        #[clap(short, long, default_value = "false")]
        force: bool,
    },

    /// Find notes semantically similar to a query
    Search {
        query: String,

        /// Maximum number of results
        #[clap(short, long)]
        limit: Option<usize>,

        /// Only return results scoring above this similarity
        #[clap(short, long)]
        min_similarity: Option<f32>,
    },

    /// Keep the cache updated while notes change, until Ctrl+C
    Watch {},

    /// Show statistics of the persisted cache
    Stats {},

    /// Delete the persisted cache
    Clear {},
}
