//! CLI argument definitions using clap derive

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Cairn - reproducible resolution and content-addressed caching
///
/// Pins impure lookups in a lockfile, digests workspace content for cache
/// keys, and keeps the local cache within a disk budget.
#[derive(Parser, Debug)]
#[command(name = "cairn")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "CAIRN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Skip local .cairn.toml discovery
    #[arg(long, global = true)]
    pub no_local: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Query and update the resolver lockfile
    Lock(LockArgs),

    /// Digest workspace content
    Digest(DigestArgs),

    /// Inspect and collect the local cache
    Cache(CacheArgs),

    /// Show configuration
    Config(ConfigArgs),
}

/// Arguments for the lock command
#[derive(Parser, Debug)]
pub struct LockArgs {
    /// Lockfile path (defaults to lockfile.name in the current directory)
    #[arg(long, global = true)]
    pub lockfile: Option<PathBuf>,

    #[command(subcommand)]
    pub action: LockAction,
}

/// Lock subcommands
#[derive(Subcommand, Debug)]
pub enum LockAction {
    /// Print the locked output for a call
    Resolve {
        /// Resolver module (e.g. core)
        module: String,
        /// Resolver function (e.g. http.get)
        function: String,
        /// Inputs in order; JSON literals, otherwise taken as strings
        #[arg(short, long = "input")]
        inputs: Vec<String>,
        /// Output to pin and print when the call is not locked yet
        #[arg(long)]
        fallback: Option<String>,
    },

    /// Pin a call to an output
    Record {
        module: String,
        function: String,
        #[arg(short, long = "input")]
        inputs: Vec<String>,
        /// Output to pin, usually a content digest
        #[arg(short, long)]
        output: String,
        /// Replace an existing output even under conflict = "reject"
        #[arg(long)]
        relock: bool,
    },

    /// Remove a pinned call
    Remove {
        module: String,
        function: String,
        #[arg(short, long = "input")]
        inputs: Vec<String>,
    },

    /// List every pinned call
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Check the file is well-formed and canonical
    Verify,
}

/// Arguments for the digest command
#[derive(Parser, Debug)]
pub struct DigestArgs {
    /// Workspace root (defaults to current directory)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Output format
    #[arg(short, long, global = true, default_value = "plain")]
    pub format: OutputFormat,

    #[command(subcommand)]
    pub action: DigestAction,
}

/// Digest subcommands
#[derive(Subcommand, Debug)]
pub enum DigestAction {
    /// Digest a directory selection
    Dir {
        /// Directory relative to the workspace root
        path: String,
        /// Glob to include (repeatable; default everything)
        #[arg(long = "include")]
        includes: Vec<String>,
        /// Glob to exclude, `!glob` re-admits (repeatable, ordered)
        #[arg(long = "exclude", allow_hyphen_values = true)]
        excludes: Vec<String>,
    },

    /// Digest a single file
    File {
        /// File relative to the workspace root
        path: String,
    },
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,
}

/// Output format for list commands
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table
    Table,
    /// JSON output
    Json,
    /// Simple text (one per line)
    Plain,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// List cache entries
    List {
        /// Output format
        #[arg(short, long, default_value = "table")]
        format: OutputFormat,
    },

    /// Show total usage against the budget
    Usage,

    /// Print the enforced keep-bytes budget in bytes
    KeepBytes,

    /// Store a file as a new cache entry
    Add {
        /// File to store
        file: PathBuf,
        /// Entry description (defaults to the file name)
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Evict every inactive entry
    Prune,

    /// Run one budget-driven GC pass
    Gc {
        /// Show what would be evicted
        #[arg(long)]
        dry_run: bool,
    },
}
