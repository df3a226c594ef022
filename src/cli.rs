//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

use mirror_core::AssetTypeFilter;

/// Mirror a creator's post catalog into a local folder tree.
///
/// Files land in OUTPUT_DIR/user_{id}/post_{id}/. Interrupted runs can be
/// continued with `resume`; finished files are never downloaded twice.
///
/// Exit codes: 0 success, 2 some posts or files failed, 1 fatal error,
/// 130 interrupted.
#[derive(Parser, Debug)]
#[command(name = "creator-mirror")]
#[command(author, version, about)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Options shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output and the progress spinner
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log filter directive, e.g. `debug` or `mirror_core=trace` (RUST_LOG wins)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Also write logs (without colors) to this file
    #[arg(long, global = true, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Read defaults from this config file instead of the default location
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mirror a user's whole catalog, starting from the first page
    Run(UserArgs),

    /// Retry unfinished files, then continue the catalog from where the last run stopped
    Resume(UserArgs),

    /// Mirror only the given posts of a user
    Posts(PostsArgs),
}

impl Command {
    /// Options common to all run modes.
    pub fn options(&self) -> &MirrorArgs {
        match self {
            Self::Run(args) | Self::Resume(args) => &args.options,
            Self::Posts(args) => &args.options,
        }
    }

    /// Target user.
    pub fn user_id(&self) -> &str {
        match self {
            Self::Run(args) | Self::Resume(args) => &args.user_id,
            Self::Posts(args) => &args.user_id,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct UserArgs {
    /// Remote user identifier
    pub user_id: String,

    #[command(flatten)]
    pub options: MirrorArgs,
}

#[derive(Args, Debug, Clone)]
pub struct PostsArgs {
    /// Remote user identifier
    pub user_id: String,

    /// Post identifiers to mirror
    #[arg(required = true, num_args = 1..)]
    pub post_ids: Vec<String>,

    #[command(flatten)]
    pub options: MirrorArgs,
}

/// How catalog and post pages are read.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterKind {
    /// Scrape the HTML pages
    Html,
    /// Read the `/api/v1` JSON endpoints
    Api,
}

/// Run options. Unset options fall back to the config file, then to
/// built-in defaults.
#[derive(Args, Debug, Clone, Default)]
pub struct MirrorArgs {
    /// Directory under which user_{id}/ is created
    #[arg(short = 'o', long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Site root URL
    #[arg(long, value_name = "URL")]
    pub site: Option<String>,

    /// Service segment of the user's URLs (e.g. patreon, fanbox)
    #[arg(long)]
    pub service: Option<String>,

    /// Page reader
    #[arg(long, value_enum)]
    pub adapter: Option<AdapterKind>,

    /// Maximum concurrent downloads (1-100)
    #[arg(short = 'c', long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub concurrency: Option<u8>,

    /// Maximum outstanding HTTP requests (1-100)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub max_in_flight: Option<u8>,

    /// Minimum delay between requests in milliseconds (0 to disable, max 60000)
    #[arg(short = 'd', long, value_name = "MS", value_parser = clap::value_parser!(u64).range(0..=60000))]
    pub delay_ms: Option<u64>,

    /// Maximum retry attempts for transient failures (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Base retry backoff in milliseconds (max 600000)
    #[arg(long, value_name = "MS", value_parser = clap::value_parser!(u64).range(0..=600_000))]
    pub retry_delay_ms: Option<u64>,

    /// Request timeout in seconds (1-3600)
    #[arg(short = 't', long, value_name = "SECS", value_parser = clap::value_parser!(u64).range(1..=3600))]
    pub timeout_secs: Option<u64>,

    /// Download files again even when a verified copy exists
    #[arg(long)]
    pub no_skip_existing: bool,

    /// Accept invalid TLS certificates
    #[arg(long)]
    pub insecure: bool,

    /// User-Agent header
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Only process these post ids (repeatable)
    #[arg(long = "post-filter", value_name = "POST_ID")]
    pub post_filter: Vec<String>,

    /// Which assets to keep: all, images or media
    #[arg(long, value_name = "KIND")]
    pub assets: Option<AssetTypeFilter>,

    /// Stop after this many posts
    #[arg(long)]
    pub max_posts: Option<usize>,

    /// Posts per catalog page (offset step)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    pub page_size: Option<u64>,

    /// Also retry files that failed permanently in earlier runs (resume only)
    #[arg(long)]
    pub retry_failed: bool,
}
