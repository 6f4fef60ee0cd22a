use anyhow::Result;
use clap::{Parser, Subcommand};

use hindsight::cli::{add, delete, query, stats, topsites};
use hindsight::config::Config;
use hindsight::delegate::NoopDelegate;
use hindsight::HistoryBackend;

#[derive(Parser)]
#[command(name = "hindsight")]
#[command(about = "Browsing-history storage backend on SQLite")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "hindsight.yaml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a visit
    Add {
        url: String,

        /// Page title
        #[arg(short, long)]
        title: Option<String>,

        /// The URL was typed into the address bar
        #[arg(long)]
        typed: bool,

        /// Server redirect hop leading to the URL (repeatable, in order)
        #[arg(long = "redirect")]
        redirects: Vec<String>,
    },

    /// Search history
    Query {
        /// Text to match against URLs and titles; omit to browse
        text: Option<String>,

        /// Maximum number of results
        #[arg(short, long, default_value_t = 50)]
        max: usize,
    },

    /// Show a URL row and its visits
    Url { url: String },

    /// Top sites by decayed visit score
    TopSites {
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,
    },

    /// Delete URLs from history
    Delete { urls: Vec<String> },

    /// Show statistics
    Stats,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    // Load config
    let config = Config::load(&cli.config).unwrap_or_default();

    // Initialize backend
    let mut backend = HistoryBackend::open(config, Box::new(NoopDelegate));

    match cli.command {
        Commands::Add {
            url,
            title,
            typed,
            redirects,
        } => {
            add::run(&mut backend, &url, title, typed, redirects)?;
        }
        Commands::Query { text, max } => {
            query::run(&mut backend, text.as_deref(), max)?;
        }
        Commands::Url { url } => {
            query::show_url(&mut backend, &url)?;
        }
        Commands::TopSites { count } => {
            topsites::run(&mut backend, count)?;
        }
        Commands::Delete { urls } => {
            delete::run(&mut backend, &urls)?;
        }
        Commands::Stats => {
            stats::run(&mut backend)?;
        }
    }

    // Flush the open commit window before exiting
    backend.commit();

    Ok(())
}
