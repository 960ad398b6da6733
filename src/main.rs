//! # kb-assist CLI (`kba`)
//!
//! ## Usage
//!
//! ```bash
//! kba --config ./config/kba.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `kba ask <resource> "<query>"` | Run the full answer pipeline |
//! | `kba discover <resource> "<query>"` | Show the files discovery would use |
//! | `kba files <resource>` | List every file in a resource |
//! | `kba search <resource> "<query>"` | Raw chunk search |
//! | `kba keywords "<query>"` | Generate alternative keyword sets |
//! | `kba serve mcp` | Start the HTTP tool server and MCP endpoint |
//!
//! Every command accepts `--json` to print the raw tool output.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use kb_assist::backend::Services;
use kb_assist::commands::{self, AskArgs, QueryFlags};
use kb_assist::{config, logging, server};

/// Knowledge-base assistant: cited answers from a remote knowledge base.
///
/// Service endpoints are read from a TOML file; secrets come from the
/// environment. See `config/kba.example.toml`.
#[derive(Parser)]
#[command(name = "kba", version, about = "Knowledge-base question answering with citations")]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/kba.toml")]
    config: PathBuf,

    /// Print raw JSON output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Search flags shared by the query commands.
#[derive(Args, Clone, Default)]
struct SearchFlags {
    /// `hybrid_search`, `semantic_search`, `keyword_search` or `full_text_search`.
    #[arg(long)]
    search_method: Option<String>,

    /// Chunks retrieved per sub-query.
    #[arg(long)]
    top_k_recall: Option<usize>,

    /// Files kept after ranking.
    #[arg(long)]
    top_k_return: Option<usize>,

    /// Restrict search to one document.
    #[arg(long)]
    document: Option<String>,

    /// Let the model rewrite the query before searching.
    #[arg(long)]
    rewrite: bool,
}

impl From<SearchFlags> for QueryFlags {
    fn from(f: SearchFlags) -> Self {
        QueryFlags {
            search_method: f.search_method,
            top_k_recall: f.top_k_recall,
            top_k_return: f.top_k_return,
            document: f.document,
            rewrite: f.rewrite,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question with citations.
    Ask {
        /// Resource (dataset) id.
        resource: String,
        /// The question.
        query: String,

        #[command(flatten)]
        search: SearchFlags,

        /// `off`, `standard` or `comprehensive`.
        #[arg(long)]
        reflection_mode: Option<String>,

        /// Composite score an answer must reach (0..1).
        #[arg(long)]
        threshold: Option<f64>,

        /// Maximum refinement rounds (0..5).
        #[arg(long)]
        max_iterations: Option<u32>,

        /// Extra instructions passed to answer prompts.
        #[arg(long)]
        instructions: Option<String>,
    },

    /// Discover the files most relevant to a question.
    Discover {
        resource: String,
        query: String,

        #[command(flatten)]
        search: SearchFlags,

        /// Expected file name; repeat to build a recall report.
        #[arg(long = "expect")]
        expect: Vec<String>,

        /// Include coverage statistics (lists every file in the resource).
        #[arg(long)]
        stats: bool,
    },

    /// List every file in a resource.
    Files { resource: String },

    /// Search a resource and print raw chunks.
    Search {
        resource: String,
        query: String,

        #[command(flatten)]
        search: SearchFlags,

        /// Number of chunks to return.
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Generate alternative keyword sets for a question.
    Keywords {
        query: String,

        #[arg(long)]
        max_sets: Option<usize>,
    },

    /// Start a server.
    Serve {
        #[command(subcommand)]
        service: ServeService,
    },
}

#[derive(Subcommand)]
enum ServeService {
    /// Start the HTTP tool server with the MCP endpoint at `/mcp`.
    ///
    /// Binds to the address configured in `[server].bind`.
    Mcp,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    if let Commands::Serve {
        service: ServeService::Mcp,
    } = cli.command
    {
        return server::run_server(cfg).await;
    }

    let services = Arc::new(Services::from_config(cfg)?);
    match cli.command {
        Commands::Ask {
            resource,
            query,
            search,
            reflection_mode,
            threshold,
            max_iterations,
            instructions,
        } => {
            let args = AskArgs {
                resource,
                query,
                flags: search.into(),
                reflection_mode,
                threshold,
                max_iterations,
                instructions,
                json: cli.json,
            };
            commands::run_ask(services, args).await?;
        }
        Commands::Discover {
            resource,
            query,
            search,
            expect,
            stats,
        } => {
            commands::run_discover(
                services,
                &resource,
                &query,
                &search.into(),
                expect,
                stats,
                cli.json,
            )
            .await?;
        }
        Commands::Files { resource } => {
            commands::run_files(services, &resource, cli.json).await?;
        }
        Commands::Search {
            resource,
            query,
            search,
            top_k,
        } => {
            commands::run_search(services, &resource, &query, &search.into(), top_k, cli.json)
                .await?;
        }
        Commands::Keywords { query, max_sets } => {
            commands::run_keywords(services, &query, max_sets, cli.json).await?;
        }
        Commands::Serve { .. } => {}
    }

    Ok(())
}
