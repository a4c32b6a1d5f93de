use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "manualdex",
    about = "Keyword search over indexed technical manuals"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Expansion tables file to use instead of the built-in set
    #[arg(long, global = true, env = "MANUALDEX_EXPANSIONS")]
    pub expansions: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Search manual pages
    Search(SearchArgs),
    /// Print grounding passages for an assistant prompt
    Context(ContextArgs),
    /// Print pages of one document
    Pages(PagesArgs),
    /// List tags with document counts
    Tags(TagsArgs),
    /// Show index statistics and recent queries
    Status(StatusArgs),
    /// Seed the store from a JSON manifest
    Load(LoadArgs),
    /// Show how a query is rewritten for the index
    Expand(ExpandArgs),
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return
    #[arg(short = 'n', long, default_value = "10")]
    pub limit: usize,

    /// Number of ranked results to skip
    #[arg(long, default_value = "0")]
    pub offset: usize,

    /// Restrict to one equipment code
    #[arg(short = 'e', long)]
    pub equipment: Option<String>,

    /// Restrict to one document class
    #[arg(short = 'd', long)]
    pub doc_class: Option<String>,

    /// Require a tag on the hit's document (repeatable)
    #[arg(short = 't', long = "tag")]
    pub tags: Vec<String>,

    /// Weigh hits by source authority
    #[arg(long)]
    pub authority: bool,

    /// Also look up troubleshooting cards
    #[arg(long)]
    pub cards: bool,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Context --

#[derive(Debug, Parser)]
pub struct ContextArgs {
    /// The question to ground
    pub query: String,

    /// Number of passages
    #[arg(short = 'n', long, default_value = "5")]
    pub limit: usize,

    /// Restrict to one equipment code
    #[arg(short = 'e', long)]
    pub equipment: Option<String>,

    /// Output passages as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Pages --

#[derive(Debug, Parser)]
pub struct PagesArgs {
    /// Document filename, or its leading identifier
    pub document: String,

    /// Page numbers; all pages when omitted
    pub pages: Vec<u32>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Tags --

#[derive(Debug, Parser)]
pub struct TagsArgs {
    /// Count only documents for this equipment code
    #[arg(short = 'e', long)]
    pub equipment: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Number of recent queries to show
    #[arg(long, default_value = "5")]
    pub recent: usize,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Load --

#[derive(Debug, Parser)]
pub struct LoadArgs {
    /// Path to the manifest file
    pub manifest: PathBuf,
}

// -- Expand --

#[derive(Debug, Parser)]
pub struct ExpandArgs {
    /// The query to rewrite
    pub query: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "manualdex",
            &mut std::io::stdout(),
        );
    }
}
