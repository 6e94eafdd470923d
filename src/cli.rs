use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::scenario::Scenario;

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// YAML engine config; `DRAFTSYNC_*` variables override it.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Recover a JSON value from malformed model output.
    Repair(RepairArgs),
    /// Build a flat, ordered outline from an outline payload.
    Outline(OutlineArgs),
    /// Replay a recorded response stream against a document.
    Replay(ReplayArgs),
    /// Stream a live generation from the backend into a document.
    Generate(GenerateArgs),
    /// Estimate page breaks for an outline or measured blocks.
    Paginate(PaginateArgs),
    /// Download a rendered document from the export service.
    Export(ExportArgs),
}

#[derive(Debug, Args)]
pub struct RepairArgs {
    /// Input file, or `-` for stdin.
    #[arg(long, default_value = "-")]
    pub input: PathBuf,

    /// Print repair classification counts to stderr.
    #[arg(long, default_value_t = false)]
    pub stats: bool,
}

#[derive(Debug, Args)]
pub struct OutlineArgs {
    /// Outline payload (any JSON shape the outline builder accepts; may be malformed).
    #[arg(long)]
    pub input: PathBuf,

    /// Output file; stdout when omitted.
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Emit nested sections instead of the flat pre-order list.
    #[arg(long, default_value_t = false)]
    pub nested: bool,
}

#[derive(Debug, Args)]
pub struct DocumentArgs {
    /// Workspace directory holding persisted documents.
    #[arg(long)]
    pub workspace: PathBuf,

    /// Document identifier.
    #[arg(long, default_value = "document")]
    pub document: String,

    /// Starting outline file. Omit to start from an empty document.
    #[arg(long)]
    pub outline: Option<PathBuf>,

    /// Section to write locally; omit for a whole-document generation.
    #[arg(long)]
    pub section: Option<String>,

    /// Force a scenario instead of detecting one from the query.
    #[arg(long, value_enum)]
    pub scenario: Option<Scenario>,

    /// Query text used for scenario detection.
    #[arg(long, default_value = "")]
    pub query: String,

    /// Write the resulting sections to this file as JSON.
    #[arg(long)]
    pub sections_out: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    /// Recorded stream (newline-delimited records).
    #[arg(long)]
    pub stream: PathBuf,

    /// Characters per replayed chunk.
    #[arg(long, default_value_t = 64)]
    pub chunk_chars: usize,

    #[command(flatten)]
    pub document: DocumentArgs,
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    /// Streaming endpoint (POST).
    #[arg(long)]
    pub endpoint: String,

    /// Sampling temperature override (clamped to 0..=2).
    #[arg(long)]
    pub temperature: Option<f32>,

    /// Nucleus sampling override (clamped to 0..=1).
    #[arg(long)]
    pub top_p: Option<f32>,

    /// Response token limit override; capped by the backend maximum.
    #[arg(long)]
    pub max_tokens: Option<u32>,

    #[command(flatten)]
    pub document: DocumentArgs,
}

#[derive(Debug, Args)]
pub struct PaginateArgs {
    /// Outline file; block heights are estimated from section text.
    #[arg(long, conflicts_with = "blocks")]
    pub outline: Option<PathBuf>,

    /// Measured blocks as a JSON array.
    #[arg(long)]
    pub blocks: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct ExportArgs {
    /// Export service base URL; downloads the rendered artifact.
    #[arg(long, required_unless_present = "workspace", conflicts_with = "workspace")]
    pub base_url: Option<String>,

    /// Workspace holding the persisted document. Writes `<document>.md` for an
    /// external renderer instead of downloading.
    #[arg(long)]
    pub workspace: Option<PathBuf>,

    /// Section list (as written by `--sections-out`) used to restore an empty or
    /// truncated body.
    #[arg(long, requires = "workspace")]
    pub sections: Option<PathBuf>,

    /// Document identifier.
    #[arg(long)]
    pub document: String,

    /// Output directory for the downloaded artifact.
    #[arg(long)]
    pub out: PathBuf,
}
