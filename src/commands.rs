use std::io::{Read as _, Write as _};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use serde::Serialize;

use crate::cli::{
    DocumentArgs, ExportArgs, GenerateArgs, OutlineArgs, PaginateArgs, RepairArgs, ReplayArgs,
};
use crate::config::EngineConfig;
use crate::export::{ExportArtifact, HttpExporter, select_export_body};
use crate::formats::{Focus, Section, SectionId};
use crate::json_repair::{RepairStats, parse_tolerant_capped};
use crate::outline::{build_outline, nest};
use crate::paginate::{SectionBlock, TextMetrics, estimate_blocks, paginate};
use crate::persist::{DocumentStore as _, LocalFsDocumentStore};
use crate::scenario::Scenario;
use crate::session::{DraftSession, GenerationOutcome, Notification};
use crate::stream::{ChunkSource, HttpChunkSource, ReplayChunkSource};

pub fn repair(args: RepairArgs, config: &EngineConfig) -> anyhow::Result<()> {
    let raw = if args.input.as_os_str() == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("read stdin")?;
        raw
    } else {
        std::fs::read_to_string(&args.input)
            .with_context(|| format!("read input: {}", args.input.display()))?
    };

    let stats = RepairStats::default();
    let value = parse_tolerant_capped(&raw, &stats, config.max_extraction_candidates)
        .context("recover json")?;
    if args.stats {
        let counts = serde_json::to_string(&stats.snapshot()).context("serialize counts")?;
        eprintln!("{counts}");
    }
    print_json(&value)
}

pub fn outline(args: OutlineArgs, config: &EngineConfig) -> anyhow::Result<()> {
    let sections = read_outline(&args.input, config)?;
    let json = if args.nested {
        serde_json::to_string_pretty(&nest(&sections))
    } else {
        serde_json::to_string_pretty(&sections)
    }
    .context("serialize outline")?;

    match args.out {
        Some(out) => std::fs::write(&out, format!("{json}\n"))
            .with_context(|| format!("write outline: {}", out.display())),
        None => {
            let mut stdout = std::io::stdout().lock();
            writeln!(stdout, "{json}").context("write stdout")
        }
    }
}

pub async fn replay(args: ReplayArgs, config: EngineConfig) -> anyhow::Result<()> {
    let mut source = ReplayChunkSource::from_file(&args.stream, args.chunk_chars)?;
    let document = &args.document;
    let mut session = open_session(document, config).await?;
    let focus = focus_of(document);
    let scenario = session.detect_scenario(&focus, &document.query, document.scenario);
    tracing::info!(stream = %args.stream.display(), ?scenario, "replaying recorded stream");
    finish(document, &mut session, focus, scenario, &mut source).await
}

pub async fn generate(args: GenerateArgs, config: EngineConfig) -> anyhow::Result<()> {
    let endpoint = url::Url::parse(&args.endpoint)
        .with_context(|| format!("invalid endpoint: {}", args.endpoint))?;
    let retry = config.retry_policy();
    let document = &args.document;

    let mut session = open_session(document, config).await?;
    let focus = focus_of(document);
    let scenario = session.detect_scenario(&focus, &document.query, document.scenario);
    let mut request = session.stream_request(&document.query, &focus, scenario);
    request.params = request
        .params
        .with_overrides(args.temperature, args.top_p, args.max_tokens);
    let client = reqwest::Client::new();
    let mut source = HttpChunkSource::open(&client, &endpoint, &request, retry)
        .await
        .context("open stream")?;
    finish(document, &mut session, focus, scenario, &mut source).await
}

async fn finish(
    document: &DocumentArgs,
    session: &mut DraftSession,
    focus: Focus,
    scenario: Scenario,
    source: &mut dyn ChunkSource,
) -> anyhow::Result<()> {
    let result = session.run(source, focus, scenario).await;
    let notifications = session.drain_notifications();
    for notification in &notifications {
        tracing::info!(
            level = ?notification.level,
            retryable = notification.retryable,
            "{}",
            notification.message
        );
    }
    let outcome = result.context("generation failed")?;

    if let Some(path) = &document.sections_out {
        let json =
            serde_json::to_string_pretty(session.sections()).context("serialize sections")?;
        std::fs::write(path, format!("{json}\n"))
            .with_context(|| format!("write sections: {}", path.display()))?;
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Report<'a> {
        outcome: &'a GenerationOutcome,
        notifications: &'a [Notification],
        revision: u64,
        sections: usize,
        pages: usize,
    }
    print_json(&Report {
        outcome: &outcome,
        notifications: &notifications,
        revision: session.snapshot().revision,
        sections: session.sections().len(),
        pages: session.preview().page_count,
    })
}

async fn open_session(
    document: &DocumentArgs,
    config: EngineConfig,
) -> anyhow::Result<DraftSession> {
    let sections = match &document.outline {
        Some(path) => read_outline(path, &config)?,
        None => Vec::new(),
    };
    if let Some(section) = &document.section
        && !sections.iter().any(|s| s.id.as_str() == section)
    {
        anyhow::bail!("section {section} is not in the outline");
    }
    let store = Arc::new(LocalFsDocumentStore::new(&document.workspace));
    DraftSession::open(document.document.clone(), sections, store, config)
        .await
        .with_context(|| format!("open document {}", document.document))
}

fn focus_of(document: &DocumentArgs) -> Focus {
    match &document.section {
        Some(id) => Focus::Local(SectionId::new(id.clone())),
        None => Focus::Global,
    }
}

pub fn paginate_command(args: PaginateArgs, config: &EngineConfig) -> anyhow::Result<()> {
    let blocks: Vec<SectionBlock> = match (&args.blocks, &args.outline) {
        (Some(path), _) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("read blocks: {}", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parse blocks: {}", path.display()))?
        }
        (None, Some(path)) => {
            estimate_blocks(&read_outline(path, config)?, &TextMetrics::default())
        }
        (None, None) => anyhow::bail!("either --outline or --blocks is required"),
    };
    print_json(&paginate(&blocks, &config.geometry()))
}

pub async fn export(args: ExportArgs, config: &EngineConfig) -> anyhow::Result<()> {
    let artifact = match (&args.base_url, &args.workspace) {
        (Some(base_url), _) => {
            let base_url = url::Url::parse(base_url)
                .with_context(|| format!("invalid base url: {base_url}"))?;
            HttpExporter::new(reqwest::Client::new(), base_url)
                .export(&args.document)
                .await?
        }
        (None, Some(workspace)) => {
            local_export(workspace, args.sections.as_deref(), &args.document, config).await?
        }
        (None, None) => anyhow::bail!("either --base-url or --workspace is required"),
    };
    let path = artifact.write_to(&args.out).await?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", path.display()).context("write stdout")
}

async fn local_export(
    workspace: &Path,
    sections: Option<&Path>,
    document_id: &str,
    config: &EngineConfig,
) -> anyhow::Result<ExportArtifact> {
    let store = LocalFsDocumentStore::new(workspace);
    let stored = store
        .load(document_id)
        .await
        .with_context(|| format!("load document {document_id}"))?
        .map(|document| document.body)
        .unwrap_or_default();
    let sections = match sections {
        Some(path) => read_outline(path, config)?,
        None => Vec::new(),
    };
    let Some(body) = select_export_body(&stored, &sections) else {
        anyhow::bail!("document {document_id} has nothing to export");
    };
    Ok(ExportArtifact {
        filename: format!("{document_id}.md"),
        content_type: Some("text/markdown".to_owned()),
        bytes: body.text.into_bytes(),
    })
}

fn read_outline(path: &Path, config: &EngineConfig) -> anyhow::Result<Vec<Section>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read outline: {}", path.display()))?;
    let value =
        parse_tolerant_capped(&raw, &RepairStats::default(), config.max_extraction_candidates)
            .with_context(|| format!("recover outline json: {}", path.display()))?;
    let build =
        build_outline(&value).with_context(|| format!("build outline: {}", path.display()))?;
    Ok(build.sections)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{json}").context("write stdout")
}
