use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::fs;

use crate::error::ValidationWarning;
use crate::formats::{Section, SectionId, SectionStatus};
use crate::outline::{OutlineNode, nest};

/// Bodies longer than this are protected by the shrink guard.
pub const SHRINK_GUARD_MIN_CHARS: usize = 500;
/// A protected body may shrink to no less than this share of its length (percent).
pub const SHRINK_GUARD_KEEP_PERCENT: usize = 70;

/// Compact outline metadata stored next to the rendered body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineEntry {
    pub id: SectionId,
    pub title: String,
    pub target_words: u32,
    pub status: SectionStatus,
    pub parent_id: Option<SectionId>,
    pub content_length: usize,
}

pub fn outline_entries(sections: &[Section]) -> Vec<OutlineEntry> {
    sections
        .iter()
        .map(|section| OutlineEntry {
            id: section.id.clone(),
            title: section.title.clone(),
            target_words: section.target_words,
            status: section.status,
            parent_id: section.parent_id.clone(),
            content_length: section.content.chars().count(),
        })
        .collect()
}

/// Nested markdown in parent order. Roots render as `#`, each level adds one marker.
pub fn render_document_body(sections: &[Section]) -> String {
    fn render(nodes: &[OutlineNode], depth: usize, out: &mut String) {
        for node in nodes {
            let marks = "#".repeat((depth + 1).min(6));
            out.push_str(&format!("{marks} {}\n\n", node.section.title.trim()));
            let content = clean_ai_metadata(&node.section.content);
            if !content.is_empty() {
                out.push_str(&content);
                out.push_str("\n\n");
            }
            render(&node.children, depth + 1, out);
        }
    }

    let mut out = String::new();
    render(&nest(sections), 0, &mut out);
    out.trim_end().to_owned()
}

/// Removes word-count statistics blocks the model appends to its prose. A block
/// starts at a `📊 字数统计：` line (or a `字数统计` heading) and runs to the next
/// blank line or heading; a `---` rule right before it goes too.
pub fn clean_ai_metadata(content: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut skipping = false;
    for line in content.lines() {
        let trimmed = line.trim();
        if skipping {
            if trimmed.is_empty() || (trimmed.starts_with('#') && !is_stats_start(trimmed)) {
                skipping = false;
            } else {
                continue;
            }
        }
        if is_stats_start(trimmed) {
            skipping = true;
            while kept.last().is_some_and(|prev| {
                let prev = prev.trim();
                prev.is_empty() || (prev.len() >= 3 && prev.chars().all(|c| c == '-'))
            }) {
                kept.pop();
            }
            continue;
        }
        kept.push(line);
    }
    kept.join("\n").trim().to_owned()
}

fn is_stats_start(line: &str) -> bool {
    let stripped = line.trim_start_matches(|c: char| c == '#' || c == '-' || c.is_whitespace());
    if let Some(rest) = stripped.strip_prefix('📊') {
        return rest.trim_start().starts_with("字数统计：");
    }
    line.starts_with('#') && stripped.trim() == "字数统计"
}

/// Characters a reader would see once the markdown is rendered.
pub fn visible_chars(body: &str) -> usize {
    Parser::new_ext(body, Options::ENABLE_TABLES)
        .map(|event| match event {
            Event::Text(text) | Event::Code(text) => text.chars().filter(|c| !c.is_whitespace()).count(),
            _ => 0,
        })
        .sum()
}

pub fn validate_body(body: &str, min_chars: usize) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();
    let has_top_heading = Parser::new(body).any(|event| {
        matches!(
            event,
            Event::Start(Tag::Heading {
                level: HeadingLevel::H1,
                ..
            })
        )
    });
    if !has_top_heading {
        warnings.push(ValidationWarning::MissingTopLevelHeading);
    }
    let chars = visible_chars(body);
    if chars < min_chars {
        warnings.push(ValidationWarning::BodyTooShort {
            chars,
            min: min_chars,
        });
    }
    warnings
}

pub fn fingerprint(body: &str, outline: &[OutlineEntry]) -> anyhow::Result<String> {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hasher.update(serde_json::to_vec(outline).context("serialize outline")?);
    Ok(hex::encode(hasher.finalize()))
}

/// Moments at which the document is considered stable enough to save.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettleKind {
    OutlineGenerated,
    DraftCompleted,
    PolishCompleted,
    ManualEdit,
}

impl SettleKind {
    fn bypasses_shrink_guard(self) -> bool {
        matches!(self, Self::OutlineGenerated | Self::ManualEdit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedDocument {
    pub document_id: String,
    pub body: String,
    pub outline: Vec<OutlineEntry>,
    pub settle: SettleKind,
    pub fingerprint: String,
    pub saved_at: DateTime<Utc>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn save(&self, document: &PersistedDocument) -> anyhow::Result<()>;
    async fn load(&self, document_id: &str) -> anyhow::Result<Option<PersistedDocument>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DocumentMeta {
    document_id: String,
    settle: SettleKind,
    fingerprint: String,
    saved_at: DateTime<Utc>,
}

/// `<base>/documents/<id>/{body.md,outline.json,meta.json}`, each replaced atomically.
#[derive(Debug, Clone)]
pub struct LocalFsDocumentStore {
    base_dir: PathBuf,
}

impl LocalFsDocumentStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn document_dir(&self, document_id: &str) -> PathBuf {
        self.base_dir.join("documents").join(document_id)
    }
}

#[async_trait]
impl DocumentStore for LocalFsDocumentStore {
    async fn save(&self, document: &PersistedDocument) -> anyhow::Result<()> {
        let dir = self.document_dir(&document.document_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create document dir: {}", dir.display()))?;

        write_atomic(&dir.join("body.md"), document.body.as_bytes())
            .await
            .context("write body.md")?;
        let outline = serde_json::to_vec_pretty(&document.outline).context("serialize outline")?;
        write_atomic(&dir.join("outline.json"), &outline)
            .await
            .context("write outline.json")?;
        let meta = DocumentMeta {
            document_id: document.document_id.clone(),
            settle: document.settle,
            fingerprint: document.fingerprint.clone(),
            saved_at: document.saved_at,
        };
        let meta = serde_json::to_vec_pretty(&meta).context("serialize meta")?;
        write_atomic(&dir.join("meta.json"), &meta)
            .await
            .context("write meta.json")?;
        Ok(())
    }

    async fn load(&self, document_id: &str) -> anyhow::Result<Option<PersistedDocument>> {
        let dir = self.document_dir(document_id);
        let Some(meta) = read_optional(&dir.join("meta.json")).await? else {
            return Ok(None);
        };
        let meta: DocumentMeta = serde_json::from_slice(&meta).context("parse meta.json")?;
        let body = read_optional(&dir.join("body.md"))
            .await?
            .map(String::from_utf8)
            .transpose()
            .context("body.md is not utf-8")?
            .unwrap_or_default();
        let outline = match read_optional(&dir.join("outline.json")).await? {
            Some(bytes) => serde_json::from_slice(&bytes).context("parse outline.json")?,
            None => Vec::new(),
        };
        Ok(Some(PersistedDocument {
            document_id: meta.document_id,
            body,
            outline,
            settle: meta.settle,
            fingerprint: meta.fingerprint,
            saved_at: meta.saved_at,
        }))
    }
}

async fn read_optional(path: &Path) -> anyhow::Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read: {}", path.display())),
    }
}

async fn write_atomic(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp_path, data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    Saved { fingerprint: String },
    Unchanged,
    ShrinkRefused { previous: usize, next: usize },
    /// The save failed; it is retried at the next settle point.
    Deferred { reason: String },
}

/// Saves the document at settle points and remembers what was last written.
pub struct Persister {
    store: Arc<dyn DocumentStore>,
    document_id: String,
    min_body_chars: usize,
    last_fingerprint: Option<String>,
    last_body_chars: usize,
    retry_pending: bool,
}

impl Persister {
    pub fn new(store: Arc<dyn DocumentStore>, document_id: impl Into<String>, min_body_chars: usize) -> Self {
        Self {
            store,
            document_id: document_id.into(),
            min_body_chars,
            last_fingerprint: None,
            last_body_chars: 0,
            retry_pending: false,
        }
    }

    /// Seeds the fingerprint and shrink guard from what is already stored.
    pub async fn prime(&mut self) -> anyhow::Result<()> {
        if let Some(existing) = self
            .store
            .load(&self.document_id)
            .await
            .with_context(|| format!("load document {}", self.document_id))?
        {
            self.last_body_chars = existing.body.chars().count();
            self.last_fingerprint = Some(existing.fingerprint);
        }
        Ok(())
    }

    pub fn retry_pending(&self) -> bool {
        self.retry_pending
    }

    pub async fn settle(&mut self, kind: SettleKind, sections: &[Section]) -> SettleOutcome {
        let body = render_document_body(sections);
        let outline = outline_entries(sections);
        for warning in validate_body(&body, self.min_body_chars) {
            tracing::warn!(document_id = %self.document_id, %warning, "body validation");
        }

        let fingerprint = match fingerprint(&body, &outline) {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                self.retry_pending = true;
                return SettleOutcome::Deferred {
                    reason: format!("{err:#}"),
                };
            }
        };
        if self.last_fingerprint.as_deref() == Some(fingerprint.as_str()) && !self.retry_pending {
            tracing::debug!(document_id = %self.document_id, ?kind, "document unchanged; skipping save");
            return SettleOutcome::Unchanged;
        }

        let next = body.chars().count();
        let previous = self.last_body_chars;
        if !kind.bypasses_shrink_guard()
            && previous > SHRINK_GUARD_MIN_CHARS
            && next * 100 < previous * SHRINK_GUARD_KEEP_PERCENT
        {
            tracing::warn!(document_id = %self.document_id, previous, next, ?kind, "refusing to shrink stored body");
            return SettleOutcome::ShrinkRefused { previous, next };
        }

        let document = PersistedDocument {
            document_id: self.document_id.clone(),
            body,
            outline,
            settle: kind,
            fingerprint: fingerprint.clone(),
            saved_at: Utc::now(),
        };
        match self.store.save(&document).await {
            Ok(()) => {
                tracing::info!(
                    document_id = %self.document_id,
                    ?kind,
                    chars = next,
                    sections = document.outline.len(),
                    "document saved"
                );
                self.last_fingerprint = Some(fingerprint.clone());
                self.last_body_chars = next;
                self.retry_pending = false;
                SettleOutcome::Saved { fingerprint }
            }
            Err(err) => {
                let reason = format!("{err:#}");
                tracing::warn!(document_id = %self.document_id, %reason, "save failed; retrying at next settle point");
                self.retry_pending = true;
                SettleOutcome::Deferred { reason }
            }
        }
    }
}
