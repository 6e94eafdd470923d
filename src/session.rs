//! One document's generation lifecycle: transport chunks in, merged outline and
//! persisted body out.
//!
//! A session owns the canonical outline. Failures inside a generation degrade to
//! "keep what is there, mark status, tell the user" and never discard content.

use std::sync::Arc;

use serde::Serialize;

use crate::config::EngineConfig;
use crate::demux::{LocalScope, StreamMessage, sanitize_local_body};
use crate::error::{EngineError, Warning};
use crate::formats::{Focus, Section, SectionId, SectionStatus};
use crate::json_repair::{RepairCounts, RepairStats, parse_tolerant_capped};
use crate::merge::{
    MergeReport, OutlineSnapshot, OutlineStore, SectionEdit, StreamLedger, updates_from_snapshot,
};
use crate::outline::{OutlineBuild, build_outline};
use crate::paginate::{Pagination, PreviewLayout, TextMetrics, estimate_blocks};
use crate::persist::{DocumentStore, Persister, SettleKind, SettleOutcome};
use crate::scenario::{Scenario, ScenarioContext, detect};
use crate::stream::{ChunkSource, RecordDecoder, StreamEvent, StreamRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Info,
    Warning,
    Error,
}

/// User-facing message produced by a session operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub retryable: bool,
}

impl Notification {
    fn info(message: impl Into<String>) -> Self {
        Self {
            level: NotificationLevel::Info,
            message: message.into(),
            retryable: false,
        }
    }

    fn warning(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            level: NotificationLevel::Warning,
            message: message.into(),
            retryable,
        }
    }

    fn error(message: impl Into<String>, retryable: bool) -> Self {
        Self {
            level: NotificationLevel::Error,
            message: message.into(),
            retryable,
        }
    }
}

/// State of one in-flight stream.
#[derive(Debug)]
pub struct Generation {
    focus: Focus,
    scenario: Scenario,
    decoder: RecordDecoder,
    message: StreamMessage,
    ledger: StreamLedger,
    scope: Option<LocalScope>,
    thread_id: Option<String>,
    backend_error: Option<String>,
    created: Vec<SectionId>,
}

impl Generation {
    pub fn focus(&self) -> &Focus {
        &self.focus
    }

    pub fn message(&self) -> &StreamMessage {
        &self.message
    }

    /// Body text as the preview should show it right now.
    pub fn live_body(&self) -> String {
        match &self.scope {
            Some(scope) => sanitize_local_body(self.message.body(), scope),
            None => self.message.body().trim().to_owned(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOutcome {
    pub scenario: Scenario,
    pub thread_id: Option<String>,
    pub created: Vec<SectionId>,
    pub updated: Vec<SectionId>,
    pub warnings: Vec<String>,
    pub outline_pending: bool,
    pub skipped_records: usize,
    pub saved: bool,
}

pub struct DraftSession {
    document_id: String,
    outline: OutlineStore,
    persister: Persister,
    config: EngineConfig,
    repair_stats: Arc<RepairStats>,
    preview: PreviewLayout,
    metrics: TextMetrics,
    proposal: Option<OutlineBuild>,
    thread_id: Option<String>,
    generating: bool,
    notifications: Vec<Notification>,
}

impl DraftSession {
    pub async fn open(
        document_id: impl Into<String>,
        sections: Vec<Section>,
        store: Arc<dyn DocumentStore>,
        config: EngineConfig,
    ) -> anyhow::Result<Self> {
        let document_id = document_id.into();
        let mut persister = Persister::new(store, document_id.clone(), config.min_body_chars);
        persister.prime().await?;
        let mut session = Self {
            preview: PreviewLayout::new(config.geometry()),
            document_id,
            outline: OutlineStore::new(sections),
            persister,
            config,
            repair_stats: Arc::new(RepairStats::default()),
            metrics: TextMetrics::default(),
            proposal: None,
            thread_id: None,
            generating: false,
            notifications: Vec::new(),
        };
        session.refresh_preview();
        Ok(session)
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    pub fn sections(&self) -> &[Section] {
        self.outline.sections()
    }

    pub fn snapshot(&self) -> OutlineSnapshot {
        self.outline.snapshot()
    }

    pub fn is_generating(&self) -> bool {
        self.generating
    }

    pub fn preview(&self) -> &Pagination {
        self.preview.pagination()
    }

    pub fn repair_counts(&self) -> RepairCounts {
        self.repair_stats.snapshot()
    }

    pub fn pending_outline(&self) -> Option<&OutlineBuild> {
        self.proposal.as_ref()
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    pub fn detect_scenario(&self, focus: &Focus, query: &str, explicit: Option<Scenario>) -> Scenario {
        detect(&ScenarioContext {
            explicit,
            focus,
            has_outline: !self.outline.sections().is_empty(),
            already_written: self
                .outline
                .sections()
                .iter()
                .any(|s| !s.content.trim().is_empty()),
            query,
            system_prompt: "",
        })
    }

    pub fn stream_request(&self, query: &str, focus: &Focus, scenario: Scenario) -> StreamRequest {
        let mut request = StreamRequest::new(
            query,
            focus,
            scenario,
            scenario.params(),
            self.outline.sections(),
        );
        request.thread_id = self.thread_id.clone();
        request
    }

    /// Starts a generation. Only one may be active per document.
    pub fn begin(&mut self, focus: Focus, scenario: Scenario) -> Result<Generation, EngineError> {
        if self.generating {
            return Err(EngineError::Busy {
                document_id: self.document_id.clone(),
            });
        }
        let scope = match &focus {
            Focus::Local(id) => {
                let scope = LocalScope::for_section(self.outline.sections(), id)
                    .ok_or_else(|| EngineError::UnknownSection(id.clone()))?;
                self.outline.set_status(id, SectionStatus::Writing)?;
                Some(scope)
            }
            Focus::Global => None,
        };
        self.generating = true;
        tracing::info!(document_id = %self.document_id, ?focus, ?scenario, "generation started");
        Ok(Generation {
            focus,
            scenario,
            decoder: RecordDecoder::default(),
            message: StreamMessage::new(self.config.disclosure_phrases.clone()),
            ledger: StreamLedger::default(),
            scope,
            thread_id: None,
            backend_error: None,
            created: Vec::new(),
        })
    }

    pub fn feed(&mut self, generation: &mut Generation, chunk: &str) {
        for event in generation.decoder.push(chunk) {
            self.apply_event(generation, event);
        }
    }

    fn apply_event(&mut self, generation: &mut Generation, event: StreamEvent) {
        if let Some(thread_id) = event.thread_id {
            generation.thread_id = Some(thread_id);
        }
        if let Some(error) = event.error {
            tracing::warn!(document_id = %self.document_id, %error, "backend reported an error");
            generation.backend_error = Some(error);
        }
        if let Some(state) = &event.snapshot {
            let updates = updates_from_snapshot(state);
            if !updates.is_empty() {
                let report = self.outline.apply_snapshot(&updates, self.config.content_policy);
                generation.created.extend(report.created.iter().cloned());
                self.after_merge(&report);
            }
        }
        if let Some(delta) = &event.delta {
            generation.message.push(delta);
            if let Focus::Local(id) = &generation.focus {
                let body = generation
                    .scope
                    .as_ref()
                    .map(|scope| sanitize_local_body(generation.message.body(), scope))
                    .unwrap_or_default();
                match self.outline.infer_realtime(id, &body, &mut generation.ledger) {
                    Ok(report) => {
                        generation.created.extend(report.created.iter().cloned());
                        self.after_merge(&report);
                    }
                    Err(err) => {
                        tracing::warn!(section_id = %id, %err, "realtime merge skipped");
                    }
                }
            }
        }
    }

    fn after_merge(&mut self, report: &MergeReport) {
        for warning in &report.warnings {
            tracing::debug!(document_id = %self.document_id, %warning, "merge warning");
        }
        if report.changed() {
            self.refresh_preview();
        }
    }

    fn refresh_preview(&mut self) {
        let blocks = estimate_blocks(self.outline.sections(), &self.metrics);
        let pages = self.preview.set_blocks(blocks).page_count;
        tracing::trace!(revision = self.outline.revision(), pages, "preview recomputed");
    }

    /// A block's measured height changed after layout, e.g. an image loaded.
    pub fn resize_block(&mut self, id: &SectionId, height: f64) -> Option<&Pagination> {
        self.preview.resize_block(id, height)
    }

    /// Ends the stream normally (or after the caller stopped reading): whatever
    /// arrived is merged and the document settles.
    pub async fn complete(&mut self, mut generation: Generation) -> GenerationOutcome {
        for event in generation.decoder.finish() {
            self.apply_event(&mut generation, event);
        }
        generation.message.finish();
        self.generating = false;
        if generation.thread_id.is_some() {
            self.thread_id = generation.thread_id.clone();
        }

        let body = generation.live_body();
        let mut outcome = GenerationOutcome {
            scenario: generation.scenario,
            thread_id: generation.thread_id.clone(),
            created: std::mem::take(&mut generation.created),
            updated: Vec::new(),
            warnings: Vec::new(),
            outline_pending: false,
            skipped_records: generation.decoder.skipped(),
            saved: false,
        };

        if body.trim().is_empty() {
            self.handle_empty_body(&generation);
            return outcome;
        }

        let settle_kind = match generation.scenario {
            Scenario::Polish => SettleKind::PolishCompleted,
            _ => SettleKind::DraftCompleted,
        };
        match &generation.focus {
            Focus::Local(id) => match self.outline.finalize_split(id, &body, &generation.ledger) {
                Ok(report) => {
                    self.absorb(&report, &mut outcome);
                    outcome.saved = self.settle(settle_kind).await;
                }
                Err(err) => {
                    self.notifications
                        .push(Notification::error(format!("could not apply section text: {err}"), false));
                }
            },
            Focus::Global => {
                if generation.scenario == Scenario::Outline || self.outline.sections().is_empty() {
                    self.absorb_outline(&body, &mut outcome).await;
                } else {
                    let report = self.outline.distribute_document(&body);
                    if report.updated.is_empty() {
                        self.notifications.push(Notification::warning(
                            "response did not match any section heading; document unchanged",
                            true,
                        ));
                    } else {
                        self.absorb(&report, &mut outcome);
                        outcome.saved = self.settle(settle_kind).await;
                    }
                }
            }
        }

        tracing::info!(
            document_id = %self.document_id,
            revision = self.outline.revision(),
            created = outcome.created.len(),
            updated = outcome.updated.len(),
            "generation completed"
        );
        outcome
    }

    fn handle_empty_body(&mut self, generation: &Generation) {
        if let Focus::Local(id) = &generation.focus {
            let status = match self.outline.get(id) {
                Some(section) if !section.content.trim().is_empty() => SectionStatus::Completed,
                _ => SectionStatus::Pending,
            };
            if let Err(err) = self.outline.set_status(id, status) {
                tracing::warn!(section_id = %id, %err, "could not reset status");
            }
        }
        let notification = match &generation.backend_error {
            Some(error) => Notification::error(format!("generation failed: {error}"), true),
            None => Notification::warning("the response contained no document text", true),
        };
        self.notifications.push(notification);
    }

    fn absorb(&mut self, report: &MergeReport, outcome: &mut GenerationOutcome) {
        for id in &report.created {
            if !outcome.created.contains(id) {
                outcome.created.push(id.clone());
            }
        }
        outcome.created.retain(|id| !report.removed.contains(id));
        outcome.updated.extend(report.updated.iter().cloned());
        for warning in &report.warnings {
            if let Warning::StructuralAmbiguity { parent } = warning {
                tracing::debug!(section_id = %parent, "no subsection headings; body kept whole");
            }
            outcome.warnings.push(warning.to_string());
        }
        self.after_merge(report);
    }

    async fn absorb_outline(&mut self, body: &str, outcome: &mut GenerationOutcome) {
        let parsed = parse_tolerant_capped(
            body,
            self.repair_stats.as_ref(),
            self.config.max_extraction_candidates,
        )
        .map_err(EngineError::from)
        .and_then(|value| build_outline(&value).map_err(EngineError::from));

        let build = match parsed {
            Ok(build) if !build.sections.is_empty() => build,
            Ok(_) => {
                self.notifications.push(Notification::error(
                    "the outline was empty; previous outline kept",
                    true,
                ));
                return;
            }
            Err(err) => {
                tracing::warn!(document_id = %self.document_id, %err, "outline decode failed");
                self.notifications.push(Notification::error(
                    format!("the outline could not be read ({err}); previous outline kept"),
                    true,
                ));
                return;
            }
        };
        outcome
            .warnings
            .extend(build.warnings.iter().map(ToString::to_string));

        if self.outline.sections().is_empty() {
            let report = self.outline.replace_all(build.sections);
            self.absorb(&report, outcome);
            outcome.saved = self.settle(SettleKind::OutlineGenerated).await;
        } else {
            tracing::info!(sections = build.sections.len(), "outline proposal awaiting confirmation");
            self.notifications.push(Notification::info(
                "a new outline is ready; accept it to replace the current one",
            ));
            self.proposal = Some(build);
            outcome.outline_pending = true;
        }
    }

    /// Degrades a failed stream: the section returns to pending and whatever was
    /// merged so far stays. The error is handed back for the caller.
    pub fn fail(&mut self, generation: Generation, err: EngineError) -> EngineError {
        self.generating = false;
        if let Focus::Local(id) = &generation.focus
            && let Err(status_err) = self.outline.set_status(id, SectionStatus::Pending)
        {
            tracing::warn!(section_id = %id, %status_err, "could not reset status");
        }
        tracing::warn!(document_id = %self.document_id, %err, "generation failed");
        self.notifications.push(Notification::error(
            format!("generation interrupted: {err}"),
            matches!(err, EngineError::StreamTransport { .. }),
        ));
        err
    }

    pub async fn run(
        &mut self,
        source: &mut dyn ChunkSource,
        focus: Focus,
        scenario: Scenario,
    ) -> Result<GenerationOutcome, EngineError> {
        let mut generation = self.begin(focus, scenario)?;
        loop {
            match source.next_chunk().await {
                Ok(Some(chunk)) => self.feed(&mut generation, &chunk),
                Ok(None) => break,
                Err(err) => return Err(self.fail(generation, err)),
            }
        }
        Ok(self.complete(generation).await)
    }

    /// Replaces the outline with the pending proposal.
    pub async fn accept_outline(&mut self) -> Option<MergeReport> {
        let build = self.proposal.take()?;
        let report = self.outline.replace_all(build.sections);
        self.after_merge(&report);
        self.settle(SettleKind::OutlineGenerated).await;
        Some(report)
    }

    pub fn discard_outline(&mut self) -> bool {
        self.proposal.take().is_some()
    }

    pub async fn edit_section(&mut self, id: &SectionId, edit: SectionEdit) -> Result<MergeReport, EngineError> {
        let report = self.outline.update_section(id, edit)?;
        self.after_manual_edit(&report).await;
        Ok(report)
    }

    pub async fn add_subsections(
        &mut self,
        parent: &SectionId,
        titles: &[String],
        target_words: Option<u32>,
    ) -> Result<MergeReport, EngineError> {
        let report = self.outline.add_subsections(parent, titles, target_words)?;
        self.after_manual_edit(&report).await;
        Ok(report)
    }

    pub async fn delete_section(&mut self, id: &SectionId, cascade: bool) -> Result<MergeReport, EngineError> {
        let report = self.outline.delete_section(id, cascade)?;
        self.after_manual_edit(&report).await;
        Ok(report)
    }

    async fn after_manual_edit(&mut self, report: &MergeReport) {
        self.after_merge(report);
        if report.changed() {
            self.settle(SettleKind::ManualEdit).await;
        }
    }

    async fn settle(&mut self, kind: SettleKind) -> bool {
        match self.persister.settle(kind, self.outline.sections()).await {
            SettleOutcome::Saved { .. } => true,
            SettleOutcome::Unchanged => false,
            SettleOutcome::ShrinkRefused { previous, next } => {
                self.notifications.push(Notification::warning(
                    format!("not saved: the document would shrink from {previous} to {next} characters"),
                    false,
                ));
                false
            }
            SettleOutcome::Deferred { reason } => {
                self.notifications.push(Notification::warning(
                    format!("saving failed and will be retried: {reason}"),
                    true,
                ));
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::persist::LocalFsDocumentStore;
    use crate::stream::ReplayChunkSource;

    fn record(delta: &str) -> String {
        format!("{}\n", serde_json::json!({ "status": "loading", "response": delta }))
    }

    async fn session(dir: &tempfile::TempDir, sections: Vec<Section>) -> anyhow::Result<DraftSession> {
        let store = Arc::new(LocalFsDocumentStore::new(dir.path()));
        DraftSession::open("doc", sections, store, EngineConfig::default()).await
    }

    #[tokio::test]
    async fn local_stream_splits_into_children_and_saves() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut session = session(
            &dir,
            vec![Section::new("1", None, "1. 总览"), Section::new("2", None, "2. 方案")],
        )
        .await?;
        let text = [
            record("<think>先写背景</think><content>"),
            record("## 背景\n内容A\n"),
            record("## 目标\n内容B"),
            record("</content>"),
        ]
        .concat();
        let mut source = ReplayChunkSource::from_text(&text, 7);

        let outcome = session
            .run(&mut source, Focus::Local("1".into()), Scenario::Writing)
            .await?;

        assert_eq!(outcome.created.len(), 2);
        assert!(outcome.saved);
        let titles: Vec<&str> = session.sections().iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["1. 总览", "1.1 背景", "1.2 目标", "2. 方案"]);
        assert_eq!(session.sections()[1].content, "内容A");
        assert_eq!(session.sections()[0].status, SectionStatus::Completed);
        assert!(!session.is_generating());
        assert!(dir.path().join("documents/doc/body.md").exists());
        Ok(())
    }

    #[tokio::test]
    async fn malformed_outline_is_repaired_into_an_empty_document() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut session = session(&dir, Vec::new()).await?;
        let text = record("```json\n[{title:\"1. 总览\",targetWords:800},{title:\"1.1 背景\"}\n```");
        let mut source = ReplayChunkSource::from_text(&text, 5);

        let outcome = session.run(&mut source, Focus::Global, Scenario::Outline).await?;

        assert!(!outcome.outline_pending);
        assert_eq!(session.sections().len(), 2);
        assert_eq!(session.sections()[1].parent_id, Some(session.sections()[0].id.clone()));
        assert!(session.repair_counts().total() > 0);
        Ok(())
    }

    #[tokio::test]
    async fn outline_for_a_written_document_needs_confirmation() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut session = session(&dir, vec![Section::new("a", None, "旧章节")]).await?;
        let mut source = ReplayChunkSource::from_text(&record("[{\"title\":\"新章节\"}]"), 64);

        let outcome = session.run(&mut source, Focus::Global, Scenario::Outline).await?;
        assert!(outcome.outline_pending);
        assert_eq!(session.sections()[0].title, "旧章节");

        assert!(session.accept_outline().await.is_some());
        assert_eq!(session.sections()[0].title, "新章节");
        assert!(session.pending_outline().is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_outline_keeps_the_previous_one() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut session = session(&dir, vec![Section::new("a", None, "旧章节")]).await?;
        let mut source = ReplayChunkSource::from_text(&record("no structure here"), 64);

        session.run(&mut source, Focus::Global, Scenario::Outline).await?;

        assert_eq!(session.sections()[0].title, "旧章节");
        let notes = session.drain_notifications();
        assert!(notes.iter().any(|n| n.level == NotificationLevel::Error && n.retryable));
        Ok(())
    }

    #[tokio::test]
    async fn second_begin_is_refused() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut session = session(&dir, vec![Section::new("1", None, "总览")]).await?;
        let generation = session.begin(Focus::Global, Scenario::Writing)?;
        assert!(matches!(
            session.begin(Focus::Global, Scenario::Writing),
            Err(EngineError::Busy { .. })
        ));
        session.complete(generation).await;
        assert!(session.begin(Focus::Global, Scenario::Writing).is_ok());
        Ok(())
    }

    struct BrokenSource {
        sent: bool,
    }

    #[async_trait]
    impl ChunkSource for BrokenSource {
        async fn next_chunk(&mut self) -> Result<Option<String>, EngineError> {
            if std::mem::replace(&mut self.sent, true) {
                return Err(EngineError::StreamTransport {
                    attempts: 1,
                    reason: "connection reset".to_owned(),
                });
            }
            Ok(Some(record("<content>## 背景\n内容")))
        }
    }

    #[tokio::test]
    async fn transport_failure_marks_section_pending_and_keeps_partial_merges() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut session = session(&dir, vec![Section::new("1", None, "1. 总览")]).await?;
        let mut source = BrokenSource { sent: false };

        let result = session
            .run(&mut source, Focus::Local("1".into()), Scenario::Writing)
            .await;

        assert!(matches!(result, Err(EngineError::StreamTransport { .. })));
        assert_eq!(session.sections()[0].status, SectionStatus::Pending);
        assert_eq!(session.sections()[1].title, "1.1 背景");
        assert!(!session.is_generating());
        let notes = session.drain_notifications();
        assert_eq!(notes.len(), 1);
        assert!(notes[0].retryable);
        Ok(())
    }

    #[tokio::test]
    async fn global_draft_distributes_by_heading() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut session = session(
            &dir,
            vec![Section::new("1", None, "1. 总览"), Section::new("2", None, "2. 方案")],
        )
        .await?;
        let mut source = ReplayChunkSource::from_text(
            &record("<content># 1. 总览\n甲\n# 2. 方案\n乙</content>"),
            16,
        );

        let outcome = session.run(&mut source, Focus::Global, Scenario::Draft).await?;

        assert_eq!(outcome.updated.len(), 2);
        assert_eq!(session.sections()[1].content, "乙");
        assert!(session.preview().page_count >= 1);
        Ok(())
    }
}
