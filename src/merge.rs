//! Owns the canonical section list and reconciles it with snapshot updates and with
//! headings found in streamed prose.
//!
//! Every committed state keeps normalized titles unique across the document.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, Warning};
use crate::formats::{DEFAULT_TARGET_WORDS, Section, SectionId, SectionStatus};
use crate::numbering::{bare_title, child_label, labeled_title, normalize_title, parse_heading, prefix_of};
use crate::outline::{
    MIN_TARGET_WORDS, clamp_word_budgets, dedupe_titles, levels, max_target_words, numbering_keys,
    order_preorder, subtree_end,
};

/// How snapshot content replaces stored content.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum ContentPolicy {
    /// Replace whenever the incoming content differs.
    #[default]
    Replace,
    /// Replace only when the incoming content is longer.
    GrowOnly,
}

impl ContentPolicy {
    fn accepts(self, current: &str, incoming: &str) -> bool {
        match self {
            ContentPolicy::Replace => current != incoming,
            ContentPolicy::GrowOnly => incoming.chars().count() > current.chars().count(),
        }
    }
}

/// Partial section state carried by a snapshot. Absent fields are left alone.
#[derive(Debug, Clone, PartialEq)]
pub struct SectionUpdate {
    pub id: SectionId,
    pub parent_id: Option<SectionId>,
    pub title: Option<String>,
    pub content: Option<String>,
    pub status: Option<SectionStatus>,
    pub target_words: Option<u32>,
}

impl SectionUpdate {
    pub fn new(id: impl Into<SectionId>) -> Self {
        Self {
            id: id.into(),
            parent_id: None,
            title: None,
            content: None,
            status: None,
            target_words: None,
        }
    }
}

/// Fields a manual edit may change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SectionEdit {
    pub title: Option<String>,
    pub content: Option<String>,
    pub status: Option<SectionStatus>,
    pub target_words: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeReport {
    pub created: Vec<SectionId>,
    pub updated: Vec<SectionId>,
    pub removed: Vec<SectionId>,
    pub warnings: Vec<Warning>,
    pub revision: u64,
}

impl MergeReport {
    pub fn changed(&self) -> bool {
        !(self.created.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }
}

/// Children synthesized by realtime inference during one stream. The final split
/// fills these instead of treating them as collisions.
#[derive(Debug, Clone, Default)]
pub struct StreamLedger {
    created: HashSet<SectionId>,
}

impl StreamLedger {
    pub fn owns(&self, id: &SectionId) -> bool {
        self.created.contains(id)
    }

    pub fn len(&self) -> usize {
        self.created.len()
    }

    pub fn is_empty(&self) -> bool {
        self.created.is_empty()
    }
}

/// Read-only view handed to renderers; stays valid while the store moves on.
#[derive(Debug, Clone)]
pub struct OutlineSnapshot {
    pub revision: u64,
    pub sections: Arc<Vec<Section>>,
}

/// Versioned copy-on-write handle to the canonical outline.
#[derive(Debug, Clone, Default)]
pub struct OutlineStore {
    sections: Arc<Vec<Section>>,
    revision: u64,
}

impl OutlineStore {
    pub fn new(sections: Vec<Section>) -> Self {
        let mut store = Self::default();
        store.replace_all(sections);
        store
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn snapshot(&self) -> OutlineSnapshot {
        OutlineSnapshot {
            revision: self.revision,
            sections: Arc::clone(&self.sections),
        }
    }

    pub fn get(&self, id: &SectionId) -> Option<&Section> {
        self.sections.iter().find(|s| &s.id == id)
    }

    fn position(&self, id: &SectionId) -> Result<usize, EngineError> {
        self.sections
            .iter()
            .position(|s| &s.id == id)
            .ok_or_else(|| EngineError::UnknownSection(id.clone()))
    }

    fn commit(&mut self, next: Vec<Section>, report: &mut MergeReport) {
        if next != *self.sections {
            self.sections = Arc::new(next);
            self.revision += 1;
            tracing::debug!(
                revision = self.revision,
                created = report.created.len(),
                updated = report.updated.len(),
                removed = report.removed.len(),
                "outline committed"
            );
        }
        report.revision = self.revision;
    }

    /// Confirmed full regeneration: the incoming list replaces everything.
    pub fn replace_all(&mut self, sections: Vec<Section>) -> MergeReport {
        let mut report = MergeReport::default();
        let (deduped, warnings) = dedupe_titles(sections);
        report.warnings.extend(warnings.into_iter().map(Warning::from));
        let mut next = order_preorder(deduped);
        report
            .warnings
            .extend(clamp_word_budgets(&mut next).into_iter().map(Warning::from));
        report.removed = self.sections.iter().map(|s| s.id.clone()).collect();
        report.created = next.iter().map(|s| s.id.clone()).collect();
        self.commit(next, &mut report);
        report
    }

    pub fn set_status(&mut self, id: &SectionId, status: SectionStatus) -> Result<MergeReport, EngineError> {
        let idx = self.position(id)?;
        let mut report = MergeReport::default();
        let mut next = self.sections.as_ref().clone();
        if next[idx].status != status {
            next[idx].status = status;
            report.updated.push(id.clone());
        }
        self.commit(next, &mut report);
        Ok(report)
    }

    pub fn apply_snapshot(&mut self, updates: &[SectionUpdate], policy: ContentPolicy) -> MergeReport {
        let mut report = MergeReport::default();
        let mut next = self.sections.as_ref().clone();
        let mut titles: HashMap<String, SectionId> = next
            .iter()
            .map(|s| (normalize_title(&s.title), s.id.clone()))
            .collect();
        let mut reparented = false;

        for update in updates {
            let Some(idx) = next.iter().position(|s| s.id == update.id) else {
                if let Some(id) = insert_from_update(&mut next, update, &mut titles) {
                    report.created.push(id);
                }
                continue;
            };

            let mut touched = false;
            if let Some(title) = &update.title
                && *title != next[idx].title
            {
                let norm = normalize_title(title);
                match titles.get(&norm).cloned() {
                    Some(owner) if owner != update.id => {
                        tracing::warn!(section_id = %update.id, title, "snapshot title collides; keeping old title");
                    }
                    _ if norm.is_empty() => {}
                    _ => {
                        titles.remove(&normalize_title(&next[idx].title));
                        titles.insert(norm, update.id.clone());
                        next[idx].title = title.clone();
                        touched = true;
                    }
                }
            }
            if let Some(content) = &update.content
                && policy.accepts(&next[idx].content, content)
            {
                next[idx].content = content.clone();
                touched = true;
            }
            if let Some(status) = update.status
                && status != next[idx].status
            {
                next[idx].status = status;
                touched = true;
            }
            if let Some(words) = update.target_words
                && words != next[idx].target_words
            {
                next[idx].target_words = words;
                touched = true;
            }
            if let Some(parent) = &update.parent_id
                && next[idx].parent_id.as_ref() != Some(parent)
                && can_reparent(&next, &update.id, parent)
            {
                next[idx].parent_id = Some(parent.clone());
                reparented = true;
                touched = true;
            }
            if touched {
                report.updated.push(update.id.clone());
            }
        }

        if reparented {
            next = order_preorder(next);
        }
        report
            .warnings
            .extend(clamp_word_budgets(&mut next).into_iter().map(Warning::from));
        self.commit(next, &mut report);
        report
    }

    /// Creates children for headings that appear while the parent's body streams in.
    /// Only complete heading lines count; content is never assigned here.
    pub fn infer_realtime(
        &mut self,
        parent: &SectionId,
        body: &str,
        ledger: &mut StreamLedger,
    ) -> Result<MergeReport, EngineError> {
        let parent_idx = self.position(parent)?;
        let mut report = MergeReport::default();
        let mut next = self.sections.as_ref().clone();
        let parent_level = levels(&next).get(parent).copied().unwrap_or(1);
        let parent_norm = normalize_title(&next[parent_idx].title);
        let mut used: HashSet<String> = next.iter().map(|s| normalize_title(&s.title)).collect();

        for hit in detect_headings(body, parent_level, true) {
            let norm = normalize_title(&hit.text);
            if norm.is_empty() || norm == parent_norm || used.contains(&norm) {
                continue;
            }
            let id = insert_child(
                &mut next,
                parent_idx,
                bare_title(&hit.text),
                String::new(),
                SectionStatus::Writing,
            );
            tracing::info!(parent_id = %parent, section_id = %id, heading = %hit.text, "inferred child section");
            used.insert(norm);
            ledger.created.insert(id.clone());
            report.created.push(id);
        }

        self.commit(next, &mut report);
        Ok(report)
    }

    /// Splits the finished body of `parent` at its headings: leading prose stays with
    /// the parent and each span goes to its child.
    pub fn finalize_split(
        &mut self,
        parent: &SectionId,
        body: &str,
        ledger: &StreamLedger,
    ) -> Result<MergeReport, EngineError> {
        let parent_idx = self.position(parent)?;
        let mut report = MergeReport::default();
        let mut next = self.sections.as_ref().clone();
        let parent_level = levels(&next).get(parent).copied().unwrap_or(1);
        let parent_norm = normalize_title(&next[parent_idx].title);

        let mut owned: HashMap<String, SectionId> = HashMap::new();
        let mut used: HashSet<String> = HashSet::new();
        for section in &next {
            let norm = normalize_title(&section.title);
            if ledger.owns(&section.id) && section.parent_id.as_ref() == Some(parent) {
                owned.insert(norm, section.id.clone());
            } else {
                used.insert(norm);
            }
        }

        let hits = detect_headings(body, parent_level, false);
        let preamble_end = hits.first().map_or(body.len(), |h| h.line_start);
        let mut parent_text = body[..preamble_end].to_owned();
        let mut last_child: Option<(SectionId, String)> = None;
        let mut filled: Vec<(SectionId, String)> = Vec::new();

        for (i, hit) in hits.iter().enumerate() {
            let span_end = hits.get(i + 1).map_or(body.len(), |h| h.line_start);
            let span = &body[hit.body_start.min(span_end)..span_end];
            let norm = normalize_title(&hit.text);

            if norm.is_empty() || norm == parent_norm || used.contains(&norm) {
                tracing::debug!(heading = %hit.text, "heading collides; kept as prose");
                let prose = &body[hit.line_start..span_end];
                match &mut last_child {
                    Some((_, text)) => text.push_str(prose),
                    None => parent_text.push_str(prose),
                }
                continue;
            }
            used.insert(norm.clone());

            if let Some((id, text)) = last_child.take() {
                filled.push((id, text));
            }
            let id = match owned.remove(&norm) {
                Some(id) => id,
                None => {
                    let id = insert_child(
                        &mut next,
                        parent_idx,
                        bare_title(&hit.text),
                        String::new(),
                        SectionStatus::Completed,
                    );
                    report.created.push(id.clone());
                    id
                }
            };
            last_child = Some((id, span.to_owned()));
        }
        if let Some(entry) = last_child.take() {
            filled.push(entry);
        }

        if filled.is_empty() {
            if !hits.is_empty() || !body.trim().is_empty() {
                let warning = Warning::StructuralAmbiguity {
                    parent: parent.clone(),
                };
                tracing::debug!(%warning, "final split");
                report.warnings.push(warning);
            }
            parent_text = body.to_owned();
        }

        for (id, text) in filled {
            if let Some(section) = next.iter_mut().find(|s| s.id == id) {
                let text = text.trim().to_owned();
                if section.content != text || section.status != SectionStatus::Completed {
                    section.content = text;
                    section.status = SectionStatus::Completed;
                    if !report.created.contains(&id) {
                        report.updated.push(id);
                    }
                }
            }
        }
        let mut stale: HashSet<SectionId> = HashSet::new();
        for id in owned.into_values() {
            let has_children = next.iter().any(|s| s.parent_id.as_ref() == Some(&id));
            let Some(section) = next.iter_mut().find(|s| s.id == id) else {
                continue;
            };
            if !section.content.trim().is_empty() {
                continue;
            }
            if has_children {
                section.status = SectionStatus::Pending;
            } else {
                tracing::debug!(section_id = %id, title = %section.title, "dropping unfilled inferred section");
                stale.insert(id);
            }
        }
        if !stale.is_empty() {
            next.retain(|s| !stale.contains(&s.id));
            report.removed.extend(stale);
            for id in relabel_owned_children(&mut next, parent, ledger) {
                if !report.created.contains(&id) && !report.updated.contains(&id) {
                    report.updated.push(id);
                }
            }
        }

        let parent_section = &mut next[parent_idx];
        let parent_text = parent_text.trim().to_owned();
        if parent_section.content != parent_text || parent_section.status != SectionStatus::Completed {
            parent_section.content = parent_text;
            parent_section.status = SectionStatus::Completed;
            report.updated.push(parent.clone());
        }

        self.commit(next, &mut report);
        Ok(report)
    }

    /// Distributes a whole-document body over existing sections by matching heading
    /// titles. Sections the body does not mention keep their content.
    pub fn distribute_document(&mut self, body: &str) -> MergeReport {
        let mut report = MergeReport::default();
        let mut next = self.sections.as_ref().clone();
        let by_title: HashMap<String, usize> = next
            .iter()
            .enumerate()
            .map(|(i, s)| (normalize_title(&s.title), i))
            .collect();

        let mut current: Option<usize> = None;
        let mut collected: Vec<(usize, String)> = Vec::new();
        let mut in_fence = false;
        for line in body.split_inclusive('\n') {
            let trimmed = line.trim_start();
            if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
                in_fence = !in_fence;
            }
            if !in_fence
                && let Some((_, text)) = parse_heading(line)
                && let Some(&idx) = by_title.get(&normalize_title(text))
                && !collected.iter().any(|(i, _)| *i == idx)
            {
                current = Some(idx);
                collected.push((idx, String::new()));
                continue;
            }
            if current.is_some()
                && let Some((_, text)) = collected.last_mut()
            {
                text.push_str(line);
            }
        }

        for (idx, text) in collected {
            let text = text.trim().to_owned();
            let section = &mut next[idx];
            if section.content != text {
                section.content = text;
                report.updated.push(section.id.clone());
            }
            section.status = SectionStatus::Completed;
        }
        self.commit(next, &mut report);
        report
    }

    pub fn add_subsections(
        &mut self,
        parent: &SectionId,
        titles: &[String],
        target_words: Option<u32>,
    ) -> Result<MergeReport, EngineError> {
        let parent_idx = self.position(parent)?;
        let mut report = MergeReport::default();
        let mut next = self.sections.as_ref().clone();
        let mut used: HashSet<String> = next.iter().map(|s| normalize_title(&s.title)).collect();

        for title in titles {
            let norm = normalize_title(title);
            if norm.is_empty() || used.contains(&norm) {
                tracing::warn!(parent_id = %parent, title, "skipping duplicate subsection title");
                continue;
            }
            let id = insert_child(
                &mut next,
                parent_idx,
                bare_title(title),
                String::new(),
                SectionStatus::Pending,
            );
            if let Some(words) = target_words
                && let Some(section) = next.iter_mut().find(|s| s.id == id)
            {
                section.target_words = words;
            }
            used.insert(norm);
            report.created.push(id);
        }
        report
            .warnings
            .extend(clamp_word_budgets(&mut next).into_iter().map(Warning::from));
        self.commit(next, &mut report);
        Ok(report)
    }

    /// Removes a section. With `cascade` its subtree goes too; otherwise its children
    /// move up to its parent.
    pub fn delete_section(&mut self, id: &SectionId, cascade: bool) -> Result<MergeReport, EngineError> {
        let idx = self.position(id)?;
        let mut report = MergeReport::default();
        let mut next = self.sections.as_ref().clone();
        if cascade {
            let end = subtree_end(&next, idx);
            report.removed = next.drain(idx..end).map(|s| s.id).collect();
        } else {
            let removed = next.remove(idx);
            for section in next.iter_mut() {
                if section.parent_id.as_ref() == Some(&removed.id) {
                    section.parent_id = removed.parent_id.clone();
                    report.updated.push(section.id.clone());
                }
            }
            report.removed.push(removed.id);
        }
        report
            .warnings
            .extend(clamp_word_budgets(&mut next).into_iter().map(Warning::from));
        self.commit(next, &mut report);
        Ok(report)
    }

    pub fn update_section(&mut self, id: &SectionId, edit: SectionEdit) -> Result<MergeReport, EngineError> {
        let idx = self.position(id)?;
        let mut report = MergeReport::default();
        let mut next = self.sections.as_ref().clone();

        if let Some(title) = edit.title {
            let norm = normalize_title(&title);
            let taken = next
                .iter()
                .any(|s| s.id != *id && normalize_title(&s.title) == norm);
            if taken || norm.is_empty() {
                tracing::warn!(section_id = %id, title, "rejecting duplicate title");
            } else {
                next[idx].title = title;
            }
        }
        if let Some(content) = edit.content {
            next[idx].content = content;
        }
        if let Some(status) = edit.status {
            next[idx].status = status;
        }
        if let Some(words) = edit.target_words {
            next[idx].target_words = words;
        }
        if next[idx] != self.sections[idx] {
            report.updated.push(id.clone());
        }
        report
            .warnings
            .extend(clamp_word_budgets(&mut next).into_iter().map(Warning::from));
        self.commit(next, &mut report);
        Ok(report)
    }
}

/// Parses the outline carried by an `agent_state` snapshot. Only fields present in
/// the payload become updates.
pub fn updates_from_snapshot(state: &Value) -> Vec<SectionUpdate> {
    let items = match state {
        Value::Array(items) => items.as_slice(),
        Value::Object(map) => match ["outline", "sections", "documentStructure"]
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_array))
        {
            Some(items) => items.as_slice(),
            None => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    let mut out = Vec::new();
    collect_updates(items, None, &mut out);
    out
}

fn collect_updates(items: &[Value], parent: Option<&SectionId>, out: &mut Vec<SectionUpdate>) {
    for item in items {
        let Some(id) = item.get("id").and_then(SectionId::from_value) else {
            continue;
        };
        let field = |keys: &[&str]| keys.iter().find_map(|key| item.get(*key));
        let update = SectionUpdate {
            parent_id: parent.cloned().or_else(|| {
                field(&["parentId", "parent_id"]).and_then(SectionId::from_value)
            }),
            title: field(&["title", "name"])
                .and_then(Value::as_str)
                .map(str::to_owned),
            content: field(&["content"]).and_then(Value::as_str).map(str::to_owned),
            status: field(&["status"])
                .and_then(Value::as_str)
                .map(SectionStatus::parse_lenient),
            target_words: field(&["targetWords", "target_words"])
                .and_then(Value::as_u64)
                .map(|n| u32::try_from(n).unwrap_or(u32::MAX)),
            id: id.clone(),
        };
        out.push(update);
        if let Some(children) = item.get("children").and_then(Value::as_array) {
            collect_updates(children, Some(&id), out);
        }
    }
}

fn insert_from_update(
    next: &mut Vec<Section>,
    update: &SectionUpdate,
    titles: &mut HashMap<String, SectionId>,
) -> Option<SectionId> {
    let title = update.title.as_deref()?;
    let norm = normalize_title(title);
    if norm.is_empty() || titles.contains_key(&norm) {
        tracing::debug!(section_id = %update.id, title, "ignoring snapshot section");
        return None;
    }
    let parent_idx = update
        .parent_id
        .as_ref()
        .and_then(|p| next.iter().position(|s| &s.id == p));
    let section = Section {
        id: update.id.clone(),
        parent_id: parent_idx.map(|i| next[i].id.clone()),
        title: title.to_owned(),
        target_words: update.target_words.unwrap_or(DEFAULT_TARGET_WORDS),
        content: update.content.clone().unwrap_or_default(),
        status: update.status.unwrap_or_default(),
    };
    let at = parent_idx.map_or(next.len(), |i| subtree_end(next, i));
    next.insert(at, section);
    titles.insert(norm, update.id.clone());
    Some(update.id.clone())
}

fn can_reparent(sections: &[Section], id: &SectionId, new_parent: &SectionId) -> bool {
    let parents: HashMap<&SectionId, Option<&SectionId>> = sections
        .iter()
        .map(|s| (&s.id, s.parent_id.as_ref()))
        .collect();
    if !parents.contains_key(new_parent) {
        return false;
    }
    let mut cursor = Some(new_parent);
    let mut steps = 0usize;
    while let Some(current) = cursor {
        if current == id || steps > sections.len() {
            return false;
        }
        steps += 1;
        cursor = parents.get(current).copied().flatten();
    }
    true
}

/// Inserts a child after the parent's subtree, numbered after its existing children.
/// Renumbers the stream-created children of `parent` by sibling position. Returns
/// the ids whose title changed.
fn relabel_owned_children(
    next: &mut [Section],
    parent: &SectionId,
    ledger: &StreamLedger,
) -> Vec<SectionId> {
    let Some(parent_idx) = next.iter().position(|s| &s.id == parent) else {
        return Vec::new();
    };
    let keys = numbering_keys(next);
    let parent_key = keys[parent_idx].clone().unwrap_or_default();
    let parent_prefix = prefix_of(&next[parent_idx].title);
    let end = subtree_end(next, parent_idx);

    let mut changed = Vec::new();
    let mut k = 0u32;
    for section in &mut next[parent_idx + 1..end] {
        if section.parent_id.as_ref() != Some(parent) {
            continue;
        }
        k += 1;
        if !ledger.owns(&section.id) {
            continue;
        }
        let label = child_label(parent_prefix.as_ref(), &parent_key, k);
        let title = labeled_title(label.as_deref(), bare_title(&section.title));
        if title != section.title {
            section.title = title;
            changed.push(section.id.clone());
        }
    }
    changed
}

fn insert_child(
    next: &mut Vec<Section>,
    parent_idx: usize,
    bare: &str,
    content: String,
    status: SectionStatus,
) -> SectionId {
    let keys = numbering_keys(next);
    let parent = &next[parent_idx];
    let parent_key = keys[parent_idx].clone().unwrap_or_default();
    let end = subtree_end(next, parent_idx);
    let children: Vec<usize> = (parent_idx + 1..end)
        .filter(|&i| next[i].parent_id.as_ref() == Some(&parent.id))
        .collect();

    let k = children
        .iter()
        .filter_map(|&i| keys[i].as_ref())
        .filter(|key| key.len() == parent_key.len() + 1 && key.starts_with(&parent_key))
        .filter_map(|key| key.last().copied())
        .max()
        .unwrap_or(children.len() as u32)
        + 1;
    let label = child_label(prefix_of(&parent.title).as_ref(), &parent_key, k);
    let title = labeled_title(label.as_deref(), bare);

    let level = levels(next).get(&parent.id).copied().unwrap_or(1) + 1;
    let target_words = (parent.target_words / (children.len() as u32 + 1))
        .clamp(MIN_TARGET_WORDS, max_target_words(level));

    let mut n = children.len() + 1;
    let id = loop {
        let candidate = SectionId::new(format!("{}.{n}", parent.id));
        if !next.iter().any(|s| s.id == candidate) {
            break candidate;
        }
        n += 1;
    };

    let section = Section {
        id: id.clone(),
        parent_id: Some(parent.id.clone()),
        title,
        target_words,
        content,
        status,
    };
    next.insert(end, section);
    id
}

#[derive(Debug, Clone)]
struct HeadingHit {
    line_start: usize,
    body_start: usize,
    text: String,
}

/// Headings deeper than the parent; only the shallowest such level counts. Fenced
/// code is skipped.
fn detect_headings(body: &str, parent_level: usize, complete_lines_only: bool) -> Vec<HeadingHit> {
    let mut candidates: Vec<(usize, HeadingHit)> = Vec::new();
    let mut offset = 0usize;
    let mut in_fence = false;
    for piece in body.split_inclusive('\n') {
        let line_start = offset;
        offset += piece.len();
        let line = piece.trim_end_matches(['\n', '\r']);
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            continue;
        }
        if in_fence || (complete_lines_only && !piece.ends_with('\n')) {
            continue;
        }
        if let Some((level, text)) = parse_heading(line)
            && level >= 2
            && level > parent_level
        {
            candidates.push((
                level,
                HeadingHit {
                    line_start,
                    body_start: offset,
                    text: text.to_owned(),
                },
            ));
        }
    }
    let Some(child_level) = candidates.iter().map(|(level, _)| *level).min() else {
        return Vec::new();
    };
    candidates
        .into_iter()
        .filter(|(level, _)| *level == child_level)
        .map(|(_, hit)| hit)
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn store(sections: &[(&str, Option<&str>, &str)]) -> OutlineStore {
        OutlineStore::new(
            sections
                .iter()
                .map(|(id, parent, title)| Section::new(*id, parent.map(SectionId::from), title))
                .collect(),
        )
    }

    fn find<'a>(store: &'a OutlineStore, title: &str) -> Option<&'a Section> {
        store.sections().iter().find(|s| s.title == title)
    }

    fn assert_unique_titles(store: &OutlineStore) {
        let mut seen = HashSet::new();
        for section in store.sections() {
            assert!(
                seen.insert(normalize_title(&section.title)),
                "duplicate title: {}",
                section.title
            );
        }
    }

    #[test]
    fn final_split_assigns_spans_to_numbered_children() -> anyhow::Result<()> {
        let mut store = store(&[("1", None, "1. 总览"), ("2", None, "2. 方案")]);
        let ledger = StreamLedger::default();
        let report = store.finalize_split(&"1".into(), "## 背景\n内容A\n## 目标\n内容B", &ledger)?;

        assert_eq!(report.created.len(), 2);
        assert_eq!(store.get(&"1".into()).map(|s| s.content.as_str()), Some(""));
        assert_eq!(find(&store, "1.1 背景").map(|s| s.content.as_str()), Some("内容A"));
        assert_eq!(find(&store, "1.2 目标").map(|s| s.content.as_str()), Some("内容B"));
        let titles: Vec<&str> = store.sections().iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["1. 总览", "1.1 背景", "1.2 目标", "2. 方案"]);
        Ok(())
    }

    #[test]
    fn realtime_then_final_fills_instead_of_duplicating() -> anyhow::Result<()> {
        let mut store = store(&[("1", None, "1. 总览")]);
        let mut ledger = StreamLedger::default();
        let parent = SectionId::from("1");

        let mut body = String::new();
        for chunk in ["## 背", "景\n内容", "A\n## 目标\n", "内容B"] {
            body.push_str(chunk);
            store.infer_realtime(&parent, &body, &mut ledger)?;
            assert_unique_titles(&store);
        }
        assert!(find(&store, "1.1 背").is_none());
        assert_eq!(ledger.len(), 2);
        assert!(find(&store, "1.1 背景").is_some_and(|s| s.content.is_empty()));

        let report = store.finalize_split(&parent, &body, &ledger)?;
        assert!(report.created.is_empty());
        assert_eq!(store.sections().len(), 3);
        assert_eq!(find(&store, "1.1 背景").map(|s| s.content.as_str()), Some("内容A"));
        assert_eq!(find(&store, "1.2 目标").map(|s| s.content.as_str()), Some("内容B"));
        assert_unique_titles(&store);
        Ok(())
    }

    #[test]
    fn early_deeper_heading_does_not_survive_the_final_split() -> anyhow::Result<()> {
        let mut store = store(&[("1", None, "1. 总览")]);
        let mut ledger = StreamLedger::default();
        let parent = SectionId::from("1");

        let mut body = String::new();
        for chunk in ["### 要点\n概述\n", "## 背景\n内容A\n", "## 目标\n内容B"] {
            body.push_str(chunk);
            store.infer_realtime(&parent, &body, &mut ledger)?;
        }
        assert!(find(&store, "1.1 要点").is_some());

        let report = store.finalize_split(&parent, &body, &ledger)?;
        assert_eq!(report.removed.len(), 1);
        let titles: Vec<&str> = store.sections().iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["1. 总览", "1.1 背景", "1.2 目标"]);
        assert_eq!(find(&store, "1.1 背景").map(|s| s.content.as_str()), Some("内容A"));
        assert_eq!(
            store.get(&parent).map(|s| s.content.as_str()),
            Some("### 要点\n概述")
        );
        assert!(store.sections().iter().all(|s| s.status == SectionStatus::Completed));
        Ok(())
    }

    #[test]
    fn colliding_headings_stay_as_prose() -> anyhow::Result<()> {
        let mut store = store(&[("1", None, "1. 总览"), ("2", None, "2. 方案")]);
        let ledger = StreamLedger::default();
        store.finalize_split(&"1".into(), "导语\n## 背景\nA\n## 方案\nB", &ledger)?;

        assert_eq!(store.get(&"1".into()).map(|s| s.content.as_str()), Some("导语"));
        assert_eq!(
            find(&store, "1.1 背景").map(|s| s.content.as_str()),
            Some("A\n## 方案\nB")
        );
        assert_eq!(store.sections().len(), 3);
        assert_unique_titles(&store);
        Ok(())
    }

    #[test]
    fn no_heading_keeps_body_with_parent() -> anyhow::Result<()> {
        let mut store = store(&[("1", None, "总览")]);
        let report = store.finalize_split(&"1".into(), "只有正文。", &StreamLedger::default())?;
        assert_eq!(
            report.warnings,
            vec![Warning::StructuralAmbiguity { parent: "1".into() }]
        );
        assert_eq!(store.get(&"1".into()).map(|s| s.content.as_str()), Some("只有正文。"));
        assert_eq!(
            store.get(&"1".into()).map(|s| s.status),
            Some(SectionStatus::Completed)
        );
        Ok(())
    }

    #[test]
    fn only_the_shallowest_deeper_level_becomes_children() -> anyhow::Result<()> {
        let mut store = store(&[("1", None, "一、总览")]);
        store.finalize_split(
            &"1".into(),
            "## 背景\n### 细节\nx\n## 目标\ny\n```\n## not a heading\n```",
            &StreamLedger::default(),
        )?;
        assert_eq!(
            find(&store, "（一）背景").map(|s| s.content.as_str()),
            Some("### 细节\nx")
        );
        assert!(find(&store, "（二）目标").is_some());
        assert_eq!(store.sections().len(), 3);
        Ok(())
    }

    #[test]
    fn snapshot_merge_respects_policy_and_uniqueness() {
        let mut store = store(&[("1", None, "总览"), ("2", None, "方案")]);
        let mut updates = vec![
            SectionUpdate {
                content: Some("long content".into()),
                status: Some(SectionStatus::Completed),
                ..SectionUpdate::new("1")
            },
            SectionUpdate {
                title: Some("总览".into()),
                ..SectionUpdate::new("2")
            },
        ];
        let report = store.apply_snapshot(&updates, ContentPolicy::Replace);
        assert_eq!(report.updated, vec![SectionId::from("1")]);
        assert_eq!(find(&store, "方案").map(|s| s.id.as_str()), Some("2"));
        assert_unique_titles(&store);

        updates[0].content = Some("short".into());
        let revision = store.revision();
        store.apply_snapshot(&updates[..1], ContentPolicy::GrowOnly);
        assert_eq!(store.revision(), revision);
        assert_eq!(
            store.get(&"1".into()).map(|s| s.content.as_str()),
            Some("long content")
        );
        store.apply_snapshot(&updates[..1], ContentPolicy::Replace);
        assert_eq!(store.get(&"1".into()).map(|s| s.content.as_str()), Some("short"));
    }

    #[test]
    fn snapshot_can_add_sections_under_parents() {
        let mut store = store(&[("1", None, "总览"), ("2", None, "方案")]);
        let updates = updates_from_snapshot(&json!({"outline": [
            {"id": "1", "children": [{"id": "9", "title": "新增"}]}
        ]}));
        let report = store.apply_snapshot(&updates, ContentPolicy::Replace);
        assert_eq!(report.created, vec![SectionId::from("9")]);
        let order: Vec<&str> = store.sections().iter().map(|s| s.id.as_str()).collect();
        assert_eq!(order, vec!["1", "9", "2"]);
    }

    #[test]
    fn snapshots_are_stable_for_readers() {
        let mut store = store(&[("1", None, "总览")]);
        let before = store.snapshot();
        store
            .add_subsections(&"1".into(), &["背景".to_owned()], None)
            .ok();
        assert_eq!(before.sections.len(), 1);
        assert!(store.revision() > before.revision);
    }

    #[test]
    fn add_subsections_numbers_after_existing_children() -> anyhow::Result<()> {
        let mut store = store(&[("1", None, "2. 方案"), ("2", Some("1"), "2.1 路线")]);
        let report = store.add_subsections(
            &"1".into(),
            &["预算".to_owned(), "路线".to_owned(), "风险".to_owned()],
            Some(800_000),
        )?;
        assert_eq!(report.created.len(), 2);
        assert!(find(&store, "2.2 预算").is_some_and(|s| s.target_words == 50_000));
        assert!(find(&store, "2.3 风险").is_some());
        Ok(())
    }

    #[test]
    fn delete_cascades_or_promotes() -> anyhow::Result<()> {
        let mut cascade = store(&[("1", None, "A"), ("2", Some("1"), "B"), ("3", None, "C")]);
        cascade.delete_section(&"1".into(), true)?;
        assert_eq!(cascade.sections().len(), 1);

        let mut promote = store(&[("1", None, "A"), ("2", Some("1"), "B"), ("3", None, "C")]);
        promote.delete_section(&"1".into(), false)?;
        assert_eq!(promote.get(&"2".into()).and_then(|s| s.parent_id.clone()), None);
        assert!(matches!(
            promote.delete_section(&"404".into(), true),
            Err(EngineError::UnknownSection(_))
        ));
        Ok(())
    }

    #[test]
    fn manual_edit_rejects_duplicate_titles() -> anyhow::Result<()> {
        let mut store = store(&[("1", None, "A"), ("2", None, "B")]);
        store.update_section(
            &"2".into(),
            SectionEdit {
                title: Some("a".into()),
                content: Some("text".into()),
                ..SectionEdit::default()
            },
        )?;
        assert_eq!(store.get(&"2".into()).map(|s| s.title.as_str()), Some("B"));
        assert_eq!(store.get(&"2".into()).map(|s| s.content.as_str()), Some("text"));
        Ok(())
    }

    #[test]
    fn whole_document_is_distributed_by_title() {
        let mut store = store(&[("1", None, "1. 总览"), ("2", None, "2. 方案"), ("3", None, "3. 预算")]);
        let report = store.distribute_document("前言\n## 1. 总览\n甲\n## 二、方案\n乙\n### 细节\n丙\n");
        assert_eq!(report.updated.len(), 2);
        assert_eq!(find(&store, "1. 总览").map(|s| s.content.as_str()), Some("甲"));
        assert_eq!(
            find(&store, "2. 方案").map(|s| s.content.as_str()),
            Some("乙\n### 细节\n丙")
        );
        assert_eq!(find(&store, "3. 预算").map(|s| s.content.as_str()), Some(""));
    }
}
