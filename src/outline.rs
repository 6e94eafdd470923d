//! Turns loosely shaped outline payloads into a flat, pre-ordered section list with
//! explicit parent links.

use std::collections::{HashMap, HashSet};

use serde::Serialize;
use serde_json::Value;

use crate::error::{ParseError, ValidationWarning};
use crate::formats::{DEFAULT_TARGET_WORDS, Section, SectionId, SectionStatus};
use crate::numbering::{NumberingPrefix, compare_keys, normalize_title, numbering_key, prefix_of};
use crate::scenario::DocumentScale;

pub const MIN_TARGET_WORDS: u32 = 50;

const CONTAINER_KEYS: [&str; 5] = ["outline", "sections", "documentStructure", "chapters", "items"];

/// Upper word budget for a section at `level` (roots are level 1).
pub fn max_target_words(level: usize) -> u32 {
    match level {
        0 | 1 => 150_000,
        2 => 50_000,
        3 => 20_000,
        _ => 15_000,
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutlineBuild {
    pub sections: Vec<Section>,
    pub warnings: Vec<ValidationWarning>,
}

/// Nested view of a flat outline, used for display and YAML output.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutlineNode {
    #[serde(flatten)]
    pub section: Section,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<OutlineNode>,
}

pub fn build_outline(value: &Value) -> Result<OutlineBuild, ParseError> {
    let items = outline_items(value).ok_or(ParseError::NoValidStructure)?;
    let mut sections = flatten(items);
    if sections.is_empty() {
        return Err(ParseError::NoValidStructure);
    }
    reconstruct_hierarchy(&mut sections);
    let (sections, mut warnings) = dedupe_titles(sections);
    let mut sections = order_preorder(sections);
    warnings.extend(clamp_word_budgets(&mut sections));
    warnings.extend(check_depth(&sections));

    for warning in &warnings {
        tracing::warn!(%warning, "outline corrected");
    }
    tracing::info!(
        sections = sections.len(),
        roots = sections.iter().filter(|s| s.parent_id.is_none()).count(),
        "outline built"
    );
    Ok(OutlineBuild { sections, warnings })
}

fn outline_items(value: &Value) -> Option<&[Value]> {
    match value {
        Value::Array(items) => Some(items),
        Value::Object(map) => CONTAINER_KEYS
            .iter()
            .find_map(|key| map.get(*key))
            .and_then(outline_items)
            .or_else(|| map.contains_key("title").then_some(std::slice::from_ref(value))),
        _ => None,
    }
}

/// Pre-order flattening of nested descriptors. Ids missing from the payload are
/// derived from the position in the tree (`"2-1"`).
pub fn flatten(items: &[Value]) -> Vec<Section> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut path = Vec::new();
    walk(items, None, &mut path, &mut out, &mut seen);
    out
}

fn walk(
    items: &[Value],
    parent: Option<&SectionId>,
    path: &mut Vec<usize>,
    out: &mut Vec<Section>,
    seen: &mut HashSet<SectionId>,
) {
    for (idx, item) in items.iter().enumerate() {
        path.push(idx + 1);
        let section = section_from_value(item, parent, path, seen);
        let id = section.id.clone();
        out.push(section);
        if let Some(children) = item.get("children").and_then(Value::as_array) {
            walk(children, Some(&id), path, out, seen);
        }
        path.pop();
    }
}

fn section_from_value(
    item: &Value,
    parent: Option<&SectionId>,
    path: &[usize],
    seen: &mut HashSet<SectionId>,
) -> Section {
    let path_id = path
        .iter()
        .map(usize::to_string)
        .collect::<Vec<_>>()
        .join("-");
    let mut id = item
        .get("id")
        .and_then(SectionId::from_value)
        .unwrap_or_else(|| SectionId::new(path_id.clone()));
    if seen.contains(&id) {
        id = SectionId::new(format!("{id}-{path_id}"));
    }
    seen.insert(id.clone());

    let title = match item {
        Value::String(s) => s.trim().to_owned(),
        _ => first_str(item, &["title", "name", "heading"])
            .unwrap_or_default()
            .trim()
            .to_owned(),
    };
    let parent_id = match parent {
        Some(parent) => Some(parent.clone()),
        None => ["parentId", "parent_id"]
            .iter()
            .find_map(|key| item.get(*key))
            .and_then(SectionId::from_value),
    };
    let target_words = ["targetWords", "target_words", "wordCount", "words"]
        .iter()
        .find_map(|key| item.get(*key))
        .and_then(read_words)
        .map_or(DEFAULT_TARGET_WORDS, |n| u32::try_from(n).unwrap_or(u32::MAX));
    let content = first_str(item, &["content", "body"]).unwrap_or_default().to_owned();
    let status = first_str(item, &["status"])
        .map(SectionStatus::parse_lenient)
        .unwrap_or_default();

    Section {
        id,
        parent_id,
        title,
        target_words,
        content,
        status,
    }
}

fn first_str<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|key| item.get(*key).and_then(Value::as_str))
}

fn read_words(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f.round() as u64)),
        Value::String(s) => {
            let digits: String = s.chars().filter(char::is_ascii_digit).collect();
            digits.parse().ok()
        }
        _ => None,
    }
}

/// Numbering paths in input order. Parenthesized ordinals attach to the latest
/// top-level number seen before them.
pub(crate) fn numbering_keys(sections: &[Section]) -> Vec<Option<Vec<u32>>> {
    let mut current_main = None;
    sections
        .iter()
        .map(|section| {
            let prefix = prefix_of(&section.title)?;
            match &prefix {
                NumberingPrefix::CjkMain(n) => current_main = Some(*n),
                NumberingPrefix::Arabic(parts) if parts.len() == 1 => current_main = Some(parts[0]),
                _ => {}
            }
            Some(numbering_key(&prefix, current_main))
        })
        .collect()
}

/// Fills missing parent links from numbering prefixes. Unknown or self parents are
/// cleared, cycles are broken at the section that closes them.
pub fn reconstruct_hierarchy(sections: &mut [Section]) {
    let ids: HashSet<SectionId> = sections.iter().map(|s| s.id.clone()).collect();
    let keys = numbering_keys(sections);
    let mut by_key: HashMap<Vec<u32>, SectionId> = HashMap::new();
    for (section, key) in sections.iter().zip(&keys) {
        if let Some(key) = key {
            by_key.entry(key.clone()).or_insert_with(|| section.id.clone());
        }
    }

    for (section, key) in sections.iter_mut().zip(&keys) {
        if let Some(parent) = &section.parent_id
            && (!ids.contains(parent) || *parent == section.id)
        {
            tracing::debug!(section_id = %section.id, parent_id = %parent, "dropping unknown parent");
            section.parent_id = None;
        }
        if section.parent_id.is_some() {
            continue;
        }
        let Some(key) = key else {
            continue;
        };
        if key.len() < 2 {
            continue;
        }
        if let Some(parent_id) = by_key.get(&key[..key.len() - 1])
            && *parent_id != section.id
        {
            section.parent_id = Some(parent_id.clone());
        }
    }

    break_cycles(sections);
}

fn break_cycles(sections: &mut [Section]) {
    let limit = sections.len();
    let mut parents: HashMap<SectionId, Option<SectionId>> = sections
        .iter()
        .map(|s| (s.id.clone(), s.parent_id.clone()))
        .collect();
    for section in sections.iter_mut() {
        let mut cursor = section.parent_id.clone();
        let mut steps = 0usize;
        while let Some(current) = cursor {
            if current == section.id {
                tracing::warn!(section_id = %section.id, "breaking parent cycle");
                section.parent_id = None;
                parents.insert(section.id.clone(), None);
                break;
            }
            steps += 1;
            if steps > limit {
                break;
            }
            cursor = parents.get(&current).cloned().flatten();
        }
    }
}

/// Keeps the first section per normalized title. Children of a dropped duplicate move
/// to the survivor.
pub fn dedupe_titles(sections: Vec<Section>) -> (Vec<Section>, Vec<ValidationWarning>) {
    let mut warnings = Vec::new();
    let mut survivors: HashMap<String, usize> = HashMap::new();
    let mut replaced: HashMap<SectionId, SectionId> = HashMap::new();
    let mut kept: Vec<Section> = Vec::with_capacity(sections.len());

    for mut section in sections {
        if normalize_title(&section.title).is_empty() {
            section.title = format!("{} Untitled {}", section.title.trim(), section.id)
                .trim()
                .to_owned();
        }
        let key = normalize_title(&section.title);
        match survivors.get(&key) {
            Some(&idx) => {
                let survivor = &mut kept[idx];
                if survivor.content.is_empty() {
                    survivor.content = std::mem::take(&mut section.content);
                }
                replaced.insert(section.id.clone(), survivor.id.clone());
                warnings.push(ValidationWarning::DuplicateTitleDropped {
                    title: section.title,
                });
            }
            None => {
                survivors.insert(key, kept.len());
                kept.push(section);
            }
        }
    }

    for section in &mut kept {
        let mut hops = 0usize;
        while let Some(parent) = &section.parent_id
            && let Some(survivor) = replaced.get(parent)
            && hops <= replaced.len()
        {
            section.parent_id = (*survivor != section.id).then(|| survivor.clone());
            hops += 1;
        }
    }

    (kept, warnings)
}

/// Orders siblings by numbering (unnumbered last, stable) and emits pre-order.
pub fn order_preorder(sections: Vec<Section>) -> Vec<Section> {
    let keys = numbering_keys(&sections);
    let ids: HashSet<&SectionId> = sections.iter().map(|s| &s.id).collect();
    let mut children: HashMap<Option<SectionId>, Vec<usize>> = HashMap::new();
    for (idx, section) in sections.iter().enumerate() {
        let parent = section
            .parent_id
            .clone()
            .filter(|parent| ids.contains(parent));
        children.entry(parent).or_default().push(idx);
    }
    for list in children.values_mut() {
        list.sort_by(|&a, &b| match (&keys[a], &keys[b]) {
            (Some(ka), Some(kb)) => compare_keys(ka, kb),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
    }

    let mut order = Vec::with_capacity(sections.len());
    let mut visited = vec![false; sections.len()];
    let mut stack: Vec<usize> = children.get(&None).cloned().unwrap_or_default();
    stack.reverse();
    while let Some(idx) = stack.pop() {
        if std::mem::replace(&mut visited[idx], true) {
            continue;
        }
        order.push(idx);
        if let Some(kids) = children.get(&Some(sections[idx].id.clone())) {
            stack.extend(kids.iter().rev());
        }
    }
    order.extend((0..sections.len()).filter(|idx| !visited[*idx]));

    let mut slots: Vec<Option<Section>> = sections.into_iter().map(Some).collect();
    order
        .into_iter()
        .filter_map(|idx| slots[idx].take())
        .collect()
}

/// Nesting level of every section; roots are level 1.
pub fn levels(sections: &[Section]) -> HashMap<SectionId, usize> {
    let parents: HashMap<&SectionId, Option<&SectionId>> = sections
        .iter()
        .map(|s| (&s.id, s.parent_id.as_ref()))
        .collect();
    sections
        .iter()
        .map(|section| {
            let mut level = 1usize;
            let mut cursor = section.parent_id.as_ref();
            while let Some(parent) = cursor
                && level <= sections.len()
            {
                level += 1;
                cursor = parents.get(parent).copied().flatten();
            }
            (section.id.clone(), level)
        })
        .collect()
}

pub fn clamp_word_budgets(sections: &mut [Section]) -> Vec<ValidationWarning> {
    let levels = levels(sections);
    let mut warnings = Vec::new();
    for section in sections.iter_mut() {
        let level = levels.get(&section.id).copied().unwrap_or(1);
        let clamped = section
            .target_words
            .clamp(MIN_TARGET_WORDS, max_target_words(level));
        if clamped != section.target_words {
            warnings.push(ValidationWarning::WordBudgetClamped {
                id: section.id.clone(),
                level,
                from: u64::from(section.target_words),
                to: clamped,
            });
            section.target_words = clamped;
        }
    }
    warnings
}

fn check_depth(sections: &[Section]) -> Option<ValidationWarning> {
    let total: u64 = sections
        .iter()
        .filter(|s| s.parent_id.is_none())
        .map(|s| u64::from(s.target_words))
        .sum();
    let max = DocumentScale::from_total_words(total).max_depth();
    let depth = levels(sections).values().copied().max().unwrap_or(0);
    (depth > max).then_some(ValidationWarning::OutlineTooDeep { depth, max })
}

pub fn nest(sections: &[Section]) -> Vec<OutlineNode> {
    fn build<'a>(
        parent: Option<&'a SectionId>,
        children: &HashMap<Option<&'a SectionId>, Vec<&'a Section>>,
    ) -> Vec<OutlineNode> {
        children
            .get(&parent)
            .map(|kids| {
                kids.iter()
                    .map(|&section| OutlineNode {
                        section: section.clone(),
                        children: build(Some(&section.id), children),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    let mut children: HashMap<Option<&SectionId>, Vec<&Section>> = HashMap::new();
    for section in sections {
        children
            .entry(section.parent_id.as_ref())
            .or_default()
            .push(section);
    }
    build(None, &children)
}

/// Index one past the last descendant of `sections[idx]` in a pre-ordered list.
pub fn subtree_end(sections: &[Section], idx: usize) -> usize {
    let mut inside: HashSet<&SectionId> = HashSet::from([&sections[idx].id]);
    let mut end = idx + 1;
    while end < sections.len() {
        match &sections[end].parent_id {
            Some(parent) if inside.contains(parent) => {
                inside.insert(&sections[end].id);
                end += 1;
            }
            _ => break,
        }
    }
    end
}

pub fn children_of<'a>(sections: &'a [Section], id: &SectionId) -> Vec<&'a Section> {
    sections
        .iter()
        .filter(|s| s.parent_id.as_ref() == Some(id))
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn titles(sections: &[Section]) -> Vec<&str> {
        sections.iter().map(|s| s.title.as_str()).collect()
    }

    fn parent_title<'a>(sections: &'a [Section], title: &str) -> Option<&'a str> {
        let section = sections.iter().find(|s| s.title == title)?;
        let parent = section.parent_id.as_ref()?;
        sections
            .iter()
            .find(|s| &s.id == parent)
            .map(|s| s.title.as_str())
    }

    #[test]
    fn nested_children_become_flat_preorder() -> anyhow::Result<()> {
        let value = json!([
            {"title": "1. 总览", "children": [{"title": "1.1 背景"}, {"title": "1.2 目标"}]},
            {"title": "2. 方案"}
        ]);
        let build = build_outline(&value)?;
        assert_eq!(
            titles(&build.sections),
            vec!["1. 总览", "1.1 背景", "1.2 目标", "2. 方案"]
        );
        assert_eq!(build.sections[1].id.as_str(), "1-1");
        assert_eq!(parent_title(&build.sections, "1.2 目标"), Some("1. 总览"));
        Ok(())
    }

    #[test]
    fn flatten_then_nest_keeps_edges() -> anyhow::Result<()> {
        let value = json!([
            {"id": 1, "title": "A", "children": [
                {"id": 2, "title": "B", "children": [{"id": 3, "title": "C"}]},
                {"id": 4, "title": "D"}
            ]},
            {"id": 5, "title": "E"}
        ]);
        let flat = flatten(value.as_array().map(Vec::as_slice).unwrap_or_default());
        let renested = serde_json::to_value(nest(&flat))?;
        let again = flatten(renested.as_array().map(Vec::as_slice).unwrap_or_default());

        let edges = |sections: &[Section]| -> Vec<(String, Option<String>)> {
            sections
                .iter()
                .map(|s| {
                    (
                        s.id.to_string(),
                        s.parent_id.as_ref().map(ToString::to_string),
                    )
                })
                .collect()
        };
        assert_eq!(edges(&flat), edges(&again));
        Ok(())
    }

    #[test]
    fn numbering_links_flat_lists() -> anyhow::Result<()> {
        let value = json!([
            {"title": "1.1.1 细节"},
            {"title": "1. 总览"},
            {"title": "1.1 背景"},
            {"title": "2.1.1 孤儿"},
            {"title": "附录"}
        ]);
        let build = build_outline(&value)?;
        assert_eq!(parent_title(&build.sections, "1.1.1 细节"), Some("1.1 背景"));
        assert_eq!(parent_title(&build.sections, "1.1 背景"), Some("1. 总览"));
        assert_eq!(parent_title(&build.sections, "2.1.1 孤儿"), None);
        assert_eq!(
            titles(&build.sections),
            vec!["1. 总览", "1.1 背景", "1.1.1 细节", "2.1.1 孤儿", "附录"]
        );
        Ok(())
    }

    #[test]
    fn cjk_numbering_is_equivalent() -> anyhow::Result<()> {
        let value = json!([
            {"title": "一、总览"},
            {"title": "（一）背景"},
            {"title": "1.1.1 细节"},
            {"title": "二、方案"},
            {"title": "（一）路线"}
        ]);
        let build = build_outline(&value)?;
        assert_eq!(parent_title(&build.sections, "（一）背景"), Some("一、总览"));
        assert_eq!(parent_title(&build.sections, "1.1.1 细节"), Some("（一）背景"));
        assert_eq!(parent_title(&build.sections, "（一）路线"), Some("二、方案"));
        Ok(())
    }

    #[test]
    fn tenth_main_heading_adopts_its_subsections() -> anyhow::Result<()> {
        let value = json!([
            {"title": "十、附录"},
            {"title": "（一）说明"},
            {"title": "九、预算"}
        ]);
        let build = build_outline(&value)?;
        assert_eq!(parent_title(&build.sections, "（一）说明"), Some("十、附录"));
        assert_eq!(
            titles(&build.sections),
            vec!["九、预算", "十、附录", "（一）说明"]
        );
        Ok(())
    }

    #[test]
    fn word_budgets_are_clamped_not_rejected() -> anyhow::Result<()> {
        let value = json!([
            {"id": "1", "title": "总览", "targetWords": 1000, "children": [
                {"id": "2", "title": "背景", "targetWords": 800000},
                {"id": "3", "title": "目标", "targetWords": 10}
            ]}
        ]);
        let build = build_outline(&value)?;
        let by_id = |id: &str| build.sections.iter().find(|s| s.id.as_str() == id);
        assert!(by_id("2").is_some_and(|s| s.target_words <= 50_000));
        assert_eq!(by_id("3").map(|s| s.target_words), Some(MIN_TARGET_WORDS));
        assert!(build.warnings.iter().any(|w| matches!(
            w,
            ValidationWarning::WordBudgetClamped { level: 2, from: 800_000, .. }
        )));
        Ok(())
    }

    #[test]
    fn duplicate_titles_are_dropped_and_children_reparented() -> anyhow::Result<()> {
        let value = json!([
            {"id": "a", "title": "1. 背景"},
            {"id": "b", "title": "背景", "content": "x"},
            {"id": "c", "parentId": "b", "title": "细节"}
        ]);
        let build = build_outline(&value)?;
        assert_eq!(titles(&build.sections), vec!["1. 背景", "细节"]);
        assert_eq!(build.sections[0].content, "x");
        assert_eq!(parent_title(&build.sections, "细节"), Some("1. 背景"));
        assert!(
            build
                .warnings
                .iter()
                .any(|w| matches!(w, ValidationWarning::DuplicateTitleDropped { .. }))
        );
        Ok(())
    }

    #[test]
    fn wrapped_and_aliased_payloads() -> anyhow::Result<()> {
        let value = json!({"outline": [
            {"id": 7, "name": "Scope", "target_words": "3,000 words", "status": "done"},
            {"id": 8, "parent_id": 7, "title": "Limits"},
            {"id": 9, "parent_id": 9, "title": "Self"}
        ]});
        let build = build_outline(&value)?;
        assert_eq!(build.sections[0].target_words, 3000);
        assert_eq!(build.sections[0].status, SectionStatus::Completed);
        assert_eq!(parent_title(&build.sections, "Limits"), Some("Scope"));
        assert_eq!(parent_title(&build.sections, "Self"), None);
        Ok(())
    }

    #[test]
    fn cycles_are_broken() {
        let mut sections = vec![
            Section::new("a", Some("b".into()), "A"),
            Section::new("b", Some("a".into()), "B"),
        ];
        reconstruct_hierarchy(&mut sections);
        assert!(sections.iter().any(|s| s.parent_id.is_none()));
        let ordered = order_preorder(sections);
        assert_eq!(ordered.len(), 2);
    }

    #[test]
    fn subtree_end_spans_descendants() {
        let sections = vec![
            Section::new("1", None, "A"),
            Section::new("2", Some("1".into()), "B"),
            Section::new("3", Some("2".into()), "C"),
            Section::new("4", None, "D"),
        ];
        assert_eq!(subtree_end(&sections, 0), 3);
        assert_eq!(subtree_end(&sections, 1), 3);
        assert_eq!(subtree_end(&sections, 3), 4);
    }

    #[test]
    fn unusable_payloads_fail() {
        assert_eq!(
            build_outline(&json!({"foo": 1})).err(),
            Some(ParseError::NoValidStructure)
        );
        assert_eq!(build_outline(&json!([])).err(), Some(ParseError::NoValidStructure));
    }
}
