//! Splits one streamed assistant turn into reasoning, summary, body and self-check
//! channels.
//!
//! The whole buffer is rescanned on every chunk; a closed channel is frozen so later
//! text can never reopen it.

use std::collections::HashSet;

use crate::formats::{Section, SectionId};
use crate::numbering::{NumberingPrefix, normalize_title, numbering_key, parse_heading, split_prefix};
use crate::outline::numbering_keys;

pub const DEFAULT_DISCLOSURE_PHRASES: [&str; 5] = [
    "由AI生成",
    "AI生成",
    "人工智能生成",
    "generated by ai",
    "as an ai language model",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Reasoning,
    Summary,
    Body,
    SelfCheck,
}

impl Channel {
    pub const ALL: [Channel; 4] = [
        Channel::Reasoning,
        Channel::Summary,
        Channel::Body,
        Channel::SelfCheck,
    ];

    fn tag_names(self) -> &'static [&'static str] {
        match self {
            Channel::Reasoning => &["think", "thinking", "reasoning"],
            Channel::Summary => &["summary"],
            Channel::Body => &["content", "body"],
            Channel::SelfCheck => &["self_check", "self-check", "check"],
        }
    }

    fn index(self) -> usize {
        match self {
            Channel::Reasoning => 0,
            Channel::Summary => 1,
            Channel::Body => 2,
            Channel::SelfCheck => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelState {
    #[default]
    Absent,
    Open,
    Closed,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    state: ChannelState,
    text: String,
}

/// Byte range of a delimited region, tags included.
#[derive(Debug, Clone, Copy)]
struct Region {
    start: usize,
    end: usize,
}

#[derive(Debug, Clone)]
pub struct StreamMessage {
    buffer: String,
    slots: [Slot; 4],
    regions: [Option<Region>; 4],
    disclosure_phrases: Vec<String>,
    finished: bool,
}

impl Default for StreamMessage {
    fn default() -> Self {
        Self::new(DEFAULT_DISCLOSURE_PHRASES.iter().map(|p| (*p).to_owned()).collect())
    }
}

impl StreamMessage {
    pub fn new(disclosure_phrases: Vec<String>) -> Self {
        Self {
            buffer: String::new(),
            slots: Default::default(),
            regions: [None; 4],
            disclosure_phrases: disclosure_phrases
                .into_iter()
                .map(|p| p.to_lowercase())
                .collect(),
            finished: false,
        }
    }

    pub fn push(&mut self, delta: &str) {
        if self.finished || delta.is_empty() {
            return;
        }
        self.buffer.push_str(delta);
        self.rescan();
    }

    /// End of stream: every open channel closes with what it has.
    pub fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.rescan();
        for slot in &mut self.slots {
            if slot.state == ChannelState::Open {
                slot.state = ChannelState::Closed;
            }
        }
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn state(&self, channel: Channel) -> ChannelState {
        self.slots[channel.index()].state
    }

    pub fn text(&self, channel: Channel) -> &str {
        &self.slots[channel.index()].text
    }

    pub fn body(&self) -> &str {
        self.text(Channel::Body)
    }

    /// True while the body is derived from untagged text.
    pub fn is_fallback(&self) -> bool {
        self.state(Channel::Body) == ChannelState::Absent
    }

    fn rescan(&mut self) {
        let reasoning = self.scan_channel(Channel::Reasoning, None);
        for channel in [Channel::Summary, Channel::Body, Channel::SelfCheck] {
            self.scan_channel(channel, reasoning);
        }
        if self.is_fallback() {
            self.slots[Channel::Body.index()].text = self.fallback_body();
        }
    }

    fn scan_channel(&mut self, channel: Channel, skip: Option<Region>) -> Option<Region> {
        let idx = channel.index();
        if self.slots[idx].state == ChannelState::Closed {
            return self.regions[idx];
        }
        let names = channel.tag_names();
        let finished = self.finished;

        let mut from = 0usize;
        let open = loop {
            let (start, end) = find_tag(&self.buffer, from, names, false)?;
            match skip {
                Some(region) if start >= region.start && start < region.end => from = region.end,
                _ => break (start, end),
            }
        };

        let (state, text, region_end) = match find_tag(&self.buffer, open.1, names, true) {
            Some((close_start, close_end)) => (
                ChannelState::Closed,
                &self.buffer[open.1..close_start],
                close_end,
            ),
            None => (
                ChannelState::Open,
                visible_tail(&self.buffer[open.1..], finished),
                self.buffer.len(),
            ),
        };
        let region = Region {
            start: open.0,
            end: region_end,
        };
        let slot = &mut self.slots[idx];
        slot.text = text.trim_start_matches(['\n', '\r']).to_owned();
        if state == ChannelState::Closed {
            tracing::debug!(channel = ?channel, len = slot.text.len(), "channel closed");
        }
        slot.state = state;
        self.regions[idx] = Some(region);
        Some(region)
    }

    fn fallback_body(&self) -> String {
        let mut regions: Vec<Region> = [Channel::Reasoning, Channel::Summary, Channel::SelfCheck]
            .iter()
            .filter_map(|c| self.regions[c.index()])
            .collect();
        regions.sort_by_key(|r| r.start);

        let mut kept = String::new();
        let mut cursor = 0usize;
        for region in regions {
            if region.start > cursor {
                kept.push_str(&self.buffer[cursor..region.start]);
            }
            cursor = cursor.max(region.end);
        }
        if cursor < self.buffer.len() {
            kept.push_str(visible_tail(&self.buffer[cursor..], self.finished));
        }

        kept.lines()
            .filter(|line| {
                let lower = line.to_lowercase();
                !self.disclosure_phrases.iter().any(|p| lower.contains(p))
            })
            .collect::<Vec<_>>()
            .join("\n")
            .trim()
            .to_owned()
    }
}

/// Finds `<name>` (or `</name>` when `closing`) at or after `from`. Case-insensitive,
/// whitespace inside the brackets allowed. Returns the byte span of the tag.
fn find_tag(haystack: &str, from: usize, names: &[&str], closing: bool) -> Option<(usize, usize)> {
    let bytes = haystack.as_bytes();
    let mut cursor = from;
    while let Some(offset) = haystack.get(cursor..)?.find('<') {
        let start = cursor + offset;
        let mut i = start + 1;
        let skip_ws = |mut i: usize| {
            while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                i += 1;
            }
            i
        };
        i = skip_ws(i);
        let mut matched = true;
        if closing {
            if i < bytes.len() && bytes[i] == b'/' {
                i = skip_ws(i + 1);
            } else {
                matched = false;
            }
        }
        if matched {
            let name_start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'-') {
                i += 1;
            }
            let name = haystack[name_start..i].to_ascii_lowercase();
            i = skip_ws(i);
            if names.contains(&name.as_str()) && i < bytes.len() && bytes[i] == b'>' {
                return Some((start, i + 1));
            }
        }
        cursor = start + 1;
    }
    None
}

/// Text after the last complete tag. An unfinished `<...` stays hidden only while
/// more chunks can still complete it.
fn visible_tail(text: &str, finished: bool) -> &str {
    if finished { text } else { hide_partial_tag(text) }
}

/// Drops an unfinished `<...` at the end of streamed text.
fn hide_partial_tag(text: &str) -> &str {
    let Some(lt) = text.rfind('<') else {
        return text;
    };
    let tail = &text[lt + 1..];
    if tail.contains('>') || tail.len() > 16 {
        return text;
    }
    let looks_like_tag = tail
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '-' | ' '));
    if looks_like_tag { &text[..lt] } else { text }
}

/// What a local edit of one section is allowed to produce.
#[derive(Debug, Clone)]
pub struct LocalScope {
    pub title: String,
    pub key: Option<Vec<u32>>,
    /// Normalized titles of every section outside the active subtree.
    pub foreign_titles: HashSet<String>,
    main_number: Option<u32>,
}

impl LocalScope {
    pub fn for_section(sections: &[Section], id: &SectionId) -> Option<Self> {
        let idx = sections.iter().position(|s| &s.id == id)?;
        let keys = numbering_keys(sections);
        let end = crate::outline::subtree_end(sections, idx);
        let foreign_titles = sections
            .iter()
            .enumerate()
            .filter(|(i, _)| *i < idx || *i >= end)
            .map(|(_, s)| normalize_title(&s.title))
            .collect();
        let key = keys[idx].clone();
        Some(Self {
            title: sections[idx].title.clone(),
            main_number: key.as_ref().and_then(|k| k.first().copied()),
            key,
            foreign_titles,
        })
    }

    fn ends_scope(&self, heading: &str) -> bool {
        if self.foreign_titles.contains(&normalize_title(heading)) {
            return true;
        }
        let (Some(own), (Some(prefix), _)) = (&self.key, split_prefix(heading)) else {
            return false;
        };
        let other = numbering_key(&prefix, self.main_number);
        let descendant = other.len() > own.len() && other.starts_with(own);
        !descendant && other != *own
    }
}

/// Cleans a locally generated body: drops a leading restatement of the section title
/// and cuts at the first heading that belongs to another section.
pub fn sanitize_local_body(body: &str, scope: &LocalScope) -> String {
    let own_title = normalize_title(&scope.title);
    let mut lines = body.lines().peekable();
    while lines.peek().is_some_and(|line| line.trim().is_empty()) {
        lines.next();
    }
    if let Some(first) = lines.peek() {
        let candidate = parse_heading(first)
            .map(|(_, text)| text)
            .unwrap_or_else(|| first.trim().trim_matches('*').trim());
        if normalize_title(candidate) == own_title {
            lines.next();
        }
    }

    let mut kept = Vec::new();
    for line in lines {
        let heading = parse_heading(line).map(|(_, text)| text).or_else(|| {
            let trimmed = line.trim();
            matches!(split_prefix(trimmed).0, Some(NumberingPrefix::CjkMain(_)))
                .then_some(trimmed)
        });
        if let Some(heading) = heading
            && scope.ends_scope(heading)
        {
            tracing::debug!(heading, "local body truncated at foreign heading");
            break;
        }
        kept.push(line);
    }
    kept.join("\n").trim().to_owned()
}
