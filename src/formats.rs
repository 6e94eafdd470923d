use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_TARGET_WORDS: u32 = 1000;

/// Opaque section identifier. Backends send either strings or numbers; both compare
/// as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct SectionId(String);

impl SectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(Self(s.trim().to_owned())),
            serde_json::Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SectionId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl<'de> Deserialize<'de> for SectionId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Signed(i64),
            Unsigned(u64),
            Float(f64),
        }

        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => Self(s),
            Raw::Signed(n) => Self(n.to_string()),
            Raw::Unsigned(n) => Self(n.to_string()),
            Raw::Float(n) => Self(n.to_string()),
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionStatus {
    #[default]
    Pending,
    Writing,
    Completed,
}

impl SectionStatus {
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "writing" | "generating" | "in_progress" => Self::Writing,
            "completed" | "complete" | "done" | "finished" => Self::Completed,
            _ => Self::Pending,
        }
    }
}

/// Unknown or non-string statuses read as `Pending`.
impl<'de> Deserialize<'de> for SectionStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        Ok(raw.as_str().map_or(Self::Pending, Self::parse_lenient))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: SectionId,
    #[serde(default)]
    pub parent_id: Option<SectionId>,
    pub title: String,
    #[serde(default = "default_target_words")]
    pub target_words: u32,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub status: SectionStatus,
}

impl Section {
    pub fn new(id: impl Into<SectionId>, parent_id: Option<SectionId>, title: &str) -> Self {
        Self {
            id: id.into(),
            parent_id,
            title: title.to_owned(),
            target_words: DEFAULT_TARGET_WORDS,
            content: String::new(),
            status: SectionStatus::Pending,
        }
    }
}

fn default_target_words() -> u32 {
    DEFAULT_TARGET_WORDS
}

/// Which part of the document a generation may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Focus {
    Global,
    Local(SectionId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn section_id_accepts_numbers_and_strings() -> anyhow::Result<()> {
        let sections: Vec<Section> = serde_json::from_str(
            r#"[{"id": 3, "title": "A"}, {"id": "3.1", "parentId": 3, "title": "B", "status": "weird"}]"#,
        )?;
        assert_eq!(sections[0].id.as_str(), "3");
        assert_eq!(sections[1].parent_id, Some(SectionId::new("3")));
        assert_eq!(sections[1].status, SectionStatus::Pending);
        assert_eq!(sections[0].target_words, DEFAULT_TARGET_WORDS);
        Ok(())
    }

    #[test]
    fn status_reads_leniently() -> anyhow::Result<()> {
        let statuses: Vec<SectionStatus> =
            serde_json::from_str(r#"["completed", "Done", "writing", "archived", null, 3]"#)?;
        assert_eq!(
            statuses,
            vec![
                SectionStatus::Completed,
                SectionStatus::Completed,
                SectionStatus::Writing,
                SectionStatus::Pending,
                SectionStatus::Pending,
                SectionStatus::Pending,
            ]
        );
        assert_eq!(serde_json::to_string(&SectionStatus::Completed)?, "\"completed\"");
        Ok(())
    }

    #[test]
    fn section_serializes_camel_case() -> anyhow::Result<()> {
        let section = Section::new("1", None, "总览");
        let json = serde_json::to_value(&section)?;
        assert_eq!(json["targetWords"], DEFAULT_TARGET_WORDS);
        assert_eq!(json["parentId"], serde_json::Value::Null);
        assert_eq!(json["status"], "pending");
        Ok(())
    }
}
