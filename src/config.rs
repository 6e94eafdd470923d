use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};

use crate::demux::DEFAULT_DISCLOSURE_PHRASES;
use crate::json_repair::DEFAULT_MAX_CANDIDATES;
use crate::merge::ContentPolicy;
use crate::paginate::PageGeometry;
use crate::stream::RetryPolicy;

/// Engine tunables. Values come from defaults, then an optional YAML file, then
/// `DRAFTSYNC_*` environment variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub page_height: f64,
    pub page_gap: f64,
    pub safety_margin: f64,
    pub min_body_chars: usize,
    pub transport_retries: u32,
    pub retry_backoff_ms: u64,
    pub content_policy: ContentPolicy,
    pub disclosure_phrases: Vec<String>,
    pub max_extraction_candidates: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let geometry = PageGeometry::default();
        Self {
            page_height: geometry.page_height,
            page_gap: geometry.page_gap,
            safety_margin: geometry.safety_margin,
            min_body_chars: 100,
            transport_retries: 3,
            retry_backoff_ms: 1000,
            content_policy: ContentPolicy::Replace,
            disclosure_phrases: DEFAULT_DISCLOSURE_PHRASES
                .iter()
                .map(|p| (*p).to_owned())
                .collect(),
            max_extraction_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }
}

impl EngineConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_yaml_file(path)?.with_env_overrides(|key| std::env::var(key).ok()),
            None => Self::from_env(),
        }
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("parse config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        override_from(&lookup, "DRAFTSYNC_PAGE_HEIGHT", &mut self.page_height)?;
        override_from(&lookup, "DRAFTSYNC_PAGE_GAP", &mut self.page_gap)?;
        override_from(&lookup, "DRAFTSYNC_SAFETY_MARGIN", &mut self.safety_margin)?;
        override_from(&lookup, "DRAFTSYNC_MIN_BODY_CHARS", &mut self.min_body_chars)?;
        override_from(&lookup, "DRAFTSYNC_TRANSPORT_RETRIES", &mut self.transport_retries)?;
        override_from(&lookup, "DRAFTSYNC_RETRY_BACKOFF_MS", &mut self.retry_backoff_ms)?;
        override_from(
            &lookup,
            "DRAFTSYNC_MAX_EXTRACTION_CANDIDATES",
            &mut self.max_extraction_candidates,
        )?;
        if let Some(raw) = lookup("DRAFTSYNC_CONTENT_POLICY") {
            self.content_policy = parse_content_policy(&raw).with_context(|| {
                format!("invalid DRAFTSYNC_CONTENT_POLICY={raw:?}. expected one of: replace, grow_only")
            })?;
        }
        if let Some(raw) = lookup("DRAFTSYNC_DISCLOSURE_PHRASES") {
            self.disclosure_phrases = raw
                .split(['|', '\n'])
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::to_owned)
                .collect();
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.page_height.is_nan() || self.page_height <= 0.0 {
            anyhow::bail!("page_height must be positive, got {}", self.page_height);
        }
        if self.page_gap < 0.0 {
            anyhow::bail!("page_gap must not be negative, got {}", self.page_gap);
        }
        if self.safety_margin < 0.0 || self.safety_margin >= self.page_height {
            anyhow::bail!(
                "safety_margin must be within [0, page_height), got {}",
                self.safety_margin
            );
        }
        if self.max_extraction_candidates == 0 {
            anyhow::bail!("max_extraction_candidates must be at least 1");
        }
        Ok(())
    }

    pub fn geometry(&self) -> PageGeometry {
        PageGeometry {
            page_height: self.page_height,
            page_gap: self.page_gap,
            safety_margin: self.safety_margin,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.transport_retries.max(1),
            backoff: Duration::from_millis(self.retry_backoff_ms),
        }
    }
}

fn override_from<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> anyhow::Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    *slot = raw
        .trim()
        .parse()
        .map_err(|err| anyhow::anyhow!("invalid {key}={raw:?}: {err}"))?;
    Ok(())
}

fn parse_content_policy(raw: &str) -> anyhow::Result<ContentPolicy> {
    match raw.trim().to_ascii_lowercase().replace('-', "_").as_str() {
        "" | "replace" => Ok(ContentPolicy::Replace),
        "grow_only" | "growonly" => Ok(ContentPolicy::GrowOnly),
        other => anyhow::bail!("unsupported content policy: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn env_overrides_defaults() -> anyhow::Result<()> {
        let config = EngineConfig::default().with_env_overrides(lookup(&[
            ("DRAFTSYNC_PAGE_HEIGHT", "900"),
            ("DRAFTSYNC_CONTENT_POLICY", "grow-only"),
            ("DRAFTSYNC_DISCLOSURE_PHRASES", "作为AI | as an ai"),
        ]))?;
        assert_eq!(config.page_height, 900.0);
        assert_eq!(config.content_policy, ContentPolicy::GrowOnly);
        assert_eq!(config.disclosure_phrases, vec!["作为AI", "as an ai"]);
        assert_eq!(config.transport_retries, 3);
        Ok(())
    }

    #[test]
    fn invalid_values_name_the_variable() {
        let err = EngineConfig::default()
            .with_env_overrides(lookup(&[("DRAFTSYNC_TRANSPORT_RETRIES", "many")]))
            .map(|_| ())
            .map_err(|err| format!("{err:#}"));
        assert!(err.is_err_and(|msg| msg.contains("DRAFTSYNC_TRANSPORT_RETRIES")));

        let err = EngineConfig::default()
            .with_env_overrides(lookup(&[("DRAFTSYNC_SAFETY_MARGIN", "5000")]));
        assert!(err.is_err());
    }

    #[test]
    fn yaml_file_fills_missing_fields_with_defaults() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("draftsync.yaml");
        std::fs::write(&path, "page_gap: 10\ncontent_policy: grow_only\n")?;
        let config = EngineConfig::from_yaml_file(&path)?;
        assert_eq!(config.page_gap, 10.0);
        assert_eq!(config.page_height, 1123.0);
        assert_eq!(config.content_policy, ContentPolicy::GrowOnly);

        std::fs::write(&path, "page_gapp: 10\n")?;
        assert!(EngineConfig::from_yaml_file(&path).is_err());
        Ok(())
    }
}
