use std::path::{Path, PathBuf};

use anyhow::Context as _;

use crate::formats::Section;
use crate::persist::clean_ai_metadata;

/// Outline text must exceed the stored body by this factor to replace it.
const RESTORE_RATIO: f64 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportSource {
    StoredBody,
    RestoredFromOutline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBody {
    pub text: String,
    pub source: ExportSource,
}

/// Picks the text handed to the export renderer. The stored body wins unless it is
/// empty or the section contents add up to clearly more text.
pub fn select_export_body(stored_body: &str, sections: &[Section]) -> Option<ExportBody> {
    let restored = sections
        .iter()
        .filter(|s| !s.title.trim().is_empty() || !s.content.trim().is_empty())
        .map(|s| format!("## {}\n\n{}", s.title, s.content))
        .collect::<Vec<_>>()
        .join("\n\n");

    let stored_len = stored_body.chars().count() as f64;
    let restored_len = restored.chars().count() as f64;
    let (text, source) = if stored_body.trim().is_empty()
        || (!restored.is_empty() && restored_len > stored_len * RESTORE_RATIO)
    {
        (restored, ExportSource::RestoredFromOutline)
    } else {
        (stored_body.to_owned(), ExportSource::StoredBody)
    };
    tracing::info!(?source, chars = text.chars().count(), "export body selected");

    let text = clean_ai_metadata(&text);
    (!text.is_empty()).then_some(ExportBody { text, source })
}

#[derive(Debug, Clone)]
pub struct ExportArtifact {
    pub filename: String,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl ExportArtifact {
    /// Writes the artifact under `dir` using only the final path component of its name.
    pub async fn write_to(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        let name = Path::new(&self.filename)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| "export.bin".to_owned());
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("create output dir: {}", dir.display()))?;
        let path = dir.join(name);
        tokio::fs::write(&path, &self.bytes)
            .await
            .with_context(|| format!("write export: {}", path.display()))?;
        Ok(path)
    }
}

/// Client for the external export renderer.
#[derive(Debug, Clone)]
pub struct HttpExporter {
    client: reqwest::Client,
    base_url: url::Url,
}

impl HttpExporter {
    pub fn new(client: reqwest::Client, base_url: url::Url) -> Self {
        Self { client, base_url }
    }

    pub fn export_url(&self, document_id: &str) -> anyhow::Result<url::Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| anyhow::anyhow!("base url cannot carry a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(["documents", document_id, "export"]);
        Ok(url)
    }

    pub async fn export(&self, document_id: &str) -> anyhow::Result<ExportArtifact> {
        let url = self.export_url(document_id)?;
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("export failed ({status}): {}", body.trim());
        }

        let headers = response.headers();
        let filename = headers
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_disposition)
            .unwrap_or_else(|| format!("{document_id}.docx"));
        let content_type = headers
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let bytes = response
            .bytes()
            .await
            .context("read export body")?
            .to_vec();

        tracing::info!(document_id, filename, bytes = bytes.len(), "export downloaded");
        Ok(ExportArtifact {
            filename,
            content_type,
            bytes,
        })
    }
}

/// Filename from a `Content-Disposition` value; `filename*=UTF-8''…` wins over
/// `filename=`.
pub fn parse_content_disposition(value: &str) -> Option<String> {
    let mut plain = None;
    let mut extended = None;
    for param in value.split(';').map(str::trim) {
        let Some((key, raw)) = param.split_once('=') else {
            continue;
        };
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                let raw = raw.trim().trim_matches('"');
                let encoded = raw
                    .split_once("''")
                    .map_or(raw, |(_charset, encoded)| encoded);
                extended = percent_decode(encoded);
            }
            "filename" => {
                plain = Some(raw.trim().trim_matches('"').to_owned());
            }
            _ => {}
        }
    }
    extended.or(plain).filter(|name| !name.is_empty())
}

fn percent_decode(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok()?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
