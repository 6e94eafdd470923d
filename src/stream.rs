//! Inbound document stream: newline-delimited JSON records carried over chunked HTTP.

use std::collections::VecDeque;
use std::path::Path;
use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::error::EngineError;
use crate::formats::{Focus, Section};
use crate::persist::{OutlineEntry, outline_entries};
use crate::scenario::{ModelParams, Scenario};

const DELTA_FIELDS: [&str; 4] = ["response", "content", "delta", "text"];
const MAX_PENDING_RECORD: usize = 1 << 20;

/// One decoded record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamEvent {
    pub delta: Option<String>,
    pub snapshot: Option<Value>,
    pub thread_id: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
    pub done: bool,
}

/// Splits chunks into records. A line that decodes as truncated is held and retried
/// joined with the next line.
#[derive(Debug, Default)]
pub struct RecordDecoder {
    line_buf: String,
    pending: Option<String>,
    skipped: usize,
}

impl RecordDecoder {
    pub fn push(&mut self, chunk: &str) -> Vec<StreamEvent> {
        self.line_buf.push_str(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.line_buf.find('\n') {
            let line: String = self.line_buf.drain(..=pos).collect();
            if let Some(event) = self.decode_line(&line) {
                events.push(event);
            }
        }
        events
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        let rest = std::mem::take(&mut self.line_buf);
        let events = self.decode_line(&rest).into_iter().collect();
        if let Some(pending) = self.pending.take() {
            tracing::warn!(len = pending.len(), "dropping truncated record at end of stream");
            self.skipped += 1;
        }
        events
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn decode_line(&mut self, line: &str) -> Option<StreamEvent> {
        let payload = strip_event_prefix(line.trim())?;
        if payload == "[DONE]" {
            return Some(StreamEvent {
                done: true,
                ..StreamEvent::default()
            });
        }

        if let Some(prev) = self.pending.take() {
            for joined in [format!("{prev}\n{payload}"), format!("{prev}\\n{payload}")] {
                match serde_json::from_str::<Value>(&joined) {
                    Ok(value) => return Some(event_from_record(&value)),
                    Err(err) if err.is_eof() && joined.len() < MAX_PENDING_RECORD => {
                        self.pending = Some(joined);
                        return None;
                    }
                    Err(_) => {}
                }
            }
            tracing::warn!(len = prev.len(), "dropping unfinished record");
            self.skipped += 1;
        }

        match serde_json::from_str::<Value>(payload) {
            Ok(value) => Some(event_from_record(&value)),
            Err(err) if err.is_eof() => {
                self.pending = Some(payload.to_owned());
                None
            }
            Err(err) => {
                tracing::warn!(%err, len = payload.len(), "skipping undecodable record");
                self.skipped += 1;
                None
            }
        }
    }
}

/// `data: {...}` carries a payload; `event:`/`id:`/`:` lines and blanks carry none.
fn strip_event_prefix(line: &str) -> Option<&str> {
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    if let Some(rest) = line.strip_prefix("data:") {
        let rest = rest.trim();
        return (!rest.is_empty()).then_some(rest);
    }
    if line.starts_with("event:") || line.starts_with("id:") || line.starts_with("retry:") {
        return None;
    }
    Some(line)
}

pub fn event_from_record(value: &Value) -> StreamEvent {
    let status = value.get("status").and_then(Value::as_str).map(str::to_owned);
    let delta = DELTA_FIELDS
        .iter()
        .filter_map(|key| value.get(*key).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_owned);
    let snapshot = match status.as_deref() {
        Some("agent_state") => Some(value.get("agent_state").cloned().unwrap_or(Value::Null))
            .filter(|v| !v.is_null()),
        _ => None,
    };
    let thread_id = value
        .get("thread_id")
        .or_else(|| value.pointer("/meta/thread_id"))
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
    let error = match status.as_deref() {
        Some("error") => Some(
            ["error_message", "error", "message"]
                .iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str))
                .unwrap_or("stream reported an error")
                .to_owned(),
        ),
        _ => None,
    };
    let done = matches!(status.as_deref(), Some("finished" | "done"));

    StreamEvent {
        delta,
        snapshot,
        thread_id,
        status,
        error,
        done,
    }
}

#[async_trait]
pub trait ChunkSource: Send {
    async fn next_chunk(&mut self) -> Result<Option<String>, EngineError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

/// Request body sent to the generation backend.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub query: String,
    pub mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_section_id: Option<String>,
    pub scenario: Scenario,
    #[serde(flatten)]
    pub params: ModelParams,
    #[serde(rename = "thread_id", skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub document_structure: Vec<OutlineEntry>,
}

impl StreamRequest {
    pub fn new(
        query: &str,
        focus: &Focus,
        scenario: Scenario,
        params: ModelParams,
        sections: &[Section],
    ) -> Self {
        let (mode, active_section_id) = match focus {
            Focus::Global => ("global", None),
            Focus::Local(id) => ("local", Some(id.to_string())),
        };
        Self {
            query: query.to_owned(),
            mode,
            active_section_id,
            scenario,
            params,
            thread_id: None,
            document_structure: outline_entries(sections),
        }
    }
}

/// Streams a POST response body chunk by chunk. UTF-8 sequences cut by chunk
/// boundaries are held back until complete.
pub struct HttpChunkSource {
    response: reqwest::Response,
    pending: Vec<u8>,
    attempts: u32,
}

impl HttpChunkSource {
    pub async fn open(
        client: &reqwest::Client,
        endpoint: &url::Url,
        request: &StreamRequest,
        retry: RetryPolicy,
    ) -> Result<Self, EngineError> {
        let attempts = retry.attempts.max(1);
        let mut last_reason = String::new();
        for attempt in 1..=attempts {
            match send(client, endpoint, request).await {
                Ok(response) => {
                    tracing::info!(%endpoint, attempt, "stream opened");
                    return Ok(Self {
                        response,
                        pending: Vec::new(),
                        attempts: attempt,
                    });
                }
                Err(err) => {
                    last_reason = format!("{err:#}");
                    tracing::warn!(%endpoint, attempt, reason = %last_reason, "stream open failed");
                    if attempt < attempts {
                        tokio::time::sleep(retry.backoff).await;
                    }
                }
            }
        }
        Err(EngineError::StreamTransport {
            attempts,
            reason: last_reason,
        })
    }

    fn take_text(&mut self, flush: bool) -> String {
        let valid = match std::str::from_utf8(&self.pending) {
            Ok(_) => self.pending.len(),
            Err(err) if err.error_len().is_none() && !flush => err.valid_up_to(),
            Err(_) => self.pending.len(),
        };
        let bytes: Vec<u8> = self.pending.drain(..valid).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

async fn send(
    client: &reqwest::Client,
    endpoint: &url::Url,
    request: &StreamRequest,
) -> anyhow::Result<reqwest::Response> {
    let response = client
        .post(endpoint.clone())
        .header(reqwest::header::ACCEPT, "application/x-ndjson")
        .json(request)
        .send()
        .await
        .with_context(|| format!("POST {endpoint}"))?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("stream endpoint returned {status}: {}", body.trim());
    }
    Ok(response)
}

#[async_trait]
impl ChunkSource for HttpChunkSource {
    async fn next_chunk(&mut self) -> Result<Option<String>, EngineError> {
        loop {
            match self.response.chunk().await {
                Ok(Some(bytes)) => {
                    self.pending.extend_from_slice(&bytes);
                    let text = self.take_text(false);
                    if !text.is_empty() {
                        return Ok(Some(text));
                    }
                }
                Ok(None) if self.pending.is_empty() => return Ok(None),
                Ok(None) => return Ok(Some(self.take_text(true))),
                Err(err) => {
                    return Err(EngineError::StreamTransport {
                        attempts: self.attempts,
                        reason: err.to_string(),
                    });
                }
            }
        }
    }
}

/// Replays recorded stream text in fixed-size chunks.
#[derive(Debug, Clone, Default)]
pub struct ReplayChunkSource {
    chunks: VecDeque<String>,
}

impl ReplayChunkSource {
    pub fn new(chunks: impl IntoIterator<Item = String>) -> Self {
        Self {
            chunks: chunks.into_iter().collect(),
        }
    }

    pub fn from_text(text: &str, chunk_chars: usize) -> Self {
        let chars: Vec<char> = text.chars().collect();
        Self::new(
            chars
                .chunks(chunk_chars.max(1))
                .map(|chunk| chunk.iter().collect::<String>()),
        )
    }

    pub fn from_file(path: &Path, chunk_chars: usize) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read stream recording: {}", path.display()))?;
        Ok(Self::from_text(&text, chunk_chars))
    }
}

#[async_trait]
impl ChunkSource for ReplayChunkSource {
    async fn next_chunk(&mut self) -> Result<Option<String>, EngineError> {
        Ok(self.chunks.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn records_split_across_chunks_are_joined() {
        let mut decoder = RecordDecoder::default();
        assert!(decoder.push(r#"{"status":"loading","respo"#).is_empty());
        let events = decoder.push("nse\":\"你好\"}\n{\"status\":\"finished\"}\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].delta.as_deref(), Some("你好"));
        assert!(events[1].done);
    }

    #[test]
    fn delta_comes_from_first_non_empty_field() {
        let event = event_from_record(&json!({"response": "", "delta": "x", "text": "y"}));
        assert_eq!(event.delta.as_deref(), Some("x"));
    }

    #[test]
    fn snapshots_and_thread_ids_are_recognized() {
        let event = event_from_record(&json!({
            "status": "agent_state",
            "agent_state": {"outline": []},
            "meta": {"thread_id": 42}
        }));
        assert_eq!(event.snapshot, Some(json!({"outline": []})));
        assert_eq!(event.thread_id.as_deref(), Some("42"));
    }

    #[test]
    fn event_prefix_and_done_marker() {
        let mut decoder = RecordDecoder::default();
        let events = decoder.push("event: message\ndata: {\"text\":\"a\"}\n\n: keepalive\ndata: [DONE]\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].delta.as_deref(), Some("a"));
        assert!(events[1].done);
    }

    #[test]
    fn garbage_lines_are_skipped() {
        let mut decoder = RecordDecoder::default();
        let events = decoder.push("not json at all\n{\"text\":\"ok\"}\n");
        assert_eq!(events.len(), 1);
        assert_eq!(decoder.skipped(), 1);
    }

    #[test]
    fn value_broken_by_raw_newline_is_retried() {
        let mut decoder = RecordDecoder::default();
        let events = decoder.push("{\"text\":\"line one\nline two\"}\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].delta.as_deref(), Some("line one\nline two"));
    }

    #[test]
    fn unterminated_tail_is_decoded_on_finish() {
        let mut decoder = RecordDecoder::default();
        assert!(decoder.push("{\"text\":\"tail\"}").is_empty());
        let events = decoder.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].delta.as_deref(), Some("tail"));
    }

    #[test]
    fn error_records_carry_a_message() {
        let event = event_from_record(&json!({"status": "error", "error_message": "boom"}));
        assert_eq!(event.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn replay_source_yields_fixed_chunks() -> anyhow::Result<()> {
        let mut source = ReplayChunkSource::from_text("你好世界!", 2);
        let mut chunks = Vec::new();
        while let Some(chunk) = source.next_chunk().await? {
            chunks.push(chunk);
        }
        assert_eq!(chunks, vec!["你好", "世界", "!"]);
        Ok(())
    }
}
