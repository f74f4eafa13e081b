//! Stream framing for the provider wire protocols.
//!
//! Bytes arrive in arbitrary chunks; [`LineBuffer`] reassembles complete lines
//! and [`parse_line`] turns one line into a [`Frame`]. A line that cannot be
//! understood becomes [`Frame::Skip`] so protocol noise never discards text
//! that was already received.

use crate::config::ProviderKind;
use serde_json::Value;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A piece of generated text.
    Delta(String),
    /// The provider signalled the end of the stream.
    Done,
    /// Keep-alives, metadata events, blank lines and malformed frames.
    Skip,
    /// The provider reported an error inside the stream.
    Failed(String),
}

/// Splits a byte stream into UTF-8 lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Feed a chunk and take every line it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&line[..line.len() - 1]));
        }
        lines
    }

    /// Whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let line = String::from_utf8_lossy(bytes);
    line.trim_end_matches('\r').to_string()
}

/// Interpret one line of a streaming response.
pub fn parse_line(provider: ProviderKind, line: &str) -> Frame {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') || line.starts_with("event:") {
        return Frame::Skip;
    }

    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim(),
        // block-delta streams may also arrive as bare line-delimited JSON
        None if provider == ProviderKind::Anthropic => line,
        None => {
            debug!("Skipping unframed stream line: {}", line);
            return Frame::Skip;
        }
    };

    if payload == "[DONE]" {
        return Frame::Done;
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            debug!("Skipping malformed stream frame ({}): {}", e, payload);
            return Frame::Skip;
        }
    };

    match provider {
        ProviderKind::OpenAi => token_delta(&value),
        ProviderKind::Anthropic => block_delta(&value),
        ProviderKind::Gemini => candidate_chunk(&value),
        ProviderKind::Disabled => Frame::Skip,
    }
}

/// `{"choices":[{"delta":{"content":"..."}}]}`
fn token_delta(value: &Value) -> Frame {
    if let Some(message) = error_message(value) {
        return Frame::Failed(message);
    }
    let choice = &value["choices"][0];
    match choice["delta"]["content"].as_str() {
        Some(text) if !text.is_empty() => Frame::Delta(text.to_string()),
        _ => Frame::Skip,
    }
}

/// Typed events; only `content_block_delta` carries text.
fn block_delta(value: &Value) -> Frame {
    match value["type"].as_str() {
        Some("content_block_delta") => match value["delta"]["text"].as_str() {
            Some(text) if !text.is_empty() => Frame::Delta(text.to_string()),
            _ => Frame::Skip,
        },
        Some("message_stop") => Frame::Done,
        Some("error") => Frame::Failed(
            error_message(value).unwrap_or_else(|| "provider reported a stream error".to_string()),
        ),
        _ => Frame::Skip,
    }
}

/// `{"candidates":[{"content":{"parts":[{"text":"..."}]}}]}`
fn candidate_chunk(value: &Value) -> Frame {
    if let Some(message) = error_message(value) {
        return Frame::Failed(message);
    }
    let text = candidate_text(value);
    if text.is_empty() {
        Frame::Skip
    } else {
        Frame::Delta(text)
    }
}

/// Concatenated text parts of the first candidate.
pub fn candidate_text(value: &Value) -> String {
    value["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<String>()
        })
        .unwrap_or_default()
}

/// `error.message` or a bare string `error`.
pub fn error_message(value: &Value) -> Option<String> {
    match &value["error"] {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(
            other["message"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        ),
    }
}
