//! Stream events and the per-request event sink.

use crate::error::NlqError;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Terminal classification carried by the `done` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneKind {
    DataQuery,
    Conversation,
    Error,
}

impl DoneKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DoneKind::DataQuery => "data_query",
            DoneKind::Conversation => "conversation",
            DoneKind::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Thinking { message: String },
    Sql { sql: String, description: String },
    /// Either `{data, count}` or `{sql, count, fetchViaApi}`.
    Data(Value),
    Token { content: String },
    Error { kind: String, message: String },
    Done { kind: DoneKind, extra: Map<String, Value> },
}

impl StreamEvent {
    pub fn thinking(message: impl Into<String>) -> Self {
        StreamEvent::Thinking {
            message: message.into(),
        }
    }

    pub fn token(content: impl Into<String>) -> Self {
        StreamEvent::Token {
            content: content.into(),
        }
    }

    pub fn from_error(err: &NlqError) -> Self {
        StreamEvent::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Thinking { .. } => "thinking",
            StreamEvent::Sql { .. } => "sql",
            StreamEvent::Data(_) => "data",
            StreamEvent::Token { .. } => "token",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Done { .. } => "done",
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StreamEvent::Done { .. })
    }

    pub fn payload(&self) -> Value {
        match self {
            StreamEvent::Thinking { message } => json!({ "message": message }),
            StreamEvent::Sql { sql, description } => json!({
                "sql": sql,
                "description": description,
            }),
            StreamEvent::Data(payload) => payload.clone(),
            StreamEvent::Token { content } => json!({ "content": content }),
            StreamEvent::Error { kind, message } => json!({
                "kind": kind,
                "message": message,
            }),
            StreamEvent::Done { kind, extra } => {
                let mut body = extra.clone();
                body.insert("type".to_string(), Value::String(kind.as_str().to_string()));
                Value::Object(body)
            }
        }
    }

    /// `event: <kind>\ndata: <json>\n\n`
    pub fn to_sse(&self) -> String {
        format!("event: {}\ndata: {}\n\n", self.kind(), self.payload())
    }
}

/// The receiving side of a stream went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientGone;

/// Writer half of one request's event stream.
///
/// Clones share the `finished` flag: once `finish` has run, every further
/// `emit` is dropped, so `done` is always the last event on the wire.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<StreamEvent>,
    finished: Arc<AtomicBool>,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self {
            tx,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    pub async fn emit(&self, event: StreamEvent) -> Result<(), ClientGone> {
        if event.is_done() || self.finished.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.tx.send(event).await.map_err(|_| ClientGone)
    }

    /// Optional `error`, then `done`. Runs at most once per stream.
    pub async fn finish(&self, error: Option<StreamEvent>, kind: DoneKind, extra: Map<String, Value>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(error) = error {
            if self.tx.send(error).await.is_err() {
                return;
            }
        }
        let _ = self.tx.send(StreamEvent::Done { kind, extra }).await;
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
