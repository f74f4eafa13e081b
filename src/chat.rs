//! Stream Orchestrator
//!
//! Drives one request through `thinking → sql → data → token* → done` (or the
//! conversational `thinking → token* → done`). The pipeline runs in its own
//! task under a supervisor that owns the terminal `done` event, so every
//! outcome (success, failure, panic, deadline, disconnect) ends the stream
//! exactly once.

use crate::analyzer::{fallback_summary, AnalysisResult, ResultAnalyzer};
use crate::config::EngineConfig;
use crate::error::{NlqError, Result};
use crate::events::{ClientGone, DoneKind, EventSink, StreamEvent};
use crate::example_cache::ExampleValueCache;
use crate::executor::{ExecutionResult, QueryExecutor};
use crate::fallback::PatternFallback;
use crate::llm::GenerationBackend;
use crate::prompt::PromptBuilder;
use crate::request::{ChatRequest, ConversationTurn, ExecuteSqlRequest, TenantContext};
use crate::schema::SchemaContext;
use crate::sql_guard::{SanitizedSql, SqlGuard};
use crate::store::QueryStore;
use crate::telemetry::{ExecutionLogger, QueryLogEntry};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const EVENT_BUFFER: usize = 64;
const TOKEN_BUFFER: usize = 64;

const CAPABILITIES_BLURB: &str = "I can answer questions about your school's data. \
Try asking things like \"show students absent today\", \"list pending fees\", \
\"top performers in the last exam\" or \"how many students are in each class\".";

lazy_static! {
    static ref DATA_INTENT_RE: Regex = Regex::new(
        r"(?i)\b(show|list|which|who|whom|how\s+many|how\s+much|find|get|give|display|count|fetch|tell\s+me|total|average|avg|percentage|ratio|compare|top|search|absent|attendance|fees?|dues|exams?|marks|grades|enrolled|enrollment)\b"
    )
    .unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    NeedsData,
    Conversational,
}

impl Route {
    pub fn as_str(&self) -> &'static str {
        match self {
            Route::NeedsData => "data_query",
            Route::Conversational => "conversation",
        }
    }
}

/// Lexical routing: an interrogative or action verb, or a noun that only
/// makes sense against school records, means the question needs data.
pub fn classify(message: &str) -> Route {
    if DATA_INTENT_RE.is_match(message) {
        Route::NeedsData
    } else {
        Route::Conversational
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySource {
    Backend,
    Pattern(&'static str),
}

/// SQL produced for one question, ready to execute.
#[derive(Debug, Clone)]
pub struct GeneratedQuery {
    pub raw_text: String,
    pub sanitized_sql: SanitizedSql,
    pub description: String,
    pub source: QuerySource,
}

impl GeneratedQuery {
    pub fn to_json(&self) -> Value {
        let source = match self.source {
            QuerySource::Backend => "backend".to_string(),
            QuerySource::Pattern(rule) => format!("pattern:{}", rule),
        };
        json!({
            "sql": self.sanitized_sql.as_str(),
            "description": self.description,
            "source": source,
            "rawText": self.raw_text,
        })
    }
}

/// Folded form of an event stream, returned by `POST /chat`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetch_via_api: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChatResponse {
    fn absorb(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Thinking { .. } => {}
            StreamEvent::Sql { sql, .. } => self.sql = Some(sql),
            StreamEvent::Data(payload) => {
                self.count = payload["count"].as_u64();
                self.data = payload.get("data").cloned();
                self.fetch_via_api = payload["fetchViaApi"].as_bool();
            }
            StreamEvent::Token { content } => self.message.push_str(&content),
            StreamEvent::Error { message, .. } => self.error = Some(message),
            StreamEvent::Done { kind, extra } => {
                self.kind = kind.as_str().to_string();
                self.analysis = extra.get("analysis").cloned();
                if self.message.is_empty() {
                    if let Some(error) = &self.error {
                        self.message = error.clone();
                    }
                }
            }
        }
    }
}

/// Why the pipeline stopped early.
enum Abort {
    Failed(NlqError),
    ClientGone,
}

impl From<NlqError> for Abort {
    fn from(err: NlqError) -> Self {
        Abort::Failed(err)
    }
}

impl From<ClientGone> for Abort {
    fn from(_: ClientGone) -> Self {
        Abort::ClientGone
    }
}

/// What a successful pipeline hands back to the supervisor.
struct Outcome {
    kind: DoneKind,
    extra: Map<String, Value>,
    sql: Option<String>,
    rows: Option<usize>,
    delivery: Option<&'static str>,
}

impl Outcome {
    fn conversation() -> Self {
        Self {
            kind: DoneKind::Conversation,
            extra: Map::new(),
            sql: None,
            rows: None,
            delivery: None,
        }
    }
}

/// Result of relaying a backend token stream.
struct Relayed {
    emitted: usize,
    result: Result<String>,
}

pub struct ChatEngine {
    prompts: PromptBuilder,
    guard: SqlGuard,
    executor: QueryExecutor,
    analyzer: ResultAnalyzer,
    fallback: Option<PatternFallback>,
    backend: Option<Arc<dyn GenerationBackend>>,
    logger: ExecutionLogger,
    token_delay: Duration,
    stream_timeout: Duration,
}

impl ChatEngine {
    pub fn new(
        config: &EngineConfig,
        schema: Arc<SchemaContext>,
        store: Arc<dyn QueryStore>,
        backend: Option<Arc<dyn GenerationBackend>>,
    ) -> Self {
        let examples = Arc::new(ExampleValueCache::new(Arc::clone(&store), config.example_ttl));
        let prompts = PromptBuilder::new(schema, examples, config.tenant_placeholder.clone())
            .with_history_turns(config.history_turns)
            .with_max_chars(config.max_prompt_chars);
        let guard = SqlGuard::new(config.tenant_placeholder.clone());
        let fallback = config
            .pattern_fallback
            .then(|| PatternFallback::new(guard.clone()));

        if backend.is_none() && fallback.is_none() {
            warn!("No generation backend and pattern fallback disabled; data questions will fail");
        }

        Self {
            prompts,
            guard,
            executor: QueryExecutor::new(store, config.inline_row_limit),
            analyzer: ResultAnalyzer::new(),
            fallback,
            backend,
            logger: ExecutionLogger::default(),
            token_delay: config.token_delay,
            stream_timeout: config.stream_timeout,
        }
    }

    pub fn logger(&self) -> &ExecutionLogger {
        &self.logger
    }

    pub fn has_backend(&self) -> bool {
        self.backend.is_some()
    }

    /// Start the pipeline; events arrive on the returned receiver, `done` last.
    /// Dropping the receiver stops the pipeline at its next event.
    pub fn spawn_stream(self: &Arc<Self>, request: ChatRequest) -> mpsc::Receiver<StreamEvent> {
        self.start(request, self.token_delay)
    }

    /// Run the same pipeline without token pacing and fold the events.
    pub async fn respond(self: &Arc<Self>, request: ChatRequest) -> ChatResponse {
        let mut events = self.start(request, Duration::ZERO);
        let mut response = ChatResponse::default();
        while let Some(event) = events.recv().await {
            response.absorb(event);
        }
        response
    }

    /// Synthesize and validate SQL without executing it.
    pub async fn generate_sql(&self, request: &ChatRequest) -> Result<GeneratedQuery> {
        let tenant = request.validate()?;
        self.synthesize(request.message.trim(), &request.conversation_history, tenant)
            .await
    }

    /// Like [`generate_sql`](Self::generate_sql) but never calls the backend.
    pub fn generate_fallback_sql(&self, request: &ChatRequest) -> Result<Option<GeneratedQuery>> {
        let tenant = request.validate()?;
        let fallback = match &self.fallback {
            Some(fallback) => fallback.clone(),
            None => PatternFallback::new(self.guard.clone()),
        };
        Ok(fallback
            .generate(request.message.trim(), tenant)?
            .map(|q| GeneratedQuery {
                raw_text: q.sql.as_str().to_string(),
                sanitized_sql: q.sql,
                description: q.description,
                source: QuerySource::Pattern(q.rule),
            }))
    }

    /// Re-run a statement sent back by a client (the fetch-via-API path).
    /// Every row is returned; there is no inline limit here.
    pub async fn execute_sql(&self, request: &ExecuteSqlRequest) -> Result<Value> {
        let started = Instant::now();
        let tenant = request.validate()?;
        let mut entry = QueryLogEntry::new(&tenant.tenant_id, &request.sql, "execute_sql");

        let outcome = async {
            let sql = self.guard.revalidate(&request.sql, tenant)?;
            self.executor.execute(&sql).await
        }
        .await;

        entry.execution_time_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(result) => {
                entry.sql_generated = Some(result.sql.clone());
                entry.rows_returned = Some(result.row_count as u64);
                self.logger.log_query(entry);
                Ok(json!({ "data": result.rows, "count": result.row_count }))
            }
            Err(e) => {
                self.logger.log_query(entry.failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn start(self: &Arc<Self>, request: ChatRequest, pacing: Duration) -> mpsc::Receiver<StreamEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.supervise(request, EventSink::new(tx), pacing).await;
        });
        rx
    }

    async fn supervise(self: Arc<Self>, request: ChatRequest, sink: EventSink, pacing: Duration) {
        let started = Instant::now();
        let tenant_id = request
            .context
            .as_ref()
            .map(|c| c.tenant_id.clone())
            .unwrap_or_default();
        let mut entry = QueryLogEntry::new(tenant_id, request.message.clone(), classify(&request.message).as_str());
        info!("Chat request {} ({})", entry.request_id, entry.route);

        let engine = Arc::clone(&self);
        let worker_sink = sink.clone();
        let mut worker =
            tokio::spawn(async move { engine.pipeline(request, &worker_sink, pacing).await });

        let outcome = match tokio::time::timeout(self.stream_timeout, &mut worker).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => {
                error!("Chat pipeline crashed: {}", join_error);
                Err(Abort::Failed(NlqError::Generation(
                    "internal error while answering".to_string(),
                )))
            }
            Err(_) => {
                worker.abort();
                let _ = worker.await;
                warn!("Chat request {} exceeded {:?}", entry.request_id, self.stream_timeout);
                sink.finish(
                    Some(StreamEvent::Error {
                        kind: "timeout".to_string(),
                        message: format!("request timed out after {}s", self.stream_timeout.as_secs()),
                    }),
                    DoneKind::Error,
                    Map::new(),
                )
                .await;
                entry.execution_time_ms = started.elapsed().as_millis() as u64;
                self.logger.log_query(entry.failed("timed out"));
                return;
            }
        };

        entry.execution_time_ms = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(outcome) => {
                entry.sql_generated = outcome.sql;
                entry.rows_returned = outcome.rows.map(|n| n as u64);
                entry.delivery = outcome.delivery.map(str::to_string);
                sink.finish(None, outcome.kind, outcome.extra).await;
                self.logger.log_query(entry);
            }
            Err(Abort::Failed(err)) => {
                sink.finish(Some(StreamEvent::from_error(&err)), DoneKind::Error, Map::new())
                    .await;
                self.logger.log_query(entry.failed(err.to_string()));
            }
            Err(Abort::ClientGone) => {
                debug!("Client left before request {} finished", entry.request_id);
                self.logger.log_query(entry.failed("client disconnected"));
            }
        }
    }

    async fn pipeline(
        &self,
        request: ChatRequest,
        sink: &EventSink,
        pacing: Duration,
    ) -> std::result::Result<Outcome, Abort> {
        let tenant = request.validate()?.clone();
        let question = request.message.trim();
        let history = &request.conversation_history;

        match classify(question) {
            Route::Conversational => self.converse(question, history, sink, pacing).await,
            Route::NeedsData => self.answer_with_data(question, history, &tenant, sink, pacing).await,
        }
    }

    async fn answer_with_data(
        &self,
        question: &str,
        history: &[ConversationTurn],
        tenant: &TenantContext,
        sink: &EventSink,
        pacing: Duration,
    ) -> std::result::Result<Outcome, Abort> {
        sink.emit(StreamEvent::thinking("Analyzing your question...")).await?;

        let query = self.synthesize(question, history, tenant).await?;
        sink.emit(StreamEvent::Sql {
            sql: query.sanitized_sql.as_str().to_string(),
            description: query.description.clone(),
        })
        .await?;

        let result = self.executor.execute(&query.sanitized_sql).await?;
        let delivery = self.executor.delivery(&result);
        sink.emit(StreamEvent::Data(delivery.to_payload())).await?;

        let analysis = match self.analyzer.analyze(question, &result.rows) {
            Ok(analysis) => analysis,
            Err(e) => {
                debug!("Analysis skipped: {}", e);
                None
            }
        };

        self.narrate(question, &result, analysis.as_ref(), sink, pacing).await?;

        let mut extra = Map::new();
        extra.insert("count".to_string(), json!(result.row_count));
        if let Some(analysis) = &analysis {
            extra.insert("analysis".to_string(), serde_json::to_value(analysis).map_err(NlqError::from)?);
        }

        Ok(Outcome {
            kind: DoneKind::DataQuery,
            extra,
            sql: Some(result.sql),
            rows: Some(result.row_count),
            delivery: Some(if delivery.is_inline() { "inline" } else { "fetch_via_api" }),
        })
    }

    async fn converse(
        &self,
        message: &str,
        history: &[ConversationTurn],
        sink: &EventSink,
        pacing: Duration,
    ) -> std::result::Result<Outcome, Abort> {
        sink.emit(StreamEvent::thinking("Thinking...")).await?;

        let Some(backend) = &self.backend else {
            self.speak(CAPABILITIES_BLURB, sink, pacing).await?;
            return Ok(Outcome::conversation());
        };

        let prompt = self.prompts.build_conversation_prompt(message, history).await?;
        let relayed = self.relay(backend.as_ref(), &prompt, sink).await?;
        if let Err(e) = relayed.result {
            if relayed.emitted == 0 {
                return Err(e.into());
            }
            warn!("Conversation stream ended early after {} tokens: {}", relayed.emitted, e);
        }
        Ok(Outcome::conversation())
    }

    /// Backend first; the pattern table only when the backend is missing or
    /// failed outright. Validation failures are final.
    async fn synthesize(
        &self,
        question: &str,
        history: &[ConversationTurn],
        tenant: &TenantContext,
    ) -> Result<GeneratedQuery> {
        let failure = match &self.backend {
            Some(backend) => {
                let prompt = self.prompts.build_sql_prompt(question, history).await?;
                match backend.generate(&prompt).await {
                    Ok(raw) if !raw.is_blank() => {
                        let sanitized_sql = self.guard.sanitize(&raw, tenant)?;
                        info!("{} produced SQL for tenant {}", backend.name(), tenant.tenant_id);
                        return Ok(GeneratedQuery {
                            raw_text: raw.as_str().to_string(),
                            sanitized_sql,
                            description: format!("Query for: {}", question),
                            source: QuerySource::Backend,
                        });
                    }
                    Ok(_) => NlqError::Generation(format!("{} returned no SQL", backend.name())),
                    Err(e) => e,
                }
            }
            None => NlqError::Configuration("no generation backend configured".to_string()),
        };
        self.fallback_or(question, tenant, failure)
    }

    fn fallback_or(&self, question: &str, tenant: &TenantContext, failure: NlqError) -> Result<GeneratedQuery> {
        let Some(fallback) = &self.fallback else {
            return Err(failure);
        };
        match fallback.generate(question, tenant)? {
            Some(q) => {
                warn!("Using pattern '{}' after: {}", q.rule, failure);
                Ok(GeneratedQuery {
                    raw_text: q.sql.as_str().to_string(),
                    sanitized_sql: q.sql,
                    description: q.description,
                    source: QuerySource::Pattern(q.rule),
                })
            }
            None => Err(failure),
        }
    }

    /// Stream the narrative from the backend, or speak the deterministic
    /// summary when nothing was streamed.
    async fn narrate(
        &self,
        question: &str,
        result: &ExecutionResult,
        analysis: Option<&AnalysisResult>,
        sink: &EventSink,
        pacing: Duration,
    ) -> std::result::Result<(), Abort> {
        if let Some(backend) = &self.backend {
            match self.prompts.build_narrative_prompt(question, result, analysis) {
                Ok(prompt) => {
                    let relayed = self.relay(backend.as_ref(), &prompt, sink).await?;
                    match relayed.result {
                        Ok(_) if relayed.emitted > 0 => return Ok(()),
                        Ok(_) => debug!("Narrative stream was empty"),
                        Err(e) if relayed.emitted > 0 => {
                            warn!("Narrative cut short after {} tokens: {}", relayed.emitted, e);
                            return Ok(());
                        }
                        Err(e) => warn!("Narrative stream failed: {}", e),
                    }
                }
                Err(e) => warn!("Narrative prompt skipped: {}", e),
            }
        }
        let summary = fallback_summary(result.row_count, analysis);
        self.speak(&summary, sink, pacing).await
    }

    /// Forward backend tokens to the sink as they arrive.
    async fn relay(
        &self,
        backend: &dyn GenerationBackend,
        prompt: &str,
        sink: &EventSink,
    ) -> std::result::Result<Relayed, Abort> {
        let (tx, mut rx) = mpsc::channel::<String>(TOKEN_BUFFER);
        let forward = async move {
            let mut emitted = 0;
            while let Some(token) = rx.recv().await {
                if sink.emit(StreamEvent::token(token)).await.is_err() {
                    return (emitted, true);
                }
                emitted += 1;
            }
            (emitted, false)
        };

        let (result, (emitted, client_gone)) = tokio::join!(backend.generate_streaming(prompt, tx), forward);
        if client_gone {
            return Err(Abort::ClientGone);
        }
        Ok(Relayed { emitted, result })
    }

    /// Word-by-word tokens with a fixed delay between them.
    async fn speak(&self, text: &str, sink: &EventSink, pacing: Duration) -> std::result::Result<(), Abort> {
        for (i, word) in text.split_inclusive(' ').enumerate() {
            if i > 0 && !pacing.is_zero() {
                tokio::time::sleep(pacing).await;
            }
            sink.emit(StreamEvent::token(word)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_routes_on_action_words() {
        assert_eq!(classify("thanks!"), Route::Conversational);
        assert_eq!(classify("hello there"), Route::Conversational);
        assert_eq!(classify("what can you do?"), Route::Conversational);
        assert_eq!(classify("which students in Class XII are absent today?"), Route::NeedsData);
        assert_eq!(classify("How   many teachers do we have"), Route::NeedsData);
        assert_eq!(classify("LIST pending fees"), Route::NeedsData);
        assert_eq!(classify("stop"), Route::Conversational);
        assert_eq!(classify("what are the pending fees?"), Route::NeedsData);
        assert_eq!(classify("are any students absent today?"), Route::NeedsData);
        assert_eq!(classify("students absent today"), Route::NeedsData);
        assert_eq!(classify("good morning"), Route::Conversational);
    }

    #[test]
    fn batch_response_folds_events() {
        let mut response = ChatResponse::default();
        response.absorb(StreamEvent::thinking("..."));
        response.absorb(StreamEvent::Sql {
            sql: "SELECT 1".to_string(),
            description: String::new(),
        });
        response.absorb(StreamEvent::Data(json!({"sql": "SELECT 1", "count": 150, "fetchViaApi": true})));
        response.absorb(StreamEvent::token("150 records "));
        response.absorb(StreamEvent::token("found."));
        response.absorb(StreamEvent::Done {
            kind: DoneKind::DataQuery,
            extra: Map::new(),
        });

        let body = serde_json::to_value(&response).unwrap();
        assert_eq!(body["type"], "data_query");
        assert_eq!(body["message"], "150 records found.");
        assert_eq!(body["count"], 150);
        assert_eq!(body["fetchViaApi"], true);
        assert!(body.get("data").is_none());
        assert!(body.get("error").is_none());
    }

    #[test]
    fn failed_batch_response_carries_the_error_as_message() {
        let mut response = ChatResponse::default();
        response.absorb(StreamEvent::Error {
            kind: "generation".to_string(),
            message: "Generation error: quota".to_string(),
        });
        response.absorb(StreamEvent::Done {
            kind: DoneKind::Error,
            extra: Map::new(),
        });
        assert_eq!(response.kind, "error");
        assert_eq!(response.message, "Generation error: quota");
    }
}
