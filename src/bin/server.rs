//! HTTP server for the query engine
//! Plain tokio TCP loop; one task per connection.

use campus_nlq::config::EngineConfig;
use campus_nlq::http::{
    announced_length, error_response, header_end, json_response, parse_request, sse_headers,
    HttpRequest, MAX_REQUEST_BYTES,
};
use campus_nlq::store::{QueryStore, UnavailableStore};
use campus_nlq::telemetry::init_tracing;
use campus_nlq::{ChatEngine, ChatRequest, ExecuteSqlRequest, LlmClient, NlqError, PgStore, SchemaContext};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

const READ_TIMEOUT: Duration = Duration::from_secs(5);
const HISTORY_LIMIT: usize = 50;

struct AppState {
    engine: Arc<ChatEngine>,
    request_timeout: Duration,
    database: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = EngineConfig::from_env()?;
    let schema = match &config.schema_path {
        Some(path) => SchemaContext::load(path)?,
        None => SchemaContext::school(),
    };

    let store: Arc<dyn QueryStore> = match &config.database_url {
        Some(url) => Arc::new(PgStore::connect(url, config.statement_timeout).await?),
        None => {
            warn!("DATABASE_URL not set; data questions will fail");
            Arc::new(UnavailableStore)
        }
    };

    let backend = LlmClient::from_config(&config.backend)?;
    let state = Arc::new(AppState {
        engine: Arc::new(ChatEngine::new(&config, Arc::new(schema), store, backend)),
        request_timeout: config.request_timeout,
        database: config.database_url.is_some(),
    });

    let listener = TcpListener::bind(&config.bind_addr).await?;
    info!("Listening on http://{}", config.bind_addr);

    loop {
        let (stream, addr) = listener.accept().await?;
        debug!("Connection from {}", addr);
        tokio::spawn(handle_connection(stream, Arc::clone(&state)));
    }
}

async fn handle_connection(mut stream: TcpStream, state: Arc<AppState>) {
    let request = match tokio::time::timeout(READ_TIMEOUT, read_request(&mut stream)).await {
        Ok(Ok(Some(request))) => request,
        Ok(Ok(None)) => {
            let _ = stream
                .write_all(json_response(400, r#"{"error":"Bad Request"}"#).as_bytes())
                .await;
            return;
        }
        Ok(Err(e)) => {
            warn!("Failed to read request: {}", e);
            return;
        }
        Err(_) => {
            debug!("Client sent nothing within {:?}", READ_TIMEOUT);
            return;
        }
    };

    info!("{} {}", request.method, request.path);

    if request.method == "POST" && request.path == "/chat/stream" {
        stream_chat(stream, request, &state).await;
        return;
    }

    let response = match tokio::time::timeout(state.request_timeout, route(&request, &state)).await {
        Ok(response) => response,
        Err(_) => json_response(504, r#"{"error":"request timed out","kind":"timeout"}"#),
    };
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        warn!("Failed to write response: {}", e);
    }
}

/// Read the head, then as much body as `Content-Length` announces.
async fn read_request(stream: &mut TcpStream) -> std::io::Result<Option<HttpRequest>> {
    let mut buffer = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if buffer.len() > MAX_REQUEST_BYTES {
            return Ok(None);
        }
        if let Some(end) = header_end(&buffer) {
            let head = String::from_utf8_lossy(&buffer[..end]);
            let Some(wanted) = announced_length(&head, end) else {
                return Ok(None);
            };
            if wanted > MAX_REQUEST_BYTES {
                return Ok(None);
            }
            if buffer.len() >= wanted {
                buffer.truncate(wanted);
                break;
            }
        }
    }
    Ok(parse_request(&buffer))
}

async fn route(request: &HttpRequest, state: &AppState) -> String {
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => {
            let body = json!({
                "status": "ok",
                "service": "campus-nlq",
                "generation": state.engine.has_backend(),
                "database": state.database,
            });
            json_response(200, &body.to_string())
        }
        ("GET", "/history") => {
            let Some(tenant) = request.header("x-tenant-id") else {
                return json_response(400, r#"{"error":"X-Tenant-Id header is required"}"#);
            };
            let limit = request
                .query
                .get("limit")
                .and_then(|l| l.parse().ok())
                .unwrap_or(HISTORY_LIMIT)
                .min(HISTORY_LIMIT);
            let entries = state.engine.logger().recent_for(tenant, limit);
            json_response(200, &json!({ "history": entries }).to_string())
        }
        ("POST", "/chat") => match parse_chat(&request.body) {
            Ok(chat) => {
                let response = state.engine.respond(chat).await;
                match serde_json::to_string(&response) {
                    Ok(body) => json_response(200, &body),
                    Err(e) => error_response(&NlqError::from(e)),
                }
            }
            Err(e) => error_response(&e),
        },
        ("POST", "/generate-sql") => {
            let outcome = match parse_chat(&request.body) {
                Ok(chat) => state.engine.generate_sql(&chat).await,
                Err(e) => Err(e),
            };
            match outcome {
                Ok(query) => json_response(200, &query.to_json().to_string()),
                Err(e) => error_response(&e),
            }
        }
        ("POST", "/execute-sql") => {
            let outcome = match serde_json::from_str::<ExecuteSqlRequest>(&request.body) {
                Ok(body) => state.engine.execute_sql(&body).await,
                Err(e) => Err(NlqError::from(e)),
            };
            match outcome {
                Ok(result) => json_response(200, &result.to_string()),
                Err(e) => error_response(&e),
            }
        }
        ("OPTIONS", _) => json_response(200, ""),
        _ => {
            warn!("404: {} {}", request.method, request.path);
            json_response(
                404,
                &json!({ "error": format!("Endpoint not found: {} {}", request.method, request.path) })
                    .to_string(),
            )
        }
    }
}

/// Decode and structurally check a chat body.
fn parse_chat(body: &str) -> Result<ChatRequest, NlqError> {
    let request: ChatRequest = serde_json::from_str(body)?;
    request.validate()?;
    Ok(request)
}

/// Write events as they arrive. A failed write drops the receiver, which
/// stops the pipeline at its next event.
async fn stream_chat(mut stream: TcpStream, request: HttpRequest, state: &AppState) {
    let chat: ChatRequest = match serde_json::from_str(&request.body) {
        Ok(chat) => chat,
        Err(e) => {
            let _ = stream
                .write_all(error_response(&NlqError::from(e)).as_bytes())
                .await;
            return;
        }
    };

    if let Err(e) = stream.write_all(sse_headers().as_bytes()).await {
        warn!("Failed to open event stream: {}", e);
        return;
    }

    let mut events = state.engine.spawn_stream(chat);
    while let Some(event) = events.recv().await {
        let done = event.is_done();
        if let Err(e) = stream.write_all(event.to_sse().as_bytes()).await {
            debug!("Client went away mid-stream: {}", e);
            return;
        }
        if let Err(e) = stream.flush().await {
            error!("Flush failed: {}", e);
            return;
        }
        if done {
            break;
        }
    }
    let _ = stream.shutdown().await;
}
