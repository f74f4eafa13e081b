pub mod analyzer;
pub mod chat;
pub mod config;
pub mod error;
pub mod events;
pub mod example_cache;
pub mod executor;
pub mod fallback;
pub mod http;
pub mod llm;
pub mod prompt;
pub mod request;
pub mod schema;
pub mod sql_guard;
pub mod store;
pub mod telemetry;

pub use chat::{classify, ChatEngine, ChatResponse, GeneratedQuery, QuerySource, Route};
pub use config::{BackendConfig, EngineConfig, ProviderKind};
pub use error::{NlqError, Result, ValidationRule};
pub use events::{DoneKind, StreamEvent};
pub use llm::{GenerationBackend, LlmClient};
pub use request::{ChatRequest, ConversationTurn, ExecuteSqlRequest, Role, TenantContext};
pub use schema::SchemaContext;
pub use sql_guard::{RawGenerationText, SanitizedSql, SqlGuard};
pub use store::{PgStore, QueryStore, Row};
