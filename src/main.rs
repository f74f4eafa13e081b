use anyhow::{Context, Result};
use campus_nlq::config::{EngineConfig, ProviderKind};
use campus_nlq::store::{QueryStore, UnavailableStore};
use campus_nlq::telemetry::init_tracing;
use campus_nlq::{ChatEngine, ChatRequest, LlmClient, PgStore, SchemaContext, StreamEvent};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "campus-nlq")]
#[command(about = "Ask the school database questions in plain language")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a question and print the event stream
    Ask {
        question: String,

        /// Tenant (school) identifier
        #[arg(short, long)]
        tenant: String,
    },
    /// Print the SQL for a question without running it
    Sql {
        question: String,

        #[arg(short, long)]
        tenant: String,

        /// Use only the built-in pattern table
        #[arg(long)]
        fallback_only: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Ask { question, tenant } => {
            let config = EngineConfig::from_env()?;
            let engine = build_engine(&config, false).await?;
            ask(engine, ChatRequest::new(question, tenant)).await
        }
        Command::Sql {
            question,
            tenant,
            fallback_only,
        } => {
            let mut config = EngineConfig::from_env()?;
            if fallback_only {
                config.backend.provider = ProviderKind::Disabled;
            }
            let engine = build_engine(&config, fallback_only).await?;
            let request = ChatRequest::new(question, tenant);
            let query = if fallback_only {
                engine
                    .generate_fallback_sql(&request)?
                    .context("no pattern matches this question")?
            } else {
                engine.generate_sql(&request).await?
            };
            println!("{}", serde_json::to_string_pretty(&query.to_json())?);
            Ok(())
        }
    }
}

async fn build_engine(config: &EngineConfig, offline: bool) -> Result<Arc<ChatEngine>> {
    let schema = match &config.schema_path {
        Some(path) => SchemaContext::load(path)
            .with_context(|| format!("loading schema from {}", path.display()))?,
        None => SchemaContext::school(),
    };

    let store: Arc<dyn QueryStore> = match (&config.database_url, offline) {
        (Some(url), false) => Arc::new(PgStore::connect(url, config.statement_timeout).await?),
        _ => {
            info!("No database connection; running without live data");
            Arc::new(UnavailableStore)
        }
    };

    let backend = LlmClient::from_config(&config.backend)?;
    Ok(Arc::new(ChatEngine::new(config, Arc::new(schema), store, backend)))
}

async fn ask(engine: Arc<ChatEngine>, request: ChatRequest) -> Result<()> {
    let mut events = engine.spawn_stream(request);
    let mut stdout = std::io::stdout();

    while let Some(event) = events.recv().await {
        match event {
            StreamEvent::Thinking { message } => eprintln!("… {}", message),
            StreamEvent::Sql { sql, description } => {
                eprintln!("{}", description);
                println!("\n{}\n", sql);
            }
            StreamEvent::Data(payload) => {
                if payload["fetchViaApi"].as_bool().unwrap_or(false) {
                    println!("{} rows (too many to show inline)\n", payload["count"]);
                } else {
                    println!("{}\n", serde_json::to_string_pretty(&payload["data"])?);
                }
            }
            StreamEvent::Token { content } => {
                print!("{}", content);
                stdout.flush()?;
            }
            StreamEvent::Error { kind, message } => eprintln!("\n[{}] {}", kind, message),
            StreamEvent::Done { kind, .. } => {
                println!();
                info!("Finished ({})", kind.as_str());
            }
        }
    }
    Ok(())
}
