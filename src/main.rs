use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use sis_query::executor::{init_pool, PgQueryExecutor};
use sis_query::fragments::{CachedFragmentStore, FragmentStore, JsonFragmentStore};
use sis_query::orchestrator::{GeneratorSettings, QueryGenerator};
use sis_query::{AccessScope, AppConfig, GenerationMode, GenerationRequest, OpenAiChatModel};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Fragment,
    View,
}

#[derive(Parser)]
#[command(name = "sis-query")]
#[command(about = "Turn a natural-language request into scoped SQL over the student information system")]
struct Args {
    /// The request in natural language
    prompt: String,

    /// Generation mode
    #[arg(short, long, value_enum, default_value = "view")]
    mode: Mode,

    /// Schools the caller may read (comma separated); omit for district-wide access
    #[arg(long, value_delimiter = ',')]
    schools: Option<Vec<i64>>,

    /// Active school
    #[arg(long)]
    active_school: Option<i64>,

    /// Limit results to this teacher's roster
    #[arg(long)]
    teacher: Option<i64>,

    /// Execute the generated SQL (requires DATABASE_URL)
    #[arg(short, long)]
    execute: bool,

    /// Include per-attempt diagnostics on failure
    #[arg(long)]
    diagnostics: bool,

    /// Path to the fragment library (overrides FRAGMENTS_PATH)
    #[arg(long)]
    fragments: Option<PathBuf>,

    /// OpenAI API key (or set OPENAI_API_KEY env var)
    #[arg(long)]
    api_key: Option<String>,

    /// Maximum generation attempts (overrides MAX_ATTEMPTS)
    #[arg(long)]
    max_attempts: Option<u8>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut config = AppConfig::from_env()?;
    if let Some(key) = args.api_key {
        config.openai_api_key = Some(key);
    }
    if let Some(path) = args.fragments {
        config.fragments_path = path;
    }
    if let Some(max_attempts) = args.max_attempts {
        config.max_attempts = max_attempts.max(1);
    }

    let llm = OpenAiChatModel::from_config(&config)?;
    let store: Arc<dyn FragmentStore> = Arc::new(CachedFragmentStore::new(
        Arc::new(JsonFragmentStore::new(config.fragments_path.clone())),
        config.fragment_cache_ttl,
    ));

    let mut generator = QueryGenerator::new(Arc::new(llm), store, GeneratorSettings::from(&config));
    if args.execute {
        let url = config
            .database_url
            .as_deref()
            .context("--execute requires DATABASE_URL")?;
        let pool = init_pool(url).await?;
        generator = generator.with_executor(Arc::new(PgQueryExecutor::new(pool, config.max_rows)));
    }

    let mut scope = match args.schools {
        Some(ids) => AccessScope::schools(ids),
        None => AccessScope::district(),
    };
    if let Some(school) = args.active_school {
        scope = scope.with_active_school(school);
    }
    if let Some(teacher) = args.teacher {
        scope = scope.with_roster_teacher(teacher);
    }
    scope = scope.with_diagnostics(args.diagnostics);

    let request = GenerationRequest {
        prompt: args.prompt,
        mode: match args.mode {
            Mode::Fragment => GenerationMode::Fragment,
            Mode::View => GenerationMode::View,
        },
        execute: args.execute,
    };

    info!("Generating query ({:?} mode)", request.mode);
    let response = generator.handle(&request, &scope).await;
    println!("{}", serde_json::to_string_pretty(&response)?);

    if !response.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
