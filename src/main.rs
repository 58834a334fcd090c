use sqlsage::execution::{PostgresExecutor, QueryExecutor, SqliteExecutor};
use sqlsage::feedback::FeedbackStore;
use sqlsage::llm::LlmClient;
use sqlsage::metadata::{CachedSchemaProvider, JsonSchemaSource};
use sqlsage::patterns::PatternLibrary;
use sqlsage::stats::{SqliteStatisticsPersistence, StatisticsStore};
use sqlsage::validation::BusinessRules;
use sqlsage::{EngineConfig, EngineError, QueryEngine};

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sqlsage")]
#[command(about = "Natural-language questions to validated SQL")]
#[command(version)]
struct Args {
    /// Directory holding schema, patterns and business rules
    #[arg(long, default_value = "config", global = true)]
    config_dir: PathBuf,

    /// Schema name; read from <config-dir>/<schema>.json
    #[arg(long, default_value = "schema", global = true)]
    schema: String,

    /// Optional engine config JSON (defaults plus environment otherwise)
    #[arg(long, global = true)]
    engine_config: Option<PathBuf>,

    /// Directory for pattern statistics and feedback databases
    #[arg(long, default_value = "data", global = true)]
    data_dir: PathBuf,

    /// SQLite database used for dry-runs
    #[arg(long, global = true, conflicts_with = "postgres_url")]
    sqlite: Option<PathBuf>,

    /// PostgreSQL URL used for dry-runs (or set DATABASE_URL)
    #[arg(long, global = true)]
    postgres_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve a question into validated SQL
    Ask {
        question: String,

        /// Print the full session trace as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run the validation pipeline on a SQL statement
    Validate { sql: String },
    /// Show pattern statistics
    Stats,
    /// List the pattern library
    Patterns,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sqlsage=info")))
        .init();

    let args = Args::parse();
    let engine = build_engine(&args).await?;

    match args.command {
        Commands::Ask { ref question, json } => ask(&engine, question, json).await,
        Commands::Validate { ref sql } => validate(&engine, sql).await,
        Commands::Stats => {
            show_stats(&engine);
            Ok(())
        }
        Commands::Patterns => {
            show_patterns(&engine);
            Ok(())
        }
    }
}

async fn build_engine(args: &Args) -> Result<QueryEngine> {
    let config = match args.engine_config {
        Some(ref path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env()?,
    };

    let schema = CachedSchemaProvider::new(Arc::new(JsonSchemaSource::new(&args.config_dir)), args.schema.clone());
    let patterns = PatternLibrary::load(args.config_dir.join("patterns.json"))?;
    let rules = load_rules(&args.config_dir.join("business_rules.json"))?;
    let stats = StatisticsStore::open(Arc::new(SqliteStatisticsPersistence::open(&args.data_dir)?))?;
    let feedback = FeedbackStore::open(&args.data_dir)?;

    let mut builder = QueryEngine::builder(config.clone())
        .schema(schema)
        .patterns(patterns)
        .business_rules(rules)
        .statistics(stats)
        .feedback(feedback);

    match LlmClient::from_settings(&config.llm, config.llm_timeout()) {
        Ok(client) => {
            info!("Using language model {}", client.model());
            builder = builder.language_model(Arc::new(client));
        }
        Err(e) => warn!("Language model unavailable: {}", e),
    }

    if let Some(executor) = connect_executor(args).await? {
        info!("Dry-runs use the {} backend", executor.name());
        builder = builder.executor(executor);
    }

    let engine = builder.build()?;
    engine.refresh_schema().await?;
    Ok(engine)
}

fn load_rules(path: &Path) -> Result<BusinessRules> {
    if path.exists() {
        Ok(BusinessRules::load(path)?)
    } else {
        warn!("No business rules at {}", path.display());
        Ok(BusinessRules::default())
    }
}

async fn connect_executor(args: &Args) -> Result<Option<Arc<dyn QueryExecutor>>> {
    if let Some(ref path) = args.sqlite {
        return Ok(Some(Arc::new(SqliteExecutor::open(path)?)));
    }
    let url = args.postgres_url.clone().or_else(|| std::env::var("DATABASE_URL").ok());
    match url {
        Some(url) => Ok(Some(Arc::new(PostgresExecutor::connect(&url).await?))),
        None => Ok(None),
    }
}

async fn ask(engine: &QueryEngine, question: &str, json: bool) -> Result<()> {
    let session = match engine.resolve(question).await {
        Ok(session) => session,
        Err(e) => return report_failure(e),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
        return Ok(());
    }

    if let Some(chosen) = session.chosen() {
        println!("\n=== SQL ({}) ===", chosen.source);
        println!("{}", chosen.sql);
        if !chosen.reasoning.is_empty() {
            println!("\n=== Reasoning ===\n{}", chosen.reasoning);
        }
    }
    println!("\nConfidence: {:.2}", session.final_confidence);
    for result in &session.validation_trace {
        println!(
            "  {:<16} {}  x{:.2}",
            result.stage,
            if result.passed { "pass" } else { "warn" },
            result.confidence_multiplier
        );
        for warning in &result.warnings {
            println!("      - {}", warning);
        }
    }
    if let Some(ref outcome) = session.execution {
        println!("\nDry-run: {} sample rows in {} ms", outcome.row_count, outcome.elapsed_ms);
        for row in &outcome.sample_rows {
            println!("  {}", row);
        }
    }
    Ok(())
}

async fn validate(engine: &QueryEngine, sql: &str) -> Result<()> {
    let verdict = engine.validate_sql(sql).await?;
    for result in &verdict.results {
        println!(
            "{:<16} {}  x{:.2}",
            result.stage,
            if result.passed { "pass" } else { "FAIL" },
            result.confidence_multiplier
        );
        for error in &result.errors {
            println!("    error: {}", error);
        }
        for warning in &result.warnings {
            println!("    warning: {}", warning);
        }
        for suggestion in &result.suggestions {
            println!("    suggestion: {}", suggestion);
        }
    }
    println!("\nOverall confidence: {:.2}", verdict.overall_confidence);
    match verdict.into_error(sql) {
        Some(e) => report_failure(e),
        None => Ok(()),
    }
}

fn report_failure(err: EngineError) -> Result<()> {
    let explanation = err.explain();
    eprintln!("\n{}", explanation.summary);
    if let Some(ref stage) = explanation.stage {
        eprintln!("Stage: {}", stage);
    }
    for detail in &explanation.details {
        eprintln!("  - {}", detail);
    }
    if !explanation.suggestions.is_empty() {
        eprintln!("Suggestions:");
        for suggestion in &explanation.suggestions {
            eprintln!("  * {}", suggestion);
        }
    }
    Err(err.into())
}

fn show_stats(engine: &QueryEngine) {
    let stats = engine.statistics().snapshot();
    if stats.is_empty() {
        println!("No pattern has been used yet");
        return;
    }
    println!("{:<32} {:>8} {:>8} {:>8} {:>10}", "pattern", "matches", "success", "failed", "avg ms");
    for (id, s) in stats {
        println!(
            "{:<32} {:>8} {:>8} {:>8} {:>10}",
            id,
            s.total_matches,
            s.successful_executions,
            s.failed_executions,
            s.average_execution_ms().map(|ms| format!("{:.1}", ms)).unwrap_or_else(|| "-".to_string())
        );
    }
}

fn show_patterns(engine: &QueryEngine) {
    for pattern in engine.patterns().patterns() {
        println!("{} [{}] weight {}", pattern.id, pattern.category, pattern.complexity_weight);
        println!("    {}", pattern.template);
    }
}
