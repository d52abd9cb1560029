use anyhow::{Context, Result};
use askdb::config::AppConfig;
use askdb::db::{safety, EngineRegistry, RelationalExecutor};
use askdb::document::{DocumentCluster, DocumentExecutor, Resolver};
use askdb::export;
use askdb::llm::{
    CachedGenerator, DocumentQueryGenerator, GeminiGenerator, HeuristicDocumentGenerator,
    SqlGenerator,
};
use askdb::router::{ResponseKind, RouteResponse, Router};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Ask questions in plain language and get answers from PostgreSQL or MongoDB
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Config file (defaults to <config dir>/askdb/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log progress to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// How document queries are generated
    #[arg(long, value_enum, default_value_t = GeneratorChoice::Llm, global = true)]
    document_generator: GeneratorChoice,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer one question
    Ask {
        question: String,
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Answer questions read line by line from stdin
    Repl {
        #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
        format: OutputFormat,
    },
    /// Check a SQL statement against the read-only guard
    Validate { sql: String },
    /// Print the schema of every reachable backend as JSON
    Schema,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum GeneratorChoice {
    Llm,
    Heuristic,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Table,
    Csv,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .init();

    if let Command::Validate { sql } = &cli.command {
        match safety::sanitize(sql) {
            Ok(sql) => println!("OK: {}", sql),
            Err(rejection) => {
                eprintln!("Rejected: {}", rejection);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    let mut config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    config.apply_process_env();
    let router = build_router(&config, cli.document_generator).await?;

    match cli.command {
        Command::Ask { question, format } => {
            let response = router.route(&question).await;
            print_response(&response, format);
            if response.kind == ResponseKind::ServerError {
                std::process::exit(2);
            }
        }
        Command::Repl { format } => repl(&router, format).await?,
        Command::Schema => println!("{}", export::to_json(&router.schema().await)),
        Command::Validate { .. } => {}
    }

    Ok(())
}

async fn build_router(config: &AppConfig, generator: GeneratorChoice) -> Result<Router> {
    let registry = EngineRegistry::connect(&config.engines);
    if registry.is_empty() {
        tracing::warn!("no relational engines configured; set DATABASE_URL or add [[engines]]");
    }
    let relational = RelationalExecutor::new(Arc::new(registry));

    let cluster = DocumentCluster::connect(&config.document.connect_options()).await;
    let documents = DocumentExecutor::new(cluster, config.document.database_order);
    let resolver = Resolver::new(documents.clone(), config.document.preferred_database.clone())
        .with_probe_limit(config.document.probe_limit);

    if config.llm.api_key.is_none() {
        tracing::warn!("GEMINI_API_KEY is not set; query generation will fail");
    }
    let gemini = GeminiGenerator::new(config.llm.clone()).context("Failed to build LLM client")?;
    let llm = Arc::new(CachedGenerator::new(gemini, &config.cache));
    let sql_generator: Arc<dyn SqlGenerator> = llm.clone();
    let document_generator: Arc<dyn DocumentQueryGenerator> = match generator {
        GeneratorChoice::Llm => llm,
        GeneratorChoice::Heuristic => Arc::new(HeuristicDocumentGenerator::new()),
    };

    Ok(Router::new(
        relational,
        documents,
        resolver,
        sql_generator,
        document_generator,
        config.router.clone(),
    ))
}

async fn repl(router: &Router, format: OutputFormat) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"askdb> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let question = line.trim();
        match question {
            "" => continue,
            "exit" | "quit" | "\\q" => break,
            "\\refresh" => {
                router.refresh_schema();
                println!("Schema cache cleared.");
            }
            _ => {
                let response = router.route(question).await;
                print_response(&response, format);
            }
        }
    }
    Ok(())
}

fn print_response(response: &RouteResponse, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", export::to_json(response)),
        OutputFormat::Csv => print!("{}", export::to_csv(&response.rows)),
        OutputFormat::Table => {
            println!("{}", response.answer);
            if !response.rows.is_empty() {
                print!("{}", export::to_table(&response.rows));
            }
            if let Some(source) = &response.source {
                println!("source: {}", source);
            }
            if let Some(query) = &response.query {
                println!("query: {}", query);
            }
            if let Some(error) = &response.error {
                eprintln!("error: {}", error);
            }
            for suggestion in &response.suggestions {
                println!("  - {}", suggestion);
            }
        }
    }
}
