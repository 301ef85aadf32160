use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use latchdb_core::{
    Database, DatabaseConfig, QueryOptions, QueryOutput, RecoveryAction, SqlValue,
};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "latchdb")]
#[command(about = "LatchDB - diagnostics for pooled SQLite databases")]
struct Cli {
    /// Database file path
    #[arg(short, long, global = true, default_value = "latchdb.sqlite3")]
    database: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a single SQL statement
    Exec {
        /// SQL text to execute
        sql: String,
        /// Positional parameters as JSON scalars (e.g. 42, 1.5, '"text"', null)
        #[arg(short, long)]
        param: Vec<String>,
        /// Bypass the result cache for this statement
        #[arg(long)]
        no_cache: bool,
    },
    /// Print pool, cache, and query statistics
    Stats,
    /// Run one health check cycle and print the scored results
    Health,
    /// Execute a recovery action by hand
    Recover {
        #[arg(value_enum)]
        action: RecoverAction,
    },
    /// Print the slowest query shapes seen this session
    Slowest {
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RecoverAction {
    Reconnect,
    Drain,
    Checkpoint,
    Vacuum,
}

impl From<RecoverAction> for RecoveryAction {
    fn from(action: RecoverAction) -> Self {
        match action {
            RecoverAction::Reconnect => RecoveryAction::ReconnectPool,
            RecoverAction::Drain => RecoveryAction::DrainIdle,
            RecoverAction::Checkpoint => RecoveryAction::WalCheckpoint,
            RecoverAction::Vacuum => RecoveryAction::VacuumAnalyze,
        }
    }
}

fn parse_param(raw: &str) -> Result<SqlValue> {
    let value: serde_json::Value = serde_json::from_str(raw)
        .with_context(|| format!("parameter is not a JSON scalar: {raw}"))?;
    Ok(match value {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                SqlValue::Integer(i)
            } else {
                SqlValue::Real(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => SqlValue::Text(s),
        other => anyhow::bail!("only scalar parameters are supported, got {other}"),
    })
}

fn print_output(output: &QueryOutput) {
    if output.columns.is_empty() {
        println!("{}", json!({ "rows_affected": output.rows_affected }));
        return;
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "columns": output.columns,
            "rows": output.rows,
            "cached": output.cached,
        }))
        .unwrap_or_default()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let db = Database::open(&cli.database, DatabaseConfig::default())
        .await
        .with_context(|| format!("failed to open {}", cli.database.display()))?;

    match cli.command {
        Commands::Exec {
            sql,
            param,
            no_cache,
        } => {
            let params = param
                .iter()
                .map(|p| parse_param(p))
                .collect::<Result<Vec<_>>>()?;
            let opts = QueryOptions {
                timeout: Some(Duration::from_secs(30)),
                enable_cache: !no_cache,
                ..Default::default()
            };
            let output = db.execute_query(&sql, &params, opts).await?;
            print_output(&output);
        }
        Commands::Stats => {
            println!("{}", serde_json::to_string_pretty(&db.stats())?);
        }
        Commands::Health => {
            let results = db.run_health_checks().await;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        Commands::Recover { action } => {
            let attempt = db.recovery().execute(action.into(), "manual via CLI").await;
            println!("{}", serde_json::to_string_pretty(&attempt)?);
            if !attempt.success {
                db.shutdown().await;
                anyhow::bail!("recovery action did not succeed");
            }
        }
        Commands::Slowest { limit } => {
            println!(
                "{}",
                serde_json::to_string_pretty(&db.metrics().slowest(limit))?
            );
        }
    }

    db.shutdown().await;
    Ok(())
}
