//! bqlink CLI - inspect, count and load BigQuery tables

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bqlink_connectors::{
    BigQueryClient, BigQueryWriter, ObjectStoreStager, RestControlApi, StaticToken, WriteOutcome,
};
use bqlink_core::schema::to_engine_schema;
use bqlink_core::{OptionMap, ReadConfig, WriteConfig};
use clap::{Parser, Subcommand};
use datafusion::prelude::{CsvReadOptions, ParquetReadOptions, SessionContext};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "bqlink")]
#[command(about = "Read and write BigQuery tables from DataFusion")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// OAuth access token for the BigQuery API
    #[arg(long, global = true, env = "BQ_ACCESS_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Project billed for jobs, when the table names none
    #[arg(long, global = true, env = "GOOGLE_CLOUD_PROJECT")]
    project: Option<String>,

    /// Extra connector option, repeatable
    #[arg(short = 'o', long = "option", global = true, value_parser = parse_option)]
    options: Vec<(String, String)>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the schema of a table and the engine types it maps to
    Schema {
        /// Table as `project.dataset.table` or `dataset.table`
        table: String,

        /// Print the warehouse schema as JSON
        #[arg(long)]
        json: bool,
    },

    /// Count the rows of a table
    Count {
        table: String,

        /// Row restriction in BigQuery standard SQL
        #[arg(short, long)]
        filter: Option<String>,
    },

    /// Load a local Parquet or CSV file into a table
    Load {
        /// Path to the file
        file: PathBuf,

        /// Destination table
        table: String,

        /// Bucket used to stage the data
        #[arg(short, long)]
        bucket: String,

        /// append, overwrite, errorifexists or ignore
        #[arg(short, long, default_value = "errorifexists")]
        mode: String,
    },
}

fn parse_option(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match &cli.command {
        Commands::Schema { table, json } => show_schema(&cli, table, *json).await?,
        Commands::Count { table, filter } => count_rows(&cli, table, filter.as_deref()).await?,
        Commands::Load {
            file,
            table,
            bucket,
            mode,
        } => load_file(&cli, file, table, bucket, mode).await?,
    }

    Ok(())
}

fn options(cli: &Cli, extra: &[(&str, &str)]) -> OptionMap {
    let pairs = cli
        .options
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .chain(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    OptionMap::from_pairs(pairs)
}

fn rest_api(cli: &Cli) -> Result<RestControlApi> {
    let token = cli
        .token
        .clone()
        .context("an access token is required, pass --token or set BQ_ACCESS_TOKEN")?;
    Ok(RestControlApi::new(Box::new(StaticToken(token)))?)
}

fn client(cli: &Cli, parent_project: &str) -> Result<BigQueryClient> {
    Ok(BigQueryClient::new(Arc::new(rest_api(cli)?), parent_project))
}

fn read_config(cli: &Cli, table: &str) -> Result<ReadConfig> {
    let config = ReadConfig::from_options(&options(cli, &[("table", table)]), cli.project.as_deref())?;
    Ok(config)
}

async fn show_schema(cli: &Cli, table: &str, json: bool) -> Result<()> {
    let config = read_config(cli, table)?;
    let client = BigQueryClient::from_config(Arc::new(rest_api(cli)?), &config);
    let info = client
        .get_table(&config.table)
        .await?
        .with_context(|| format!("table '{}' not found", config.table))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info.schema)?);
        return Ok(());
    }

    let engine = to_engine_schema(&info.schema)?;
    println!("\n=== {} ({}) ===", info.reference, info.table_type);
    for (field, engine_field) in info.schema.fields.iter().zip(engine.fields()) {
        println!(
            "  {:<32} {:<12} {:<10} -> {}",
            field.name,
            field.field_type,
            format!("{:?}", field.mode),
            engine_field.data_type()
        );
    }
    if let Some(rows) = info.num_rows {
        println!("\nRows: {}", rows);
    }
    Ok(())
}

async fn count_rows(cli: &Cli, table: &str, filter: Option<&str>) -> Result<()> {
    let config = read_config(cli, table)?;
    let client = client(cli, &config.parent_project)?;
    let filter = filter.or(config.filter.as_deref());
    let rows = client.count_rows(&config.table, filter).await?;
    info!("Counted rows of '{}' with filter {:?}", config.table, filter);
    println!("{}", rows);
    Ok(())
}

async fn load_file(cli: &Cli, file: &Path, table: &str, bucket: &str, mode: &str) -> Result<()> {
    let options = options(
        cli,
        &[("table", table), ("temporaryGcsBucket", bucket), ("saveMode", mode)],
    );
    let config = WriteConfig::from_options(&options, cli.project.as_deref())?;

    let path = file
        .to_str()
        .with_context(|| format!("path {:?} is not valid UTF-8", file))?;
    let ctx = SessionContext::new();
    let df = match file.extension().and_then(|e| e.to_str()) {
        Some("parquet") => ctx.read_parquet(path, ParquetReadOptions::default()).await?,
        Some("csv") => ctx.read_csv(path, CsvReadOptions::new()).await?,
        _ => anyhow::bail!("Unsupported file format: {}", path),
    };
    let schema = Arc::clone(df.schema().inner());
    let batches = df.collect().await?;
    info!("Read {} batches from {}", batches.len(), path);

    let client = client(cli, &config.parent_project)?;
    let stager = Arc::new(ObjectStoreStager::gcs(&config.temporary_gcs_bucket)?);
    let writer = BigQueryWriter::new(client, stager, config);

    match writer.write(schema, &batches).await? {
        WriteOutcome::Skipped => println!("Table {} exists, nothing written", table),
        WriteOutcome::Loaded { job, rows } => {
            println!("\n=== Load Complete ===");
            println!("Table: {}", writer.config().table);
            println!("Rows:  {}", rows);
            println!("Job:   {}", job.job_id);
        }
    }
    Ok(())
}
