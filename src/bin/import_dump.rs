use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use import_server::config::ImportConfig;
use import_server::db::run_migrations;
use import_server::import::{ImportError, ImportJob, ImportServices, PgImportStore, new_job_id};

#[derive(Parser, Debug)]
#[command(
    name = "import_dump",
    about = "Import customers and subscriptions from a SQL dump into DATABASE_URL"
)]
struct Args {
    /// Path to the SQL dump file.
    #[arg(long)]
    file: PathBuf,

    /// Progress id to run the import under (random when omitted).
    #[arg(long)]
    progress_id: Option<String>,

    /// Records per bulk upsert; overrides IMPORT_CHUNK_SIZE.
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Skip running migrations before importing.
    #[arg(long)]
    skip_migrations: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp(None)
        .init();

    let args = Args::parse();

    let dump = match tokio::fs::read(&args.file).await {
        Ok(bytes) => bytes,
        Err(err) => {
            let err = ImportError::from(err);
            writeln!(io::stderr(), "error: {}: {err}", args.file.display())?;
            std::process::exit(1);
        }
    };

    let mut config = ImportConfig::from_env();
    if let Some(chunk_size) = args.chunk_size {
        config.chunk_size = chunk_size.max(1);
    }

    let database_url = std::env::var("DATABASE_URL")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .connect(&database_url)
        .await?;

    if !args.skip_migrations {
        run_migrations(&pool).await?;
    }

    let services = ImportServices::new(config);
    let store = PgImportStore::new(pool.clone());
    let job_id = args.progress_id.unwrap_or_else(new_job_id);

    let outcome = ImportJob::new(job_id.clone(), &store, &services)
        .run(&dump)
        .await;
    pool.close().await;

    match outcome {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Err(err) => {
            let progress = services.progress.get(&job_id);
            writeln!(
                io::stderr(),
                "error: import {job_id}: {} ({err})",
                progress.message
            )?;
            std::process::exit(1);
        }
    }
}
