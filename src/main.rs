//! Local test driver: runs a whole execution in-process, sharding first,
//! then every reducing step, with the fleet nodes invoked inline.

use anyhow::Result;
use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use cpipes::config::JetsEnv;
use cpipes::config::model::{ComputePipesRun, StartComputePipesArgs};
use cpipes::controller::{self, status};
use cpipes::logging;
use cpipes::s3::store;

/// cpipes - compute pipes local test driver
#[derive(Parser)]
#[command(name = "cpipes")]
#[command(version = "0.1.0")]
#[command(about = "Run a compute-pipes execution locally, one node at a time")]
struct Cli {
    /// Pipeline execution key (required)
    #[arg(long = "pe_key")]
    pe_key: i64,

    /// The input file_key (required)
    #[arg(long = "file_key")]
    file_key: String,

    /// Pipeline session ID (required)
    #[arg(long = "session_id")]
    session_id: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(&cli.log_level);

    if let Err(e) = run(&cli).await {
        tracing::error!("{e}");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
    tracing::info!("that's it folks!");
}

async fn run(cli: &Cli) -> Result<()> {
    let env = JetsEnv::from_env()?;
    let dsn = resolve_dsn(&env)?;
    let db = PgPoolOptions::new()
        .max_connections(20)
        .connect(&dsn)
        .await?;
    let store = store::from_env(&env)?;

    let args = StartComputePipesArgs {
        pipeline_exec_key: cli.pe_key,
        file_key: cli.file_key.clone(),
        session_id: cli.session_id.clone(),
        ..Default::default()
    };
    status::update_pipeline_status(&db, cli.pe_key, "running", "").await?;

    let outcome = run_all_steps(&args, &env, &db, &store).await;
    match outcome {
        Ok(()) => {
            status::update_pipeline_status(&db, cli.pe_key, "completed", "").await?;
            Ok(())
        }
        Err(e) => {
            status::update_pipeline_status(&db, cli.pe_key, "failed", &e.to_string()).await?;
            Err(e)
        }
    }
}

async fn run_all_steps(
    args: &StartComputePipesArgs,
    env: &JetsEnv,
    db: &sqlx::PgPool,
    store: &store::StoreHandle,
) -> Result<()> {
    let mut run: ComputePipesRun = controller::start_sharding(args, env, db, store).await?;
    tracing::info!("sharding: {} nodes", run.cpipes_commands.len());
    run_fleet(&run, env, db, store).await?;

    while let Some(next) = run.start_reducing.clone() {
        run = controller::start_reducing(&next, env, db).await?;
        tracing::info!(
            "reducing step {}: {} nodes",
            next.step_id.unwrap_or(0),
            run.cpipes_commands.len()
        );
        run_fleet(&run, env, db, store).await?;
    }
    Ok(())
}

async fn run_fleet(
    run: &ComputePipesRun,
    env: &JetsEnv,
    db: &sqlx::PgPool,
    store: &store::StoreHandle,
) -> Result<()> {
    for command in &run.cpipes_commands {
        tracing::info!("## node {}", command.node_id);
        let result =
            controller::coordinate_compute_pipes(command, env, db.clone(), store.clone()).await?;
        tracing::info!(
            "## node {} done: {} rows in, {} parts written",
            command.node_id,
            result.rows_in,
            result.parts_written
        );
    }
    Ok(())
}

/// The DSN comes from the configured secret; local runs (ssh tunnel or dev
/// mode) may pass it verbatim through `JETS_DSN_SECRET`.
fn resolve_dsn(env: &JetsEnv) -> Result<String> {
    if env.dsn_secret.starts_with("postgres://") || env.dsn_secret.starts_with("postgresql://") {
        return Ok(env.dsn_secret.clone());
    }
    if let Ok(dsn) = std::env::var("JETS_DSN") {
        return Ok(dsn);
    }
    Err(anyhow::anyhow!(
        "JETS_DSN_SECRET does not hold a dsn; set JETS_DSN for local runs"
    ))
}
