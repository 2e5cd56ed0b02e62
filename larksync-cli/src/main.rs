use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use larksync_server::config::Config;
use larksync_server::scheduler::{run_daemon, run_once, run_single_issue};
use larksync_server::status::build_status;
use larksync_server::workflow::CycleOutcome;
use larksync_server::SyncContext;

/// larksync: one-way incremental sync of JIRA issues into Lark Base tables.
#[derive(Parser, Debug)]
#[command(name = "larksync")]
#[command(about = "Sync JIRA issues into Lark Base tables", long_about = None)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one sync pass for the enabled bindings, then exit
    Sync(SyncArgs),
    /// Run the scheduler until interrupted
    Daemon,
    /// Print per-table sync state as JSON
    Status,
    /// Re-fetch and upsert a single issue against one binding
    Issue(IssueArgs),
    /// Resolve pending user mappings against the Lark directory
    ResolveUsers(ResolveUsersArgs),
}

#[derive(Parser, Debug)]
struct SyncArgs {
    /// Restrict the pass to one team
    #[arg(long)]
    team: Option<String>,

    /// Restrict the pass to one table (by its configured name)
    #[arg(long)]
    table: Option<String>,

    /// Scan the sink and overwrite every known row, bypassing the
    /// staleness filter
    #[arg(long)]
    full_update: bool,
}

#[derive(Parser, Debug)]
struct IssueArgs {
    /// Team name from the configuration
    team: String,
    /// Table name from the configuration
    table: String,
    /// Issue key, e.g. TP-3153
    key: String,
}

#[derive(Parser, Debug)]
struct ResolveUsersArgs {
    /// Maximum pending entries to resolve in this run
    #[arg(long, default_value_t = 200)]
    limit: usize,
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .context("Failed to build log filter")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn print_outcomes(outcomes: &[CycleOutcome]) {
    for outcome in outcomes {
        println!(
            "{}/{}: {} matched, {} stale, {} created, {} updated, {} failed{} ({:.1}s)",
            outcome.team,
            outcome.table,
            outcome.matched,
            outcome.stale,
            outcome.created,
            outcome.updated,
            outcome.failed,
            if outcome.cold_start { " [cold start]" } else { "" },
            outcome.duration.as_secs_f64()
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config)?;
    init_logging(&config.global.log_level)?;

    let ctx = Arc::new(SyncContext::from_config(config)?);

    match cli.command {
        Commands::Sync(args) => {
            let outcomes = run_once(
                &ctx,
                args.team.as_deref(),
                args.table.as_deref(),
                args.full_update,
            )
            .await?;
            print_outcomes(&outcomes);
        }
        Commands::Daemon => {
            run_daemon(ctx, cli.config).await?;
        }
        Commands::Status => {
            let report = build_status(&ctx)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Issue(args) => {
            let outcome = run_single_issue(&ctx, &args.team, &args.table, &args.key).await?;
            print_outcomes(&[outcome]);
        }
        Commands::ResolveUsers(args) => {
            let mapper = ctx
                .user_mapper
                .as_ref()
                .context("user mapping is disabled in the configuration")?;
            let stats = mapper.resolve_pending(&ctx.lark, args.limit).await?;
            info!(
                "resolution finished: {} attempted, {} resolved, {} empty, {} left pending",
                stats.attempted, stats.resolved, stats.empty, stats.skipped
            );
            println!(
                "{} attempted, {} resolved, {} empty, {} left pending",
                stats.attempted, stats.resolved, stats.empty, stats.skipped
            );
        }
    }

    Ok(())
}
