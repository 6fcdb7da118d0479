use anyhow::{Context, Result};
use armory_core::{ArmigerRecord, IdentityId, RecordId};
use armory_storage::{ArmigerStore, SqliteStore};
use armory_sync::{SyncConfig, SyncOutcome};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "armory-cli")]
#[command(about = "Armiger registry sync and lookup")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync against the published registry book.
    Sync,
    /// Sync now and then on the configured schedule until interrupted.
    Daemon,
    Migrate,
    /// Look up stored registry records.
    Records {
        /// Record number, `name#discriminator`, or part of a name.
        query: Option<String>,
        /// Record linked to this identity id.
        #[arg(long, conflicts_with = "query")]
        identity: Option<i64>,
        /// Only records without a linked identity.
        #[arg(long, conflicts_with_all = ["query", "identity"])]
        unlinked: bool,
    },
}

#[derive(Debug, PartialEq, Eq)]
enum RecordQuery<'a> {
    Id(RecordId),
    Qualified { name: &'a str, discriminator: &'a str },
    Partial(&'a str),
}

/// Numbers are record ids, `name#1234` is exact, anything else is a name fragment.
fn parse_record_query(raw: &str) -> RecordQuery<'_> {
    let raw = raw.trim();
    if let Ok(id) = raw.parse::<RecordId>() {
        return RecordQuery::Id(id);
    }
    match raw.rsplit_once('#') {
        Some((name, discriminator))
            if !name.is_empty()
                && !discriminator.is_empty()
                && discriminator.chars().all(|c| c.is_ascii_digit()) =>
        {
            RecordQuery::Qualified {
                name,
                discriminator,
            }
        }
        _ => RecordQuery::Partial(raw),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let report = armory_sync::run_sync_once_from_env().await?;
            match report.outcome {
                SyncOutcome::Skipped { remote_modified } => println!(
                    "sync skipped: run_id={} remote_modified={} last_synced={}",
                    report.run_id, remote_modified, report.state.last_synced_timestamp
                ),
                SyncOutcome::Completed {
                    remote_modified,
                    summary,
                } => println!(
                    "sync complete: run_id={} remote_modified={} deleted={} inserted={} updated={} linked={} unresolved={}",
                    report.run_id,
                    remote_modified,
                    summary.deleted,
                    summary.inserted,
                    summary.updated,
                    summary.linked,
                    summary.unresolved
                ),
            }
        }
        Commands::Daemon => armory_sync::run_daemon_from_env().await?,
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            armory_sync::open_store(&config).await?;
            println!("migrations applied: {}", config.database_url);
        }
        Commands::Records {
            query,
            identity,
            unlinked,
        } => {
            let config = SyncConfig::from_env();
            let store = armory_sync::open_store(&config).await?;
            let records = lookup_records(&store, query.as_deref(), identity, unlinked).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&records).context("serializing records")?
            );
        }
    }

    Ok(())
}

async fn lookup_records(
    store: &SqliteStore,
    query: Option<&str>,
    identity: Option<i64>,
    unlinked: bool,
) -> Result<Vec<ArmigerRecord>> {
    if unlinked {
        return Ok(store.unlinked().await?);
    }
    if let Some(identity) = identity {
        return Ok(store
            .find_by_identity(IdentityId(identity))
            .await?
            .into_iter()
            .collect());
    }
    let Some(query) = query else {
        return Ok(store.list().await?);
    };
    let records = match parse_record_query(query) {
        RecordQuery::Id(id) => store.get(id).await?.into_iter().collect(),
        RecordQuery::Qualified {
            name,
            discriminator,
        } => store.search_by_name(name, Some(discriminator)).await?,
        RecordQuery::Partial(fragment) => store.search_by_name(fragment, None).await?,
    };
    Ok(records)
}
