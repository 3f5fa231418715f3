/// # course-sync CLI Interface (Module)
///
/// Command parsing and orchestration for the `course-sync` binary. All
/// reconciliation logic lives in [`course-sync-core`]; this module only builds
/// the concrete collaborators from configuration and hands them to the engine.
///
/// ## How To Use
/// - For command-line users: use the installed `course-sync` binary with `--help`.
/// - For programmatic/integration use: call [`run`] with a constructed [`Cli`].
///
/// [`course-sync-core`]: ../../course-sync-core/
/// [`Cli`]: struct.Cli.html
/// [`run`]: fn.run.html
use crate::azure_repos::AzureRepos;
use crate::blob_storage::AzureBlobStorage;
use crate::load_config::{load_config, load_static_config};
use crate::sqlite_store::SqliteStore;
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use course_sync_core::changeset::ChangeSetSummary;
use course_sync_core::contract::CheckpointStore;
use course_sync_core::synchronise::{plan, synchronise, Collaborators};
use std::path::PathBuf;

/// CLI for course-sync: reconcile course destinations with the content repository.
#[derive(Parser)]
#[clap(
    name = "course-sync",
    version,
    about = "Synchronise course content from Azure Repos into SQLite and blob storage"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Apply every change since the stored checkpoint using the given config file
    Sync {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
        /// Fetch and validate only; print what would be applied
        #[clap(long)]
        dry_run: bool,
    },
    /// Print the stored checkpoint revision
    Status {
        /// Path to the YAML config file
        #[clap(long)]
        config: PathBuf,
    },
}

fn print_summary(summary: &ChangeSetSummary) {
    for (kind, counts) in [
        ("courses", summary.courses),
        ("modules", summary.modules),
        ("sections", summary.sections),
        ("attachments", summary.attachments),
    ] {
        println!(
            "  {kind}: {} upserted, {} deleted",
            counts.upserts, counts.deletes
        );
    }
}

fn open_store(path: &std::path::Path) -> Result<SqliteStore> {
    SqliteStore::open(path).map_err(|e| {
        tracing::error!(error = %e, path = %path.display(), "Failed to open SQLite store");
        anyhow!("failed to open database {}: {e}", path.display())
    })
}

/// Extracted async CLI logic entrypoint for integration tests and main()
pub async fn run(cli: Cli) -> Result<()> {
    tracing::info!("trace_initialised");

    match cli.command {
        Commands::Sync { config, dry_run } => {
            let config = load_config(config)?;
            tracing::info!(command = "sync", dry_run, "Starting synchronisation process");

            let store = open_store(&config.storage.database_path)?;
            let source = AzureRepos::new(&config.source, config.secrets.azure_devops_pat.clone());
            let blobs = AzureBlobStorage::new(
                &config.storage.blob_endpoint,
                &config.storage.container,
                config.secrets.blob_sas_token.clone(),
            );
            let deps = Collaborators {
                source: &source,
                relational: &store,
                documents: &store,
                blobs: &blobs,
                checkpoints: &store,
            };

            if dry_run {
                let planned = plan(&config.sync, deps).await.map_err(|e| {
                    tracing::error!(command = "sync", error = %e, "Dry run failed");
                    anyhow::Error::new(e)
                })?;
                println!(
                    "Dry run ({:?}): {} -> {}",
                    planned.mode,
                    planned.previous_revision.as_deref().unwrap_or("<none>"),
                    planned.change_set.revision
                );
                print_summary(&planned.change_set.summary());
                return Ok(());
            }

            match synchronise(&config.sync, deps).await {
                Ok(report) => {
                    tracing::info!(command = "sync", ?report, "Synchronisation complete");
                    println!(
                        "Synchronised ({:?}): {} -> {}",
                        report.mode,
                        report.previous_revision.as_deref().unwrap_or("<none>"),
                        report.revision
                    );
                    print_summary(&report.applied);
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(command = "sync", error = %e, "Synchronisation failed");
                    Err(anyhow::Error::new(e))
                }
            }
        }
        Commands::Status { config } => {
            let (_, storage, _) = load_static_config(config)?;
            let store = open_store(&storage.database_path)?;
            let checkpoint = store
                .read_checkpoint()
                .await
                .map_err(|e| anyhow!("failed to read checkpoint: {e}"))?;
            tracing::info!(command = "status", ?checkpoint, "Read checkpoint");
            match checkpoint {
                Some(revision) => println!("checkpoint: {revision}"),
                None => println!("checkpoint: none (next sync performs a full import)"),
            }
            Ok(())
        }
    }
}
