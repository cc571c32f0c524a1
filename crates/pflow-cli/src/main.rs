use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pflow_adapters::WorkbookLoader;
use pflow_core::CrmState;
use pflow_pipeline::{
    commit_edits, dispatch_targets, loader_from_config, outreach_draft,
    remote_loader_from_config, run_dispatch, store_from_config, webhook_sender_from_config,
    CycleOutcome, DispatchLog, DispatchOutcome, MergedClient, Pipeline, PipelineConfig,
    SessionContext, SuggestionRules,
};
use pflow_store::ImportArchive;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pflow")]
#[command(about = "Prospect Flow client reconciliation CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Archive a workbook export and run a reconciliation cycle from it.
    Import {
        file: PathBuf,
        /// Archive label; defaults to the file stem.
        #[arg(long)]
        label: Option<String>,
    },
    /// Run a reconciliation cycle from the remote collection source.
    Pull,
    /// Run a cycle from whichever source is configured.
    Report,
    /// Look up one client by name, fuzzily, and print its working row.
    Focus { query: String },
    /// Apply edited state rows from a JSON file.
    Save { edits: PathBuf },
    /// Send outreach to every pending client with an email address.
    Dispatch {
        /// Cap the number of messages this run.
        #[arg(long)]
        limit: Option<usize>,
        /// Print the would-be messages without sending or mutating state.
        #[arg(long)]
        dry_run: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();

    let config = PipelineConfig::from_env();
    let rules = SuggestionRules::from_path(&config.rules_path)?;
    let store = store_from_config(&config)?;
    let pipeline = Pipeline::new(config, store, rules);

    match cli.command {
        Commands::Import { file, label } => {
            let session = SessionContext::begin();
            let bytes = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let label = label.unwrap_or_else(|| {
                file.file_stem()
                    .and_then(|stem| stem.to_str())
                    .unwrap_or("import")
                    .to_string()
            });
            let extension = file
                .extension()
                .and_then(|ext| ext.to_str())
                .unwrap_or("xlsx");

            let archive = ImportArchive::new(pipeline.config().archive_root());
            let archived = archive
                .store_bytes(session.now, &label, extension, &bytes)
                .await?;
            if archived.deduplicated {
                println!(
                    "archive: identical upload already stored at {}",
                    archived.absolute_path.display()
                );
            } else {
                println!("archive: stored at {}", archived.absolute_path.display());
            }

            let loader = WorkbookLoader::new(&file);
            let outcome = pipeline.run_cycle(&loader, &session).await?;
            print_cycle(&outcome);
        }
        Commands::Pull => {
            let session = SessionContext::begin();
            let loader = remote_loader_from_config(pipeline.config())?;
            let outcome = pipeline.run_cycle(&loader, &session).await?;
            print_cycle(&outcome);
        }
        Commands::Report => {
            let session = SessionContext::begin();
            let loader = loader_from_config(pipeline.config())?;
            let outcome = pipeline.run_cycle(loader.as_ref(), &session).await?;
            print_cycle(&outcome);
        }
        Commands::Focus { query } => {
            let session = SessionContext::begin().with_focus(query.clone());
            let loader = loader_from_config(pipeline.config())?;
            let view = pipeline.merged_view(loader.as_ref(), &session).await?;
            match session.focus(&view.rows) {
                Some(row) => print_focus(row),
                None => println!("no client matches '{query}'"),
            }
        }
        Commands::Save { edits } => {
            let session = SessionContext::begin();
            let text = std::fs::read_to_string(&edits)
                .with_context(|| format!("reading {}", edits.display()))?;
            let rows: Vec<CrmState> = serde_json::from_str(&text)
                .with_context(|| format!("parsing {}", edits.display()))?;

            let report = commit_edits(pipeline.store(), &session, rows).await?;
            println!("saved {} row(s)", report.saved.len());
            for failure in &report.failures {
                eprintln!("failed {}: {}", failure.client_id, failure.reason);
            }
            if !report.complete() {
                anyhow::bail!("{} row(s) failed to save", report.failures.len());
            }
        }
        Commands::Dispatch { limit, dry_run } => {
            let session = SessionContext::begin();
            let loader = loader_from_config(pipeline.config())?;
            let view = pipeline.merged_view(loader.as_ref(), &session).await?;
            let mut targets = dispatch_targets(&view.rows, pipeline.config().default_status);
            if let Some(limit) = limit {
                targets.truncate(limit);
            }
            if targets.is_empty() {
                println!("no pending clients with an email address");
                return Ok(());
            }

            if dry_run {
                for row in &targets {
                    let draft = outreach_draft(row);
                    println!(
                        "{} <{}>: {}",
                        row.record.client_id, row.record.email, draft.subject
                    );
                }
                println!("{} message(s) would be sent", targets.len());
                return Ok(());
            }

            let sender = webhook_sender_from_config(pipeline.config())?;
            let log = DispatchLog::new(pipeline.config().dispatch_log_path());
            let pause = (
                pipeline.config().dispatch_pause_min_ms,
                pipeline.config().dispatch_pause_max_ms,
            );
            let summary = run_dispatch(&targets, &sender, &log, pipeline.store(), pause).await;
            println!(
                "dispatch complete: run_id={} sent={} skipped={} failed={} log_only={}",
                summary.run_id, summary.sent, summary.skipped, summary.failed, summary.log_only
            );
            for record in &summary.records {
                match &record.outcome {
                    DispatchOutcome::Sent => {}
                    DispatchOutcome::Skipped { reason } => {
                        eprintln!("skipped {}: {reason}", record.client_id)
                    }
                    DispatchOutcome::SendFailed { reason } => {
                        eprintln!("send failed {}: {reason}", record.client_id)
                    }
                    DispatchOutcome::LogFailed { reason } => {
                        eprintln!("log append failed {}: {reason}", record.client_id)
                    }
                    DispatchOutcome::LogOnly { reason } => {
                        eprintln!(
                            "sent but status not persisted {}: {reason}",
                            record.client_id
                        )
                    }
                }
            }
        }
    }

    Ok(())
}

fn print_cycle(outcome: &CycleOutcome) {
    println!(
        "cycle complete: run_id={} clients={} new={} pending={} reports={}",
        outcome.run_id,
        outcome.summary.total,
        outcome.summary.new_clients.len(),
        outcome.summary.pending_contact,
        outcome.reports_dir.display()
    );
    if let Some(error) = &outcome.view.load_error {
        eprintln!("warning: source load failed, cycle ran on an empty table: {error}");
    }
}

fn print_focus(row: &MergedClient) {
    println!("{} (id {})", row.record.display_name, row.record.client_id);
    println!("  category: {}", row.effective_category);
    println!("  status:   {}", row.state.sales_status);
    println!("  sector:   {}", row.record.sector);
    println!("  days since activity: {}", row.recency_display);
    if !row.record.phone.is_empty() {
        println!("  phone: {}", row.record.phone);
    }
    if !row.record.email.is_empty() {
        println!("  email: {}", row.record.email);
    }
    if !row.state.notes.is_empty() {
        println!("  notes: {}", row.state.notes);
    }
    if !row.suggestions.is_empty() {
        println!("  suggestions: {}", row.suggestions.join(", "));
    }
    let draft = outreach_draft(row);
    println!("  outreach: {}", draft.body);
}
