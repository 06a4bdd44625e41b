use anyhow::Context;
use fincon::cli::{Cli, Command, ImportArgs, USAGE};
use fincon::config::Settings;
use fincon::pipeline::{ImportReport, ImportRequest, Pipeline};
use fincon::watch::{pending_files, run_intake, spawn_intake_watcher, IntakeOptions};
use fincon_storage::WriteMode;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::parse(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(e) => {
            eprintln!("{e}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    let config_path = Settings::locate(cli.config.clone());
    let settings = Settings::load(&config_path)
        .with_context(|| format!("loading settings from {}", config_path.display()))?;
    let pipeline = Arc::new(Pipeline::from_settings(&settings).await?);

    match cli.command {
        Command::Formats => list_formats(&pipeline),
        Command::Import(args) => import(&pipeline, args).await,
        Command::Correct { id, category } => {
            let report = pipeline.correct(&id, category).await?;
            match (report.applied, report.learned_rules) {
                (false, _) => println!("{} already in {}", report.id, report.category),
                (true, 0) => println!("{} -> {}", report.id, report.category),
                (true, n) => println!("{} -> {} ({n} rules learned)", report.id, report.category),
            }
            Ok(())
        }
        Command::Watch { mode, ai } => watch(pipeline, &settings, mode, ai).await,
    }
}

fn list_formats(pipeline: &Pipeline) -> anyhow::Result<()> {
    let snapshot = pipeline.registry().snapshot();
    for format in snapshot.formats() {
        let patterns = &format.descriptor.detection.filename_patterns;
        println!("{:<16} {:<28} {}", format.id(), format.name(), patterns.join(", "));
    }
    Ok(())
}

async fn import(pipeline: &Arc<Pipeline>, args: ImportArgs) -> anyhow::Result<()> {
    let bytes = tokio::fs::read(&args.file)
        .await
        .with_context(|| format!("reading {}", args.file.display()))?;
    let filename = args
        .file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();

    let request = ImportRequest {
        bytes,
        filename,
        institution: args.institution,
        mode: args.mode,
        ai_enabled: args.ai,
        dry_run: args.dry_run,
        date_range: args.date_range,
    };

    // Ctrl-C stops the job between rows; chunks already stored stay stored.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let report = pipeline.spawn_import(request, cancel).await??;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &ImportReport) {
    for line in &report.log {
        println!("{line}");
    }
    println!(
        "{}: {} parsed, {} filtered, {} failed, {} added, {} updated, {} skipped",
        report.filename,
        report.rows_parsed,
        report.rows_filtered,
        report.rows_failed,
        report.write.added,
        report.write.updated,
        report.write.skipped
    );
}

async fn watch(pipeline: Arc<Pipeline>, settings: &Settings, mode: WriteMode, ai: bool) -> anyhow::Result<()> {
    let intake_dir = &settings.intake_dir;
    std::fs::create_dir_all(intake_dir)
        .with_context(|| format!("creating intake folder {}", intake_dir.display()))?;

    // ── Format hot reload ─────────────────────────────────────────────────────
    // Both watchers must stay alive for the duration of the command.
    let _formats_watcher = pipeline.registry().watch().context("watching institution formats")?;

    // ── Intake folder ─────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let (tx, rx) = mpsc::channel(64);
    let options = IntakeOptions { mode, ai_enabled: ai, ..Default::default() };
    let intake = tokio::spawn(run_intake(pipeline, rx, options, cancel.clone()));

    for path in pending_files(intake_dir)? {
        tx.send(path).await?;
    }
    let _intake_watcher = spawn_intake_watcher(intake_dir, tx).context("watching intake folder")?;
    tracing::info!("Watching intake folder: {}", intake_dir.display());

    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Stopping intake");
            on_signal.cancel();
        }
    });

    intake.await?;
    Ok(())
}
