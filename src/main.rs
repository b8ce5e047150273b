use std::{path::Path, sync::Arc, time::Duration};

use clap::Parser;
use fileguessr::{
    FileGuessr,
    error::{self, Error},
    job::JobStatus,
    search::{Attachment, SearchResponse},
    server,
};
use kdam::{Bar, BarExt, tqdm};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, FolderAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("FILEGUESSR_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

#[tokio::main]
async fn main() -> error::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let config = cli.settings.into_config();
    let watch = matches!(cli.command, Command::Serve(_));
    let service = Arc::new(FileGuessr::open(config, watch).await?);

    match cli.command {
        Command::Serve(args) => server::serve(service, args.addr).await?,
        Command::Index(args) => cmd_index(&service, &args.folder).await?,
        Command::Search(args) => {
            let response = match &args.file {
                Some(file) => {
                    let attachment = read_attachment(file).await?;
                    service
                        .search_multimodal(&args.query, attachment, args.count)
                        .await?
                }
                None => service.search(&args.query, args.count).await?,
            };
            if args.json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_results(&response);
            }
        }
        Command::Folders { action } => match action {
            FolderAction::List { json } => {
                let folders = service.list_folders()?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&folders)?);
                } else if folders.is_empty() {
                    println!("No watched folders.");
                } else {
                    for folder in folders {
                        match folder.last_scanned_time {
                            Some(t) => println!("{}  (scanned {t})", folder.path.display()),
                            None => println!("{}  (never scanned)", folder.path.display()),
                        }
                    }
                }
            }
            FolderAction::Remove { folder } => {
                let removal = service.remove_folder(&folder).await?;
                println!(
                    "Removed {} ({} records)",
                    removal.folder.display(),
                    removal.removed_records
                );
            }
        },
        Command::Clear => {
            service.clear().await?;
            println!("Index cleared.");
        }
        Command::Status(args) => cmd_status(&service, args.json).await?,
        Command::Completions(_) => {}
    }

    Ok(())
}

/// Index `folder` in the foreground with a progress bar.
async fn cmd_index(service: &FileGuessr, folder: &Path) -> error::Result<()> {
    let run = service.index_folder(folder);
    tokio::pin!(run);
    let mut ticker = tokio::time::interval(Duration::from_millis(200));
    let mut progress = None;

    let status = loop {
        tokio::select! {
            status = &mut run => break status,
            _ = ticker.tick() => {
                let snapshot = service.index_status();
                if snapshot.status == JobStatus::Processing {
                    let bar = progress.get_or_insert_with(|| {
                        tqdm!(total = snapshot.total_files, desc = "Indexing")
                    });
                    advance(bar, snapshot.processed_files);
                }
            }
        }
    };
    if progress.is_some() {
        eprintln!();
    }
    let status = status?;

    let snapshot = service.index_status();
    for error in &snapshot.errors {
        eprintln!("  {}: {}", error.path, error.message);
    }
    println!(
        "{:?}: {}/{} files in {:.1}s, {} errors",
        status,
        snapshot.processed_files,
        snapshot.total_files,
        snapshot.elapsed_seconds,
        snapshot.errors.len()
    );
    if status == JobStatus::Failed {
        return Err(Error::FolderUnreadable {
            path: folder.to_path_buf(),
            reason: snapshot
                .errors
                .last()
                .map(|e| e.message.clone())
                .unwrap_or_default(),
        });
    }
    Ok(())
}

/// Move the bar to `processed`. Drawing failures only cost the bar.
fn advance(bar: &mut Bar, processed: usize) {
    if let Err(e) = bar.update_to(processed) {
        tracing::debug!(error = %e, "cannot draw progress bar");
    }
}

async fn read_attachment(path: &Path) -> error::Result<Attachment> {
    let bytes = tokio::fs::read(path).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());
    Ok(Attachment { file_name, bytes })
}

fn print_results(response: &SearchResponse) {
    if response.expanded_query != response.original_query {
        println!("Searching for: {}", response.expanded_query);
    }
    if response.results.is_empty() {
        println!("No results.");
        return;
    }
    for (rank, hit) in response.results.iter().enumerate() {
        println!(
            "{:>3}. {:.3}  {}",
            rank + 1,
            hit.score,
            hit.record.path
        );
        if !hit.record.summary.is_empty() {
            println!("       {}", hit.record.summary);
        }
    }
}

async fn cmd_status(service: &FileGuessr, json: bool) -> error::Result<()> {
    let health = service.health().await;
    let stats = service.stats().await?;
    let folders = service.list_folders()?;

    if json {
        let status = serde_json::json!({
            "health": health,
            "stats": stats,
            "folders": folders,
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    let degraded = if stats.degraded { " (degraded)" } else { "" };
    println!("Backend:  {}{degraded}", stats.search_engine);
    println!(
        "Model:    {} ({})",
        health.model.required_model,
        match (health.model.llm_running, health.model.model_available) {
            (false, _) => "server unreachable",
            (true, false) => "not installed",
            (true, true) => "ready",
        }
    );
    println!("Folders:  {}", folders.len());
    println!("Files:    {}", stats.total_files);
    for (ext, count) in &stats.by_type {
        println!("  {ext:<8} {count}");
    }
    Ok(())
}
