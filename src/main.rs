mod cli;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use std::sync::Arc;

use ingestforge::config::load_config_or_default;
use ingestforge::scheduler::{Collaborators, TaskScheduler};
use ingestforge::services::{
    AutoConflictResolver, InstantImportExecutor, NullLibraryNotifier, NullMetadataCodec,
    OfflineEncoderService,
};
use ingestforge::task::{factory, CopyEntry, CopySetting, CopyUnit, ImportItem};
use ingestforge::{BatchId, IngestEvent};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Respect RUST_LOG if set, otherwise pick defaults from the verbose flag
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "ingestforge=trace,ingestforge_core=debug".to_string()
        } else {
            "ingestforge=info,ingestforge_core=info".to_string()
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .init();

    match cli.command {
        Commands::Ingest {
            source,
            dest,
            verify,
            exist,
            import,
        } => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(run_ingest(
                &source,
                &dest,
                verify.into(),
                exist.into(),
                import,
                cli.config.as_deref(),
            ))
        }
        Commands::Validate {
            config: config_path,
        } => {
            let path = config_path.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("ingestforge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

async fn run_ingest(
    source: &Path,
    dest: &Path,
    verify: ingestforge::task::VerifyOption,
    exist: ingestforge::task::ExistOption,
    import: bool,
    config_path: Option<&Path>,
) -> Result<()> {
    if !source.exists() {
        anyhow::bail!("Source does not exist: {:?}", source);
    }
    let config = load_config_or_default(config_path)?;

    let handle = TaskScheduler::spawn(
        config,
        Collaborators {
            encoder: Arc::new(OfflineEncoderService),
            importer: Arc::new(InstantImportExecutor::default()),
            notifier: Arc::new(NullLibraryNotifier),
            resolver: Arc::new(AutoConflictResolver::default()),
            metadata_codec: Arc::new(NullMetadataCodec),
        },
    );

    let copy_units = collect_units(source, dest, exist, import);
    if copy_units.is_empty() {
        anyhow::bail!("Nothing to ingest under {:?}", source);
    }
    let file_count: usize = copy_units.iter().map(|u| u.entries.len()).sum();
    tracing::info!("Ingesting {} files to {:?}", file_count, dest);

    let task = factory::create_copy_task(
        CopySetting {
            copy_units,
            verify,
            need_create_import_task: import,
        },
        BatchId::new(),
        HashMap::new(),
    );

    let mut events = handle.events().subscribe();
    handle.submit_batch(vec![task], dest).await;

    let mut last_percent = 0u32;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => match event.payload {
                    IngestEvent::TaskProgress { progress, .. } => {
                        let percent = (progress * 100.0) as u32;
                        if percent != last_percent {
                            last_percent = percent;
                            println!("{percent}%");
                        }
                    }
                    IngestEvent::TaskStatus {
                        state: ingestforge::TaskState::Failure,
                        message,
                        category,
                        ..
                    } => {
                        eprintln!(
                            "{category} task failed{}",
                            message.map(|m| format!(": {m}")).unwrap_or_default()
                        );
                    }
                    IngestEvent::RunFinished { summary } => {
                        println!("{summary}");
                        handle.shutdown(false).await;
                        if summary.has_failures() {
                            anyhow::bail!("Run finished with failures");
                        }
                        return Ok(());
                    }
                    IngestEvent::RunCanceled => {
                        handle.shutdown(false).await;
                        anyhow::bail!("Run canceled");
                    }
                    _ => {}
                },
                Err(err) => {
                    tracing::warn!("Event stream closed: {}", err);
                    handle.shutdown(true).await;
                    return Ok(());
                }
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Canceling...");
                handle.cancel().await;
            }
        }
    }
}

/// One copy unit per source file, mirroring the source tree under `dest`.
fn collect_units(
    source: &Path,
    dest: &Path,
    exist: ingestforge::task::ExistOption,
    import: bool,
) -> Vec<CopyUnit> {
    let mut units = Vec::new();
    let files: Vec<PathBuf> = if source.is_file() {
        vec![source.to_path_buf()]
    } else {
        walkdir::WalkDir::new(source)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect()
    };

    for file in files {
        let target = match file.strip_prefix(source) {
            Ok(rel) if !rel.as_os_str().is_empty() => dest.join(rel),
            _ => dest.join(file.file_name().unwrap_or_default()),
        };
        let mut unit = CopyUnit::default();
        unit.entries
            .push(CopyEntry::new(&file, &target).with_exist_option(exist));
        if import {
            let name = target
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            unit.import_files.insert(
                target.clone(),
                ImportItem {
                    name,
                    clip_id: None,
                },
            );
        }
        units.push(unit);
    }
    units
}

fn validate_config(path: Option<&Path>) -> Result<()> {
    let config = load_config_or_default(path)?;
    println!("Configuration is valid");
    println!(
        "  copy tiers: small <= {} bytes, huge > {} bytes",
        config.copy.small_file_threshold, config.copy.huge_file_threshold
    );
    Ok(())
}
