//! CLI command implementations

use crate::output::{format_bytes, format_duration, format_size, format_speed, print_json};
use crate::progress::DownloadProgress;
use crate::{config, ConfigAction, OutputFormat};
use anyhow::{anyhow, Result};
use console::style;
use rangefetch_core::{DownloadJob, DownloadManager};
use rangefetch_types::{Configuration, DownloadResult, JobStatus, ProbeInfo};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CAPACITY: usize = 256;

fn manager() -> Result<DownloadManager> {
    let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
    DownloadManager::new(event_tx).map_err(|e| anyhow!("failed to start engine: {}", e))
}

// ============================================================================
// Download
// ============================================================================

pub async fn get(
    url: &str,
    output: Option<PathBuf>,
    config: Configuration,
    format: OutputFormat,
) -> Result<()> {
    let manager = manager()?;
    let destination = resolve_destination(&manager, url, output).await?;
    let name = destination
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| url.to_string());

    let mut events = manager.subscribe();
    let handle = manager
        .submit(DownloadJob::new(url, destination).with_config(config))
        .await
        .map_err(|e| anyhow!("{}", e))?;
    let job_id = handle.id();

    let renderer = (format == OutputFormat::Human).then(|| {
        tokio::spawn(async move {
            let progress = DownloadProgress::new(job_id, &name);
            loop {
                match events.recv().await {
                    Ok(event) => {
                        if progress.handle_event(&event) {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            progress.clear();
        })
    });

    // Ctrl-C keeps the partial file for the next run
    let interrupt = {
        let manager = manager.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                manager.cancel(job_id).await;
            }
        })
    };

    let result = handle.wait().await;
    interrupt.abort();
    if let Some(renderer) = renderer {
        let _ = renderer.await;
    }

    report_result(&result, format)?;
    if result.status == JobStatus::Failed {
        return Err(anyhow!(
            "download failed: {}",
            result.error_message.as_deref().unwrap_or("unknown error")
        ));
    }
    Ok(())
}

/// Output path for `get`: an explicit file, a directory plus the remote
/// filename, or the remote filename in the current directory
async fn resolve_destination(
    manager: &DownloadManager,
    url: &str,
    output: Option<PathBuf>,
) -> Result<PathBuf> {
    let dir = match output {
        Some(path) if !path.is_dir() => return Ok(path),
        Some(dir) => dir,
        None => std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
    };
    let filename = match manager.probe(url).await {
        Ok(info) => info.filename,
        Err(e) => {
            debug!("Probe for a filename failed ({}), using the URL path", e);
            filename_from_url(url)
        }
    };
    Ok(dir.join(filename))
}

fn filename_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "download".to_string())
}

fn report_result(result: &DownloadResult, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(result);
    }

    match result.status {
        JobStatus::Completed => {
            println!(
                "{} Saved {}",
                style("✓").green().bold(),
                style(result.file_path.display()).cyan()
            );
            println!(
                "  {} in {} ({})",
                format_bytes(result.total_size),
                format_duration(result.duration),
                format_speed(result.average_speed)
            );
            if result.transferred_bytes < result.total_size {
                println!(
                    "  {} already on disk",
                    format_bytes(result.total_size - result.transferred_bytes)
                );
            }
        }
        JobStatus::Cancelled => {
            println!(
                "{} Cancelled after {}",
                style("○").dim(),
                format_bytes(result.downloaded_bytes)
            );
            println!("  Run the same command again to resume.");
        }
        _ => {
            eprintln!(
                "{} {}",
                style("✗").red().bold(),
                result.error_message.as_deref().unwrap_or("Download failed")
            );
            if let Some(report) = &result.error {
                for suggestion in &report.suggestions {
                    eprintln!("  {} {}", style("→").dim(), suggestion);
                }
            }
        }
    }
    Ok(())
}

// ============================================================================
// Probe & Plan
// ============================================================================

pub async fn probe_urls(urls: Vec<String>, format: OutputFormat) -> Result<()> {
    let manager = manager()?;
    let mut results = Vec::new();
    let mut failures = 0;

    for url in urls {
        match manager.probe(&url).await {
            Ok(info) => {
                if format == OutputFormat::Human {
                    print_probe(&info);
                }
                results.push(info);
            }
            Err(e) => {
                failures += 1;
                eprintln!("{} {}: {}", style("✗").red().bold(), url, e);
            }
        }
    }

    if format == OutputFormat::Json {
        print_json(&results)?;
    }
    if failures > 0 {
        return Err(anyhow!("{} URL(s) could not be probed", failures));
    }
    Ok(())
}

fn print_probe(info: &ProbeInfo) {
    println!("{}", style(&info.filename).cyan().bold());
    println!("  URL:    {}", info.url);
    if let Some(final_url) = &info.final_url {
        if final_url != &info.url {
            println!("  Final:  {}", final_url);
        }
    }
    println!("  Size:   {}", format_size(info.size));
    println!(
        "  Ranges: {}",
        if info.supports_range {
            style("yes").green()
        } else {
            style("no").yellow()
        }
    );
    if let Some(content_type) = &info.content_type {
        println!("  Type:   {}", content_type);
    }
    if let Some(etag) = &info.etag {
        println!("  ETag:   {}", etag);
    }
    if let Some(modified) = &info.last_modified {
        println!("  Modified: {}", modified);
    }
    println!();
}

#[derive(Serialize, tabled::Tabled)]
struct ChunkRow {
    id: u32,
    start: u64,
    end: String,
    size: String,
}

pub async fn plan(url: &str, config: Configuration, format: OutputFormat) -> Result<()> {
    let manager = manager()?;
    let (info, chunks) = manager
        .plan(url, &config)
        .await
        .map_err(|e| anyhow!("{}", e))?;

    let rows: Vec<ChunkRow> = chunks
        .iter()
        .map(|chunk| ChunkRow {
            id: chunk.id,
            start: chunk.start,
            end: if chunk.is_open_ended() {
                "end of stream".to_string()
            } else {
                chunk.end.to_string()
            },
            size: if chunk.is_open_ended() {
                "?".to_string()
            } else {
                format_bytes(chunk.size())
            },
        })
        .collect();

    match format {
        OutputFormat::Json => {
            #[derive(Serialize)]
            struct Plan<'a> {
                probe: &'a ProbeInfo,
                chunks: &'a [ChunkRow],
            }
            print_json(&Plan {
                probe: &info,
                chunks: &rows,
            })?;
        }
        OutputFormat::Human => {
            println!(
                "{} ({}, ranges {})",
                style(&info.filename).cyan().bold(),
                format_size(info.size),
                if info.supports_range { "yes" } else { "no" }
            );
            if rows.is_empty() {
                println!("{}", style("Nothing to download").dim());
            } else {
                println!("{}", tabled::Table::new(&rows));
            }
        }
    }
    Ok(())
}

// ============================================================================
// Config
// ============================================================================

pub fn config_action(
    action: ConfigAction,
    path: Option<&Path>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = config::read_file(path)?;
            match format {
                OutputFormat::Json => print_json(&config)?,
                OutputFormat::Human => {
                    println!("{}", style("Configuration").bold());
                    println!("  Threads:      {}", config.thread_count);
                    println!("  Chunk size:   {}", format_bytes(config.chunk_size));
                    println!("  Buffer size:  {}", format_bytes(config.buffer_size as u64));
                    println!("  Max retries:  {}", config.max_retries);
                    println!("  Timeout:      {} ms", config.timeout_ms);
                    println!(
                        "  Speed limit:  {}",
                        if config.speed_limit == 0 {
                            "unlimited".to_string()
                        } else {
                            format_speed(config.speed_limit)
                        }
                    );
                    println!("  Resume:       {}", config.enable_resume_support);
                    println!("  Preallocate:  {}", config.pre_allocate_file);
                    println!("  Adaptive:     {}", config.adaptive);
                    println!("  Monitor:      {} ms", config.monitor_interval_ms);
                }
            }
        }
        ConfigAction::Path => {
            let path = path.ok_or_else(|| anyhow!("no config directory on this platform"))?;
            println!("{}", path.display());
        }
        ConfigAction::Init { force } => {
            let path = path.ok_or_else(|| anyhow!("no config directory on this platform"))?;
            config::write_defaults(path, force)?;
            if format == OutputFormat::Human {
                println!(
                    "{} Wrote {}",
                    style("✓").green().bold(),
                    style(path.display()).cyan()
                );
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filename_from_url() {
        assert_eq!(filename_from_url("https://mirror.test/a/b/file.iso"), "file.iso");
        assert_eq!(filename_from_url("https://mirror.test/"), "download");
        assert_eq!(filename_from_url("garbage"), "download");
    }

    #[tokio::test]
    async fn test_explicit_file_destination_skips_probe() {
        let manager = manager().unwrap();
        let dir = tempfile::TempDir::new().unwrap();
        let target = dir.path().join("out.bin");
        // An unreachable URL: resolving must not need the network
        let resolved = resolve_destination(&manager, "http://127.0.0.1:9/x", Some(target.clone()))
            .await
            .unwrap();
        assert_eq!(resolved, target);
    }
}
