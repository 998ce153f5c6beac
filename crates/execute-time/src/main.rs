//! execute-time CLI entry point.
//!
//! Formatting helpers, the settings schema, and a headless host that loads an
//! `.ipynb` file, runs the tracker over it and prints the annotation every
//! code cell would show.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use clap::{Parser, Subcommand};
use log::{info, warn};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};

use execute_time::annotation::PREV_EXECUTION_TIME_ATTR;
use execute_time::formatters::{self, DEFAULT_DATE_FORMAT};
use execute_time::metadata::parse_timestamp;
use execute_time::settings::LogWarnings;
use execute_time::settings_source::{self, load_raw_settings, settings_path};
use execute_time::{ExecuteTimeTracker, Notebook, NotebookOptions, PLUGIN_NAME};

#[derive(Parser, Debug)]
#[command(name = "execute-time")]
#[command(about = "Execution timing annotations for Jupyter notebooks")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Format the time between two ISO-8601 timestamps
    FormatDuration { start: String, end: String },

    /// Format an ISO-8601 timestamp with a date pattern
    FormatTime {
        timestamp: String,

        /// date-fns style pattern
        #[arg(long, default_value = DEFAULT_DATE_FORMAT)]
        format: String,

        /// Render in UTC instead of local time
        #[arg(long)]
        utc: bool,
    },

    /// Check whether a pattern can be used as `dateFormat`
    ValidateFormat {
        pattern: String,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Print the settings JSON Schema
    Schema,

    /// Print the annotation of every code cell in a notebook
    Render {
        notebook: PathBuf,

        /// Settings file (default: <config dir>/execute-time/settings.json)
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Render even if the settings leave the feature disabled
        #[arg(long)]
        enable: bool,

        /// Attach cells to the viewport one by one, as a windowed notebook does
        #[arg(long)]
        windowed: bool,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Re-render a notebook every time the settings file changes
    Watch {
        notebook: PathBuf,

        /// Settings file (default: <config dir>/execute-time/settings.json)
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    match cli.command {
        Commands::FormatDuration { start, end } => {
            let start = parse_arg(&start)?;
            let end = parse_arg(&end)?;
            println!("{}", formatters::format_duration(end, start));
        }
        Commands::FormatTime {
            timestamp,
            format,
            utc,
        } => {
            let t = parse_arg(&timestamp)?;
            let text = if utc {
                formatters::format_timestamp(&t, &format)
            } else {
                formatters::format_timestamp(&t.with_timezone(&Local), &format)
            }
            .context("Invalid date format")?;
            println!("{text}");
        }
        Commands::ValidateFormat { pattern, json } => {
            let validation = formatters::validate_pattern(&pattern);
            if json {
                println!("{}", serde_json::to_string_pretty(&validation)?);
            } else if validation.valid {
                println!("valid");
            } else {
                println!(
                    "invalid: {}",
                    validation.message.as_deref().unwrap_or("unknown error")
                );
            }
            if !validation.valid {
                std::process::exit(1);
            }
        }
        Commands::Schema => {
            println!(
                "{}",
                serde_json::to_string_pretty(&settings_source::settings_schema())?
            );
        }
        Commands::Render {
            notebook,
            settings,
            enable,
            windowed,
            json,
        } => {
            let settings = settings.unwrap_or_else(settings_path);
            render(&notebook, &settings, enable, windowed, json).await?;
        }
        Commands::Watch {
            notebook,
            settings,
            json,
        } => {
            let settings = settings.unwrap_or_else(settings_path);
            watch_notebook(&notebook, settings, json).await?;
        }
    }

    Ok(())
}

fn parse_arg(s: &str) -> Result<DateTime<Utc>> {
    parse_timestamp(s).with_context(|| format!("'{s}' is not an ISO-8601 timestamp"))
}

fn load_notebook(path: &Path, options: NotebookOptions) -> Result<Arc<Notebook>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read notebook {}", path.display()))?;
    let doc: Value = serde_json::from_str(&contents)
        .with_context(|| format!("Notebook {} is not valid JSON", path.display()))?;
    Ok(Arc::new(Notebook::from_ipynb(&doc, options)?))
}

async fn render(
    path: &Path,
    settings_file: &Path,
    enable: bool,
    windowed: bool,
    json: bool,
) -> Result<()> {
    let mut raw = load_raw_settings(settings_file)?;
    if enable {
        if let Some(fields) = raw.as_object_mut() {
            fields.insert("enabled".into(), Value::Bool(true));
        }
    }

    let notebook = load_notebook(path, NotebookOptions { windowed })?;
    let tracker = ExecuteTimeTracker::new(&notebook, Arc::new(LogWarnings));
    if !tracker.apply_settings(&raw).enabled {
        warn!("[execute-time] {PLUGIN_NAME} is disabled in settings; pass --enable to render anyway");
        return Ok(());
    }

    if windowed {
        // Let the renders reach the viewport gate before scrolling.
        tokio::task::yield_now().await;
        for view in notebook.views() {
            view.mark_ready();
            view.set_in_viewport(true);
        }
    }
    tracker.settle().await;

    print_annotations(&notebook, json)?;
    notebook.dispose();
    Ok(())
}

async fn watch_notebook(path: &Path, settings_file: PathBuf, json: bool) -> Result<()> {
    let notebook = load_notebook(path, NotebookOptions::default())?;
    let tracker = ExecuteTimeTracker::new(&notebook, Arc::new(LogWarnings));

    match load_raw_settings(&settings_file) {
        Ok(raw) => {
            tracker.apply_settings(&raw);
        }
        Err(e) => warn!("[execute-time] {e:#}"),
    }
    tracker.settle().await;
    print_annotations(&notebook, json)?;

    let (tx, mut rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = tokio::spawn(settings_source::watch_settings(
        settings_file.clone(),
        tx,
        shutdown_rx,
    ));
    info!(
        "[execute-time] Watching {} for settings changes (Ctrl-C to stop)",
        settings_file.display()
    );

    loop {
        tokio::select! {
            Some(raw) = rx.recv() => {
                tracker.apply_settings(&raw);
                tracker.settle().await;
                print_annotations(&notebook, json)?;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("[execute-time] Interrupted");
                break;
            }
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = watcher.await;
    notebook.dispose();
    Ok(())
}

fn print_annotations(notebook: &Notebook, json: bool) -> Result<()> {
    let annotated: Vec<_> = notebook
        .views()
        .into_iter()
        .filter_map(|view| view.annotation().map(|node| (view.id().to_string(), node)))
        .collect();

    if json {
        let cells: Vec<Value> = annotated
            .iter()
            .map(|(id, node)| {
                json!({
                    "id": id,
                    "text": node.text(),
                    "liveText": node.live_text(),
                    "class": node.class_name(),
                    "hidden": node.is_hidden(),
                    "parent": node.parent().map(|p| p.as_str()),
                    PREV_EXECUTION_TIME_ATTR: node.prev_execution_time(),
                    "title": node.tooltip(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&cells)?);
        return Ok(());
    }

    if annotated.is_empty() {
        println!("No cells with execution timing");
    }
    for (id, node) in &annotated {
        let status = if node.is_hidden() {
            "(hidden)"
        } else if node.text().is_empty() {
            "(no timing)"
        } else {
            node.text()
        };
        match node.live_text() {
            "" => println!("[{id}] {status}"),
            live => println!("[{id}] {status}  {live}"),
        }
        if let Some(tooltip) = node.tooltip() {
            for line in tooltip.lines() {
                println!("    {line}");
            }
        }
    }
    Ok(())
}
