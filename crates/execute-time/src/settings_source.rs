//! Where raw settings come from: a JSON file in the user's config directory,
//! watched for external edits.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{error, info, warn};
use notify_debouncer_mini::DebounceEventResult;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::settings::ExecuteTimeSettings;

/// Debounce window for settings file events.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(500);

/// Get the path to the settings JSON file.
pub fn settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("execute-time")
        .join("settings.json")
}

/// JSON Schema describing the settings file.
pub fn settings_schema() -> Value {
    serde_json::to_value(schemars::schema_for!(ExecuteTimeSettings)).unwrap_or(Value::Null)
}

/// Read the raw settings object. A missing file yields an empty object, so
/// every field takes its default.
pub fn load_raw_settings(path: &Path) -> Result<Value> {
    if !path.exists() {
        info!("[settings] No settings file at {:?}, using defaults", path);
        return Ok(Value::Object(Default::default()));
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings file {}", path.display()))?;
    parse_settings(&contents).with_context(|| format!("Invalid settings file {}", path.display()))
}

fn parse_settings(contents: &str) -> Result<Value> {
    let value: Value = serde_json::from_str(contents).context("Settings are not valid JSON")?;
    if !value.is_object() {
        bail!("Settings must be a JSON object");
    }
    Ok(value)
}

/// Watch `json_path` and send its parsed contents on `tx` after every change.
///
/// Watches the file itself if it exists, otherwise its parent directory
/// (created if needed). Unreadable or unparsable intermediate states are
/// logged and skipped. Returns when `shutdown` turns true, when `tx` is
/// closed, or if the watcher cannot be set up.
pub async fn watch_settings(
    json_path: PathBuf,
    tx: mpsc::Sender<Value>,
    mut shutdown: watch::Receiver<bool>,
) {
    if *shutdown.borrow() {
        return;
    }

    let watch_path = if json_path.exists() {
        json_path.clone()
    } else if let Some(parent) = json_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !parent.exists() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                error!("[settings-watch] Failed to create config dir: {}", e);
                return;
            }
        }
        parent.to_path_buf()
    } else {
        PathBuf::from(".")
    };
    let file_name = json_path.file_name().map(|name| name.to_os_string());

    let (event_tx, mut events) = mpsc::channel::<DebounceEventResult>(16);
    let mut debouncer = match notify_debouncer_mini::new_debouncer(
        WATCH_DEBOUNCE,
        move |res: DebounceEventResult| {
            let _ = event_tx.blocking_send(res);
        },
    ) {
        Ok(d) => d,
        Err(e) => {
            error!("[settings-watch] Failed to create file watcher: {}", e);
            return;
        }
    };

    if let Err(e) = debouncer
        .watcher()
        .watch(&watch_path, notify::RecursiveMode::NonRecursive)
    {
        error!("[settings-watch] Failed to watch {:?}: {}", watch_path, e);
        return;
    }

    info!("[settings-watch] Watching {:?} for external changes", watch_path);

    loop {
        tokio::select! {
            Some(result) = events.recv() => {
                match result {
                    Ok(batch) => {
                        let relevant = batch
                            .iter()
                            .any(|e| e.path.file_name() == file_name.as_deref());
                        if !relevant {
                            continue;
                        }

                        let contents = match tokio::fs::read_to_string(&json_path).await {
                            Ok(c) => c,
                            Err(e) => {
                                warn!("[settings-watch] Cannot read settings file: {}", e);
                                continue;
                            }
                        };
                        let value = match parse_settings(&contents) {
                            Ok(v) => v,
                            Err(e) => {
                                warn!("[settings-watch] Cannot parse settings file: {:#}", e);
                                continue;
                            }
                        };

                        info!("[settings-watch] Applied external settings changes");
                        if tx.send(value).await.is_err() {
                            info!("[settings-watch] Receiver closed, stopping");
                            break;
                        }
                    }
                    Err(errs) => {
                        warn!("[settings-watch] Watch error: {:?}", errs);
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("[settings-watch] Shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_settings_path_ends_with_app_dir() {
        let path = settings_path();
        assert!(path.ends_with("execute-time/settings.json"));
    }

    #[test]
    fn test_missing_file_yields_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let value = load_raw_settings(&dir.path().join("settings.json")).unwrap();
        assert_eq!(value, json!({}));
    }

    #[test]
    fn test_loads_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"enabled": true, "minTime": 1}"#).unwrap();

        let value = load_raw_settings(&path).unwrap();
        assert_eq!(value["enabled"], true);
        assert_eq!(value["minTime"], 1);
    }

    #[test]
    fn test_rejects_invalid_json_and_non_objects() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        std::fs::write(&path, "{ not json").unwrap();
        let err = load_raw_settings(&path).unwrap_err();
        assert!(format!("{err:#}").contains("not valid JSON"));

        std::fs::write(&path, "[1, 2]").unwrap();
        let err = load_raw_settings(&path).unwrap_err();
        assert!(format!("{err:#}").contains("JSON object"));
    }

    #[test]
    fn test_schema_has_properties() {
        let schema = settings_schema();
        assert!(schema["properties"]["dateFormat"].is_object());
        assert!(schema["properties"]["historyCount"].is_object());
    }

    #[tokio::test]
    async fn test_watch_returns_when_already_shut_down() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(true);

        watch_settings(dir.path().join("settings.json"), tx, shutdown_rx).await;
    }

    #[tokio::test]
    async fn test_watch_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let watcher = tokio::spawn(watch_settings(
            dir.path().join("nested").join("settings.json"),
            tx,
            shutdown_rx,
        ));
        tokio::task::yield_now().await;
        shutdown_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), watcher)
            .await
            .expect("watcher did not stop")
            .unwrap();
    }
}
