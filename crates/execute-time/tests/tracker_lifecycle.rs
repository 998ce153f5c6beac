//! End-to-end runs of the tracker against an in-memory notebook.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use execute_time::annotation::{Container, HIGHLIGHT_ANIMATION, HIGHLIGHT_DURATION};
use execute_time::settings::WarningSink;
use execute_time::{CellModel, CellType, CellView, ExecuteTimeTracker, Notebook, NotebookOptions};

#[derive(Default)]
struct CollectedWarnings(Mutex<Vec<String>>);

impl WarningSink for CollectedWarnings {
    fn show_warning(&self, title: &str, _message: &str) {
        self.0.lock().unwrap().push(title.to_string());
    }
}

fn iso(t: DateTime<Utc>) -> String {
    t.to_rfc3339()
}

fn fields(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

/// Feed the metadata a kernel produces for one successful run.
fn run_cell(view: &CellView, start: DateTime<Utc>, secs: i64) {
    let end = start + chrono::Duration::seconds(secs);
    view.model().update_execution(fields(json!({
        "iopub.status.busy": iso(start),
        "iopub.execute_input": iso(start),
        "shell.execute_reply.started": iso(start),
        "shell.execute_reply": iso(end),
    })));
}

fn setup(options: NotebookOptions) -> (Arc<Notebook>, Arc<ExecuteTimeTracker>, Arc<CollectedWarnings>) {
    let notebook = Arc::new(Notebook::new(options));
    notebook.push_cell(CellModel::new("intro", CellType::Markdown));
    notebook.push_cell(CellModel::new("load", CellType::Code));
    notebook.push_cell(CellModel::new("train", CellType::Code));
    let warnings = Arc::new(CollectedWarnings::default());
    let tracker = ExecuteTimeTracker::new(&notebook, warnings.clone());
    (notebook, tracker, warnings)
}

#[tokio::test]
async fn test_full_execution_cycle() {
    let (notebook, tracker, _) = setup(NotebookOptions::default());
    tracker.apply_settings(&json!({"enabled": true, "showDate": false}));
    tracker.settle().await;

    let view = notebook.view_by_id("load").unwrap();
    let start = Utc::now() - chrono::Duration::seconds(10);

    view.model().set_metadata("execution", json!({"iopub.status.busy": iso(start)}));
    tracker.settle().await;
    assert!(view.annotation().unwrap().text().starts_with("Execution queued at"));

    view.model().update_execution(fields(json!({"iopub.execute_input": iso(start)})));
    tracker.settle().await;
    assert!(view.annotation().unwrap().text().starts_with("Execution started at"));

    view.model().update_execution(fields(json!({
        "shell.execute_reply.started": iso(start),
        "shell.execute_reply": iso(start + chrono::Duration::milliseconds(1024)),
    })));
    tracker.settle().await;

    let node = view.annotation().unwrap();
    assert_eq!(node.text(), "Last executed in 1.02s");
    assert_eq!(node.live_text(), "");
    assert_eq!(node.parent(), Some(Container::Editor));
    assert_eq!(node.animation(), Some(HIGHLIGHT_ANIMATION));
}

#[tokio::test]
async fn test_history_across_runs() {
    let (notebook, tracker, _) = setup(NotebookOptions::default());
    tracker.apply_settings(&json!({"enabled": true, "historyCount": 3, "showDate": false}));
    tracker.settle().await;

    let view = notebook.view_by_id("train").unwrap();
    let start = Utc::now();
    for secs in 1..=5 {
        run_cell(&view, start, secs);
        tracker.settle().await;
    }

    let node = view.annotation().unwrap();
    assert_eq!(node.text(), "Last executed in 5.00s");
    assert_eq!(
        node.tooltip().unwrap(),
        "Previous Runs:\n4.00s\n3.00s\n2.00s"
    );
}

#[tokio::test]
async fn test_clear_outputs_hides_then_next_run_restores() {
    let (notebook, tracker, _) = setup(NotebookOptions::default());
    tracker.apply_settings(&json!({"enabled": true, "showDate": false}));
    let view = notebook.view_by_id("load").unwrap();
    run_cell(&view, Utc::now(), 2);
    tracker.settle().await;

    view.model().delete_metadata("execution");
    tracker.settle().await;
    assert!(view.annotation().unwrap().is_hidden());

    run_cell(&view, Utc::now(), 3);
    tracker.settle().await;
    let node = view.annotation().unwrap();
    assert!(!node.is_hidden());
    assert_eq!(node.tooltip().unwrap(), "Previous Runs:\n2.00s");
}

#[tokio::test]
async fn test_aborted_cell_renders_blank() {
    let (notebook, tracker, _) = setup(NotebookOptions::default());
    tracker.apply_settings(&json!({"enabled": true}));
    let view = notebook.view_by_id("train").unwrap();
    let now = Utc::now();

    view.model().set_metadata(
        "execution",
        json!({
            "iopub.status.busy": iso(now),
            "shell.execute_reply": iso(now + chrono::Duration::seconds(1)),
        }),
    );
    tracker.settle().await;

    let node = view.annotation().unwrap();
    assert_eq!(node.text(), "");
    assert_eq!(node.prev_execution_time(), None);
}

#[tokio::test]
async fn test_disable_and_reenable() {
    let (notebook, tracker, _) = setup(NotebookOptions::default());
    tracker.apply_settings(&json!({"enabled": true}));
    let view = notebook.view_by_id("load").unwrap();
    run_cell(&view, Utc::now(), 1);
    tracker.settle().await;
    assert!(view.has_annotation());

    tracker.apply_settings(&json!({"enabled": false}));
    assert!(!view.has_annotation());

    // Metadata changes while disabled are ignored.
    run_cell(&view, Utc::now(), 2);
    tracker.settle().await;
    assert!(!view.has_annotation());

    tracker.apply_settings(&json!({"enabled": true, "showDate": false}));
    tracker.settle().await;
    let node = view.annotation().unwrap();
    assert_eq!(node.text(), "Last executed in 2.00s");
    assert_eq!(node.history_len(), 0);
}

#[tokio::test]
async fn test_invalid_date_format_warns_once_and_still_renders() {
    let (notebook, tracker, warnings) = setup(NotebookOptions::default());
    let view = notebook.view_by_id("load").unwrap();
    run_cell(&view, Utc::now(), 1);

    tracker.apply_settings(&json!({"enabled": true, "dateFormat": "nonsense"}));
    tracker.apply_settings(&json!({"enabled": true, "dateFormat": "nonsense", "minTime": 0}));
    tracker.settle().await;

    assert_eq!(warnings.0.lock().unwrap().len(), 1);
    assert!(view.annotation().unwrap().text().starts_with("Last executed at "));
}

#[tokio::test]
async fn test_windowed_cells_render_once_scrolled_into_view() {
    let (notebook, tracker, _) = setup(NotebookOptions { windowed: true });
    let view = notebook.view_by_id("train").unwrap();
    run_cell(&view, Utc::now(), 1);
    tracker.apply_settings(&json!({"enabled": true}));

    tokio::task::yield_now().await;
    assert!(!view.has_annotation());

    view.mark_ready();
    tokio::task::yield_now().await;
    assert!(!view.has_annotation());

    for view in notebook.views() {
        view.mark_ready();
        view.set_in_viewport(true);
    }
    tracker.settle().await;
    assert!(view.annotation().unwrap().text().starts_with("Last executed"));
}

#[tokio::test]
async fn test_scrolled_away_before_attach_is_superseded_cleanly() {
    let (notebook, tracker, _) = setup(NotebookOptions { windowed: true });
    let view = notebook.view_by_id("load").unwrap();
    view.mark_ready();
    tracker.apply_settings(&json!({"enabled": true}));

    // Two metadata changes while detached: only the newest render survives.
    run_cell(&view, Utc::now(), 1);
    run_cell(&view, Utc::now(), 2);
    view.set_in_viewport(true);
    for other in notebook.views() {
        other.mark_ready();
        other.set_in_viewport(true);
    }

    let results = tracker.settle().await;
    assert!(results.iter().all(Result::is_ok));
    let node = view.annotation().unwrap();
    assert_eq!(node.prev_execution_time(), Some("2.00s"));
    assert_eq!(node.history_len(), 0);
}

#[tokio::test]
async fn test_cell_moves_keep_single_registration() {
    let (notebook, tracker, _) = setup(NotebookOptions::default());
    tracker.apply_settings(&json!({"enabled": true}));
    let before = notebook.view_by_id("load").unwrap();
    run_cell(&before, Utc::now(), 1);
    tracker.settle().await;

    let moved = notebook.move_cell(1, 2).unwrap();
    tracker.settle().await;

    assert_eq!(tracker.registered_count(), 3);
    assert_eq!(moved.model().metadata_changed().slot_count(), 1);
    assert!(moved.annotation().unwrap().text().starts_with("Last executed"));

    run_cell(&moved, Utc::now(), 4);
    tracker.settle().await;
    assert!(moved.annotation().unwrap().text().ends_with("in 4.00s"));
}

#[tokio::test]
async fn test_clicking_annotation_activates_cell() {
    let (notebook, tracker, _) = setup(NotebookOptions::default());
    tracker.apply_settings(&json!({"enabled": true}));
    let view = notebook.view_by_id("train").unwrap();
    run_cell(&view, Utc::now(), 1);
    tracker.settle().await;
    notebook.activate("load");

    assert!(view.annotation().unwrap().click());
    assert_eq!(notebook.active_cell_id().as_deref(), Some("train"));
}

#[tokio::test(start_paused = true)]
async fn test_highlight_fades() {
    let (notebook, tracker, _) = setup(NotebookOptions::default());
    tracker.apply_settings(&json!({"enabled": true}));
    tracker.settle().await;
    let view = notebook.view_by_id("load").unwrap();

    run_cell(&view, Utc::now(), 1);
    tracker.settle().await;
    assert!(view.annotation().unwrap().animation().is_some());

    tokio::time::sleep(HIGHLIGHT_DURATION + Duration::from_millis(50)).await;
    assert!(view.annotation().unwrap().animation().is_none());
}

#[tokio::test]
async fn test_notebook_from_ipynb() {
    let doc = json!({
        "nbformat": 4,
        "nbformat_minor": 5,
        "metadata": {},
        "cells": [
            {
                "cell_type": "code",
                "id": "a1",
                "source": ["print('hi')"],
                "outputs": [],
                "execution_count": 1,
                "metadata": {
                    "execution": {
                        "iopub.execute_input": "2024-03-01T10:00:00.000000Z",
                        "iopub.status.busy": "2024-03-01T10:00:00.000000Z",
                        "shell.execute_reply": "2024-03-01T10:02:01.821000Z",
                    }
                }
            },
            {"cell_type": "markdown", "id": "m1", "source": [], "metadata": {}}
        ]
    });
    let notebook = Arc::new(Notebook::from_ipynb(&doc, NotebookOptions::default()).unwrap());
    let tracker = ExecuteTimeTracker::new(&notebook, Arc::new(CollectedWarnings::default()));
    tracker.apply_settings(&json!({"enabled": true, "showDate": false}));
    tracker.settle().await;

    let node = notebook.view_by_id("a1").unwrap().annotation().unwrap();
    assert_eq!(node.text(), "Last executed in 2m 1.82s");
    assert!(notebook.view_by_id("m1").unwrap().annotation().is_none());
}
