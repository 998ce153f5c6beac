//! Turning a cell's execution metadata into its annotation.
//!
//! A render runs in two halves. The async half waits until the cell view is
//! ready and (for windowed notebooks) attached to the viewport, bailing out as
//! soon as a newer render for the same cell has been scheduled. The sync half
//! ([`Renderer::apply`]) then reads the metadata and settings and updates the
//! [`AnnotationNode`] in one go, without ever suspending.
//!
//! While a cell is running, a ticker task rewrites the live slot every
//! [`TICK_INTERVAL`] until a newer render supersedes it.
//!
//! Background renders are kept until [`Renderer::settle`] collects them,
//! including the ones a ticker schedules on its own.
//!
//! Everything here spawns onto the ambient tokio runtime.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Local, Utc};
use log::{debug, error};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::annotation::{AnnotationNode, ClickHandler, Container, HIGHLIGHT_DURATION};
use crate::error::ExecuteTimeError;
use crate::formatters::{format_duration, format_millis};
use crate::lock;
use crate::metadata::{has_failure_marker, ExecutionTimes};
use crate::notebook::{CellView, Notebook};
use crate::settings::{SettingsSnapshot, SettingsState};
use crate::viewport::{await_viewport, UpdateCounter};

/// How often the live elapsed time is refreshed.
pub const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Message prefix while a cell is running. The ticker stops once the primary
/// text no longer starts with it.
pub const RUNNING_PREFIX: &str = "Execution started at";

pub const QUEUED_PREFIX: &str = "Execution queued at";

/// What a render did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    /// Superseded by a newer render, or the cell went away first.
    Cancelled,
    /// The cell has no execution metadata; any existing node was hidden.
    Hidden,
    /// The node now shows `message` (possibly empty).
    Rendered { message: String },
}

#[derive(Debug, PartialEq, Eq)]
enum Tick {
    Continue,
    Stop,
    Rerender,
}

type RenderTask = JoinHandle<Result<RenderOutcome, ExecuteTimeError>>;

pub struct Renderer {
    notebook: Weak<Notebook>,
    settings: Arc<Mutex<SettingsState>>,
    counter: UpdateCounter,
    in_flight: Mutex<Vec<RenderTask>>,
}

impl Renderer {
    pub fn new(notebook: &Arc<Notebook>, settings: Arc<Mutex<SettingsState>>) -> Arc<Self> {
        Arc::new(Self {
            notebook: Arc::downgrade(notebook),
            settings,
            counter: UpdateCounter::new(),
            in_flight: Mutex::new(Vec::new()),
        })
    }

    /// Start a render in the background.
    ///
    /// The generation is bumped before this returns, so any render already in
    /// flight for the cell is superseded immediately. Errors are logged by the
    /// task and also handed out by [`Renderer::settle`].
    pub fn schedule(self: &Arc<Self>, view: Arc<CellView>, suppress_highlight: bool) {
        let generation = self.counter.bump(view.id());
        let renderer = Arc::clone(self);
        let task = tokio::spawn(async move {
            let result = renderer
                .render_generation(&view, generation, suppress_highlight)
                .await;
            if let Err(e) = &result {
                error!("[renderer] Failed to render cell {}: {e}", view.id());
            }
            result
        });

        let mut in_flight = lock(&self.in_flight);
        in_flight.retain(|task| !task.is_finished());
        in_flight.push(task);
    }

    /// Wait for every background render scheduled so far (and any scheduled
    /// meanwhile), returning their results in scheduling order.
    ///
    /// A render still waiting for its cell to become ready or reach the
    /// viewport keeps this pending until the wait succeeds or the render is
    /// superseded.
    pub async fn settle(&self) -> Vec<Result<RenderOutcome, ExecuteTimeError>> {
        let mut results = Vec::new();
        loop {
            let pending = std::mem::take(&mut *lock(&self.in_flight));
            if pending.is_empty() {
                return results;
            }
            for task in pending {
                match task.await {
                    Ok(result) => results.push(result),
                    Err(e) => error!("[renderer] Render task failed: {e}"),
                }
            }
        }
    }

    /// Render and wait for the result.
    pub async fn render(
        self: &Arc<Self>,
        view: &Arc<CellView>,
        suppress_highlight: bool,
    ) -> Result<RenderOutcome, ExecuteTimeError> {
        let generation = self.counter.bump(view.id());
        self.render_generation(view, generation, suppress_highlight)
            .await
    }

    /// Bump the cell's generation without rendering, making in-flight work
    /// for it inert.
    pub fn cancel(&self, cell_id: &str) {
        self.counter.bump(cell_id);
    }

    async fn render_generation(
        self: &Arc<Self>,
        view: &Arc<CellView>,
        generation: u64,
        suppress_highlight: bool,
    ) -> Result<RenderOutcome, ExecuteTimeError> {
        let cell_id = view.id();

        let ready = tokio::select! {
            ready = view.ready() => ready,
            () = self.counter.superseded(cell_id, generation) => false,
        };
        if !ready || !self.counter.is_current(cell_id, generation) {
            return Ok(RenderOutcome::Cancelled);
        }

        if !view.in_viewport() {
            let Some(notebook) = self.notebook.upgrade() else {
                return Ok(RenderOutcome::Cancelled);
            };
            debug!("[renderer] Cell {cell_id} waiting for the viewport");
            if !await_viewport(view, &notebook, generation, &self.counter).await {
                return Ok(RenderOutcome::Cancelled);
            }
        }

        if !self.counter.is_current(cell_id, generation) {
            return Ok(RenderOutcome::Cancelled);
        }
        self.apply(view, generation, suppress_highlight)
    }

    /// Bring the annotation in line with the cell's metadata and the current
    /// settings.
    fn apply(
        self: &Arc<Self>,
        view: &Arc<CellView>,
        generation: u64,
        suppress_highlight: bool,
    ) -> Result<RenderOutcome, ExecuteTimeError> {
        let cell_id = view.id();

        let Some(execution) = view.model().execution_metadata() else {
            let hidden = view.with_annotation(|slot| slot.as_mut().map(AnnotationNode::hide));
            if hidden.is_some() {
                debug!("[renderer] Cell {cell_id} has no execution metadata, hiding");
            }
            return Ok(RenderOutcome::Hidden);
        };
        let times = ExecutionTimes::from_metadata(&execution)?;

        let SettingsSnapshot {
            settings,
            date_pattern,
        } = lock(&self.settings).snapshot();
        let at = |t: DateTime<Utc>| date_pattern.format(&t.with_timezone(&Local));
        let container = (!view.input_hidden()).then(|| Container::from(settings.positioning));
        let on_click = self.click_handler(view);

        let applied = view.with_annotation(|slot| {
            // Deregistration bumps the generation before it takes the node.
            if !self.counter.is_current(cell_id, generation) {
                return None;
            }
            let node = slot.get_or_insert_with(AnnotationNode::new);
            if node.relocate(container) {
                debug!("[renderer] Cell {cell_id} annotation moved to {container:?}");
            }
            node.set_on_click(on_click);
            node.apply_classes(settings.positioning, settings.text_contrast);

            let mut ticker_start = None;
            let message = if times.likely_aborted {
                node.set_live_text("");
                String::new()
            } else if let Some(end) = times.ended {
                node.set_live_text("");
                let start = times.started.unwrap_or(end);
                let elapsed = (end - start).num_milliseconds() as f64 / 1000.0;
                if elapsed >= settings.min_time {
                    let duration = format_duration(end, start);
                    node.record_execution_time(duration.clone(), settings.history_count);
                    let status = if times.failed { "Failed" } else { "Last executed" };
                    let mut message = status.to_string();
                    if settings.show_date {
                        message.push_str(&format!(" at {}", at(end)));
                    }
                    message.push_str(&format!(" in {duration}"));
                    message
                } else {
                    String::new()
                }
            } else if let Some(start) = times.started {
                if settings.show_live_execution_time {
                    ticker_start = Some(start);
                } else {
                    node.set_live_text("");
                }
                format!("{RUNNING_PREFIX} {}", at(start))
            } else if let Some(queued) = times.queued {
                let live = match node.prev_execution_time() {
                    Some(prev) if settings.show_live_execution_time => format!("N/A ({prev})"),
                    _ => String::new(),
                };
                node.set_live_text(live);
                format!("{QUEUED_PREFIX} {}", at(queued))
            } else {
                String::new()
            };

            let mut highlight = None;
            if node.text() != message {
                node.set_text(message.clone());
                let finished = times.ended.is_some() && !times.likely_aborted;
                if !suppress_highlight && settings.highlight && finished {
                    highlight = Some(node.start_highlight());
                }
            }
            Some((message, highlight, ticker_start))
        });
        let Some((message, highlight, ticker_start)) = applied else {
            return Ok(RenderOutcome::Cancelled);
        };

        if let Some(epoch) = highlight {
            spawn_highlight_clear(view, epoch);
        }
        if let Some(start) = ticker_start {
            self.spawn_ticker(view, generation, start);
        }

        debug!("[renderer] Cell {cell_id} (generation {generation}): {message:?}");
        Ok(RenderOutcome::Rendered { message })
    }

    fn click_handler(&self, view: &Arc<CellView>) -> ClickHandler {
        let notebook = self.notebook.clone();
        let cell_id = view.id().to_string();
        Arc::new(move || {
            let Some(notebook) = notebook.upgrade() else {
                return;
            };
            // Re-activating the active cell would break range selections.
            if notebook.active_cell_id().as_deref() != Some(cell_id.as_str()) {
                notebook.activate(&cell_id);
            }
        })
    }

    // ── Live ticker ─────────────────────────────────────────────────

    fn spawn_ticker(
        self: &Arc<Self>,
        view: &Arc<CellView>,
        generation: u64,
        start: DateTime<Utc>,
    ) -> JoinHandle<()> {
        let renderer = Arc::downgrade(self);
        let view = Arc::downgrade(view);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let (Some(renderer), Some(view)) = (renderer.upgrade(), view.upgrade()) else {
                    return;
                };
                match renderer.tick(&view, generation, start) {
                    Tick::Continue => {}
                    Tick::Stop => return,
                    Tick::Rerender => {
                        debug!("[renderer] Cell {} metadata changed under the ticker", view.id());
                        renderer.schedule(view, false);
                        return;
                    }
                }
            }
        })
    }

    fn tick(&self, view: &CellView, generation: u64, start: DateTime<Utc>) -> Tick {
        if !self.counter.is_current(view.id(), generation) || view.is_disposed() {
            return Tick::Stop;
        }
        let running = view.with_annotation(|slot| {
            slot.as_ref()
                .is_some_and(|node| node.text().starts_with(RUNNING_PREFIX))
        });
        if !running {
            return Tick::Stop;
        }

        match view.model().execution_metadata() {
            Some(execution) if !has_failure_marker(&execution) => {}
            _ => return Tick::Rerender,
        }

        let min_time = lock(&self.settings).settings().min_time;
        let elapsed_ms = (Utc::now() - start).num_milliseconds();
        if (elapsed_ms as f64 / 1000.0) < min_time {
            return Tick::Continue;
        }

        let elapsed = format_millis(elapsed_ms);
        view.with_annotation(|slot| {
            let Some(node) = slot.as_mut().filter(|node| node.text().starts_with(RUNNING_PREFIX))
            else {
                return Tick::Stop;
            };
            let live = match node.prev_execution_time() {
                Some(prev) => format!("{elapsed} ({prev})"),
                None => elapsed,
            };
            node.set_live_text(live);
            Tick::Continue
        })
    }
}

fn spawn_highlight_clear(view: &Arc<CellView>, epoch: u64) -> JoinHandle<()> {
    let view = Arc::downgrade(view);
    tokio::spawn(async move {
        tokio::time::sleep(HIGHLIGHT_DURATION).await;
        if let Some(view) = view.upgrade() {
            view.with_annotation(|slot| {
                if let Some(node) = slot.as_mut() {
                    node.clear_highlight(epoch);
                }
            });
        }
    })
}
