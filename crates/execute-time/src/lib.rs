//! execute-time - Per-cell execution timing annotations for Jupyter notebooks.
//!
//! Watches a notebook's cells for kernel-reported execution metadata and keeps
//! one annotation per code cell in sync with it: queued, running (with a live
//! ticking elapsed time), completed, failed or aborted, plus a short history of
//! previous run durations.
//!
//! The host notebook is modelled in [`notebook`] (cell models, cell views and
//! the cell list, all exposing [`signal::Signal`]s). The [`tracker`] subscribes
//! to those signals and schedules renders on the [`renderer`], which waits on
//! the [`viewport`] gate for windowed cells and writes into the
//! [`annotation`] node owned by each cell view.

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod annotation;
pub mod error;
pub mod formatters;
pub mod metadata;
pub mod notebook;
pub mod renderer;
pub mod settings;
pub mod settings_source;
pub mod signal;
pub mod tracker;
pub mod viewport;

pub use error::ExecuteTimeError;
pub use notebook::{CellModel, CellType, CellView, Notebook, NotebookOptions};
pub use renderer::{RenderOutcome, Renderer};
pub use settings::{ExecuteTimeSettings, SettingsState};
pub use tracker::ExecuteTimeTracker;

/// Plugin identifier, also used as the settings namespace.
pub const PLUGIN_NAME: &str = "jupyterlab-execute-time";

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// All state behind these mutexes is left consistent between statements, so a
/// poisoned lock carries no torn data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
