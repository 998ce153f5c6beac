//! Per-cell generations and the viewport gate.
//!
//! Every scheduled render bumps its cell's generation in the
//! [`UpdateCounter`]. Anything asynchronous started by a render (a viewport
//! wait, a live ticker) captures the generation it belongs to and gives up as
//! soon as a newer one exists.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::{mpsc, watch};

use crate::lock;
use crate::notebook::{CellView, Notebook};

/// Monotonic per-cell generation counter. Entries are never reset or removed.
///
/// That keeps one small `watch` channel alive for every cell id ever rendered
/// (duplicated cells included), so memory grows with the number of distinct
/// ids seen over the counter's lifetime. The counter lives as long as its
/// notebook's renderer.
#[derive(Debug, Default)]
pub struct UpdateCounter {
    cells: Mutex<HashMap<String, watch::Sender<u64>>>,
}

impl UpdateCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new generation for `cell_id` and return it.
    pub fn bump(&self, cell_id: &str) -> u64 {
        let mut cells = lock(&self.cells);
        let tx = cells
            .entry(cell_id.to_string())
            .or_insert_with(|| watch::channel(0).0);
        tx.send_modify(|generation| *generation += 1);
        let generation = *tx.borrow();
        generation
    }

    /// The newest generation for `cell_id`, 0 if none was ever started.
    pub fn latest(&self, cell_id: &str) -> u64 {
        lock(&self.cells)
            .get(cell_id)
            .map(|tx| *tx.borrow())
            .unwrap_or(0)
    }

    pub fn is_current(&self, cell_id: &str, generation: u64) -> bool {
        self.latest(cell_id) == generation
    }

    /// Receiver notified on every later bump of `cell_id`.
    pub fn subscribe(&self, cell_id: &str) -> watch::Receiver<u64> {
        lock(&self.cells)
            .entry(cell_id.to_string())
            .or_insert_with(|| watch::channel(0).0)
            .subscribe()
    }

    /// Resolves once `generation` is no longer the latest for `cell_id`.
    pub async fn superseded(&self, cell_id: &str, generation: u64) {
        let mut bumps = self.subscribe(cell_id);
        while self.is_current(cell_id, generation) {
            if bumps.changed().await.is_err() {
                return;
            }
        }
    }
}

enum GateEvent {
    Attached,
    Disposed,
}

/// Wait for `view` to be attached to the viewport.
///
/// Resolves `true` the first time the view is attached while `generation` is
/// still the latest for its cell. Resolves `false` as soon as the generation is
/// superseded or the view or notebook is disposed. All subscriptions are
/// dropped when the wait ends or is abandoned.
pub async fn await_viewport(
    view: &CellView,
    notebook: &Notebook,
    generation: u64,
    counter: &UpdateCounter,
) -> bool {
    let cell_id = view.id().to_string();
    let mut bumps = counter.subscribe(&cell_id);
    let (tx, mut events) = mpsc::unbounded_channel();

    let attach_tx = tx.clone();
    let _attached = view.viewport_changed().connect_scoped(move |attached| {
        if *attached {
            let _ = attach_tx.send(GateEvent::Attached);
        }
    });
    let view_tx = tx.clone();
    let _view_disposed = view.disposed().connect_scoped(move |_| {
        let _ = view_tx.send(GateEvent::Disposed);
    });
    let _notebook_disposed = notebook.disposed().connect_scoped(move |_| {
        let _ = tx.send(GateEvent::Disposed);
    });

    loop {
        if !counter.is_current(&cell_id, generation) {
            return false;
        }
        if view.is_disposed() || notebook.is_disposed() {
            return false;
        }
        if view.in_viewport() {
            return true;
        }

        tokio::select! {
            changed = bumps.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            event = events.recv() => match event {
                Some(GateEvent::Attached) => {}
                Some(GateEvent::Disposed) | None => return false,
            },
        }
    }
}
