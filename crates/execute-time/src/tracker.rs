//! Per-notebook lifecycle controller.
//!
//! The tracker owns the resolved settings and keeps exactly one listener
//! registration per live cell model:
//!
//! - while enabled it follows the notebook's cell list, registering new models
//!   and deregistering removed ones
//! - each registration listens to the model's metadata changes (scheduling a
//!   render) and to the model's disposal (tearing the registration down, since
//!   a move or duplicate disposes the model before the list change arrives)
//! - disabling deregisters everything and removes the annotations
//!
//! Must be used from within a tokio runtime: registration schedules renders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ExecuteTimeError;
use crate::lock;
use crate::notebook::{CellListChange, CellModel, CellView, Notebook};
use crate::renderer::{RenderOutcome, Renderer};
use crate::settings::{SettingsSnapshot, SettingsState, SettingsTransition, WarningSink};
use crate::signal::SlotId;

/// Listener handle for one cell id.
struct Registration {
    model: Weak<CellModel>,
    view: Weak<CellView>,
    metadata_slot: SlotId,
    disposed_slot: SlotId,
}

impl Registration {
    fn is_for(&self, model: &Arc<CellModel>) -> bool {
        std::ptr::eq(self.model.as_ptr(), Arc::as_ptr(model))
    }

    /// Disconnect from the model (if still alive) and drop the annotation.
    fn teardown(&self) {
        if let Some(model) = self.model.upgrade() {
            model.metadata_changed().disconnect(self.metadata_slot);
            model.disposed().disconnect(self.disposed_slot);
        }
        if let Some(view) = self.view.upgrade() {
            view.remove_annotation();
        }
    }
}

pub struct ExecuteTimeTracker {
    this: Weak<Self>,
    notebook: Weak<Notebook>,
    settings: Arc<Mutex<SettingsState>>,
    renderer: Arc<Renderer>,
    registrations: Mutex<HashMap<String, Registration>>,
    list_slot: Mutex<Option<SlotId>>,
    notebook_disposed_slot: Mutex<Option<SlotId>>,
    /// Set once record-timing has been forced on; never cleared.
    timing_forced: AtomicBool,
    is_disposed: AtomicBool,
}

impl ExecuteTimeTracker {
    /// Attach a tracker to `notebook`. It stays inert until settings with
    /// `enabled: true` are applied.
    pub fn new(notebook: &Arc<Notebook>, warnings: Arc<dyn WarningSink>) -> Arc<Self> {
        let settings = Arc::new(Mutex::new(SettingsState::new(warnings)));
        let renderer = Renderer::new(notebook, Arc::clone(&settings));

        Arc::new_cyclic(|this: &Weak<Self>| {
            let tracker = this.clone();
            let disposed_slot = notebook.disposed().connect(move |_| {
                if let Some(tracker) = tracker.upgrade() {
                    tracker.dispose();
                }
            });

            Self {
                this: this.clone(),
                notebook: Arc::downgrade(notebook),
                settings,
                renderer,
                registrations: Mutex::new(HashMap::new()),
                list_slot: Mutex::new(None),
                notebook_disposed_slot: Mutex::new(Some(disposed_slot)),
                timing_forced: AtomicBool::new(false),
                is_disposed: AtomicBool::new(false),
            }
        })
    }

    pub fn settings(&self) -> SettingsSnapshot {
        lock(&self.settings).snapshot()
    }

    pub fn renderer(&self) -> &Arc<Renderer> {
        &self.renderer
    }

    pub fn is_registered(&self, cell_id: &str) -> bool {
        lock(&self.registrations).contains_key(cell_id)
    }

    pub fn registered_count(&self) -> usize {
        lock(&self.registrations).len()
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed.load(Ordering::SeqCst)
    }

    // ── Settings ────────────────────────────────────────────────────

    /// Apply a raw settings value and bring every cell in line with it.
    pub fn apply_settings(&self, raw: &Value) -> SettingsTransition {
        let transition = lock(&self.settings).apply_update(raw);
        if self.is_disposed() {
            return transition;
        }
        let Some(notebook) = self.notebook.upgrade() else {
            return transition;
        };

        if transition.enabled {
            if !self.timing_forced.swap(true, Ordering::SeqCst) {
                info!("[tracker] Forcing execution timing recording on");
                notebook.set_record_timing(true);
            }
            self.connect_cell_list(&notebook);
            for model in notebook.models() {
                self.register(&model);
            }
        } else {
            self.disconnect_cell_list(&notebook);
            for model in notebook.models() {
                self.deregister(&model);
            }
        }
        transition
    }

    /// Apply every settings value received on `rx` until the channel closes.
    pub async fn follow_settings(self: Arc<Self>, mut rx: mpsc::Receiver<Value>) {
        while let Some(raw) = rx.recv().await {
            if self.is_disposed() {
                break;
            }
            debug!("[tracker] Settings changed");
            self.apply_settings(&raw);
        }
        debug!("[tracker] Settings source closed");
    }

    fn connect_cell_list(&self, notebook: &Notebook) {
        let mut slot = lock(&self.list_slot);
        if slot.is_some() {
            return;
        }
        let tracker = self.this.clone();
        *slot = Some(notebook.cells_changed().connect(move |change| {
            if let Some(tracker) = tracker.upgrade() {
                tracker.on_cell_list_changed(change);
            }
        }));
    }

    fn disconnect_cell_list(&self, notebook: &Notebook) {
        if let Some(slot) = lock(&self.list_slot).take() {
            notebook.cells_changed().disconnect(slot);
        }
    }

    // ── Registration ────────────────────────────────────────────────

    pub fn on_cell_list_changed(&self, change: &CellListChange) {
        for old in change.old_values.iter().flatten() {
            self.deregister(old);
        }
        for new in &change.new_values {
            self.register(new);
        }
    }

    /// Make sure `model` has a registration and render it once, without
    /// highlighting.
    pub fn register(&self, model: &Arc<CellModel>) {
        if self.is_disposed() || model.is_disposed() {
            return;
        }
        let id = model.id().to_string();

        let stale = {
            let mut registrations = lock(&self.registrations);
            let stale = match registrations.get(&id).map(|existing| existing.is_for(model)) {
                Some(false) => registrations.remove(&id),
                Some(true) | None => None,
            };
            if !registrations.contains_key(&id) {
                registrations.insert(id.clone(), self.connect_model(model));
                debug!("[tracker] Registered cell {id}");
            }
            stale
        };
        if let Some(stale) = stale {
            debug!("[tracker] Replaced stale registration for cell {id}");
            stale.teardown();
        }

        self.on_cell_metadata_changed(model, true);
    }

    fn connect_model(&self, model: &Arc<CellModel>) -> Registration {
        let tracker = self.this.clone();
        let weak_model = Arc::downgrade(model);
        let metadata_slot = model.metadata_changed().connect(move |_| {
            if let (Some(tracker), Some(model)) = (tracker.upgrade(), weak_model.upgrade()) {
                tracker.on_cell_metadata_changed(&model, false);
            }
        });

        let tracker = self.this.clone();
        let weak_model = Arc::downgrade(model);
        let disposed_slot = model.disposed().connect(move |_| {
            if let (Some(tracker), Some(model)) = (tracker.upgrade(), weak_model.upgrade()) {
                debug!("[tracker] Cell {} disposed", model.id());
                tracker.deregister(&model);
            }
        });

        let view = self
            .notebook
            .upgrade()
            .and_then(|notebook| notebook.find_view(model))
            .map(|view| Arc::downgrade(&view))
            .unwrap_or_default();

        Registration {
            model: Arc::downgrade(model),
            view,
            metadata_slot,
            disposed_slot,
        }
    }

    /// Drop the registration bound to this exact model. Returns false if there
    /// was none.
    pub fn deregister(&self, model: &Arc<CellModel>) -> bool {
        let removed = {
            let mut registrations = lock(&self.registrations);
            let bound = registrations
                .get(model.id())
                .is_some_and(|existing| existing.is_for(model));
            if bound {
                registrations.remove(model.id())
            } else {
                None
            }
        };
        let Some(registration) = removed else {
            return false;
        };

        self.renderer.cancel(model.id());
        registration.teardown();
        if let Some(view) = self
            .notebook
            .upgrade()
            .and_then(|notebook| notebook.find_view(model))
        {
            view.remove_annotation();
        }
        debug!("[tracker] Deregistered cell {}", model.id());
        true
    }

    // ── Rendering ───────────────────────────────────────────────────

    /// The realized view of a code cell. `Ok(None)` for non-code cells.
    pub fn code_cell(&self, model: &Arc<CellModel>) -> Result<Option<Arc<CellView>>, ExecuteTimeError> {
        if !model.is_code() {
            return Ok(None);
        }
        self.notebook
            .upgrade()
            .and_then(|notebook| notebook.find_view(model))
            .map(Some)
            .ok_or_else(|| ExecuteTimeError::MissingCodeCell(model.id().to_string()))
    }

    /// Schedule a render for `model`'s cell. Returns false if nothing was
    /// scheduled; lookup problems are logged.
    pub fn on_cell_metadata_changed(&self, model: &Arc<CellModel>, suppress_highlight: bool) -> bool {
        match self.code_cell(model) {
            Ok(Some(view)) => {
                self.renderer.schedule(view, suppress_highlight);
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!("[tracker] {e}");
                false
            }
        }
    }

    /// Wait for every background render, see [`Renderer::settle`].
    pub async fn settle(&self) -> Vec<Result<RenderOutcome, ExecuteTimeError>> {
        self.renderer.settle().await
    }

    /// Render every registered code cell now, without highlighting.
    pub async fn refresh(&self) -> Vec<(String, Result<RenderOutcome, ExecuteTimeError>)> {
        let models: Vec<Arc<CellModel>> = lock(&self.registrations)
            .values()
            .filter_map(|registration| registration.model.upgrade())
            .collect();

        let mut results = Vec::new();
        for model in models {
            let view = match self.code_cell(&model) {
                Ok(Some(view)) => view,
                Ok(None) => continue,
                Err(e) => {
                    warn!("[tracker] {e}");
                    continue;
                }
            };
            let result = self.renderer.render(&view, true).await;
            if let Err(e) = &result {
                error!("[tracker] Failed to render cell {}: {e}", model.id());
            }
            results.push((model.id().to_string(), result));
        }
        results
    }

    // ── Shutdown ────────────────────────────────────────────────────

    /// Disconnect from the notebook and drop every registration.
    pub fn dispose(&self) {
        if self.is_disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(notebook) = self.notebook.upgrade() {
            self.disconnect_cell_list(&notebook);
            if let Some(slot) = lock(&self.notebook_disposed_slot).take() {
                notebook.disposed().disconnect(slot);
            }
        }

        let registrations: Vec<(String, Registration)> =
            lock(&self.registrations).drain().collect();
        for (id, registration) in registrations {
            self.renderer.cancel(&id);
            registration.teardown();
        }
        info!("[tracker] Disposed");
    }
}

impl Drop for ExecuteTimeTracker {
    fn drop(&mut self) {
        self.dispose();
    }
}
