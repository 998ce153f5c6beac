//! In-memory notebook host.
//!
//! A frontend (or the CLI, or a test) drives these types; the tracker only
//! ever observes them through their [`Signal`]s. The shapes follow a notebook
//! frontend: a [`CellModel`] holds the document state of a cell, a
//! [`CellView`] is its realized widget (readiness, viewport attachment and the
//! annotation slot), and the [`Notebook`] owns the ordered list of views and
//! reports list changes.
//!
//! Moving a cell disposes its model and creates a new one with the same id, and
//! the list change for a move carries no old model. Listeners that need to tear
//! down per-model state must therefore watch the model's own `disposed` signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::annotation::AnnotationNode;
use crate::error::ExecuteTimeError;
use crate::lock;
use crate::metadata::{self, EXECUTION_KEY};
use crate::signal::Signal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

impl CellType {
    /// Parse an nbformat `cell_type`.
    pub fn from_nbformat(s: &str) -> Option<Self> {
        match s {
            "code" => Some(CellType::Code),
            "markdown" => Some(CellType::Markdown),
            "raw" => Some(CellType::Raw),
            _ => None,
        }
    }
}

/// Payload of [`CellModel::metadata_changed`].
#[derive(Debug, Clone, PartialEq)]
pub struct MetadataChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

// ── Cell model ──────────────────────────────────────────────────────

pub struct CellModel {
    id: String,
    cell_type: CellType,
    metadata: Mutex<Map<String, Value>>,
    is_disposed: AtomicBool,
    metadata_changed: Signal<MetadataChange>,
    disposed: Signal<()>,
}

impl CellModel {
    pub fn new(id: impl Into<String>, cell_type: CellType) -> Self {
        Self::with_metadata(id, cell_type, Map::new())
    }

    pub fn with_metadata(
        id: impl Into<String>,
        cell_type: CellType,
        metadata: Map<String, Value>,
    ) -> Self {
        Self {
            id: id.into(),
            cell_type,
            metadata: Mutex::new(metadata),
            is_disposed: AtomicBool::new(false),
            metadata_changed: Signal::new(),
            disposed: Signal::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn cell_type(&self) -> CellType {
        self.cell_type
    }

    pub fn is_code(&self) -> bool {
        self.cell_type == CellType::Code
    }

    /// Snapshot of the whole metadata mapping.
    pub fn metadata(&self) -> Map<String, Value> {
        lock(&self.metadata).clone()
    }

    pub fn get_metadata(&self, key: &str) -> Option<Value> {
        lock(&self.metadata).get(key).cloned()
    }

    /// The `execution` mapping, if present and an object.
    pub fn execution_metadata(&self) -> Option<Map<String, Value>> {
        metadata::execution_map(&lock(&self.metadata)).cloned()
    }

    pub fn set_metadata(&self, key: &str, value: Value) {
        let old_value = lock(&self.metadata).insert(key.to_string(), value.clone());
        self.metadata_changed.emit(&MetadataChange {
            key: key.to_string(),
            old_value,
            new_value: Some(value),
        });
    }

    pub fn delete_metadata(&self, key: &str) -> Option<Value> {
        let old_value = lock(&self.metadata).remove(key);
        if old_value.is_some() {
            self.metadata_changed.emit(&MetadataChange {
                key: key.to_string(),
                old_value: old_value.clone(),
                new_value: None,
            });
        }
        old_value
    }

    /// Merge `fields` into the `execution` mapping, creating it if needed.
    ///
    /// Emits a single metadata change, the way a kernel reply updates the
    /// mapping in one go.
    pub fn update_execution(&self, fields: Map<String, Value>) {
        let mut execution = self.execution_metadata().unwrap_or_default();
        execution.extend(fields);
        self.set_metadata(EXECUTION_KEY, Value::Object(execution));
    }

    pub fn metadata_changed(&self) -> &Signal<MetadataChange> {
        &self.metadata_changed
    }

    pub fn disposed(&self) -> &Signal<()> {
        &self.disposed
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed.load(Ordering::SeqCst)
    }

    /// Dispose the model. Emits `disposed` once; later calls are no-ops.
    pub fn dispose(&self) {
        if self.is_disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disposed.emit(&());
        self.metadata_changed.disconnect_all();
        self.disposed.disconnect_all();
    }
}

impl std::fmt::Debug for CellModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellModel")
            .field("id", &self.id)
            .field("cell_type", &self.cell_type)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

// ── Cell view ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    Disposed,
}

pub struct CellView {
    model: Arc<CellModel>,
    readiness: watch::Sender<Readiness>,
    in_viewport: AtomicBool,
    input_hidden: AtomicBool,
    viewport_changed: Signal<bool>,
    disposed: Signal<()>,
    annotation: Mutex<Option<AnnotationNode>>,
}

impl CellView {
    /// A pending view, not yet attached to the viewport.
    pub fn new(model: Arc<CellModel>) -> Self {
        let (readiness, _) = watch::channel(Readiness::Pending);
        Self {
            model,
            readiness,
            in_viewport: AtomicBool::new(false),
            input_hidden: AtomicBool::new(false),
            viewport_changed: Signal::new(),
            disposed: Signal::new(),
            annotation: Mutex::new(None),
        }
    }

    pub fn model(&self) -> &Arc<CellModel> {
        &self.model
    }

    pub fn id(&self) -> &str {
        self.model.id()
    }

    // ── Readiness ───────────────────────────────────────────────────

    pub fn mark_ready(&self) {
        self.readiness.send_if_modified(|state| {
            if *state == Readiness::Pending {
                *state = Readiness::Ready;
                true
            } else {
                false
            }
        });
    }

    pub fn is_ready(&self) -> bool {
        *self.readiness.borrow() == Readiness::Ready
    }

    /// Wait until the view is ready. Returns false if it is disposed first.
    pub async fn ready(&self) -> bool {
        let mut rx = self.readiness.subscribe();
        let ready = match rx.wait_for(|state| *state != Readiness::Pending).await {
            Ok(state) => *state == Readiness::Ready,
            Err(_) => false,
        };
        ready
    }

    // ── Viewport ────────────────────────────────────────────────────

    pub fn in_viewport(&self) -> bool {
        self.in_viewport.load(Ordering::SeqCst)
    }

    /// Attach to or detach from the viewport, emitting on change.
    pub fn set_in_viewport(&self, in_viewport: bool) {
        if self.in_viewport.swap(in_viewport, Ordering::SeqCst) != in_viewport {
            self.viewport_changed.emit(&in_viewport);
        }
    }

    pub fn viewport_changed(&self) -> &Signal<bool> {
        &self.viewport_changed
    }

    pub fn input_hidden(&self) -> bool {
        self.input_hidden.load(Ordering::SeqCst)
    }

    pub fn set_input_hidden(&self, hidden: bool) {
        self.input_hidden.store(hidden, Ordering::SeqCst);
    }

    // ── Annotation slot ─────────────────────────────────────────────

    /// A copy of the current annotation node.
    pub fn annotation(&self) -> Option<AnnotationNode> {
        lock(&self.annotation).clone()
    }

    pub fn has_annotation(&self) -> bool {
        lock(&self.annotation).is_some()
    }

    /// Run `f` with the annotation slot locked.
    pub fn with_annotation<R>(&self, f: impl FnOnce(&mut Option<AnnotationNode>) -> R) -> R {
        f(&mut lock(&self.annotation))
    }

    pub fn remove_annotation(&self) -> bool {
        lock(&self.annotation).take().is_some()
    }

    // ── Disposal ────────────────────────────────────────────────────

    pub fn disposed(&self) -> &Signal<()> {
        &self.disposed
    }

    pub fn is_disposed(&self) -> bool {
        *self.readiness.borrow() == Readiness::Disposed
    }

    pub fn dispose(&self) {
        if self.readiness.send_replace(Readiness::Disposed) == Readiness::Disposed {
            return;
        }
        self.in_viewport.store(false, Ordering::SeqCst);
        self.disposed.emit(&());
        self.disposed.disconnect_all();
        self.viewport_changed.disconnect_all();
    }
}

impl std::fmt::Debug for CellView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CellView")
            .field("id", &self.id())
            .field("readiness", &*self.readiness.borrow())
            .field("in_viewport", &self.in_viewport())
            .finish_non_exhaustive()
    }
}

// ── Notebook ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellListChangeKind {
    Add,
    Remove,
    Move,
}

/// Payload of [`Notebook::cells_changed`].
#[derive(Debug, Clone)]
pub struct CellListChange {
    pub kind: CellListChangeKind,
    /// Models that left the list. `None` when the model was already gone.
    pub old_values: Vec<Option<Arc<CellModel>>>,
    pub new_values: Vec<Arc<CellModel>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotebookOptions {
    /// Only cells scrolled into view are attached. Views start detached and
    /// the host attaches them with [`CellView::set_in_viewport`].
    pub windowed: bool,
}

pub struct Notebook {
    options: NotebookOptions,
    views: Mutex<Vec<Arc<CellView>>>,
    active_cell: Mutex<Option<String>>,
    record_timing: AtomicBool,
    is_disposed: AtomicBool,
    cells_changed: Signal<CellListChange>,
    disposed: Signal<()>,
}

impl Notebook {
    pub fn new(options: NotebookOptions) -> Self {
        Self {
            options,
            views: Mutex::new(Vec::new()),
            active_cell: Mutex::new(None),
            record_timing: AtomicBool::new(false),
            is_disposed: AtomicBool::new(false),
            cells_changed: Signal::new(),
            disposed: Signal::new(),
        }
    }

    /// Build a notebook from an nbformat v4 document.
    ///
    /// Cells without an `id` (nbformat < 4.5) get a fresh one. Unknown cell
    /// types are rejected.
    pub fn from_ipynb(doc: &Value, options: NotebookOptions) -> Result<Self, ExecuteTimeError> {
        let cells = doc
            .get("cells")
            .and_then(Value::as_array)
            .ok_or_else(|| ExecuteTimeError::InvalidNotebook("missing 'cells' array".into()))?;

        let notebook = Self::new(options);
        for (index, cell) in cells.iter().enumerate() {
            let cell_type = cell
                .get("cell_type")
                .and_then(Value::as_str)
                .and_then(CellType::from_nbformat)
                .ok_or_else(|| {
                    ExecuteTimeError::InvalidNotebook(format!("cell {index} has no valid cell_type"))
                })?;
            let id = cell
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let metadata = cell
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            notebook.push_cell(CellModel::with_metadata(id, cell_type, metadata));
        }
        Ok(notebook)
    }

    pub fn options(&self) -> NotebookOptions {
        self.options
    }

    pub fn cells_changed(&self) -> &Signal<CellListChange> {
        &self.cells_changed
    }

    pub fn disposed(&self) -> &Signal<()> {
        &self.disposed
    }

    pub fn views(&self) -> Vec<Arc<CellView>> {
        lock(&self.views).clone()
    }

    pub fn models(&self) -> Vec<Arc<CellModel>> {
        lock(&self.views)
            .iter()
            .map(|view| Arc::clone(view.model()))
            .collect()
    }

    pub fn cell_count(&self) -> usize {
        lock(&self.views).len()
    }

    pub fn view_at(&self, index: usize) -> Option<Arc<CellView>> {
        lock(&self.views).get(index).cloned()
    }

    pub fn view_by_id(&self, id: &str) -> Option<Arc<CellView>> {
        lock(&self.views).iter().find(|v| v.id() == id).cloned()
    }

    /// The view realizing exactly this model.
    pub fn find_view(&self, model: &Arc<CellModel>) -> Option<Arc<CellView>> {
        lock(&self.views)
            .iter()
            .find(|v| Arc::ptr_eq(v.model(), model))
            .cloned()
    }

    // ── List mutations ──────────────────────────────────────────────

    fn realize(&self, model: Arc<CellModel>) -> Arc<CellView> {
        let view = Arc::new(CellView::new(model));
        if !self.options.windowed {
            view.mark_ready();
            view.set_in_viewport(true);
        }
        view
    }

    fn place(&self, index: usize, view: Arc<CellView>) {
        let mut views = lock(&self.views);
        let index = index.min(views.len());
        views.insert(index, view);
    }

    pub fn insert_cell(&self, index: usize, model: CellModel) -> Arc<CellView> {
        let model = Arc::new(model);
        let view = self.realize(Arc::clone(&model));
        self.place(index, Arc::clone(&view));
        debug!("[notebook] Inserted cell {}", model.id());
        self.cells_changed.emit(&CellListChange {
            kind: CellListChangeKind::Add,
            old_values: Vec::new(),
            new_values: vec![model],
        });
        view
    }

    pub fn push_cell(&self, model: CellModel) -> Arc<CellView> {
        let index = self.cell_count();
        self.insert_cell(index, model)
    }

    /// Remove the cell at `index`, disposing its view and model.
    pub fn remove_cell(&self, index: usize) -> Option<Arc<CellModel>> {
        let view = {
            let mut views = lock(&self.views);
            if index >= views.len() {
                return None;
            }
            views.remove(index)
        };
        let model = Arc::clone(view.model());
        self.cells_changed.emit(&CellListChange {
            kind: CellListChangeKind::Remove,
            old_values: vec![Some(Arc::clone(&model))],
            new_values: Vec::new(),
        });
        view.dispose();
        model.dispose();
        Some(model)
    }

    /// Move a cell. The old model is disposed and replaced by a fresh model
    /// with the same id and metadata.
    pub fn move_cell(&self, from: usize, to: usize) -> Option<Arc<CellView>> {
        let old_view = {
            let mut views = lock(&self.views);
            if from >= views.len() {
                return None;
            }
            views.remove(from)
        };
        let old_model = Arc::clone(old_view.model());
        old_view.dispose();
        old_model.dispose();

        let model = Arc::new(CellModel::with_metadata(
            old_model.id(),
            old_model.cell_type(),
            old_model.metadata(),
        ));
        let view = self.realize(Arc::clone(&model));
        self.place(to, Arc::clone(&view));
        self.cells_changed.emit(&CellListChange {
            kind: CellListChangeKind::Move,
            old_values: vec![None],
            new_values: vec![model],
        });
        Some(view)
    }

    /// Insert a copy of the cell at `index` right after it, under a new id.
    pub fn duplicate_cell(&self, index: usize) -> Option<Arc<CellView>> {
        let source = self.view_at(index)?;
        let model = CellModel::with_metadata(
            uuid::Uuid::new_v4().to_string(),
            source.model().cell_type(),
            source.model().metadata(),
        );
        Some(self.insert_cell(index + 1, model))
    }

    // ── Active cell ─────────────────────────────────────────────────

    pub fn active_cell_id(&self) -> Option<String> {
        lock(&self.active_cell).clone()
    }

    /// Make the cell with `id` active. Returns false if it is not in the list.
    pub fn activate(&self, id: &str) -> bool {
        if self.view_by_id(id).is_none() {
            return false;
        }
        *lock(&self.active_cell) = Some(id.to_string());
        true
    }

    // ── Notebook state ──────────────────────────────────────────────

    pub fn record_timing(&self) -> bool {
        self.record_timing.load(Ordering::SeqCst)
    }

    pub fn set_record_timing(&self, record: bool) {
        self.record_timing.store(record, Ordering::SeqCst);
    }

    pub fn is_disposed(&self) -> bool {
        self.is_disposed.load(Ordering::SeqCst)
    }

    /// Dispose the notebook and all of its cells.
    pub fn dispose(&self) {
        if self.is_disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disposed.emit(&());
        let views = std::mem::take(&mut *lock(&self.views));
        for view in views {
            view.dispose();
            view.model().dispose();
        }
        self.cells_changed.disconnect_all();
        self.disposed.disconnect_all();
    }
}

impl std::fmt::Debug for Notebook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notebook")
            .field("options", &self.options)
            .field("cells", &self.cell_count())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
