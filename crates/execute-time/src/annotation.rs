//! The per-cell annotation node.
//!
//! An [`AnnotationNode`] is the abstract element a frontend draws next to a
//! code cell's input. It carries the timing message, a secondary live slot,
//! its CSS classes and the history of previous run durations. The node is the
//! only place that history lives, so it is hidden rather than dropped when a
//! cell's execution metadata is cleared.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::settings::{Positioning, TextContrast};

/// Base CSS class of every annotation node.
pub const EXECUTE_TIME_CLASS: &str = "execute-time";

/// Class added while the cell has no execution metadata.
pub const HIDDEN_CLASS: &str = "execute-time-hidden";

/// First line of the history tooltip.
pub const TOOLTIP_PREFIX: &str = "Previous Runs:";

/// Attribute holding the last completed duration.
pub const PREV_EXECUTION_TIME_ATTR: &str = "data-prev-execution-time";

/// How long the completion highlight lasts.
pub const HIGHLIGHT_DURATION: Duration = Duration::from_millis(1000);

/// Animation applied while highlighted.
pub const HIGHLIGHT_ANIMATION: &str = "executeHighlight 1000ms";

/// Where the node sits inside the cell's input area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    /// Inside the editor widget (left/right positioning).
    Editor,
    /// Directly under the input area's parent (hover positioning).
    InputArea,
}

impl Container {
    pub fn as_str(&self) -> &'static str {
        match self {
            Container::Editor => "editor",
            Container::InputArea => "input-area",
        }
    }
}

impl From<Positioning> for Container {
    fn from(positioning: Positioning) -> Self {
        match positioning {
            Positioning::Left | Positioning::Right => Container::Editor,
            Positioning::Hover => Container::InputArea,
        }
    }
}

/// Handler invoked when the node is clicked.
pub type ClickHandler = Arc<dyn Fn() + Send + Sync>;

#[derive(Clone, Default)]
pub struct AnnotationNode {
    classes: Vec<String>,
    prev_execution_time: Option<String>,
    history: VecDeque<String>,
    text: String,
    live_text: String,
    animation: Option<&'static str>,
    highlight_epoch: u64,
    parent: Option<Container>,
    on_click: Option<ClickHandler>,
}

impl AnnotationNode {
    pub fn new() -> Self {
        Self {
            classes: vec![EXECUTE_TIME_CLASS.to_string()],
            ..Self::default()
        }
    }

    // ── Classes ─────────────────────────────────────────────────────

    /// Replace the class list with the base, positioning and contrast classes.
    ///
    /// This also drops [`HIDDEN_CLASS`].
    pub fn apply_classes(&mut self, positioning: Positioning, contrast: TextContrast) {
        self.classes = vec![
            EXECUTE_TIME_CLASS.to_string(),
            format!("{EXECUTE_TIME_CLASS}-positioning-{positioning}"),
            format!("{EXECUTE_TIME_CLASS}-contrast-{contrast}"),
        ];
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes.iter().any(|c| c == class)
    }

    /// Space-separated class attribute, as a frontend would write it.
    pub fn class_name(&self) -> String {
        self.classes.join(" ")
    }

    pub fn hide(&mut self) {
        if !self.is_hidden() {
            self.classes.push(HIDDEN_CLASS.to_string());
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.has_class(HIDDEN_CLASS)
    }

    // ── Text ────────────────────────────────────────────────────────

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }

    /// Secondary slot used for the live elapsed time.
    pub fn live_text(&self) -> &str {
        &self.live_text
    }

    pub fn set_live_text(&mut self, text: impl Into<String>) {
        self.live_text = text.into();
    }

    // ── History ─────────────────────────────────────────────────────

    /// Last completed duration (the `data-prev-execution-time` attribute).
    pub fn prev_execution_time(&self) -> Option<&str> {
        self.prev_execution_time.as_deref()
    }

    /// Durations before the last one, most recent first.
    pub fn history(&self) -> impl Iterator<Item = &str> {
        self.history.iter().map(String::as_str)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Tooltip text, absent until there is some history to show.
    pub fn tooltip(&self) -> Option<String> {
        if self.history.is_empty() {
            return None;
        }
        let mut tooltip = TOOLTIP_PREFIX.to_string();
        for entry in &self.history {
            tooltip.push('\n');
            tooltip.push_str(entry);
        }
        Some(tooltip)
    }

    /// Store a newly completed duration.
    ///
    /// The previous duration moves to the front of the history, which is then
    /// cut down to `history_count` entries. With `history_count == 0` nothing
    /// is pushed.
    pub fn record_execution_time(&mut self, duration: String, history_count: usize) {
        if let Some(previous) = self.prev_execution_time.replace(duration) {
            if history_count > 0 {
                self.history.push_front(previous);
            }
        }
        self.history.truncate(history_count);
    }

    // ── Highlight ───────────────────────────────────────────────────

    pub fn animation(&self) -> Option<&'static str> {
        self.animation
    }

    /// Start the highlight animation, returning its epoch.
    pub fn start_highlight(&mut self) -> u64 {
        self.highlight_epoch += 1;
        self.animation = Some(HIGHLIGHT_ANIMATION);
        self.highlight_epoch
    }

    /// Clear the highlight if no newer one was started since `epoch`.
    pub fn clear_highlight(&mut self, epoch: u64) -> bool {
        if self.highlight_epoch != epoch {
            return false;
        }
        self.animation = None;
        true
    }

    // ── Placement ───────────────────────────────────────────────────

    pub fn parent(&self) -> Option<Container> {
        self.parent
    }

    pub fn is_attached(&self) -> bool {
        self.parent.is_some()
    }

    /// Move the node under `parent` (or detach it with `None`).
    /// Returns true if the node actually moved.
    pub fn relocate(&mut self, parent: Option<Container>) -> bool {
        if self.parent == parent {
            return false;
        }
        self.parent = parent;
        true
    }

    // ── Activation ──────────────────────────────────────────────────

    pub fn set_on_click(&mut self, handler: ClickHandler) {
        self.on_click = Some(handler);
    }

    /// Simulate a click. Returns false if no handler is attached.
    pub fn click(&self) -> bool {
        match &self.on_click {
            Some(handler) => {
                handler();
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for AnnotationNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnnotationNode")
            .field("classes", &self.classes)
            .field("text", &self.text)
            .field("live_text", &self.live_text)
            .field("prev_execution_time", &self.prev_execution_time)
            .field("history", &self.history)
            .field("animation", &self.animation)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_node_has_base_class_only() {
        let node = AnnotationNode::new();
        assert_eq!(node.class_name(), "execute-time");
        assert!(!node.is_attached());
        assert!(node.tooltip().is_none());
    }

    #[test]
    fn test_apply_classes_uses_stable_names_and_unhides() {
        let mut node = AnnotationNode::new();
        node.hide();
        assert!(node.is_hidden());

        node.apply_classes(Positioning::Hover, TextContrast::Low);

        assert_eq!(
            node.class_name(),
            "execute-time execute-time-positioning-hover execute-time-contrast-low"
        );
        assert!(!node.is_hidden());
    }

    #[test]
    fn test_hide_is_idempotent() {
        let mut node = AnnotationNode::new();
        node.hide();
        node.hide();
        assert_eq!(node.classes().len(), 2);
    }

    #[test]
    fn test_history_keeps_most_recent_first_and_caps() {
        let mut node = AnnotationNode::new();
        for i in 1..=6 {
            node.record_execution_time(format!("{i}.00s"), 3);
        }

        assert_eq!(node.prev_execution_time(), Some("6.00s"));
        assert_eq!(
            node.history().collect::<Vec<_>>(),
            vec!["5.00s", "4.00s", "3.00s"]
        );
        assert_eq!(
            node.tooltip().unwrap(),
            "Previous Runs:\n5.00s\n4.00s\n3.00s"
        );
    }

    #[test]
    fn test_history_count_zero_keeps_only_last() {
        let mut node = AnnotationNode::new();
        node.record_execution_time("1.00s".into(), 0);
        node.record_execution_time("2.00s".into(), 0);

        assert_eq!(node.prev_execution_time(), Some("2.00s"));
        assert_eq!(node.history_len(), 0);
        assert!(node.tooltip().is_none());
    }

    #[test]
    fn test_shrinking_history_count_truncates() {
        let mut node = AnnotationNode::new();
        for i in 1..=5 {
            node.record_execution_time(format!("{i}ms"), 5);
        }
        assert_eq!(node.history_len(), 4);

        node.record_execution_time("6ms".into(), 2);
        assert_eq!(node.history().collect::<Vec<_>>(), vec!["5ms", "4ms"]);
    }

    #[test]
    fn test_stale_highlight_clear_is_ignored() {
        let mut node = AnnotationNode::new();
        let first = node.start_highlight();
        let second = node.start_highlight();

        assert!(!node.clear_highlight(first));
        assert_eq!(node.animation(), Some(HIGHLIGHT_ANIMATION));
        assert!(node.clear_highlight(second));
        assert_eq!(node.animation(), None);
    }

    #[test]
    fn test_relocate_reports_moves() {
        let mut node = AnnotationNode::new();
        assert!(node.relocate(Some(Container::Editor)));
        assert!(!node.relocate(Some(Container::Editor)));
        assert!(node.relocate(Some(Container::InputArea)));
        assert!(node.relocate(None));
        assert!(!node.is_attached());
    }

    #[test]
    fn test_container_for_positioning() {
        assert_eq!(Container::from(Positioning::Left), Container::Editor);
        assert_eq!(Container::from(Positioning::Right), Container::Editor);
        assert_eq!(Container::from(Positioning::Hover), Container::InputArea);
    }
}
