//! Resolved execute-time settings.
//!
//! The settings source hands us raw JSON (whatever the user typed into their
//! settings file). [`SettingsState::apply_update`] coerces each field, falls
//! back to defaults for anything unusable and compiles `dateFormat` once, so
//! the renderer always sees a consistent [`SettingsSnapshot`].

use std::fmt;
use std::sync::Arc;

use log::{info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::formatters::{DatePattern, DEFAULT_DATE_FORMAT};

/// Where the annotation is drawn relative to the cell input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Positioning {
    #[default]
    Left,
    Right,
    Hover,
}

impl fmt::Display for Positioning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Positioning::Left => write!(f, "left"),
            Positioning::Right => write!(f, "right"),
            Positioning::Hover => write!(f, "hover"),
        }
    }
}

/// Text contrast of the annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TextContrast {
    #[default]
    High,
    Medium,
    Low,
}

impl fmt::Display for TextContrast {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TextContrast::High => write!(f, "high"),
            TextContrast::Medium => write!(f, "medium"),
            TextContrast::Low => write!(f, "low"),
        }
    }
}

/// User-facing settings, in the shape of the settings file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", default)]
#[schemars(title = "Execute Time", description = "Settings for the execute-time annotations")]
pub struct ExecuteTimeSettings {
    /// Display cell timing.
    pub enabled: bool,
    /// Highlight the annotation briefly when a cell finishes.
    pub highlight: bool,
    /// Where to draw the annotation.
    pub positioning: Positioning,
    /// Hide durations shorter than this many seconds.
    #[schemars(range(min = 0))]
    pub min_time: f64,
    /// Text contrast of the annotation.
    pub text_contrast: TextContrast,
    /// Tick the elapsed time while a cell is running.
    pub show_live_execution_time: bool,
    /// Include the completion date in the message.
    pub show_date: bool,
    /// Number of previous durations kept in the tooltip.
    pub history_count: usize,
    /// date-fns style pattern for timestamps.
    pub date_format: String,
}

impl Default for ExecuteTimeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            highlight: true,
            positioning: Positioning::Left,
            min_time: 0.0,
            text_contrast: TextContrast::High,
            show_live_execution_time: true,
            show_date: true,
            history_count: 5,
            date_format: DEFAULT_DATE_FORMAT.to_string(),
        }
    }
}

/// Receives warnings meant for the user (e.g. a bad `dateFormat`).
///
/// Implement this to route warnings to a notification area; [`LogWarnings`]
/// just logs them.
pub trait WarningSink: Send + Sync {
    fn show_warning(&self, title: &str, message: &str);
}

/// Log-only warning sink.
pub struct LogWarnings;

impl WarningSink for LogWarnings {
    fn show_warning(&self, title: &str, message: &str) {
        warn!("[settings] {title}: {message}");
    }
}

/// Settings plus the compiled date pattern, as read by the renderer.
#[derive(Debug, Clone, Default)]
pub struct SettingsSnapshot {
    pub settings: ExecuteTimeSettings,
    pub date_pattern: DatePattern,
}

/// Effect of one settings update on the `enabled` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SettingsTransition {
    pub was_enabled: bool,
    pub enabled: bool,
}

impl SettingsTransition {
    pub fn became_enabled(&self) -> bool {
        !self.was_enabled && self.enabled
    }

    pub fn became_disabled(&self) -> bool {
        self.was_enabled && !self.enabled
    }
}

/// The current resolved settings.
pub struct SettingsState {
    current: SettingsSnapshot,
    /// Invalid pattern we last warned about; cleared once a valid one lands.
    warned_format: Option<String>,
    warnings: Arc<dyn WarningSink>,
}

impl SettingsState {
    pub fn new(warnings: Arc<dyn WarningSink>) -> Self {
        Self {
            current: SettingsSnapshot::default(),
            warned_format: None,
            warnings,
        }
    }

    pub fn settings(&self) -> &ExecuteTimeSettings {
        &self.current.settings
    }

    pub fn date_pattern(&self) -> &DatePattern {
        &self.current.date_pattern
    }

    pub fn snapshot(&self) -> SettingsSnapshot {
        self.current.clone()
    }

    /// Re-derive the settings from a raw settings value.
    ///
    /// Missing or unusable fields take their defaults. An invalid `dateFormat`
    /// falls back to [`DEFAULT_DATE_FORMAT`] and warns the user once per
    /// distinct invalid value.
    pub fn apply_update(&mut self, raw: &Value) -> SettingsTransition {
        let defaults = ExecuteTimeSettings::default();
        let was_enabled = self.current.settings.enabled;

        let requested_format = read_string(raw, "dateFormat", &defaults.date_format);
        let (date_format, date_pattern) = match DatePattern::parse(&requested_format) {
            Ok(pattern) => {
                self.warned_format = None;
                (requested_format, pattern)
            }
            Err(e) => {
                if self.warned_format.as_deref() != Some(requested_format.as_str()) {
                    self.warnings.show_warning(
                        "Invalid date format",
                        &format!(
                            "'{requested_format}' is not a valid date format ({e}); \
                             falling back to '{DEFAULT_DATE_FORMAT}'"
                        ),
                    );
                    self.warned_format = Some(requested_format);
                }
                (DEFAULT_DATE_FORMAT.to_string(), DatePattern::default())
            }
        };

        let settings = ExecuteTimeSettings {
            enabled: read_bool(raw, "enabled", defaults.enabled),
            highlight: read_bool(raw, "highlight", defaults.highlight),
            positioning: read_enum(raw, "positioning", defaults.positioning),
            min_time: read_number(raw, "minTime", defaults.min_time).max(0.0),
            text_contrast: read_enum(raw, "textContrast", defaults.text_contrast),
            show_live_execution_time: read_bool(
                raw,
                "showLiveExecutionTime",
                defaults.show_live_execution_time,
            ),
            show_date: read_bool(raw, "showDate", defaults.show_date),
            history_count: read_count(raw, "historyCount", defaults.history_count),
            date_format,
        };

        let transition = SettingsTransition {
            was_enabled,
            enabled: settings.enabled,
        };
        if transition.became_enabled() {
            info!("[settings] Execute time enabled");
        } else if transition.became_disabled() {
            info!("[settings] Execute time disabled");
        }

        self.current = SettingsSnapshot {
            settings,
            date_pattern,
        };
        transition
    }
}

// ── Field coercion ──────────────────────────────────────────────────

fn field<'a>(raw: &'a Value, key: &str) -> Option<&'a Value> {
    raw.get(key).filter(|v| !v.is_null())
}

fn ignore(key: &str, value: &Value) {
    warn!("[settings] Ignoring invalid value for '{key}': {value}");
}

fn read_bool(raw: &Value, key: &str, default: bool) -> bool {
    match field(raw, key) {
        None => default,
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => true,
        Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => false,
        Some(other) => {
            ignore(key, other);
            default
        }
    }
}

fn read_number(raw: &Value, key: &str, default: f64) -> f64 {
    let parsed = match field(raw, key) {
        None => return default,
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match parsed.filter(|n| n.is_finite()) {
        Some(n) => n,
        None => {
            if let Some(value) = field(raw, key) {
                ignore(key, value);
            }
            default
        }
    }
}

fn read_count(raw: &Value, key: &str, default: usize) -> usize {
    if field(raw, key).is_none() {
        return default;
    }
    let n = read_number(raw, key, default as f64);
    if n <= 0.0 {
        0
    } else {
        n.floor() as usize
    }
}

fn read_string(raw: &Value, key: &str, default: &str) -> String {
    match field(raw, key) {
        None => default.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            ignore(key, other);
            default.to_string()
        }
    }
}

fn read_enum<T>(raw: &Value, key: &str, default: T) -> T
where
    T: serde::de::DeserializeOwned + fmt::Display,
{
    match field(raw, key) {
        None => default,
        Some(value) => match serde_json::from_value::<T>(value.clone()) {
            Ok(parsed) => parsed,
            Err(_) => {
                log::error!(
                    "[settings] {value} is not a valid value for the setting '{key}', using '{default}'"
                );
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingWarnings(Mutex<Vec<String>>);

    impl WarningSink for RecordingWarnings {
        fn show_warning(&self, _title: &str, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    fn state() -> (SettingsState, Arc<RecordingWarnings>) {
        let warnings = Arc::new(RecordingWarnings::default());
        (SettingsState::new(warnings.clone()), warnings)
    }

    #[test]
    fn test_defaults() {
        let settings = ExecuteTimeSettings::default();
        assert!(!settings.enabled);
        assert!(settings.highlight);
        assert_eq!(settings.positioning, Positioning::Left);
        assert_eq!(settings.min_time, 0.0);
        assert_eq!(settings.text_contrast, TextContrast::High);
        assert!(settings.show_live_execution_time);
        assert!(settings.show_date);
        assert_eq!(settings.history_count, 5);
        assert_eq!(settings.date_format, "yyy-MM-dd HH:mm:ss");
    }

    #[test]
    fn test_empty_update_yields_defaults() {
        let (mut state, warnings) = state();
        let transition = state.apply_update(&json!({}));

        assert_eq!(state.settings(), &ExecuteTimeSettings::default());
        assert!(!transition.became_enabled());
        assert!(warnings.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_apply_update_reads_every_field() {
        let (mut state, _) = state();
        state.apply_update(&json!({
            "enabled": true,
            "highlight": false,
            "positioning": "hover",
            "minTime": 1.5,
            "textContrast": "medium",
            "showLiveExecutionTime": false,
            "showDate": false,
            "historyCount": 2,
            "dateFormat": "HH:mm"
        }));

        let s = state.settings();
        assert!(s.enabled);
        assert!(!s.highlight);
        assert_eq!(s.positioning, Positioning::Hover);
        assert_eq!(s.min_time, 1.5);
        assert_eq!(s.text_contrast, TextContrast::Medium);
        assert!(!s.show_live_execution_time);
        assert!(!s.show_date);
        assert_eq!(s.history_count, 2);
        assert_eq!(state.date_pattern().as_str(), "HH:mm");
    }

    #[test]
    fn test_coerces_loose_types() {
        let (mut state, _) = state();
        state.apply_update(&json!({
            "enabled": "true",
            "minTime": "2",
            "historyCount": 3.9,
        }));
        assert!(state.settings().enabled);
        assert_eq!(state.settings().min_time, 2.0);
        assert_eq!(state.settings().history_count, 3);
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let (mut state, _) = state();
        state.apply_update(&json!({
            "enabled": 12,
            "positioning": "diagonal",
            "minTime": -4,
            "historyCount": -1,
            "textContrast": null,
        }));
        let s = state.settings();
        assert!(!s.enabled);
        assert_eq!(s.positioning, Positioning::Left);
        assert_eq!(s.min_time, 0.0);
        assert_eq!(s.history_count, 0);
        assert_eq!(s.text_contrast, TextContrast::High);
    }

    #[test]
    fn test_transitions() {
        let (mut state, _) = state();
        let t = state.apply_update(&json!({"enabled": true}));
        assert!(t.became_enabled());

        let t = state.apply_update(&json!({"enabled": true, "highlight": false}));
        assert!(!t.became_enabled());
        assert!(t.enabled);

        let t = state.apply_update(&json!({"enabled": false}));
        assert!(t.became_disabled());
    }

    #[test]
    fn test_invalid_date_format_falls_back_and_warns_once() {
        let (mut state, warnings) = state();
        state.apply_update(&json!({"dateFormat": "invalid"}));
        state.apply_update(&json!({"dateFormat": "invalid", "highlight": false}));

        assert_eq!(state.settings().date_format, DEFAULT_DATE_FORMAT);
        assert_eq!(state.date_pattern(), &DatePattern::default());
        assert_eq!(warnings.0.lock().unwrap().len(), 1);
        assert!(warnings.0.lock().unwrap()[0].contains("'invalid'"));
    }

    #[test]
    fn test_invalid_date_format_warns_again_after_recovery() {
        let (mut state, warnings) = state();
        state.apply_update(&json!({"dateFormat": "bad"}));
        state.apply_update(&json!({"dateFormat": "HH:mm"}));
        state.apply_update(&json!({"dateFormat": "bad"}));
        state.apply_update(&json!({"dateFormat": "worse"}));

        assert_eq!(warnings.0.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_settings_serde_uses_camel_case() {
        let json = serde_json::to_value(ExecuteTimeSettings::default()).unwrap();
        assert_eq!(json["minTime"], 0.0);
        assert_eq!(json["showLiveExecutionTime"], true);
        assert_eq!(json["positioning"], "left");
        assert_eq!(json["textContrast"], "high");

        let parsed: ExecuteTimeSettings =
            serde_json::from_str(r#"{"enabled": true, "historyCount": 1}"#).unwrap();
        assert!(parsed.enabled);
        assert_eq!(parsed.history_count, 1);
        assert_eq!(parsed.date_format, DEFAULT_DATE_FORMAT);
    }

    #[test]
    fn test_schema_lists_fields() {
        let schema = serde_json::to_value(schemars::schema_for!(ExecuteTimeSettings)).unwrap();
        let properties = schema["properties"].as_object().unwrap();
        for key in [
            "enabled",
            "highlight",
            "positioning",
            "minTime",
            "textContrast",
            "showLiveExecutionTime",
            "showDate",
            "historyCount",
            "dateFormat",
        ] {
            assert!(properties.contains_key(key), "missing {key}");
        }
    }
}
