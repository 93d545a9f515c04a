//! Per-widget preference blobs stored under `simwidget-<widget>-settings`.
//!
//! Tabs write the whole blob on every save without locking; when two tabs save
//! the same widget the last writer wins.

use crate::storage::{StorageError, StorageHandle};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use thiserror::Error;
use tracing::debug;

pub const SETTINGS_KEY_PREFIX: &str = "simwidget-";

pub fn settings_key(widget_id: &str) -> String {
    format!("{SETTINGS_KEY_PREFIX}{widget_id}-settings")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Toggle(bool),
    Slider(f64),
    Choice(String),
}

impl SettingValue {
    fn kind(&self) -> &'static str {
        match self {
            SettingValue::Toggle(_) => "toggle",
            SettingValue::Slider(_) => "slider",
            SettingValue::Choice(_) => "choice",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SettingsError {
    #[error("unknown setting: {0}")]
    Unknown(String),
    #[error("setting {name} expects a {expected} value")]
    WrongKind { name: String, expected: &'static str },
    #[error("setting {name} out of range: {value}")]
    OutOfRange { name: String, value: f64 },
    #[error("setting {name} has no option {value:?}")]
    InvalidChoice { name: String, value: String },
}

#[derive(Debug, Clone)]
enum Field {
    Slider {
        default: f64,
        range: RangeInclusive<f64>,
    },
    Toggle {
        default: bool,
    },
    Choice {
        default: String,
        options: Vec<String>,
    },
}

impl Field {
    fn default_value(&self) -> SettingValue {
        match self {
            Field::Slider { default, .. } => SettingValue::Slider(*default),
            Field::Toggle { default } => SettingValue::Toggle(*default),
            Field::Choice { default, .. } => SettingValue::Choice(default.clone()),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Field::Slider { .. } => "slider",
            Field::Toggle { .. } => "toggle",
            Field::Choice { .. } => "choice",
        }
    }

    /// Accepts a saved value, clamping sliders; `None` means fall back to the default.
    fn restore(&self, raw: &Value) -> Option<SettingValue> {
        match self {
            Field::Slider { range, .. } => raw
                .as_f64()
                .map(|v| SettingValue::Slider(v.clamp(*range.start(), *range.end()))),
            Field::Toggle { .. } => raw.as_bool().map(SettingValue::Toggle),
            Field::Choice { options, .. } => raw
                .as_str()
                .filter(|v| options.is_empty() || options.iter().any(|o| o == v))
                .map(|v| SettingValue::Choice(v.to_string())),
        }
    }

    fn check(&self, name: &str, value: &SettingValue) -> Result<(), SettingsError> {
        match (self, value) {
            (Field::Slider { range, .. }, SettingValue::Slider(v)) => {
                if range.contains(v) {
                    Ok(())
                } else {
                    Err(SettingsError::OutOfRange {
                        name: name.to_string(),
                        value: *v,
                    })
                }
            }
            (Field::Toggle { .. }, SettingValue::Toggle(_)) => Ok(()),
            (Field::Choice { options, .. }, SettingValue::Choice(v)) => {
                if options.is_empty() || options.contains(v) {
                    Ok(())
                } else {
                    Err(SettingsError::InvalidChoice {
                        name: name.to_string(),
                        value: v.clone(),
                    })
                }
            }
            _ => Err(SettingsError::WrongKind {
                name: name.to_string(),
                expected: self.kind(),
            }),
        }
    }
}

/// Declares the settings a widget exposes and their defaults.
#[derive(Debug, Clone, Default)]
pub struct SettingsSchema {
    fields: BTreeMap<String, Field>,
}

impl SettingsSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slider(mut self, name: &str, default: f64, range: RangeInclusive<f64>) -> Self {
        self.fields
            .insert(name.to_string(), Field::Slider { default, range });
        self
    }

    pub fn toggle(mut self, name: &str, default: bool) -> Self {
        self.fields.insert(name.to_string(), Field::Toggle { default });
        self
    }

    /// An empty `options` list accepts any string.
    pub fn choice(mut self, name: &str, default: &str, options: &[&str]) -> Self {
        self.fields.insert(
            name.to_string(),
            Field::Choice {
                default: default.to_string(),
                options: options.iter().map(|o| o.to_string()).collect(),
            },
        );
        self
    }

    fn defaults(&self) -> BTreeMap<String, SettingValue> {
        self.fields
            .iter()
            .map(|(name, field)| (name.clone(), field.default_value()))
            .collect()
    }
}

pub struct WidgetSettings {
    widget_id: String,
    schema: SettingsSchema,
    values: BTreeMap<String, SettingValue>,
    storage: StorageHandle,
}

impl WidgetSettings {
    /// Saved values whose kind no longer matches the schema are replaced by
    /// the default; unknown saved keys are dropped on the next save.
    pub fn load(widget_id: &str, schema: SettingsSchema, storage: StorageHandle) -> Self {
        let mut values = schema.defaults();
        if let Some(saved) = storage.get_json::<Map<String, Value>>(&settings_key(widget_id)) {
            for (name, field) in &schema.fields {
                let Some(raw) = saved.get(name) else {
                    continue;
                };
                match field.restore(raw) {
                    Some(value) => {
                        values.insert(name.clone(), value);
                    }
                    None => {
                        debug!(event = "setting_discarded", widget = widget_id, setting = %name);
                    }
                }
            }
        }
        Self {
            widget_id: widget_id.to_string(),
            schema,
            values,
            storage,
        }
    }

    pub fn widget_id(&self) -> &str {
        &self.widget_id
    }

    pub fn save(&self) -> Result<(), StorageError> {
        self.storage.set_json(&settings_key(&self.widget_id), &self.values)
    }

    pub fn get(&self, name: &str) -> Option<&SettingValue> {
        self.values.get(name)
    }

    pub fn slider(&self, name: &str) -> Option<f64> {
        match self.values.get(name) {
            Some(SettingValue::Slider(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn toggle(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(SettingValue::Toggle(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn choice(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(SettingValue::Choice(v)) => Some(v.as_str()),
            _ => None,
        }
    }

    /// Updates the in-memory value; call `save` to persist.
    pub fn set(&mut self, name: &str, value: SettingValue) -> Result<(), SettingsError> {
        let field = self
            .schema
            .fields
            .get(name)
            .ok_or_else(|| SettingsError::Unknown(name.to_string()))?;
        field.check(name, &value)?;
        debug!(
            event = "setting_changed",
            widget = %self.widget_id,
            setting = name,
            kind = value.kind()
        );
        self.values.insert(name.to_string(), value);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.values = self.schema.defaults();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SharedStorage;
    use serde_json::json;

    fn schema() -> SettingsSchema {
        SettingsSchema::new()
            .slider("opacity", 0.9, 0.1..=1.0)
            .toggle("compact", false)
            .choice("theme", "default", &["default", "night", "retro"])
    }

    #[test]
    fn defaults_when_nothing_saved() {
        let storage = SharedStorage::in_memory();
        let settings = WidgetSettings::load("fuel", schema(), storage.tab());
        assert_eq!(settings.slider("opacity"), Some(0.9));
        assert_eq!(settings.toggle("compact"), Some(false));
        assert_eq!(settings.choice("theme"), Some("default"));
    }

    #[test]
    fn saved_values_survive_a_reload_in_another_tab() {
        let storage = SharedStorage::in_memory();
        let mut settings = WidgetSettings::load("fuel", schema(), storage.tab());
        settings.set("theme", SettingValue::Choice("night".into())).expect("theme");
        settings.set("compact", SettingValue::Toggle(true)).expect("compact");
        settings.save().expect("save");

        let other = WidgetSettings::load("fuel", schema(), storage.tab());
        assert_eq!(other.choice("theme"), Some("night"));
        assert_eq!(other.toggle("compact"), Some(true));
        assert_eq!(other.slider("opacity"), Some(0.9));

        let raw: Value = storage.tab().get_json("simwidget-fuel-settings").expect("blob");
        assert_eq!(raw["theme"], json!("night"));
    }

    #[test]
    fn mismatched_saved_kinds_fall_back_to_defaults() {
        let storage = SharedStorage::in_memory();
        storage
            .tab()
            .set_json(
                "simwidget-fuel-settings",
                &json!({"opacity": "loud", "compact": true, "theme": "neon", "legacy": 3}),
            )
            .expect("seed");

        let settings = WidgetSettings::load("fuel", schema(), storage.tab());
        assert_eq!(settings.slider("opacity"), Some(0.9));
        assert_eq!(settings.toggle("compact"), Some(true));
        assert_eq!(settings.choice("theme"), Some("default"));
        assert!(settings.get("legacy").is_none());
    }

    #[test]
    fn saved_slider_is_clamped() {
        let storage = SharedStorage::in_memory();
        storage
            .tab()
            .set_json("simwidget-fuel-settings", &json!({"opacity": 4.0}))
            .expect("seed");
        let settings = WidgetSettings::load("fuel", schema(), storage.tab());
        assert_eq!(settings.slider("opacity"), Some(1.0));
    }

    #[test]
    fn set_is_type_checked() {
        let storage = SharedStorage::in_memory();
        let mut settings = WidgetSettings::load("fuel", schema(), storage.tab());
        assert_eq!(
            settings.set("compact", SettingValue::Slider(1.0)),
            Err(SettingsError::WrongKind {
                name: "compact".into(),
                expected: "toggle"
            })
        );
        assert!(matches!(
            settings.set("opacity", SettingValue::Slider(0.0)),
            Err(SettingsError::OutOfRange { .. })
        ));
        assert!(matches!(
            settings.set("theme", SettingValue::Choice("neon".into())),
            Err(SettingsError::InvalidChoice { .. })
        ));
        assert_eq!(
            settings.set("volume", SettingValue::Slider(0.5)),
            Err(SettingsError::Unknown("volume".into()))
        );
    }

    #[test]
    fn reset_restores_defaults_without_saving() {
        let storage = SharedStorage::in_memory();
        let mut settings = WidgetSettings::load("fuel", schema(), storage.tab());
        settings.set("opacity", SettingValue::Slider(0.5)).expect("opacity");
        settings.save().expect("save");
        settings.reset();
        assert_eq!(settings.slider("opacity"), Some(0.9));

        let reloaded = WidgetSettings::load("fuel", schema(), storage.tab());
        assert_eq!(reloaded.slider("opacity"), Some(0.5));
    }
}
