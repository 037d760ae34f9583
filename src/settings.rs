//! Settings JSON: load/merge/save against a defaults template.
//!
//! Ported from `original_source/src/utils/json_utils.py`'s `json_load`/
//! `merge_json`/`json_save` plus `original_source/src/config/settings.py`'s
//! schema. Unlike the Python original (duck-typed `dict` merged against a
//! `dict` template at runtime), this merges `serde_json::Value` trees
//! against a template built from `SettingsFile::default()`, then
//! deserializes the merged tree back into the typed struct — same net
//! effect (strip unknown keys, fix mismatched types, fill missing keys),
//! but the typed struct is still the thing the rest of the core reads from.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::benefit::BenefitType;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InventoryFilters {
    pub show_active: bool,
    pub show_not_linked: bool,
    pub show_upcoming: bool,
    pub show_expired: bool,
    pub show_finished: bool,
    pub show_benefit_item: bool,
    pub show_benefit_badge: bool,
    pub show_benefit_emote: bool,
    pub show_benefit_other: bool,
    pub game_name_search: Vec<String>,
}

impl Default for InventoryFilters {
    fn default() -> Self {
        Self {
            show_active: false,
            show_not_linked: true,
            show_upcoming: true,
            show_expired: false,
            show_finished: false,
            show_benefit_item: true,
            show_benefit_badge: true,
            show_benefit_emote: true,
            show_benefit_other: true,
            game_name_search: Vec::new(),
        }
    }
}

/// The persisted settings file schema. Fields here round-trip even where the
/// mining core itself doesn't consume them (`language`, `dark_mode`) — the
/// web/i18n layers that do are out of this core's scope, but the schema is
/// still the core's to load/merge/save.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SettingsFile {
    pub proxy: String,
    pub language: String,
    pub dark_mode: bool,
    pub games_to_watch: Vec<String>,
    pub connection_quality: i32,
    pub minimum_refresh_interval_minutes: u32,
    pub skip_badge_only_drops: bool,
    pub inventory_filters: InventoryFilters,
    pub mining_benefits: HashMap<BenefitType, bool>,
}

impl Default for SettingsFile {
    fn default() -> Self {
        let mut mining_benefits = HashMap::new();
        mining_benefits.insert(BenefitType::Badge, true);
        mining_benefits.insert(BenefitType::Emote, true);
        mining_benefits.insert(BenefitType::DirectEntitlement, true);
        mining_benefits.insert(BenefitType::Unknown, true);
        Self {
            proxy: String::new(),
            language: "English".to_string(),
            dark_mode: false,
            games_to_watch: Vec::new(),
            connection_quality: 1,
            minimum_refresh_interval_minutes: 30,
            skip_badge_only_drops: false,
            inventory_filters: InventoryFilters::default(),
            mining_benefits,
        }
    }
}

/// Owns the in-memory settings plus the "has anything changed since load"
/// flag that gates `save()`, mirroring `Settings._altered`.
pub struct Settings {
    path: PathBuf,
    file: SettingsFile,
    altered: bool,
}

impl Settings {
    /// Load from `path`, merging against [`SettingsFile::default`] the way
    /// `merge_json` reconciles a loaded object against a template: strip
    /// keys the template doesn't recognise, overwrite type-mismatched
    /// values, recurse into nested objects, fill missing keys.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let file = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(loaded) => {
                    let template = serde_json::to_value(SettingsFile::default())
                        .expect("SettingsFile always serializes");
                    let merged = merge_json(loaded, &template);
                    serde_json::from_value(merged).unwrap_or_default()
                }
                Err(e) => {
                    tracing::warn!("settings file at {:?} is not valid JSON, using defaults: {}", path, e);
                    SettingsFile::default()
                }
            },
            Err(_) => SettingsFile::default(),
        };
        Self { path, file, altered: false }
    }

    pub fn get(&self) -> &SettingsFile {
        &self.file
    }

    /// Mutate the settings, marking them altered so `save()` writes them.
    pub fn modify(&mut self, f: impl FnOnce(&mut SettingsFile)) {
        f(&mut self.file);
        self.altered = true;
    }

    pub fn alter(&mut self) {
        self.altered = true;
    }

    /// Write to disk only if something changed since load, unless `force`.
    pub fn save(&self, force: bool) -> Result<(), crate::error::MinerError> {
        if !self.altered && !force {
            return Ok(());
        }
        let pretty = serde_json::to_string_pretty(&self.file)
            .map_err(|e| crate::error::MinerError::Settings(e.to_string()))?;
        std::fs::write(&self.path, pretty).map_err(|e| crate::error::MinerError::Settings(e.to_string()))?;
        Ok(())
    }
}

/// Recursively reconcile `obj` against `template`: drop unknown keys,
/// replace type-mismatched values with the template's, recurse into nested
/// objects, then fill any key present in `template` but missing from `obj`.
/// Ported from `json_utils.merge_json`, expressed as a pure function over
/// owned `Value`s rather than Python's in-place dict mutation.
fn merge_json(obj: Value, template: &Value) -> Value {
    let (Value::Object(mut obj), Value::Object(template)) = (obj, template.clone()) else {
        return template.clone();
    };

    let keys: Vec<String> = obj.keys().cloned().collect();
    for k in keys {
        match template.get(&k) {
            None => {
                obj.remove(&k);
            }
            Some(tv) => {
                let v = obj.get(&k).unwrap().clone();
                if std::mem::discriminant(&json_kind(&v)) != std::mem::discriminant(&json_kind(tv)) {
                    obj.insert(k, tv.clone());
                } else if v.is_object() {
                    obj.insert(k, merge_json(v, tv));
                }
            }
        }
    }
    for (k, tv) in template.iter() {
        if !obj.contains_key(k) {
            obj.insert(k.clone(), tv.clone());
        }
    }
    Value::Object(obj)
}

/// Coarse type-tag used for the "type mismatch" check in [`merge_json`];
/// `Number`/`Null` aside, this mirrors Python's `type(v) is not type(t)`.
fn json_kind(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_strips_unknown_keys_and_fills_missing() {
        let template = serde_json::json!({"a": 1, "b": "x"});
        let obj = serde_json::json!({"a": 2, "c": "unknown"});
        let merged = merge_json(obj, &template);
        assert_eq!(merged["a"], 2);
        assert_eq!(merged["b"], "x");
        assert!(merged.get("c").is_none());
    }

    #[test]
    fn merge_overwrites_type_mismatches_from_template() {
        let template = serde_json::json!({"a": 1});
        let obj = serde_json::json!({"a": "not a number"});
        let merged = merge_json(obj, &template);
        assert_eq!(merged["a"], 1);
    }

    #[test]
    fn merge_recurses_into_nested_objects() {
        let template = serde_json::json!({"nested": {"x": 1, "y": 2}});
        let obj = serde_json::json!({"nested": {"x": 5, "z": "gone"}});
        let merged = merge_json(obj, &template);
        assert_eq!(merged["nested"]["x"], 5);
        assert_eq!(merged["nested"]["y"], 2);
        assert!(merged["nested"].get("z").is_none());
    }

    #[test]
    fn load_save_roundtrip_is_stable_after_defaulting() {
        let path = std::env::temp_dir().join(format!("settings-test-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let mut settings = Settings::load(&path);
        settings.modify(|s| s.games_to_watch.push("Alpha".to_string()));
        settings.save(true).unwrap();

        let reloaded = Settings::load(&path);
        assert_eq!(reloaded.get().games_to_watch, vec!["Alpha".to_string()]);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn save_is_a_noop_unless_altered_or_forced() {
        let path = std::env::temp_dir().join(format!("settings-test-noop-{}.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let settings = Settings::load(&path);
        settings.save(false).unwrap();
        assert!(!path.exists());
    }
}
