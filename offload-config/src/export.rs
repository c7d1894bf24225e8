//! Settings interchange: a flat `category.key=value` text form and a
//! structured JSON tree. Both walk the declared catalog, so unknown keys in
//! an imported payload are skipped (with a warning) rather than stored blind.

use std::collections::BTreeMap;

use chrono::Utc;
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::entry::EntryDescriptor;
use crate::registry::SettingsRegistry;
use crate::{ConfigError, Result, settings};

const EXPORT_VERSION: u32 = 1;

fn descriptor_for(category: &str, key: &str) -> Option<&'static dyn EntryDescriptor> {
    settings::descriptors()
        .into_iter()
        .find(|d| d.category() == category && d.key() == key)
}

/// Render every entry as `category.key=value` plus a
/// `category.key.description=text` line, grouped by category.
pub fn export_text(registry: &SettingsRegistry) -> String {
    let mut out = String::new();
    let mut current_category = "";
    for descriptor in settings::descriptors() {
        if descriptor.category() != current_category {
            if !out.is_empty() {
                out.push('\n');
            }
            current_category = descriptor.category();
        }
        let value = registry
            .get_raw(descriptor.key())
            .unwrap_or_else(|| descriptor.default());
        out.push_str(&format!(
            "{}.{}={}\n{}.{}.description={}\n",
            descriptor.category(),
            descriptor.key(),
            value.render(),
            descriptor.category(),
            descriptor.key(),
            descriptor.description(),
        ));
    }
    out
}

/// Apply a text export. Returns the number of entries applied. Description
/// lines, comments and unknown keys are skipped.
pub fn import_text(registry: &SettingsRegistry, text: &str) -> Result<usize> {
    let mut applied = 0;
    for (line_no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((qualified, raw)) = line.split_once('=') else {
            return Err(ConfigError::InvalidFormat(format!(
                "line {}: missing '='",
                line_no + 1
            )));
        };
        if qualified.ends_with(".description") {
            continue;
        }
        let Some((category, key)) = qualified.split_once('.') else {
            return Err(ConfigError::InvalidFormat(format!(
                "line {}: expected category.key",
                line_no + 1
            )));
        };
        let Some(descriptor) = descriptor_for(category.trim(), key.trim()) else {
            warn!(key = qualified, "unknown settings key in import, skipping");
            continue;
        };
        match descriptor.default().parse_same_kind(raw) {
            Some(value) => {
                registry.set_raw(descriptor.key(), value);
                applied += 1;
            }
            None => {
                warn!(
                    key = qualified,
                    value = raw,
                    "settings value does not fit declared type, skipping"
                );
            }
        }
    }
    Ok(applied)
}

/// Structured export: `{version, exportDate, categories:{cat:{key:{...}}}}`.
pub fn export_json(registry: &SettingsRegistry) -> Value {
    let mut categories: BTreeMap<&str, Map<String, Value>> = BTreeMap::new();
    for descriptor in settings::descriptors() {
        let value = registry
            .get_raw(descriptor.key())
            .unwrap_or_else(|| descriptor.default());
        categories.entry(descriptor.category()).or_default().insert(
            descriptor.key().to_string(),
            json!({
                "description": descriptor.description(),
                "value": value.to_json(),
                "default": descriptor.default().to_json(),
            }),
        );
    }
    json!({
        "version": EXPORT_VERSION,
        "exportDate": Utc::now().to_rfc3339(),
        "categories": categories,
    })
}

/// Apply a structured export. Returns the number of entries applied.
pub fn import_json(registry: &SettingsRegistry, payload: &Value) -> Result<usize> {
    let categories = payload
        .get("categories")
        .and_then(Value::as_object)
        .ok_or_else(|| ConfigError::InvalidFormat("missing categories object".into()))?;

    let mut applied = 0;
    for (category, entries) in categories {
        let Some(entries) = entries.as_object() else {
            return Err(ConfigError::InvalidFormat(format!(
                "category {category} is not an object"
            )));
        };
        for (key, body) in entries {
            let Some(descriptor) = descriptor_for(category, key) else {
                warn!(category, key, "unknown settings key in import, skipping");
                continue;
            };
            let Some(value) = body.get("value") else {
                continue;
            };
            match descriptor.default().from_json_same_kind(value) {
                Some(value) => {
                    registry.set_raw(descriptor.key(), value);
                    applied += 1;
                }
                None => {
                    warn!(
                        category,
                        key, "settings value does not fit declared type, skipping"
                    );
                }
            }
        }
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SettingsRegistry;

    #[test]
    fn text_export_import_preserves_values() {
        let source = SettingsRegistry::new();
        source.set(&settings::RETRY_COUNT, 9);
        source.set(&settings::FILE_FILTER_INCLUDE_HIDDEN, true);
        source.set(
            &settings::SUFFIX_FILTER_WHITELIST,
            vec!["pdf".to_string(), "png".to_string()],
        );

        let text = export_text(&source);
        let target = SettingsRegistry::new();
        let applied = import_text(&target, &text).unwrap();
        assert_eq!(applied, settings::descriptors().len());

        assert_eq!(target.get(&settings::RETRY_COUNT), 9);
        assert!(target.get(&settings::FILE_FILTER_INCLUDE_HIDDEN));
        assert_eq!(
            target.get(&settings::SUFFIX_FILTER_WHITELIST),
            vec!["pdf", "png"]
        );
    }

    #[test]
    fn json_export_import_preserves_values() {
        let source = SettingsRegistry::new();
        source.set(&settings::STORAGE_MAX_BYTES, 123_456_789);
        source.set(&settings::SUFFIX_FILTER_MODE, "WHITELIST".to_string());

        let payload = export_json(&source);
        assert_eq!(payload["version"], 1);

        let target = SettingsRegistry::new();
        import_json(&target, &payload).unwrap();
        assert_eq!(target.get(&settings::STORAGE_MAX_BYTES), 123_456_789);
        assert_eq!(target.get(&settings::SUFFIX_FILTER_MODE), "WHITELIST");
    }

    #[test]
    fn import_text_skips_unknown_keys() {
        let registry = SettingsRegistry::new();
        let applied = import_text(
            &registry,
            "nonsense.key=1\nscheduler.retry_count=4\n# comment\n",
        )
        .unwrap();
        assert_eq!(applied, 1);
        assert_eq!(registry.get(&settings::RETRY_COUNT), 4);
    }

    #[test]
    fn import_text_rejects_lines_without_assignment() {
        let registry = SettingsRegistry::new();
        assert!(import_text(&registry, "scheduler.retry_count").is_err());
    }

    #[test]
    fn import_json_requires_categories() {
        let registry = SettingsRegistry::new();
        assert!(import_json(&registry, &json!({"version": 1})).is_err());
    }
}
