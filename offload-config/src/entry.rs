use std::fmt;

/// Delimiter used by the flat text format for list values.
pub(crate) const LIST_DELIMITER: char = ';';

/// A dynamically typed settings value.
///
/// The registry stores these; typed access goes through [`ConfigEntry`] so
/// callers never see the enum unless they are writing an import/export layer.
#[derive(Clone, Debug, PartialEq)]
pub enum ConfigValue {
    Int(i32),
    Long(i64),
    Bool(bool),
    Str(String),
    List(Vec<String>),
}

impl ConfigValue {
    /// Render the value in the flat text form (lists joined by `;`).
    pub fn render(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Long(v) => v.to_string(),
            Self::Bool(v) => v.to_string(),
            Self::Str(v) => v.clone(),
            Self::List(items) => items.join(&LIST_DELIMITER.to_string()),
        }
    }

    /// Parse `raw` into the same kind as `self`. Returns `None` when the text
    /// does not fit the kind.
    pub fn parse_same_kind(&self, raw: &str) -> Option<ConfigValue> {
        match self {
            Self::Int(_) => raw.trim().parse::<i32>().ok().map(ConfigValue::Int),
            Self::Long(_) => raw.trim().parse::<i64>().ok().map(ConfigValue::Long),
            Self::Bool(_) => raw.trim().parse::<bool>().ok().map(ConfigValue::Bool),
            Self::Str(_) => Some(ConfigValue::Str(raw.to_string())),
            Self::List(_) => Some(ConfigValue::List(split_list(raw))),
        }
    }

    /// Convert to the JSON representation used by the structured export.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Int(v) => serde_json::Value::from(*v),
            Self::Long(v) => serde_json::Value::from(*v),
            Self::Bool(v) => serde_json::Value::from(*v),
            Self::Str(v) => serde_json::Value::from(v.clone()),
            Self::List(items) => serde_json::Value::from(items.clone()),
        }
    }

    /// Read a JSON value back into the same kind as `self`.
    pub fn from_json_same_kind(&self, value: &serde_json::Value) -> Option<ConfigValue> {
        match self {
            Self::Int(_) => value
                .as_i64()
                .and_then(|v| i32::try_from(v).ok())
                .map(ConfigValue::Int),
            Self::Long(_) => value.as_i64().map(ConfigValue::Long),
            Self::Bool(_) => value.as_bool().map(ConfigValue::Bool),
            Self::Str(_) => value.as_str().map(|s| ConfigValue::Str(s.to_string())),
            Self::List(_) => value.as_array().map(|items| {
                ConfigValue::List(
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect(),
                )
            }),
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

pub(crate) fn split_list(raw: &str) -> Vec<String> {
    raw.split(LIST_DELIMITER)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Rust types that map onto a [`ConfigValue`] kind.
pub trait ConfigKind: Clone + Send + Sync + 'static {
    fn wrap(self) -> ConfigValue;
    fn unwrap(value: &ConfigValue) -> Option<Self>;
}

impl ConfigKind for i32 {
    fn wrap(self) -> ConfigValue {
        ConfigValue::Int(self)
    }
    fn unwrap(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl ConfigKind for i64 {
    fn wrap(self) -> ConfigValue {
        ConfigValue::Long(self)
    }
    fn unwrap(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Long(v) => Some(*v),
            // An int slot is always safe to widen.
            ConfigValue::Int(v) => Some(i64::from(*v)),
            _ => None,
        }
    }
}

impl ConfigKind for bool {
    fn wrap(self) -> ConfigValue {
        ConfigValue::Bool(self)
    }
    fn unwrap(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl ConfigKind for String {
    fn wrap(self) -> ConfigValue {
        ConfigValue::Str(self)
    }
    fn unwrap(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Str(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl ConfigKind for Vec<String> {
    fn wrap(self) -> ConfigValue {
        ConfigValue::List(self)
    }
    fn unwrap(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::List(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// A declared setting: key, category, human description, and typed default.
///
/// Entries are plain statics; the default is a function so non-const defaults
/// (platform paths, built-in lists) stay cheap to declare.
pub struct ConfigEntry<T: ConfigKind> {
    key: &'static str,
    category: &'static str,
    description: &'static str,
    default: fn() -> T,
}

impl<T: ConfigKind> ConfigEntry<T> {
    pub const fn new(
        key: &'static str,
        category: &'static str,
        description: &'static str,
        default: fn() -> T,
    ) -> Self {
        Self {
            key,
            category,
            description,
            default,
        }
    }

    pub fn key(&self) -> &'static str {
        self.key
    }

    pub fn category(&self) -> &'static str {
        self.category
    }

    pub fn default_value(&self) -> T {
        (self.default)()
    }
}

impl<T: ConfigKind> fmt::Debug for ConfigEntry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigEntry")
            .field("key", &self.key)
            .field("category", &self.category)
            .finish()
    }
}

/// Type-erased view of an entry, used by the import/export layer to walk the
/// full catalog without knowing each entry's Rust type.
pub trait EntryDescriptor: Send + Sync {
    fn key(&self) -> &'static str;
    fn category(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn default(&self) -> ConfigValue;
}

impl<T: ConfigKind> EntryDescriptor for ConfigEntry<T> {
    fn key(&self) -> &'static str {
        self.key
    }

    fn category(&self) -> &'static str {
        self.category
    }

    fn description(&self) -> &'static str {
        self.description
    }

    fn default(&self) -> ConfigValue {
        self.default_value().wrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_render_round_trips_through_parse() {
        let value = ConfigValue::List(vec!["pdf".into(), "docx".into()]);
        let rendered = value.render();
        assert_eq!(rendered, "pdf;docx");
        assert_eq!(value.parse_same_kind(&rendered), Some(value));
    }

    #[test]
    fn parse_rejects_wrong_kind() {
        assert_eq!(ConfigValue::Int(0).parse_same_kind("not a number"), None);
        assert_eq!(ConfigValue::Bool(false).parse_same_kind("yes"), None);
    }

    #[test]
    fn long_accepts_int_slot() {
        assert_eq!(i64::unwrap(&ConfigValue::Int(42)), Some(42));
    }

    #[test]
    fn split_list_drops_empty_segments() {
        assert_eq!(split_list("a;;b; ;c;"), vec!["a", "b", "c"]);
    }
}
