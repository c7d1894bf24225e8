//! Typed settings for the Offload ingestion engine.
//!
//! Every tunable is declared once as a [`ConfigEntry`] with a key, a category,
//! and a typed default. Components read through [`SettingsRegistry::get`],
//! which falls back to the default for unknown keys or mistyped stored values,
//! so a partially imported or hand-edited settings payload can never wedge the
//! engine.
//!
//! Two interchange formats are supported: a flat `category.key=value` text
//! form and a structured JSON tree carrying descriptions and defaults next to
//! each value. Round-tripping either format preserves every entry.

mod entry;
mod export;
mod registry;
pub mod settings;

pub use entry::{ConfigEntry, ConfigKind, ConfigValue, EntryDescriptor};
pub use export::{export_json, export_text, import_json, import_text};
pub use registry::{SettingsRegistry, global};

use thiserror::Error;

/// Errors surfaced by settings import/export.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("malformed settings payload: {0}")]
    InvalidFormat(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias for settings operations.
pub type Result<T> = std::result::Result<T, ConfigError>;
