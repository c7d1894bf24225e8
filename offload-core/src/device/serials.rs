use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info};

/// The known-serials file: `serial::label` records joined by `||`, UTF-8.
/// Rewritten whole (temp + rename) on every mutation so a crash leaves either
/// the old or the new list, never a torn one.
#[derive(Clone, Debug)]
pub struct KnownSerials {
    path: PathBuf,
}

const RECORD_SEPARATOR: &str = "||";
const FIELD_SEPARATOR: &str = "::";

impl KnownSerials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read persisted `(serial, label)` pairs. Empty and malformed records
    /// are skipped; a missing file is an empty list.
    pub fn load(&self) -> Vec<(String, String)> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(err) => {
                info!(path = %self.path.display(), "could not read known serials: {err}");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        for record in raw.split(RECORD_SEPARATOR) {
            let record = record.trim();
            if record.is_empty() {
                continue;
            }
            match record.split_once(FIELD_SEPARATOR) {
                Some((serial, label)) if !serial.trim().is_empty() => {
                    records.push((serial.trim().to_string(), label.trim().to_string()));
                }
                // Serial-only records predate labels.
                None if !record.is_empty() => {
                    records.push((record.to_string(), String::new()));
                }
                _ => {
                    info!(record, "skipping malformed known-serials record");
                }
            }
        }
        debug!(count = records.len(), "known serials loaded");
        records
    }

    /// Rewrite the whole file from `records`.
    pub fn save(&self, records: &[(String, String)]) -> io::Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;

        let body = records
            .iter()
            .map(|(serial, label)| format!("{serial}{FIELD_SEPARATOR}{label}"))
            .collect::<Vec<_>>()
            .join(RECORD_SEPARATOR);

        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(body.as_bytes())?;
        temp.flush()?;
        temp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}
