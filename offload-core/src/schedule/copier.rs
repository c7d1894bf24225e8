use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashSet;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::load::SpeedProbe;
use super::{CopyOutcome, CopyTask};
use crate::device::DeviceStatus;
use crate::fingerprint::{Fingerprint, FingerprintIndex, with_hash_buffer};

/// Everything one copy attempt needs, detached from the scheduler so the
/// whole attempt can run on a blocking thread.
pub(super) struct CopyContext {
    pub task: CopyTask,
    pub work_root: PathBuf,
    pub buffer_size: usize,
    pub index: Arc<FingerprintIndex>,
    pub in_flight: Arc<DashSet<Fingerprint>>,
    pub devices: Arc<dyn DeviceStatus>,
    pub shutdown: CancellationToken,
    pub speed: Arc<SpeedProbe>,
}

/// How a single attempt ended: a terminal outcome, or a transient read error
/// the scheduler may retry.
pub(super) enum AttemptEnd {
    Done(CopyOutcome),
    Transient(io::Error),
}

enum StreamEnd {
    Finished { fingerprint: Fingerprint, size: u64 },
    Cancelled(&'static str),
}

struct InFlightGuard<'a> {
    set: &'a DashSet<Fingerprint>,
    fingerprint: Fingerprint,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.fingerprint);
    }
}

/// One copy attempt: hash, dedupe, copy, index.
pub(super) fn execute(ctx: &CopyContext) -> AttemptEnd {
    let source = ctx.task.source.clone();

    if let Some(reason) = cancel_reason(ctx) {
        return AttemptEnd::Done(CopyOutcome::cancel(source, reason));
    }

    // First pass: fingerprint the source without writing anything.
    let (fingerprint, size) = match stream_source(ctx, &source, |_| Ok(())) {
        Ok(StreamEnd::Finished { fingerprint, size }) => (fingerprint, size),
        Ok(StreamEnd::Cancelled(reason)) => {
            return AttemptEnd::Done(CopyOutcome::cancel(source, reason));
        }
        Err(err) => return read_failure(ctx, source, err),
    };

    // At-most-one-build: a second task for content already being copied is a
    // duplicate sighting, not a second writer.
    if !ctx.in_flight.insert(fingerprint) {
        ctx.index.note_duplicate(&source, &fingerprint);
        return AttemptEnd::Done(CopyOutcome::success(source, None, size, 0, None));
    }
    let _guard = InFlightGuard {
        set: &ctx.in_flight,
        fingerprint,
    };

    if ctx.index.check_duplicate(&source, &fingerprint) {
        return AttemptEnd::Done(CopyOutcome::success(source, None, size, 0, None));
    }

    let destination = destination_for(&ctx.work_root, &ctx.task);

    // A leftover from an earlier run with the same size counts as done; the
    // index is healed rather than rewritten.
    if let Ok(existing) = fs::metadata(&destination) {
        if existing.is_file() && existing.len() == size {
            debug!(destination = %destination.display(), "destination already present");
            let inserted = ctx.index.record_file(fingerprint, &source, size);
            return AttemptEnd::Done(CopyOutcome::success(
                source,
                Some(destination),
                size,
                0,
                inserted.then_some(fingerprint),
            ));
        }
    }

    // Second pass: copy into a temp file next to the destination, hashing
    // again to catch content changing under us.
    let parent = destination
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| ctx.work_root.clone());
    if let Err(err) = fs::create_dir_all(&parent) {
        return AttemptEnd::Done(CopyOutcome::fail(
            source,
            size,
            format!("cannot create destination directory: {err}"),
        ));
    }
    let mut temp = match NamedTempFile::new_in(&parent) {
        Ok(temp) => temp,
        Err(err) => {
            return AttemptEnd::Done(CopyOutcome::fail(
                source,
                size,
                format!("cannot create temp file: {err}"),
            ));
        }
    };

    let mut bytes_copied = 0u64;
    let mut write_error: Option<io::Error> = None;
    let copied = stream_source(ctx, &source, |chunk| {
        if let Err(err) = temp.write_all(chunk) {
            write_error = Some(err);
            return Err(io::Error::other("destination write failed"));
        }
        bytes_copied += chunk.len() as u64;
        ctx.speed.record(chunk.len() as u64);
        Ok(())
    });

    let copied = match copied {
        Ok(end) => end,
        Err(err) => {
            // Write-side failures are terminal; read-side ones may retry.
            if let Some(write_err) = write_error {
                return AttemptEnd::Done(CopyOutcome::fail(
                    source,
                    size,
                    format!("write failed: {write_err}"),
                ));
            }
            return read_failure(ctx, source, err);
        }
    };

    match copied {
        StreamEnd::Cancelled(reason) => {
            // The temp file is dropped with the guard; no partial destination
            // survives.
            AttemptEnd::Done(CopyOutcome::cancel(source, reason))
        }
        StreamEnd::Finished {
            fingerprint: copied_fingerprint,
            size: copied_size,
        } => {
            if copied_fingerprint != fingerprint {
                return AttemptEnd::Transient(io::Error::other(
                    "source changed while copying",
                ));
            }
            if let Err(err) = temp.flush() {
                return AttemptEnd::Done(CopyOutcome::fail(
                    source,
                    size,
                    format!("flush failed: {err}"),
                ));
            }
            if let Err(err) = temp.persist(&destination) {
                return AttemptEnd::Done(CopyOutcome::fail(
                    source,
                    size,
                    format!("rename failed: {}", err.error),
                ));
            }

            trace!(
                source = %source.display(),
                destination = %destination.display(),
                bytes = bytes_copied,
                "copy finished"
            );
            let inserted = ctx.index.record_file(fingerprint, &source, copied_size);
            AttemptEnd::Done(CopyOutcome::success(
                source,
                Some(destination),
                copied_size,
                bytes_copied,
                inserted.then_some(fingerprint),
            ))
        }
    }
}

fn cancel_reason(ctx: &CopyContext) -> Option<&'static str> {
    if ctx.shutdown.is_cancelled() {
        Some("scheduler shutdown")
    } else if ctx.devices.is_offline(&ctx.task.device_serial) {
        Some("device offline")
    } else {
        None
    }
}

fn read_failure(ctx: &CopyContext, source: PathBuf, err: io::Error) -> AttemptEnd {
    // A vanished source on an offline device is a removal, not a read fault.
    if ctx.devices.is_offline(&ctx.task.device_serial) {
        AttemptEnd::Done(CopyOutcome::cancel(source, "device offline"))
    } else {
        AttemptEnd::Transient(err)
    }
}

/// Stream the source through SHA-256, feeding every chunk to `sink`, with a
/// cancellation check between buffer reads.
fn stream_source(
    ctx: &CopyContext,
    source: &Path,
    mut sink: impl FnMut(&[u8]) -> io::Result<()>,
) -> io::Result<StreamEnd> {
    let mut file = File::open(source)?;
    with_hash_buffer(ctx.buffer_size, |buffer| {
        let mut hasher = Sha256::new();
        let mut size = 0u64;
        loop {
            if let Some(reason) = cancel_reason(ctx) {
                return Ok(StreamEnd::Cancelled(reason));
            }
            let read = file.read(buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            sink(&buffer[..read])?;
            size += read as u64;
        }
        Ok(StreamEnd::Finished {
            fingerprint: Fingerprint::from_bytes(hasher.finalize().into()),
            size,
        })
    })
}

/// `work_root/<device label>/<path relative to the device root>`, with the
/// label sanitized into a single path component.
pub(super) fn destination_for(work_root: &Path, task: &CopyTask) -> PathBuf {
    let label = sanitize_component(&task.device_label)
        .unwrap_or_else(|| task.device_serial.as_str().to_string());

    let relative = task
        .source
        .strip_prefix(&task.device_root)
        .map(Path::to_path_buf)
        .unwrap_or_else(|_| {
            task.source
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("unnamed"))
        });

    work_root.join(label).join(relative)
}

fn sanitize_component(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches(['.', ' ']).to_string();
    if cleaned.is_empty() { None } else { Some(cleaned) }
}
