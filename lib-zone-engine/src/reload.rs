//! Hot-reload supervisor: per-file mtime/size tracking, atomic
//! detection of concurrent modification, and per-dataset reload.
//!
//! Driven from a timer tick outside this crate (see
//! `bin-rbld`'s transport loop); never runs concurrently with query
//! processing against the same dataset, since dataset content is only
//! ever mutated here, behind the dataset's own lock.

use std::fs;
use std::sync::atomic::Ordering;
use std::time::SystemTime;

use crate::dataset::{Dataset, DatasetFile, LineOutcome};
use crate::directive::{parse_directive, DirectiveContext, DirectiveError};

#[derive(Debug)]
pub enum ReloadOutcome {
    /// No source file's stat changed since the last successful load.
    Unchanged,
    Reloaded,
    Error(ReloadError),
}

#[derive(Debug)]
pub enum ReloadError {
    Stat(String, std::io::Error),
    /// A source file's mtime or size changed between the start and
    /// end of reading it.
    ChangedDuringRead,
    Fatal(String),
}

impl std::fmt::Display for ReloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ReloadError::Stat(path, err) => write!(f, "failed to stat {path}: {err}"),
            ReloadError::ChangedDuringRead => {
                write!(f, "file changed during read - update dataset files via atomic rename")
            }
            ReloadError::Fatal(msg) => write!(f, "{msg}"),
        }
    }
}

struct Stat {
    mtime: Option<SystemTime>,
    size: u64,
}

fn stat(file: &DatasetFile) -> Result<Stat, ReloadError> {
    let meta = fs::metadata(&file.path)
        .map_err(|e| ReloadError::Stat(file.path.display().to_string(), e))?;
    Ok(Stat {
        mtime: meta.modified().ok(),
        size: meta.len(),
    })
}

fn stat_unchanged(file: &DatasetFile, observed: &Stat) -> bool {
    *file.last_mtime.read().expect("lock poisoned") == observed.mtime
        && *file.last_size.read().expect("lock poisoned") == Some(observed.size)
}

/// Zeroes a dataset's load stamp and every file's recorded stat, so
/// the next tick unconditionally attempts a reload.
fn invalidate(dataset: &Dataset) {
    dataset.stamp.store(0, Ordering::Release);
    for file in &dataset.files {
        *file.last_mtime.write().expect("lock poisoned") = None;
        *file.last_size.write().expect("lock poisoned") = None;
    }
}

fn mtime_stamp(mtime: Option<SystemTime>) -> u64 {
    mtime
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Checks a single dataset's source files and reloads it if any
/// changed. Never called concurrently with a query that is reading
/// the same dataset's `common` state beyond what the lock already
/// serializes.
pub fn check_and_reload(dataset: &Dataset) -> ReloadOutcome {
    let mut observed = Vec::with_capacity(dataset.files.len());
    for file in &dataset.files {
        match stat(file) {
            Ok(s) => observed.push(s),
            Err(e) => {
                tracing::warn!(dataset = %dataset.spec, error = %e, "stat failed during reload check");
                if !dataset.is_loaded() {
                    // hard error: never had a valid load to fall back on
                    return ReloadOutcome::Error(e);
                }
                // retain the prior load, try again next tick
                return ReloadOutcome::Unchanged;
            }
        }
    }

    let changed = dataset.files.iter().zip(&observed).any(|(f, s)| !stat_unchanged(f, s));
    if !changed && dataset.is_loaded() {
        return ReloadOutcome::Unchanged;
    }

    match reload(dataset) {
        Ok(()) => ReloadOutcome::Reloaded,
        Err(e) => {
            tracing::warn!(dataset = %dataset.spec, error = %e, "dataset reload aborted");
            invalidate(dataset);
            ReloadOutcome::Error(e)
        }
    }
}

fn reload(dataset: &Dataset) -> Result<(), ReloadError> {
    dataset.type_impl.reset();
    let flags = dataset.type_impl.flags();
    let mut ctx = DirectiveContext::default();
    let mut max_stamp = 0u64;
    let mut file_stats = Vec::with_capacity(dataset.files.len());

    for file in &dataset.files {
        let t0 = stat(file)?;
        dataset.type_impl.start();

        let contents = fs::read_to_string(&file.path)
            .map_err(|e| ReloadError::Stat(file.path.display().to_string(), e))?;

        for raw_line in contents.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            if line.starts_with('$') {
                if let Err(err) = parse_directive(line, &mut ctx, flags) {
                    match err {
                        DirectiveError::MaxRangeIncreaseIgnored => {
                            tracing::warn!(dataset = %dataset.spec, "{err}");
                        }
                        other => return Err(ReloadError::Fatal(other.to_string())),
                    }
                }
            } else {
                match dataset.type_impl.line(line, &ctx) {
                    LineOutcome::Ok => {}
                    LineOutcome::SoftError(msg) => {
                        tracing::warn!(dataset = %dataset.spec, %msg, "soft line error");
                    }
                    LineOutcome::FatalError(msg) => return Err(ReloadError::Fatal(msg)),
                }
            }
        }

        dataset.type_impl.finish(&ctx);

        let t1 = stat(file)?;
        if t0.mtime != t1.mtime || t0.size != t1.size {
            return Err(ReloadError::ChangedDuringRead);
        }

        max_stamp = max_stamp.max(mtime_stamp(t0.mtime));
        file_stats.push(t0);
    }

    *dataset.common.write().expect("lock poisoned") = ctx.common;
    for (file, s) in dataset.files.iter().zip(file_stats) {
        *file.last_mtime.write().expect("lock poisoned") = s.mtime;
        *file.last_size.write().expect("lock poisoned") = Some(s.size);
    }
    // A dataset with zero source files (an apex-only SOA/NS holder,
    // say) is loaded the moment its reload completes.
    dataset.stamp.store(max_stamp.max(1), Ordering::Release);

    Ok(())
}

/// Runs one reload tick over every dataset in `datasets`. Each
/// dataset is checked exactly once even if attached to multiple
/// zones - callers should pass the deduplicated `(type, spec)`
/// registry, not a per-zone walk.
pub fn reload_tick<'a>(datasets: impl IntoIterator<Item = &'a Dataset>) {
    for dataset in datasets {
        check_and_reload(dataset);
    }
}
