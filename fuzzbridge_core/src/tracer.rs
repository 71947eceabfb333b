//! One-shot execution of a harness outside the mutation loop.
//!
//! Tracing answers "what does this harness do with this input": it runs the
//! callable once with the relay recording, and reports the verdict, the
//! operand events and how many new branch counters were hit. Faults still end
//! the process, with the engine's error code, so a traced crash looks the same
//! to a supervisor as a fuzzed one.

use crate::callable::{ExtensionError, NativeExtension, TestCallable};
use crate::counters;
use crate::fault::{self, FaultMode};
use crate::relay;
use crate::sink::{CoverageEvent, RecordingSink};
use crate::value::Verdict;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Harness {path:?} not found (searched {searched:?})")]
    HarnessNotFound { path: PathBuf, searched: Vec<PathBuf> },
    #[error(transparent)]
    Extension(#[from] ExtensionError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceReport {
    pub verdict: Verdict,
    pub events: Vec<CoverageEvent>,
    /// Branch counters that went from zero to non-zero during the run.
    pub new_branches: usize,
    /// md5 of the input, hex encoded.
    pub input_digest: String,
}

/// Resolves `harness` the way a source file refers to its neighbours.
///
/// Relative paths are taken relative to the directory of `caller_file` (as
/// produced by `file!()`), never to the working directory. `file!()` is
/// relative to the workspace root when building a member and to the package
/// root otherwise, so the manifest directory and each of its ancestors are
/// tried as the base.
pub fn resolve_harness(
    caller_file: &str,
    manifest_dir: &Path,
    harness: &Path,
) -> Result<PathBuf, TraceError> {
    let searched: Vec<PathBuf> = if harness.is_absolute() {
        vec![harness.to_path_buf()]
    } else {
        let caller_dir = Path::new(caller_file).parent().unwrap_or(Path::new(""));
        if caller_dir.is_absolute() {
            vec![caller_dir.join(harness)]
        } else {
            manifest_dir
                .ancestors()
                .map(|base| base.join(caller_dir).join(harness))
                .collect()
        }
    };
    match searched.iter().find(|candidate| candidate.is_file()) {
        Some(found) => {
            debug!(?found, "resolved harness");
            Ok(found.clone())
        }
        None => Err(TraceError::HarnessNotFound {
            path: harness.to_path_buf(),
            searched,
        }),
    }
}

/// Runs `callable` once with recording attached. No fault hook is installed.
pub fn run_once<C: TestCallable + ?Sized>(callable: &mut C, input: &[u8]) -> TraceReport {
    let covered_before = counters::covered();
    let handle = relay::attach(Box::new(RecordingSink::new()));
    let value = callable.call(input);
    let events = relay::drain_recording(handle);
    let verdict = match Verdict::try_from(value) {
        Ok(verdict) => verdict,
        Err(violation) => panic!("{violation}"),
    };
    TraceReport {
        verdict,
        events,
        new_branches: counters::covered().saturating_sub(covered_before),
        input_digest: format!("{:x}", md5::compute(input)),
    }
}

/// Traces an in-process callable. A fault exits the process with code 77.
pub fn trace_callable<C: TestCallable>(mut callable: C, input: &[u8]) -> TraceReport {
    fault::install(FaultMode::Standalone);
    let report = run_once(&mut callable, input);
    info!(
        verdict = ?report.verdict,
        events = report.events.len(),
        new_branches = report.new_branches,
        digest = %report.input_digest,
        "trace finished"
    );
    report
}

/// Loads a native harness and traces it once.
pub fn trace_harness(path: &Path, input: &[u8]) -> Result<TraceReport, TraceError> {
    let extension = NativeExtension::open(path)?;
    info!(path = ?extension.path(), "tracing native harness");
    Ok(trace_callable(extension, input))
}

/// Traces a native harness named relative to the calling source file.
///
/// ```no_run
/// let report = fuzzbridge_core::trace!("harnesses/libcmp.so", b"FUZZ")?;
/// println!("{} events", report.events.len());
/// # Ok::<(), fuzzbridge_core::tracer::TraceError>(())
/// ```
#[macro_export]
macro_rules! trace {
    ($path:expr) => {
        $crate::trace!($path, b"")
    };
    ($path:expr, $input:expr) => {
        $crate::tracer::resolve_harness(
            file!(),
            ::std::path::Path::new(env!("CARGO_MANIFEST_DIR")),
            ::std::path::Path::new($path),
        )
        .and_then(|path| $crate::tracer::trace_harness(&path, $input))
    };
}
