use crate::value::Value;
use libloading::os::unix::{Library, Symbol};
use std::ffi::c_int;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

/// Symbol every libFuzzer-style native harness exports.
pub const DEFAULT_ENTRY: &str = "LLVMFuzzerTestOneInput";

/// A managed unit of arity one: takes the fuzz input, answers with a dynamic value.
///
/// One callable is active per engine session. It is invoked synchronously,
/// many times, always from the thread that registered it.
pub trait TestCallable {
    fn call(&mut self, input: &[u8]) -> Value;
}

impl<F, R> TestCallable for F
where
    F: FnMut(&[u8]) -> R,
    R: Into<Value>,
{
    fn call(&mut self, input: &[u8]) -> Value {
        (self)(input).into()
    }
}

#[derive(Error, Debug)]
pub enum ExtensionError {
    #[error("Failed to load native extension {path:?}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("Native extension {path:?} does not export '{symbol}'")]
    MissingEntry { path: PathBuf, symbol: String },
}

type EntryFn = unsafe extern "C" fn(*const u8, usize) -> c_int;

/// A natively compiled harness loaded from a shared object.
pub struct NativeExtension {
    path: PathBuf,
    entry: Symbol<EntryFn>,
    // Declared after `entry` so the symbol is dropped before the library.
    _library: Library,
}

impl NativeExtension {
    pub fn open(path: &Path) -> Result<Self, ExtensionError> {
        Self::open_with_entry(path, DEFAULT_ENTRY)
    }

    pub fn open_with_entry(path: &Path, symbol: &str) -> Result<Self, ExtensionError> {
        debug!(?path, symbol, "loading native extension");
        // SAFETY: loading runs the object's initializers; harness objects are
        // trusted build outputs.
        let library = unsafe { Library::new(path) }.map_err(|e| ExtensionError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        // SAFETY: the exported entry follows the libFuzzer harness signature.
        let entry = unsafe { library.get::<EntryFn>(symbol.as_bytes()) }.map_err(|_| {
            ExtensionError::MissingEntry {
                path: path.to_path_buf(),
                symbol: symbol.to_string(),
            }
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            entry,
            _library: library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TestCallable for NativeExtension {
    fn call(&mut self, input: &[u8]) -> Value {
        // SAFETY: the pointer/length pair describes `input`, which outlives the call.
        let code = unsafe { (self.entry)(input.as_ptr(), input.len()) };
        Value::Int(i64::from(code))
    }
}

impl std::fmt::Debug for NativeExtension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeExtension")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
