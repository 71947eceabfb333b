//! Symbols the fuzzing engine exports into the running process.
//!
//! Nothing here links against libFuzzer. The engine arrives preloaded (see
//! [`composer`](crate::composer)) and every entry point is looked up at run
//! time, so a process without the engine still runs and simply gets no
//! coverage forwarding.

use libloading::os::unix::Library;
use std::ffi::{c_char, c_int};
use std::sync::OnceLock;
use tracing::debug;

/// Callback shape expected by `LLVMFuzzerRunDriver`.
pub type TestOneInputFn = extern "C" fn(*const u8, usize) -> c_int;

pub type RunDriverFn =
    unsafe extern "C" fn(*mut c_int, *mut *mut *mut c_char, TestOneInputFn) -> c_int;

pub const RUN_DRIVER_SYMBOL: &str = "LLVMFuzzerRunDriver";

/// Tracing intrinsics of the engine's coverage runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct Intrinsics {
    pub cmp1: Option<unsafe extern "C" fn(u8, u8)>,
    pub cmp2: Option<unsafe extern "C" fn(u16, u16)>,
    pub cmp4: Option<unsafe extern "C" fn(u32, u32)>,
    pub cmp8: Option<unsafe extern "C" fn(u64, u64)>,
    pub div4: Option<unsafe extern "C" fn(u32)>,
    pub div8: Option<unsafe extern "C" fn(u64)>,
    pub counters_init: Option<unsafe extern "C" fn(*mut u8, *mut u8)>,
    pub pcs_init: Option<unsafe extern "C" fn(*const usize, *const usize)>,
}

impl Intrinsics {
    fn resolve() -> Self {
        let intrinsics = Self {
            cmp1: lookup("__sanitizer_cov_trace_cmp1"),
            cmp2: lookup("__sanitizer_cov_trace_cmp2"),
            cmp4: lookup("__sanitizer_cov_trace_cmp4"),
            cmp8: lookup("__sanitizer_cov_trace_cmp8"),
            div4: lookup("__sanitizer_cov_trace_div4"),
            div8: lookup("__sanitizer_cov_trace_div8"),
            counters_init: lookup("__sanitizer_cov_8bit_counters_init"),
            pcs_init: lookup("__sanitizer_cov_pcs_init"),
        };
        debug!(
            cmp = intrinsics.cmp8.is_some(),
            div = intrinsics.div8.is_some(),
            counters = intrinsics.counters_init.is_some(),
            "resolved coverage intrinsics"
        );
        intrinsics
    }
}

/// Intrinsics resolved once per process.
pub fn intrinsics() -> &'static Intrinsics {
    static INTRINSICS: OnceLock<Intrinsics> = OnceLock::new();
    INTRINSICS.get_or_init(Intrinsics::resolve)
}

pub fn run_driver() -> Option<RunDriverFn> {
    lookup(RUN_DRIVER_SYMBOL)
}

/// Whether the engine's driver entry is present in this process.
pub fn libfuzzer_is_loaded() -> bool {
    run_driver().is_some()
}

fn lookup<T: Copy>(name: &str) -> Option<T> {
    let this = Library::this();
    // SAFETY: callers pick `T` to match the C declaration of `name`.
    unsafe { this.get::<T>(name.as_bytes()) }
        .ok()
        .map(|symbol| *symbol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_misses_unknown_symbols() {
        assert!(lookup::<unsafe extern "C" fn()>("fuzzbridge_no_such_symbol_42").is_none());
    }

    #[test]
    fn lookup_finds_libc() {
        let getpid: Option<unsafe extern "C" fn() -> c_int> = lookup("getpid");
        let getpid = getpid.expect("libc is always mapped");
        assert_eq!(unsafe { getpid() } as u32, std::process::id());
    }

    #[test]
    fn intrinsics_resolve_consistently() {
        let first = intrinsics() as *const Intrinsics;
        let second = intrinsics() as *const Intrinsics;
        assert_eq!(first, second);
        assert_eq!(intrinsics().cmp8.is_some(), lookup::<unsafe extern "C" fn(u64, u64)>("__sanitizer_cov_trace_cmp8").is_some());
    }
}
