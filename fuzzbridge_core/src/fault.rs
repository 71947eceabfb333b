//! Process-wide fault routing.
//!
//! A panic in the callable is the detection signal. The hook installed here
//! prints it through the previous hook, then ends the process the way the
//! surrounding context expects, so no unwinding ever continues past the
//! native boundary.

use crate::status::ERROR_EXIT_CODE;
use std::panic;
use std::sync::Once;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// The engine's loop is running: abort so its deadly-signal handler
    /// reports the crash and writes the artifact.
    Engine,
    /// No engine loop (tracing): exit with the engine's error code directly.
    Standalone,
}

impl FaultMode {
    fn as_u8(self) -> u8 {
        match self {
            FaultMode::Engine => 0,
            FaultMode::Standalone => 1,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => FaultMode::Engine,
            _ => FaultMode::Standalone,
        }
    }
}

static INSTALL: Once = Once::new();

static MODE: AtomicU8 = AtomicU8::new(0);

/// Installs the fault hook, or switches the mode of the installed one.
///
/// The hook is registered once per process; every call sets the mode it
/// reads when a fault happens, so the latest context wins.
pub fn install(mode: FaultMode) {
    MODE.store(mode.as_u8(), Ordering::SeqCst);
    INSTALL.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            previous(info);
            match current_mode() {
                FaultMode::Engine => std::process::abort(),
                FaultMode::Standalone => std::process::exit(ERROR_EXIT_CODE),
            }
        }));
    });
}

pub fn is_installed() -> bool {
    INSTALL.is_completed()
}

/// Mode the hook acts on; meaningful once [`install`] has run.
pub fn current_mode() -> FaultMode {
    FaultMode::from_u8(MODE.load(Ordering::SeqCst))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::ExitStatus;
    use crate::supervisor::{ChildCommand, run_isolated};

    const CHILD_ENV: &str = "FUZZBRIDGE_FAULT_CHILD";

    /// Child half of the scenarios below; a no-op unless re-executed.
    #[test]
    fn fault_child() {
        let Ok(modes) = std::env::var(CHILD_ENV) else {
            return;
        };
        let mut last = FaultMode::Engine;
        for mode in modes.split(',') {
            last = if mode == "engine" {
                FaultMode::Engine
            } else {
                FaultMode::Standalone
            };
            install(last);
        }
        assert!(is_installed());
        assert_eq!(current_mode(), last);
        panic!("fault from {modes}");
    }

    fn run_child(mode: &str) -> crate::supervisor::ChildReport {
        let exe = std::env::current_exe().unwrap();
        let command = ChildCommand::new(exe)
            .args(["fault::tests::fault_child", "--exact", "--nocapture", "--test-threads=1"])
            .env(CHILD_ENV, mode);
        run_isolated(&command).unwrap()
    }

    #[test]
    fn engine_mode_aborts() {
        let report = run_child("engine");
        assert_eq!(report.signal, Some(6), "{}", report.output());
        assert!(report.output().contains("fault from engine"));
    }

    #[test]
    fn standalone_mode_exits_with_the_error_code() {
        let report = run_child("standalone");
        assert_eq!(report.exit_code, Some(ERROR_EXIT_CODE));
        assert_eq!(report.status(), ExitStatus::ContractError);
        assert!(report.output().contains("fault from standalone"));
    }

    #[test]
    fn engine_mode_after_a_trace_still_aborts() {
        let report = run_child("standalone,engine");
        assert_eq!(report.signal, Some(6), "{}", report.output());
        assert_eq!(report.exit_code, None);
    }

    #[test]
    fn trace_after_an_engine_session_exits_with_the_error_code() {
        let report = run_child("engine,standalone");
        assert_eq!(report.exit_code, Some(ERROR_EXIT_CODE), "{}", report.output());
        assert_eq!(report.status(), ExitStatus::ContractError);
    }
}
