use crate::callable::TestCallable;
use crate::counters;
use crate::dispatcher::{Dispatch, Dispatcher};
use crate::engine::{self, RUN_DRIVER_SYMBOL};
use crate::fault::{self, FaultMode};
use crate::input::FuzzInput;
use crate::status::ERROR_EXIT_CODE;
use std::cell::RefCell;
use std::ffi::{CString, c_char, c_int};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{error, info};

/// Upper bound on the argument vector, terminating null pointer included.
pub const MAX_ARGS: usize = 128;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("Zero arguments passed, at least the program name must be present")]
    EmptyArgs,
    #[error("Cannot specify {max} or more arguments (got {len} plus the terminating null)", max = MAX_ARGS)]
    TooManyArgs { len: usize },
    #[error("Argument {index} contains an interior NUL byte")]
    InteriorNul { index: usize },
    #[error(
        "Fuzzing engine is not loaded: '{symbol}' was not found in this process. \
         Preload a merged sanitizer runtime (see `fuzzbridge compose`) via LD_PRELOAD",
        symbol = RUN_DRIVER_SYMBOL
    )]
    EngineNotLoaded,
    #[error("A fuzzing session is already active in this process")]
    SessionActive,
    #[error("No test callable is registered for this thread")]
    MissingTarget,
}

/// Engine configuration tokens, validated against the engine's limits.
///
/// The first token is the program name placeholder; the rest are passed
/// through to the engine untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgVector {
    args: Vec<String>,
}

impl ArgVector {
    pub fn new<I, S>(args: I) -> Result<Self, DriverError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        if args.is_empty() {
            return Err(DriverError::EmptyArgs);
        }
        if args.len() + 1 >= MAX_ARGS {
            return Err(DriverError::TooManyArgs { len: args.len() });
        }
        if let Some(index) = args.iter().position(|a| a.as_bytes().contains(&0)) {
            return Err(DriverError::InteriorNul { index });
        }
        Ok(Self { args })
    }

    pub fn as_slice(&self) -> &[String] {
        &self.args
    }

    pub fn program(&self) -> &str {
        &self.args[0]
    }

    pub fn len(&self) -> usize {
        self.args.len()
    }

    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    fn to_c(&self) -> Result<CArgs, DriverError> {
        let owned = self
            .args
            .iter()
            .enumerate()
            .map(|(index, a)| CString::new(a.as_str()).map_err(|_| DriverError::InteriorNul { index }))
            .collect::<Result<Vec<_>, _>>()?;
        let mut ptrs: Vec<*mut c_char> = owned.iter().map(|s| s.as_ptr() as *mut c_char).collect();
        ptrs.push(std::ptr::null_mut());
        Ok(CArgs {
            _owned: owned,
            ptrs,
        })
    }
}

/// C view of an [`ArgVector`]; owns the strings the pointers refer to.
struct CArgs {
    _owned: Vec<CString>,
    ptrs: Vec<*mut c_char>,
}

impl CArgs {
    fn argc(&self) -> c_int {
        (self.ptrs.len() - 1) as c_int
    }

    fn argv(&mut self) -> *mut *mut c_char {
        self.ptrs.as_mut_ptr()
    }
}

/// The registration record of the one callable the engine drives.
struct Session {
    dispatcher: Box<dyn Dispatch>,
}

thread_local! {
    static SESSION: RefCell<Option<Session>> = const { RefCell::new(None) };
}

static ACTIVE: AtomicBool = AtomicBool::new(false);

/// Keeps a session registered; dropping it unregisters.
struct SessionGuard {
    _thread_bound: std::marker::PhantomData<*const ()>,
}

impl SessionGuard {
    fn register(dispatcher: Box<dyn Dispatch>) -> Result<Self, DriverError> {
        ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| DriverError::SessionActive)?;
        SESSION.with_borrow_mut(|slot| *slot = Some(Session { dispatcher }));
        Ok(Self {
            _thread_bound: std::marker::PhantomData,
        })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let _ = SESSION.try_with(|slot| slot.borrow_mut().take());
        ACTIVE.store(false, Ordering::Release);
    }
}

/// The engine's per-input callback.
///
/// Panics here cannot unwind into the engine: the fault hook ends the process
/// first, and the `extern "C"` boundary aborts if anything slips through.
extern "C" fn test_one_input(data: *const u8, size: usize) -> c_int {
    // SAFETY: the engine passes a buffer of `size` bytes valid for this call.
    let input = unsafe { FuzzInput::from_raw(data, size) };
    SESSION.with_borrow_mut(|slot| match slot {
        Some(session) => session.dispatcher.dispatch(input.as_bytes()),
        None => panic!("{}", DriverError::MissingTarget),
    })
}

/// Whether the engine's driver entry is present in this process.
pub fn libfuzzer_is_loaded() -> bool {
    engine::libfuzzer_is_loaded()
}

/// Validates `args`, registers `target` and hands control to the engine.
///
/// Returns only if the engine itself returns (for instance after `-help=1`);
/// normally the engine ends the process with one of its exit codes. On error
/// `target` has not been invoked.
pub fn try_run<I, S, C>(args: I, target: C) -> Result<c_int, DriverError>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
    C: TestCallable + 'static,
{
    let argv = ArgVector::new(args)?;
    run_with(&argv, target)
}

/// Like [`try_run`] with an already validated [`ArgVector`].
pub fn run_with<C>(argv: &ArgVector, target: C) -> Result<c_int, DriverError>
where
    C: TestCallable + 'static,
{
    let run_driver = engine::run_driver().ok_or(DriverError::EngineNotLoaded)?;
    let mut c_args = argv.to_c()?;
    let _guard = SessionGuard::register(Box::new(Dispatcher::new(target)))?;

    counters::register_with_engine();
    fault::install(FaultMode::Engine);

    let mut argc = c_args.argc();
    let mut argv_ptr = c_args.argv();
    info!(args = ?argv.as_slice(), "starting fuzzing engine");
    // SAFETY: argc/argv describe NUL-terminated strings owned by `c_args`,
    // which outlives the call; the callback matches the engine's signature.
    let code = unsafe { run_driver(&mut argc, &mut argv_ptr, test_one_input) };
    info!(code, "fuzzing engine returned");
    Ok(code)
}

/// Runs a fuzzing session and ends the process with its exit code.
///
/// Configuration errors exit with the engine's error code before anything is
/// invoked.
pub fn run<I, S, C>(args: I, target: C) -> !
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
    C: TestCallable + 'static,
{
    match try_run(args, target) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!(error = %e, "cannot start fuzzing session");
            eprintln!("ERROR: {e}");
            std::process::exit(ERROR_EXIT_CODE)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    static SERIAL: Mutex<()> = Mutex::new(());

    fn serial() -> std::sync::MutexGuard<'static, ()> {
        SERIAL.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn counting_target(counter: Arc<AtomicUsize>) -> impl TestCallable + 'static {
        move |_: &[u8]| {
            counter.fetch_add(1, Ordering::SeqCst);
            Value::Nil
        }
    }

    #[test]
    fn empty_args_are_rejected() {
        assert_eq!(ArgVector::new(Vec::<String>::new()), Err(DriverError::EmptyArgs));
    }

    #[test]
    fn arg_cap_leaves_room_for_the_terminator() {
        assert!(ArgVector::new(vec!["test"; MAX_ARGS - 2]).is_ok());
        assert_eq!(
            ArgVector::new(vec!["test"; MAX_ARGS - 1]),
            Err(DriverError::TooManyArgs { len: MAX_ARGS - 1 })
        );
        assert_eq!(
            ArgVector::new(vec!["test"; MAX_ARGS]),
            Err(DriverError::TooManyArgs { len: MAX_ARGS })
        );
    }

    #[test]
    fn interior_nul_is_rejected() {
        assert_eq!(
            ArgVector::new(["prog", "-dict=a\0b"]),
            Err(DriverError::InteriorNul { index: 1 })
        );
    }

    #[test]
    fn args_pass_through_untouched() {
        let argv = ArgVector::new(["fuzzbridgetestprogname", "-max_total_time=30", "-exact_artifact_path=/dev/null"]).unwrap();
        assert_eq!(argv.program(), "fuzzbridgetestprogname");
        assert_eq!(argv.len(), 3);
        let mut c_args = argv.to_c().unwrap();
        assert_eq!(c_args.argc(), 3);
        let ptrs = c_args.argv();
        unsafe {
            assert!((*ptrs.add(3)).is_null());
            let second = std::ffi::CStr::from_ptr(*ptrs.add(1));
            assert_eq!(second.to_str().unwrap(), "-max_total_time=30");
        }
    }

    #[test]
    fn invalid_args_never_invoke_the_target() {
        let counter = Arc::new(AtomicUsize::new(0));
        let empty = try_run(Vec::<String>::new(), counting_target(counter.clone()));
        assert_eq!(empty, Err(DriverError::EmptyArgs));
        let oversized = try_run(vec!["test"; MAX_ARGS], counting_target(counter.clone()));
        assert!(matches!(oversized, Err(DriverError::TooManyArgs { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_engine_is_reported_before_the_loop() {
        if libfuzzer_is_loaded() {
            return;
        }
        let _serial = serial();
        let counter = Arc::new(AtomicUsize::new(0));
        let result = try_run(["fuzzbridgetestprogname"], counting_target(counter.clone()));
        assert_eq!(result, Err(DriverError::EngineNotLoaded));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert!(!ACTIVE.load(Ordering::SeqCst));
    }

    #[test]
    fn only_one_session_at_a_time() {
        let _serial = serial();
        let first = SessionGuard::register(Box::new(Dispatcher::new(|_: &[u8]| 0))).unwrap();
        let second = SessionGuard::register(Box::new(Dispatcher::new(|_: &[u8]| 0)));
        assert!(matches!(second, Err(DriverError::SessionActive)));
        drop(first);
        let third = SessionGuard::register(Box::new(Dispatcher::new(|_: &[u8]| 0)));
        assert!(third.is_ok());
    }

    #[test]
    fn callback_reaches_the_registered_callable() {
        let _serial = serial();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = counter.clone();
        let guard = SessionGuard::register(Box::new(Dispatcher::new(move |data: &[u8]| {
            seen.fetch_add(1, Ordering::SeqCst);
            if data == b"FUZZ" { -1 } else { 0 }
        })))
        .unwrap();

        let fuzz = b"FUZZ";
        assert_eq!(test_one_input(fuzz.as_ptr(), fuzz.len()), -1);
        assert_eq!(test_one_input(std::ptr::null(), 0), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        drop(guard);
        SESSION.with_borrow(|slot| assert!(slot.is_none()));
    }
}
