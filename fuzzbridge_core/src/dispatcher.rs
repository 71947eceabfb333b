use crate::callable::TestCallable;
use crate::value::Verdict;
use std::ffi::c_int;

/// Type-erased view of a dispatcher, as stored in the session record.
pub trait Dispatch {
    fn dispatch(&mut self, buffer: &[u8]) -> c_int;
}

/// Runs the registered callable once per engine input.
///
/// Faults raised by the callable are deliberately not caught here: they must
/// reach the native boundary so the engine's crash path reports them. A return
/// value outside the contract is turned into a fault of its own.
pub struct Dispatcher<C> {
    target: C,
    calls: u64,
}

impl<C: TestCallable> Dispatcher<C> {
    pub fn new(target: C) -> Self {
        Self { target, calls: 0 }
    }

    /// Invokes the callable with `buffer` and returns the engine-facing code.
    ///
    /// # Panics
    /// Panics with the [`ContractViolation`](crate::value::ContractViolation)
    /// message when the callable returns something other than nil or a C int,
    /// and propagates any panic raised by the callable itself.
    pub fn dispatch(&mut self, buffer: &[u8]) -> c_int {
        let value = self.target.call(buffer);
        let verdict = match Verdict::try_from(value) {
            Ok(verdict) => verdict,
            Err(violation) => panic!("{violation}"),
        };
        self.calls += 1;
        verdict.code()
    }

    /// Number of dispatches that completed without a fault.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    pub fn into_inner(self) -> C {
        self.target
    }
}

impl<C: TestCallable> Dispatch for Dispatcher<C> {
    fn dispatch(&mut self, buffer: &[u8]) -> c_int {
        Dispatcher::dispatch(self, buffer)
    }
}
