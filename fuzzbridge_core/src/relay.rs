//! Comparison and division operand tracing for code the compiler did not
//! instrument.
//!
//! Code built with `-C passes=sancov-module` and
//! `-sanitizer-coverage-trace-compares` already reports its operands to the
//! engine. Everything else goes through this relay: either by calling
//! [`trace_cmp`]/[`trace_div`] directly or by wrapping operands in
//! [`Traced`]. The relay only signals; the traced operation always runs
//! exactly as it would without it.

use crate::counters;
use crate::sink::{CoverageEvent, CoverageSink, EngineSink, Op, RecordingSink, Width};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::marker::PhantomData;
use std::ops::{Div, Rem};
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

thread_local! {
    static SINKS: RefCell<Vec<(u64, Box<dyn CoverageSink>)>> = const { RefCell::new(Vec::new()) };
}

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

#[inline(always)]
fn forward(event: CoverageEvent) {
    EngineSink::new().forward(&event);
    let _ = SINKS.try_with(|sinks| {
        // A sink that re-enters the relay is skipped rather than faulting
        // the traced operation.
        if let Ok(mut sinks) = sinks.try_borrow_mut() {
            for (_, sink) in sinks.iter_mut() {
                sink.observe(&event);
            }
        }
    });
}

/// Reports a comparison of `left` and `right` about to happen.
#[inline(always)]
pub fn trace_cmp(width: Width, left: u64, right: u64) {
    forward(CoverageEvent {
        op: Op::Cmp,
        width,
        left,
        right,
    });
}

/// Reports a division about to happen. Call it before dividing: a zero
/// divisor faults, and the engine must already have seen it.
#[inline(always)]
pub fn trace_div(width: Width, dividend: u64, divisor: u64) {
    forward(CoverageEvent {
        op: Op::Div,
        width,
        left: dividend,
        right: divisor,
    });
}

/// Bumps the branch counter of the calling source location.
#[track_caller]
#[inline(always)]
pub fn branch() {
    counters::hit(Location::caller());
}

/// Keeps an extra sink attached to the calling thread's relay while alive.
#[must_use = "dropping the handle detaches the sink immediately"]
pub struct SinkHandle {
    id: u64,
    detached: bool,
    // Sinks live in a thread-local; the handle must stay on that thread.
    _thread_bound: PhantomData<*const ()>,
}

impl SinkHandle {
    /// Detaches the sink and hands it back, with everything it observed.
    pub fn detach(mut self) -> Option<Box<dyn CoverageSink>> {
        self.detached = true;
        take_sink(self.id)
    }
}

impl Drop for SinkHandle {
    fn drop(&mut self) {
        if !self.detached {
            let _ = take_sink(self.id);
        }
    }
}

fn take_sink(id: u64) -> Option<Box<dyn CoverageSink>> {
    SINKS
        .try_with(|sinks| {
            let mut sinks = sinks.borrow_mut();
            let pos = sinks.iter().position(|(sink_id, _)| *sink_id == id)?;
            Some(sinks.remove(pos).1)
        })
        .ok()
        .flatten()
}

/// Attaches `sink` next to the engine for the calling thread.
pub fn attach(sink: Box<dyn CoverageSink>) -> SinkHandle {
    let id = NEXT_SINK_ID.fetch_add(1, AtomicOrdering::Relaxed);
    SINKS.with_borrow_mut(|sinks| sinks.push((id, sink)));
    SinkHandle {
        id,
        detached: false,
        _thread_bound: PhantomData,
    }
}

/// Runs `f` and returns what it produced together with every event it traced.
pub fn record<R>(f: impl FnOnce() -> R) -> (R, Vec<CoverageEvent>) {
    let handle = attach(Box::new(RecordingSink::new()));
    let result = f();
    (result, drain_recording(handle))
}

pub(crate) fn drain_recording(handle: SinkHandle) -> Vec<CoverageEvent> {
    handle
        .detach()
        .and_then(|mut sink| {
            sink.as_any_mut()
                .downcast_mut::<RecordingSink>()
                .map(RecordingSink::take)
        })
        .unwrap_or_default()
}

mod sealed {
    pub trait Sealed {}
}

/// Integer types the relay knows how to report.
pub trait Traceable: Copy + sealed::Sealed {
    const WIDTH: Width;

    /// Bit pattern of the value, zero-extended from its own width.
    fn bits(self) -> u64;
}

/// An integer whose comparisons and divisions are reported to the engine.
///
/// ```
/// use fuzzbridge_core::relay::Traced;
///
/// let magic = Traced(u32::from_be_bytes(*b"FUZZ"));
/// assert!(magic == 0x4655_5A5A);
/// assert_eq!((Traced(100u64) / Traced(7)).0, 14);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct Traced<T>(pub T);

impl<T> Traced<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

macro_rules! traced_int {
    ($($ty:ty => $unsigned:ty, $width:expr;)*) => {
        $(
            impl sealed::Sealed for $ty {}

            impl Traceable for $ty {
                const WIDTH: Width = $width;

                #[inline(always)]
                fn bits(self) -> u64 {
                    self as $unsigned as u64
                }
            }

            impl From<$ty> for Traced<$ty> {
                fn from(value: $ty) -> Self {
                    Traced(value)
                }
            }

            impl PartialEq for Traced<$ty> {
                #[inline(always)]
                fn eq(&self, other: &Self) -> bool {
                    trace_cmp(<$ty>::WIDTH, self.0.bits(), other.0.bits());
                    self.0 == other.0
                }
            }

            impl PartialEq<$ty> for Traced<$ty> {
                #[inline(always)]
                fn eq(&self, other: &$ty) -> bool {
                    *self == Traced(*other)
                }
            }

            impl Eq for Traced<$ty> {}

            impl PartialOrd for Traced<$ty> {
                #[inline(always)]
                fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
                    Some(self.cmp(other))
                }
            }

            impl PartialOrd<$ty> for Traced<$ty> {
                #[inline(always)]
                fn partial_cmp(&self, other: &$ty) -> Option<Ordering> {
                    Some(self.cmp(&Traced(*other)))
                }
            }

            impl Ord for Traced<$ty> {
                #[inline(always)]
                fn cmp(&self, other: &Self) -> Ordering {
                    trace_cmp(<$ty>::WIDTH, self.0.bits(), other.0.bits());
                    self.0.cmp(&other.0)
                }
            }

            impl Div for Traced<$ty> {
                type Output = Traced<$ty>;

                #[inline(always)]
                fn div(self, rhs: Self) -> Self::Output {
                    trace_div(<$ty>::WIDTH, self.0.bits(), rhs.0.bits());
                    Traced(self.0 / rhs.0)
                }
            }

            impl Div<$ty> for Traced<$ty> {
                type Output = Traced<$ty>;

                #[inline(always)]
                fn div(self, rhs: $ty) -> Self::Output {
                    self / Traced(rhs)
                }
            }

            impl Rem for Traced<$ty> {
                type Output = Traced<$ty>;

                #[inline(always)]
                fn rem(self, rhs: Self) -> Self::Output {
                    trace_div(<$ty>::WIDTH, self.0.bits(), rhs.0.bits());
                    Traced(self.0 % rhs.0)
                }
            }

            impl Rem<$ty> for Traced<$ty> {
                type Output = Traced<$ty>;

                #[inline(always)]
                fn rem(self, rhs: $ty) -> Self::Output {
                    self % Traced(rhs)
                }
            }
        )*
    };
}

const POINTER_WIDTH: Width = if size_of::<usize>() == 8 {
    Width::W8
} else {
    Width::W4
};

traced_int! {
    u8 => u8, Width::W1;
    i8 => u8, Width::W1;
    u16 => u16, Width::W2;
    i16 => u16, Width::W2;
    u32 => u32, Width::W4;
    i32 => u32, Width::W4;
    u64 => u64, Width::W8;
    i64 => u64, Width::W8;
    usize => usize, POINTER_WIDTH;
    isize => usize, POINTER_WIDTH;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn cmp(width: Width, left: u64, right: u64) -> CoverageEvent {
        CoverageEvent {
            op: Op::Cmp,
            width,
            left,
            right,
        }
    }

    #[test]
    fn equality_forwards_one_event() {
        let (equal, events) = record(|| Traced(7u32) == Traced(7u32));
        assert!(equal);
        assert_eq!(events, vec![cmp(Width::W4, 7, 7)]);
    }

    #[test]
    fn inequality_forwards_one_event() {
        let (different, events) = record(|| Traced(1u8) != 2u8);
        assert!(different);
        assert_eq!(events, vec![cmp(Width::W1, 1, 2)]);
    }

    #[test]
    fn signed_operands_keep_their_bit_pattern() {
        let (less, events) = record(|| Traced(-1i16) < Traced(0i16));
        assert!(less);
        assert_eq!(events, vec![cmp(Width::W2, 0xFFFF, 0)]);
    }

    #[test]
    fn division_is_traced_before_it_runs() {
        let (quotient, events) = record(|| Traced(100u64) / Traced(7u64));
        assert_eq!(quotient.0, 14);
        assert_eq!(
            events,
            vec![CoverageEvent {
                op: Op::Div,
                width: Width::W8,
                left: 100,
                right: 7,
            }]
        );
    }

    #[test]
    fn division_by_zero_faults_after_forwarding() {
        let handle = attach(Box::new(RecordingSink::new()));
        let divisor = std::hint::black_box(0i32);
        let outcome = catch_unwind(AssertUnwindSafe(|| Traced(100i32) / divisor));
        let events = drain_recording(handle);

        let payload = outcome.expect_err("dividing by zero must still fault");
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_default();
        assert!(msg.contains("divide by zero"), "{msg}");
        assert_eq!(
            events,
            vec![CoverageEvent {
                op: Op::Div,
                width: Width::W4,
                left: 100,
                right: 0,
            }]
        );
    }

    #[test]
    fn remainder_is_traced_as_a_division() {
        let (rem, events) = record(|| Traced(10u16) % 4u16);
        assert_eq!(rem.0, 2);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].op, Op::Div);
        assert_eq!(events[0].width, Width::W2);
    }

    #[test]
    fn detached_sinks_stop_observing() {
        let handle = attach(Box::new(RecordingSink::new()));
        trace_cmp(Width::W8, 1, 2);
        let sink = handle.detach().expect("sink was attached");
        trace_cmp(Width::W8, 3, 4);
        let recorded = sink
            .as_any()
            .downcast_ref::<RecordingSink>()
            .map(|r| r.events.clone())
            .unwrap_or_default();
        assert_eq!(recorded, vec![cmp(Width::W8, 1, 2)]);
    }

    #[test]
    fn nested_recordings_both_see_inner_events() {
        let ((_, inner), outer) = record(|| record(|| Traced(5u64) > Traced(3u64)));
        assert_eq!(inner.len(), 1);
        assert_eq!(outer, inner);
    }

    proptest! {
        #[test]
        fn comparisons_are_transparent(x in any::<i64>(), y in any::<i64>()) {
            let (results, events) = record(|| {
                (
                    Traced(x) == Traced(y),
                    Traced(x) < Traced(y),
                    Traced(x) >= y,
                    Traced(x).cmp(&Traced(y)),
                )
            });
            prop_assert_eq!(results, (x == y, x < y, x >= y, x.cmp(&y)));
            prop_assert_eq!(events.len(), 4);
            for event in events {
                prop_assert_eq!(event, cmp(Width::W8, x as u64, y as u64));
            }
        }

        #[test]
        fn divisions_are_transparent(x in any::<u32>(), y in 1u32..) {
            let ((q, r), events) = record(|| (Traced(x) / Traced(y), Traced(x) % y));
            prop_assert_eq!((q.0, r.0), (x / y, x % y));
            prop_assert_eq!(events.len(), 2);
            prop_assert!(events.iter().all(|e| e.op == Op::Div && e.right == u64::from(y)));
        }
    }
}
