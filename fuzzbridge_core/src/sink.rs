use crate::engine::{self, Intrinsics};
use std::any::Any;

/// Which traced operation produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Cmp,
    Div,
}

/// Operand width in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Width {
    W1 = 1,
    W2 = 2,
    W4 = 4,
    W8 = 8,
}

impl Width {
    pub fn bytes(self) -> usize {
        self as usize
    }
}

/// One traced comparison or division site, as seen right before it executes.
///
/// Operands are the raw bit patterns zero-extended to 64 bits. For divisions
/// `left` is the dividend and `right` the divisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoverageEvent {
    pub op: Op,
    pub width: Width,
    pub left: u64,
    pub right: u64,
}

/// Receives every event the relay forwards.
///
/// Sinks are side channels only: they must not panic and cannot influence the
/// traced operation.
pub trait CoverageSink {
    /// Static name, used in logs and to find a sink again after detaching it.
    fn name(&self) -> &'static str;

    fn observe(&mut self, event: &CoverageEvent);

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Forwards events to the engine's `__sanitizer_cov_trace_*` intrinsics.
///
/// Narrow divisions are widened to `div4`, matching what the compiler's own
/// instrumentation emits.
#[derive(Debug, Clone, Copy)]
pub struct EngineSink {
    intrinsics: &'static Intrinsics,
}

impl EngineSink {
    pub fn new() -> Self {
        Self {
            intrinsics: engine::intrinsics(),
        }
    }

    #[inline(always)]
    pub fn forward(&self, event: &CoverageEvent) {
        let i = self.intrinsics;
        // SAFETY: every pointer comes from the engine's own exports with the
        // matching C signature; truncating casts keep the width's bit pattern.
        unsafe {
            match (event.op, event.width) {
                (Op::Cmp, Width::W1) => {
                    if let Some(f) = i.cmp1 {
                        f(event.left as u8, event.right as u8)
                    }
                }
                (Op::Cmp, Width::W2) => {
                    if let Some(f) = i.cmp2 {
                        f(event.left as u16, event.right as u16)
                    }
                }
                (Op::Cmp, Width::W4) => {
                    if let Some(f) = i.cmp4 {
                        f(event.left as u32, event.right as u32)
                    }
                }
                (Op::Cmp, Width::W8) => {
                    if let Some(f) = i.cmp8 {
                        f(event.left, event.right)
                    }
                }
                (Op::Div, Width::W8) => {
                    if let Some(f) = i.div8 {
                        f(event.right)
                    }
                }
                (Op::Div, _) => {
                    if let Some(f) = i.div4 {
                        f(event.right as u32)
                    }
                }
            }
        }
    }
}

impl Default for EngineSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CoverageSink for EngineSink {
    fn name(&self) -> &'static str {
        "EngineSink"
    }

    fn observe(&mut self, event: &CoverageEvent) {
        self.forward(event);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Keeps every event it sees, in order.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub events: Vec<CoverageEvent>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn take(&mut self) -> Vec<CoverageEvent> {
        std::mem::take(&mut self.events)
    }
}

impl CoverageSink for RecordingSink {
    fn name(&self) -> &'static str {
        "RecordingSink"
    }

    fn observe(&mut self, event: &CoverageEvent) {
        self.events.push(*event);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
