//! Inline 8-bit branch counters for code reported through
//! [`relay::branch`](crate::relay::branch).
//!
//! The table is handed to the engine once, before its driver starts, and is
//! never reset or resized afterwards.

use crate::engine;
use std::panic::Location;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU8, Ordering};
use tracing::{debug, warn};

pub const COUNTERS_LEN: usize = 1 << 16;

const PC_FLAG_FUNC_ENTRY: usize = 1;

static COUNTERS: [AtomicU8; COUNTERS_LEN] = [const { AtomicU8::new(0) }; COUNTERS_LEN];

static PC_TABLE: OnceLock<Box<[usize]>> = OnceLock::new();

static REGISTERED: OnceLock<bool> = OnceLock::new();

/// Counter index for a source location.
pub fn slot(location: &Location<'_>) -> usize {
    // FNV-1a over the location; stable for the life of the binary.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in location
        .file()
        .bytes()
        .chain(location.line().to_le_bytes())
        .chain(location.column().to_le_bytes())
    {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    (hash as usize) % COUNTERS_LEN
}

/// Wrapping increment, like the compiler's inline counters.
#[inline(always)]
pub fn hit(location: &Location<'_>) {
    let counter = &COUNTERS[slot(location)];
    counter.store(counter.load(Ordering::Relaxed).wrapping_add(1), Ordering::Relaxed);
}

pub fn value(location: &Location<'_>) -> u8 {
    COUNTERS[slot(location)].load(Ordering::Relaxed)
}

/// Number of counters that have been hit at least once.
pub fn covered() -> usize {
    COUNTERS
        .iter()
        .filter(|c| c.load(Ordering::Relaxed) != 0)
        .count()
}

/// Hands the counter table to the engine. Idempotent.
///
/// Returns whether the engine accepted the table; without an engine loaded
/// the counters still work locally but produce no feedback.
pub fn register_with_engine() -> bool {
    *REGISTERED.get_or_init(|| {
        let intrinsics = engine::intrinsics();
        let Some(counters_init) = intrinsics.counters_init else {
            warn!("engine exports no 8-bit counter registration; branch feedback disabled");
            return false;
        };

        let start = COUNTERS.as_ptr() as *mut u8;
        // SAFETY: `AtomicU8` has the layout of `u8`, and the engine only
        // performs relaxed byte increments on the table.
        unsafe { counters_init(start, start.add(COUNTERS_LEN)) };

        if let Some(pcs_init) = intrinsics.pcs_init {
            let table = PC_TABLE.get_or_init(|| {
                // (pc, flags) pairs; pseudo-PCs are the slot index plus one.
                (0..COUNTERS_LEN)
                    .flat_map(|i| [i + 1, if i == 0 { PC_FLAG_FUNC_ENTRY } else { 0 }])
                    .collect()
            });
            let range = table.as_ptr_range();
            // SAFETY: the table lives in a static and is never mutated again.
            unsafe { pcs_init(range.start, range.end) };
        }

        debug!(len = COUNTERS_LEN, "registered branch counters with the engine");
        true
    })
}
