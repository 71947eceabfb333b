//! Built-in demo harnesses, selectable with `--builtin NAME`.
//!
//! None of them is instrumented by the compiler: everything the engine learns
//! about them comes through `Traced` operands and `relay::branch`.

use fuzzbridge_core::Value;
use fuzzbridge_core::relay::{self, Traced};

pub type Harness = fn(&[u8]) -> Value;

pub const NAMES: &[&str] = &["dummy", "branch", "cmp", "div", "oops"];

pub fn lookup(name: &str) -> Option<Harness> {
    let harness: Harness = match name {
        "dummy" => dummy,
        "branch" => branch,
        "cmp" => cmp,
        "div" => div,
        "oops" => oops,
        _ => return None,
    };
    Some(harness)
}

/// The input read as a big-endian integer, saturated at `u64::MAX`.
///
/// Saturation keeps what the harnesses test for: the value is zero only when
/// every byte is zero, and it equals a given `u64` only when the exact
/// integer does.
fn as_integer(data: &[u8]) -> u64 {
    let split = data.len().saturating_sub(8);
    let (high, low) = data.split_at(split);
    if high.iter().any(|&byte| byte != 0) {
        return u64::MAX;
    }
    low.iter()
        .fold(0u64, |acc, &byte| (acc << 8) | u64::from(byte))
}

fn dummy(_: &[u8]) -> Value {
    Value::Int(0)
}

fn branch(data: &[u8]) -> Value {
    if Traced(data.len()) == 4 {
        relay::branch();
        if Traced(data[0]) == b'F' {
            relay::branch();
            if Traced(data[1]) == b'U' {
                relay::branch();
                if Traced(data[2]) == b'Z' {
                    relay::branch();
                    if Traced(data[3]) == b'Z' {
                        panic!("TEST HARNESS BRANCH");
                    }
                }
            }
        }
    }
    Value::Int(0)
}

fn cmp(data: &[u8]) -> Value {
    if Traced(as_integer(data)) == u64::from(u32::from_be_bytes(*b"FUZZ")) {
        panic!("TEST HARNESS CMP");
    }
    Value::Int(0)
}

fn div(data: &[u8]) -> Value {
    let quotient = Traced(100u64) / Traced(as_integer(data));
    Value::from(quotient.into_inner())
}

fn oops(_: &[u8]) -> Value {
    Value::from("oops")
}

#[cfg(test)]
mod tests {
    use super::*;
    use fuzzbridge_core::relay::record;
    use fuzzbridge_core::{Op, Verdict};
    use std::panic::{AssertUnwindSafe, catch_unwind};

    fn faults(harness: Harness, data: &[u8]) -> bool {
        catch_unwind(AssertUnwindSafe(|| harness(data))).is_err()
    }

    #[test]
    fn every_name_resolves() {
        for name in NAMES {
            assert!(lookup(name).is_some(), "{name}");
        }
        assert!(lookup("nope").is_none());
    }

    #[test]
    fn branch_only_faults_on_fuzz() {
        assert!(!faults(branch, b"FUZ"));
        assert!(!faults(branch, b"FUZY"));
        assert!(faults(branch, b"FUZZ"));
    }

    #[test]
    fn branch_reports_every_byte_compare() {
        let (_, events) = record(|| branch(b"FUZY"));
        assert_eq!(events.len(), 5);
        assert!(events.iter().all(|e| e.op == Op::Cmp));
    }

    #[test]
    fn cmp_reports_the_magic_operand() {
        let (_, events) = record(|| cmp(b"AAAA"));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].right, 0x4655_5A5A);
        assert!(faults(cmp, b"FUZZ"));
        assert!(faults(cmp, b"\0FUZZ"));
    }

    #[test]
    fn long_inputs_keep_their_magnitude() {
        assert_eq!(as_integer(&[0x12, 0x34]), 0x1234);
        assert_eq!(as_integer(&[0; 12]), 0);
        assert_eq!(as_integer(&[1, 0, 0, 0, 0, 0, 0, 0, 0]), u64::MAX);
        assert_eq!(as_integer(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0x46, 0x55, 0x5A, 0x5A]), 0x4655_5A5A);
    }

    #[test]
    fn div_only_faults_on_a_zero_operand() {
        let nine_bytes: [u8; 9] = [1, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(!faults(div, &nine_bytes));
        assert_eq!(div(&nine_bytes), Value::Int(0));
        assert!(faults(div, &[0; 9]));
        assert!(!faults(cmp, &[1, 0, 0, 0, 0x46, 0x55, 0x5A, 0x5A, 0]));
    }

    #[test]
    fn div_faults_on_zero() {
        assert_eq!(div(&[4]), Value::Int(25));
        assert!(faults(div, b""));
        assert!(faults(div, &[0, 0]));
        let (_, events) = record(|| div(&[10]));
        assert_eq!(events[0].op, Op::Div);
        assert_eq!(events[0].right, 10);
    }

    #[test]
    fn oops_breaks_the_return_contract() {
        assert!(Verdict::try_from(oops(b"")).is_err());
        assert_eq!(Verdict::try_from(dummy(b"HI")), Ok(Verdict::Code(0)));
    }
}
