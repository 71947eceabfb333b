use std::ffi::c_int;
use std::fmt;
use thiserror::Error;

/// The dynamically typed result of a managed call.
///
/// Callables are free to return anything; only [`Value::Nil`] and integers
/// that fit the engine's `int` are accepted by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Runtime type name, as reported in contract violations.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Bytes(b) => write!(f, "{b:02x?}"),
        }
    }
}

impl From<()> for Value {
    fn from(_: ()) -> Self {
        Value::Nil
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Nil, Into::into)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Value::Bytes(value)
    }
}

macro_rules! int_into_value {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Value::Int(value as i64)
                }
            }
        )*
    };
}

int_into_value!(i8, i16, i32, i64, u8, u16, u32, isize);

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        // Out-of-range values become a float so the dispatcher rejects them
        // instead of silently wrapping.
        i64::try_from(value).map_or(Value::Float(value as f64), Value::Int)
    }
}

impl From<usize> for Value {
    fn from(value: usize) -> Self {
        Value::from(value as u64)
    }
}

/// Raised when a callable breaks the return contract. Always fatal.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ContractViolation {
    #[error("TypeError: fuzz target function did not return an integer or nil (got {type_name} {rendered})")]
    WrongReturnType {
        type_name: &'static str,
        rendered: String,
    },
    #[error("RangeError: fuzz target function returned {0}, which does not fit a C int")]
    OutOfRange(i64),
}

/// The part of a [`Value`] the engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The callable expressed no opinion; the input stays eligible for the corpus.
    NoOpinion,
    Code(c_int),
}

impl Verdict {
    pub fn code(self) -> c_int {
        match self {
            Verdict::NoOpinion => 0,
            Verdict::Code(code) => code,
        }
    }
}

impl TryFrom<Value> for Verdict {
    type Error = ContractViolation;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Nil => Ok(Verdict::NoOpinion),
            Value::Int(i) => c_int::try_from(i)
                .map(Verdict::Code)
                .map_err(|_| ContractViolation::OutOfRange(i)),
            other => Err(ContractViolation::WrongReturnType {
                type_name: other.type_name(),
                rendered: other.to_string(),
            }),
        }
    }
}
