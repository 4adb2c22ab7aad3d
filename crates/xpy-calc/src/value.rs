//! Runtime values and operators.

use std::fmt;

use serde_json::Value;
use xpy::{EngineError, RemoteFunction};

use crate::builtins::Builtin;
use crate::modules::{Member, ModuleDef};
use crate::syntax::BinOp;

#[derive(Clone)]
pub enum Function {
    Builtin(Builtin),
    Member(&'static ModuleDef, &'static Member),
    /// A controller function bound through the exec context.
    Remote(RemoteFunction),
}

impl Function {
    pub fn name(&self) -> String {
        match self {
            Self::Builtin(builtin) => builtin.name().to_string(),
            Self::Member(module, member) => format!("{}.{}", module.name, member.name),
            Self::Remote(remote) => remote.name().to_string(),
        }
    }
}

#[derive(Clone)]
pub enum Val {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Lists and objects received from the controller; opaque to the language.
    Json(Value),
    Func(Function),
    Module(&'static ModuleDef),
}

/// Largest string a program may build, in bytes.
pub const MAX_STR_BYTES: usize = 16 * 1024 * 1024;

/// `s` repeated `n` times; negative counts give the empty string.
pub fn repeat_str(s: &str, n: i64) -> Result<Val, EngineError> {
    let count = usize::try_from(n.max(0)).map_err(|_| too_large())?;
    match s.len().checked_mul(count) {
        Some(len) if len <= MAX_STR_BYTES => Ok(Val::Str(s.repeat(count))),
        _ => Err(too_large()),
    }
}

fn too_large() -> EngineError {
    EngineError::raised("MemoryError: string too large")
}

pub fn type_error(message: impl fmt::Display) -> EngineError {
    EngineError::raised(format!("TypeError: {message}"))
}

impl Val {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Json(Value::Array(_)) => "list",
            Self::Json(_) => "dict",
            Self::Func(_) => "function",
            Self::Module(_) => "module",
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(n) => Some(*n as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn from_json(value: Value) -> Self {
        match value {
            Value::Null => Self::None,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => Self::Str(s),
            other => Self::Json(other),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Self::None => Value::Null,
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(n) => Value::from(*n),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Str(s) => Value::String(s.clone()),
            Self::Json(value) => value.clone(),
            Self::Func(_) | Self::Module(_) => Value::String(self.to_string()),
        }
    }

    pub fn equals(&self, other: &Val) -> bool {
        match (self, other) {
            (Self::None, Self::None) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Str(a), Self::Str(b)) => a == b,
            (Self::Json(a), Self::Json(b)) => a == b,
            (Self::Module(a), Self::Module(b)) => a.name == b.name,
            (Self::Func(a), Self::Func(b)) => a.name() == b.name(),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x == y,
                _ => false,
            },
        }
    }
}

impl fmt::Display for Val {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Float(x) if x.is_finite() && x.fract() == 0.0 && x.abs() < 1e16 => {
                write!(f, "{x:.1}")
            }
            Self::Float(x) => write!(f, "{x}"),
            Self::Str(s) => f.write_str(s),
            Self::Json(value) => write!(f, "{value}"),
            Self::Func(function) => write!(f, "<function {}>", function.name()),
            Self::Module(module) => write!(f, "<module {}>", module.name),
        }
    }
}

pub fn negate(value: Val) -> Result<Val, EngineError> {
    match value {
        Val::Int(n) => n
            .checked_neg()
            .map(Val::Int)
            .ok_or_else(|| EngineError::raised("OverflowError: integer overflow")),
        Val::Float(x) => Ok(Val::Float(-x)),
        other => Err(type_error(format!(
            "bad operand type for unary -: '{}'",
            other.type_name()
        ))),
    }
}

pub fn binary(op: BinOp, left: Val, right: Val) -> Result<Val, EngineError> {
    match op {
        BinOp::Eq => return Ok(Val::Bool(left.equals(&right))),
        BinOp::Ne => return Ok(Val::Bool(!left.equals(&right))),
        _ => {}
    }

    let unsupported = || {
        type_error(format!(
            "unsupported operand type(s) for {}: '{}' and '{}'",
            op.symbol(),
            left.type_name(),
            right.type_name()
        ))
    };

    match (&left, &right) {
        (Val::Int(a), Val::Int(b)) => int_op(op, *a, *b),
        (Val::Str(a), Val::Str(b)) => match op {
            BinOp::Add if a.len() + b.len() > MAX_STR_BYTES => Err(too_large()),
            BinOp::Add => Ok(Val::Str(format!("{a}{b}"))),
            BinOp::Lt => Ok(Val::Bool(a < b)),
            BinOp::Le => Ok(Val::Bool(a <= b)),
            BinOp::Gt => Ok(Val::Bool(a > b)),
            BinOp::Ge => Ok(Val::Bool(a >= b)),
            _ => Err(unsupported()),
        },
        (Val::Str(s), Val::Int(n)) | (Val::Int(n), Val::Str(s)) if op == BinOp::Mul => {
            repeat_str(s, *n)
        }
        _ => match (left.as_f64(), right.as_f64()) {
            (Some(a), Some(b)) => float_op(op, a, b),
            _ => Err(unsupported()),
        },
    }
}

fn int_op(op: BinOp, a: i64, b: i64) -> Result<Val, EngineError> {
    let overflow = || EngineError::raised("OverflowError: integer overflow");
    Ok(match op {
        BinOp::Add => Val::Int(a.checked_add(b).ok_or_else(overflow)?),
        BinOp::Sub => Val::Int(a.checked_sub(b).ok_or_else(overflow)?),
        BinOp::Mul => Val::Int(a.checked_mul(b).ok_or_else(overflow)?),
        BinOp::Rem => {
            if b == 0 {
                return Err(zero_division());
            }
            Val::Int(a.checked_rem_euclid(b).ok_or_else(overflow)?)
        }
        _ => return float_op(op, a as f64, b as f64),
    })
}

fn float_op(op: BinOp, a: f64, b: f64) -> Result<Val, EngineError> {
    Ok(match op {
        BinOp::Add => Val::Float(a + b),
        BinOp::Sub => Val::Float(a - b),
        BinOp::Mul => Val::Float(a * b),
        BinOp::Div => {
            if b == 0.0 {
                return Err(zero_division());
            }
            Val::Float(a / b)
        }
        BinOp::Rem => {
            if b == 0.0 {
                return Err(zero_division());
            }
            Val::Float(a.rem_euclid(b))
        }
        BinOp::Lt => Val::Bool(a < b),
        BinOp::Le => Val::Bool(a <= b),
        BinOp::Gt => Val::Bool(a > b),
        BinOp::Ge => Val::Bool(a >= b),
        BinOp::Eq => Val::Bool(a == b),
        BinOp::Ne => Val::Bool(a != b),
    })
}

fn zero_division() -> EngineError {
    EngineError::raised("ZeroDivisionError: division by zero")
}
