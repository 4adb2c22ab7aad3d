//! Modules available to `import`.
//!
//! `math` ships with the engine. The others live in the package index and must
//! be installed first.

use xpy::EngineError;

use crate::value::{Val, repeat_str, type_error};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Function,
    Constant,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Member {
    pub name: &'static str,
    pub kind: MemberKind,
    pub signature: &'static str,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ModuleDef {
    pub name: &'static str,
    pub doc: &'static str,
    /// Importable without installing.
    pub builtin: bool,
    pub members: &'static [Member],
}

impl ModuleDef {
    pub fn member(&'static self, name: &str) -> Option<&'static Member> {
        self.members.iter().find(|m| m.name == name)
    }
}

const fn function(name: &'static str, signature: &'static str) -> Member {
    Member {
        name,
        kind: MemberKind::Function,
        signature,
    }
}

const fn constant(name: &'static str, signature: &'static str) -> Member {
    Member {
        name,
        kind: MemberKind::Constant,
        signature,
    }
}

pub static MODULES: &[ModuleDef] = &[
    ModuleDef {
        name: "math",
        doc: "Mathematical functions",
        builtin: true,
        members: &[
            function("abs", "abs(x)"),
            function("floor", "floor(x)"),
            constant("pi", "pi = 3.141592653589793"),
            function("sqrt", "sqrt(x)"),
        ],
    },
    ModuleDef {
        name: "strings",
        doc: "String helpers",
        builtin: false,
        members: &[
            function("lower", "lower(s)"),
            function("repeat", "repeat(s, n)"),
            function("upper", "upper(s)"),
        ],
    },
    ModuleDef {
        name: "stats",
        doc: "Descriptive statistics",
        builtin: false,
        members: &[
            function("mean", "mean(*values)"),
            function("total", "total(*values)"),
        ],
    },
];

pub fn find(name: &str) -> Option<&'static ModuleDef> {
    MODULES.iter().find(|m| m.name == name)
}

/// Value of a constant member.
pub fn constant_value(module: &ModuleDef, member: &Member) -> Option<Val> {
    match (module.name, member.name) {
        ("math", "pi") => Some(Val::Float(std::f64::consts::PI)),
        _ => None,
    }
}

pub fn call(module: &ModuleDef, member: &Member, args: &[Val]) -> Result<Val, EngineError> {
    let name = member.name;
    match (module.name, name) {
        ("math", "abs") => match one(name, args)? {
            Val::Int(n) => n
                .checked_abs()
                .map(Val::Int)
                .ok_or_else(|| EngineError::raised("OverflowError: integer overflow")),
            other => Ok(Val::Float(number(name, other)?.abs())),
        },
        ("math", "floor") => match one(name, args)? {
            Val::Int(n) => Ok(Val::Int(*n)),
            other => Ok(Val::Int(number(name, other)?.floor() as i64)),
        },
        ("math", "sqrt") => {
            let x = number(name, one(name, args)?)?;
            if x < 0.0 {
                return Err(EngineError::raised("ValueError: math domain error"));
            }
            Ok(Val::Float(x.sqrt()))
        }
        ("strings", "upper") => Ok(Val::Str(text(name, one(name, args)?)?.to_uppercase())),
        ("strings", "lower") => Ok(Val::Str(text(name, one(name, args)?)?.to_lowercase())),
        ("strings", "repeat") => {
            let [s, n] = args else {
                return Err(arity(name, 2, args.len()));
            };
            let Val::Int(n) = n else {
                return Err(type_error(format!(
                    "repeat() count must be int, not {}",
                    n.type_name()
                )));
            };
            repeat_str(text(name, s)?, *n)
        }
        ("stats", "total") => {
            let values = numbers(name, args)?;
            Ok(Val::Float(values.iter().sum()))
        }
        ("stats", "mean") => {
            let values = numbers(name, args)?;
            if values.is_empty() {
                return Err(EngineError::raised("ValueError: mean() requires at least one value"));
            }
            Ok(Val::Float(values.iter().sum::<f64>() / values.len() as f64))
        }
        _ => Err(EngineError::raised(format!(
            "AttributeError: module '{}' has no function '{name}'",
            module.name
        ))),
    }
}

pub fn arity(name: &str, expected: usize, got: usize) -> EngineError {
    type_error(format!(
        "{name}() takes {expected} argument{} but {got} were given",
        if expected == 1 { "" } else { "s" }
    ))
}

fn one<'a>(name: &str, args: &'a [Val]) -> Result<&'a Val, EngineError> {
    match args {
        [value] => Ok(value),
        _ => Err(arity(name, 1, args.len())),
    }
}

fn number(name: &str, value: &Val) -> Result<f64, EngineError> {
    value
        .as_f64()
        .ok_or_else(|| type_error(format!("{name}() expects a number, not {}", value.type_name())))
}

fn numbers(name: &str, args: &[Val]) -> Result<Vec<f64>, EngineError> {
    args.iter().map(|v| number(name, v)).collect()
}

fn text<'a>(name: &str, value: &'a Val) -> Result<&'a str, EngineError> {
    match value {
        Val::Str(s) => Ok(s),
        other => Err(type_error(format!(
            "{name}() expects a str, not {}",
            other.type_name()
        ))),
    }
}
