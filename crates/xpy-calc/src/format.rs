//! Canonical source formatting.
//!
//! Output is one statement per line, single spaces around binary operators and
//! `=`, `", "` between call arguments, and only the parentheses precedence
//! requires.

use serde_json::{Map, Value};
use xpy::EngineError;

use crate::syntax::{self, Expr, POSTFIX_PRECEDENCE, Stmt, UNARY_PRECEDENCE};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Quote {
    #[default]
    Double,
    Single,
}

impl Quote {
    fn char(self) -> char {
        match self {
            Self::Double => '"',
            Self::Single => '\'',
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormatOptions {
    pub quote: Quote,
}

impl FormatOptions {
    pub fn from_map(options: &Map<String, Value>) -> Result<Self, EngineError> {
        let mut parsed = Self::default();
        for (key, value) in options {
            match key.as_str() {
                "quote" => {
                    parsed.quote = match value.as_str() {
                        Some("double") => Quote::Double,
                        Some("single") => Quote::Single,
                        _ => {
                            return Err(EngineError::raised(format!(
                                "FormatError: option 'quote' must be \"single\" or \"double\", got {value}"
                            )));
                        }
                    }
                }
                other => {
                    return Err(EngineError::raised(format!(
                        "FormatError: unknown option '{other}'"
                    )));
                }
            }
        }
        Ok(parsed)
    }
}

pub fn format_source(code: &str, options: &FormatOptions) -> Result<String, EngineError> {
    let program = syntax::parse(code).map_err(|e| EngineError::raised(e.to_string()))?;
    let lines: Vec<String> = program
        .lines
        .iter()
        .map(|line| statement(&line.stmt, options))
        .collect();
    Ok(lines.join("\n"))
}

fn statement(stmt: &Stmt, options: &FormatOptions) -> String {
    match stmt {
        Stmt::Import(name) => format!("import {name}"),
        Stmt::Assign(name, value) => format!("{name} = {}", expr(value, options)),
        Stmt::Expr(value) => expr(value, options),
    }
}

fn expr(e: &Expr, options: &FormatOptions) -> String {
    match e {
        Expr::Int(n) => n.to_string(),
        Expr::Float(x) => crate::value::Val::Float(*x).to_string(),
        Expr::Str(s) => quoted(s, options.quote),
        Expr::Bool(b) => b.to_string(),
        Expr::None => "none".to_string(),
        Expr::Name(name) => name.clone(),
        Expr::Neg(inner) => format!("-{}", wrap(inner, inner.precedence() < UNARY_PRECEDENCE, options)),
        Expr::Binary(op, left, right) => {
            let p = op.precedence();
            let comparison = p == 1;
            let left = wrap(left, left.precedence() < p || (comparison && left.precedence() == 1), options);
            let right = wrap(right, right.precedence() <= p, options);
            format!("{left} {} {right}", op.symbol())
        }
        Expr::Call(callee, args) => {
            let args: Vec<String> = args.iter().map(|a| expr(a, options)).collect();
            format!(
                "{}({})",
                wrap(callee, callee.precedence() < POSTFIX_PRECEDENCE, options),
                args.join(", ")
            )
        }
        Expr::Attr(owner, name) => format!(
            "{}.{name}",
            wrap(owner, owner.precedence() < POSTFIX_PRECEDENCE, options)
        ),
    }
}

fn wrap(e: &Expr, parens: bool, options: &FormatOptions) -> String {
    let text = expr(e, options);
    if parens { format!("({text})") } else { text }
}

fn quoted(s: &str, quote: Quote) -> String {
    let q = quote.char();
    let mut out = String::with_capacity(s.len() + 2);
    out.push(q);
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            c if c == q => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(q);
    out
}
