//! A small calculator language hosted behind the xpy bridge.
//!
//! [`CalcEngine`] implements [`xpy::Engine`]: integer and float arithmetic,
//! strings, `import` of a fixed module set, and calls into controller
//! functions bound through the exec context. It also backs the
//! `xpy-calc-worker` binary and the `xpy-calc` REPL.

pub mod builtins;
pub mod complete;
pub mod engine;
pub mod format;
pub mod modules;
pub mod syntax;
pub mod value;

pub use engine::CalcEngine;
pub use format::{FormatOptions, Quote};
pub use syntax::{Program, SyntaxError, parse};
