//! The calc interpreter behind the worker.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::LocalBoxFuture;
use serde_json::{Map, Value};
use xpy::{Binding, Completions, Engine, EngineError, InterruptSignal, RunOutput};

use crate::builtins::Builtin;
use crate::format::{FormatOptions, format_source};
use crate::modules::{self, MemberKind};
use crate::syntax::{self, Expr, Stmt};
use crate::value::{self, Function, Val, type_error};

/// `sleep` re-checks the interrupt flag at this interval.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Default)]
struct Output {
    stdout: String,
    stderr: String,
}

/// Globals persist across execs; output buffers are per exec.
#[derive(Default)]
pub struct CalcEngine {
    globals: RefCell<HashMap<String, Val>>,
    installed: RefCell<HashSet<String>>,
    interrupt: RefCell<Option<InterruptSignal>>,
    output: RefCell<Output>,
    bootstrap_error: Option<String>,
}

impl CalcEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// An engine whose bootstrap fails with `message`.
    pub fn with_bootstrap_error(mut self, message: impl Into<String>) -> Self {
        self.bootstrap_error = Some(message.into());
        self
    }

    fn check_interrupt(&self) -> Result<(), EngineError> {
        match self.interrupt.borrow().as_ref() {
            Some(signal) if signal.is_requested() => {
                signal.clear();
                Err(EngineError::Interrupted)
            }
            _ => Ok(()),
        }
    }

    fn importable(&self, module: &modules::ModuleDef) -> bool {
        module.builtin || self.installed.borrow().contains(module.name)
    }

    async fn execute(&self, stmt: &Stmt) -> Result<Option<Val>, EngineError> {
        match stmt {
            Stmt::Import(name) => {
                let module = modules::find(name)
                    .filter(|m| self.importable(m))
                    .ok_or_else(|| {
                        EngineError::raised(format!("ModuleNotFoundError: no module named '{name}'"))
                    })?;
                self.globals
                    .borrow_mut()
                    .insert(name.clone(), Val::Module(module));
                Ok(None)
            }
            Stmt::Assign(name, expr) => {
                let value = self.eval(expr).await?;
                self.globals.borrow_mut().insert(name.clone(), value);
                Ok(None)
            }
            Stmt::Expr(expr) => self.eval(expr).await.map(Some),
        }
    }

    fn eval<'a>(&'a self, expr: &'a Expr) -> LocalBoxFuture<'a, Result<Val, EngineError>> {
        async move {
            Ok(match expr {
                Expr::Int(n) => Val::Int(*n),
                Expr::Float(x) => Val::Float(*x),
                Expr::Str(s) => Val::Str(s.clone()),
                Expr::Bool(b) => Val::Bool(*b),
                Expr::None => Val::None,
                Expr::Name(name) => self.lookup(name)?,
                Expr::Neg(inner) => value::negate(self.eval(inner).await?)?,
                Expr::Binary(op, left, right) => {
                    let left = self.eval(left).await?;
                    let right = self.eval(right).await?;
                    value::binary(*op, left, right)?
                }
                Expr::Attr(owner, name) => attribute(self.eval(owner).await?, name)?,
                Expr::Call(callee, args) => {
                    let callee = self.eval(callee).await?;
                    let mut values = Vec::with_capacity(args.len());
                    for arg in args {
                        values.push(self.eval(arg).await?);
                    }
                    self.check_interrupt()?;
                    self.call(callee, values).await?
                }
            })
        }
        .boxed_local()
    }

    fn lookup(&self, name: &str) -> Result<Val, EngineError> {
        if let Some(value) = self.globals.borrow().get(name) {
            return Ok(value.clone());
        }
        Builtin::lookup(name)
            .map(|b| Val::Func(Function::Builtin(b)))
            .ok_or_else(|| EngineError::raised(format!("NameError: name '{name}' is not defined")))
    }

    async fn call(&self, callee: Val, args: Vec<Val>) -> Result<Val, EngineError> {
        match callee {
            Val::Func(Function::Builtin(builtin)) => self.call_builtin(builtin, args).await,
            Val::Func(Function::Member(module, member)) => modules::call(module, member, &args),
            Val::Func(Function::Remote(remote)) => {
                let args = args.iter().map(Val::to_json).collect();
                remote
                    .call(args)
                    .await
                    .map(Val::from_json)
                    .map_err(|e| EngineError::raised(format!("HostFunctionError: {e}")))
            }
            other => Err(type_error(format!(
                "'{}' object is not callable",
                other.type_name()
            ))),
        }
    }

    async fn call_builtin(&self, builtin: Builtin, args: Vec<Val>) -> Result<Val, EngineError> {
        let name = builtin.name();
        match builtin {
            Builtin::Print | Builtin::Eprint => {
                let line = args
                    .iter()
                    .map(Val::to_string)
                    .collect::<Vec<_>>()
                    .join(" ");
                let mut output = self.output.borrow_mut();
                let stream = if builtin == Builtin::Print {
                    &mut output.stdout
                } else {
                    &mut output.stderr
                };
                stream.push_str(&line);
                stream.push('\n');
                Ok(Val::None)
            }
            Builtin::Str => Ok(Val::Str(single(name, &args)?.to_string())),
            Builtin::Len => match single(name, &args)? {
                Val::Str(s) => Ok(Val::Int(s.chars().count() as i64)),
                Val::Json(Value::Array(items)) => Ok(Val::Int(items.len() as i64)),
                Val::Json(Value::Object(map)) => Ok(Val::Int(map.len() as i64)),
                other => Err(type_error(format!(
                    "object of type '{}' has no len()",
                    other.type_name()
                ))),
            },
            Builtin::Raise => Err(EngineError::raised(format!(
                "Error: {}",
                single(name, &args)?
            ))),
            Builtin::Sleep => {
                let ms = match single(name, &args)? {
                    Val::Int(ms) if *ms >= 0 => *ms as u64,
                    other => {
                        return Err(type_error(format!(
                            "sleep() expects a non-negative int, not {other}"
                        )));
                    }
                };
                let deadline = tokio::time::Instant::now() + Duration::from_millis(ms);
                loop {
                    self.check_interrupt()?;
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Ok(Val::None);
                    }
                    tokio::time::sleep((deadline - now).min(SLEEP_SLICE)).await;
                }
            }
            Builtin::Spin => {
                if !args.is_empty() {
                    return Err(modules::arity(name, 0, args.len()));
                }
                if self.interrupt.borrow().is_none() {
                    return Err(EngineError::raised(
                        "RuntimeError: spin() would never return without an interrupt signal",
                    ));
                }
                loop {
                    self.check_interrupt()?;
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}

fn single<'a>(name: &str, args: &'a [Val]) -> Result<&'a Val, EngineError> {
    match args {
        [value] => Ok(value),
        _ => Err(modules::arity(name, 1, args.len())),
    }
}

fn attribute(owner: Val, name: &str) -> Result<Val, EngineError> {
    let Val::Module(module) = owner else {
        return Err(EngineError::raised(format!(
            "AttributeError: '{}' object has no attribute '{name}'",
            owner.type_name()
        )));
    };
    let member = module.member(name).ok_or_else(|| {
        EngineError::raised(format!(
            "AttributeError: module '{}' has no attribute '{name}'",
            module.name
        ))
    })?;
    match member.kind {
        MemberKind::Function => Ok(Val::Func(Function::Member(module, member))),
        MemberKind::Constant => modules::constant_value(module, member).ok_or_else(|| {
            EngineError::raised(format!(
                "AttributeError: module '{}' has no attribute '{name}'",
                module.name
            ))
        }),
    }
}

#[async_trait(?Send)]
impl Engine for CalcEngine {
    async fn bootstrap(&self) -> Result<(), EngineError> {
        if let Some(message) = &self.bootstrap_error {
            return Err(EngineError::raised(message.clone()));
        }
        tracing::debug!(modules = modules::MODULES.len(), "Calc engine loaded");
        Ok(())
    }

    fn register_interrupt(&self, signal: InterruptSignal) -> bool {
        *self.interrupt.borrow_mut() = Some(signal);
        true
    }

    fn bind(&self, name: &str, binding: Binding) {
        let value = match binding {
            Binding::Value(value) => Val::from_json(value),
            Binding::Function(remote) => Val::Func(Function::Remote(remote)),
        };
        self.globals.borrow_mut().insert(name.to_string(), value);
    }

    fn unbind(&self, name: &str) {
        self.globals.borrow_mut().remove(name);
    }

    async fn run(&self, code: &str) -> Result<RunOutput, EngineError> {
        *self.output.borrow_mut() = Output::default();
        let program = syntax::parse(code).map_err(|e| EngineError::raised(e.to_string()))?;

        let mut last = None;
        for line in &program.lines {
            self.check_interrupt()?;
            last = self.execute(&line.stmt).await?;
        }

        let output = std::mem::take(&mut *self.output.borrow_mut());
        let result = match last {
            None | Some(Val::None) => Value::Null,
            Some(value) => Value::String(value.to_string()),
        };
        Ok(RunOutput {
            result,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn complete(
        &self,
        code: &str,
        line: u32,
        column: u32,
    ) -> Result<Completions, EngineError> {
        let globals = self.globals.borrow();
        Ok(crate::complete::complete(code, line, column, &globals, |m| {
            self.importable(m)
        }))
    }

    async fn install(&self, package: &str) -> Result<(), EngineError> {
        match modules::find(package) {
            Some(module) if module.builtin => {
                tracing::debug!(%package, "Package ships with the engine");
                Ok(())
            }
            Some(module) => {
                self.installed.borrow_mut().insert(module.name.to_string());
                tracing::info!(%package, "Installed package");
                Ok(())
            }
            None => Err(EngineError::raised(format!(
                "PackageNotFoundError: no package named '{package}'"
            ))),
        }
    }

    async fn format(&self, code: &str, options: &Map<String, Value>) -> Result<String, EngineError> {
        let options = FormatOptions::from_map(options)?;
        format_source(code, &options)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn run(engine: &CalcEngine, code: &str) -> Result<RunOutput, EngineError> {
        engine.run(code).await
    }

    #[tokio::test]
    async fn result_is_last_expression() {
        let engine = CalcEngine::new();
        let output = run(&engine, "x = 4\nprint('x is', x)\nx / 2").await.unwrap();
        assert_eq!(output.result, json!("2.0"));
        assert_eq!(output.stdout, "x is 4\n");

        let output = run(&engine, "y = x + 1").await.unwrap();
        assert_eq!(output.result, Value::Null);
        assert_eq!(output.stdout, "", "output buffers reset per run");

        let output = run(&engine, "eprint('warn'); y").await.unwrap();
        assert_eq!(output.stderr, "warn\n");
        assert_eq!(output.result, json!("5"));
    }

    #[tokio::test]
    async fn errors_are_raised() {
        let engine = CalcEngine::new();
        assert_eq!(
            run(&engine, "nope").await.unwrap_err(),
            EngineError::raised("NameError: name 'nope' is not defined")
        );
        assert_eq!(
            run(&engine, "raise('bad input')").await.unwrap_err(),
            EngineError::raised("Error: bad input")
        );
        assert_eq!(
            run(&engine, "3(1)").await.unwrap_err(),
            EngineError::raised("TypeError: 'int' object is not callable")
        );
        assert!(matches!(
            run(&engine, "x = ").await.unwrap_err(),
            EngineError::Raised(message) if message.starts_with("SyntaxError")
        ));
    }

    #[tokio::test]
    async fn imports_require_installation() {
        let engine = CalcEngine::new();
        let output = run(&engine, "import math\nmath.floor(math.pi)").await.unwrap();
        assert_eq!(output.result, json!("3"));

        assert_eq!(
            run(&engine, "import stats").await.unwrap_err(),
            EngineError::raised("ModuleNotFoundError: no module named 'stats'")
        );
        engine.install("stats").await.unwrap();
        let output = run(&engine, "import stats\nstats.mean(1, 2)").await.unwrap();
        assert_eq!(output.result, json!("1.5"));

        assert_eq!(
            engine.install("left-pad").await.unwrap_err(),
            EngineError::raised("PackageNotFoundError: no package named 'left-pad'")
        );
    }

    #[tokio::test]
    async fn bound_values_are_visible_until_unbound() {
        let engine = CalcEngine::new();
        engine.bind("limit", Binding::Value(json!(3)));
        engine.bind("items", Binding::Value(json!(["a", "b"])));
        let output = run(&engine, "limit * len(items)").await.unwrap();
        assert_eq!(output.result, json!("6"));

        engine.unbind("limit");
        assert!(run(&engine, "limit").await.is_err());
    }

    #[tokio::test]
    async fn interrupt_stops_spin_and_sleep() {
        let engine = CalcEngine::new();
        assert!(matches!(
            run(&engine, "spin()").await.unwrap_err(),
            EngineError::Raised(message) if message.starts_with("RuntimeError")
        ));

        let signal = InterruptSignal::new();
        assert!(engine.register_interrupt(signal.clone()));
        signal.request();
        assert_eq!(run(&engine, "spin()").await.unwrap_err(), EngineError::Interrupted);
        assert!(!signal.is_requested(), "observing the flag consumes it");

        let (result, ()) = tokio::join!(run(&engine, "sleep(60000)"), async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            signal.request();
        });
        assert_eq!(result.unwrap_err(), EngineError::Interrupted);
    }

    #[tokio::test]
    async fn bootstrap_error_is_reported() {
        let engine = CalcEngine::new().with_bootstrap_error("interpreter image missing");
        assert_eq!(
            engine.bootstrap().await.unwrap_err(),
            EngineError::raised("interpreter image missing")
        );
        assert!(CalcEngine::new().bootstrap().await.is_ok());
    }

    #[tokio::test]
    async fn complete_sees_globals_and_installed_modules() {
        let engine = CalcEngine::new();
        run(&engine, "counter = 1").await.unwrap();
        let completions = engine.complete("cou", 1, 3).await.unwrap();
        assert_eq!(completions.matches.len(), 1);
        assert_eq!(completions.matches[0].full_name, "__main__.counter");

        engine.install("strings").await.unwrap();
        let completions = engine.complete("import st", 1, 9).await.unwrap();
        let names: Vec<&str> = completions.matches.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["strings"]);
    }
}
