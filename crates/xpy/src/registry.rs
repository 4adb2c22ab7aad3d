//! Function marshalling: controller callables cross the boundary as references.
//!
//! [`Context::marshal`] walks an exec context and replaces each callable with a
//! [`FunctionRef`] named after its context key. The callables go into the
//! [`FunctionRegistry`] under the id of the exec that carries them and leave it
//! when that exec's response is processed. While an exec is pending its names
//! are reserved: an overlapping exec that reuses one is rejected.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;

use crate::bridge::protocol::{ContextValue, CorrelationId, FunctionRef, FunctionReply};
use crate::error::BridgeError;

/// A controller-side function the running program may call.
#[async_trait]
pub trait HostFunction: Send + Sync + 'static {
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value>;
}

struct SyncFn<F>(F);

#[async_trait]
impl<F> HostFunction for SyncFn<F>
where
    F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        (self.0)(args)
    }
}

struct AsyncFn<F>(F);

#[async_trait]
impl<F, Fut> HostFunction for AsyncFn<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

pub fn host_fn<F>(f: F) -> Arc<dyn HostFunction>
where
    F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    Arc::new(SyncFn(f))
}

pub fn host_fn_async<F, Fut>(f: F) -> Arc<dyn HostFunction>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Arc::new(AsyncFn(f))
}

#[derive(Clone)]
pub enum ContextEntry {
    Value(Value),
    Function(Arc<dyn HostFunction>),
}

impl std::fmt::Debug for ContextEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// Names bound into the program's globals for one exec.
#[derive(Debug, Clone, Default)]
pub struct Context {
    entries: BTreeMap<String, ContextEntry>,
}

/// Wire form of a context plus the callables it referenced.
pub struct MarshalledContext {
    pub wire: BTreeMap<String, ContextValue>,
    pub functions: Vec<(String, Arc<dyn HostFunction>)>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, ContextEntry::Value(value.into()));
        self
    }

    pub fn with_function(mut self, name: impl Into<String>, function: Arc<dyn HostFunction>) -> Self {
        self.insert(name, ContextEntry::Function(function));
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, entry: ContextEntry) {
        self.entries.insert(name.into(), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn marshal(self) -> MarshalledContext {
        let mut wire = BTreeMap::new();
        let mut functions = Vec::new();
        for (name, entry) in self.entries {
            let value = match entry {
                ContextEntry::Value(value) => ContextValue::Value(value),
                ContextEntry::Function(function) => {
                    functions.push((name.clone(), function));
                    ContextValue::Function(FunctionRef::new(name.clone()))
                }
            };
            wire.insert(name, value);
        }
        MarshalledContext { wire, functions }
    }
}

struct Registered {
    owner: CorrelationId,
    function: Arc<dyn HostFunction>,
}

#[derive(Default)]
pub struct FunctionRegistry {
    entries: Mutex<HashMap<String, Registered>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, Registered>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register all of `functions` for the exec `owner`, or none of them.
    pub fn register_scope(
        &self,
        owner: CorrelationId,
        functions: Vec<(String, Arc<dyn HostFunction>)>,
    ) -> Result<(), BridgeError> {
        let mut entries = self.entries();
        if let Some((name, _)) = functions.iter().find(|(name, _)| entries.contains_key(name)) {
            return Err(BridgeError::FunctionNameConflict(name.clone()));
        }
        for (name, function) in functions {
            entries.insert(name, Registered { owner, function });
        }
        Ok(())
    }

    /// Drop every entry registered by `owner`.
    pub fn release_scope(&self, owner: CorrelationId) -> usize {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, registered| registered.owner != owner);
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn HostFunction>> {
        self.entries()
            .get(name)
            .map(|registered| Arc::clone(&registered.function))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Call a host function and turn every outcome, panics included, into one reply.
pub async fn invoke(function: Arc<dyn HostFunction>, args: Vec<Value>) -> FunctionReply {
    match AssertUnwindSafe(function.call(args)).catch_unwind().await {
        Ok(Ok(value)) => FunctionReply::ok(value),
        Ok(Err(e)) => FunctionReply::failed(format!("{e:#}")),
        Err(panic) => FunctionReply::failed(format!(
            "host function panicked: {}",
            panic_message(panic.as_ref())
        )),
    }
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constant(value: i64) -> Arc<dyn HostFunction> {
        host_fn(move |_| Ok(json!(value)))
    }

    #[test]
    fn marshal_replaces_functions_with_references() {
        let marshalled = Context::new()
            .with_value("n", 3)
            .with_function("answer", constant(42))
            .marshal();

        assert_eq!(marshalled.wire["n"], ContextValue::Value(json!(3)));
        assert_eq!(
            marshalled.wire["answer"],
            ContextValue::Function(FunctionRef::new("answer"))
        );
        assert_eq!(marshalled.functions.len(), 1);
        assert_eq!(marshalled.functions[0].0, "answer");
    }

    #[test]
    fn scopes_are_released_by_owner() {
        let registry = FunctionRegistry::new();
        registry
            .register_scope(0, vec![("a".to_string(), constant(1))])
            .unwrap();
        registry
            .register_scope(1, vec![("b".to_string(), constant(2))])
            .unwrap();

        assert_eq!(registry.release_scope(0), 1);
        assert!(!registry.contains("a"));
        assert!(registry.contains("b"));
        assert_eq!(registry.release_scope(0), 0);
    }

    #[test]
    fn overlapping_scope_with_same_name_is_rejected() {
        let registry = FunctionRegistry::new();
        registry
            .register_scope(0, vec![("f".to_string(), constant(1))])
            .unwrap();

        let err = registry
            .register_scope(
                1,
                vec![("g".to_string(), constant(2)), ("f".to_string(), constant(3))],
            )
            .unwrap_err();
        assert_eq!(err, BridgeError::FunctionNameConflict("f".to_string()));
        assert!(!registry.contains("g"), "rejected scope must not leave entries");

        registry.release_scope(0);
        registry
            .register_scope(1, vec![("f".to_string(), constant(3))])
            .unwrap();
    }

    #[tokio::test]
    async fn invoke_captures_value_error_and_panic() {
        let reply = invoke(constant(42), vec![]).await;
        assert_eq!(reply, FunctionReply::ok(json!(42)));

        let failing = host_fn(|_| Err(anyhow::anyhow!("no such user")));
        let reply = invoke(failing, vec![]).await;
        assert_eq!(reply.error.as_deref(), Some("no such user"));

        let panicking = host_fn(|_| panic!("bad state"));
        let reply = invoke(panicking, vec![]).await;
        assert_eq!(
            reply.error.as_deref(),
            Some("host function panicked: bad state")
        );
    }

    #[tokio::test]
    async fn async_functions_receive_arguments() {
        let sum = host_fn_async(|args: Vec<Value>| async move {
            tokio::task::yield_now().await;
            Ok(json!(args.iter().filter_map(Value::as_i64).sum::<i64>()))
        });
        let reply = invoke(sum, vec![json!(1), json!(2), json!(3)]).await;
        assert_eq!(reply.into_result(), Ok(json!(6)));
    }
}
