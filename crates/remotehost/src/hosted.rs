//! Hosted types and the worker-side registry.
//!
//! A hosted type declares its operations once as a table of named handlers. The worker
//! resolves the hosted type and the serializer by name from its [`Registry`], so nothing is
//! looked up reflectively at run time: an unknown name is a distinct, reportable fault.
//!
//! ```
//! use remotehost::{Arguments, Hosted, OperationError, Operations, Value};
//!
//! struct Greeter;
//!
//! impl Hosted for Greeter {
//!     fn operations() -> Operations<Self> {
//!         Operations::new().operation("Greet", 1, |_: &Greeter, args: Arguments| {
//!             let name: String = args.get(0)?;
//!             Ok(Value::from(format!("hello {name}")))
//!         })
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use crate::bridge::protocol::{FaultKind, RemoteFailure};
use crate::serializer::{JsonSerializer, MessageSerializer};
use crate::value::{FromValue, Value};

/// Failure of a single operation invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OperationError {
    #[error("argument {index}: expected {expected}, got {found}")]
    ArgumentType {
        index: usize,
        expected: &'static str,
        found: &'static str,
    },

    #[error("{0}")]
    Failed(String),
}

impl OperationError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

impl From<OperationError> for RemoteFailure {
    fn from(e: OperationError) -> Self {
        let kind = match e {
            OperationError::ArgumentType { .. } => FaultKind::ArgumentType,
            OperationError::Failed(_) => FaultKind::Operation,
        };
        RemoteFailure::new(kind, e.to_string())
    }
}

/// Decoded arguments of one call.
#[derive(Debug, Clone, Default)]
pub struct Arguments(Vec<Value>);

impl Arguments {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn raw(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }

    /// Convert argument `index`. A missing argument converts as Null, so optional trailing
    /// parameters may be omitted by handlers registered with a matching arity.
    pub fn get<T: FromValue>(&self, index: usize) -> Result<T, OperationError> {
        let value = self.0.get(index).cloned().unwrap_or_default();
        T::from_value(value).map_err(|e| OperationError::ArgumentType {
            index,
            expected: e.expected,
            found: e.found,
        })
    }
}

type Handler<T> = Arc<dyn Fn(&T, Arguments) -> Result<Value, OperationError> + Send + Sync>;

struct Operation<T> {
    arity: usize,
    handler: Handler<T>,
}

/// Operation table of a hosted type.
pub struct Operations<T> {
    ops: HashMap<String, Operation<T>>,
}

impl<T> Default for Operations<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Operations<T> {
    pub fn new() -> Self {
        Self {
            ops: HashMap::new(),
        }
    }

    /// Register `name` taking exactly `arity` arguments. A later registration under the same
    /// name replaces the earlier one.
    pub fn operation<F>(mut self, name: impl Into<String>, arity: usize, handler: F) -> Self
    where
        F: Fn(&T, Arguments) -> Result<Value, OperationError> + Send + Sync + 'static,
    {
        self.ops.insert(
            name.into(),
            Operation {
                arity,
                handler: Arc::new(handler),
            },
        );
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.ops.keys().map(String::as_str)
    }

    fn invoke(&self, target: &T, name: &str, args: Vec<Value>) -> Result<Value, RemoteFailure> {
        let op = self.ops.get(name).ok_or_else(|| {
            RemoteFailure::new(
                FaultKind::UnknownOperation,
                format!("no operation named '{name}'"),
            )
        })?;
        if args.len() != op.arity {
            return Err(RemoteFailure::new(
                FaultKind::Arity,
                format!(
                    "operation '{name}' takes {} argument(s), got {}",
                    op.arity,
                    args.len()
                ),
            ));
        }
        (op.handler)(target, Arguments::new(args)).map_err(RemoteFailure::from)
    }
}

/// A type whose instance can be hosted in a worker.
pub trait Hosted: Send + Sync + 'static {
    fn operations() -> Operations<Self>
    where
        Self: Sized;
}

/// A constructed hosted instance bound to its operation table.
pub trait Dispatch: Send + Sync {
    fn dispatch(&self, operation: &str, args: Vec<Value>) -> Result<Value, RemoteFailure>;
}

struct Bound<T> {
    instance: T,
    ops: Operations<T>,
}

impl<T: Send + Sync + 'static> Dispatch for Bound<T> {
    fn dispatch(&self, operation: &str, args: Vec<Value>) -> Result<Value, RemoteFailure> {
        self.ops.invoke(&self.instance, operation, args)
    }
}

/// Build a [`Dispatch`] for an already constructed instance.
pub fn bind<T: Hosted>(instance: T) -> Arc<dyn Dispatch> {
    Arc::new(Bound {
        instance,
        ops: T::operations(),
    })
}

type Factory = Arc<dyn Fn() -> Result<Arc<dyn Dispatch>, String> + Send + Sync>;

/// Names known to a worker: serializers and hosted types.
#[derive(Clone)]
pub struct Registry {
    serializers: HashMap<String, Arc<dyn MessageSerializer>>,
    hosted: HashMap<String, Factory>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Registry with the JSON serializer and no hosted types.
    pub fn new() -> Self {
        Self {
            serializers: HashMap::new(),
            hosted: HashMap::new(),
        }
        .with_serializer(Arc::new(JsonSerializer))
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializers
            .insert(serializer.name().to_string(), serializer);
        self
    }

    pub fn with_hosted<T, F>(self, name: impl Into<String>, factory: F) -> Self
    where
        T: Hosted,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.with_fallible_hosted(name, move || Ok::<_, String>(factory()))
    }

    /// Register a hosted type whose construction may fail. Failure is reported to the parent
    /// as a startup fault.
    pub fn with_fallible_hosted<T, F, E>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        T: Hosted,
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: std::fmt::Display,
    {
        let factory: Factory = Arc::new(move || {
            factory().map(bind).map_err(|e| e.to_string())
        });
        self.hosted.insert(name.into(), factory);
        self
    }

    pub fn resolve_serializer(&self, name: &str) -> Result<Arc<dyn MessageSerializer>, RemoteFailure> {
        self.serializers.get(name).cloned().ok_or_else(|| {
            RemoteFailure::new(
                FaultKind::StartupResolution,
                format!("unknown serializer '{name}'"),
            )
        })
    }

    /// Construct the hosted instance registered under `name`.
    pub fn resolve_hosted(&self, name: &str) -> Result<Arc<dyn Dispatch>, RemoteFailure> {
        let factory = self.hosted.get(name).ok_or_else(|| {
            RemoteFailure::new(
                FaultKind::StartupResolution,
                format!("unknown hosted type '{name}'"),
            )
        })?;
        factory().map_err(|e| {
            RemoteFailure::new(
                FaultKind::StartupResolution,
                format!("failed to construct '{name}': {e}"),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        hits: AtomicUsize,
    }

    impl Hosted for Counter {
        fn operations() -> Operations<Self> {
            Operations::new()
                .operation("Hit", 0, |c: &Counter, _| {
                    let n = c.hits.fetch_add(1, Ordering::SeqCst) + 1;
                    Ok(Value::Int(n as i64))
                })
                .operation("Add", 2, |_, args: Arguments| {
                    let a: i64 = args.get(0)?;
                    let b: i64 = args.get(1)?;
                    Ok(Value::Int(a + b))
                })
                .operation("Fail", 1, |_, args: Arguments| {
                    let msg: String = args.get(0)?;
                    Err(OperationError::failed(msg))
                })
        }
    }

    #[test]
    fn dispatch_invokes_operation_on_instance() {
        let hosted = bind(Counter::default());
        assert_eq!(hosted.dispatch("Hit", vec![]).unwrap(), Value::Int(1));
        assert_eq!(hosted.dispatch("Hit", vec![]).unwrap(), Value::Int(2));
        assert_eq!(
            hosted
                .dispatch("Add", vec![Value::Int(2), Value::Int(3)])
                .unwrap(),
            Value::Int(5)
        );
    }

    #[test]
    fn unknown_operation_fault() {
        let err = bind(Counter::default())
            .dispatch("Nope", vec![])
            .unwrap_err();
        assert_eq!(err.kind, FaultKind::UnknownOperation);
        assert!(err.message.contains("Nope"));
    }

    #[test]
    fn arity_fault() {
        let err = bind(Counter::default())
            .dispatch("Add", vec![Value::Int(1)])
            .unwrap_err();
        assert_eq!(err.kind, FaultKind::Arity);
        assert_eq!(err.message, "operation 'Add' takes 2 argument(s), got 1");
    }

    #[test]
    fn argument_type_fault() {
        let err = bind(Counter::default())
            .dispatch("Add", vec![Value::Int(1), Value::from("two")])
            .unwrap_err();
        assert_eq!(err.kind, FaultKind::ArgumentType);
        assert_eq!(err.message, "argument 1: expected int, got string");
    }

    #[test]
    fn operation_table_lists_names() {
        let mut names: Vec<_> = Counter::operations().names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, ["Add", "Fail", "Hit"]);

        let args = Arguments::new(vec![Value::Int(1)]);
        assert_eq!(args.raw(0), Some(&Value::Int(1)));
        assert_eq!(args.raw(1), None);
    }

    #[test]
    fn operation_error_carries_message() {
        let err = bind(Counter::default())
            .dispatch("Fail", vec![Value::from("kaboom")])
            .unwrap_err();
        assert_eq!(err, RemoteFailure::new(FaultKind::Operation, "kaboom"));
    }

    #[test]
    fn registry_resolves_json_by_default() {
        let registry = Registry::new();
        assert_eq!(registry.resolve_serializer("json").unwrap().name(), "json");
        let err = registry.resolve_serializer("xml").err().unwrap();
        assert_eq!(err.kind, FaultKind::StartupResolution);
    }

    #[test]
    fn registry_constructs_hosted_per_resolve() {
        let registry = Registry::new().with_hosted("Counter", Counter::default);
        let a = registry.resolve_hosted("Counter").unwrap();
        let b = registry.resolve_hosted("Counter").unwrap();
        assert_eq!(a.dispatch("Hit", vec![]).unwrap(), Value::Int(1));
        assert_eq!(b.dispatch("Hit", vec![]).unwrap(), Value::Int(1));
        assert!(registry.resolve_hosted("Other").is_err());
    }

    #[test]
    fn failed_construction_is_startup_fault() {
        let registry = Registry::new()
            .with_fallible_hosted("Broken", || Err::<Counter, _>("no model file"));
        let err = registry.resolve_hosted("Broken").err().unwrap();
        assert_eq!(err.kind, FaultKind::StartupResolution);
        assert_eq!(err.message, "failed to construct 'Broken': no model file");
    }
}
