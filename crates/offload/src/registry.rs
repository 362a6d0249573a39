//! Operation registry for worker execution contexts.
//!
//! Operations are registered by name through a [`Module`], which writes into
//! an [`OperationSink`]. Workers back the module with a [`FunctionRegistry`];
//! the master backs it with [`Inert`], so the same declaration code runs in
//! both contexts but only workers retain anything.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{OffloadError, OperationError};

/// A callable exposed by a worker.
pub type Operation = Arc<dyn Fn(&mut Args) -> Result<Invocation, OperationError> + Send + Sync>;

/// Signature of a source: a function that declares a group of operations.
pub type Declare = fn(&mut Module<'_>);

// ── Invocation ──────────────────────────────────────────────────────

/// What one application step of an operation produced.
pub enum Invocation {
    /// A final, serializable result.
    Value(Value),

    /// A further callable, applied to the remaining arguments.
    Curried(Operation),

    /// A result (or further step) that completes asynchronously.
    Deferred(BoxFuture<'static, Result<Invocation, OperationError>>),
}

impl Invocation {
    /// Serialize `value` into a final result.
    pub fn value<T: Serialize>(value: T) -> Result<Self, OperationError> {
        serde_json::to_value(value)
            .map(Self::Value)
            .map_err(|e| OperationError::failed(format!("result is not serializable: {e}")))
    }

    pub fn curried<F>(next: F) -> Self
    where
        F: Fn(&mut Args) -> Result<Invocation, OperationError> + Send + Sync + 'static,
    {
        Self::Curried(Arc::new(next))
    }

    pub fn deferred<Fut>(future: Fut) -> Self
    where
        Fut: Future<Output = Result<Invocation, OperationError>> + Send + 'static,
    {
        Self::Deferred(Box::pin(future))
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Curried(_) => f.write_str("Curried(..)"),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

// ── Args ────────────────────────────────────────────────────────────

/// Positional cursor over a call's arguments.
///
/// Each application step takes what it needs from the front; a curried step
/// sees whatever the previous steps left behind.
#[derive(Debug)]
pub struct Args {
    values: std::vec::IntoIter<Value>,
    position: usize,
    worker_id: usize,
}

impl Args {
    pub fn new(values: Vec<Value>, worker_id: usize) -> Self {
        Self {
            values: values.into_iter(),
            position: 0,
            worker_id,
        }
    }

    /// Take and deserialize the next argument.
    pub fn next<T: DeserializeOwned>(&mut self) -> Result<T, OperationError> {
        let position = self.position;
        let value = self
            .next_value()
            .ok_or(OperationError::MissingArgument(position))?;
        serde_json::from_value(value).map_err(|e| OperationError::InvalidArgument {
            position,
            message: e.to_string(),
        })
    }

    /// Take the next argument if one is left.
    pub fn next_opt<T: DeserializeOwned>(&mut self) -> Result<Option<T>, OperationError> {
        if self.is_empty() {
            return Ok(None);
        }
        self.next().map(Some)
    }

    pub fn next_value(&mut self) -> Option<Value> {
        let value = self.values.next()?;
        self.position += 1;
        Some(value)
    }

    /// Take every remaining argument.
    pub fn rest(&mut self) -> Vec<Value> {
        let rest: Vec<Value> = self.values.by_ref().collect();
        self.position += rest.len();
        rest
    }

    pub fn remaining(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Index of the next argument relative to the whole call.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Ordinal of the worker executing this call.
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }
}

// ── Sinks ───────────────────────────────────────────────────────────

/// Destination for operation declarations.
pub trait OperationSink {
    fn insert(&mut self, name: &str, operation: Operation);
}

/// Master-side sink: declarations are accepted and discarded.
#[derive(Debug, Default, Clone, Copy)]
pub struct Inert;

impl OperationSink for Inert {
    fn insert(&mut self, _name: &str, _operation: Operation) {}
}

/// Name → operation mapping owned by one worker context.
#[derive(Default)]
pub struct FunctionRegistry {
    operations: HashMap<String, Operation>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry by loading every source in order.
    pub fn from_sources(sources: &[Source], debug: bool) -> Self {
        let mut registry = Self::new();
        for source in sources {
            source.load(&mut registry, debug);
        }
        registry
    }

    /// Store `operation` under `name`.
    ///
    /// Last registration wins; returns `true` when an earlier entry was replaced.
    pub fn register(&mut self, name: impl Into<String>, operation: Operation) -> bool {
        self.operations.insert(name.into(), operation).is_some()
    }

    /// Look up an operation by name.
    pub fn lookup(&self, name: &str) -> Result<Operation, OffloadError> {
        self.operations
            .get(name)
            .cloned()
            .ok_or_else(|| OffloadError::UnknownOperation(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

impl OperationSink for FunctionRegistry {
    fn insert(&mut self, name: &str, operation: Operation) {
        if self.register(name, operation) {
            debug!(operation = %name, "operation re-registered, previous entry replaced");
        }
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("operations", &self.names())
            .finish()
    }
}

// ── Module / Source ─────────────────────────────────────────────────

/// Declaration handle passed to a source's [`Declare`] function.
pub struct Module<'a> {
    source: &'a str,
    sink: &'a mut dyn OperationSink,
    debug: bool,
}

impl<'a> Module<'a> {
    pub fn new(source: &'a str, sink: &'a mut dyn OperationSink, debug: bool) -> Self {
        Self {
            source,
            sink,
            debug,
        }
    }

    pub fn source(&self) -> &str {
        self.source
    }

    /// Expose `operation` under `name`.
    ///
    /// In a process worker stdout carries the message channel: an operation
    /// must not print to it (`println!` and friends). Log through `tracing`,
    /// which writes to stderr, or use `eprintln!`.
    pub fn operation<F>(&mut self, name: &str, operation: F) -> &mut Self
    where
        F: Fn(&mut Args) -> Result<Invocation, OperationError> + Send + Sync + 'static,
    {
        if self.debug {
            debug!(source = %self.source, operation = %name, "loading operation");
        }
        self.sink.insert(name, Arc::new(operation));
        self
    }
}

/// A named group of operation declarations.
#[derive(Clone)]
pub struct Source {
    pub name: String,
    pub declare: Declare,
}

impl Source {
    pub fn new(name: impl Into<String>, declare: Declare) -> Self {
        Self {
            name: name.into(),
            declare,
        }
    }

    /// Run the declarations against `sink`.
    pub fn load(&self, sink: &mut dyn OperationSink, debug: bool) {
        let mut module = Module::new(&self.name, sink, debug);
        (self.declare)(&mut module);
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Source").field("name", &self.name).finish()
    }
}
