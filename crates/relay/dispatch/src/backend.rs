//! The closed set of backend variants.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_types::{BackendKind, DispatchError};

use crate::agent::AgentTransport;

/// Synchronous in-process tool.
pub trait ToolHandler: Send + Sync {
    fn call(&self, input: &Value) -> Result<Value, DispatchError>;
}

/// Asynchronous in-process function.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn call(&self, input: Value) -> Result<Value, DispatchError>;
}

/// Source code executed by the sandbox runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeUnit {
    /// Key into the sandbox's interpreter table.
    pub language: String,
    pub source: String,
}

impl CodeUnit {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
        }
    }

    pub fn python(source: impl Into<String>) -> Self {
        Self::new("python", source)
    }
}

/// A resolved backend.
#[derive(Clone)]
pub enum Backend {
    Tool(Arc<dyn ToolHandler>),
    Function(Arc<dyn FunctionHandler>),
    Code(CodeUnit),
    Agent(Arc<dyn AgentTransport>),
}

impl Backend {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Tool(_) => BackendKind::Tool,
            Backend::Function(_) => BackendKind::Function,
            Backend::Code(_) => BackendKind::Code,
            Backend::Agent(_) => BackendKind::Agent,
        }
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Tool(_) => f.write_str("Backend::Tool(..)"),
            Backend::Function(_) => f.write_str("Backend::Function(..)"),
            Backend::Code(unit) => f.debug_tuple("Backend::Code").field(unit).finish(),
            Backend::Agent(_) => f.write_str("Backend::Agent(..)"),
        }
    }
}

// ── Closure adapters ────────────────────────────────────────────────

struct ToolFn<F>(F);

impl<F> ToolHandler for ToolFn<F>
where
    F: Fn(&Value) -> Result<Value, DispatchError> + Send + Sync,
{
    fn call(&self, input: &Value) -> Result<Value, DispatchError> {
        (self.0)(input)
    }
}

/// Wrap a closure as a tool backend.
pub fn tool_fn<F>(f: F) -> Backend
where
    F: Fn(&Value) -> Result<Value, DispatchError> + Send + Sync + 'static,
{
    Backend::Tool(Arc::new(ToolFn(f)))
}

struct FunctionFn<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> FunctionHandler for FunctionFn<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, DispatchError>> + Send,
{
    async fn call(&self, input: Value) -> Result<Value, DispatchError> {
        (self.f)(input).await
    }
}

/// Wrap an async closure as a function backend.
pub fn function_fn<F, Fut>(f: F) -> Backend
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, DispatchError>> + Send + 'static,
{
    Backend::Function(Arc::new(FunctionFn {
        f,
        _fut: PhantomData,
    }))
}
