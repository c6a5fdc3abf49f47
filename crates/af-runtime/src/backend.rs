//! The seam between the pipeline and whatever executes its graphs.
//!
//! A backend turns a functional `Graph` into a callable once; the runtime
//! reconstructor only ever sees the callable.

use std::fmt;
use std::sync::Arc;

use af_core::{Graph, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("backend unavailable: {backend}")]
    Unavailable { backend: String },
    #[error("compilation failed: {detail}")]
    CompileFailed { detail: String },
    #[error("execution failed: {detail}")]
    ExecutionFailed { detail: String },
}

/// A compiled graph: flat dense values in, flat dense values out.
pub trait CompiledGraph: Send + Sync + fmt::Debug {
    fn call(&self, args: &[Value]) -> Result<Vec<Value>, BackendError>;

    /// Number of arguments `call` expects.
    fn arity(&self) -> usize;
}

pub trait Backend: Send + Sync {
    /// Human-readable backend name (e.g. "cpu").
    fn name(&self) -> &str;

    /// Version string, part of the cache key.
    fn version(&self) -> &str;

    fn compile(&self, graph: &Graph) -> Result<Arc<dyn CompiledGraph>, BackendError>;
}

/// Backends known to the pipeline, looked up by name. The first one is the
/// default.
pub struct BackendRegistry {
    backends: Vec<Box<dyn Backend>>,
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.backends.iter().map(|backend| backend.name()))
            .finish()
    }
}

impl BackendRegistry {
    #[must_use]
    pub fn new(backends: Vec<Box<dyn Backend>>) -> Self {
        Self { backends }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&dyn Backend> {
        self.backends
            .iter()
            .find(|backend| backend.name() == name)
            .map(AsRef::as_ref)
    }

    #[must_use]
    pub fn default_backend(&self) -> Option<&dyn Backend> {
        self.backends.first().map(AsRef::as_ref)
    }

    #[must_use]
    pub fn available_backends(&self) -> Vec<&str> {
        self.backends.iter().map(|backend| backend.name()).collect()
    }

    /// `requested`, or the default backend when none is named.
    pub fn resolve(&self, requested: Option<&str>) -> Result<&dyn Backend, BackendError> {
        let found = match requested {
            Some(name) => self.get(name),
            None => self.default_backend(),
        };
        found.ok_or_else(|| BackendError::Unavailable {
            backend: requested.unwrap_or("<default>").to_owned(),
        })
    }
}
