//! `aot_function`: trace on first call per input signature, compile, cache,
//! and recompile when the runtime reports that guards no longer hold.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use af_cache::{input_signatures, signature_key};
use af_core::{BuildError, Graph, GraphBuilder, Value, ValueMeta};
use af_dispatch::{CompileRequest, CompiledArtifact, PipelineConfig, compile, default_registry};
use af_runtime::BackendRegistry;
use tracing::{debug, warn};

use crate::errors::ApiError;

/// Produces a graph for one set of input metadata.
pub trait Tracer {
    fn trace(&self, inputs: &[ValueMeta]) -> Result<Graph, BuildError>;
}

impl<F> Tracer for F
where
    F: Fn(&[ValueMeta]) -> Result<Graph, BuildError>,
{
    fn trace(&self, inputs: &[ValueMeta]) -> Result<Graph, BuildError> {
        self(inputs)
    }
}

/// A recorded graph re-specialized to each call's input metadata.
#[derive(Debug, Clone)]
pub struct RecordedProgram(pub Graph);

impl Tracer for RecordedProgram {
    fn trace(&self, inputs: &[ValueMeta]) -> Result<Graph, BuildError> {
        GraphBuilder::retrace(&self.0, inputs.to_vec())
    }
}

pub struct AotFunction<T> {
    tracer: T,
    config: PipelineConfig,
    loss_outputs: Option<Vec<usize>>,
    registry: BackendRegistry,
    artifacts: Mutex<BTreeMap<String, Arc<CompiledArtifact>>>,
    compilations: AtomicUsize,
}

impl<T> std::fmt::Debug for AotFunction<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AotFunction")
            .field("config", &self.config)
            .field("loss_outputs", &self.loss_outputs)
            .field("cached", &self.cached_artifacts())
            .field("compilations", &self.compilations())
            .finish_non_exhaustive()
    }
}

#[must_use]
pub fn aot_function<T: Tracer>(tracer: T) -> AotFunction<T> {
    AotFunction {
        tracer,
        config: PipelineConfig::default(),
        loss_outputs: None,
        registry: default_registry(),
        artifacts: Mutex::new(BTreeMap::new()),
        compilations: AtomicUsize::new(0),
    }
}

/// Wrap an already-recorded graph; each new signature retraces it.
#[must_use]
pub fn aot_graph(graph: Graph) -> AotFunction<RecordedProgram> {
    aot_function(RecordedProgram(graph))
}

impl<T> AotFunction<T> {
    /// Number of times the pipeline has run for this function.
    #[must_use]
    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn cached_artifacts(&self) -> usize {
        self.lock().len()
    }

    /// Drop every cached artifact, e.g. after a backward-time guard violation.
    pub fn invalidate_all(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Arc<CompiledArtifact>>> {
        self.artifacts.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Tracer> AotFunction<T> {
    #[must_use]
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_loss_outputs(mut self, loss_outputs: Vec<usize>) -> Self {
        self.loss_outputs = Some(loss_outputs);
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: BackendRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// The artifact `args` would run, compiling it if needed.
    pub fn artifact_for(&self, args: &[Value]) -> Result<Arc<CompiledArtifact>, ApiError> {
        let metas: Vec<ValueMeta> = args.iter().map(Value::meta).collect();
        let key = self.key_for(&metas);
        self.lookup_or_compile(&key, &metas)
    }

    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, ApiError> {
        let metas: Vec<ValueMeta> = args.iter().map(Value::meta).collect();
        let key = self.key_for(&metas);
        let artifact = self.lookup_or_compile(&key, &metas)?;
        match artifact.function.call(args) {
            Ok(outputs) => Ok(outputs),
            Err(err) if err.is_guard_violation() => {
                warn!(key = %key, error = %err, "discarding stale artifact");
                self.lock().remove(&key);
                let fresh = self.compile_into_cache(&key, &metas)?;
                fresh.function.call(args).map_err(|err| {
                    if err.is_guard_violation() {
                        ApiError::StaleAfterRecompile(err)
                    } else {
                        ApiError::Runtime(err)
                    }
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn key_for(&self, metas: &[ValueMeta]) -> String {
        signature_key(&input_signatures(metas), &self.config.canonical_options()).as_string()
    }

    fn lookup_or_compile(
        &self,
        key: &str,
        metas: &[ValueMeta],
    ) -> Result<Arc<CompiledArtifact>, ApiError> {
        if let Some(artifact) = self.lock().get(key) {
            return Ok(Arc::clone(artifact));
        }
        self.compile_into_cache(key, metas)
    }

    fn compile_into_cache(
        &self,
        key: &str,
        metas: &[ValueMeta],
    ) -> Result<Arc<CompiledArtifact>, ApiError> {
        let graph = self.tracer.trace(metas)?;
        let mut request = CompileRequest::new(graph).with_config(self.config.clone());
        request.loss_outputs.clone_from(&self.loss_outputs);
        let artifact = Arc::new(compile(&request, &self.registry)?);
        self.compilations.fetch_add(1, Ordering::Relaxed);
        debug!(
            key,
            cache_key = %artifact.cache_key,
            invocation = artifact.invocation,
            "cached compiled artifact"
        );
        self.lock().insert(key.to_owned(), Arc::clone(&artifact));
        Ok(artifact)
    }
}
