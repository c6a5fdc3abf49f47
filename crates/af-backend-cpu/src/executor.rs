//! CPU execution engine wrapping `eval_graph`.
//!
//! Compilation validates the graph once; every call after that interprets it
//! on the host. Graphs must be functional, except for the trailing input
//! `copy_` nodes an inference graph may keep.

use std::sync::Arc;

use af_core::{Graph, Value};
use af_functionalize::assert_functional_graph;
use af_runtime::backend::{Backend, BackendError, CompiledGraph};

/// A validated graph ready to run on the host.
#[derive(Debug)]
pub struct CpuExecutable {
    graph: Graph,
}

impl CpuExecutable {
    #[must_use]
    pub fn graph(&self) -> &Graph {
        &self.graph
    }
}

impl CompiledGraph for CpuExecutable {
    fn call(&self, args: &[Value]) -> Result<Vec<Value>, BackendError> {
        af_interpreters::eval_graph(&self.graph, args).map_err(|e| {
            BackendError::ExecutionFailed {
                detail: e.to_string(),
            }
        })
    }

    fn arity(&self) -> usize {
        self.graph.inputs.len()
    }
}

/// CPU backend: interprets graphs on the host. Synchronous and
/// single-threaded per call.
#[derive(Debug, Clone)]
pub struct CpuBackend {
    /// Version string for cache key inclusion.
    version_string: String,
}

impl CpuBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            version_string: format!("af-backend-cpu/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn version(&self) -> &str {
        &self.version_string
    }

    fn compile(&self, graph: &Graph) -> Result<Arc<dyn CompiledGraph>, BackendError> {
        graph
            .validate_well_formed()
            .map_err(|e| BackendError::CompileFailed {
                detail: e.to_string(),
            })?;
        assert_functional_graph(graph, true).map_err(|e| BackendError::CompileFailed {
            detail: e.to_string(),
        })?;
        tracing::trace!(
            nodes = graph.nodes.len(),
            inputs = graph.inputs.len(),
            outputs = graph.outputs.len(),
            "compiled graph for cpu"
        );
        Ok(Arc::new(CpuExecutable {
            graph: graph.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use af_core::{ProgramSpec, Tensor, build_program};
    use af_functionalize::{CollectOptions, functionalize};
    use af_runtime::backend::BackendRegistry;

    fn tensor(sizes: &[usize], values: &[f64]) -> Value {
        Value::Tensor(Tensor::from_vec(sizes, values.to_vec()).expect("tensor"))
    }

    #[test]
    fn cpu_backend_name_and_version() {
        let backend = CpuBackend::new();
        assert_eq!(backend.name(), "cpu");
        assert!(backend.version().starts_with("af-backend-cpu/"));
    }

    #[test]
    fn cpu_backend_runs_a_pure_graph() {
        let backend = CpuBackend::new();
        let graph = build_program(ProgramSpec::PureElementwise).expect("program");
        let compiled = backend.compile(&graph).expect("compile");
        assert_eq!(compiled.arity(), 2);
        let zeros = tensor(&[2, 3], &[0.0; 6]);
        let out = compiled.call(&[zeros.clone(), zeros]).expect("call");
        assert_eq!(out[0].to_vecs(), vec![vec![1.0; 6]]);
    }

    #[test]
    fn cpu_backend_rejects_mutating_graphs() {
        let backend = CpuBackend::new();
        let traced = build_program(ProgramSpec::MulThenScale).expect("program");
        match backend.compile(&traced) {
            Err(BackendError::CompileFailed { detail }) => {
                assert!(detail.contains("mul_"), "detail: {detail}");
            }
            other => panic!("expected CompileFailed, got {other:?}"),
        }

        let functional = functionalize(&traced, &CollectOptions::default()).expect("functional");
        backend.compile(&functional.graph).expect("functional graph compiles");
    }

    #[test]
    fn cpu_backend_accepts_kept_input_copies() {
        let backend = CpuBackend::new();
        let traced = build_program(ProgramSpec::MulThenScale).expect("program");
        let options = CollectOptions {
            keep_inference_input_mutations: true,
            ..CollectOptions::default()
        };
        let functional = functionalize(&traced, &options).expect("functional");
        let compiled = backend.compile(&functional.graph).expect("compile");
        let a = Tensor::from_vec(&[1, 1], vec![1.0]).expect("a");
        let out = compiled.call(&[Value::Tensor(a.clone())]).expect("call");
        assert_eq!(a.to_vec(), vec![2.0]);
        assert_eq!(out[0].to_vecs(), vec![vec![6.0]]);
    }

    #[test]
    fn cpu_backend_reports_arity_errors_as_execution_failures() {
        let backend = CpuBackend::new();
        let graph = build_program(ProgramSpec::PureLoss).expect("program");
        let compiled = backend.compile(&graph).expect("compile");
        let err = compiled.call(&[tensor(&[3], &[1.0; 3])]).expect_err("arity");
        assert!(matches!(err, BackendError::ExecutionFailed { .. }));
        assert!(err.to_string().contains("expected 2"));
    }

    // ── Registry tests ────────────────────────────────────────────

    #[test]
    fn registry_get_by_name() {
        let registry = BackendRegistry::new(vec![Box::new(CpuBackend::new())]);
        assert!(registry.get("cpu").is_some());
        assert!(registry.get("gpu").is_none());
        assert_eq!(registry.available_backends(), vec!["cpu"]);
    }

    #[test]
    fn registry_resolves_default_and_reports_unavailable() {
        let registry = BackendRegistry::new(vec![Box::new(CpuBackend::new())]);
        assert_eq!(registry.resolve(None).expect("default").name(), "cpu");
        match registry.resolve(Some("gpu")) {
            Err(BackendError::Unavailable { backend }) => assert_eq!(backend, "gpu"),
            Err(other) => panic!("expected Unavailable, got: {other}"),
            Ok(_) => panic!("expected error for unavailable gpu backend"),
        }
    }
}
