#![forbid(unsafe_code)]

//! Pipeline driver.
//!
//! [`compile`] runs every compile-time stage in order on one traced graph and
//! hands the resulting forward and backward graphs to a backend. The returned
//! [`CompiledArtifact`] is callable through its [`CompiledFunction`].

pub mod config;

use af_cache::{CacheKey, CacheKeyError, CacheKeyInput, build_cache_key, input_signatures};
use af_core::{BuildError, Graph, ValueMeta};
use af_functionalize::{
    CollectError, CollectOptions, FunctionalizeError, SlotLayout, SubclassError,
    SyntheticBaseBuilder, SyntheticBaseError, collect, dedupe_inputs, flatten_subclasses,
    functionalize,
};
use af_partition::{PartitionError, build_joint, expand_mask, partition, tangent_mask};
use af_runtime::{
    BackendError, BackendRegistry, CompiledFunction, InputGuards, RuntimeMetadata,
};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{Span, debug, trace};

pub use config::{ConfigError, PipelineConfig};

static NEXT_INVOCATION: AtomicU64 = AtomicU64::new(1);

/// Next diagnostic id. Ids are unique per process, not ordered across threads.
#[must_use]
pub fn next_invocation_id() -> u64 {
    NEXT_INVOCATION.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    pub graph: Graph,
    /// User-output positions that are scalar losses. `None` gives every
    /// differentiable output a tangent.
    pub loss_outputs: Option<Vec<usize>>,
    pub config: PipelineConfig,
}

impl CompileRequest {
    #[must_use]
    pub fn new(graph: Graph) -> Self {
        Self {
            graph,
            loss_outputs: None,
            config: PipelineConfig::default(),
        }
    }

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
}

#[derive(Debug, Clone)]
pub struct CompiledArtifact {
    pub invocation: u64,
    pub cache_key: CacheKey,
    pub backend: String,
    pub forward_graph: Graph,
    /// `None` for inference-only graphs.
    pub backward_graph: Option<Graph>,
    pub function: CompiledFunction,
}

impl CompiledArtifact {
    #[must_use]
    pub fn metadata(&self) -> &RuntimeMetadata {
        self.function.metadata()
    }

    /// Forward outputs that are not saved values.
    #[must_use]
    pub fn forward_output_count(&self) -> usize {
        self.forward_graph.outputs.len() - self.metadata().partition.saved_count()
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("cache key error: {0}")]
    Cache(#[from] CacheKeyError),
    #[error("graph construction error: {0}")]
    Build(#[from] BuildError),
    #[error("unsupported program: {0}")]
    Collect(#[from] CollectError),
    #[error("unsupported program: {0}")]
    Functionalize(#[from] FunctionalizeError),
    #[error("unsupported program: {0}")]
    SyntheticBase(#[from] SyntheticBaseError),
    #[error("subclass flattening error: {0}")]
    Subclass(#[from] SubclassError),
    #[error("partition error: {0}")]
    Partition(#[from] PartitionError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("loss output {position} is out of range for {outputs} user outputs")]
    LossOutput { position: usize, outputs: usize },
    #[error("backward input {position} is a tangent but not a tensor")]
    SymbolicTangent { position: usize },
}

impl DispatchError {
    /// Errors caused by the traced program itself; recompiling reproduces them.
    #[must_use]
    pub fn is_unsupported_program(&self) -> bool {
        matches!(
            self,
            Self::Collect(_) | Self::Functionalize(_) | Self::SyntheticBase(_)
        )
    }

    #[must_use]
    pub fn is_backward_mutation(&self) -> bool {
        matches!(self, Self::Partition(PartitionError::BackwardMutation { .. }))
    }
}

#[must_use]
pub fn default_registry() -> BackendRegistry {
    BackendRegistry::new(vec![Box::new(af_backend_cpu::CpuBackend::new())])
}

/// Compile with the built-in CPU backend.
pub fn compile_default(request: &CompileRequest) -> Result<CompiledArtifact, DispatchError> {
    compile(request, &default_registry())
}

#[tracing::instrument(
    name = "aot_compile",
    skip_all,
    fields(invocation = tracing::field::Empty, inputs = request.graph.inputs.len())
)]
pub fn compile(
    request: &CompileRequest,
    registry: &BackendRegistry,
) -> Result<CompiledArtifact, DispatchError> {
    let invocation = next_invocation_id();
    Span::current().record("invocation", invocation);

    let config = &request.config;
    let graph = &request.graph;
    if let Some(losses) = &request.loss_outputs
        && let Some(position) = losses.iter().copied().find(|p| *p >= graph.outputs.len())
    {
        return Err(DispatchError::LossOutput {
            position,
            outputs: graph.outputs.len(),
        });
    }

    let backend = registry.resolve(config.backend.as_deref())?;
    let input_metas: Vec<ValueMeta> = graph
        .inputs
        .iter()
        .filter_map(|id| graph.meta(*id).cloned())
        .collect();
    let cache_key = build_cache_key(&CacheKeyInput {
        mode: config.mode,
        backend: backend.name().to_owned(),
        backend_version: backend.version().to_owned(),
        graph: graph.clone(),
        inputs: input_signatures(&input_metas),
        compile_options: config.canonical_options(),
        unknown_incompatible_features: config.ignored_options.clone(),
    })?;
    debug!(cache_key = %cache_key, backend = backend.name(), "compile requested");

    let (deduped, dedupe) = dedupe_inputs(graph)?;
    debug!(
        kept = dedupe.kept.len(),
        duplicates = dedupe.source.len() - dedupe.kept.len(),
        "deduplicated inputs"
    );

    let collect_options = config.collect_options();
    let collected = collect(&deduped, &collect_options)?;
    debug!(
        mutated_inputs = collected.mutated_inputs().len(),
        alias_groups = collected.alias_groups.len(),
        user_outputs = collected.user_output_count(),
        "collected view metadata"
    );

    let (rewritten, synthetic_base) =
        match SyntheticBaseBuilder::from_metadata(&deduped, &collected).commit()? {
            Some((rewritten, plan)) => {
                debug!(
                    groups = plan.groups.len(),
                    graph_inputs = rewritten.inputs.len(),
                    "merged aliased mutated inputs into synthetic bases"
                );
                (rewritten, Some(plan))
            }
            None => (deduped, None),
        };

    let functional_options = CollectOptions {
        tracked_views: synthetic_base
            .as_ref()
            .map(|plan| plan.tracked_views())
            .unwrap_or_default(),
        ..collect_options
    };
    let functional = functionalize(&rewritten, &functional_options)?;
    if let Some(plan) = &synthetic_base {
        plan.check_mutations(&functional.metadata)?;
    }
    debug!(
        nodes = functional.graph.nodes.len(),
        outputs = functional.graph.outputs.len(),
        "functionalized"
    );
    for (index, node) in functional.graph.nodes.iter().enumerate() {
        trace!(index, primitive = node.primitive.as_str(), "functional node");
    }

    let flat = flatten_subclasses(&functional.graph)?;
    debug!(
        flat_inputs = flat.layout.flat_input_count(),
        flat_outputs = flat.layout.flat_output_count(),
        "flattened subclasses"
    );

    let mask = tangent_mask(
        &functional.graph,
        &functional.metadata,
        request.loss_outputs.as_deref(),
    );
    let mask = expand_mask(&mask, flat.layout.outputs.iter().map(SlotLayout::slot_count));
    let joint = build_joint(&flat.graph, &mask)?;
    let split = partition(&joint, &config.partition_options()?)?;
    debug!(
        policy = split.plan.policy.as_str(),
        saved = split.plan.saved_count(),
        recomputed = split.plan.recomputed.len(),
        tangents = split.plan.tangent_outputs.len(),
        "partitioned"
    );

    let saved_count = split.plan.saved_count();
    let tangent_sizes = split.backward.inputs[saved_count..]
        .iter()
        .enumerate()
        .map(|(offset, id)| {
            split
                .backward
                .tensor(*id)
                .map(|tensor| tensor.sizes().to_vec())
                .ok_or(DispatchError::SymbolicTangent {
                    position: saved_count + offset,
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let forward = backend.compile(&split.forward)?;
    let backward_graph = (!split.plan.is_inference()).then(|| split.backward.clone());
    let backward = backward_graph
        .as_ref()
        .map(|graph| backend.compile(graph))
        .transpose()?;

    let metadata = RuntimeMetadata {
        guards: InputGuards::new(graph, &dedupe, synthetic_base.as_ref()),
        dedupe,
        synthetic_base,
        view: functional.metadata,
        subclass: flat.layout,
        partition: split.plan,
        tangent_sizes,
    };
    debug!(
        forward_nodes = split.forward.nodes.len(),
        has_backward = backward.is_some(),
        "compiled"
    );

    Ok(CompiledArtifact {
        invocation,
        cache_key,
        backend: backend.name().to_owned(),
        forward_graph: split.forward,
        backward_graph,
        function: CompiledFunction::new(forward, backward, metadata),
    })
}
