//! Collapses inputs that are the same view of the same storage.

use std::collections::BTreeMap;

use af_core::{BuildError, Graph, GraphBuilder, TensorValue, remap_values};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupePlan {
    /// Original positions that survive, in order.
    pub kept: Vec<usize>,
    /// For every original position, the surviving position it reads from.
    pub source: Vec<usize>,
}

impl DedupePlan {
    #[must_use]
    pub fn identity(len: usize) -> Self {
        Self {
            kept: (0..len).collect(),
            source: (0..len).collect(),
        }
    }

    #[must_use]
    pub fn is_identity(&self) -> bool {
        self.kept.len() == self.source.len()
    }

    /// Selects the surviving arguments from the caller's list.
    pub fn select<'a, T>(&self, args: &'a [T]) -> Vec<&'a T> {
        self.kept.iter().filter_map(|position| args.get(*position)).collect()
    }
}

fn duplicates(a: &TensorValue, b: &TensorValue) -> bool {
    a.same_view(b) && a.subclass == b.subclass
}

/// Returns the graph over the deduplicated inputs and the mapping back to
/// the caller's positions. Values that are not tensors are never merged.
pub fn dedupe_inputs(graph: &Graph) -> Result<(Graph, DedupePlan), BuildError> {
    let tensors = graph.input_tensors();
    let mut kept: Vec<usize> = Vec::with_capacity(tensors.len());
    let mut source = Vec::with_capacity(tensors.len());
    for (position, tensor) in tensors.iter().enumerate() {
        let earlier = tensor.and_then(|tensor| {
            kept.iter().position(|k| {
                tensors[*k].is_some_and(|candidate| duplicates(candidate, tensor))
            })
        });
        match earlier {
            Some(slot) => source.push(slot),
            None => {
                source.push(kept.len());
                kept.push(position);
            }
        }
    }
    let plan = DedupePlan { kept, source };
    if plan.is_identity() {
        return Ok((graph.clone(), plan));
    }

    let mut builder = GraphBuilder::new();
    let mut fresh = Vec::with_capacity(plan.kept.len());
    for position in &plan.kept {
        let id = graph.inputs[*position];
        let meta = graph.meta(id).ok_or(BuildError::UnknownValue(id))?.clone();
        fresh.push(builder.input_meta(meta));
    }
    let mut remap = BTreeMap::new();
    for (id, slot) in graph.inputs.iter().zip(&plan.source) {
        remap.insert(*id, fresh[*slot]);
    }
    builder.replay_nodes(&graph.nodes, &mut remap)?;
    let outputs = remap_values(&graph.outputs, &remap)?;
    tracing::debug!(
        before = plan.source.len(),
        after = plan.kept.len(),
        "deduplicated inputs"
    );
    Ok((builder.finish(outputs), plan))
}

#[cfg(test)]
mod tests {
    use super::{DedupePlan, dedupe_inputs};
    use af_core::{GraphBuilder, Primitive, ProgramSpec, build_program};

    #[test]
    fn distinct_inputs_are_untouched() {
        let graph = build_program(ProgramSpec::PureLoss).expect("program");
        let (deduped, plan) = dedupe_inputs(&graph).expect("dedupe");
        assert_eq!(plan, DedupePlan::identity(2));
        assert_eq!(deduped, graph);
    }

    #[test]
    fn the_same_tensor_twice_becomes_one_input() {
        let mut b = GraphBuilder::new();
        let a = b.input(&[3], false);
        let meta = b.meta(a).expect("meta").clone();
        let again = b.input_meta(meta);
        let other = b.input(&[3], false);
        b.inplace_scalar(Primitive::MulInplace, again, 2.0).expect("mul_");
        let sum = b.binary(Primitive::Add, a, other).expect("add");
        let graph = b.finish(vec![sum]);

        let (deduped, plan) = dedupe_inputs(&graph).expect("dedupe");
        assert_eq!(plan.kept, vec![0, 2]);
        assert_eq!(plan.source, vec![0, 0, 1]);
        assert_eq!(deduped.inputs.len(), 2);
        let mutated = deduped.nodes[0].inputs[0].var().expect("target");
        assert_eq!(mutated, deduped.inputs[0]);
        assert_eq!(plan.select(&["x", "y", "z"]), vec![&"x", &"z"]);
    }

    #[test]
    fn views_of_one_storage_with_different_layouts_stay_apart() {
        let graph = build_program(ProgramSpec::OverlappingStrided).expect("program");
        let (_, plan) = dedupe_inputs(&graph).expect("dedupe");
        assert!(plan.is_identity());
    }
}
