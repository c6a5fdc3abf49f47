//! Dead-node elimination over value graphs.

use af_core::{Graph, ValueId};
use rustc_hash::FxHashSet;

/// Marks the nodes needed to produce `roots`. Mutating nodes are always
/// live, along with everything they read.
#[must_use]
pub fn live_nodes(graph: &Graph, roots: impl IntoIterator<Item = ValueId>) -> Vec<bool> {
    let mut needed: FxHashSet<ValueId> = roots.into_iter().collect();
    let mut live = vec![false; graph.nodes.len()];
    for (index, node) in graph.nodes.iter().enumerate().rev() {
        if node.primitive.is_mutation() || node.outputs.iter().any(|id| needed.contains(id)) {
            live[index] = true;
            needed.extend(node.input_vars());
        }
    }
    live
}

/// Drops the outputs not in `used_outputs` and every node that no longer
/// contributes. Returns the pruned graph and which inputs are still read.
#[must_use]
pub fn dce_graph(graph: &Graph, used_outputs: &[bool]) -> (Graph, Vec<bool>) {
    let outputs: Vec<ValueId> = graph
        .outputs
        .iter()
        .zip(used_outputs.iter().chain(std::iter::repeat(&true)))
        .filter(|(_, used)| **used)
        .map(|(id, _)| *id)
        .collect();
    let live = live_nodes(graph, outputs.iter().copied());
    let nodes: Vec<_> = graph
        .nodes
        .iter()
        .zip(&live)
        .filter(|(_, keep)| **keep)
        .map(|(node, _)| node.clone())
        .collect();

    let mut read: FxHashSet<ValueId> = outputs.iter().copied().collect();
    for node in &nodes {
        read.extend(node.input_vars());
    }
    let used_inputs = graph.inputs.iter().map(|id| read.contains(id)).collect();
    tracing::trace!(
        nodes_in = graph.nodes.len(),
        nodes_out = nodes.len(),
        "eliminated dead nodes"
    );
    (
        Graph::new(graph.values.clone(), graph.inputs.clone(), outputs, nodes),
        used_inputs,
    )
}

#[cfg(test)]
mod tests {
    use super::{dce_graph, live_nodes};
    use af_core::{GraphBuilder, Primitive, ProgramSpec, build_program};

    #[test]
    fn unused_branch_is_removed() {
        let mut b = GraphBuilder::new();
        let a = b.input(&[2], false);
        let c = b.input(&[2], false);
        let kept = b.unary(Primitive::Neg, a).expect("neg");
        let dropped = b.unary(Primitive::Exp, c).expect("exp");
        let graph = b.finish(vec![kept, dropped]);

        let (pruned, used_inputs) = dce_graph(&graph, &[true, false]);
        assert_eq!(pruned.nodes.len(), 1);
        assert_eq!(pruned.nodes[0].primitive, Primitive::Neg);
        assert_eq!(pruned.outputs, vec![kept]);
        assert_eq!(used_inputs, vec![true, false]);
        pruned.validate_well_formed().expect("well formed");
    }

    #[test]
    fn mutations_are_never_dead() {
        let graph = build_program(ProgramSpec::MulThenScale).expect("program");
        let live = live_nodes(&graph, []);
        assert_eq!(live, vec![true, false]);
    }

    #[test]
    fn everything_feeding_a_used_output_survives() {
        let graph = build_program(ProgramSpec::PureLoss).expect("program");
        let (pruned, used_inputs) = dce_graph(&graph, &[true]);
        assert_eq!(pruned, graph);
        assert_eq!(used_inputs, vec![true, true]);
    }
}
