//! Rewrites a traced graph into one without mutating operations.
//!
//! Output order of the result: user outputs, then the updated value of every
//! mutated input (graph input order), then intermediate bases. Inputs whose
//! mutation stays in the graph instead get a trailing `copy_`.

use std::collections::BTreeMap;

use af_core::{Atom, Graph, Primitive, ValueId};
use rustc_hash::FxHashSet;

use crate::collect::{CollectOptions, analyze};
use crate::metadata::ViewMetadata;
use crate::tracker::Tracker;
use crate::{CollectError, FunctionalizeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionalGraph {
    pub graph: Graph,
    pub metadata: ViewMetadata,
}

pub fn functionalize(
    graph: &Graph,
    options: &CollectOptions,
) -> Result<FunctionalGraph, FunctionalizeError> {
    let mut tracker = Tracker::run(graph)?;
    let analysis = analyze(graph, &tracker, options)?;
    let metadata = analysis.metadata;

    let mut outputs = Vec::with_capacity(metadata.forward_output_count());
    for id in &graph.outputs {
        outputs.push(tracker.read(*id)?);
    }
    for position in metadata.mutated_inputs() {
        outputs.push(updated_input(&mut tracker, position)?);
    }
    for storage in &analysis.base_storages {
        outputs.push(tracker.storages[*storage].base);
    }
    for (position, info) in metadata.inputs.iter().enumerate() {
        if info.keep_in_graph {
            let updated = updated_input(&mut tracker, position)?;
            let target = tracker.inputs[position];
            tracker.builder.apply(
                Primitive::CopyInplace,
                &[Atom::Var(target), Atom::Var(updated)],
                BTreeMap::new(),
            )?;
        }
    }

    let mut seen = FxHashSet::default();
    for (position, output) in outputs.iter_mut().enumerate() {
        if seen.insert(*output) {
            continue;
        }
        if tracker.builder.tensor(*output).is_none() {
            return Err(FunctionalizeError::DuplicateSymbolicOutput {
                position,
                value: *output,
            });
        }
        *output = tracker
            .builder
            .apply1(Primitive::Alias, &[Atom::Var(*output)], BTreeMap::new())?;
    }

    let functional = tracker.builder.finish(outputs);
    tracing::debug!(
        nodes_in = graph.nodes.len(),
        nodes_out = functional.nodes.len(),
        outputs = functional.outputs.len(),
        "functionalized graph"
    );
    Ok(FunctionalGraph {
        graph: functional,
        metadata,
    })
}

fn updated_input(tracker: &mut Tracker, position: usize) -> Result<ValueId, CollectError> {
    let object = tracker.input_objects[position].ok_or(CollectError::UnknownValue(
        tracker.inputs[position],
    ))?;
    tracker.current(object)
}

/// Fails on any mutating node. With `allow_input_copies`, a trailing run of
/// `copy_` nodes whose targets are graph inputs is accepted.
pub fn assert_functional_graph(
    graph: &Graph,
    allow_input_copies: bool,
) -> Result<(), FunctionalizeError> {
    let inputs: FxHashSet<ValueId> = graph.inputs.iter().copied().collect();
    let is_input_copy = |node: &af_core::Node| {
        node.primitive == Primitive::CopyInplace
            && node
                .inputs
                .first()
                .and_then(|atom| atom.var())
                .is_some_and(|target| inputs.contains(&target))
    };
    let mut tail = graph.nodes.len();
    if allow_input_copies {
        while tail > 0 && is_input_copy(&graph.nodes[tail - 1]) {
            tail -= 1;
        }
    }
    for (node_index, node) in graph.nodes[..tail].iter().enumerate() {
        if node.primitive.is_mutation() {
            return Err(FunctionalizeError::NotFunctional {
                node_index,
                primitive: node.primitive.as_str(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{assert_functional_graph, functionalize};
    use crate::collect::CollectOptions;
    use crate::metadata::{BaseRef, OutputClassification};
    use crate::FunctionalizeError;
    use af_core::{
        ALL_PROGRAMS, Graph, GraphBuilder, Primitive, ProgramSpec, Tensor, Value, build_program,
    };
    use af_interpreters::eval_graph;
    use proptest::prelude::*;

    fn ones(sizes: &[usize]) -> Value {
        Value::Tensor(Tensor::full(sizes, 1.0))
    }

    fn run(graph: &Graph, args: &[Value]) -> Vec<Vec<f64>> {
        eval_graph(graph, args)
            .expect("eval")
            .iter()
            .map(|value| value.to_vecs().concat())
            .collect()
    }

    #[test]
    fn every_canned_program_functionalizes() {
        for spec in ALL_PROGRAMS {
            let graph = build_program(*spec).expect("program");
            let functional = functionalize(&graph, &CollectOptions::default())
                .unwrap_or_else(|err| panic!("{}: {err}", spec.as_str()));
            assert!(functional.graph.is_functional(), "{}", spec.as_str());
            functional.graph.validate_well_formed().expect(spec.as_str());
            assert_eq!(
                functional.graph.outputs.len(),
                functional.metadata.forward_output_count(),
                "{}",
                spec.as_str()
            );
        }
    }

    #[test]
    fn mul_then_scale_returns_the_update() {
        let graph = build_program(ProgramSpec::MulThenScale).expect("program");
        let functional = functionalize(&graph, &CollectOptions::default()).expect("functionalize");
        let arg = ones(&[1, 1]);
        let outputs = run(&functional.graph, std::slice::from_ref(&arg));
        assert_eq!(outputs, vec![vec![6.0], vec![2.0]]);
        assert_eq!(arg.to_vecs(), vec![vec![1.0]], "functional graph must not write its input");
    }

    #[test]
    fn mutation_through_a_view_scatters_into_the_base() {
        let graph = build_program(ProgramSpec::MutateThroughView).expect("program");
        let functional = functionalize(&graph, &CollectOptions::default()).expect("functionalize");
        assert!(
            functional
                .graph
                .nodes
                .iter()
                .any(|node| node.primitive == Primitive::AsStridedScatter)
        );
        let outputs = run(&functional.graph, &[ones(&[2, 3])]);
        assert_eq!(outputs[0], vec![2.0, 2.0, 2.0, 1.0, 1.0, 1.0]);
        assert_eq!(outputs[1], outputs[0]);
    }

    #[test]
    fn functional_results_match_eager() {
        for spec in [
            ProgramSpec::MulThenScale,
            ProgramSpec::MutateThroughView,
            ProgramSpec::ViewOfMutatedInput,
            ProgramSpec::MutateThenTranspose,
            ProgramSpec::SetRoundTrip,
        ] {
            let graph = build_program(spec).expect("program");
            let functional =
                functionalize(&graph, &CollectOptions::default()).expect("functionalize");
            let shapes: Vec<Vec<usize>> = graph
                .input_tensors()
                .iter()
                .map(|tensor| tensor.expect("dense input").layout.sizes.clone())
                .collect();
            let eager_args: Vec<Value> = shapes.iter().map(|s| ones(s)).collect();
            let eager = run(&graph, &eager_args);
            let compiled_args: Vec<Value> = shapes.iter().map(|s| ones(s)).collect();
            let compiled = run(&functional.graph, &compiled_args);
            let user = functional.metadata.user_output_count();
            assert_eq!(compiled[..user], eager[..], "{}", spec.as_str());
            for (slot, input) in functional.metadata.mutated_inputs().into_iter().enumerate() {
                assert_eq!(
                    compiled[user + slot],
                    eager_args[input].to_vecs().concat(),
                    "{}",
                    spec.as_str()
                );
            }
        }
    }

    #[test]
    fn set_round_trip_emits_no_update() {
        let graph = build_program(ProgramSpec::SetRoundTrip).expect("program");
        let functional = functionalize(&graph, &CollectOptions::default()).expect("functionalize");
        assert_eq!(functional.graph.outputs.len(), 1);
    }

    #[test]
    fn alias_of_intermediate_returns_view_and_base() {
        let graph = build_program(ProgramSpec::AliasOfIntermediate).expect("program");
        let functional = functionalize(&graph, &CollectOptions::default()).expect("functionalize");
        assert_eq!(functional.graph.outputs.len(), 2);
        assert_eq!(
            functional.metadata.outputs[0].classification,
            OutputClassification::AliasOfIntermediate(BaseRef::UserOutput(1))
        );
    }

    #[test]
    fn repeated_outputs_go_through_an_alias() {
        let mut b = GraphBuilder::new();
        let a = b.input(&[2], false);
        let out = b.scalar(Primitive::Add, a, 1.0).expect("add");
        let graph = b.finish(vec![out]);
        let mut twice = graph.clone();
        twice.outputs.push(twice.outputs[0]);
        let functional = functionalize(&twice, &CollectOptions::default()).expect("functionalize");
        functional.graph.validate_well_formed().expect("distinct outputs");
        assert_eq!(
            functional.graph.nodes.last().expect("alias").primitive,
            Primitive::Alias
        );
    }

    #[test]
    fn functionalization_is_idempotent() {
        let graph = build_program(ProgramSpec::MulThenScale).expect("program");
        let once = functionalize(&graph, &CollectOptions::default()).expect("once");
        let twice = functionalize(&once.graph, &CollectOptions::default()).expect("twice");
        assert_eq!(
            once.graph.canonical_fingerprint(),
            twice.graph.canonical_fingerprint()
        );
        assert!(twice.metadata.mutated_inputs().is_empty());
    }

    #[test]
    fn kept_mutations_stay_as_trailing_copies() {
        let graph = build_program(ProgramSpec::MulThenScale).expect("program");
        let options = CollectOptions {
            keep_inference_input_mutations: true,
            ..CollectOptions::default()
        };
        let functional = functionalize(&graph, &options).expect("functionalize");
        assert_eq!(functional.graph.outputs.len(), 1);
        assert!(assert_functional_graph(&functional.graph, true).is_ok());
        assert!(matches!(
            assert_functional_graph(&functional.graph, false),
            Err(FunctionalizeError::NotFunctional { .. })
        ));
        let arg = ones(&[1, 1]);
        let outputs = run(&functional.graph, std::slice::from_ref(&arg));
        assert_eq!(outputs, vec![vec![6.0]]);
        assert_eq!(arg.to_vecs(), vec![vec![2.0]]);
    }

    #[test]
    fn original_mutating_graph_fails_the_purity_check() {
        let graph = build_program(ProgramSpec::MulThenScale).expect("program");
        assert_eq!(
            assert_functional_graph(&graph, false),
            Err(FunctionalizeError::NotFunctional {
                node_index: 0,
                primitive: "mul_"
            })
        );
    }

    fn counting() -> Value {
        Value::Tensor(Tensor::from_vec(&[2, 3], (0..6).map(f64::from).collect()).expect("tensor"))
    }

    /// Random mix of whole-tensor, view and metadata mutations on one input.
    fn mutation_program(ops: &[u8]) -> Graph {
        let mut b = GraphBuilder::new();
        let mut a = b.input(&[2, 3], false);
        for (step, op) in ops.iter().enumerate() {
            let k = step as f64 + 2.0;
            match op {
                0 => a = b.inplace_scalar(Primitive::MulInplace, a, k).expect("mul_"),
                1 => a = b.inplace_scalar(Primitive::AddInplace, a, k).expect("add_"),
                2 => {
                    let row = b.select(a, 0, 0).expect("select");
                    b.inplace_scalar(Primitive::MulInplace, row, k).expect("mul_");
                }
                3 => a = b.transpose_(a, 0, 1).expect("transpose_"),
                _ => {
                    let col = b.slice(a, 1, 0, 1).expect("slice");
                    b.inplace_scalar(Primitive::SubInplace, col, k).expect("sub_");
                }
            }
        }
        let out = b.scalar(Primitive::Mul, a, 1.0).expect("mul");
        b.finish(vec![out])
    }

    proptest! {
        #[test]
        fn generated_mutation_programs_match_eager(ops in prop::collection::vec(0_u8..5, 1..7)) {
            let graph = mutation_program(&ops);
            let functional =
                functionalize(&graph, &CollectOptions::default()).expect("functionalize");
            prop_assert!(assert_functional_graph(&functional.graph, false).is_ok());

            let eager_arg = counting();
            let eager = run(&graph, std::slice::from_ref(&eager_arg));
            let compiled = run(&functional.graph, &[counting()]);
            prop_assert_eq!(&compiled[0], &eager[0]);
            if !functional.metadata.mutated_inputs().is_empty() {
                prop_assert_eq!(&compiled[1], &eager_arg.to_vecs().concat());
            }
        }
    }
}
