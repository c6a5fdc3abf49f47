#![forbid(unsafe_code)]

//! Executes a `Graph` node by node on concrete values.
//!
//! Mutating nodes write through the tensor objects they receive, so running a
//! traced graph here is the eager reference behavior, and running a
//! functional graph is what the reference backend does.

use af_core::{Atom, Graph, Primitive, Value, ValueId};
use af_lax::{KernelError, eval_primitive};
use rustc_hash::FxHashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EvalError {
    #[error("input arity mismatch: expected {expected}, got {actual}")]
    InputArity { expected: usize, actual: usize },
    #[error("missing value v{}", .0.0)]
    MissingValue(ValueId),
    #[error("{} produced {actual} outputs, node binds {expected}", primitive.as_str())]
    OutputArity {
        primitive: Primitive,
        expected: usize,
        actual: usize,
    },
    #[error("node {node_index} ({}) failed: {source}", primitive.as_str())]
    Kernel {
        node_index: usize,
        primitive: Primitive,
        #[source]
        source: KernelError,
    },
}

impl EvalError {
    /// The kernel failure behind this error, if any.
    #[must_use]
    pub fn kernel_error(&self) -> Option<&KernelError> {
        match self {
            Self::Kernel { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub fn eval_graph(graph: &Graph, args: &[Value]) -> Result<Vec<Value>, EvalError> {
    if args.len() != graph.inputs.len() {
        return Err(EvalError::InputArity {
            expected: graph.inputs.len(),
            actual: args.len(),
        });
    }

    let mut env: FxHashMap<ValueId, Value> = FxHashMap::default();
    for (id, value) in graph.inputs.iter().zip(args) {
        env.insert(*id, value.clone());
    }

    for (node_index, node) in graph.nodes.iter().enumerate() {
        let mut resolved = Vec::with_capacity(node.inputs.len());
        for atom in &node.inputs {
            match atom {
                Atom::Var(id) => {
                    let value = env.get(id).cloned().ok_or(EvalError::MissingValue(*id))?;
                    resolved.push(value);
                }
                Atom::Lit(literal) => resolved.push(Value::Scalar(*literal)),
            }
        }

        let outputs =
            eval_primitive(node.primitive, &resolved, &node.params).map_err(|source| {
                EvalError::Kernel {
                    node_index,
                    primitive: node.primitive,
                    source,
                }
            })?;
        if outputs.len() != node.outputs.len() {
            return Err(EvalError::OutputArity {
                primitive: node.primitive,
                expected: node.outputs.len(),
                actual: outputs.len(),
            });
        }
        tracing::trace!(node_index, primitive = node.primitive.as_str(), "evaluated node");
        for (id, value) in node.outputs.iter().zip(outputs) {
            env.insert(*id, value);
        }
    }

    graph
        .outputs
        .iter()
        .map(|id| env.get(id).cloned().ok_or(EvalError::MissingValue(*id)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{EvalError, eval_graph};
    use af_core::{ProgramSpec, Tensor, TensorError, Value, build_program};
    use af_lax::KernelError;

    fn tensor(sizes: &[usize], values: &[f64]) -> Tensor {
        Tensor::from_vec(sizes, values.to_vec()).expect("tensor should build")
    }

    #[test]
    fn mul_then_scale_mutates_the_argument() {
        let graph = build_program(ProgramSpec::MulThenScale).expect("program");
        let a = tensor(&[1, 1], &[1.0]);
        let out = eval_graph(&graph, &[Value::Tensor(a.clone())]).expect("eval");
        assert_eq!(a.to_vec(), vec![2.0]);
        assert_eq!(out[0].to_vecs(), vec![vec![6.0]]);
    }

    #[test]
    fn unbind_outputs_alias_the_input() {
        let graph = build_program(ProgramSpec::UnbindInput).expect("program");
        let a = tensor(&[3, 3], &[1.0; 9]);
        let out = eval_graph(&graph, &[Value::Tensor(a.clone())]).expect("eval");
        assert_eq!(out.len(), 3);
        for value in &out {
            let view = value.as_tensor().expect("tensor");
            assert_eq!(view.storage_id(), a.storage_id());
        }
    }

    #[test]
    fn mutating_a_leaf_that_requires_grad_fails_like_eager() {
        let graph = build_program(ProgramSpec::MulThenScale).expect("program");
        let a = tensor(&[1, 1], &[1.0]).requires_grad(true);
        let err = eval_graph(&graph, &[Value::Tensor(a)]).expect_err("leaf mutation");
        assert_eq!(
            err.kernel_error(),
            Some(&KernelError::Tensor(TensorError::LeafInplace))
        );
    }

    #[test]
    fn input_arity_mismatch_is_reported() {
        let graph = build_program(ProgramSpec::PureLoss).expect("program");
        let err = eval_graph(&graph, &[Value::Tensor(tensor(&[3], &[0.0; 3]))])
            .expect_err("should fail");
        assert_eq!(
            err,
            EvalError::InputArity {
                expected: 2,
                actual: 1,
            }
        );
    }
}
