//! Runtime autograd: the backward record a compiled forward call leaves on
//! its outputs, and the engine that walks those records.
//!
//! A compiled call owns one `CompiledFunctionNode`. Every differentiable
//! output points at it through `GradFn::Node`; views point at their base
//! through `GradFn::View`. The engine runs nodes newest first, summing the
//! gradients that reach each node before it runs.

use std::any::Any;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use af_core::{AutogradNode, GradFn, Tensor, TensorError, Value, as_strided_backward};
use af_functionalize::flatten;
use tracing::warn;

use crate::RuntimeError;
use crate::backend::CompiledGraph;
use crate::guards::GuardViolation;

static NEXT_SEQUENCE_NR: AtomicU64 = AtomicU64::new(0);

#[derive(Debug)]
pub struct CompiledFunctionNode {
    sequence_nr: u64,
    backward: Arc<dyn CompiledGraph>,
    saved: Vec<Value>,
    saved_versions: Vec<Option<u64>>,
    tangent_sizes: Vec<Vec<usize>>,
    /// Forward arguments that receive the backward graph's outputs, in order.
    grad_targets: Vec<Tensor>,
}

impl CompiledFunctionNode {
    #[must_use]
    pub fn new(
        backward: Arc<dyn CompiledGraph>,
        saved: Vec<Value>,
        tangent_sizes: Vec<Vec<usize>>,
        grad_targets: Vec<Tensor>,
    ) -> Self {
        let saved_versions = saved
            .iter()
            .map(|value| value.as_tensor().map(Tensor::version))
            .collect();
        Self {
            sequence_nr: NEXT_SEQUENCE_NR.fetch_add(1, Ordering::Relaxed),
            backward,
            saved,
            saved_versions,
            tangent_sizes,
            grad_targets,
        }
    }

    #[must_use]
    pub fn tangent_count(&self) -> usize {
        self.tangent_sizes.len()
    }

    #[must_use]
    pub fn saved(&self) -> &[Value] {
        &self.saved
    }

    fn check_saved_versions(&self) -> Result<(), RuntimeError> {
        for (index, (value, saved)) in self.saved.iter().zip(&self.saved_versions).enumerate() {
            if let (Some(tensor), Some(saved)) = (value.as_tensor(), saved) {
                let current = tensor.version();
                if current != *saved {
                    return Err(RuntimeError::SavedValueModified {
                        index,
                        saved: *saved,
                        current,
                    });
                }
            }
        }
        Ok(())
    }

    /// Runs the compiled backward. Missing gradients are zeros.
    pub fn apply(&self, grads: Vec<Option<Tensor>>) -> Result<Vec<(Tensor, Tensor)>, RuntimeError> {
        self.check_saved_versions()?;
        let mut grads = grads;
        grads.resize(self.tangent_sizes.len(), None);
        let mut args = self.saved.clone();
        for (grad, sizes) in grads.into_iter().zip(&self.tangent_sizes) {
            let grad = grad.unwrap_or_else(|| Tensor::zeros(sizes));
            args.push(Value::Tensor(grad));
        }
        let outputs = self.backward.call(&args)?;
        if outputs.len() != self.grad_targets.len() {
            return Err(RuntimeError::OutputCount {
                expected: self.grad_targets.len(),
                actual: outputs.len(),
            });
        }
        let mut routed = Vec::with_capacity(outputs.len());
        for (target, grad) in self.grad_targets.iter().zip(&outputs) {
            routed.push((target.clone(), grad.expect_tensor()?.clone()));
        }
        Ok(routed)
    }
}

impl AutogradNode for CompiledFunctionNode {
    fn name(&self) -> &str {
        "CompiledFunctionBackward"
    }

    fn sequence_nr(&self) -> u64 {
        self.sequence_nr
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn add(lhs: &Tensor, rhs: &Tensor) -> Result<Tensor, TensorError> {
    if lhs.sizes() != rhs.sizes() {
        return Err(TensorError::ShapeMismatch {
            expected: lhs.sizes(),
            actual: rhs.sizes(),
        });
    }
    let summed = lhs
        .to_vec()
        .into_iter()
        .zip(rhs.to_vec())
        .map(|(a, b)| a + b)
        .collect();
    Tensor::from_vec(&lhs.sizes(), summed)
}

#[derive(Debug)]
struct Pending {
    node: Arc<dyn AutogradNode>,
    grads: Vec<Option<Tensor>>,
}

/// Nodes waiting to run, newest first.
#[derive(Debug, Default)]
struct GraphTask {
    ready: BTreeMap<Reverse<u64>, Pending>,
}

impl GraphTask {
    fn route(&mut self, tensor: &Tensor, grad: Tensor) -> Result<(), RuntimeError> {
        match tensor.grad_fn() {
            Some(GradFn::Node { node, output_nr }) => {
                let pending = self
                    .ready
                    .entry(Reverse(node.sequence_nr()))
                    .or_insert_with(|| Pending {
                        node: Arc::clone(&node),
                        grads: Vec::new(),
                    });
                if pending.grads.len() <= output_nr {
                    pending.grads.resize(output_nr + 1, None);
                }
                let slot = &mut pending.grads[output_nr];
                *slot = Some(match slot.take() {
                    Some(existing) => add(&existing, &grad)?,
                    None => grad,
                });
                Ok(())
            }
            Some(GradFn::View) => {
                let Some(base) = tensor.view_base() else {
                    return Ok(());
                };
                let base_grad = as_strided_backward(&grad, &base.layout(), &tensor.layout())?;
                self.route(&base, base_grad)
            }
            None => {
                if tensor.is_requires_grad() && tensor.is_leaf() {
                    tensor.accumulate_grad(&grad)?;
                }
                Ok(())
            }
        }
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        while let Some((_, pending)) = self.ready.pop_first() {
            let node = pending
                .node
                .as_any()
                .downcast_ref::<CompiledFunctionNode>()
                .ok_or_else(|| RuntimeError::UnknownNode(pending.node.name().to_owned()))?;
            tracing::trace!(
                node = node.name(),
                sequence_nr = node.sequence_nr(),
                "running backward node"
            );
            for (target, grad) in node.apply(pending.grads)? {
                self.route(&target, grad)?;
            }
        }
        Ok(())
    }
}

/// Pairs each root with its gradient, component by component.
fn pair_gradients(
    output: usize,
    root: &Value,
    grad: &Value,
) -> Result<Vec<(Tensor, Tensor)>, RuntimeError> {
    let (roots, expected) = flatten(root);
    let (grads, actual) = flatten(grad);
    if expected != actual {
        let violation = GuardViolation::GradientSubclass {
            output,
            expected: expected.describe(),
            actual: actual.describe(),
        };
        warn!(output, %violation, "gradient subclass guard failed");
        return Err(violation.into());
    }
    let mut pairs = Vec::with_capacity(roots.len());
    for (root, grad) in roots.iter().zip(&grads) {
        let (Some(root), Some(grad)) = (root.as_tensor(), grad.as_tensor()) else {
            return Err(RuntimeError::NoGradFn { position: output });
        };
        if root.sizes() != grad.sizes() {
            return Err(TensorError::ShapeMismatch {
                expected: root.sizes(),
                actual: grad.sizes(),
            }
            .into());
        }
        pairs.push((root.clone(), grad.contiguous()));
    }
    Ok(pairs)
}

/// Accumulates `d(roots)/d(leaf) · grads` into every reachable leaf that
/// requires grad.
pub fn backward(roots: &[Value], grads: &[Value]) -> Result<(), RuntimeError> {
    if roots.len() != grads.len() {
        return Err(RuntimeError::GradientCount {
            expected: roots.len(),
            actual: grads.len(),
        });
    }
    let mut task = GraphTask::default();
    for (position, (root, grad)) in roots.iter().zip(grads).enumerate() {
        let pairs = pair_gradients(position, root, grad)?;
        let reachable = pairs
            .iter()
            .any(|(tensor, _)| tensor.grad_fn().is_some() || tensor.is_requires_grad());
        if !reachable {
            return Err(RuntimeError::NoGradFn { position });
        }
        for (tensor, grad) in pairs {
            task.route(&tensor, grad)?;
        }
    }
    task.run()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{CompiledFunctionNode, backward};
    use crate::backend::{BackendError, CompiledGraph};
    use crate::guards::GuardViolation;
    use crate::RuntimeError;
    use af_core::{GradFn, SubclassTensor, Tensor, Value};

    /// Backward of `y = 2 * x`: one tangent in, one gradient out.
    #[derive(Debug)]
    struct Doubler;

    impl CompiledGraph for Doubler {
        fn call(&self, args: &[Value]) -> Result<Vec<Value>, BackendError> {
            let grad = args
                .last()
                .and_then(Value::as_tensor)
                .ok_or_else(|| BackendError::ExecutionFailed {
                    detail: "missing tangent".to_owned(),
                })?;
            let doubled = grad.to_vec().into_iter().map(|g| 2.0 * g).collect();
            let out = Tensor::from_vec(&grad.sizes(), doubled).map_err(|err| {
                BackendError::ExecutionFailed {
                    detail: err.to_string(),
                }
            })?;
            Ok(vec![Value::Tensor(out)])
        }

        fn arity(&self) -> usize {
            1
        }
    }

    fn doubled_output(x: &Tensor, saved: Vec<Value>) -> Tensor {
        let node = Arc::new(CompiledFunctionNode::new(
            Arc::new(Doubler),
            saved,
            vec![x.sizes()],
            vec![x.clone()],
        ));
        let values = x.to_vec().into_iter().map(|v| 2.0 * v).collect();
        let y = Tensor::from_vec(&x.sizes(), values).expect("y").requires_grad(true);
        y.set_grad_fn(Some(GradFn::Node {
            node,
            output_nr: 0,
        }));
        y
    }

    #[test]
    fn gradient_reaches_the_leaf() {
        let x = Tensor::from_vec(&[3], vec![1.0, 2.0, 3.0])
            .expect("x")
            .requires_grad(true);
        let y = doubled_output(&x, Vec::new());
        backward(
            &[Value::Tensor(y)],
            &[Value::Tensor(Tensor::from_vec(&[3], vec![1.0, 1.0, 2.0]).expect("g"))],
        )
        .expect("backward");
        assert_eq!(x.grad().expect("grad").to_vec(), vec![2.0, 2.0, 4.0]);
    }

    #[test]
    fn gradient_through_a_view_scatters_into_the_base() {
        let x = Tensor::from_vec(&[2, 2], vec![1.0; 4])
            .expect("x")
            .requires_grad(true);
        let y = doubled_output(&x, Vec::new());
        let row = y.select(0, 1).expect("row");
        assert!(matches!(row.grad_fn(), Some(GradFn::View)));
        backward(
            &[Value::Tensor(row)],
            &[Value::Tensor(Tensor::from_vec(&[2], vec![1.0, 3.0]).expect("g"))],
        )
        .expect("backward");
        assert_eq!(x.grad().expect("grad").to_vec(), vec![0.0, 0.0, 2.0, 6.0]);
    }

    #[test]
    fn gradients_from_two_roots_accumulate_before_the_node_runs() {
        let x = Tensor::from_vec(&[2], vec![1.0, 1.0])
            .expect("x")
            .requires_grad(true);
        let y = doubled_output(&x, Vec::new());
        let alias = y.alias().expect("alias");
        let ones = || Value::Tensor(Tensor::full(&[2], 1.0));
        backward(&[Value::Tensor(y), Value::Tensor(alias)], &[ones(), ones()])
            .expect("backward");
        assert_eq!(x.grad().expect("grad").to_vec(), vec![4.0, 4.0]);
    }

    #[test]
    fn plain_gradient_for_a_subclass_output_is_a_guard_violation() {
        let x = Tensor::zeros(&[2]).requires_grad(true);
        let y = doubled_output(&x, Vec::new());
        let root = SubclassTensor::new(
            "two_tensor",
            vec![("a".to_owned(), y.clone()), ("b".to_owned(), y)],
        );
        let err = backward(
            &[Value::Subclass(root)],
            &[Value::Tensor(Tensor::zeros(&[2]))],
        )
        .expect_err("mismatch");
        assert!(err.is_guard_violation());
        match err {
            RuntimeError::Guard(GuardViolation::GradientSubclass {
                output,
                expected,
                actual,
            }) => {
                assert_eq!(output, 0);
                assert_eq!(expected, "two_tensor[a, b]");
                assert_eq!(actual, "dense tensor");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn modified_saved_value_is_detected() {
        let x = Tensor::zeros(&[2]).requires_grad(true);
        let saved = Tensor::zeros(&[2]);
        let y = doubled_output(&x, vec![Value::Tensor(saved.clone())]);
        saved.fill_(3.0).expect("fill");
        let err = backward(&[Value::Tensor(y)], &[Value::Tensor(Tensor::zeros(&[2]))])
            .expect_err("version");
        assert!(matches!(err, RuntimeError::SavedValueModified { index: 0, .. }));
    }

    #[test]
    fn roots_without_history_are_rejected() {
        let err = backward(
            &[Value::Tensor(Tensor::zeros(&[1]))],
            &[Value::Tensor(Tensor::zeros(&[1]))],
        )
        .expect_err("no grad_fn");
        assert_eq!(err, RuntimeError::NoGradFn { position: 0 });
        assert_eq!(
            backward(&[], &[Value::Tensor(Tensor::zeros(&[1]))]),
            Err(RuntimeError::GradientCount {
                expected: 0,
                actual: 1,
            })
        );
    }
}
