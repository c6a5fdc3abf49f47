//! Joint forward+backward graphs built from per-primitive vector-Jacobian
//! rules.
//!
//! Inputs of a joint graph are the forward inputs followed by one tangent per
//! differentiable forward output. Outputs are the forward outputs followed by
//! one gradient per forward input that requires grad.

use std::collections::BTreeMap;

use af_core::{
    Atom, Graph, GraphBuilder, Layout, Node, Primitive, TensorValue, ValueId, ValueMeta,
    encode_list, params,
};
use af_functionalize::{BaseRef, OutputClassification, ViewMetadata};
use rustc_hash::FxHashSet;
use smallvec::SmallVec;

use crate::PartitionError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JointGraph {
    pub graph: Graph,
    pub primal_count: usize,
    pub forward_output_count: usize,
    /// Forward output positions that receive a tangent, in tangent order.
    pub tangent_outputs: Vec<usize>,
    /// Forward input positions that get a gradient, in gradient order.
    pub grad_inputs: Vec<usize>,
}

impl JointGraph {
    /// The forward graph alone; partitions into an empty backward.
    #[must_use]
    pub fn inference(forward: &Graph) -> Self {
        Self {
            graph: forward.clone(),
            primal_count: forward.inputs.len(),
            forward_output_count: forward.outputs.len(),
            tangent_outputs: Vec::new(),
            grad_inputs: Vec::new(),
        }
    }

    #[must_use]
    pub fn is_inference(&self) -> bool {
        self.tangent_outputs.is_empty()
    }

    #[must_use]
    pub fn primal_inputs(&self) -> &[ValueId] {
        &self.graph.inputs[..self.primal_count]
    }

    #[must_use]
    pub fn tangent_inputs(&self) -> &[ValueId] {
        &self.graph.inputs[self.primal_count..]
    }

    #[must_use]
    pub fn forward_outputs(&self) -> &[ValueId] {
        &self.graph.outputs[..self.forward_output_count]
    }

    #[must_use]
    pub fn gradient_outputs(&self) -> &[ValueId] {
        &self.graph.outputs[self.forward_output_count..]
    }
}

/// Which functional forward outputs get a tangent.
///
/// Without `loss_outputs`: fresh and multi-view user outputs, the updates of
/// data-mutated inputs, and intermediate bases, each only when it requires
/// grad. Regenerated aliases never get one. With `loss_outputs`, only those
/// user positions do; a loss that is a regenerated alias hands its tangent to
/// the slot it is replayed from.
#[must_use]
pub fn tangent_mask(
    graph: &Graph,
    metadata: &ViewMetadata,
    loss_outputs: Option<&[usize]>,
) -> Vec<bool> {
    let requires_grad = |position: usize| {
        graph
            .outputs
            .get(position)
            .and_then(|id| graph.meta(*id))
            .is_some_and(ValueMeta::requires_grad)
    };
    let users = metadata.outputs.len();
    let mutated = metadata.mutated_inputs();
    let extra_start = users + mutated.len();
    let mut wanted: Vec<usize> = Vec::new();
    match loss_outputs {
        None => {
            for (position, info) in metadata.outputs.iter().enumerate() {
                if !info.is_symbolic
                    && matches!(
                        info.classification,
                        OutputClassification::Fresh | OutputClassification::AliasOfInputMultiView(_)
                    )
                {
                    wanted.push(position);
                }
            }
            for (rank, input) in mutated.iter().enumerate() {
                if metadata.inputs[*input].mutation.mutates_data() {
                    wanted.push(users + rank);
                }
            }
            wanted.extend(extra_start..graph.outputs.len());
        }
        Some(losses) => {
            for position in losses {
                let Some(info) = metadata.outputs.get(*position) else {
                    continue;
                };
                if info.is_symbolic {
                    continue;
                }
                match info.classification {
                    OutputClassification::Fresh
                    | OutputClassification::AliasOfInputMultiView(_) => wanted.push(*position),
                    OutputClassification::AliasOfIntermediate(BaseRef::UserOutput(user)) => {
                        wanted.push(user);
                    }
                    OutputClassification::AliasOfIntermediate(BaseRef::ExtraOutput(extra)) => {
                        wanted.push(extra_start + extra);
                    }
                    // Without an update slot the alias is replayed on the
                    // caller's own tensor and keeps that tensor's history.
                    OutputClassification::AliasOfInput(input) => {
                        if let Some(rank) = mutated.iter().position(|m| *m == input)
                            && metadata.inputs[input].mutation.mutates_data()
                        {
                            wanted.push(users + rank);
                        }
                    }
                }
            }
        }
    }
    (0..graph.outputs.len())
        .map(|position| wanted.contains(&position) && requires_grad(position))
        .collect()
}

/// Repeats each logical entry once per flattened slot.
#[must_use]
pub fn expand_mask(mask: &[bool], slot_counts: impl IntoIterator<Item = usize>) -> Vec<bool> {
    mask.iter()
        .zip(slot_counts)
        .flat_map(|(wanted, count)| std::iter::repeat_n(*wanted, count))
        .collect()
}

pub fn build_joint(forward: &Graph, differentiable: &[bool]) -> Result<JointGraph, PartitionError> {
    if differentiable.len() != forward.outputs.len() {
        return Err(PartitionError::MaskLength {
            expected: forward.outputs.len(),
            actual: differentiable.len(),
        });
    }
    let requires_grad = |id: &ValueId| forward.meta(*id).is_some_and(ValueMeta::requires_grad);
    let tangent_outputs: Vec<usize> = forward
        .outputs
        .iter()
        .zip(differentiable)
        .enumerate()
        .filter(|(_, (id, wanted))| **wanted && requires_grad(id))
        .map(|(position, _)| position)
        .collect();
    let grad_inputs: Vec<usize> = forward
        .inputs
        .iter()
        .enumerate()
        .filter(|(_, id)| requires_grad(id))
        .map(|(position, _)| position)
        .collect();
    if tangent_outputs.is_empty() || grad_inputs.is_empty() {
        return Ok(JointGraph::inference(forward));
    }
    if let Some((node_index, node)) = forward
        .nodes
        .iter()
        .enumerate()
        .find(|(_, node)| node.primitive.is_mutation())
    {
        return Err(PartitionError::MutationInForward {
            node_index,
            primitive: node.primitive.as_str(),
        });
    }

    let mut rules = Vjp {
        builder: GraphBuilder::extending(forward),
        cotangents: BTreeMap::new(),
    };
    for position in &tangent_outputs {
        let id = forward.outputs[*position];
        let tensor = rules.tensor(id)?;
        let storage = rules.builder.fresh_storage();
        let tangent = rules.builder.input_meta(ValueMeta::Tensor(TensorValue::dense(
            tensor.dtype,
            Layout::contiguous(&tensor.layout.sizes),
            storage,
        )));
        rules.accumulate(id, tangent)?;
    }
    for (node_index, node) in forward.nodes.iter().enumerate().rev() {
        let cotangents: SmallVec<[Option<ValueId>; 2]> = node
            .outputs
            .iter()
            .map(|id| rules.cotangents.remove(id))
            .collect();
        if cotangents.iter().all(Option::is_none) || !node.input_vars().any(|id| rules.wants(id)) {
            continue;
        }
        rules.node(node_index, node, &cotangents)?;
        tracing::trace!(node_index, primitive = node.primitive.as_str(), "applied vjp rule");
    }

    let mut outputs = forward.outputs.clone();
    let mut seen: FxHashSet<ValueId> = outputs.iter().copied().collect();
    for position in &grad_inputs {
        let id = forward.inputs[*position];
        let mut grad = match rules.cotangents.get(&id) {
            Some(grad) => *grad,
            None => {
                let sizes = rules.tensor(id)?.layout.sizes;
                rules.builder.full(&sizes, 0.0)?
            }
        };
        if !seen.insert(grad) {
            grad = rules.builder.unary(Primitive::Clone, grad)?;
            seen.insert(grad);
        }
        outputs.push(grad);
    }
    let graph = rules.builder.finish(outputs);
    tracing::debug!(
        forward_nodes = forward.nodes.len(),
        joint_nodes = graph.nodes.len(),
        tangents = tangent_outputs.len(),
        gradients = grad_inputs.len(),
        "built joint graph"
    );
    Ok(JointGraph {
        graph,
        primal_count: forward.inputs.len(),
        forward_output_count: forward.outputs.len(),
        tangent_outputs,
        grad_inputs,
    })
}

struct Vjp {
    builder: GraphBuilder,
    cotangents: BTreeMap<ValueId, ValueId>,
}

impl Vjp {
    fn tensor(&self, id: ValueId) -> Result<TensorValue, PartitionError> {
        self.builder
            .tensor(id)
            .cloned()
            .ok_or(PartitionError::UnknownValue(id))
    }

    fn wants(&self, id: ValueId) -> bool {
        self.builder.meta(id).is_some_and(ValueMeta::requires_grad)
    }

    /// Adds `cotangent` into the running total for `id`. A cotangent for a
    /// rank-0 value is summed down first.
    fn accumulate(&mut self, id: ValueId, cotangent: ValueId) -> Result<(), PartitionError> {
        if !self.wants(id) {
            return Ok(());
        }
        let expected = self.tensor(id)?.layout.sizes;
        let actual = self.tensor(cotangent)?.layout.sizes;
        let cotangent = if expected == actual {
            cotangent
        } else if expected.is_empty() {
            self.builder.unary(Primitive::Sum, cotangent)?
        } else {
            return Err(PartitionError::CotangentShape {
                value: id,
                expected,
                actual,
            });
        };
        let total = match self.cotangents.get(&id) {
            Some(existing) => self.builder.binary(Primitive::Add, *existing, cotangent)?,
            None => cotangent,
        };
        self.cotangents.insert(id, total);
        Ok(())
    }

    /// `g <op> operand`, where the operand may be a literal.
    fn with_operand(
        &mut self,
        primitive: Primitive,
        g: ValueId,
        operand: Option<&Atom>,
    ) -> Result<ValueId, PartitionError> {
        let atom = operand.copied().ok_or(PartitionError::UnknownValue(g))?;
        Ok(self
            .builder
            .apply1(primitive, &[Atom::Var(g), atom], BTreeMap::new())?)
    }

    fn strided_backward(
        &mut self,
        g: ValueId,
        input: ValueId,
        view: ValueId,
    ) -> Result<ValueId, PartitionError> {
        let input = self.tensor(input)?.layout;
        let view = self.tensor(view)?.layout;
        Ok(self.builder.apply1(
            Primitive::AsStridedBackward,
            &[Atom::Var(g)],
            params([
                ("input_sizes", encode_list(&input.sizes)),
                ("input_strides", encode_list(&input.strides)),
                ("sizes", encode_list(&view.sizes)),
                ("strides", encode_list(&view.strides)),
                ("offset", view.offset_from(&input).to_string()),
            ]),
        )?)
    }

    fn contiguous(&mut self, g: ValueId) -> Result<ValueId, PartitionError> {
        let layout = self.tensor(g)?.layout;
        if layout.is_contiguous() && layout.storage_offset == 0 {
            return Ok(g);
        }
        Ok(self.builder.unary(Primitive::Clone, g)?)
    }

    fn node(
        &mut self,
        node_index: usize,
        node: &Node,
        cotangents: &[Option<ValueId>],
    ) -> Result<(), PartitionError> {
        let unsupported = |reason: &str| PartitionError::UnsupportedVjp {
            node_index,
            primitive: node.primitive.as_str(),
            reason: reason.to_owned(),
        };
        let var = |position: usize| node.inputs.get(position).and_then(|atom| atom.var());
        let Some(a) = var(0) else {
            return Ok(());
        };

        if node.primitive == Primitive::Unbind {
            for (cotangent, view) in cotangents.iter().zip(&node.outputs) {
                if let Some(g) = cotangent {
                    let grad = self.strided_backward(*g, a, *view)?;
                    self.accumulate(a, grad)?;
                }
            }
            return Ok(());
        }
        let (Some(g), Some(out)) = (
            cotangents.first().copied().flatten(),
            node.outputs.first().copied(),
        ) else {
            return Ok(());
        };

        match node.primitive {
            Primitive::Add => {
                self.accumulate(a, g)?;
                if let Some(b) = var(1) {
                    self.accumulate(b, g)?;
                }
            }
            Primitive::Sub => {
                self.accumulate(a, g)?;
                if let Some(b) = var(1)
                    && self.wants(b)
                {
                    let negated = self.builder.unary(Primitive::Neg, g)?;
                    self.accumulate(b, negated)?;
                }
            }
            Primitive::Mul => {
                if self.wants(a) {
                    let grad = self.with_operand(Primitive::Mul, g, node.inputs.get(1))?;
                    self.accumulate(a, grad)?;
                }
                if let Some(b) = var(1)
                    && self.wants(b)
                {
                    let grad = self.builder.binary(Primitive::Mul, g, a)?;
                    self.accumulate(b, grad)?;
                }
            }
            Primitive::Div => {
                if self.wants(a) {
                    let grad = self.with_operand(Primitive::Div, g, node.inputs.get(1))?;
                    self.accumulate(a, grad)?;
                }
                if let Some(b) = var(1)
                    && self.wants(b)
                {
                    let scaled = self.builder.binary(Primitive::Mul, g, a)?;
                    let once = self.builder.binary(Primitive::Div, scaled, b)?;
                    let twice = self.builder.binary(Primitive::Div, once, b)?;
                    let grad = self.builder.unary(Primitive::Neg, twice)?;
                    self.accumulate(b, grad)?;
                }
            }
            Primitive::Neg => {
                let grad = self.builder.unary(Primitive::Neg, g)?;
                self.accumulate(a, grad)?;
            }
            Primitive::Exp => {
                let grad = self.builder.binary(Primitive::Mul, g, out)?;
                self.accumulate(a, grad)?;
            }
            Primitive::Log => {
                let grad = self.builder.binary(Primitive::Div, g, a)?;
                self.accumulate(a, grad)?;
            }
            Primitive::Sin => {
                let cos = self.builder.unary(Primitive::Cos, a)?;
                let grad = self.builder.binary(Primitive::Mul, g, cos)?;
                self.accumulate(a, grad)?;
            }
            Primitive::Cos => {
                let sin = self.builder.unary(Primitive::Sin, a)?;
                let scaled = self.builder.binary(Primitive::Mul, g, sin)?;
                let grad = self.builder.unary(Primitive::Neg, scaled)?;
                self.accumulate(a, grad)?;
            }
            Primitive::Relu => {
                let grad = self.builder.binary(Primitive::ThresholdBackward, g, out)?;
                self.accumulate(a, grad)?;
            }
            Primitive::Clone | Primitive::Alias => self.accumulate(a, g)?,
            Primitive::Sum => {
                let sizes = self.tensor(a)?.layout.sizes;
                if sizes.is_empty() {
                    self.accumulate(a, g)?;
                } else {
                    // Only the shape of `a` is needed here, so depend on its sizes.
                    let mut atoms = vec![Atom::Var(g)];
                    for dim in 0..sizes.len() {
                        atoms.push(Atom::Var(self.builder.sym_size(a, dim as i64)?));
                    }
                    let grad = self.builder.apply1(
                        Primitive::Expand,
                        &atoms,
                        params([("sizes", encode_list(&sizes))]),
                    )?;
                    self.accumulate(a, grad)?;
                }
            }
            Primitive::Expand => {
                let grad = self.builder.unary(Primitive::Sum, g)?;
                self.accumulate(a, grad)?;
            }
            Primitive::Copy => {
                if let Some(src) = var(1) {
                    self.accumulate(src, g)?;
                }
            }
            Primitive::Fill => {
                if let Some(value) = var(1)
                    && self.wants(value)
                {
                    let grad = self.builder.unary(Primitive::Sum, g)?;
                    self.accumulate(value, grad)?;
                }
            }
            Primitive::View
            | Primitive::AsStrided
            | Primitive::Slice
            | Primitive::Select
            | Primitive::Transpose
            | Primitive::Unsqueeze => {
                if self.wants(a) {
                    let grad = self.strided_backward(g, a, out)?;
                    self.accumulate(a, grad)?;
                }
            }
            Primitive::AsStridedScatter => {
                if !self.tensor(a)?.layout.is_contiguous() {
                    return Err(unsupported("scatter into a non-contiguous base"));
                }
                let g = self.contiguous(g)?;
                if self.wants(a) {
                    let src_sizes = match var(1) {
                        Some(src) => self.tensor(src)?.layout.sizes,
                        None => return Err(unsupported("scatter source is not a tensor")),
                    };
                    let zeros = self.builder.full(&src_sizes, 0.0)?;
                    let grad = self.builder.apply1(
                        Primitive::AsStridedScatter,
                        &[Atom::Var(g), Atom::Var(zeros)],
                        node.params.clone(),
                    )?;
                    self.accumulate(a, grad)?;
                }
                if let Some(src) = var(1)
                    && self.wants(src)
                {
                    let grad = self.builder.apply1(
                        Primitive::AsStrided,
                        &[Atom::Var(g)],
                        node.params.clone(),
                    )?;
                    self.accumulate(src, grad)?;
                }
            }
            Primitive::Detach | Primitive::SymSize | Primitive::Full | Primitive::ZerosLike => {}
            Primitive::ThresholdBackward | Primitive::AsStridedBackward => {
                return Err(unsupported("higher-order derivatives are not supported"));
            }
            Primitive::Unbind
            | Primitive::AddInplace
            | Primitive::SubInplace
            | Primitive::MulInplace
            | Primitive::DivInplace
            | Primitive::CopyInplace
            | Primitive::FillInplace
            | Primitive::TransposeInplace
            | Primitive::UnsqueezeInplace
            | Primitive::Set => return Err(unsupported("mutating primitive")),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{build_joint, expand_mask, tangent_mask};
    use crate::PartitionError;
    use af_core::{
        Graph, GraphBuilder, Layout, Primitive, ProgramSpec, StorageId, Tensor, Value,
        build_program,
    };
    use af_functionalize::{CollectOptions, functionalize};
    use af_interpreters::eval_graph;

    fn tensor(sizes: &[usize], values: &[f64]) -> Value {
        Value::Tensor(Tensor::from_vec(sizes, values.to_vec()).expect("tensor"))
    }

    fn assert_close(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len(), "{actual:?} vs {expected:?}");
        for (a, e) in actual.iter().zip(expected) {
            assert!((a - e).abs() < 1e-9, "{actual:?} vs {expected:?}");
        }
    }

    fn run(graph: &Graph, args: &[Value]) -> Vec<Vec<f64>> {
        eval_graph(graph, args)
            .expect("eval")
            .iter()
            .map(|value| value.to_vecs().concat())
            .collect()
    }

    #[test]
    fn pure_loss_gradients_match_the_closed_form() {
        let graph = build_program(ProgramSpec::PureLoss).expect("program");
        let joint = build_joint(&graph, &[true]).expect("joint");
        assert_eq!(joint.graph.inputs.len(), 3);
        assert_eq!(joint.gradient_outputs().len(), 2);
        assert!(
            joint
                .graph
                .nodes
                .iter()
                .any(|node| node.primitive == Primitive::SymSize)
        );

        let a = [1.0, -2.0, 3.0];
        let c = [2.0, 1.0, -1.0];
        let out = run(
            &joint.graph,
            &[
                tensor(&[3], &a),
                tensor(&[3], &c),
                Value::Tensor(Tensor::scalar(1.0)),
            ],
        );
        let relu_mask = [1.0, 0.0, 0.0];
        let grad_a: Vec<f64> = (0..3).map(|i| relu_mask[i] * c[i] - a[i].sin()).collect();
        let grad_c: Vec<f64> = (0..3).map(|i| relu_mask[i] * a[i]).collect();
        assert_close(&out[1], &grad_a);
        assert_close(&out[2], &grad_c);
    }

    #[test]
    fn elementwise_gradients_flow_to_both_inputs() {
        let graph = build_program(ProgramSpec::PureElementwise).expect("program");
        let joint = build_joint(&graph, &[true]).expect("joint");
        let a = [0.5, 1.0, 1.5, 2.0, 2.5, 3.0];
        let b = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        let out = run(
            &joint.graph,
            &[tensor(&[2, 3], &a), tensor(&[2, 3], &b), tensor(&[2, 3], &[1.0; 6])],
        );
        let grad_a: Vec<f64> = (0..6).map(|i| a[i].exp() - b[i].sin()).collect();
        let grad_b: Vec<f64> = (0..6).map(|i| -b[i].cos() * a[i]).collect();
        assert_close(&out[1], &grad_a);
        assert_close(&out[2], &grad_b);
    }

    #[test]
    fn select_routes_gradient_to_one_row() {
        let mut b = GraphBuilder::new();
        let a = b.input(&[2, 3], true);
        let row = b.select(a, 0, 1).expect("select");
        let out = b.scalar(Primitive::Mul, row, 2.0).expect("mul");
        let graph = b.finish(vec![out]);
        let joint = build_joint(&graph, &[true]).expect("joint");
        let out = run(
            &joint.graph,
            &[tensor(&[2, 3], &[1.0; 6]), tensor(&[3], &[1.0, 2.0, 3.0])],
        );
        assert_eq!(out[1], vec![0.0, 0.0, 0.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn unbind_gradients_cover_only_seeded_rows() {
        let graph = build_program(ProgramSpec::UnbindInput).expect("program");
        let joint = build_joint(&graph, &[true, false, true]).expect("joint");
        assert_eq!(joint.tangent_outputs, vec![0, 2]);
        let out = run(
            &joint.graph,
            &[
                tensor(&[3, 3], &[0.0; 9]),
                tensor(&[3], &[1.0; 3]),
                tensor(&[3], &[5.0; 3]),
            ],
        );
        assert_eq!(out[3], vec![1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 5.0, 5.0, 5.0]);
    }

    #[test]
    fn scatter_gradient_splits_between_window_and_rest() {
        let mut b = GraphBuilder::new();
        let a = b.input_view(StorageId(500), Layout::contiguous(&[2, 3]), true);
        let row = b.select(a, 0, 0).expect("select");
        b.inplace_scalar(Primitive::MulInplace, row, 2.0).expect("mul_");
        let out = b.scalar(Primitive::Mul, a, 1.0).expect("mul");
        let graph = b.finish(vec![out]);
        let functional = functionalize(&graph, &CollectOptions::default()).expect("functionalize");
        assert_eq!(functional.graph.outputs.len(), 2);

        let joint = build_joint(&functional.graph, &[true, false]).expect("joint");
        let out = run(
            &joint.graph,
            &[tensor(&[2, 3], &[1.0; 6]), tensor(&[2, 3], &[1.0; 6])],
        );
        assert_eq!(out[2], vec![2.0, 2.0, 2.0, 1.0, 1.0, 1.0]);
    }

    #[test]
    fn no_tangents_or_no_grad_inputs_means_inference() {
        let graph = build_program(ProgramSpec::PureLoss).expect("program");
        assert!(build_joint(&graph, &[false]).expect("joint").is_inference());
        let frozen = build_program(ProgramSpec::MulThenScale).expect("program");
        let functional = functionalize(&frozen, &CollectOptions::default()).expect("functionalize");
        assert!(
            build_joint(&functional.graph, &[true, true])
                .expect("joint")
                .is_inference()
        );
        assert_eq!(
            build_joint(&graph, &[]),
            Err(PartitionError::MaskLength {
                expected: 1,
                actual: 0
            })
        );
    }

    #[test]
    fn a_mutating_forward_is_rejected() {
        let mut b = GraphBuilder::new();
        let a = b.input_view(StorageId(500), Layout::contiguous(&[2]), true);
        b.inplace_scalar(Primitive::MulInplace, a, 2.0).expect("mul_");
        let out = b.scalar(Primitive::Mul, a, 3.0).expect("mul");
        let graph = b.finish(vec![out]);
        assert!(matches!(
            build_joint(&graph, &[true]),
            Err(PartitionError::MutationInForward { node_index: 0, .. })
        ));
    }

    #[test]
    fn the_same_gradient_twice_is_cloned() {
        let mut b = GraphBuilder::new();
        let a = b.input(&[2], true);
        let c = b.input(&[2], true);
        let out = b.binary(Primitive::Add, a, c).expect("add");
        let graph = b.finish(vec![out]);
        let joint = build_joint(&graph, &[true]).expect("joint");
        joint.graph.validate_well_formed().expect("distinct outputs");
        let out = run(
            &joint.graph,
            &[tensor(&[2], &[1.0, 1.0]), tensor(&[2], &[1.0, 1.0]), tensor(&[2], &[3.0, 4.0])],
        );
        assert_eq!(out[1], vec![3.0, 4.0]);
        assert_eq!(out[2], vec![3.0, 4.0]);
    }

    #[test]
    fn regenerated_aliases_get_no_tangent() {
        let graph = build_program(ProgramSpec::AliasOfIntermediate).expect("program");
        let functional = functionalize(&graph, &CollectOptions::default()).expect("functionalize");
        let mask = tangent_mask(&functional.graph, &functional.metadata, None);
        assert_eq!(mask, vec![false, true]);
        let losses = tangent_mask(&functional.graph, &functional.metadata, Some(&[0]));
        assert_eq!(losses, vec![false, true]);
    }

    #[test]
    fn a_loss_aliasing_an_updated_input_seeds_the_update() {
        let mut b = GraphBuilder::new();
        let a = b.input(&[2], false);
        let w = b.input(&[2], true);
        let doubled = b.scalar(Primitive::Mul, w, 2.0).expect("mul");
        b.copy_(a, doubled).expect("copy_");
        let graph = b.finish(vec![a]);
        let functional = functionalize(&graph, &CollectOptions::default()).expect("functionalize");
        assert_eq!(functional.graph.outputs.len(), 2);
        assert_eq!(tangent_mask(&functional.graph, &functional.metadata, None), vec![false, true]);
        assert_eq!(
            tangent_mask(&functional.graph, &functional.metadata, Some(&[0])),
            vec![false, true]
        );
    }

    #[test]
    fn masks_expand_per_slot() {
        assert_eq!(
            expand_mask(&[true, false, true], [2, 1, 1]),
            vec![true, true, false, true]
        );
    }
}
