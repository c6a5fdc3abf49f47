//! Forward/backward partitioning of a joint graph.
//!
//! A joint node belongs to the backward region when it reads a tangent,
//! directly or transitively; everything else is forward-side. Forward-side
//! values the backward region reads either cross the boundary as saved
//! values or are recomputed inside the backward, depending on the policy.

use std::collections::{BTreeMap, BTreeSet};

use af_core::{Graph, GraphBuilder, Node, Primitive, ValueId, ValueMeta, remap_values};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::dce::live_nodes;
use crate::flow::{FlowNetwork, INF};
use crate::joint::JointGraph;
use crate::{MutationScope, PartitionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionPolicy {
    /// Save every forward value the backward reads.
    #[default]
    Default,
    /// Recompute cheap forward values when that shrinks what is saved.
    MinCut,
}

impl PartitionPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::MinCut => "min_cut",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "default" => Some(Self::Default),
            "min_cut" => Some(Self::MinCut),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionOptions {
    pub policy: PartitionPolicy,
    /// Replaces the default cheap-to-recompute set when present.
    pub recompute_allowlist: Option<Vec<Primitive>>,
}

impl PartitionOptions {
    #[must_use]
    pub fn with_policy(policy: PartitionPolicy) -> Self {
        Self {
            policy,
            recompute_allowlist: None,
        }
    }

    #[must_use]
    pub fn is_recomputable(&self, primitive: Primitive) -> bool {
        match &self.recompute_allowlist {
            Some(allowlist) => allowlist.contains(&primitive),
            None => primitive.is_cheap_to_recompute(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavedKind {
    Tensor,
    /// A symbolic integer, saved in place of the tensor it measures.
    Scalar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedValue {
    /// Id in the joint graph.
    pub value: ValueId,
    pub kind: SavedKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartitionPlan {
    pub policy: PartitionPolicy,
    /// Tensors first, then scalars; each group in joint value order.
    pub saved: Vec<SavedValue>,
    /// Joint node indices replayed inside the backward.
    pub recomputed: Vec<usize>,
    pub tangent_outputs: Vec<usize>,
    pub grad_inputs: Vec<usize>,
}

impl PartitionPlan {
    #[must_use]
    pub fn saved_count(&self) -> usize {
        self.saved.len()
    }

    #[must_use]
    pub fn saved_tensor_count(&self) -> usize {
        self.saved
            .iter()
            .filter(|saved| saved.kind == SavedKind::Tensor)
            .count()
    }

    #[must_use]
    pub fn saved_scalar_count(&self) -> usize {
        self.saved_count() - self.saved_tensor_count()
    }

    #[must_use]
    pub fn is_inference(&self) -> bool {
        self.tangent_outputs.is_empty()
    }
}

/// Where a forward-side value ends up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueRole {
    ConsumedOnlyInForward,
    CrossesToBackward,
    RecomputedInBackward,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Outputs: the forward outputs, then one per saved value.
    pub forward: Graph,
    /// Inputs: one per saved value, then one per tangent. Outputs: gradients.
    pub backward: Graph,
    pub plan: PartitionPlan,
    /// Keyed by joint value id, forward-side values only.
    pub roles: BTreeMap<ValueId, ValueRole>,
}

impl Partition {
    #[must_use]
    pub fn saved_count(&self) -> usize {
        self.plan.saved_count()
    }

    #[must_use]
    pub fn role(&self, value: ValueId) -> Option<ValueRole> {
        self.roles.get(&value).copied()
    }
}

struct Regions {
    /// Values computed from a tangent.
    tainted: FxHashSet<ValueId>,
    backward: Vec<bool>,
    /// Forward-side values that read no graph input at all.
    constant: FxHashSet<ValueId>,
}

impl Regions {
    fn classify(joint: &JointGraph) -> Self {
        let mut tainted: FxHashSet<ValueId> = joint.tangent_inputs().iter().copied().collect();
        let mut constant = FxHashSet::default();
        let mut backward = Vec::with_capacity(joint.graph.nodes.len());
        for node in &joint.graph.nodes {
            let reads_tangent = node.input_vars().any(|id| tainted.contains(&id));
            if reads_tangent {
                tainted.extend(node.outputs.iter().copied());
            } else if node.input_vars().all(|id| constant.contains(&id)) {
                constant.extend(node.outputs.iter().copied());
            }
            backward.push(reads_tangent);
        }
        Self {
            tainted,
            backward,
            constant,
        }
    }

    fn check_mutations(&self, graph: &Graph) -> Result<(), PartitionError> {
        for (node_index, node) in graph.nodes.iter().enumerate() {
            if !self.backward[node_index] || !node.primitive.is_mutation() {
                continue;
            }
            let Some(target) = node.inputs.first().and_then(|atom| atom.var()) else {
                continue;
            };
            let defined_here = graph.nodes[..node_index]
                .iter()
                .zip(&self.backward)
                .any(|(earlier, backward)| *backward && earlier.outputs.contains(&target));
            let scope = if graph.meta(target).is_some_and(ValueMeta::requires_grad) {
                MutationScope::RequiresGrad
            } else if !defined_here {
                MutationScope::OutsideBackward
            } else {
                MutationScope::BackwardLocal
            };
            return Err(PartitionError::BackwardMutation {
                node_index,
                primitive: node.primitive.as_str(),
                target,
                scope,
            });
        }
        Ok(())
    }
}

fn materialization_cost(meta: Option<&ValueMeta>) -> u64 {
    match meta {
        Some(ValueMeta::Tensor(tensor)) => {
            let bytes = tensor.layout.numel() * tensor.dtype.size_bytes();
            u64::try_from(bytes.max(1)).unwrap_or(INF)
        }
        _ => 1,
    }
}

pub fn partition(joint: &JointGraph, options: &PartitionOptions) -> Result<Partition, PartitionError> {
    let graph = &joint.graph;
    if joint.is_inference() {
        let roles = graph
            .nodes
            .iter()
            .flat_map(|node| node.outputs.iter())
            .map(|id| (*id, ValueRole::ConsumedOnlyInForward))
            .collect();
        return Ok(Partition {
            forward: graph.clone(),
            backward: Graph::new(Vec::new(), Vec::new(), Vec::new(), Vec::new()),
            plan: PartitionPlan {
                policy: options.policy,
                ..PartitionPlan::default()
            },
            roles,
        });
    }

    let regions = Regions::classify(joint);
    regions.check_mutations(graph)?;

    let backward_live = live_nodes(graph, joint.gradient_outputs().iter().copied());
    let backward_nodes: Vec<usize> = (0..graph.nodes.len())
        .filter(|index| regions.backward[*index] && backward_live[*index])
        .collect();
    let mut demand: BTreeSet<ValueId> = BTreeSet::new();
    for index in &backward_nodes {
        demand.extend(
            graph.nodes[*index]
                .input_vars()
                .filter(|id| !regions.tainted.contains(id)),
        );
    }
    demand.extend(
        joint
            .gradient_outputs()
            .iter()
            .filter(|id| !regions.tainted.contains(*id)),
    );

    let mut saved = match options.policy {
        PartitionPolicy::Default => demand
            .iter()
            .filter(|id| !regions.constant.contains(*id))
            .copied()
            .collect(),
        PartitionPolicy::MinCut => min_cut(joint, &regions, &demand, options),
    };
    let producers = graph.producers();
    let recomputed = recompute_closure(graph, &producers, &demand, &mut saved);

    let (tensors, scalars): (Vec<ValueId>, Vec<ValueId>) = saved
        .iter()
        .partition(|id| graph.tensor(**id).is_some());
    let saved: Vec<SavedValue> = tensors
        .into_iter()
        .map(|value| SavedValue {
            value,
            kind: SavedKind::Tensor,
        })
        .chain(scalars.into_iter().map(|value| SavedValue {
            value,
            kind: SavedKind::Scalar,
        }))
        .collect();

    let roles = assign_roles(joint, &regions, &saved, &recomputed);
    let forward = forward_graph(joint, &regions, &saved)?;
    let backward = backward_graph(joint, &saved, &recomputed, &backward_nodes)?;
    let plan = PartitionPlan {
        policy: options.policy,
        saved,
        recomputed,
        tangent_outputs: joint.tangent_outputs.clone(),
        grad_inputs: joint.grad_inputs.clone(),
    };
    tracing::debug!(
        policy = plan.policy.as_str(),
        saved_tensors = plan.saved_tensor_count(),
        saved_scalars = plan.saved_scalar_count(),
        recomputed = plan.recomputed.len(),
        forward_nodes = forward.nodes.len(),
        backward_nodes = backward.nodes.len(),
        "partitioned joint graph"
    );
    Ok(Partition {
        forward,
        backward,
        plan,
        roles,
    })
}

/// Splits every forward-side value into an `in -> out` edge weighted by its
/// size. Values that cannot be recomputed hang off the source, demanded
/// values drain into the sink, and the saved set is the values whose edge
/// the minimum cut crosses.
fn min_cut(
    joint: &JointGraph,
    regions: &Regions,
    demand: &BTreeSet<ValueId>,
    options: &PartitionOptions,
) -> BTreeSet<ValueId> {
    let graph = &joint.graph;
    let (source, sink) = (0, 1);
    let mut network = FlowNetwork::new(2);
    let mut vertices: FxHashMap<ValueId, usize> = FxHashMap::default();
    let split = |network: &mut FlowNetwork, vertices: &mut FxHashMap<ValueId, usize>, id: ValueId| {
        let value_in = network.add_vertex();
        let value_out = network.add_vertex();
        network.add_edge(value_in, value_out, materialization_cost(graph.meta(id)));
        vertices.insert(id, value_in);
        value_in
    };

    for id in joint.primal_inputs() {
        let value_in = split(&mut network, &mut vertices, *id);
        network.add_edge(source, value_in, INF);
    }
    for (index, node) in graph.nodes.iter().enumerate() {
        if regions.backward[index] {
            continue;
        }
        let recomputable = options.is_recomputable(node.primitive);
        let sources: Vec<usize> = node
            .input_vars()
            .filter_map(|id| vertices.get(&id).copied())
            .collect();
        for id in &node.outputs {
            let value_in = split(&mut network, &mut vertices, *id);
            let symbolic = graph.meta(*id).is_some_and(ValueMeta::is_sym_int);
            if !recomputable || symbolic {
                network.add_edge(source, value_in, INF);
            }
            for input_in in &sources {
                network.add_edge(input_in + 1, value_in, INF);
            }
        }
    }
    for id in demand {
        if let Some(value_in) = vertices.get(id) {
            network.add_edge(value_in + 1, sink, INF);
        }
    }

    let flow = network.max_flow(source, sink);
    let reachable = network.reachable_from(source);
    let saved: BTreeSet<ValueId> = vertices
        .iter()
        .filter(|(_, value_in)| reachable[**value_in] && !reachable[**value_in + 1])
        .map(|(id, _)| *id)
        .collect();
    tracing::trace!(flow, vertices = network.vertex_count(), "solved min cut");
    saved
}

/// Forward-side nodes the backward must replay to rebuild `demand` from
/// what is saved. A graph input reached this way is saved instead.
fn recompute_closure(
    graph: &Graph,
    producers: &FxHashMap<ValueId, usize>,
    demand: &BTreeSet<ValueId>,
    saved: &mut BTreeSet<ValueId>,
) -> Vec<usize> {
    let mut nodes = BTreeSet::new();
    let mut visited = FxHashSet::default();
    let mut stack: Vec<ValueId> = demand.iter().copied().collect();
    while let Some(id) = stack.pop() {
        if !visited.insert(id) || saved.contains(&id) {
            continue;
        }
        match producers.get(&id) {
            Some(index) => {
                if nodes.insert(*index) {
                    stack.extend(graph.nodes[*index].input_vars());
                }
            }
            None => {
                saved.insert(id);
            }
        }
    }
    nodes.into_iter().collect()
}

fn assign_roles(
    joint: &JointGraph,
    regions: &Regions,
    saved: &[SavedValue],
    recomputed: &[usize],
) -> BTreeMap<ValueId, ValueRole> {
    let graph = &joint.graph;
    let crossing: FxHashSet<ValueId> = saved.iter().map(|saved| saved.value).collect();
    let replayed: FxHashSet<ValueId> = recomputed
        .iter()
        .flat_map(|index| graph.nodes[*index].outputs.iter().copied())
        .collect();
    let forward_values = joint.primal_inputs().iter().copied().chain(
        graph
            .nodes
            .iter()
            .zip(&regions.backward)
            .filter(|(_, backward)| !**backward)
            .flat_map(|(node, _)| node.outputs.iter().copied()),
    );
    forward_values
        .map(|id| {
            let role = if crossing.contains(&id) {
                ValueRole::CrossesToBackward
            } else if replayed.contains(&id) {
                ValueRole::RecomputedInBackward
            } else {
                ValueRole::ConsumedOnlyInForward
            };
            (id, role)
        })
        .collect()
}

fn meta_of(graph: &Graph, id: ValueId) -> Result<ValueMeta, PartitionError> {
    graph
        .meta(id)
        .cloned()
        .ok_or(PartitionError::UnknownValue(id))
}

fn forward_graph(
    joint: &JointGraph,
    regions: &Regions,
    saved: &[SavedValue],
) -> Result<Graph, PartitionError> {
    let graph = &joint.graph;
    let roots = joint
        .forward_outputs()
        .iter()
        .copied()
        .chain(saved.iter().map(|saved| saved.value));
    let live = live_nodes(graph, roots);
    let nodes: Vec<Node> = graph
        .nodes
        .iter()
        .enumerate()
        .filter(|(index, _)| live[*index] && !regions.backward[*index])
        .map(|(_, node)| node.clone())
        .collect();

    let mut builder = GraphBuilder::new();
    let mut remap = BTreeMap::new();
    for id in joint.primal_inputs() {
        remap.insert(*id, builder.input_meta(meta_of(graph, *id)?));
    }
    builder.replay_nodes(&nodes, &mut remap)?;
    let mut outputs = remap_values(joint.forward_outputs(), &remap)?;
    let mut seen: FxHashSet<ValueId> = outputs.iter().copied().collect();
    for value in saved {
        let mut id = remap_values(&[value.value], &remap)?[0];
        if !seen.insert(id) {
            if builder.tensor(id).is_none() {
                return Err(PartitionError::DuplicateSymbolicSave(value.value));
            }
            id = builder.unary(Primitive::Alias, id)?;
            seen.insert(id);
        }
        outputs.push(id);
    }
    Ok(builder.finish(outputs))
}

fn backward_graph(
    joint: &JointGraph,
    saved: &[SavedValue],
    recomputed: &[usize],
    backward_nodes: &[usize],
) -> Result<Graph, PartitionError> {
    let graph = &joint.graph;
    let mut builder = GraphBuilder::new();
    let mut remap = BTreeMap::new();
    for value in saved {
        let meta = match meta_of(graph, value.value)? {
            ValueMeta::Tensor(tensor) => ValueMeta::Tensor(tensor.with_requires_grad(false)),
            other => other,
        };
        remap.insert(value.value, builder.input_meta(meta));
    }
    for id in joint.tangent_inputs() {
        remap.insert(*id, builder.input_meta(meta_of(graph, *id)?));
    }
    let order: BTreeSet<usize> = recomputed
        .iter()
        .chain(backward_nodes)
        .copied()
        .collect();
    let nodes: Vec<Node> = order
        .into_iter()
        .map(|index| graph.nodes[index].clone())
        .collect();
    builder.replay_nodes(&nodes, &mut remap)?;
    let outputs = remap_values(joint.gradient_outputs(), &remap)?;
    Ok(builder.finish(outputs))
}

#[cfg(test)]
mod tests {
    use super::{
        PartitionOptions, PartitionPolicy, SavedKind, ValueRole, materialization_cost, partition,
    };
    use crate::joint::{JointGraph, build_joint};
    use crate::{MutationScope, PartitionError};
    use af_core::{
        Graph, GraphBuilder, Primitive, ProgramSpec, Tensor, Value, ValueId, build_program,
    };
    use af_functionalize::{CollectOptions, functionalize};
    use af_interpreters::eval_graph;
    use proptest::prelude::*;

    fn tensor(sizes: &[usize], values: &[f64]) -> Value {
        Value::Tensor(Tensor::from_vec(sizes, values.to_vec()).expect("tensor"))
    }

    fn flat(values: &[Value]) -> Vec<Vec<f64>> {
        values.iter().map(|value| value.to_vecs().concat()).collect()
    }

    /// Gradients from the joint graph and from running forward then backward.
    fn both_ways(
        joint: &JointGraph,
        options: &PartitionOptions,
        primals: &[Value],
        tangents: &[Value],
    ) -> (Vec<Vec<f64>>, Vec<Vec<f64>>) {
        let mut joint_args = primals.to_vec();
        joint_args.extend_from_slice(tangents);
        let expected = eval_graph(&joint.graph, &joint_args).expect("joint");
        let expected = flat(&expected[joint.forward_output_count..]);

        let split = partition(joint, options).expect("partition");
        split.forward.validate_well_formed().expect("forward");
        split.backward.validate_well_formed().expect("backward");
        let forward = eval_graph(&split.forward, primals).expect("forward");
        let mut backward_args = forward[joint.forward_output_count..].to_vec();
        backward_args.extend_from_slice(tangents);
        let actual = flat(&eval_graph(&split.backward, &backward_args).expect("backward"));
        (expected, actual)
    }

    fn pure_loss_joint() -> JointGraph {
        let graph = build_program(ProgramSpec::PureLoss).expect("program");
        build_joint(&graph, &[true]).expect("joint")
    }

    fn saved_bytes(joint: &JointGraph, options: &PartitionOptions) -> u64 {
        let split = partition(joint, options).expect("partition");
        split
            .plan
            .saved
            .iter()
            .map(|saved| materialization_cost(joint.graph.meta(saved.value)))
            .sum()
    }

    #[test]
    fn default_policy_saves_sizes_not_the_reduced_tensor() {
        let joint = pure_loss_joint();
        let split = partition(&joint, &PartitionOptions::default()).expect("partition");
        assert_eq!(split.plan.saved_scalar_count(), 1);
        assert_eq!(split.plan.saved_tensor_count(), 4);
        let last = split.plan.saved.last().expect("saved");
        assert_eq!(last.kind, SavedKind::Scalar);

        let summed = joint.graph.nodes[3].outputs[0];
        assert_eq!(joint.graph.nodes[3].primitive, Primitive::Add);
        assert!(split.plan.saved.iter().all(|saved| saved.value != summed));
        assert_eq!(split.role(summed), Some(ValueRole::ConsumedOnlyInForward));
        assert_eq!(
            split.forward.outputs.len(),
            joint.forward_output_count + split.saved_count()
        );
        assert_eq!(
            split.backward.inputs.len(),
            split.saved_count() + joint.tangent_inputs().len()
        );
    }

    #[test]
    fn split_gradients_match_the_joint_graph() {
        let joint = pure_loss_joint();
        let primals = [
            tensor(&[3], &[1.0, -2.0, 3.0]),
            tensor(&[3], &[2.0, 1.0, -1.0]),
        ];
        let tangents = [Value::Tensor(Tensor::scalar(1.0))];
        for policy in [PartitionPolicy::Default, PartitionPolicy::MinCut] {
            let (expected, actual) = both_ways(
                &joint,
                &PartitionOptions::with_policy(policy),
                &primals,
                &tangents,
            );
            assert_eq!(expected, actual, "{}", policy.as_str());
        }
    }

    #[test]
    fn min_cut_recomputes_cheap_elementwise_ops() {
        let joint = pure_loss_joint();
        let options = PartitionOptions::with_policy(PartitionPolicy::MinCut);
        let split = partition(&joint, &options).expect("partition");
        let saved_tensors: Vec<ValueId> = split
            .plan
            .saved
            .iter()
            .filter(|saved| saved.kind == SavedKind::Tensor)
            .map(|saved| saved.value)
            .collect();
        assert_eq!(saved_tensors, joint.primal_inputs().to_vec());
        assert_eq!(split.plan.saved_scalar_count(), 1);
        assert!(!split.plan.recomputed.is_empty());
        let relu = joint.graph.nodes[1].outputs[0];
        assert_eq!(split.role(relu), Some(ValueRole::RecomputedInBackward));
        assert!(
            saved_bytes(&joint, &options) < saved_bytes(&joint, &PartitionOptions::default())
        );
    }

    #[test]
    fn an_empty_allowlist_makes_min_cut_save_like_default() {
        let joint = pure_loss_joint();
        let options = PartitionOptions {
            policy: PartitionPolicy::MinCut,
            recompute_allowlist: Some(Vec::new()),
        };
        assert_eq!(
            saved_bytes(&joint, &options),
            saved_bytes(&joint, &PartitionOptions::default())
        );
    }

    #[test]
    fn view_gradients_need_nothing_saved() {
        let graph = build_program(ProgramSpec::UnbindInput).expect("program");
        let joint = build_joint(&graph, &[true, true, true]).expect("joint");
        let split = partition(&joint, &PartitionOptions::default()).expect("partition");
        assert_eq!(split.saved_count(), 0);
        assert_eq!(split.backward.inputs.len(), 3);
        assert_eq!(split.backward.outputs.len(), 1);
    }

    #[test]
    fn inference_graphs_have_an_empty_backward() {
        let graph = build_program(ProgramSpec::MulThenScale).expect("program");
        let functional = functionalize(&graph, &CollectOptions::default()).expect("functionalize");
        let joint = build_joint(&functional.graph, &[true, true]).expect("joint");
        let split = partition(&joint, &PartitionOptions::default()).expect("partition");
        assert!(split.plan.is_inference());
        assert_eq!(split.forward, functional.graph);
        assert!(split.backward.inputs.is_empty() && split.backward.outputs.is_empty());
    }

    fn mutating_joint(target: impl Fn(&mut GraphBuilder, ValueId, ValueId) -> ValueId) -> JointGraph {
        let mut b = GraphBuilder::new();
        let a = b.input(&[2], true);
        let out = b.scalar(Primitive::Mul, a, 3.0).expect("mul");
        let tangent = b.input(&[2], false);
        let victim = target(&mut b, a, tangent);
        b.inplace_scalar(Primitive::MulInplace, victim, 2.0)
            .expect("mul_");
        let grad = b.scalar(Primitive::Mul, tangent, 3.0).expect("grad");
        JointGraph {
            graph: b.finish(vec![out, grad]),
            primal_count: 1,
            forward_output_count: 1,
            tangent_outputs: vec![0],
            grad_inputs: vec![0],
        }
    }

    fn scope_of(joint: &JointGraph) -> MutationScope {
        match partition(joint, &PartitionOptions::default()) {
            Err(PartitionError::BackwardMutation { scope, .. }) => scope,
            other => panic!("expected a backward mutation error, got {other:?}"),
        }
    }

    #[test]
    fn backward_mutations_are_rejected_by_scope() {
        let outside = mutating_joint(|_, _, tangent| tangent);
        assert_eq!(scope_of(&outside), MutationScope::OutsideBackward);

        let local = mutating_joint(|b, _, tangent| b.unary(Primitive::Clone, tangent).expect("clone"));
        assert_eq!(scope_of(&local), MutationScope::BackwardLocal);

        let grad_carrying =
            mutating_joint(|b, a, tangent| b.binary(Primitive::Mul, tangent, a).expect("mul"));
        assert_eq!(scope_of(&grad_carrying), MutationScope::RequiresGrad);
    }

    fn chain(ops: &[u8]) -> Graph {
        let mut b = GraphBuilder::new();
        let a = b.input(&[4], true);
        let c = b.input(&[4], true);
        let mut x = a;
        for op in ops {
            x = match op {
                0 => b.unary(Primitive::Exp, x),
                1 => b.unary(Primitive::Sin, x),
                2 => b.binary(Primitive::Mul, x, c),
                3 => b.binary(Primitive::Add, x, c),
                4 => b.unary(Primitive::Relu, x),
                5 => b.unary(Primitive::Neg, x),
                _ => b.unary(Primitive::Cos, x),
            }
            .expect("op");
        }
        let loss = b.unary(Primitive::Sum, x).expect("sum");
        b.finish(vec![loss])
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]
        #[test]
        fn both_policies_reproduce_joint_gradients(
            ops in prop::collection::vec(0_u8..7, 1..7),
            a in prop::collection::vec(-1.0_f64..1.0, 4),
            c in prop::collection::vec(-1.0_f64..1.0, 4),
        ) {
            let joint = build_joint(&chain(&ops), &[true]).expect("joint");
            let primals = [tensor(&[4], &a), tensor(&[4], &c)];
            let tangents = [Value::Tensor(Tensor::scalar(1.0))];
            for policy in [PartitionPolicy::Default, PartitionPolicy::MinCut] {
                let options = PartitionOptions::with_policy(policy);
                let (expected, actual) = both_ways(&joint, &options, &primals, &tangents);
                prop_assert_eq!(expected, actual);
            }
            let min_cut = PartitionOptions::with_policy(PartitionPolicy::MinCut);
            prop_assert!(
                saved_bytes(&joint, &min_cut) <= saved_bytes(&joint, &PartitionOptions::default())
            );
        }
    }
}
