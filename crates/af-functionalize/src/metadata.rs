//! Per-input and per-output classifications produced by the collector.
//!
//! Indices always refer to positions of the graph the metadata was collected
//! on; the pipeline driver keeps the mapping back to caller positions.

use std::collections::BTreeMap;

use af_core::{
    Atom, BuildError, GraphBuilder, Layout, LayoutError, Node, ParamError, Primitive, Tensor,
    TensorError, ValueId, as_strided_params, encode_list, param_i64, param_i64_list,
    param_usize_list, params,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    None,
    Data,
    Metadata,
    DataAndMetadata,
}

impl MutationKind {
    #[must_use]
    pub fn from_flags(data: bool, metadata: bool) -> Self {
        match (data, metadata) {
            (false, false) => Self::None,
            (true, false) => Self::Data,
            (false, true) => Self::Metadata,
            (true, true) => Self::DataAndMetadata,
        }
    }

    #[must_use]
    pub fn mutates_data(self) -> bool {
        matches!(self, Self::Data | Self::DataAndMetadata)
    }

    #[must_use]
    pub fn mutates_metadata(self) -> bool {
        matches!(self, Self::Metadata | Self::DataAndMetadata)
    }

    #[must_use]
    pub fn is_mutated(self) -> bool {
        self != Self::None
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Data => "data",
            Self::Metadata => "metadata",
            Self::DataAndMetadata => "data_and_metadata",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputInfo {
    pub mutation: MutationKind,
    /// The input ended the trace on a different storage (`set_`).
    pub mutates_storage: bool,
    pub requires_grad: bool,
    pub leaf: bool,
    pub is_subclass: bool,
    /// Data mutation kept as a trailing `copy_` in an inference graph.
    pub keep_in_graph: bool,
    /// Layout of the input when the trace ends.
    pub final_layout: Layout,
}

impl InputInfo {
    /// Whether the functional graph returns an updated value for this input.
    #[must_use]
    pub fn has_update_output(&self) -> bool {
        self.mutation.is_mutated() && !self.keep_in_graph
    }
}

/// Where the base of an intermediate alias comes from in the forward outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaseRef {
    /// The base is itself returned at this user output position.
    UserOutput(usize),
    /// The base is appended as the k-th intermediate-base output.
    ExtraOutput(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutputClassification {
    Fresh,
    AliasOfInput(usize),
    AliasOfIntermediate(BaseRef),
    AliasOfInputMultiView(usize),
}

impl OutputClassification {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::AliasOfInput(_) => "alias_of_input",
            Self::AliasOfIntermediate(_) => "alias_of_intermediate",
            Self::AliasOfInputMultiView(_) => "alias_of_input_multi_view",
        }
    }

    /// Regenerated outside the compiled graph.
    #[must_use]
    pub fn is_regenerated(self) -> bool {
        matches!(self, Self::AliasOfInput(_) | Self::AliasOfIntermediate(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputInfo {
    pub classification: OutputClassification,
    /// View steps replayed against the base to regenerate an alias. Empty for
    /// an output that is the caller's input object itself.
    pub replay: Vec<ViewStep>,
    pub requires_grad: bool,
    pub is_subclass: bool,
    pub is_symbolic: bool,
    /// Produced by a multi-result view; in-place writes before backward are errors.
    pub multi_output_view: bool,
}

impl OutputInfo {
    #[must_use]
    pub fn fresh(requires_grad: bool) -> Self {
        Self {
            classification: OutputClassification::Fresh,
            replay: Vec::new(),
            requires_grad,
            is_subclass: false,
            is_symbolic: false,
            multi_output_view: false,
        }
    }

    /// Returns the caller's input object unchanged.
    #[must_use]
    pub fn is_input_itself(&self) -> bool {
        matches!(self.classification, OutputClassification::AliasOfInput(_))
            && self.replay.is_empty()
    }
}

/// Input positions whose overlap ranges intersect, transitively.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasGroup {
    pub members: Vec<usize>,
}

/// Final state of a value the caller asked the collector to follow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedView {
    pub value: ValueId,
    pub final_layout: Layout,
    pub mutates_metadata: bool,
    pub storage_swapped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewMetadata {
    pub inputs: Vec<InputInfo>,
    pub outputs: Vec<OutputInfo>,
    pub alias_groups: Vec<AliasGroup>,
    /// Intermediate bases appended after the input updates.
    pub intermediate_base_count: usize,
    pub tracked_views: Vec<TrackedView>,
}

impl ViewMetadata {
    /// Input positions with an updated-value output, in order.
    #[must_use]
    pub fn mutated_inputs(&self) -> Vec<usize> {
        self.inputs
            .iter()
            .enumerate()
            .filter(|(_, info)| info.has_update_output())
            .map(|(index, _)| index)
            .collect()
    }

    #[must_use]
    pub fn user_output_count(&self) -> usize {
        self.outputs.len()
    }

    /// User outputs, then input updates, then intermediate bases.
    #[must_use]
    pub fn forward_output_count(&self) -> usize {
        self.outputs.len() + self.mutated_inputs().len() + self.intermediate_base_count
    }

    #[must_use]
    pub fn mutation_summary(&self) -> BTreeMap<&'static str, usize> {
        let mut out = BTreeMap::new();
        for info in &self.inputs {
            *out.entry(info.mutation.as_str()).or_insert(0) += 1;
        }
        out
    }

    #[must_use]
    pub fn has_data_mutation_in_group(&self, group: &AliasGroup) -> bool {
        group
            .members
            .iter()
            .any(|member| self.inputs[*member].mutation.mutates_data())
    }
}

/// One recorded view operation, replayable on graph values, layouts and tensors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViewStep {
    View { sizes: Vec<i64> },
    AsStrided { sizes: Vec<usize>, strides: Vec<usize>, offset: i64 },
    Slice { dim: i64, start: i64, end: i64, step: i64 },
    Select { dim: i64, index: i64 },
    Transpose { dim0: i64, dim1: i64 },
    Unsqueeze { dim: i64 },
    Alias,
    Detach,
    Unbind { dim: i64, index: usize },
}

impl ViewStep {
    /// The step a view (or in-place view) node applies to produce output `output`.
    pub fn from_node(node: &Node, output: usize) -> Result<Option<Self>, ParamError> {
        let p = &node.params;
        let step = match node.primitive {
            Primitive::View => Self::View {
                sizes: param_i64_list(p, "sizes")?,
            },
            Primitive::AsStrided => Self::AsStrided {
                sizes: param_usize_list(p, "sizes")?,
                strides: param_usize_list(p, "strides")?,
                offset: param_i64(p, "offset")?,
            },
            Primitive::Slice => Self::Slice {
                dim: param_i64(p, "dim")?,
                start: param_i64(p, "start")?,
                end: param_i64(p, "end")?,
                step: param_i64(p, "step")?,
            },
            Primitive::Select => Self::Select {
                dim: param_i64(p, "dim")?,
                index: param_i64(p, "index")?,
            },
            Primitive::Transpose | Primitive::TransposeInplace => Self::Transpose {
                dim0: param_i64(p, "dim0")?,
                dim1: param_i64(p, "dim1")?,
            },
            Primitive::Unsqueeze | Primitive::UnsqueezeInplace => Self::Unsqueeze {
                dim: param_i64(p, "dim")?,
            },
            Primitive::Alias => Self::Alias,
            Primitive::Detach => Self::Detach,
            Primitive::Unbind => Self::Unbind {
                dim: param_i64(p, "dim")?,
                index: output,
            },
            _ => return Ok(None),
        };
        Ok(Some(step))
    }

    /// Strided window relative to the layout it is applied to.
    #[must_use]
    pub fn as_strided_of(view: &Layout, base: &Layout) -> Self {
        Self::AsStrided {
            sizes: view.sizes.clone(),
            strides: view.strides.clone(),
            offset: view.offset_from(base),
        }
    }

    #[must_use]
    pub fn primitive(&self) -> Primitive {
        match self {
            Self::View { .. } => Primitive::View,
            Self::AsStrided { .. } => Primitive::AsStrided,
            Self::Slice { .. } => Primitive::Slice,
            Self::Select { .. } => Primitive::Select,
            Self::Transpose { .. } => Primitive::Transpose,
            Self::Unsqueeze { .. } => Primitive::Unsqueeze,
            Self::Alias => Primitive::Alias,
            Self::Detach => Primitive::Detach,
            Self::Unbind { .. } => Primitive::Unbind,
        }
    }

    #[must_use]
    pub fn params(&self) -> BTreeMap<String, String> {
        match self {
            Self::View { sizes } => params([("sizes", encode_list(sizes))]),
            Self::AsStrided {
                sizes,
                strides,
                offset,
            } => as_strided_params(sizes, strides, *offset),
            Self::Slice {
                dim,
                start,
                end,
                step,
            } => params([
                ("dim", dim.to_string()),
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("step", step.to_string()),
            ]),
            Self::Select { dim, index } => {
                params([("dim", dim.to_string()), ("index", index.to_string())])
            }
            Self::Transpose { dim0, dim1 } => {
                params([("dim0", dim0.to_string()), ("dim1", dim1.to_string())])
            }
            Self::Unsqueeze { dim } | Self::Unbind { dim, .. } => {
                params([("dim", dim.to_string())])
            }
            Self::Alias | Self::Detach => BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn is_multi_output(&self) -> bool {
        matches!(self, Self::Unbind { .. })
    }

    pub fn apply_layout(&self, layout: &Layout) -> Result<Layout, LayoutError> {
        match self {
            Self::View { sizes } => layout.view(sizes),
            Self::AsStrided {
                sizes,
                strides,
                offset,
            } => layout.as_strided(sizes, strides, *offset),
            Self::Slice {
                dim,
                start,
                end,
                step,
            } => layout.slice(*dim, *start, *end, *step),
            Self::Select { dim, index } => layout.select(*dim, *index),
            Self::Transpose { dim0, dim1 } => layout.transpose(*dim0, *dim1),
            Self::Unsqueeze { dim } => layout.unsqueeze(*dim),
            Self::Alias | Self::Detach => Ok(layout.clone()),
            Self::Unbind { dim, index } => layout.select(*dim, *index as i64),
        }
    }

    /// Replays the step on a runtime tensor, producing a true alias.
    pub fn apply_tensor(&self, tensor: &Tensor) -> Result<Tensor, TensorError> {
        match self {
            Self::View { sizes } => tensor.view(sizes),
            Self::AsStrided {
                sizes,
                strides,
                offset,
            } => tensor.as_strided(sizes, strides, *offset),
            Self::Slice {
                dim,
                start,
                end,
                step,
            } => tensor.slice(*dim, *start, *end, *step),
            Self::Select { dim, index } => tensor.select(*dim, *index),
            Self::Transpose { dim0, dim1 } => tensor.transpose(*dim0, *dim1),
            Self::Unsqueeze { dim } => tensor.unsqueeze(*dim),
            Self::Alias => tensor.alias(),
            Self::Detach => Ok(tensor.detach()),
            Self::Unbind { dim, index } => {
                let mut parts = tensor.unbind(*dim)?;
                if *index >= parts.len() {
                    return Err(LayoutError::IndexOutOfRange {
                        index: *index as i64,
                        size: parts.len(),
                    }
                    .into());
                }
                Ok(parts.swap_remove(*index))
            }
        }
    }

    /// Appends the step to `builder`, returning the selected output.
    pub fn emit(&self, builder: &mut GraphBuilder, input: ValueId) -> Result<ValueId, BuildError> {
        let outputs = builder.apply(self.primitive(), &[Atom::Var(input)], self.params())?;
        let index = match self {
            Self::Unbind { index, .. } => *index,
            _ => 0,
        };
        outputs.get(index).copied().ok_or(BuildError::Arity {
            primitive: self.primitive().as_str(),
            expected: index + 1,
            actual: outputs.len(),
        })
    }
}

/// Replays `steps` on a runtime tensor.
pub fn replay_on_tensor(base: &Tensor, steps: &[ViewStep]) -> Result<Tensor, TensorError> {
    let mut current = base.clone();
    for step in steps {
        current = step.apply_tensor(&current)?;
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::{MutationKind, ViewStep, replay_on_tensor};
    use af_core::{GraphBuilder, Layout, Primitive, Tensor};

    #[test]
    fn mutation_kind_flags() {
        assert_eq!(MutationKind::from_flags(true, true), MutationKind::DataAndMetadata);
        assert!(MutationKind::Metadata.mutates_metadata());
        assert!(!MutationKind::Metadata.mutates_data());
        assert!(!MutationKind::None.is_mutated());
    }

    #[test]
    fn steps_round_trip_through_nodes() {
        let mut b = GraphBuilder::new();
        let a = b.input(&[2, 3], false);
        let sliced = b.slice(a, 1, 1, 3).expect("slice");
        let node = b.nodes().last().expect("node").clone();
        let step = ViewStep::from_node(&node, 0).expect("params").expect("view");
        assert_eq!(step.params(), node.params);
        let layout = step
            .apply_layout(&Layout::contiguous(&[2, 3]))
            .expect("layout");
        assert_eq!(layout, b.tensor(sliced).expect("meta").layout);
    }

    #[test]
    fn unbind_step_selects_one_output() {
        let mut b = GraphBuilder::new();
        let a = b.input(&[3, 2], false);
        let step = ViewStep::Unbind { dim: 0, index: 2 };
        let picked = step.emit(&mut b, a).expect("emit");
        let meta = b.tensor(picked).expect("meta");
        assert_eq!(meta.layout.storage_offset, 4);
        assert_eq!(b.nodes()[0].primitive, Primitive::Unbind);
    }

    #[test]
    fn tensor_replay_aliases_the_base() {
        let base = Tensor::from_vec(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]).expect("tensor");
        let view = replay_on_tensor(
            &base,
            &[ViewStep::Transpose { dim0: 0, dim1: 1 }, ViewStep::Select { dim: 0, index: 1 }],
        )
        .expect("replay");
        assert_eq!(view.to_vec(), vec![2.0, 4.0]);
        assert_eq!(view.storage_id(), base.storage_id());
    }
}
