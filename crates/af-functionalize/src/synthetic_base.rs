//! Synthetic bases: one graph input standing for the union storage of a group
//! of aliased inputs, at least one of them data-mutated.
//!
//! Members are regenerated inside the graph as `as_strided` views of the base,
//! so functionalization sees one storage and propagates every mutation to the
//! other members in program order.

use std::collections::BTreeMap;

use af_core::{
    DType, Graph, GraphBuilder, Layout, StorageId, TensorValue, ValueId, ValueMeta, remap_values,
};
use serde::{Deserialize, Serialize};

use crate::SyntheticBaseError;
use crate::metadata::ViewMetadata;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticMember {
    /// Position in the graph given to the builder.
    pub input: usize,
    /// Layout in storage coordinates.
    pub layout: Layout,
    /// The member's view of the base in the rewritten graph.
    pub value: ValueId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticBaseGroup {
    pub members: Vec<SyntheticMember>,
    pub storage: StorageId,
    pub dtype: DType,
    /// First storage element covered by any member.
    pub start: usize,
    pub len: usize,
    pub requires_grad: bool,
}

impl SyntheticBaseGroup {
    /// One-dimensional window over every element a member can address.
    #[must_use]
    pub fn base_layout(&self) -> Layout {
        Layout {
            sizes: vec![self.len],
            strides: vec![1],
            storage_offset: self.start,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InputSource {
    Original(usize),
    Base(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticBasePlan {
    pub groups: Vec<SyntheticBaseGroup>,
    /// What each input of the rewritten graph is built from.
    pub sources: Vec<InputSource>,
}

impl SyntheticBasePlan {
    /// Member views, group by group, for `CollectOptions::tracked_views`.
    #[must_use]
    pub fn tracked_views(&self) -> Vec<ValueId> {
        self.groups
            .iter()
            .flat_map(|group| group.members.iter().map(|member| member.value))
            .collect()
    }

    /// Position of an original input in the rewritten graph, if it was kept.
    #[must_use]
    pub fn rewritten_position(&self, input: usize) -> Option<usize> {
        self.sources
            .iter()
            .position(|source| *source == InputSource::Original(input))
    }

    /// Rejects members that end the trace on another storage; `metadata` must
    /// have been collected with `tracked_views()`.
    pub fn check_mutations(&self, metadata: &ViewMetadata) -> Result<(), SyntheticBaseError> {
        let members = self.groups.iter().flat_map(|group| &group.members);
        for (member, tracked) in members.zip(&metadata.tracked_views) {
            if tracked.storage_swapped {
                return Err(SyntheticBaseError::StorageSwap {
                    input: member.input,
                });
            }
        }
        Ok(())
    }
}

/// Collects alias groups, then validates and rewrites the graph in one commit.
#[derive(Debug)]
pub struct SyntheticBaseBuilder<'g> {
    graph: &'g Graph,
    groups: Vec<Vec<usize>>,
}

impl<'g> SyntheticBaseBuilder<'g> {
    #[must_use]
    pub fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            groups: Vec::new(),
        }
    }

    /// Every alias group of `metadata` with a data-mutated member.
    #[must_use]
    pub fn from_metadata(graph: &'g Graph, metadata: &ViewMetadata) -> Self {
        let mut builder = Self::new(graph);
        for group in &metadata.alias_groups {
            if metadata.has_data_mutation_in_group(group) {
                builder.add_group(group.members.clone());
            }
        }
        builder
    }

    pub fn add_group(&mut self, members: Vec<usize>) -> &mut Self {
        self.groups.push(members);
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn validate_group(
        &self,
        members: &[usize],
    ) -> Result<(SyntheticBaseGroup, Vec<ValueId>), SyntheticBaseError> {
        let len = self.graph.inputs.len();
        let mut tensors: Vec<(usize, ValueId, &TensorValue)> = Vec::with_capacity(members.len());
        for input in members {
            let id = *self
                .graph
                .inputs
                .get(*input)
                .ok_or(SyntheticBaseError::UnknownInput { input: *input, len })?;
            let tensor = self.graph.tensor(id).ok_or_else(|| {
                SyntheticBaseError::Undecomposable {
                    inputs: members.to_vec(),
                    reason: format!("input {input} is not a tensor"),
                }
            })?;
            tensors.push((*input, id, tensor));
        }
        if tensors.iter().any(|(_, _, tensor)| tensor.is_subclass()) {
            return Err(SyntheticBaseError::AliasedSubclassMutation {
                inputs: members.to_vec(),
            });
        }
        let undecomposable = |reason: &str| SyntheticBaseError::Undecomposable {
            inputs: members.to_vec(),
            reason: reason.to_owned(),
        };
        let (_, _, first) = tensors.first().ok_or_else(|| undecomposable("empty group"))?;
        if tensors
            .iter()
            .any(|(_, _, tensor)| tensor.storage != first.storage)
        {
            return Err(undecomposable("members live in different storages"));
        }
        if tensors.iter().any(|(_, _, tensor)| tensor.dtype != first.dtype) {
            return Err(undecomposable("members disagree on dtype"));
        }
        let start = tensors
            .iter()
            .map(|(_, _, tensor)| tensor.layout.storage_offset)
            .min()
            .ok_or_else(|| undecomposable("empty group"))?;
        let end = tensors
            .iter()
            .filter_map(|(_, _, tensor)| tensor.layout.max_offset())
            .max()
            .ok_or_else(|| undecomposable("every member is empty"))?;
        let group = SyntheticBaseGroup {
            members: tensors
                .iter()
                .map(|(input, id, tensor)| SyntheticMember {
                    input: *input,
                    layout: tensor.layout.clone(),
                    value: *id,
                })
                .collect(),
            storage: first.storage,
            dtype: first.dtype,
            start,
            len: end - start + 1,
            requires_grad: tensors.iter().any(|(_, _, tensor)| tensor.requires_grad),
        };
        let ids = tensors.iter().map(|(_, id, _)| *id).collect();
        Ok((group, ids))
    }

    /// Validates every group and rewrites the graph: bases first, then the
    /// remaining inputs in order. `None` when there is nothing to merge.
    pub fn commit(self) -> Result<Option<(Graph, SyntheticBasePlan)>, SyntheticBaseError> {
        if self.groups.is_empty() {
            return Ok(None);
        }
        let mut claimed = vec![false; self.graph.inputs.len()];
        let mut validated = Vec::with_capacity(self.groups.len());
        for members in &self.groups {
            for input in members {
                match claimed.get_mut(*input) {
                    Some(slot) if *slot => {
                        return Err(SyntheticBaseError::OverlappingGroups { input: *input });
                    }
                    Some(slot) => *slot = true,
                    None => {
                        return Err(SyntheticBaseError::UnknownInput {
                            input: *input,
                            len: self.graph.inputs.len(),
                        });
                    }
                }
            }
            validated.push(self.validate_group(members)?);
        }

        let mut builder = GraphBuilder::new();
        let mut remap = BTreeMap::new();
        let mut sources = Vec::with_capacity(self.graph.inputs.len());
        let mut bases = Vec::with_capacity(validated.len());
        for (index, (group, _)) in validated.iter().enumerate() {
            let base = builder.input_meta(ValueMeta::Tensor(TensorValue {
                dtype: group.dtype,
                layout: group.base_layout(),
                storage: group.storage,
                requires_grad: group.requires_grad,
                leaf: !group.requires_grad,
                subclass: None,
            }));
            bases.push(base);
            sources.push(InputSource::Base(index));
        }
        for (position, id) in self.graph.inputs.iter().enumerate() {
            if claimed[position] {
                continue;
            }
            let meta = self
                .graph
                .meta(*id)
                .ok_or(af_core::BuildError::UnknownValue(*id))?
                .clone();
            remap.insert(*id, builder.input_meta(meta));
            sources.push(InputSource::Original(position));
        }

        let mut groups = Vec::with_capacity(validated.len());
        for ((mut group, ids), base) in validated.into_iter().zip(bases) {
            let base_layout = group.base_layout();
            for (member, old) in group.members.iter_mut().zip(ids) {
                let view = builder.as_strided(
                    base,
                    &member.layout.sizes,
                    &member.layout.strides,
                    member.layout.offset_from(&base_layout),
                )?;
                remap.insert(old, view);
                member.value = view;
            }
            groups.push(group);
        }
        builder.replay_nodes(&self.graph.nodes, &mut remap)?;
        let outputs = remap_values(&self.graph.outputs, &remap)?;
        tracing::debug!(
            groups = groups.len(),
            inputs_before = self.graph.inputs.len(),
            inputs_after = sources.len(),
            "built synthetic bases"
        );
        Ok(Some((builder.finish(outputs), SyntheticBasePlan { groups, sources })))
    }
}
