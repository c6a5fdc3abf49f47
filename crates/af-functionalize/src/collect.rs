//! Metadata collection: mutation kinds per input, alias classification per
//! output, and alias groups over the inputs.

use af_core::{DEFAULT_OVERLAP_ENUMERATION_LIMIT, Graph, Layout, TensorValue, ValueId};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::CollectError;
use crate::metadata::{
    AliasGroup, BaseRef, InputInfo, MutationKind, OutputClassification, OutputInfo, TrackedView,
    ViewMetadata, ViewStep,
};
use crate::tracker::Tracker;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectOptions {
    /// Keep data-only mutations of inputs as trailing `copy_` nodes when no
    /// input requires grad.
    pub keep_inference_input_mutations: bool,
    pub overlap_enumeration_limit: usize,
    /// Values whose final layout and storage the caller wants reported.
    pub tracked_views: Vec<ValueId>,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            keep_inference_input_mutations: false,
            overlap_enumeration_limit: DEFAULT_OVERLAP_ENUMERATION_LIMIT,
            tracked_views: Vec::new(),
        }
    }
}

/// Metadata plus the storages whose bases are appended as extra outputs.
#[derive(Debug)]
pub(crate) struct Analysis {
    pub metadata: ViewMetadata,
    pub base_storages: Vec<usize>,
}

pub fn collect(graph: &Graph, options: &CollectOptions) -> Result<ViewMetadata, CollectError> {
    let tracker = Tracker::run(graph)?;
    Ok(analyze(graph, &tracker, options)?.metadata)
}

pub(crate) fn analyze(
    graph: &Graph,
    tracker: &Tracker,
    options: &CollectOptions,
) -> Result<Analysis, CollectError> {
    let inference = !graph
        .input_tensors()
        .iter()
        .flatten()
        .any(|tensor| tensor.requires_grad);
    let keep = options.keep_inference_input_mutations && inference;

    let mut inputs = Vec::with_capacity(graph.inputs.len());
    for (position, id) in graph.inputs.iter().enumerate() {
        let info = match (tracker.input_objects[position], graph.tensor(*id)) {
            (Some(object), Some(tensor)) => input_info(tracker, position, object, tensor, keep)?,
            _ => symbolic_input(),
        };
        inputs.push(info);
    }

    let (outputs, base_storages) = classify_outputs(graph, tracker, &inputs)?;
    let alias_groups = alias_groups(graph, options.overlap_enumeration_limit);

    let mut tracked_views = Vec::with_capacity(options.tracked_views.len());
    for value in &options.tracked_views {
        let object = tracker
            .object_of(*value)
            .ok_or(CollectError::UnknownValue(*value))?;
        let tracked = &tracker.objects[object];
        tracked_views.push(TrackedView {
            value: *value,
            final_layout: tracked.layout.clone(),
            mutates_metadata: tracked.layout != tracked.origin_layout,
            storage_swapped: tracked.storage != tracked.origin_storage,
        });
    }

    let metadata = ViewMetadata {
        inputs,
        outputs,
        alias_groups,
        intermediate_base_count: base_storages.len(),
        tracked_views,
    };
    tracing::debug!(
        inputs = metadata.inputs.len(),
        mutated = metadata.mutated_inputs().len(),
        outputs = metadata.outputs.len(),
        alias_groups = metadata.alias_groups.len(),
        intermediate_bases = metadata.intermediate_base_count,
        "collected view metadata"
    );
    Ok(Analysis {
        metadata,
        base_storages,
    })
}

fn symbolic_input() -> InputInfo {
    InputInfo {
        mutation: MutationKind::None,
        mutates_storage: false,
        requires_grad: false,
        leaf: true,
        is_subclass: false,
        keep_in_graph: false,
        final_layout: Layout::contiguous(&[]),
    }
}

fn input_info(
    tracker: &Tracker,
    position: usize,
    object: usize,
    tensor: &TensorValue,
    keep: bool,
) -> Result<InputInfo, CollectError> {
    let tracked = &tracker.objects[object];
    let origin = tracked.origin_storage;
    let (mutation, mutates_storage) = if tracked.storage != origin {
        if tracker.storages[origin].data_mutated {
            return Err(CollectError::DataMutationBeforeStorageSwap { input: position });
        }
        (MutationKind::Metadata, true)
    } else {
        (
            MutationKind::from_flags(
                tracker.storages[origin].data_mutated,
                tracked.layout != tensor.layout,
            ),
            false,
        )
    };
    Ok(InputInfo {
        mutation,
        mutates_storage,
        requires_grad: tensor.requires_grad,
        leaf: tensor.leaf,
        is_subclass: tensor.is_subclass(),
        keep_in_graph: keep
            && mutation == MutationKind::Data
            && !tensor.requires_grad
            && !tensor.is_subclass(),
        final_layout: tracked.layout.clone(),
    })
}

fn ends_in_multi_output_view(tracker: &Tracker, object: usize) -> bool {
    tracker.objects[object]
        .chain
        .last()
        .is_some_and(ViewStep::is_multi_output)
}

fn classify_outputs(
    graph: &Graph,
    tracker: &Tracker,
    inputs: &[InputInfo],
) -> Result<(Vec<OutputInfo>, Vec<usize>), CollectError> {
    let objects: Vec<Option<usize>> = graph
        .outputs
        .iter()
        .map(|id| {
            if graph.tensor(*id).is_some() {
                tracker
                    .object_of(*id)
                    .map(Some)
                    .ok_or(CollectError::UnknownValue(*id))
            } else {
                Ok(None)
            }
        })
        .collect::<Result<_, _>>()?;

    // (outputs on the storage, of which multi-output views)
    let mut per_storage: FxHashMap<usize, (usize, usize)> = FxHashMap::default();
    for object in objects.iter().flatten() {
        let entry = per_storage
            .entry(tracker.objects[*object].storage)
            .or_default();
        entry.0 += 1;
        if ends_in_multi_output_view(tracker, *object) {
            entry.1 += 1;
        }
    }

    let mut base_storages: Vec<usize> = Vec::new();
    let mut outputs = Vec::with_capacity(objects.len());
    for object in &objects {
        let Some(object) = *object else {
            outputs.push(OutputInfo {
                is_symbolic: true,
                ..OutputInfo::fresh(false)
            });
            continue;
        };
        let tracked = &tracker.objects[object];
        let storage = &tracker.storages[tracked.storage];
        let (total, multi) = per_storage
            .get(&tracked.storage)
            .copied()
            .unwrap_or((1, 0));
        let multi_output_view = ends_in_multi_output_view(tracker, object);
        let mut info = OutputInfo {
            is_subclass: tracked.is_subclass,
            ..OutputInfo::fresh(tracked.requires_grad)
        };

        if let Some(input) = tracker
            .input_objects
            .iter()
            .position(|candidate| *candidate == Some(object))
        {
            info.classification = OutputClassification::AliasOfInput(input);
        } else if let Some(input) = storage.input {
            let input_info = &inputs[input];
            if input_info.mutates_storage {
                // the input left this storage; the output owns what remains
            } else if tracked.requires_grad && total == multi {
                info.classification = OutputClassification::AliasOfInputMultiView(input);
                info.multi_output_view = true;
            } else {
                info.classification = OutputClassification::AliasOfInput(input);
                info.replay = if input_info.mutation.mutates_metadata() {
                    vec![ViewStep::as_strided_of(&tracked.layout, &input_info.final_layout)]
                } else if tracked.chain.is_empty() {
                    vec![ViewStep::Alias]
                } else {
                    tracked.chain.clone()
                };
            }
        } else if tracked.chain.is_empty()
            || !storage.root_requires_grad
            || !tracked.requires_grad
        {
            info.multi_output_view = multi_output_view;
        } else if total == 1 || total - multi <= 1 {
            info.multi_output_view = multi_output_view;
        } else {
            let root = storage.root_object;
            let base = match objects.iter().position(|candidate| {
                *candidate == Some(root) && tracker.objects[root].chain.is_empty()
            }) {
                Some(position) => BaseRef::UserOutput(position),
                None => {
                    let index = match base_storages.iter().position(|s| *s == tracked.storage) {
                        Some(index) => index,
                        None => {
                            base_storages.push(tracked.storage);
                            base_storages.len() - 1
                        }
                    };
                    BaseRef::ExtraOutput(index)
                }
            };
            info.classification = OutputClassification::AliasOfIntermediate(base);
            info.replay = tracked.chain.clone();
        }
        outputs.push(info);
    }
    Ok((outputs, base_storages))
}

/// Groups of inputs whose overlap ranges intersect, closed transitively.
/// Equal storage ids alone never group two inputs.
#[must_use]
pub fn alias_groups(graph: &Graph, enumeration_limit: usize) -> Vec<AliasGroup> {
    let tensors = graph.input_tensors();
    let mut parent: Vec<usize> = (0..tensors.len()).collect();
    fn find(parent: &mut [usize], mut index: usize) -> usize {
        while parent[index] != index {
            parent[index] = parent[parent[index]];
            index = parent[index];
        }
        index
    }
    for i in 0..tensors.len() {
        for j in (i + 1)..tensors.len() {
            let (Some(a), Some(b)) = (tensors[i], tensors[j]) else {
                continue;
            };
            if a.is_subclass() || b.is_subclass() {
                let shared = a
                    .subclass
                    .iter()
                    .flat_map(|s| &s.components)
                    .any(|c| {
                        b.subclass
                            .iter()
                            .flat_map(|s| &s.components)
                            .any(|d| c.storage == d.storage)
                    });
                if !shared {
                    continue;
                }
            } else if !a.aliases(b, enumeration_limit) {
                continue;
            }
            let (root_a, root_b) = (find(&mut parent, i), find(&mut parent, j));
            if root_a != root_b {
                parent[root_b.max(root_a)] = root_a.min(root_b);
            }
        }
    }
    let mut groups: Vec<AliasGroup> = Vec::new();
    let mut group_of: FxHashMap<usize, usize> = FxHashMap::default();
    for index in 0..tensors.len() {
        if tensors[index].is_none() {
            continue;
        }
        let root = find(&mut parent, index);
        match group_of.get(&root) {
            Some(group) => groups[*group].members.push(index),
            None => {
                group_of.insert(root, groups.len());
                groups.push(AliasGroup {
                    members: vec![index],
                });
            }
        }
    }
    groups.retain(|group| group.members.len() > 1);
    groups
}
