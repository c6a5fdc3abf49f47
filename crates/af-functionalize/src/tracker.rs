//! Storage-level alias tracking over a traced graph.
//!
//! Every input and every fresh allocation owns a functional storage holding the
//! latest pure value of its whole buffer (`base`). Graph values are grouped into
//! objects: a mutation's result is the same object as its target, a view is a
//! new object on its source's storage with one more recorded step. Reading an
//! object whose storage moved on since it was last materialized replays its
//! step chain against the latest base.

use std::collections::BTreeMap;

use af_core::{
    Atom, BuildError, Graph, GraphBuilder, Layout, MutationClass, Node, Primitive, TensorValue,
    ValueId, as_strided_params,
};
use rustc_hash::FxHashMap;

use crate::CollectError;
use crate::metadata::ViewStep;

#[derive(Debug, Clone)]
pub(crate) struct FunctionalStorage {
    /// Layout of the object that created the storage, in traced coordinates.
    pub root: Layout,
    pub root_requires_grad: bool,
    /// Latest pure value holding the whole buffer, in root geometry.
    pub base: ValueId,
    pub generation: u32,
    /// Swapped away from by `set_`; further data mutation is untracked.
    pub frozen: bool,
    pub data_mutated: bool,
    pub input: Option<usize>,
    pub root_object: usize,
}

#[derive(Debug, Clone)]
pub(crate) struct TrackedObject {
    pub storage: usize,
    /// Steps from the storage root to this object.
    pub chain: Vec<ViewStep>,
    pub layout: Layout,
    pub current: ValueId,
    /// Storage generation `current` was materialized at.
    pub generation: u32,
    pub requires_grad: bool,
    pub is_subclass: bool,
    pub origin_storage: usize,
    pub origin_layout: Layout,
}

#[derive(Debug)]
pub(crate) struct Tracker {
    pub builder: GraphBuilder,
    pub storages: Vec<FunctionalStorage>,
    pub objects: Vec<TrackedObject>,
    object_of: FxHashMap<ValueId, usize>,
    symbols: FxHashMap<ValueId, ValueId>,
    /// New-graph id of each input.
    pub inputs: Vec<ValueId>,
    pub input_objects: Vec<Option<usize>>,
    pub input_storages: Vec<Option<usize>>,
    input_leaf_requires_grad: Vec<bool>,
}

fn first_var(node: &Node, position: usize) -> Result<ValueId, CollectError> {
    node.inputs
        .get(position)
        .and_then(|atom| atom.var())
        .ok_or(CollectError::Build(BuildError::ExpectedTensor {
            primitive: node.primitive.as_str(),
            position,
        }))
}

fn first_output(node: &Node) -> Result<ValueId, CollectError> {
    node.outputs.first().copied().ok_or(CollectError::Build(BuildError::Arity {
        primitive: node.primitive.as_str(),
        expected: 1,
        actual: 0,
    }))
}

impl Tracker {
    pub fn run(graph: &Graph) -> Result<Self, CollectError> {
        let mut tracker = Self {
            builder: GraphBuilder::new(),
            storages: Vec::new(),
            objects: Vec::new(),
            object_of: FxHashMap::default(),
            symbols: FxHashMap::default(),
            inputs: Vec::with_capacity(graph.inputs.len()),
            input_objects: Vec::with_capacity(graph.inputs.len()),
            input_storages: Vec::with_capacity(graph.inputs.len()),
            input_leaf_requires_grad: Vec::with_capacity(graph.inputs.len()),
        };
        for (position, id) in graph.inputs.iter().enumerate() {
            let meta = graph.meta(*id).ok_or(CollectError::UnknownValue(*id))?.clone();
            let tensor = meta.as_tensor().cloned();
            let new_id = tracker.builder.input_meta(meta);
            tracker.inputs.push(new_id);
            match tensor {
                Some(tensor) => {
                    let object = tracker.new_storage(&tensor, new_id, Some(position));
                    tracker.object_of.insert(*id, object);
                    tracker.input_objects.push(Some(object));
                    tracker.input_storages.push(Some(tracker.objects[object].storage));
                    tracker
                        .input_leaf_requires_grad
                        .push(tensor.leaf && tensor.requires_grad);
                }
                None => {
                    tracker.symbols.insert(*id, new_id);
                    tracker.input_objects.push(None);
                    tracker.input_storages.push(None);
                    tracker.input_leaf_requires_grad.push(false);
                }
            }
        }
        for (node_index, node) in graph.nodes.iter().enumerate() {
            tracing::trace!(node_index, primitive = node.primitive.as_str(), "functionalize node");
            match node.primitive.mutation_class() {
                Some(MutationClass::Data) => tracker.data_mutation(graph, node_index, node)?,
                Some(MutationClass::Metadata) => tracker.metadata_mutation(graph, node_index, node)?,
                Some(MutationClass::Storage) => tracker.storage_swap(node_index, node)?,
                None if node.primitive.is_view() => tracker.view(graph, node)?,
                None => tracker.pure(graph, node)?,
            }
        }
        Ok(tracker)
    }

    /// Creates a storage rooted at a fresh object; returns the object.
    fn new_storage(&mut self, tensor: &TensorValue, value: ValueId, input: Option<usize>) -> usize {
        let storage = self.storages.len();
        let object = self.objects.len();
        self.storages.push(FunctionalStorage {
            root: tensor.layout.clone(),
            root_requires_grad: tensor.requires_grad,
            base: value,
            generation: 1,
            frozen: false,
            data_mutated: false,
            input,
            root_object: object,
        });
        self.objects.push(TrackedObject {
            storage,
            chain: Vec::new(),
            layout: tensor.layout.clone(),
            current: value,
            generation: 1,
            requires_grad: tensor.requires_grad,
            is_subclass: tensor.is_subclass(),
            origin_storage: storage,
            origin_layout: tensor.layout.clone(),
        });
        object
    }

    pub fn object_of(&self, id: ValueId) -> Option<usize> {
        self.object_of.get(&id).copied()
    }

    fn object(&self, id: ValueId) -> Result<usize, CollectError> {
        self.object_of(id).ok_or(CollectError::UnknownValue(id))
    }

    /// Latest value of `object`, replaying its chain if its storage moved on.
    pub fn current(&mut self, object: usize) -> Result<ValueId, CollectError> {
        let (storage, generation, cached) = {
            let tracked = &self.objects[object];
            (tracked.storage, tracked.generation, tracked.current)
        };
        let (base, latest) = {
            let functional = &self.storages[storage];
            (functional.base, functional.generation)
        };
        if generation == latest {
            return Ok(cached);
        }
        let chain = self.objects[object].chain.clone();
        let mut value = base;
        for step in &chain {
            value = step.emit(&mut self.builder, value)?;
        }
        let tracked = &mut self.objects[object];
        tracked.current = value;
        tracked.generation = latest;
        Ok(value)
    }

    /// New-graph value for a traced value: tensors through their object, symbols by rename.
    pub fn read(&mut self, id: ValueId) -> Result<ValueId, CollectError> {
        match self.object_of(id) {
            Some(object) => self.current(object),
            None => self
                .symbols
                .get(&id)
                .copied()
                .ok_or(CollectError::UnknownValue(id)),
        }
    }

    fn atoms(&mut self, node: &Node) -> Result<Vec<Atom>, CollectError> {
        node.inputs
            .iter()
            .map(|atom| match atom {
                Atom::Var(id) => self.read(*id).map(Atom::Var),
                Atom::Lit(literal) => Ok(Atom::Lit(*literal)),
            })
            .collect()
    }

    fn pure(&mut self, graph: &Graph, node: &Node) -> Result<(), CollectError> {
        let atoms = self.atoms(node)?;
        let outputs = self
            .builder
            .apply(node.primitive, &atoms, node.params.clone())?;
        for (old, new) in node.outputs.iter().zip(outputs) {
            match graph.tensor(*old) {
                Some(tensor) => {
                    let object = self.new_storage(tensor, new, None);
                    self.object_of.insert(*old, object);
                }
                None => {
                    self.symbols.insert(*old, new);
                }
            }
        }
        Ok(())
    }

    fn view(&mut self, graph: &Graph, node: &Node) -> Result<(), CollectError> {
        let source = self.object(first_var(node, 0)?)?;
        let atoms = self.atoms(node)?;
        let outputs = self
            .builder
            .apply(node.primitive, &atoms, node.params.clone())?;
        let storage = self.objects[source].storage;
        let generation = self.storages[storage].generation;
        for (index, (old, new)) in node.outputs.iter().zip(outputs).enumerate() {
            let tensor = graph.tensor(*old).ok_or(CollectError::UnknownValue(*old))?;
            let step = ViewStep::from_node(node, index)
                .map_err(BuildError::from)?
                .ok_or(CollectError::UnknownValue(*old))?;
            let mut chain = self.objects[source].chain.clone();
            chain.push(step);
            self.object_of.insert(*old, self.objects.len());
            self.objects.push(TrackedObject {
                storage,
                chain,
                layout: tensor.layout.clone(),
                current: new,
                generation,
                requires_grad: tensor.requires_grad,
                is_subclass: tensor.is_subclass(),
                origin_storage: storage,
                origin_layout: tensor.layout.clone(),
            });
        }
        Ok(())
    }

    fn data_mutation(
        &mut self,
        graph: &Graph,
        node_index: usize,
        node: &Node,
    ) -> Result<(), CollectError> {
        let primitive = node.primitive.as_str();
        let target = self.object(first_var(node, 0)?)?;
        let storage = self.objects[target].storage;
        if self.storages[storage].frozen {
            return Err(CollectError::MutationOfFrozenStorage {
                node_index,
                primitive,
            });
        }
        if self.objects[target].is_subclass && !self.objects[target].layout.is_contiguous() {
            return Err(CollectError::NonContiguousSubclassMutation {
                node_index,
                primitive,
            });
        }
        if let Some(input) = self.storages[storage].input
            && self.objects[target].requires_grad
            && self.input_leaf_requires_grad[input]
        {
            return Err(CollectError::LeafInplace {
                node_index,
                primitive,
                input,
            });
        }

        let functional = node
            .primitive
            .functional_counterpart()
            .ok_or(CollectError::UnknownValue(first_output(node)?))?;
        let atoms = self.atoms(node)?;
        let updated = self
            .builder
            .apply1(functional, &atoms, node.params.clone())?;

        let direct = self.objects[target].chain.is_empty() && self.storages[storage].root.is_contiguous();
        let new_base = if direct {
            updated
        } else {
            let layout = &self.objects[target].layout;
            let params = as_strided_params(
                &layout.sizes,
                &layout.strides,
                layout.offset_from(&self.storages[storage].root),
            );
            self.builder.apply1(
                Primitive::AsStridedScatter,
                &[Atom::Var(self.storages[storage].base), Atom::Var(updated)],
                params,
            )?
        };

        let functional_storage = &mut self.storages[storage];
        functional_storage.base = new_base;
        functional_storage.generation += 1;
        functional_storage.data_mutated = true;
        if direct {
            let generation = functional_storage.generation;
            let tracked = &mut self.objects[target];
            tracked.current = updated;
            tracked.generation = generation;
        }
        for old in &node.outputs {
            graph.tensor(*old).ok_or(CollectError::UnknownValue(*old))?;
            self.object_of.insert(*old, target);
        }
        Ok(())
    }

    fn metadata_mutation(
        &mut self,
        graph: &Graph,
        node_index: usize,
        node: &Node,
    ) -> Result<(), CollectError> {
        let primitive = node.primitive.as_str();
        let target = self.object(first_var(node, 0)?)?;
        if self.objects[target].is_subclass {
            return Err(CollectError::SubclassMetadataMutation {
                node_index,
                primitive,
            });
        }
        let functional = node
            .primitive
            .functional_counterpart()
            .ok_or(CollectError::UnknownValue(first_output(node)?))?;
        let atoms = self.atoms(node)?;
        let restrided = self
            .builder
            .apply1(functional, &atoms, node.params.clone())?;
        let out = first_output(node)?;
        let step = ViewStep::from_node(node, 0)
            .map_err(BuildError::from)?
            .ok_or(CollectError::UnknownValue(out))?;
        let layout = graph
            .tensor(out)
            .ok_or(CollectError::UnknownValue(out))?
            .layout
            .clone();
        let generation = self.storages[self.objects[target].storage].generation;
        let tracked = &mut self.objects[target];
        tracked.chain.push(step);
        tracked.layout = layout;
        tracked.current = restrided;
        tracked.generation = generation;
        self.object_of.insert(out, target);
        Ok(())
    }

    /// `set_`: the target adopts the source's storage; a storage whose root
    /// object moved away is frozen until it comes back.
    fn storage_swap(&mut self, node_index: usize, node: &Node) -> Result<(), CollectError> {
        let primitive = node.primitive.as_str();
        let target = self.object(first_var(node, 0)?)?;
        let source = self.object(first_var(node, 1)?)?;
        if self.objects[target].is_subclass {
            return Err(CollectError::SubclassMetadataMutation {
                node_index,
                primitive,
            });
        }
        let source_value = self.current(source)?;
        let aliased = self
            .builder
            .apply1(Primitive::Alias, &[Atom::Var(source_value)], BTreeMap::new())?;

        let old_storage = self.objects[target].storage;
        let new_storage = self.objects[source].storage;
        let (chain, layout) = {
            let tracked = &self.objects[source];
            (tracked.chain.clone(), tracked.layout.clone())
        };
        let generation = self.storages[new_storage].generation;
        let tracked = &mut self.objects[target];
        tracked.storage = new_storage;
        tracked.chain = chain;
        tracked.layout = layout;
        tracked.current = aliased;
        tracked.generation = generation;

        if old_storage != new_storage {
            let owner = self.storages[old_storage].root_object;
            if self.objects[owner].storage != old_storage {
                self.storages[old_storage].frozen = true;
            }
            if self.storages[new_storage].root_object == target {
                self.storages[new_storage].frozen = false;
            }
        }
        for old in &node.outputs {
            self.object_of.insert(*old, target);
        }
        Ok(())
    }
}
