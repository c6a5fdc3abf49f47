//! The runtime reconstructor.
//!
//! A compiled forward graph is pure: it returns updated input values instead
//! of writing them, and returns aliases as fresh values. `CompiledFunction`
//! restores what the traced program did to the caller's objects:
//!
//! 1. check guards, drop duplicate arguments, build synthetic bases,
//!    flatten subclasses;
//! 2. run the compiled forward on autograd-free handles;
//! 3. write every updated input back into the caller's object;
//! 4. attach one backward record to the differentiable outputs, and to
//!    caller tensors whose updated value carries a tangent;
//! 5. regenerate aliased outputs by replaying their view steps on the
//!    already-updated base;
//! 6. hand back logical (unflattened) outputs.

use std::sync::Arc;

use af_core::{AutogradNode, CreationMeta, GradFn, Tensor, TensorError, Value};
use af_functionalize::{
    BaseRef, DedupePlan, InputInfo, InputSource, OutputClassification, SlotLayout,
    SubclassLayout, SyntheticBaseGroup, SyntheticBasePlan, ViewMetadata, ViewStep,
    replay_on_tensor,
};
use af_partition::PartitionPlan;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::RuntimeError;
use crate::autograd::CompiledFunctionNode;
use crate::backend::CompiledGraph;
use crate::guards::InputGuards;

/// Everything the reconstructor needs besides the compiled graphs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeMetadata {
    pub guards: InputGuards,
    pub dedupe: DedupePlan,
    pub synthetic_base: Option<SyntheticBasePlan>,
    /// Collected on the graph after deduplication and synthetic bases.
    pub view: ViewMetadata,
    pub subclass: SubclassLayout,
    pub partition: PartitionPlan,
    /// Sizes of the backward graph's tangent inputs.
    pub tangent_sizes: Vec<Vec<usize>>,
}

impl RuntimeMetadata {
    fn user_output_count(&self) -> usize {
        self.view.user_output_count()
    }

    fn extra_output_start(&self) -> usize {
        self.view.user_output_count() + self.view.mutated_inputs().len()
    }
}

/// One graph argument, with the caller position it came from.
struct Argument {
    value: Value,
    caller: Option<usize>,
}

/// A caller tensor whose data was overwritten with a differentiable value.
struct Rebase {
    tensor: Tensor,
    flat_input: usize,
    flat_output: usize,
}

fn slot_start(slots: &[SlotLayout], position: usize) -> usize {
    slots.iter().take(position).map(SlotLayout::slot_count).sum()
}

#[derive(Debug, Clone)]
pub struct CompiledFunction {
    forward: Arc<dyn CompiledGraph>,
    backward: Option<Arc<dyn CompiledGraph>>,
    metadata: Arc<RuntimeMetadata>,
}

impl CompiledFunction {
    #[must_use]
    pub fn new(
        forward: Arc<dyn CompiledGraph>,
        backward: Option<Arc<dyn CompiledGraph>>,
        metadata: RuntimeMetadata,
    ) -> Self {
        Self {
            forward,
            backward,
            metadata: Arc::new(metadata),
        }
    }

    #[must_use]
    pub fn metadata(&self) -> &RuntimeMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn has_backward(&self) -> bool {
        self.backward.is_some()
    }

    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        let meta = &self.metadata;
        if let Err(violation) = meta.guards.check(args) {
            warn!(kind = violation.kind(), %violation, "input guard failed");
            return Err(violation.into());
        }

        let arguments = self.graph_arguments(args)?;
        let logical: Vec<Value> = arguments.iter().map(|arg| arg.value.clone()).collect();
        let flat = meta.subclass.flatten_args(&logical)?;
        let detached: Vec<Value> = flat.iter().map(detach).collect();

        let mut outputs = self.forward.call(&detached)?;
        let expected = meta.subclass.flat_output_count() + meta.partition.saved_count();
        if outputs.len() != expected {
            return Err(RuntimeError::OutputCount {
                expected,
                actual: outputs.len(),
            });
        }
        let saved = outputs.split_off(meta.subclass.flat_output_count());
        let functional = meta.subclass.unflatten_outputs(&outputs)?;

        self.write_back(args, &arguments, &functional)?;
        self.attach_backward(&arguments, &flat, &outputs, saved)?;
        let results = self.regenerate(&logical, &functional)?;
        debug!(
            args = args.len(),
            flat_inputs = flat.len(),
            outputs = results.len(),
            mutated = meta.view.mutated_inputs().len(),
            "compiled call"
        );
        Ok(results)
    }

    /// Caller arguments rearranged into the compiled graph's input order.
    fn graph_arguments(&self, args: &[Value]) -> Result<Vec<Argument>, RuntimeError> {
        let meta = &self.metadata;
        let deduped: Vec<Argument> = meta
            .dedupe
            .kept
            .iter()
            .zip(meta.dedupe.select(args))
            .map(|(position, value)| Argument {
                value: value.clone(),
                caller: Some(*position),
            })
            .collect();
        let Some(plan) = &meta.synthetic_base else {
            return Ok(deduped);
        };
        let mut arguments = Vec::with_capacity(plan.sources.len());
        for source in &plan.sources {
            match source {
                InputSource::Original(position) => {
                    let arg = &deduped[*position];
                    arguments.push(Argument {
                        value: arg.value.clone(),
                        caller: arg.caller,
                    });
                }
                InputSource::Base(index) => {
                    let group = &plan.groups[*index];
                    let members = group
                        .members
                        .iter()
                        .map(|member| deduped[member.input].value.expect_tensor().cloned())
                        .collect::<Result<Vec<_>, _>>()?;
                    arguments.push(Argument {
                        value: Value::Tensor(synthetic_base(group, &members)?),
                        caller: None,
                    });
                }
            }
        }
        Ok(arguments)
    }

    fn write_back(
        &self,
        args: &[Value],
        arguments: &[Argument],
        functional: &[Value],
    ) -> Result<(), RuntimeError> {
        let meta = &self.metadata;
        let users = meta.user_output_count();
        for (rank, position) in meta.view.mutated_inputs().into_iter().enumerate() {
            let info = &meta.view.inputs[position];
            let arg = &arguments[position];
            let shift = arg.caller.map_or(0, |caller| {
                let compiled = meta.guards.args[caller]
                    .layout
                    .as_ref()
                    .map_or(0, |layout| layout.storage_offset);
                let actual = args[caller].as_tensor().map_or(0, Tensor::storage_offset);
                actual as i64 - compiled as i64
            });
            write_back_input(position, &arg.value, &functional[users + rank], info, shift)?;
            tracing::trace!(
                position,
                mutation = info.mutation.as_str(),
                storage = info.mutates_storage,
                "wrote back input"
            );
        }

        if let Some(plan) = &meta.synthetic_base {
            let members = plan.groups.iter().flat_map(|group| &group.members);
            for (member, tracked) in members.zip(&meta.view.tracked_views) {
                if !tracked.mutates_metadata {
                    continue;
                }
                let caller = meta.dedupe.kept[member.input];
                let tensor = args[caller].expect_tensor()?;
                let layout = &tracked.final_layout;
                tensor.as_strided_(&layout.sizes, &layout.strides, layout.storage_offset)?;
            }
        }
        Ok(())
    }

    /// Caller tensors that take their history from the compiled backward.
    /// Synthetic-base arguments are skipped; their members keep their own
    /// view history.
    fn rebased_inputs(&self, arguments: &[Argument]) -> Vec<Rebase> {
        let meta = &self.metadata;
        let users = meta.user_output_count();
        let mut rebases = Vec::new();
        for (rank, position) in meta.view.mutated_inputs().into_iter().enumerate() {
            let arg = &arguments[position];
            if arg.caller.is_none() || !meta.view.inputs[position].mutation.mutates_data() {
                continue;
            }
            let input_start = slot_start(&meta.subclass.inputs, position);
            let output_start = slot_start(&meta.subclass.outputs, users + rank);
            for (component, tensor) in tensors_of(&arg.value).into_iter().enumerate() {
                let flat_output = output_start + component;
                if meta.partition.tangent_outputs.contains(&flat_output) {
                    rebases.push(Rebase {
                        tensor: tensor.clone(),
                        flat_input: input_start + component,
                        flat_output,
                    });
                }
            }
        }
        rebases
    }

    fn attach_backward(
        &self,
        arguments: &[Argument],
        flat_args: &[Value],
        flat_outputs: &[Value],
        saved: Vec<Value>,
    ) -> Result<(), RuntimeError> {
        let meta = &self.metadata;
        let Some(backward) = &self.backward else {
            return Ok(());
        };
        if meta.partition.is_inference() {
            return Ok(());
        }
        let rebases = self.rebased_inputs(arguments);
        // A rebased input's gradient still belongs to its history from before the call.
        let targets = meta
            .partition
            .grad_inputs
            .iter()
            .map(|position| -> Result<Tensor, RuntimeError> {
                let tensor = flat_args[*position].expect_tensor()?;
                Ok(if rebases.iter().any(|r| r.flat_input == *position) {
                    tensor.shallow_copy()
                } else {
                    tensor.clone()
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let node: Arc<dyn AutogradNode> = Arc::new(CompiledFunctionNode::new(
            Arc::clone(backward),
            saved,
            meta.tangent_sizes.clone(),
            targets,
        ));
        for (output_nr, position) in meta.partition.tangent_outputs.iter().enumerate() {
            let tensor = flat_outputs[*position].expect_tensor()?;
            tensor.set_requires_grad(true);
            tensor.set_grad_fn(Some(GradFn::Node {
                node: Arc::clone(&node),
                output_nr,
            }));
        }
        for rebase in &rebases {
            let Some(output_nr) = meta
                .partition
                .tangent_outputs
                .iter()
                .position(|position| *position == rebase.flat_output)
            else {
                continue;
            };
            rebase.tensor.set_requires_grad(true);
            rebase.tensor.set_grad_fn(Some(GradFn::Node {
                node: Arc::clone(&node),
                output_nr,
            }));
            tracing::trace!(
                flat_input = rebase.flat_input,
                output_nr,
                "input takes history from compiled backward"
            );
        }
        Ok(())
    }

    fn regenerate(&self, logical: &[Value], functional: &[Value]) -> Result<Vec<Value>, RuntimeError> {
        let meta = &self.metadata;
        let outputs = &meta.view.outputs;
        let mut results: Vec<Option<Value>> = vec![None; outputs.len()];

        for (position, info) in outputs.iter().enumerate() {
            match info.classification {
                OutputClassification::Fresh => {
                    results[position] = Some(functional[position].clone());
                }
                OutputClassification::AliasOfInputMultiView(_) => {
                    let value = functional[position].clone();
                    for tensor in tensors_of(&value) {
                        tensor.set_creation_meta(CreationMeta::MultiOutputView);
                    }
                    results[position] = Some(value);
                }
                OutputClassification::AliasOfInput(_)
                | OutputClassification::AliasOfIntermediate(_) => {}
            }
        }

        for (position, info) in outputs.iter().enumerate() {
            let base = match info.classification {
                OutputClassification::AliasOfInput(input) => {
                    if info.is_input_itself() {
                        results[position] = Some(logical[input].clone());
                        continue;
                    }
                    logical[input].clone()
                }
                OutputClassification::AliasOfIntermediate(BaseRef::UserOutput(user)) => results
                    [user]
                    .clone()
                    .unwrap_or_else(|| functional[user].clone()),
                OutputClassification::AliasOfIntermediate(BaseRef::ExtraOutput(extra)) => {
                    functional[meta.extra_output_start() + extra].clone()
                }
                OutputClassification::Fresh | OutputClassification::AliasOfInputMultiView(_) => {
                    continue;
                }
            };
            results[position] = Some(replay_value(&base, &info.replay)?);
        }

        Ok(results
            .into_iter()
            .zip(functional)
            .map(|(result, fallback)| result.unwrap_or_else(|| fallback.clone()))
            .collect())
    }
}

fn detach(value: &Value) -> Value {
    match value {
        Value::Tensor(tensor) => Value::Tensor(tensor.detach()),
        Value::Subclass(subclass) => Value::Subclass(
            subclass.with_components(subclass.tensors().map(Tensor::detach).collect()),
        ),
        Value::Scalar(_) => value.clone(),
    }
}

fn tensors_of(value: &Value) -> Vec<&Tensor> {
    match value {
        Value::Tensor(tensor) => vec![tensor],
        Value::Subclass(subclass) => subclass.tensors().collect(),
        Value::Scalar(_) => Vec::new(),
    }
}

fn replay_value(base: &Value, steps: &[ViewStep]) -> Result<Value, TensorError> {
    match base {
        Value::Tensor(tensor) => Ok(Value::Tensor(replay_on_tensor(tensor, steps)?)),
        Value::Subclass(subclass) => Ok(Value::Subclass(
            subclass.map(|tensor| replay_on_tensor(tensor, steps))?,
        )),
        Value::Scalar(_) => Ok(base.clone()),
    }
}

/// A one-dimensional view over the union of the members' storage. When every
/// member descends from one tensor the base is a view of it, so gradients
/// reach that tensor.
fn synthetic_base(group: &SyntheticBaseGroup, members: &[Tensor]) -> Result<Tensor, RuntimeError> {
    let root_of = |tensor: &Tensor| tensor.view_base().unwrap_or_else(|| tensor.clone());
    let Some(first) = members.first() else {
        return Err(RuntimeError::WriteBack {
            position: 0,
            detail: "synthetic base without members".to_owned(),
        });
    };
    let root = root_of(first);
    if members.iter().all(|member| root_of(member).same(&root)) {
        let relative = group.start as i64 - root.storage_offset() as i64;
        return Ok(root.as_strided(&[group.len], &[1], relative)?);
    }
    Ok(Tensor::from_parts(first.storage(), group.base_layout(), group.dtype)?)
}

fn shifted(offset: usize, shift: i64) -> Option<usize> {
    usize::try_from(offset as i64 + shift).ok()
}

fn write_back_input(
    position: usize,
    target: &Value,
    updated: &Value,
    info: &InputInfo,
    shift: i64,
) -> Result<(), RuntimeError> {
    match (target, updated) {
        (Value::Tensor(target), Value::Tensor(updated)) => {
            if info.mutates_storage {
                target.set_(updated)?;
                return Ok(());
            }
            if info.mutation.mutates_metadata() {
                let layout = &info.final_layout;
                let offset =
                    shifted(layout.storage_offset, shift).ok_or_else(|| RuntimeError::WriteBack {
                        position,
                        detail: format!("storage offset {} shifted by {shift}", layout.storage_offset),
                    })?;
                target.as_strided_(&layout.sizes, &layout.strides, offset)?;
            }
            if info.mutation.mutates_data() {
                target.copy_from(updated)?;
            }
            Ok(())
        }
        (Value::Subclass(target), Value::Subclass(updated)) => {
            if !info.mutation.mutates_data() {
                return Ok(());
            }
            for (component, source) in target.tensors().zip(updated.tensors()) {
                component.copy_from(source)?;
            }
            Ok(())
        }
        (target, updated) => Err(RuntimeError::WriteBack {
            position,
            detail: format!("a {} cannot take the value of a {}", target.kind(), updated.kind()),
        }),
    }
}
