//! Subclass flattening: every subclass position becomes one dense slot per
//! component, and comes back together on the way out.

use std::collections::BTreeMap;

use af_core::{
    Atom, Graph, GraphBuilder, Primitive, SubclassTensor, TensorValue, Value, ValueId, ValueMeta,
};
use serde::{Deserialize, Serialize};
use smallvec::{SmallVec, smallvec};

use crate::SubclassError;

/// How one logical position maps onto dense slots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotLayout {
    Dense,
    Subclass { kind: String, attrs: Vec<String> },
    SymInt,
}

impl SlotLayout {
    #[must_use]
    pub fn of_meta(meta: &ValueMeta) -> Self {
        match meta {
            ValueMeta::Tensor(TensorValue {
                subclass: Some(subclass),
                ..
            }) => Self::Subclass {
                kind: subclass.kind.clone(),
                attrs: subclass
                    .components
                    .iter()
                    .map(|component| component.attr.clone())
                    .collect(),
            },
            ValueMeta::Tensor(_) => Self::Dense,
            ValueMeta::SymInt => Self::SymInt,
        }
    }

    #[must_use]
    pub fn slot_count(&self) -> usize {
        match self {
            Self::Subclass { attrs, .. } => attrs.len(),
            Self::Dense | Self::SymInt => 1,
        }
    }

    #[must_use]
    pub fn is_subclass(&self) -> bool {
        matches!(self, Self::Subclass { .. })
    }

    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Dense => "dense tensor".to_owned(),
            Self::SymInt => "symbolic integer".to_owned(),
            Self::Subclass { kind, attrs } => format!("{kind}[{}]", attrs.join(", ")),
        }
    }

    /// Fails with `MetadataMismatch` when `value` is not shaped like `self`.
    pub fn check(&self, position: usize, value: &Value) -> Result<(), SubclassError> {
        let (_, actual) = flatten(value);
        if actual == *self {
            return Ok(());
        }
        Err(SubclassError::MetadataMismatch {
            position,
            expected: self.describe(),
            actual: actual.describe(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubclassLayout {
    pub inputs: Vec<SlotLayout>,
    pub outputs: Vec<SlotLayout>,
}

impl SubclassLayout {
    #[must_use]
    pub fn is_trivial(&self) -> bool {
        !self
            .inputs
            .iter()
            .chain(&self.outputs)
            .any(SlotLayout::is_subclass)
    }

    #[must_use]
    pub fn flat_input_count(&self) -> usize {
        self.inputs.iter().map(SlotLayout::slot_count).sum()
    }

    #[must_use]
    pub fn flat_output_count(&self) -> usize {
        self.outputs.iter().map(SlotLayout::slot_count).sum()
    }

    /// Checks every argument against the compiled layout, then flattens.
    pub fn flatten_args(&self, args: &[Value]) -> Result<Vec<Value>, SubclassError> {
        if args.len() != self.inputs.len() {
            return Err(SubclassError::SlotCount {
                expected: self.inputs.len(),
                actual: args.len(),
            });
        }
        let mut flat = Vec::with_capacity(self.flat_input_count());
        for (position, (arg, expected)) in args.iter().zip(&self.inputs).enumerate() {
            expected.check(position, arg)?;
            flat.extend(flatten(arg).0);
        }
        Ok(flat)
    }

    pub fn unflatten_outputs(&self, flat: &[Value]) -> Result<Vec<Value>, SubclassError> {
        if flat.len() != self.flat_output_count() {
            return Err(SubclassError::SlotCount {
                expected: self.flat_output_count(),
                actual: flat.len(),
            });
        }
        let mut rest = flat;
        let mut out = Vec::with_capacity(self.outputs.len());
        for layout in &self.outputs {
            let (head, tail) = rest.split_at(layout.slot_count());
            out.push(unflatten(head, layout)?);
            rest = tail;
        }
        Ok(out)
    }
}

#[must_use]
pub fn flatten(value: &Value) -> (Vec<Value>, SlotLayout) {
    match value {
        Value::Tensor(_) => (vec![value.clone()], SlotLayout::Dense),
        Value::Scalar(_) => (vec![value.clone()], SlotLayout::SymInt),
        Value::Subclass(subclass) => (
            subclass.tensors().cloned().map(Value::Tensor).collect(),
            SlotLayout::Subclass {
                kind: subclass.kind.clone(),
                attrs: subclass
                    .components
                    .iter()
                    .map(|(attr, _)| attr.clone())
                    .collect(),
            },
        ),
    }
}

pub fn unflatten(values: &[Value], layout: &SlotLayout) -> Result<Value, SubclassError> {
    if values.len() != layout.slot_count() {
        return Err(SubclassError::SlotCount {
            expected: layout.slot_count(),
            actual: values.len(),
        });
    }
    match layout {
        SlotLayout::Dense | SlotLayout::SymInt => Ok(values[0].clone()),
        SlotLayout::Subclass { kind, attrs } => {
            let mut components = Vec::with_capacity(attrs.len());
            for (slot, (attr, value)) in attrs.iter().zip(values).enumerate() {
                let tensor = value.as_tensor().ok_or(SubclassError::NotDense {
                    slot,
                    kind: value.kind(),
                })?;
                components.push((attr.clone(), tensor.clone()));
            }
            Ok(Value::Subclass(SubclassTensor::new(kind.clone(), components)))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatGraph {
    pub graph: Graph,
    pub layout: SubclassLayout,
}

type Slots = SmallVec<[ValueId; 2]>;

fn component_inputs(tensor: &TensorValue) -> Vec<ValueMeta> {
    tensor.subclass.as_ref().map_or_else(Vec::new, |subclass| {
        subclass
            .components
            .iter()
            .map(|component| {
                ValueMeta::Tensor(TensorValue {
                    dtype: component.dtype,
                    layout: component.layout.clone(),
                    storage: component.storage,
                    requires_grad: tensor.requires_grad,
                    leaf: tensor.leaf,
                    subclass: None,
                })
            })
            .collect()
    })
}

/// Rewrites `graph` over dense values only. Nodes touching a subclass are
/// replicated once per component; `sym_size` reads component 0.
pub fn flatten_subclasses(graph: &Graph) -> Result<FlatGraph, SubclassError> {
    let mut builder = GraphBuilder::new();
    let mut slots: BTreeMap<ValueId, Slots> = BTreeMap::new();
    let mut layout = SubclassLayout::default();

    for id in &graph.inputs {
        let meta = graph.meta(*id).ok_or(SubclassError::UnknownValue(*id))?;
        layout.inputs.push(SlotLayout::of_meta(meta));
        let flat: Slots = match meta {
            ValueMeta::Tensor(tensor) if tensor.is_subclass() => component_inputs(tensor)
                .into_iter()
                .map(|component| builder.input_meta(component))
                .collect(),
            other => smallvec![builder.input_meta(other.clone())],
        };
        slots.insert(*id, flat);
    }

    for node in &graph.nodes {
        let mut width = 1;
        for id in node.input_vars() {
            let count = slots.get(&id).ok_or(SubclassError::UnknownValue(id))?.len();
            if count == 1 {
                continue;
            }
            if width != 1 && width != count {
                return Err(SubclassError::ComponentMismatch {
                    primitive: node.primitive.as_str(),
                    expected: width,
                    actual: count,
                });
            }
            width = count;
        }
        if node.primitive == Primitive::SymSize {
            width = 1;
        }

        let mut per_component: Vec<SmallVec<[ValueId; 2]>> = Vec::with_capacity(width);
        for component in 0..width {
            let atoms = node
                .inputs
                .iter()
                .map(|atom| match atom {
                    Atom::Var(id) => slots
                        .get(id)
                        .and_then(|flat| flat.get(component).or_else(|| flat.first()))
                        .map(|mapped| Atom::Var(*mapped))
                        .ok_or(SubclassError::UnknownValue(*id)),
                    Atom::Lit(literal) => Ok(Atom::Lit(*literal)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            per_component.push(builder.apply(node.primitive, &atoms, node.params.clone())?);
        }
        for (position, old) in node.outputs.iter().enumerate() {
            let flat: Slots = per_component
                .iter()
                .filter_map(|outputs| outputs.get(position).copied())
                .collect();
            slots.insert(*old, flat);
        }
        if width > 1 {
            tracing::trace!(
                primitive = node.primitive.as_str(),
                components = width,
                "replicated node per component"
            );
        }
    }

    let mut outputs = Vec::with_capacity(graph.outputs.len());
    for id in &graph.outputs {
        let meta = graph.meta(*id).ok_or(SubclassError::UnknownValue(*id))?;
        layout.outputs.push(SlotLayout::of_meta(meta));
        outputs.extend(
            slots
                .get(id)
                .ok_or(SubclassError::UnknownValue(*id))?
                .iter()
                .copied(),
        );
    }
    tracing::debug!(
        logical_inputs = layout.inputs.len(),
        flat_inputs = layout.flat_input_count(),
        flat_outputs = outputs.len(),
        "flattened subclasses"
    );
    Ok(FlatGraph {
        graph: builder.finish(outputs),
        layout,
    })
}
