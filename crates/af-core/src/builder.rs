//! Graph construction with metadata propagation.
//!
//! This is the boundary the external tracer talks to: every appended node gets
//! output metadata (sizes, strides, storage identity, `requires_grad`) derived
//! from its operands, so later stages can reason about aliasing without
//! running anything.

use std::collections::BTreeMap;

use smallvec::SmallVec;
use thiserror::Error;

use crate::layout::{Layout, LayoutError};
use crate::meta::{ComponentMeta, StorageId, SubclassMeta, TensorValue, ValueMeta};
use crate::{
    Atom, DType, Graph, Literal, Node, ParamError, Primitive, ValueId, encode_list, param_f64,
    param_i64, param_i64_list, param_usize_list, params,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BuildError {
    #[error(transparent)]
    Param(#[from] ParamError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("{primitive} expects {expected} operands, got {actual}")]
    Arity {
        primitive: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{primitive} operand {position} must be a tensor")]
    ExpectedTensor {
        primitive: &'static str,
        position: usize,
    },
    #[error("{primitive} operands have incompatible sizes {lhs:?} and {rhs:?}")]
    ShapeMismatch {
        primitive: &'static str,
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    #[error("value v{} is not defined", .0.0)]
    UnknownValue(ValueId),
    #[error("{primitive}: {detail}")]
    SubclassMismatch {
        primitive: &'static str,
        detail: String,
    },
    #[error("graph expects {expected} inputs, got {actual}")]
    InputCount { expected: usize, actual: usize },
}

#[derive(Debug, Clone)]
enum Operand {
    Tensor(TensorValue),
    SymInt,
    Lit,
}

impl Operand {
    fn tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            Self::SymInt | Self::Lit => None,
        }
    }
}

fn broadcast_sizes(
    primitive: Primitive,
    lhs: &[usize],
    rhs: &[usize],
) -> Result<Vec<usize>, BuildError> {
    if lhs == rhs || rhs.is_empty() {
        Ok(lhs.to_vec())
    } else if lhs.is_empty() {
        Ok(rhs.to_vec())
    } else {
        Err(BuildError::ShapeMismatch {
            primitive: primitive.as_str(),
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
        })
    }
}

/// Output metadata for one dense application of `primitive`.
fn infer_dense(
    primitive: Primitive,
    operands: &[Operand],
    params: &BTreeMap<String, String>,
    alloc: &mut dyn FnMut() -> StorageId,
) -> Result<Vec<ValueMeta>, BuildError> {
    let name = primitive.as_str();
    let tensor_at = |position: usize| -> Result<&TensorValue, BuildError> {
        operands
            .get(position)
            .and_then(Operand::tensor)
            .ok_or(BuildError::ExpectedTensor {
                primitive: name,
                position,
            })
    };
    let any_grad = operands
        .iter()
        .filter_map(Operand::tensor)
        .any(|tensor| tensor.requires_grad);

    let fresh = |dtype: DType,
                 sizes: &[usize],
                 requires_grad: bool,
                 alloc: &mut dyn FnMut() -> StorageId| {
        ValueMeta::Tensor(TensorValue {
            dtype,
            layout: Layout::contiguous(sizes),
            storage: alloc(),
            requires_grad,
            leaf: !requires_grad,
            subclass: None,
        })
    };
    let view_of = |source: &TensorValue, layout: Layout, requires_grad: bool| {
        ValueMeta::Tensor(TensorValue {
            dtype: source.dtype,
            layout,
            storage: source.storage,
            requires_grad,
            leaf: !requires_grad,
            subclass: None,
        })
    };

    let out = match primitive {
        Primitive::Add | Primitive::Sub | Primitive::Mul | Primitive::Div => {
            let lhs = tensor_at(0)?;
            let rhs_sizes = match operands.get(1) {
                Some(Operand::Tensor(rhs)) => rhs.layout.sizes.clone(),
                Some(Operand::Lit) => Vec::new(),
                _ => {
                    return Err(BuildError::Arity {
                        primitive: name,
                        expected: 2,
                        actual: operands.len(),
                    });
                }
            };
            let sizes = broadcast_sizes(primitive, &lhs.layout.sizes, &rhs_sizes)?;
            vec![fresh(lhs.dtype, &sizes, any_grad, alloc)]
        }
        Primitive::Neg
        | Primitive::Exp
        | Primitive::Log
        | Primitive::Sin
        | Primitive::Cos
        | Primitive::Relu
        | Primitive::Clone => {
            let input = tensor_at(0)?;
            vec![fresh(input.dtype, &input.layout.sizes, any_grad, alloc)]
        }
        Primitive::Sum => {
            let input = tensor_at(0)?;
            vec![fresh(input.dtype, &[], input.requires_grad, alloc)]
        }
        Primitive::Full => {
            let sizes = param_usize_list(params, "sizes")?;
            param_f64(params, "value")?;
            vec![fresh(DType::F32, &sizes, false, alloc)]
        }
        Primitive::ZerosLike => {
            let input = tensor_at(0)?;
            vec![fresh(input.dtype, &input.layout.sizes, false, alloc)]
        }
        Primitive::Expand => {
            let input = tensor_at(0)?;
            if input.layout.rank() != 0 {
                return Err(BuildError::ShapeMismatch {
                    primitive: name,
                    lhs: input.layout.sizes.clone(),
                    rhs: Vec::new(),
                });
            }
            let sizes = param_usize_list(params, "sizes")?;
            vec![fresh(input.dtype, &sizes, input.requires_grad, alloc)]
        }
        Primitive::SymSize => {
            let input = tensor_at(0)?;
            let dim = param_i64(params, "dim")?;
            let rank = input.layout.rank();
            if dim < 0 || dim as usize >= rank {
                return Err(LayoutError::DimOutOfRange { dim, rank }.into());
            }
            vec![ValueMeta::SymInt]
        }
        Primitive::Copy | Primitive::ThresholdBackward => {
            let dst = tensor_at(0)?;
            tensor_at(1)?;
            vec![fresh(dst.dtype, &dst.layout.sizes, any_grad, alloc)]
        }
        Primitive::Fill => {
            let input = tensor_at(0)?;
            vec![fresh(input.dtype, &input.layout.sizes, input.requires_grad, alloc)]
        }
        Primitive::AsStridedBackward => {
            let grad = tensor_at(0)?;
            let sizes = param_usize_list(params, "input_sizes")?;
            vec![fresh(grad.dtype, &sizes, grad.requires_grad, alloc)]
        }
        Primitive::View => {
            let input = tensor_at(0)?;
            let layout = input.layout.view(&param_i64_list(params, "sizes")?)?;
            vec![view_of(input, layout, input.requires_grad)]
        }
        Primitive::AsStrided => {
            let input = tensor_at(0)?;
            let layout = input.layout.as_strided(
                &param_usize_list(params, "sizes")?,
                &param_usize_list(params, "strides")?,
                param_i64(params, "offset")?,
            )?;
            vec![view_of(input, layout, input.requires_grad)]
        }
        Primitive::Slice => {
            let input = tensor_at(0)?;
            let layout = input.layout.slice(
                param_i64(params, "dim")?,
                param_i64(params, "start")?,
                param_i64(params, "end")?,
                param_i64(params, "step")?,
            )?;
            vec![view_of(input, layout, input.requires_grad)]
        }
        Primitive::Select => {
            let input = tensor_at(0)?;
            let layout = input
                .layout
                .select(param_i64(params, "dim")?, param_i64(params, "index")?)?;
            vec![view_of(input, layout, input.requires_grad)]
        }
        Primitive::Transpose | Primitive::TransposeInplace => {
            let input = tensor_at(0)?;
            let layout = input
                .layout
                .transpose(param_i64(params, "dim0")?, param_i64(params, "dim1")?)?;
            vec![view_of(input, layout, input.requires_grad)]
        }
        Primitive::Unsqueeze | Primitive::UnsqueezeInplace => {
            let input = tensor_at(0)?;
            let layout = input.layout.unsqueeze(param_i64(params, "dim")?)?;
            vec![view_of(input, layout, input.requires_grad)]
        }
        Primitive::Alias => {
            let input = tensor_at(0)?;
            vec![view_of(input, input.layout.clone(), input.requires_grad)]
        }
        Primitive::Detach => {
            let input = tensor_at(0)?;
            vec![view_of(input, input.layout.clone(), false)]
        }
        Primitive::Unbind => {
            let input = tensor_at(0)?;
            input
                .layout
                .unbind(param_i64(params, "dim")?)?
                .into_iter()
                .map(|layout| view_of(input, layout, input.requires_grad))
                .collect()
        }
        Primitive::AsStridedScatter => {
            let base = tensor_at(0)?;
            let src = tensor_at(1)?;
            let sizes = param_usize_list(params, "sizes")?;
            if src.layout.sizes != sizes {
                return Err(BuildError::ShapeMismatch {
                    primitive: name,
                    lhs: sizes,
                    rhs: src.layout.sizes.clone(),
                });
            }
            vec![ValueMeta::Tensor(TensorValue {
                dtype: base.dtype,
                layout: base.layout.clone(),
                storage: alloc(),
                requires_grad: any_grad,
                leaf: !any_grad,
                subclass: None,
            })]
        }
        Primitive::AddInplace
        | Primitive::SubInplace
        | Primitive::MulInplace
        | Primitive::DivInplace
        | Primitive::CopyInplace
        | Primitive::FillInplace => {
            let target = tensor_at(0)?;
            if let Some(Operand::Tensor(other)) = operands.get(1) {
                broadcast_sizes(primitive, &target.layout.sizes, &other.layout.sizes)?;
            }
            vec![view_of(target, target.layout.clone(), any_grad)]
        }
        Primitive::Set => {
            let target = tensor_at(0)?;
            let source = tensor_at(1)?;
            vec![view_of(source, source.layout.clone(), target.requires_grad)]
        }
    };
    Ok(out)
}

fn dense_component(component: &ComponentMeta, requires_grad: bool) -> TensorValue {
    TensorValue {
        dtype: component.dtype,
        layout: component.layout.clone(),
        storage: component.storage,
        requires_grad,
        leaf: !requires_grad,
        subclass: None,
    }
}

/// Appends nodes while keeping value metadata consistent.
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    values: Vec<ValueMeta>,
    inputs: Vec<ValueId>,
    nodes: Vec<Node>,
    next_storage: u64,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            inputs: Vec::new(),
            nodes: Vec::new(),
            next_storage: 1,
        }
    }

    /// Starts from an existing arena; new values and storages never collide with it.
    #[must_use]
    pub fn extending(graph: &Graph) -> Self {
        let mut builder = Self {
            values: graph.values.clone(),
            inputs: graph.inputs.clone(),
            nodes: graph.nodes.clone(),
            next_storage: 1,
        };
        for meta in &graph.values {
            builder.reserve_storages(meta);
        }
        builder
    }

    fn reserve_storages(&mut self, meta: &ValueMeta) {
        if let ValueMeta::Tensor(tensor) = meta {
            self.next_storage = self.next_storage.max(tensor.storage.0 + 1);
            if let Some(subclass) = &tensor.subclass {
                for component in &subclass.components {
                    self.next_storage = self.next_storage.max(component.storage.0 + 1);
                }
            }
        }
    }

    pub fn fresh_storage(&mut self) -> StorageId {
        let id = StorageId(self.next_storage);
        self.next_storage += 1;
        id
    }

    #[must_use]
    pub fn values(&self) -> &[ValueMeta] {
        &self.values
    }

    #[must_use]
    pub fn meta(&self, id: ValueId) -> Option<&ValueMeta> {
        self.values.get(id.index())
    }

    #[must_use]
    pub fn tensor(&self, id: ValueId) -> Option<&TensorValue> {
        self.meta(id).and_then(ValueMeta::as_tensor)
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn push_value(&mut self, meta: ValueMeta) -> ValueId {
        self.reserve_storages(&meta);
        let id = ValueId(self.values.len() as u32);
        self.values.push(meta);
        id
    }

    pub fn input_meta(&mut self, meta: ValueMeta) -> ValueId {
        let id = self.push_value(meta);
        self.inputs.push(id);
        id
    }

    /// Contiguous dense input over its own storage.
    pub fn input(&mut self, sizes: &[usize], requires_grad: bool) -> ValueId {
        let storage = self.fresh_storage();
        self.input_meta(ValueMeta::Tensor(TensorValue {
            dtype: DType::F32,
            layout: Layout::contiguous(sizes),
            storage,
            requires_grad,
            leaf: true,
            subclass: None,
        }))
    }

    /// Non-leaf input viewing `storage` through `layout`.
    pub fn input_view(&mut self, storage: StorageId, layout: Layout, requires_grad: bool) -> ValueId {
        self.input_meta(ValueMeta::Tensor(TensorValue {
            dtype: DType::F32,
            layout,
            storage,
            requires_grad,
            leaf: !requires_grad,
            subclass: None,
        }))
    }

    /// Subclass input whose components are contiguous and share `sizes`.
    pub fn subclass_input(
        &mut self,
        kind: &str,
        attrs: &[&str],
        sizes: &[usize],
        requires_grad: bool,
    ) -> ValueId {
        let outer = self.fresh_storage();
        let components = attrs
            .iter()
            .map(|attr| ComponentMeta {
                attr: (*attr).to_owned(),
                dtype: DType::F32,
                layout: Layout::contiguous(sizes),
                storage: self.fresh_storage(),
            })
            .collect();
        self.input_meta(ValueMeta::Tensor(TensorValue {
            dtype: DType::F32,
            layout: Layout::contiguous(sizes),
            storage: outer,
            requires_grad,
            leaf: !requires_grad,
            subclass: Some(SubclassMeta {
                kind: kind.to_owned(),
                components,
            }),
        }))
    }

    fn operand(&self, atom: &Atom) -> Result<Operand, BuildError> {
        match atom {
            Atom::Lit(_) => Ok(Operand::Lit),
            Atom::Var(id) => match self.meta(*id) {
                Some(ValueMeta::Tensor(tensor)) => Ok(Operand::Tensor(tensor.clone())),
                Some(ValueMeta::SymInt) => Ok(Operand::SymInt),
                None => Err(BuildError::UnknownValue(*id)),
            },
        }
    }

    fn infer(
        &mut self,
        primitive: Primitive,
        operands: &[Operand],
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<ValueMeta>, BuildError> {
        let subclass = operands
            .iter()
            .filter_map(Operand::tensor)
            .find_map(|tensor| tensor.subclass.clone());
        let Some(template) = subclass else {
            let mut alloc = || self.fresh_storage();
            return infer_dense(primitive, operands, params, &mut alloc);
        };

        let name = primitive.as_str();
        for tensor in operands.iter().filter_map(Operand::tensor) {
            if let Some(other) = &tensor.subclass
                && (other.kind != template.kind
                    || other.components.len() != template.components.len())
            {
                return Err(BuildError::SubclassMismatch {
                    primitive: name,
                    detail: format!("{} vs {}", template.kind, other.kind),
                });
            }
        }

        let outer_operands: Vec<Operand> = operands
            .iter()
            .map(|operand| match operand {
                Operand::Tensor(tensor) => Operand::Tensor(TensorValue {
                    subclass: None,
                    ..tensor.clone()
                }),
                other => other.clone(),
            })
            .collect();
        let outer = {
            let mut alloc = || self.fresh_storage();
            infer_dense(primitive, &outer_operands, params, &mut alloc)?
        };

        let mut per_component = Vec::with_capacity(template.components.len());
        for index in 0..template.components.len() {
            let component_operands: Vec<Operand> = operands
                .iter()
                .map(|operand| match operand {
                    Operand::Tensor(tensor) => match &tensor.subclass {
                        Some(subclass) => Operand::Tensor(dense_component(
                            &subclass.components[index],
                            tensor.requires_grad,
                        )),
                        None => Operand::Tensor(tensor.clone()),
                    },
                    other => other.clone(),
                })
                .collect();
            let mut alloc = || self.fresh_storage();
            per_component.push(infer_dense(
                primitive,
                &component_operands,
                params,
                &mut alloc,
            )?);
        }

        Ok(outer
            .into_iter()
            .enumerate()
            .map(|(position, meta)| match meta {
                ValueMeta::Tensor(tensor) => {
                    let components = template
                        .components
                        .iter()
                        .zip(&per_component)
                        .filter_map(|(component, outputs)| {
                            outputs
                                .get(position)
                                .and_then(ValueMeta::as_tensor)
                                .map(|dense| ComponentMeta {
                                    attr: component.attr.clone(),
                                    dtype: dense.dtype,
                                    layout: dense.layout.clone(),
                                    storage: dense.storage,
                                })
                        })
                        .collect();
                    ValueMeta::Tensor(TensorValue {
                        subclass: Some(SubclassMeta {
                            kind: template.kind.clone(),
                            components,
                        }),
                        ..tensor
                    })
                }
                ValueMeta::SymInt => ValueMeta::SymInt,
            })
            .collect())
    }

    pub fn apply(
        &mut self,
        primitive: Primitive,
        inputs: &[Atom],
        params: BTreeMap<String, String>,
    ) -> Result<SmallVec<[ValueId; 2]>, BuildError> {
        let operands = inputs
            .iter()
            .map(|atom| self.operand(atom))
            .collect::<Result<Vec<_>, _>>()?;
        let metas = self.infer(primitive, &operands, &params)?;
        let outputs: SmallVec<[ValueId; 2]> =
            metas.into_iter().map(|meta| self.push_value(meta)).collect();
        self.nodes.push(Node {
            primitive,
            inputs: inputs.iter().copied().collect(),
            outputs: outputs.clone(),
            params,
        });
        Ok(outputs)
    }

    /// Single-output `apply`.
    pub fn apply1(
        &mut self,
        primitive: Primitive,
        inputs: &[Atom],
        params: BTreeMap<String, String>,
    ) -> Result<ValueId, BuildError> {
        let outputs = self.apply(primitive, inputs, params)?;
        outputs.first().copied().ok_or(BuildError::Arity {
            primitive: primitive.as_str(),
            expected: 1,
            actual: 0,
        })
    }

    pub fn binary(&mut self, primitive: Primitive, lhs: ValueId, rhs: ValueId) -> Result<ValueId, BuildError> {
        self.apply1(primitive, &[Atom::Var(lhs), Atom::Var(rhs)], BTreeMap::new())
    }

    pub fn scalar(&mut self, primitive: Primitive, lhs: ValueId, rhs: f64) -> Result<ValueId, BuildError> {
        self.apply1(
            primitive,
            &[Atom::Var(lhs), Atom::Lit(Literal::from_f64(rhs))],
            BTreeMap::new(),
        )
    }

    pub fn unary(&mut self, primitive: Primitive, input: ValueId) -> Result<ValueId, BuildError> {
        self.apply1(primitive, &[Atom::Var(input)], BTreeMap::new())
    }

    pub fn view(&mut self, input: ValueId, sizes: &[i64]) -> Result<ValueId, BuildError> {
        self.apply1(
            Primitive::View,
            &[Atom::Var(input)],
            params([("sizes", encode_list(sizes))]),
        )
    }

    pub fn as_strided(
        &mut self,
        input: ValueId,
        sizes: &[usize],
        strides: &[usize],
        offset: i64,
    ) -> Result<ValueId, BuildError> {
        self.apply1(
            Primitive::AsStrided,
            &[Atom::Var(input)],
            as_strided_params(sizes, strides, offset),
        )
    }

    pub fn slice(&mut self, input: ValueId, dim: i64, start: i64, end: i64) -> Result<ValueId, BuildError> {
        self.apply1(
            Primitive::Slice,
            &[Atom::Var(input)],
            params([
                ("dim", dim.to_string()),
                ("start", start.to_string()),
                ("end", end.to_string()),
                ("step", "1".to_owned()),
            ]),
        )
    }

    pub fn select(&mut self, input: ValueId, dim: i64, index: i64) -> Result<ValueId, BuildError> {
        self.apply1(
            Primitive::Select,
            &[Atom::Var(input)],
            params([("dim", dim.to_string()), ("index", index.to_string())]),
        )
    }

    pub fn transpose(&mut self, input: ValueId, dim0: i64, dim1: i64) -> Result<ValueId, BuildError> {
        self.apply1(
            Primitive::Transpose,
            &[Atom::Var(input)],
            params([("dim0", dim0.to_string()), ("dim1", dim1.to_string())]),
        )
    }

    pub fn unsqueeze(&mut self, input: ValueId, dim: i64) -> Result<ValueId, BuildError> {
        self.apply1(
            Primitive::Unsqueeze,
            &[Atom::Var(input)],
            params([("dim", dim.to_string())]),
        )
    }

    pub fn unbind(&mut self, input: ValueId, dim: i64) -> Result<SmallVec<[ValueId; 2]>, BuildError> {
        self.apply(
            Primitive::Unbind,
            &[Atom::Var(input)],
            params([("dim", dim.to_string())]),
        )
    }

    pub fn sym_size(&mut self, input: ValueId, dim: i64) -> Result<ValueId, BuildError> {
        self.apply1(
            Primitive::SymSize,
            &[Atom::Var(input)],
            params([("dim", dim.to_string())]),
        )
    }

    pub fn full(&mut self, sizes: &[usize], value: f64) -> Result<ValueId, BuildError> {
        self.apply1(
            Primitive::Full,
            &[],
            params([("sizes", encode_list(sizes)), ("value", value.to_string())]),
        )
    }

    /// `target.op_(scalar)` for a data-mutating primitive.
    pub fn inplace_scalar(
        &mut self,
        primitive: Primitive,
        target: ValueId,
        rhs: f64,
    ) -> Result<ValueId, BuildError> {
        self.scalar(primitive, target, rhs)
    }

    pub fn copy_(&mut self, target: ValueId, src: ValueId) -> Result<ValueId, BuildError> {
        self.binary(Primitive::CopyInplace, target, src)
    }

    pub fn set_(&mut self, target: ValueId, src: ValueId) -> Result<ValueId, BuildError> {
        self.binary(Primitive::Set, target, src)
    }

    pub fn transpose_(&mut self, target: ValueId, dim0: i64, dim1: i64) -> Result<ValueId, BuildError> {
        self.apply1(
            Primitive::TransposeInplace,
            &[Atom::Var(target)],
            params([("dim0", dim0.to_string()), ("dim1", dim1.to_string())]),
        )
    }

    pub fn unsqueeze_(&mut self, target: ValueId, dim: i64) -> Result<ValueId, BuildError> {
        self.apply1(
            Primitive::UnsqueezeInplace,
            &[Atom::Var(target)],
            params([("dim", dim.to_string())]),
        )
    }

    #[must_use]
    pub fn finish(self, outputs: Vec<ValueId>) -> Graph {
        Graph::new(self.values, self.inputs, outputs, self.nodes)
    }

    /// Re-propagates metadata through `graph` for a new set of input metadata.
    pub fn retrace(graph: &Graph, inputs: Vec<ValueMeta>) -> Result<Graph, BuildError> {
        if inputs.len() != graph.inputs.len() {
            return Err(BuildError::InputCount {
                expected: graph.inputs.len(),
                actual: inputs.len(),
            });
        }
        let mut builder = Self::new();
        for meta in &inputs {
            builder.reserve_storages(meta);
        }
        let mut remap = BTreeMap::new();
        for (old, meta) in graph.inputs.iter().zip(inputs) {
            remap.insert(*old, builder.input_meta(meta));
        }
        builder.replay_nodes(&graph.nodes, &mut remap)?;
        let outputs = remap_values(&graph.outputs, &remap)?;
        Ok(builder.finish(outputs))
    }

    /// Re-applies `nodes` with operands renamed through `remap`, recording
    /// each output's new id there.
    pub fn replay_nodes(
        &mut self,
        nodes: &[Node],
        remap: &mut BTreeMap<ValueId, ValueId>,
    ) -> Result<(), BuildError> {
        for node in nodes {
            let atoms = node
                .inputs
                .iter()
                .map(|atom| match atom {
                    Atom::Var(id) => remap
                        .get(id)
                        .map(|mapped| Atom::Var(*mapped))
                        .ok_or(BuildError::UnknownValue(*id)),
                    Atom::Lit(literal) => Ok(Atom::Lit(*literal)),
                })
                .collect::<Result<Vec<_>, _>>()?;
            let outputs = self.apply(node.primitive, &atoms, node.params.clone())?;
            for (old, new) in node.outputs.iter().zip(outputs) {
                remap.insert(*old, new);
            }
        }
        Ok(())
    }
}

/// Renames `values` through `remap`.
pub fn remap_values(
    values: &[ValueId],
    remap: &BTreeMap<ValueId, ValueId>,
) -> Result<Vec<ValueId>, BuildError> {
    values
        .iter()
        .map(|id| remap.get(id).copied().ok_or(BuildError::UnknownValue(*id)))
        .collect()
}

#[must_use]
pub fn as_strided_params(sizes: &[usize], strides: &[usize], offset: i64) -> BTreeMap<String, String> {
    params([
        ("sizes", encode_list(sizes)),
        ("strides", encode_list(strides)),
        ("offset", offset.to_string()),
    ])
}
