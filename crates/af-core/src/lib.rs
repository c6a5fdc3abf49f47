#![forbid(unsafe_code)]

pub mod builder;
pub mod layout;
pub mod meta;
pub mod programs;
pub mod tensor;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::sync::OnceLock;
use thiserror::Error;

pub use builder::{BuildError, GraphBuilder, as_strided_params, remap_values};
pub use layout::{
    DEFAULT_OVERLAP_ENUMERATION_LIMIT, Layout, LayoutError, OverlapRange, contiguous_strides,
    layouts_overlap,
};
pub use meta::{ComponentMeta, StorageId, SubclassMeta, TensorValue, ValueMeta};
pub use programs::{ALL_PROGRAMS, ProgramSpec, build_program};
pub use tensor::{
    AutogradNode, CreationMeta, GradFn, Storage, SubclassTensor, Tensor, TensorError, Value,
    as_strided_backward,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompatibilityMode {
    Strict,
    Hardened,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    Bool,
}

impl DType {
    #[must_use]
    pub fn size_bytes(self) -> usize {
        match self {
            Self::Bool => 1,
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::Bool => "bool",
        }
    }
}

/// What a mutating primitive changes about its first operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationClass {
    Data,
    Metadata,
    Storage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Primitive {
    // Elementwise
    Add,
    Sub,
    Mul,
    Div,
    Neg,
    Exp,
    Log,
    Sin,
    Cos,
    Relu,
    // Reduction and factories
    Sum,
    Full,
    ZerosLike,
    Expand,
    SymSize,
    // Copies
    Clone,
    Copy,
    Fill,
    // Backward helpers
    ThresholdBackward,
    AsStridedBackward,
    // Views
    View,
    AsStrided,
    Slice,
    Select,
    Transpose,
    Unsqueeze,
    Alias,
    Detach,
    Unbind,
    // Scatter
    AsStridedScatter,
    // In-place data mutation
    AddInplace,
    SubInplace,
    MulInplace,
    DivInplace,
    CopyInplace,
    FillInplace,
    // In-place metadata mutation
    TransposeInplace,
    UnsqueezeInplace,
    // Storage swap
    Set,
}

impl Primitive {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Sub => "sub",
            Self::Mul => "mul",
            Self::Div => "div",
            Self::Neg => "neg",
            Self::Exp => "exp",
            Self::Log => "log",
            Self::Sin => "sin",
            Self::Cos => "cos",
            Self::Relu => "relu",
            Self::Sum => "sum",
            Self::Full => "full",
            Self::ZerosLike => "zeros_like",
            Self::Expand => "expand",
            Self::SymSize => "sym_size",
            Self::Clone => "clone",
            Self::Copy => "copy",
            Self::Fill => "fill",
            Self::ThresholdBackward => "threshold_backward",
            Self::AsStridedBackward => "as_strided_backward",
            Self::View => "view",
            Self::AsStrided => "as_strided",
            Self::Slice => "slice",
            Self::Select => "select",
            Self::Transpose => "transpose",
            Self::Unsqueeze => "unsqueeze",
            Self::Alias => "alias",
            Self::Detach => "detach",
            Self::Unbind => "unbind",
            Self::AsStridedScatter => "as_strided_scatter",
            Self::AddInplace => "add_",
            Self::SubInplace => "sub_",
            Self::MulInplace => "mul_",
            Self::DivInplace => "div_",
            Self::CopyInplace => "copy_",
            Self::FillInplace => "fill_",
            Self::TransposeInplace => "transpose_",
            Self::UnsqueezeInplace => "unsqueeze_",
            Self::Set => "set_",
        }
    }

    /// Output shares storage with operand 0.
    #[must_use]
    pub fn is_view(self) -> bool {
        matches!(
            self,
            Self::View
                | Self::AsStrided
                | Self::Slice
                | Self::Select
                | Self::Transpose
                | Self::Unsqueeze
                | Self::Alias
                | Self::Detach
                | Self::Unbind
        )
    }

    #[must_use]
    pub fn is_multi_output_view(self) -> bool {
        matches!(self, Self::Unbind)
    }

    #[must_use]
    pub fn mutation_class(self) -> Option<MutationClass> {
        match self {
            Self::AddInplace
            | Self::SubInplace
            | Self::MulInplace
            | Self::DivInplace
            | Self::CopyInplace
            | Self::FillInplace => Some(MutationClass::Data),
            Self::TransposeInplace | Self::UnsqueezeInplace => Some(MutationClass::Metadata),
            Self::Set => Some(MutationClass::Storage),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_mutation(self) -> bool {
        self.mutation_class().is_some()
    }

    /// Pure counterpart of a mutating primitive.
    #[must_use]
    pub fn functional_counterpart(self) -> Option<Self> {
        match self {
            Self::AddInplace => Some(Self::Add),
            Self::SubInplace => Some(Self::Sub),
            Self::MulInplace => Some(Self::Mul),
            Self::DivInplace => Some(Self::Div),
            Self::CopyInplace => Some(Self::Copy),
            Self::FillInplace => Some(Self::Fill),
            Self::TransposeInplace => Some(Self::Transpose),
            Self::UnsqueezeInplace => Some(Self::Unsqueeze),
            Self::Set => Some(Self::Alias),
            _ => None,
        }
    }

    /// Default recompute allow-list used by the min-cut partitioner.
    #[must_use]
    pub fn is_cheap_to_recompute(self) -> bool {
        matches!(
            self,
            Self::Add
                | Self::Sub
                | Self::Mul
                | Self::Div
                | Self::Neg
                | Self::Exp
                | Self::Log
                | Self::Sin
                | Self::Cos
                | Self::Relu
                | Self::Full
                | Self::ZerosLike
                | Self::Expand
                | Self::SymSize
                | Self::Clone
                | Self::View
                | Self::AsStrided
                | Self::Slice
                | Self::Select
                | Self::Transpose
                | Self::Unsqueeze
                | Self::Alias
                | Self::Unbind
        )
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_PRIMITIVES
            .iter()
            .copied()
            .find(|primitive| primitive.as_str() == name)
    }
}

pub const ALL_PRIMITIVES: &[Primitive] = &[
    Primitive::Add,
    Primitive::Sub,
    Primitive::Mul,
    Primitive::Div,
    Primitive::Neg,
    Primitive::Exp,
    Primitive::Log,
    Primitive::Sin,
    Primitive::Cos,
    Primitive::Relu,
    Primitive::Sum,
    Primitive::Full,
    Primitive::ZerosLike,
    Primitive::Expand,
    Primitive::SymSize,
    Primitive::Clone,
    Primitive::Copy,
    Primitive::Fill,
    Primitive::ThresholdBackward,
    Primitive::AsStridedBackward,
    Primitive::View,
    Primitive::AsStrided,
    Primitive::Slice,
    Primitive::Select,
    Primitive::Transpose,
    Primitive::Unsqueeze,
    Primitive::Alias,
    Primitive::Detach,
    Primitive::Unbind,
    Primitive::AsStridedScatter,
    Primitive::AddInplace,
    Primitive::SubInplace,
    Primitive::MulInplace,
    Primitive::DivInplace,
    Primitive::CopyInplace,
    Primitive::FillInplace,
    Primitive::TransposeInplace,
    Primitive::UnsqueezeInplace,
    Primitive::Set,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ValueId(pub u32);

impl ValueId {
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Literal {
    I64(i64),
    Bool(bool),
    F64Bits(u64),
}

impl Literal {
    #[must_use]
    pub fn from_f64(value: f64) -> Self {
        Self::F64Bits(value.to_bits())
    }

    #[must_use]
    pub fn as_f64(self) -> f64 {
        match self {
            Self::F64Bits(bits) => f64::from_bits(bits),
            Self::I64(value) => value as f64,
            Self::Bool(value) => f64::from(u8::from(value)),
        }
    }

    #[must_use]
    pub fn as_i64(self) -> Option<i64> {
        match self {
            Self::I64(value) => Some(value),
            Self::Bool(_) | Self::F64Bits(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Atom {
    Var(ValueId),
    Lit(Literal),
}

impl Atom {
    #[must_use]
    pub fn var(self) -> Option<ValueId> {
        match self {
            Self::Var(id) => Some(id),
            Self::Lit(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub primitive: Primitive,
    pub inputs: SmallVec<[Atom; 4]>,
    pub outputs: SmallVec<[ValueId; 2]>,
    pub params: BTreeMap<String, String>,
}

impl Node {
    pub fn input_vars(&self) -> impl Iterator<Item = ValueId> + '_ {
        self.inputs.iter().filter_map(|atom| atom.var())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParamError {
    #[error("missing param `{key}`")]
    Missing { key: String },
    #[error("param `{key}` has malformed value `{value}`")]
    Malformed { key: String, value: String },
}

pub fn param_i64(params: &BTreeMap<String, String>, key: &str) -> Result<i64, ParamError> {
    let raw = params.get(key).ok_or_else(|| ParamError::Missing {
        key: key.to_owned(),
    })?;
    raw.trim().parse::<i64>().map_err(|_| ParamError::Malformed {
        key: key.to_owned(),
        value: raw.clone(),
    })
}

pub fn param_f64(params: &BTreeMap<String, String>, key: &str) -> Result<f64, ParamError> {
    let raw = params.get(key).ok_or_else(|| ParamError::Missing {
        key: key.to_owned(),
    })?;
    raw.trim().parse::<f64>().map_err(|_| ParamError::Malformed {
        key: key.to_owned(),
        value: raw.clone(),
    })
}

pub fn param_i64_list(params: &BTreeMap<String, String>, key: &str) -> Result<Vec<i64>, ParamError> {
    let raw = params.get(key).ok_or_else(|| ParamError::Missing {
        key: key.to_owned(),
    })?;
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(',')
        .map(|part| {
            part.trim().parse::<i64>().map_err(|_| ParamError::Malformed {
                key: key.to_owned(),
                value: raw.clone(),
            })
        })
        .collect()
}

pub fn param_usize_list(
    params: &BTreeMap<String, String>,
    key: &str,
) -> Result<Vec<usize>, ParamError> {
    param_i64_list(params, key)?
        .into_iter()
        .map(|value| {
            usize::try_from(value).map_err(|_| ParamError::Malformed {
                key: key.to_owned(),
                value: value.to_string(),
            })
        })
        .collect()
}

#[must_use]
pub fn encode_list<T: std::fmt::Display>(values: &[T]) -> String {
    values
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// `(key, value)` pairs into a params map.
#[must_use]
pub fn params<const N: usize>(pairs: [(&str, String); N]) -> BTreeMap<String, String> {
    pairs
        .into_iter()
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}

/// A traced tensor program: a flat arena of values plus nodes in program order.
#[derive(Debug, Serialize, Deserialize)]
pub struct Graph {
    pub values: Vec<ValueMeta>,
    pub inputs: Vec<ValueId>,
    pub outputs: Vec<ValueId>,
    pub nodes: Vec<Node>,
    #[serde(skip)]
    fingerprint_cache: OnceLock<String>,
}

impl Clone for Graph {
    fn clone(&self) -> Self {
        Self {
            values: self.values.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
            nodes: self.nodes.clone(),
            fingerprint_cache: OnceLock::new(),
        }
    }
}

impl PartialEq for Graph {
    fn eq(&self, other: &Self) -> bool {
        self.values == other.values
            && self.inputs == other.inputs
            && self.outputs == other.outputs
            && self.nodes == other.nodes
    }
}

impl Eq for Graph {}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphValidationError {
    #[error("value v{} is not in the arena of {len} values", value.0)]
    UnknownValue { value: ValueId, len: usize },
    #[error("duplicate binding for v{} in {section}", value.0)]
    DuplicateBinding { section: &'static str, value: ValueId },
    #[error("node {node_index} reads unbound v{}", value.0)]
    UnboundInput { node_index: usize, value: ValueId },
    #[error("node {node_index} rebinds v{}", value.0)]
    OutputShadowsBinding { node_index: usize, value: ValueId },
    #[error("output v{} is never bound", value.0)]
    UnknownOutput { value: ValueId },
}

impl Graph {
    #[must_use]
    pub fn new(
        values: Vec<ValueMeta>,
        inputs: Vec<ValueId>,
        outputs: Vec<ValueId>,
        nodes: Vec<Node>,
    ) -> Self {
        Self {
            values,
            inputs,
            outputs,
            nodes,
            fingerprint_cache: OnceLock::new(),
        }
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
    pub fn input_tensors(&self) -> Vec<Option<&TensorValue>> {
        self.inputs.iter().map(|id| self.tensor(*id)).collect()
    }

    /// Node index that defines each value.
    #[must_use]
    pub fn producers(&self) -> FxHashMap<ValueId, usize> {
        let mut out = FxHashMap::default();
        for (index, node) in self.nodes.iter().enumerate() {
            for value in &node.outputs {
                out.insert(*value, index);
            }
        }
        out
    }

    /// Node indices reading each value, in program order.
    #[must_use]
    pub fn users(&self) -> FxHashMap<ValueId, Vec<usize>> {
        let mut out: FxHashMap<ValueId, Vec<usize>> = FxHashMap::default();
        for (index, node) in self.nodes.iter().enumerate() {
            for value in node.input_vars() {
                let entry = out.entry(value).or_default();
                if entry.last() != Some(&index) {
                    entry.push(index);
                }
            }
        }
        out
    }

    #[must_use]
    pub fn mutation_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|node| node.primitive.is_mutation())
            .count()
    }

    #[must_use]
    pub fn is_functional(&self) -> bool {
        self.mutation_count() == 0
    }

    #[must_use]
    pub fn canonical_fingerprint(&self) -> &str {
        self.fingerprint_cache.get_or_init(|| {
            let mut out = String::new();
            write_value_list(&mut out, "in", &self.inputs);
            out.push('|');
            write_value_list(&mut out, "out", &self.outputs);
            out.push('|');
            for input in &self.inputs {
                if let Some(tensor) = self.tensor(*input) {
                    let _ = write!(
                        &mut out,
                        "sig:{}:{:?}:{:?}:{}:{},",
                        tensor.dtype.as_str(),
                        tensor.layout.sizes,
                        tensor.layout.strides,
                        tensor.requires_grad,
                        tensor
                            .subclass
                            .as_ref()
                            .map_or("dense", |subclass| subclass.kind.as_str()),
                    );
                } else {
                    out.push_str("sig:symint,");
                }
            }
            out.push('|');
            for node in &self.nodes {
                let _ = write!(&mut out, "node:{}(", node.primitive.as_str());
                for atom in &node.inputs {
                    write_atom(&mut out, atom);
                    out.push(',');
                }
                out.push_str(")->");
                for value in &node.outputs {
                    let _ = write!(&mut out, "v{},", value.0);
                }
                out.push('{');
                for (key, value) in &node.params {
                    let _ = write!(&mut out, "{key}={value};");
                }
                out.push_str("}|");
            }
            out
        })
    }

    pub fn validate_well_formed(&self) -> Result<(), GraphValidationError> {
        let len = self.values.len();
        let check = |value: ValueId| {
            if value.index() >= len {
                Err(GraphValidationError::UnknownValue { value, len })
            } else {
                Ok(())
            }
        };

        let mut bindings = BTreeSet::new();
        for value in &self.inputs {
            check(*value)?;
            if !bindings.insert(*value) {
                return Err(GraphValidationError::DuplicateBinding {
                    section: "inputs",
                    value: *value,
                });
            }
        }

        for (node_index, node) in self.nodes.iter().enumerate() {
            for value in node.input_vars() {
                if !bindings.contains(&value) {
                    return Err(GraphValidationError::UnboundInput { node_index, value });
                }
            }
            for value in &node.outputs {
                check(*value)?;
                if !bindings.insert(*value) {
                    return Err(GraphValidationError::OutputShadowsBinding {
                        node_index,
                        value: *value,
                    });
                }
            }
        }

        let mut seen_outputs = BTreeSet::new();
        for value in &self.outputs {
            if !seen_outputs.insert(*value) {
                return Err(GraphValidationError::DuplicateBinding {
                    section: "outputs",
                    value: *value,
                });
            }
            if !bindings.contains(value) {
                return Err(GraphValidationError::UnknownOutput { value: *value });
            }
        }
        Ok(())
    }

    /// Human-readable listing, one node per line.
    #[must_use]
    pub fn pretty(&self) -> String {
        let mut out = String::new();
        write_value_list(&mut out, "def forward", &self.inputs);
        out.push('\n');
        for node in &self.nodes {
            out.push_str("    ");
            for (index, value) in node.outputs.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                let _ = write!(&mut out, "v{}", value.0);
            }
            let _ = write!(&mut out, " = {}(", node.primitive.as_str());
            for (index, atom) in node.inputs.iter().enumerate() {
                if index > 0 {
                    out.push_str(", ");
                }
                write_atom(&mut out, atom);
            }
            for (key, value) in &node.params {
                let _ = write!(&mut out, ", {key}=[{value}]");
            }
            out.push_str(")\n");
        }
        write_value_list(&mut out, "    return", &self.outputs);
        out
    }
}

fn write_value_list(out: &mut String, label: &str, values: &[ValueId]) {
    let _ = write!(out, "{label}[");
    for value in values {
        let _ = write!(out, "v{},", value.0);
    }
    out.push(']');
}

fn write_atom(out: &mut String, atom: &Atom) {
    match atom {
        Atom::Var(value) => {
            let _ = write!(out, "v{}", value.0);
        }
        Atom::Lit(Literal::I64(value)) => {
            let _ = write!(out, "i64:{value}");
        }
        Atom::Lit(Literal::Bool(value)) => {
            let _ = write!(out, "bool:{value}");
        }
        Atom::Lit(Literal::F64Bits(bits)) => {
            let _ = write!(out, "f64:{}", f64::from_bits(*bits));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ALL_PRIMITIVES, Atom, Graph, GraphValidationError, Literal, MutationClass, Node,
        Primitive, ValueId, ValueMeta, param_i64_list, params,
    };
    use smallvec::smallvec;
    use std::collections::BTreeMap;

    #[test]
    fn primitive_names_round_trip() {
        for primitive in ALL_PRIMITIVES {
            assert_eq!(Primitive::from_name(primitive.as_str()), Some(*primitive));
        }
    }

    #[test]
    fn every_mutation_has_a_pure_counterpart() {
        for primitive in ALL_PRIMITIVES {
            if primitive.is_mutation() {
                let pure = primitive
                    .functional_counterpart()
                    .expect("mutations map to a pure op");
                assert!(!pure.is_mutation(), "{}", primitive.as_str());
            }
        }
        assert_eq!(
            Primitive::Set.mutation_class(),
            Some(MutationClass::Storage)
        );
        assert!(Primitive::Unbind.is_view() && Primitive::Unbind.is_multi_output_view());
    }

    #[test]
    fn list_params_parse() {
        let map = params([("sizes", "2,-1".to_owned())]);
        assert_eq!(param_i64_list(&map, "sizes").expect("parse"), vec![2, -1]);
        assert!(param_i64_list(&BTreeMap::new(), "sizes").is_err());
    }

    #[test]
    fn validation_rejects_unbound_reads() {
        let graph = Graph::new(
            vec![ValueMeta::SymInt, ValueMeta::SymInt, ValueMeta::SymInt],
            vec![ValueId(0)],
            vec![ValueId(2)],
            vec![Node {
                primitive: Primitive::Add,
                inputs: smallvec![Atom::Var(ValueId(1)), Atom::Lit(Literal::I64(1))],
                outputs: smallvec![ValueId(2)],
                params: BTreeMap::new(),
            }],
        );
        assert_eq!(
            graph.validate_well_formed(),
            Err(GraphValidationError::UnboundInput {
                node_index: 0,
                value: ValueId(1)
            })
        );
    }

    #[test]
    fn fingerprint_is_stable_across_clones() {
        let graph = crate::build_program(crate::ProgramSpec::MulThenScale).expect("program");
        let clone = graph.clone();
        assert_eq!(graph.canonical_fingerprint(), clone.canonical_fingerprint());
        assert!(graph.pretty().contains("mul_"));
    }
}
