//! Trace-time value metadata: what the tracer knows about every graph value.

use serde::{Deserialize, Serialize};

use crate::DType;
use crate::layout::{Layout, OverlapRange, layouts_overlap};

/// Identity of an allocation. Only used for aliasing queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageId(pub u64);

/// One dense component of a subclass tensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentMeta {
    pub attr: String,
    pub dtype: DType,
    pub layout: Layout,
    pub storage: StorageId,
}

/// A logical tensor made of several dense tensors, operated on componentwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubclassMeta {
    pub kind: String,
    pub components: Vec<ComponentMeta>,
}

impl SubclassMeta {
    #[must_use]
    pub fn component_count(&self) -> usize {
        self.components.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorValue {
    pub dtype: DType,
    pub layout: Layout,
    pub storage: StorageId,
    pub requires_grad: bool,
    pub leaf: bool,
    pub subclass: Option<SubclassMeta>,
}

impl TensorValue {
    #[must_use]
    pub fn dense(dtype: DType, layout: Layout, storage: StorageId) -> Self {
        Self {
            dtype,
            layout,
            storage,
            requires_grad: false,
            leaf: true,
            subclass: None,
        }
    }

    #[must_use]
    pub fn with_requires_grad(mut self, requires_grad: bool) -> Self {
        self.requires_grad = requires_grad;
        self
    }

    #[must_use]
    pub fn sizes(&self) -> &[usize] {
        &self.layout.sizes
    }

    #[must_use]
    pub fn is_subclass(&self) -> bool {
        self.subclass.is_some()
    }

    #[must_use]
    pub fn overlap_range(&self) -> OverlapRange {
        self.layout
            .overlap_range(self.storage, self.dtype.size_bytes())
    }

    /// Same storage, same layout, same dtype.
    #[must_use]
    pub fn same_view(&self, other: &Self) -> bool {
        self.storage == other.storage && self.layout == other.layout && self.dtype == other.dtype
    }

    /// Whether the two values may address a common byte. Equal storage ids
    /// alone never imply aliasing.
    #[must_use]
    pub fn aliases(&self, other: &Self, enumeration_limit: usize) -> bool {
        if !self.overlap_range().intersects(&other.overlap_range()) {
            return false;
        }
        if self.dtype.size_bytes() != other.dtype.size_bytes() {
            return true;
        }
        layouts_overlap(&self.layout, &other.layout, enumeration_limit)
    }
}

/// Arena entry for one graph value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueMeta {
    Tensor(TensorValue),
    /// A symbolic integer, e.g. one dimension of a tensor's shape.
    SymInt,
}

impl ValueMeta {
    #[must_use]
    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            Self::SymInt => None,
        }
    }

    #[must_use]
    pub fn is_sym_int(&self) -> bool {
        matches!(self, Self::SymInt)
    }

    #[must_use]
    pub fn requires_grad(&self) -> bool {
        self.as_tensor().is_some_and(|tensor| tensor.requires_grad)
    }
}
