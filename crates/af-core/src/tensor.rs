//! Concrete runtime tensors with real aliasing.
//!
//! A `Tensor` is a shared handle: clones refer to the same object, so an
//! in-place metadata change through one handle is visible through all of them,
//! and views share their `Storage`. Elements are stored as `f64` regardless of
//! the nominal dtype.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::layout::{Layout, LayoutError};
use crate::meta::{ComponentMeta, StorageId, SubclassMeta, TensorValue, ValueMeta};
use crate::{DType, Literal};

static NEXT_STORAGE_ID: AtomicU64 = AtomicU64::new(1 << 40);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TensorError {
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("expected {expected} elements, got {actual}")]
    ElementCount { expected: usize, actual: usize },
    #[error("layout addresses element {index} of a storage holding {len}")]
    OutOfStorage { index: usize, len: usize },
    #[error(
        "output of a function returning multiple views is being modified in-place; \
         such views do not allow in-place modification"
    )]
    MultiOutputViewInplace,
    #[error("a leaf tensor that requires grad is being used in an in-place operation")]
    LeafInplace,
    #[error("expected a dense tensor, got {kind}")]
    NotDense { kind: &'static str },
    #[error("subclass components disagree: {detail}")]
    ComponentMismatch { detail: String },
}

pub struct Storage {
    id: StorageId,
    data: RwLock<Vec<f64>>,
    version: AtomicU64,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("version", &self.version())
            .finish()
    }
}

impl Storage {
    #[must_use]
    pub fn new(data: Vec<f64>) -> Arc<Self> {
        Arc::new(Self {
            id: StorageId(NEXT_STORAGE_ID.fetch_add(1, Ordering::Relaxed)),
            data: RwLock::new(data),
            version: AtomicU64::new(0),
        })
    }

    #[must_use]
    pub fn id(&self) -> StorageId {
        self.id
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<f64>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<f64>> {
        self.version.fetch_add(1, Ordering::AcqRel);
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<f64> {
        self.read().clone()
    }
}

/// How a tensor came to exist, for in-place safety checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CreationMeta {
    Default,
    MultiOutputView,
}

/// A backward function owned by whoever produced a tensor.
pub trait AutogradNode: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Nodes created later run earlier during backward.
    fn sequence_nr(&self) -> u64;

    fn as_any(&self) -> &dyn Any;
}

#[derive(Clone)]
pub enum GradFn {
    Node {
        node: Arc<dyn AutogradNode>,
        output_nr: usize,
    },
    /// Gradient flows into the tensor's view base.
    View,
}

impl fmt::Debug for GradFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node { node, output_nr } => write!(f, "{}[{output_nr}]", node.name()),
            Self::View => f.write_str("AsStridedBackward"),
        }
    }
}

struct TensorState {
    storage: Arc<Storage>,
    layout: Layout,
    dtype: DType,
    requires_grad: bool,
    grad_fn: Option<GradFn>,
    creation: CreationMeta,
    base: Option<Tensor>,
    grad: Option<Tensor>,
}

#[derive(Clone)]
pub struct Tensor(Arc<RwLock<TensorState>>);

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Tensor")
            .field("sizes", &state.layout.sizes)
            .field("strides", &state.layout.strides)
            .field("offset", &state.layout.storage_offset)
            .field("storage", &state.storage.id)
            .field("requires_grad", &state.requires_grad)
            .field("grad_fn", &state.grad_fn)
            .finish()
    }
}

impl Tensor {
    fn from_state(state: TensorState) -> Self {
        Self(Arc::new(RwLock::new(state)))
    }

    fn state(&self) -> RwLockReadGuard<'_, TensorState> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, TensorState> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn from_parts(
        storage: Arc<Storage>,
        layout: Layout,
        dtype: DType,
    ) -> Result<Self, TensorError> {
        if let Some(last) = layout.max_offset()
            && last >= storage.len()
        {
            return Err(TensorError::OutOfStorage {
                index: last,
                len: storage.len(),
            });
        }
        Ok(Self::from_state(TensorState {
            storage,
            layout,
            dtype,
            requires_grad: false,
            grad_fn: None,
            creation: CreationMeta::Default,
            base: None,
            grad: None,
        }))
    }

    pub fn from_vec(sizes: &[usize], data: Vec<f64>) -> Result<Self, TensorError> {
        let expected = sizes.iter().product::<usize>();
        if data.len() != expected {
            return Err(TensorError::ElementCount {
                expected,
                actual: data.len(),
            });
        }
        Self::from_parts(Storage::new(data), Layout::contiguous(sizes), DType::F32)
    }

    #[must_use]
    pub fn full(sizes: &[usize], value: f64) -> Self {
        let numel = sizes.iter().product::<usize>();
        Self::from_state(TensorState {
            storage: Storage::new(vec![value; numel]),
            layout: Layout::contiguous(sizes),
            dtype: DType::F32,
            requires_grad: false,
            grad_fn: None,
            creation: CreationMeta::Default,
            base: None,
            grad: None,
        })
    }

    #[must_use]
    pub fn zeros(sizes: &[usize]) -> Self {
        Self::full(sizes, 0.0)
    }

    #[must_use]
    pub fn scalar(value: f64) -> Self {
        Self::full(&[], value)
    }

    /// Marks a leaf as requiring grad.
    #[must_use]
    pub fn requires_grad(self, requires_grad: bool) -> Self {
        self.state_mut().requires_grad = requires_grad;
        self
    }

    #[must_use]
    pub fn with_dtype(self, dtype: DType) -> Self {
        self.state_mut().dtype = dtype;
        self
    }

    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    #[must_use]
    pub fn sizes(&self) -> Vec<usize> {
        self.state().layout.sizes.clone()
    }

    #[must_use]
    pub fn strides(&self) -> Vec<usize> {
        self.state().layout.strides.clone()
    }

    #[must_use]
    pub fn storage_offset(&self) -> usize {
        self.state().layout.storage_offset
    }

    #[must_use]
    pub fn layout(&self) -> Layout {
        self.state().layout.clone()
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.state().dtype
    }

    #[must_use]
    pub fn numel(&self) -> usize {
        self.state().layout.numel()
    }

    #[must_use]
    pub fn storage(&self) -> Arc<Storage> {
        Arc::clone(&self.state().storage)
    }

    #[must_use]
    pub fn storage_id(&self) -> StorageId {
        self.state().storage.id
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.state().storage.version()
    }

    #[must_use]
    pub fn is_requires_grad(&self) -> bool {
        self.state().requires_grad
    }

    pub fn set_requires_grad(&self, requires_grad: bool) {
        self.state_mut().requires_grad = requires_grad;
    }

    /// Leaves have neither a backward function nor a view base.
    #[must_use]
    pub fn is_leaf(&self) -> bool {
        let state = self.state();
        state.grad_fn.is_none() && state.base.is_none()
    }

    #[must_use]
    pub fn grad_fn(&self) -> Option<GradFn> {
        self.state().grad_fn.clone()
    }

    pub fn set_grad_fn(&self, grad_fn: Option<GradFn>) {
        self.state_mut().grad_fn = grad_fn;
    }

    #[must_use]
    pub fn creation_meta(&self) -> CreationMeta {
        self.state().creation
    }

    pub fn set_creation_meta(&self, creation: CreationMeta) {
        self.state_mut().creation = creation;
    }

    #[must_use]
    pub fn view_base(&self) -> Option<Tensor> {
        self.state().base.clone()
    }

    #[must_use]
    pub fn grad(&self) -> Option<Tensor> {
        self.state().grad.clone()
    }

    pub fn accumulate_grad(&self, grad: &Tensor) -> Result<(), TensorError> {
        let existing = self.grad();
        let next = match existing {
            Some(current) => {
                let summed = current
                    .to_vec()
                    .iter()
                    .zip(grad.to_vec())
                    .map(|(a, b)| a + b)
                    .collect();
                Tensor::from_vec(&current.sizes(), summed)?
            }
            None => grad.contiguous(),
        };
        self.state_mut().grad = Some(next);
        Ok(())
    }

    pub fn clear_grad(&self) {
        self.state_mut().grad = None;
    }

    /// Elements in logical row-major order.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f64> {
        let (storage, layout) = {
            let state = self.state();
            (Arc::clone(&state.storage), state.layout.clone())
        };
        let data = storage.read();
        layout
            .element_offsets()
            .into_iter()
            .map(|offset| data.get(offset).copied().unwrap_or(f64::NAN))
            .collect()
    }

    pub fn item(&self) -> Result<f64, TensorError> {
        let values = self.to_vec();
        if values.len() != 1 {
            return Err(TensorError::ElementCount {
                expected: 1,
                actual: values.len(),
            });
        }
        Ok(values[0])
    }

    /// Fresh contiguous copy with no autograd history.
    #[must_use]
    pub fn contiguous(&self) -> Tensor {
        let dtype = self.dtype();
        Tensor::from_state(TensorState {
            storage: Storage::new(self.to_vec()),
            layout: Layout::contiguous(&self.sizes()),
            dtype,
            requires_grad: false,
            grad_fn: None,
            creation: CreationMeta::Default,
            base: None,
            grad: None,
        })
    }

    /// Same layout geometry over a full copy of the storage.
    #[must_use]
    pub fn clone_storage(&self) -> Tensor {
        let state = self.state();
        Tensor::from_state(TensorState {
            storage: Storage::new(state.storage.snapshot()),
            layout: state.layout.clone(),
            dtype: state.dtype,
            requires_grad: false,
            grad_fn: None,
            creation: CreationMeta::Default,
            base: None,
            grad: None,
        })
    }

    #[must_use]
    pub fn meta(&self) -> TensorValue {
        let state = self.state();
        TensorValue {
            dtype: state.dtype,
            layout: state.layout.clone(),
            storage: state.storage.id,
            requires_grad: state.requires_grad,
            leaf: state.grad_fn.is_none() && state.base.is_none(),
            subclass: None,
        }
    }

    fn make_view(&self, layout: Layout, creation: CreationMeta) -> Result<Tensor, TensorError> {
        let state = self.state();
        if let Some(last) = layout.max_offset()
            && last >= state.storage.len()
        {
            return Err(TensorError::OutOfStorage {
                index: last,
                len: state.storage.len(),
            });
        }
        let base = Some(state.base.clone().unwrap_or_else(|| self.clone()));
        Ok(Tensor::from_state(TensorState {
            storage: Arc::clone(&state.storage),
            layout,
            dtype: state.dtype,
            requires_grad: state.requires_grad,
            grad_fn: state.requires_grad.then_some(GradFn::View),
            creation,
            base,
            grad: None,
        }))
    }

    pub fn as_strided(
        &self,
        sizes: &[usize],
        strides: &[usize],
        relative_offset: i64,
    ) -> Result<Tensor, TensorError> {
        let layout = self.layout().as_strided(sizes, strides, relative_offset)?;
        self.make_view(layout, CreationMeta::Default)
    }

    pub fn view(&self, sizes: &[i64]) -> Result<Tensor, TensorError> {
        let layout = self.layout().view(sizes)?;
        self.make_view(layout, CreationMeta::Default)
    }

    pub fn slice(&self, dim: i64, start: i64, end: i64, step: i64) -> Result<Tensor, TensorError> {
        let layout = self.layout().slice(dim, start, end, step)?;
        self.make_view(layout, CreationMeta::Default)
    }

    pub fn select(&self, dim: i64, index: i64) -> Result<Tensor, TensorError> {
        let layout = self.layout().select(dim, index)?;
        self.make_view(layout, CreationMeta::Default)
    }

    pub fn transpose(&self, dim0: i64, dim1: i64) -> Result<Tensor, TensorError> {
        let layout = self.layout().transpose(dim0, dim1)?;
        self.make_view(layout, CreationMeta::Default)
    }

    pub fn unsqueeze(&self, dim: i64) -> Result<Tensor, TensorError> {
        let layout = self.layout().unsqueeze(dim)?;
        self.make_view(layout, CreationMeta::Default)
    }

    pub fn alias(&self) -> Result<Tensor, TensorError> {
        self.make_view(self.layout(), CreationMeta::Default)
    }

    /// Shares storage but carries no autograd history.
    #[must_use]
    pub fn detach(&self) -> Tensor {
        let state = self.state();
        Tensor::from_state(TensorState {
            storage: Arc::clone(&state.storage),
            layout: state.layout.clone(),
            dtype: state.dtype,
            requires_grad: false,
            grad_fn: None,
            creation: CreationMeta::Default,
            base: None,
            grad: None,
        })
    }

    /// A second handle over the same storage and layout carrying the current
    /// autograd history. Later changes to either handle's history leave the
    /// other alone.
    #[must_use]
    pub fn shallow_copy(&self) -> Tensor {
        let state = self.state();
        Tensor::from_state(TensorState {
            storage: Arc::clone(&state.storage),
            layout: state.layout.clone(),
            dtype: state.dtype,
            requires_grad: state.requires_grad,
            grad_fn: state.grad_fn.clone(),
            creation: state.creation,
            base: state.base.clone(),
            grad: None,
        })
    }

    pub fn unbind(&self, dim: i64) -> Result<Vec<Tensor>, TensorError> {
        self.layout()
            .unbind(dim)?
            .into_iter()
            .map(|layout| self.make_view(layout, CreationMeta::MultiOutputView))
            .collect()
    }

    /// Rejects in-place writes that eager autograd forbids.
    pub fn check_inplace(&self) -> Result<(), TensorError> {
        let state = self.state();
        if !state.requires_grad {
            return Ok(());
        }
        if state.creation == CreationMeta::MultiOutputView {
            return Err(TensorError::MultiOutputViewInplace);
        }
        match &state.base {
            None if state.grad_fn.is_none() => Err(TensorError::LeafInplace),
            Some(base) if base.is_leaf() && base.is_requires_grad() => {
                Err(TensorError::LeafInplace)
            }
            _ => Ok(()),
        }
    }

    /// Overwrites elements in logical order without autograd checks.
    pub fn write_logical(&self, values: &[f64]) -> Result<(), TensorError> {
        let (storage, layout) = {
            let state = self.state();
            (Arc::clone(&state.storage), state.layout.clone())
        };
        let offsets = layout.element_offsets();
        if offsets.len() != values.len() {
            return Err(TensorError::ElementCount {
                expected: offsets.len(),
                actual: values.len(),
            });
        }
        let mut data = storage.write();
        for (offset, value) in offsets.into_iter().zip(values) {
            let len = data.len();
            let slot = data
                .get_mut(offset)
                .ok_or(TensorError::OutOfStorage { index: offset, len })?;
            *slot = *value;
        }
        Ok(())
    }

    /// Value copy used by runtime write-back; `src` broadcasts when 0-d.
    pub fn copy_from(&self, src: &Tensor) -> Result<(), TensorError> {
        let numel = self.numel();
        let values = src.to_vec();
        let values = if values.len() == numel {
            values
        } else if values.len() == 1 {
            vec![values[0]; numel]
        } else {
            return Err(TensorError::ShapeMismatch {
                expected: self.sizes(),
                actual: src.sizes(),
            });
        };
        self.write_logical(&values)
    }

    pub fn copy_(&self, src: &Tensor) -> Result<(), TensorError> {
        self.check_inplace()?;
        self.copy_from(src)
    }

    pub fn fill_(&self, value: f64) -> Result<(), TensorError> {
        self.check_inplace()?;
        self.write_logical(&vec![value; self.numel()])
    }

    /// Re-strides in place over the same storage.
    pub fn as_strided_(
        &self,
        sizes: &[usize],
        strides: &[usize],
        storage_offset: usize,
    ) -> Result<(), TensorError> {
        let layout = Layout::new(sizes.to_vec(), strides.to_vec(), storage_offset)?;
        let mut state = self.state_mut();
        if let Some(last) = layout.max_offset()
            && last >= state.storage.len()
        {
            return Err(TensorError::OutOfStorage {
                index: last,
                len: state.storage.len(),
            });
        }
        state.layout = layout;
        Ok(())
    }

    pub fn transpose_(&self, dim0: i64, dim1: i64) -> Result<(), TensorError> {
        let layout = self.layout().transpose(dim0, dim1)?;
        self.state_mut().layout = layout;
        Ok(())
    }

    pub fn unsqueeze_(&self, dim: i64) -> Result<(), TensorError> {
        let layout = self.layout().unsqueeze(dim)?;
        self.state_mut().layout = layout;
        Ok(())
    }

    /// Adopts the storage and layout of `src`.
    pub fn set_(&self, src: &Tensor) -> Result<(), TensorError> {
        if self.same(src) {
            return Ok(());
        }
        let (storage, layout) = {
            let state = src.state();
            (Arc::clone(&state.storage), state.layout.clone())
        };
        let mut state = self.state_mut();
        state.storage = storage;
        state.layout = layout;
        Ok(())
    }
}

/// Gradient of a strided view with respect to the tensor it was taken from.
///
/// `input` and `view` are expressed in one storage coordinate system; the
/// result is contiguous with `input.sizes`.
pub fn as_strided_backward(
    grad: &Tensor,
    input: &Layout,
    view: &Layout,
) -> Result<Tensor, TensorError> {
    if grad.sizes() != view.sizes {
        return Err(TensorError::ShapeMismatch {
            expected: view.sizes.clone(),
            actual: grad.sizes(),
        });
    }
    let len = input
        .max_offset()
        .max(view.max_offset())
        .map_or(0, |last| last + 1);
    let mut buffer = vec![0.0; len];
    for (offset, value) in view.element_offsets().into_iter().zip(grad.to_vec()) {
        buffer[offset] += value;
    }
    let gathered = input
        .element_offsets()
        .into_iter()
        .map(|offset| buffer[offset])
        .collect();
    Tensor::from_vec(&input.sizes, gathered)
}

#[derive(Debug, Clone)]
pub struct SubclassTensor {
    pub kind: String,
    pub components: Vec<(String, Tensor)>,
}

impl SubclassTensor {
    #[must_use]
    pub fn new(kind: impl Into<String>, components: Vec<(String, Tensor)>) -> Self {
        Self {
            kind: kind.into(),
            components,
        }
    }

    pub fn tensors(&self) -> impl Iterator<Item = &Tensor> {
        self.components.iter().map(|(_, tensor)| tensor)
    }

    /// Rebuilds a subclass of the same kind from per-component results.
    #[must_use]
    pub fn with_components(&self, tensors: Vec<Tensor>) -> Self {
        Self {
            kind: self.kind.clone(),
            components: self
                .components
                .iter()
                .zip(tensors)
                .map(|((attr, _), tensor)| (attr.clone(), tensor))
                .collect(),
        }
    }

    pub fn map<F>(&self, mut f: F) -> Result<Self, TensorError>
    where
        F: FnMut(&Tensor) -> Result<Tensor, TensorError>,
    {
        let tensors = self.tensors().map(&mut f).collect::<Result<Vec<_>, _>>()?;
        Ok(self.with_components(tensors))
    }

    #[must_use]
    pub fn is_requires_grad(&self) -> bool {
        self.tensors().any(Tensor::is_requires_grad)
    }

    #[must_use]
    pub fn meta(&self) -> TensorValue {
        let components: Vec<ComponentMeta> = self
            .components
            .iter()
            .map(|(attr, tensor)| ComponentMeta {
                attr: attr.clone(),
                dtype: tensor.dtype(),
                layout: tensor.layout(),
                storage: tensor.storage_id(),
            })
            .collect();
        let outer = self
            .components
            .first()
            .map(|(_, tensor)| tensor.meta())
            .unwrap_or_else(|| {
                TensorValue::dense(DType::F32, Layout::contiguous(&[]), StorageId(0))
            });
        TensorValue {
            requires_grad: self.is_requires_grad(),
            subclass: Some(SubclassMeta {
                kind: self.kind.clone(),
                components,
            }),
            ..outer
        }
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Tensor(Tensor),
    Subclass(SubclassTensor),
    Scalar(Literal),
}

impl Value {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Tensor(_) => "tensor",
            Self::Subclass(_) => "subclass",
            Self::Scalar(_) => "scalar",
        }
    }

    #[must_use]
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Self::Tensor(tensor) => Some(tensor),
            Self::Subclass(_) | Self::Scalar(_) => None,
        }
    }

    pub fn expect_tensor(&self) -> Result<&Tensor, TensorError> {
        self.as_tensor()
            .ok_or(TensorError::NotDense { kind: self.kind() })
    }

    #[must_use]
    pub fn as_subclass(&self) -> Option<&SubclassTensor> {
        match self {
            Self::Subclass(subclass) => Some(subclass),
            Self::Tensor(_) | Self::Scalar(_) => None,
        }
    }

    #[must_use]
    pub fn as_scalar(&self) -> Option<Literal> {
        match self {
            Self::Scalar(literal) => Some(*literal),
            Self::Tensor(_) | Self::Subclass(_) => None,
        }
    }

    #[must_use]
    pub fn is_requires_grad(&self) -> bool {
        match self {
            Self::Tensor(tensor) => tensor.is_requires_grad(),
            Self::Subclass(subclass) => subclass.is_requires_grad(),
            Self::Scalar(_) => false,
        }
    }

    /// Identity comparison for tensors and subclasses.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Tensor(a), Self::Tensor(b)) => a.same(b),
            (Self::Subclass(a), Self::Subclass(b)) => {
                a.components.len() == b.components.len()
                    && a.tensors().zip(b.tensors()).all(|(x, y)| x.same(y))
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn meta(&self) -> ValueMeta {
        match self {
            Self::Tensor(tensor) => ValueMeta::Tensor(tensor.meta()),
            Self::Subclass(subclass) => ValueMeta::Tensor(subclass.meta()),
            Self::Scalar(_) => ValueMeta::SymInt,
        }
    }

    /// Logical elements, componentwise for subclasses.
    #[must_use]
    pub fn to_vecs(&self) -> Vec<Vec<f64>> {
        match self {
            Self::Tensor(tensor) => vec![tensor.to_vec()],
            Self::Subclass(subclass) => subclass.tensors().map(Tensor::to_vec).collect(),
            Self::Scalar(literal) => vec![vec![literal.as_f64()]],
        }
    }
}

impl From<Tensor> for Value {
    fn from(tensor: Tensor) -> Self {
        Self::Tensor(tensor)
    }
}

impl From<SubclassTensor> for Value {
    fn from(subclass: SubclassTensor) -> Self {
        Self::Subclass(subclass)
    }
}
