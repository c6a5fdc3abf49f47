#![forbid(unsafe_code)]

//! Call-time half of the pipeline: the backend seam, guards, the runtime
//! autograd engine, and the reconstructor that turns compiled graphs back
//! into the traced program's observable mutation and aliasing behavior.

pub mod autograd;
pub mod backend;
pub mod guards;
pub mod reconstruct;

use af_core::TensorError;
use af_functionalize::SubclassError;
use thiserror::Error;

pub use autograd::{CompiledFunctionNode, backward};
pub use backend::{Backend, BackendError, BackendRegistry, CompiledGraph};
pub use guards::{ArgSignature, GuardViolation, InputGuards};
pub use reconstruct::{CompiledFunction, RuntimeMetadata};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    #[error("guard violation: {0}")]
    Guard(#[from] GuardViolation),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Subclass(#[from] SubclassError),
    #[error("compiled graph returned {actual} values, expected {expected}")]
    OutputCount { expected: usize, actual: usize },
    #[error("got {actual} gradients for {expected} outputs")]
    GradientCount { expected: usize, actual: usize },
    #[error("element {position} of tensors does not require grad and does not have a grad_fn")]
    NoGradFn { position: usize },
    #[error(
        "saved value {index} needed for gradient computation has been modified by an inplace \
         operation: it is at version {current}, expected version {saved}"
    )]
    SavedValueModified { index: usize, saved: u64, current: u64 },
    #[error("no engine support for autograd node {0}")]
    UnknownNode(String),
    #[error("cannot write back input {position}: {detail}")]
    WriteBack { position: usize, detail: String },
}

impl RuntimeError {
    /// Guard violations mean the artifact is stale; everything else is final.
    #[must_use]
    pub fn is_guard_violation(&self) -> bool {
        matches!(
            self,
            Self::Guard(_) | Self::Subclass(SubclassError::MetadataMismatch { .. })
        )
    }
}
