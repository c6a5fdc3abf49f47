#![forbid(unsafe_code)]

//! Splits a functional graph into forward and backward graphs.
//!
//! `build_joint` differentiates a functional forward graph into one joint
//! graph; `partition` cuts it into the two halves and decides which forward
//! values cross the boundary.

pub mod dce;
pub mod flow;
pub mod joint;
pub mod partition;

use af_core::{BuildError, ValueId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use dce::{dce_graph, live_nodes};
pub use joint::{JointGraph, build_joint, expand_mask, tangent_mask};
pub use partition::{
    Partition, PartitionOptions, PartitionPlan, PartitionPolicy, SavedKind, SavedValue,
    ValueRole, partition,
};

/// Where a mutating node in the backward region writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationScope {
    RequiresGrad,
    OutsideBackward,
    BackwardLocal,
}

impl MutationScope {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequiresGrad => "a value that requires grad",
            Self::OutsideBackward => "a value defined outside the backward",
            Self::BackwardLocal => "a backward-local value",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionError {
    #[error("tangent mask covers {actual} outputs, forward graph has {expected}")]
    MaskLength { expected: usize, actual: usize },
    #[error("forward node {node_index} ({primitive}) mutates; differentiate the functional graph")]
    MutationInForward {
        node_index: usize,
        primitive: &'static str,
    },
    #[error("node {node_index} ({primitive}) has no derivative rule: {reason}")]
    UnsupportedVjp {
        node_index: usize,
        primitive: &'static str,
        reason: String,
    },
    #[error("cotangent for v{} has sizes {actual:?}, expected {expected:?}", value.0)]
    CotangentShape {
        value: ValueId,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error(
        "backward node {node_index} ({primitive}) mutates v{}, {}",
        target.0,
        scope.as_str()
    )]
    BackwardMutation {
        node_index: usize,
        primitive: &'static str,
        target: ValueId,
        scope: MutationScope,
    },
    #[error("symbolic value v{} is both returned and saved", .0.0)]
    DuplicateSymbolicSave(ValueId),
    #[error("value v{} is not defined in the joint graph", .0.0)]
    UnknownValue(ValueId),
    #[error(transparent)]
    Build(#[from] BuildError),
}
