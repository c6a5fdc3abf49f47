#![forbid(unsafe_code)]

//! Mutation/alias analysis and the graph rewrites that remove mutation.
//!
//! Stages, in pipeline order: input deduplication, metadata collection,
//! synthetic bases for aliased mutated inputs, functionalization, and
//! subclass flattening.

pub mod collect;
pub mod dedupe;
pub mod functionalize;
pub mod metadata;
pub mod subclass;
pub mod synthetic_base;
mod tracker;

use af_core::{BuildError, TensorError, ValueId};
use thiserror::Error;

pub use collect::{CollectOptions, alias_groups, collect};
pub use dedupe::{DedupePlan, dedupe_inputs};
pub use functionalize::{FunctionalGraph, assert_functional_graph, functionalize};
pub use metadata::{
    AliasGroup, BaseRef, InputInfo, MutationKind, OutputClassification, OutputInfo, TrackedView,
    ViewMetadata, ViewStep, replay_on_tensor,
};
pub use subclass::{FlatGraph, SlotLayout, SubclassLayout, flatten, flatten_subclasses, unflatten};
pub use synthetic_base::{
    InputSource, SyntheticBaseBuilder, SyntheticBaseGroup, SyntheticBasePlan, SyntheticMember,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CollectError {
    #[error(
        "node {node_index} ({primitive}) mutates storage that set_ swapped away; \
         mutation of frozen/untracked storage"
    )]
    MutationOfFrozenStorage {
        node_index: usize,
        primitive: &'static str,
    },
    #[error(
        "node {node_index} ({primitive}) mutates the metadata of a tensor subclass; \
         subclasses support data mutation only"
    )]
    SubclassMetadataMutation {
        node_index: usize,
        primitive: &'static str,
    },
    #[error("node {node_index} ({primitive}) mutates a non-contiguous view of a tensor subclass")]
    NonContiguousSubclassMutation {
        node_index: usize,
        primitive: &'static str,
    },
    #[error(
        "node {node_index} ({primitive}) mutates input {input}, a leaf that requires grad"
    )]
    LeafInplace {
        node_index: usize,
        primitive: &'static str,
        input: usize,
    },
    #[error("input {input} has its data mutated before its storage is swapped by set_")]
    DataMutationBeforeStorageSwap { input: usize },
    #[error("value v{} is read before it is defined", .0.0)]
    UnknownValue(ValueId),
    #[error(transparent)]
    Build(#[from] BuildError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FunctionalizeError {
    #[error(transparent)]
    Collect(#[from] CollectError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("output {position} returns symbolic value v{} more than once", value.0)]
    DuplicateSymbolicOutput { position: usize, value: ValueId },
    #[error("node {node_index} ({primitive}) still mutates after functionalization")]
    NotFunctional {
        node_index: usize,
        primitive: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyntheticBaseError {
    #[error(
        "aliased inputs {inputs:?} are mutated and at least one is a tensor subclass; \
         unsupported aliased mutation"
    )]
    AliasedSubclassMutation { inputs: Vec<usize> },
    #[error(
        "aliased inputs {inputs:?} cannot be expressed as views of one base: {reason}; \
         unsupported aliased mutation"
    )]
    Undecomposable { inputs: Vec<usize>, reason: String },
    #[error("aliased input {input} has its storage swapped by set_; unsupported aliased mutation")]
    StorageSwap { input: usize },
    #[error("input {input} is listed in more than one alias group")]
    OverlappingGroups { input: usize },
    #[error("input position {input} is out of range for {len} inputs")]
    UnknownInput { input: usize, len: usize },
    #[error(transparent)]
    Build(#[from] BuildError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubclassError {
    #[error("{primitive} mixes subclass operands with {expected} and {actual} components")]
    ComponentMismatch {
        primitive: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("expected {expected} dense slots, got {actual}")]
    SlotCount { expected: usize, actual: usize },
    #[error("slot {slot} holds a {kind}, expected a dense tensor")]
    NotDense { slot: usize, kind: &'static str },
    #[error(
        "subclass metadata mismatch at position {position}: compiled for {expected}, got {actual}; \
         recompilation required"
    )]
    MetadataMismatch {
        position: usize,
        expected: String,
        actual: String,
    },
    #[error("value v{} has no flattened slots", .0.0)]
    UnknownValue(ValueId),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
}
