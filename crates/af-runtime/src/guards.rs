//! Call-time checks that a compiled artifact still matches its call site.
//!
//! Every violation is fatal for the artifact: the caller discards it and
//! recompiles.

use af_core::{DType, Graph, Layout, Value, ValueMeta};
use af_functionalize::{DedupePlan, SlotLayout, SyntheticBasePlan};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum GuardViolation {
    #[error("compiled for {expected} arguments, called with {actual}")]
    ArgumentCount { expected: usize, actual: usize },
    #[error(
        "duplicate-input assumption violated: compiled for pattern {expected:?}, got {actual:?}"
    )]
    DuplicateInputs {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error(
        "storage-sharing assumption violated: compiled for pattern {expected:?}, got {actual:?}"
    )]
    StorageSharing {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("input {position}: compiled with requires_grad={expected}, called with {actual}")]
    RequiresGrad {
        position: usize,
        expected: bool,
        actual: bool,
    },
    #[error("input {position}: compiled for a {expected}, called with a {actual}")]
    InputSubclass {
        position: usize,
        expected: String,
        actual: String,
    },
    #[error(
        "gradient for output {output}: compiled for a {expected}, got a {actual}; \
         subclass metadata mismatch, recompilation required"
    )]
    GradientSubclass {
        output: usize,
        expected: String,
        actual: String,
    },
    #[error(
        "input {position}: compiled for dtype {}, called with {}",
        expected.as_str(),
        actual.as_str()
    )]
    InputDtype {
        position: usize,
        expected: DType,
        actual: DType,
    },
    #[error(
        "input {position}: compiled for sizes {:?} strides {:?}, called with sizes {:?} strides {:?}",
        expected.sizes, expected.strides, actual.sizes, actual.strides
    )]
    InputLayout {
        position: usize,
        expected: Layout,
        actual: Layout,
    },
    #[error(
        "input {position}: storage offset {actual} differs from {expected}, \
         which an aliased-input base depends on"
    )]
    InputOffset {
        position: usize,
        expected: usize,
        actual: usize,
    },
}

impl GuardViolation {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ArgumentCount { .. } => "argument_count",
            Self::DuplicateInputs { .. } => "duplicate_inputs",
            Self::StorageSharing { .. } => "storage_sharing",
            Self::RequiresGrad { .. } => "requires_grad",
            Self::InputSubclass { .. } => "input_subclass",
            Self::GradientSubclass { .. } => "gradient_subclass",
            Self::InputDtype { .. } => "input_dtype",
            Self::InputLayout { .. } => "input_layout",
            Self::InputOffset { .. } => "input_offset",
        }
    }
}

/// What the compiled artifact assumed about one caller argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSignature {
    pub slot: SlotLayout,
    pub dtype: Option<DType>,
    pub layout: Option<Layout>,
    pub requires_grad: bool,
    /// The storage offset must match exactly.
    pub pin_offset: bool,
}

impl ArgSignature {
    #[must_use]
    pub fn of_meta(meta: &ValueMeta) -> Self {
        let tensor = meta.as_tensor();
        Self {
            slot: SlotLayout::of_meta(meta),
            dtype: tensor.map(|tensor| tensor.dtype),
            layout: tensor.map(|tensor| tensor.layout.clone()),
            requires_grad: meta.requires_grad(),
            pin_offset: false,
        }
    }

    fn check(&self, position: usize, actual: &ArgSignature) -> Result<(), GuardViolation> {
        if self.slot != actual.slot {
            return Err(GuardViolation::InputSubclass {
                position,
                expected: self.slot.describe(),
                actual: actual.slot.describe(),
            });
        }
        if self.requires_grad != actual.requires_grad {
            return Err(GuardViolation::RequiresGrad {
                position,
                expected: self.requires_grad,
                actual: actual.requires_grad,
            });
        }
        if let (Some(expected), Some(found)) = (self.dtype, actual.dtype)
            && expected != found
        {
            return Err(GuardViolation::InputDtype {
                position,
                expected,
                actual: found,
            });
        }
        if let (Some(expected), Some(found)) = (&self.layout, &actual.layout) {
            if expected.sizes != found.sizes || expected.strides != found.strides {
                return Err(GuardViolation::InputLayout {
                    position,
                    expected: expected.clone(),
                    actual: found.clone(),
                });
            }
            if self.pin_offset && expected.storage_offset != found.storage_offset {
                return Err(GuardViolation::InputOffset {
                    position,
                    expected: expected.storage_offset,
                    actual: found.storage_offset,
                });
            }
        }
        Ok(())
    }
}

/// For every position, the first position holding the same view.
fn duplicate_pattern(metas: &[ValueMeta]) -> Vec<usize> {
    let mut pattern = Vec::with_capacity(metas.len());
    for (position, meta) in metas.iter().enumerate() {
        let first = meta.as_tensor().and_then(|tensor| {
            metas[..position].iter().position(|earlier| {
                earlier.as_tensor().is_some_and(|candidate| {
                    candidate.same_view(tensor) && candidate.subclass == tensor.subclass
                })
            })
        });
        pattern.push(first.unwrap_or(position));
    }
    pattern
}

/// For every position, the first position on the same storage.
fn storage_pattern(metas: &[ValueMeta]) -> Vec<usize> {
    let mut pattern = Vec::with_capacity(metas.len());
    for (position, meta) in metas.iter().enumerate() {
        let first = meta.as_tensor().and_then(|tensor| {
            metas[..position].iter().position(|earlier| {
                earlier
                    .as_tensor()
                    .is_some_and(|candidate| candidate.storage == tensor.storage)
            })
        });
        pattern.push(first.unwrap_or(position));
    }
    pattern
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputGuards {
    pub args: Vec<ArgSignature>,
    pub duplicates: Vec<usize>,
    pub storages: Vec<usize>,
}

impl InputGuards {
    /// Guards for `graph`, the traced graph over caller positions.
    /// Members of a synthetic base (positions of the deduplicated graph) get
    /// their offsets pinned.
    #[must_use]
    pub fn new(
        graph: &Graph,
        dedupe: &DedupePlan,
        synthetic_base: Option<&SyntheticBasePlan>,
    ) -> Self {
        let metas: Vec<ValueMeta> = graph
            .inputs
            .iter()
            .map(|id| graph.meta(*id).cloned().unwrap_or(ValueMeta::SymInt))
            .collect();
        let mut args: Vec<ArgSignature> = metas.iter().map(ArgSignature::of_meta).collect();
        if let Some(plan) = synthetic_base {
            let members = plan.groups.iter().flat_map(|group| &group.members);
            for member in members {
                for (position, source) in dedupe.source.iter().enumerate() {
                    if *source == member.input {
                        args[position].pin_offset = true;
                    }
                }
            }
        }
        Self {
            args,
            duplicates: duplicate_pattern(&metas),
            storages: storage_pattern(&metas),
        }
    }

    pub fn check(&self, args: &[Value]) -> Result<(), GuardViolation> {
        if args.len() != self.args.len() {
            return Err(GuardViolation::ArgumentCount {
                expected: self.args.len(),
                actual: args.len(),
            });
        }
        let metas: Vec<ValueMeta> = args.iter().map(Value::meta).collect();
        for (position, (expected, meta)) in self.args.iter().zip(&metas).enumerate() {
            expected.check(position, &ArgSignature::of_meta(meta))?;
        }
        let duplicates = duplicate_pattern(&metas);
        if duplicates != self.duplicates {
            return Err(GuardViolation::DuplicateInputs {
                expected: self.duplicates.clone(),
                actual: duplicates,
            });
        }
        let storages = storage_pattern(&metas);
        if storages != self.storages {
            return Err(GuardViolation::StorageSharing {
                expected: self.storages.clone(),
                actual: storages,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{GuardViolation, InputGuards};
    use af_core::{DType, GraphBuilder, Layout, Primitive, Tensor, Value, ValueMeta};
    use af_functionalize::{DedupePlan, dedupe_inputs};

    fn tensor(sizes: &[usize]) -> Tensor {
        Tensor::zeros(sizes)
    }

    fn two_inputs(requires_grad: bool) -> af_core::Graph {
        let mut b = GraphBuilder::new();
        let x = b.input(&[2, 2], requires_grad);
        let y = b.input(&[2, 2], false);
        let out = b.binary(Primitive::Add, x, y).expect("add");
        b.finish(vec![out])
    }

    #[test]
    fn matching_arguments_pass() {
        let graph = two_inputs(true);
        let guards = InputGuards::new(&graph, &DedupePlan::identity(2), None);
        let args = [
            Value::Tensor(tensor(&[2, 2]).requires_grad(true)),
            Value::Tensor(tensor(&[2, 2])),
        ];
        guards.check(&args).expect("guards hold");
    }

    #[test]
    fn requires_grad_flip_is_reported_with_position() {
        let graph = two_inputs(false);
        let guards = InputGuards::new(&graph, &DedupePlan::identity(2), None);
        let args = [
            Value::Tensor(tensor(&[2, 2])),
            Value::Tensor(tensor(&[2, 2]).requires_grad(true)),
        ];
        assert_eq!(
            guards.check(&args),
            Err(GuardViolation::RequiresGrad {
                position: 1,
                expected: false,
                actual: true,
            })
        );
    }

    #[test]
    fn layout_and_arity_changes_are_violations() {
        let graph = two_inputs(false);
        let guards = InputGuards::new(&graph, &DedupePlan::identity(2), None);
        let err = guards
            .check(&[Value::Tensor(tensor(&[2, 2])), Value::Tensor(tensor(&[4]))])
            .expect_err("layout");
        assert_eq!(err.kind(), "input_layout");
        assert!(err.to_string().contains("input 1"));

        let err = guards.check(&[Value::Tensor(tensor(&[2, 2]))]).expect_err("arity");
        assert_eq!(
            err,
            GuardViolation::ArgumentCount {
                expected: 2,
                actual: 1,
            }
        );
    }

    #[test]
    fn passing_one_tensor_twice_breaks_the_duplicate_pattern() {
        let graph = two_inputs(false);
        let guards = InputGuards::new(&graph, &DedupePlan::identity(2), None);
        let shared = tensor(&[2, 2]);
        let err = guards
            .check(&[Value::Tensor(shared.clone()), Value::Tensor(shared)])
            .expect_err("duplicate");
        assert_eq!(
            err,
            GuardViolation::DuplicateInputs {
                expected: vec![0, 1],
                actual: vec![0, 0],
            }
        );
    }

    #[test]
    fn compiled_duplicates_must_stay_duplicates() {
        let mut b = GraphBuilder::new();
        let a = b.input(&[3], false);
        let meta = b.meta(a).expect("meta").clone();
        let again = b.input_meta(meta);
        let out = b.binary(Primitive::Add, a, again).expect("add");
        let graph = b.finish(vec![out]);
        let (_, plan) = dedupe_inputs(&graph).expect("dedupe");
        let guards = InputGuards::new(&graph, &plan, None);
        assert_eq!(guards.duplicates, vec![0, 0]);

        let x = tensor(&[3]);
        guards
            .check(&[Value::Tensor(x.clone()), Value::Tensor(x)])
            .expect("same tensor twice");
        let err = guards
            .check(&[Value::Tensor(tensor(&[3])), Value::Tensor(tensor(&[3]))])
            .expect_err("distinct tensors");
        assert_eq!(err.kind(), "duplicate_inputs");
    }

    #[test]
    fn subclass_where_dense_was_compiled_is_rejected() {
        let graph = two_inputs(false);
        let guards = InputGuards::new(&graph, &DedupePlan::identity(2), None);
        let subclass = af_core::SubclassTensor::new(
            "two_tensor",
            vec![("a".to_owned(), tensor(&[2, 2])), ("b".to_owned(), tensor(&[2, 2]))],
        );
        let err = guards
            .check(&[Value::Subclass(subclass), Value::Tensor(tensor(&[2, 2]))])
            .expect_err("subclass");
        assert!(matches!(
            err,
            GuardViolation::InputSubclass { position: 0, .. }
        ));
    }

    #[test]
    fn dtype_is_guarded() {
        let mut b = GraphBuilder::new();
        b.input_meta(ValueMeta::Tensor(af_core::TensorValue::dense(
            DType::F64,
            Layout::contiguous(&[2]),
            af_core::StorageId(7),
        )));
        let graph = b.finish(vec![]);
        let guards = InputGuards::new(&graph, &DedupePlan::identity(1), None);
        let err = guards.check(&[Value::Tensor(tensor(&[2]))]).expect_err("dtype");
        assert_eq!(
            err,
            GuardViolation::InputDtype {
                position: 0,
                expected: DType::F64,
                actual: DType::F32,
            }
        );
    }
}
