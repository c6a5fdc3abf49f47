//! Canned traced programs used by tests, benches and the conformance suite.

use serde::{Deserialize, Serialize};

use crate::builder::{BuildError, GraphBuilder};
use crate::layout::Layout;
use crate::{Graph, Primitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProgramSpec {
    /// `a.mul_(2); return a * 3` on a `[1, 1]` input.
    MulThenScale,
    /// `a_old = alias(a); a.set_(b); a.set_(a_old); return a + b`.
    SetRoundTrip,
    /// Two row blocks of one `[4, 4]` allocation, both mutated.
    DisjointSlices,
    /// Two stride-9 windows at offsets 0 and 24 of one allocation, both mutated.
    OverlappingStrided,
    /// `out = a * 3; return out.view(-1), out`.
    AliasOfIntermediate,
    /// `return a.unbind(0)` on a `[3, 3]` input.
    UnbindInput,
    /// `out = a * 3; return out.unbind(0)`.
    UnbindIntermediate,
    /// `a * 6 + b / 2` where `a` is a two-component subclass.
    SubclassAffine,
    /// `sum(relu(a * b) + cos(a))`: no mutation, no aliasing.
    PureLoss,
    /// `exp(a) - sin(b) * a`: elementwise, two outputs' worth of reuse.
    PureElementwise,
    /// `a.transpose_(0, 1); return a`.
    TransposeInplace,
    /// `a.mul_(2); a.transpose_(0, 1); return a.sum()`.
    MutateThenTranspose,
    /// `a.add_(1); return a.view(-1)`.
    ViewOfMutatedInput,
    /// `a[0].mul_(2); return a * 1`: mutation through a view of an input.
    MutateThroughView,
}

pub const ALL_PROGRAMS: &[ProgramSpec] = &[
    ProgramSpec::MulThenScale,
    ProgramSpec::SetRoundTrip,
    ProgramSpec::DisjointSlices,
    ProgramSpec::OverlappingStrided,
    ProgramSpec::AliasOfIntermediate,
    ProgramSpec::UnbindInput,
    ProgramSpec::UnbindIntermediate,
    ProgramSpec::SubclassAffine,
    ProgramSpec::PureLoss,
    ProgramSpec::PureElementwise,
    ProgramSpec::TransposeInplace,
    ProgramSpec::MutateThenTranspose,
    ProgramSpec::ViewOfMutatedInput,
    ProgramSpec::MutateThroughView,
];

impl ProgramSpec {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MulThenScale => "mul_then_scale",
            Self::SetRoundTrip => "set_round_trip",
            Self::DisjointSlices => "disjoint_slices",
            Self::OverlappingStrided => "overlapping_strided",
            Self::AliasOfIntermediate => "alias_of_intermediate",
            Self::UnbindInput => "unbind_input",
            Self::UnbindIntermediate => "unbind_intermediate",
            Self::SubclassAffine => "subclass_affine",
            Self::PureLoss => "pure_loss",
            Self::PureElementwise => "pure_elementwise",
            Self::TransposeInplace => "transpose_inplace",
            Self::MutateThenTranspose => "mutate_then_transpose",
            Self::ViewOfMutatedInput => "view_of_mutated_input",
            Self::MutateThroughView => "mutate_through_view",
        }
    }
}

/// Storage shared by the two view inputs of the aliasing programs.
const SHARED_STORAGE: crate::StorageId = crate::StorageId(1_000);

pub fn build_program(spec: ProgramSpec) -> Result<Graph, BuildError> {
    let mut b = GraphBuilder::new();
    let outputs = match spec {
        ProgramSpec::MulThenScale => {
            let a = b.input(&[1, 1], false);
            b.inplace_scalar(Primitive::MulInplace, a, 2.0)?;
            vec![b.scalar(Primitive::Mul, a, 3.0)?]
        }
        ProgramSpec::SetRoundTrip => {
            let a = b.input(&[2], false);
            let other = b.input(&[2], false);
            let a_old = b.unary(Primitive::Alias, a)?;
            let swapped = b.set_(a, other)?;
            let restored = b.set_(swapped, a_old)?;
            vec![b.binary(Primitive::Add, restored, other)?]
        }
        ProgramSpec::DisjointSlices => {
            let full = Layout::contiguous(&[4, 4]);
            let a = b.input_view(SHARED_STORAGE, full.slice(0, 0, 2, 1)?, false);
            let c = b.input_view(SHARED_STORAGE, full.slice(0, 2, 4, 1)?, false);
            b.inplace_scalar(Primitive::MulInplace, a, 3.0)?;
            b.inplace_scalar(Primitive::MulInplace, c, 2.0)?;
            let flat_a = b.view(a, &[-1])?;
            let flat_c = b.view(c, &[-1])?;
            vec![b.binary(Primitive::Add, flat_a, flat_c)?]
        }
        ProgramSpec::OverlappingStrided => {
            let storage = Layout::contiguous(&[64]);
            let a = b.input_view(SHARED_STORAGE, storage.as_strided(&[4, 4], &[9, 1], 0)?, false);
            let c = b.input_view(SHARED_STORAGE, storage.as_strided(&[4, 4], &[9, 1], 24)?, false);
            b.inplace_scalar(Primitive::MulInplace, a, 3.0)?;
            b.inplace_scalar(Primitive::MulInplace, c, 2.0)?;
            vec![b.binary(Primitive::Add, a, c)?]
        }
        ProgramSpec::AliasOfIntermediate => {
            let a = b.input(&[2, 2], true);
            let out = b.scalar(Primitive::Mul, a, 3.0)?;
            let flat = b.view(out, &[-1])?;
            vec![flat, out]
        }
        ProgramSpec::UnbindInput => {
            let a = b.input(&[3, 3], true);
            b.unbind(a, 0)?.to_vec()
        }
        ProgramSpec::UnbindIntermediate => {
            let a = b.input(&[3, 3], true);
            let out = b.scalar(Primitive::Mul, a, 3.0)?;
            b.unbind(out, 0)?.to_vec()
        }
        ProgramSpec::SubclassAffine => {
            let a = b.subclass_input("two_tensor", &["a", "b"], &[2, 2], false);
            let c = b.input(&[2, 2], false);
            let scaled = b.scalar(Primitive::Mul, a, 6.0)?;
            let halved = b.scalar(Primitive::Div, c, 2.0)?;
            vec![b.binary(Primitive::Add, scaled, halved)?]
        }
        ProgramSpec::PureLoss => {
            let a = b.input(&[3], true);
            let c = b.input(&[3], true);
            let prod = b.binary(Primitive::Mul, a, c)?;
            let act = b.unary(Primitive::Relu, prod)?;
            let cos = b.unary(Primitive::Cos, a)?;
            let total = b.binary(Primitive::Add, act, cos)?;
            vec![b.unary(Primitive::Sum, total)?]
        }
        ProgramSpec::PureElementwise => {
            let a = b.input(&[2, 3], true);
            let c = b.input(&[2, 3], true);
            let exp = b.unary(Primitive::Exp, a)?;
            let sin = b.unary(Primitive::Sin, c)?;
            let prod = b.binary(Primitive::Mul, sin, a)?;
            vec![b.binary(Primitive::Sub, exp, prod)?]
        }
        ProgramSpec::TransposeInplace => {
            let a = b.input(&[2, 3], false);
            vec![b.transpose_(a, 0, 1)?]
        }
        ProgramSpec::MutateThenTranspose => {
            let a = b.input(&[2, 3], false);
            let doubled = b.inplace_scalar(Primitive::MulInplace, a, 2.0)?;
            let transposed = b.transpose_(doubled, 0, 1)?;
            vec![b.unary(Primitive::Sum, transposed)?]
        }
        ProgramSpec::ViewOfMutatedInput => {
            let a = b.input(&[2, 2], false);
            b.inplace_scalar(Primitive::AddInplace, a, 1.0)?;
            vec![b.view(a, &[-1])?]
        }
        ProgramSpec::MutateThroughView => {
            let a = b.input(&[2, 3], false);
            let row = b.select(a, 0, 0)?;
            b.inplace_scalar(Primitive::MulInplace, row, 2.0)?;
            vec![b.scalar(Primitive::Mul, a, 1.0)?]
        }
    };
    Ok(b.finish(outputs))
}

#[cfg(test)]
mod tests {
    use super::{ALL_PROGRAMS, ProgramSpec, build_program};

    #[test]
    fn every_program_builds_and_validates() {
        for spec in ALL_PROGRAMS {
            let graph = build_program(*spec).expect(spec.as_str());
            graph.validate_well_formed().expect(spec.as_str());
        }
    }

    #[test]
    fn disjoint_slices_share_storage_without_aliasing() {
        let graph = build_program(ProgramSpec::DisjointSlices).expect("program");
        let inputs = graph.input_tensors();
        let (a, b) = (inputs[0].expect("a"), inputs[1].expect("b"));
        assert_eq!(a.storage, b.storage);
        assert!(!a.aliases(b, crate::DEFAULT_OVERLAP_ENUMERATION_LIMIT));
    }

    #[test]
    fn overlapping_windows_alias() {
        let graph = build_program(ProgramSpec::OverlappingStrided).expect("program");
        let inputs = graph.input_tensors();
        let (a, b) = (inputs[0].expect("a"), inputs[1].expect("b"));
        assert!(a.aliases(b, crate::DEFAULT_OVERLAP_ENUMERATION_LIMIT));
    }
}
