//! Runtime guards: calls that break a compile-time assumption are refused by
//! the compiled function and recompiled by `aot_function`.

use af_api::{ApiError, aot_graph};
use af_core::{
    Graph, GraphBuilder, Primitive, ProgramSpec, SubclassTensor, Tensor, Value, build_program,
};
use af_dispatch::{CompileRequest, CompiledArtifact, compile_default};
use af_runtime::{GuardViolation, RuntimeError, backward};

fn compile(graph: Graph) -> CompiledArtifact {
    compile_default(&CompileRequest::new(graph)).expect("compile")
}

fn violation(err: RuntimeError) -> GuardViolation {
    match err {
        RuntimeError::Guard(violation) => violation,
        other => panic!("expected a guard violation, got {other:?}"),
    }
}

fn add_then_scale() -> Graph {
    let mut b = GraphBuilder::new();
    let a = b.input(&[2], false);
    let c = b.input(&[2], false);
    b.inplace_scalar(Primitive::AddInplace, a, 1.0).expect("add_");
    let out = b.scalar(Primitive::Mul, c, 2.0).expect("mul");
    b.finish(vec![out])
}

#[test]
fn requires_grad_flip_is_refused_then_recompiled() {
    let graph = build_program(ProgramSpec::PureLoss).expect("program");
    let artifact = compile(graph.clone());
    let args = |rg: bool| {
        vec![
            Value::Tensor(Tensor::full(&[3], 1.0).requires_grad(true)),
            Value::Tensor(Tensor::full(&[3], 1.0).requires_grad(rg)),
        ]
    };
    let err = artifact.function.call(&args(false)).expect_err("flip");
    assert_eq!(violation(err).kind(), "requires_grad");

    let f = aot_graph(graph);
    f.call(&args(true)).expect("compiled with gradients");
    f.call(&args(false)).expect("compiled without");
    assert_eq!(f.compilations(), 2);
}

#[test]
fn distinct_inputs_compiled_artifact_refuses_one_tensor_twice() {
    let artifact = compile(add_then_scale());
    let x = Tensor::from_vec(&[2], vec![1.0, 2.0]).expect("x");
    let err = artifact
        .function
        .call(&[Value::Tensor(x.clone()), Value::Tensor(x.clone())])
        .expect_err("duplicate");
    assert_eq!(
        violation(err),
        GuardViolation::DuplicateInputs {
            expected: vec![0, 1],
            actual: vec![0, 0],
        }
    );
    // refused before anything ran
    assert_eq!(x.to_vec(), vec![1.0, 2.0]);
}

#[test]
fn independent_storages_break_a_shared_storage_artifact() {
    let artifact = compile(build_program(ProgramSpec::DisjointSlices).expect("program"));
    let slice = || {
        Tensor::zeros(&[16])
            .as_strided(&[2, 4], &[4, 1], 0)
            .expect("slice")
    };
    let err = artifact
        .function
        .call(&[Value::Tensor(slice()), Value::Tensor(slice())])
        .expect_err("storages");
    assert_eq!(violation(err).kind(), "storage_sharing");
}

#[test]
fn shifted_synthetic_base_member_is_refused() {
    let artifact = compile(build_program(ProgramSpec::OverlappingStrided).expect("program"));
    let base = Tensor::zeros(&[80]);
    let a = base.as_strided(&[4, 4], &[9, 1], 1).expect("a");
    let c = base.as_strided(&[4, 4], &[9, 1], 25).expect("c");
    let err = artifact
        .function
        .call(&[Value::Tensor(a), Value::Tensor(c)])
        .expect_err("offset");
    assert!(err.is_guard_violation());
    assert_eq!(violation(err).kind(), "input_offset");
    assert_eq!(base.to_vec(), vec![0.0; 80]);
}

#[test]
fn dense_argument_for_a_subclass_slot_is_refused() {
    let artifact = compile(build_program(ProgramSpec::SubclassAffine).expect("program"));
    let err = artifact
        .function
        .call(&[
            Value::Tensor(Tensor::zeros(&[2, 2])),
            Value::Tensor(Tensor::zeros(&[2, 2])),
        ])
        .expect_err("subclass slot");
    assert_eq!(violation(err).kind(), "input_subclass");
}

#[test]
fn dense_gradient_for_a_subclass_output_is_refused() {
    let mut b = GraphBuilder::new();
    let a = b.subclass_input("two_tensor", &["a", "b"], &[2], true);
    let out = b.scalar(Primitive::Mul, a, 2.0).expect("mul");
    let artifact = compile(b.finish(vec![out]));

    let component = || Tensor::full(&[2], 1.0).requires_grad(true);
    let input = SubclassTensor::new(
        "two_tensor",
        vec![("a".to_owned(), component()), ("b".to_owned(), component())],
    );
    let out = artifact
        .function
        .call(&[Value::Subclass(input)])
        .expect("call");
    assert!(out[0].as_subclass().is_some());

    let err = backward(&out, &[Value::Tensor(Tensor::full(&[2], 1.0))])
        .expect_err("gradient subclass");
    assert!(err.is_guard_violation());
    match violation(err) {
        GuardViolation::GradientSubclass {
            output,
            expected,
            actual,
        } => {
            assert_eq!(output, 0);
            assert_eq!(expected, "two_tensor[a, b]");
            assert_eq!(actual, "dense tensor");
        }
        other => panic!("unexpected violation {other:?}"),
    }
}

#[test]
fn api_recompiles_once_for_a_changed_offset() {
    let f = aot_graph(build_program(ProgramSpec::OverlappingStrided).expect("program"));
    let call = |offset: i64| {
        let base = Tensor::zeros(&[80]);
        let a = base.as_strided(&[4, 4], &[9, 1], offset).expect("a");
        let c = base.as_strided(&[4, 4], &[9, 1], offset + 24).expect("c");
        f.call(&[Value::Tensor(a), Value::Tensor(c)])
    };
    call(0).expect("first");
    call(2).expect("recompiled");
    assert_eq!(f.compilations(), 2);
    assert_eq!(f.cached_artifacts(), 1);
}

#[test]
fn api_errors_keep_their_guard_classification() {
    let err = ApiError::StaleAfterRecompile(RuntimeError::Guard(GuardViolation::ArgumentCount {
        expected: 1,
        actual: 2,
    }));
    assert!(err.is_guard_violation());
    assert!(err.to_string().contains("argument"), "{err}");
}
