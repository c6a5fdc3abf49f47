#![forbid(unsafe_code)]

pub mod errors;
pub mod function;

pub use af_dispatch::PipelineConfig;
pub use af_runtime::backward;
pub use errors::ApiError;
pub use function::{AotFunction, RecordedProgram, Tracer, aot_function, aot_graph};

#[cfg(test)]
mod tests {
    use super::*;
    use af_core::{
        BuildError, Graph, GraphBuilder, Primitive, ProgramSpec, Tensor, Value, ValueMeta,
        build_program,
    };

    fn mul_then_scale(metas: &[ValueMeta]) -> Result<Graph, BuildError> {
        let mut b = GraphBuilder::new();
        let a = b.input_meta(metas[0].clone());
        b.inplace_scalar(Primitive::MulInplace, a, 2.0)?;
        let out = b.scalar(Primitive::Mul, a, 3.0)?;
        Ok(b.finish(vec![out]))
    }

    fn tensor(sizes: &[usize], values: &[f64]) -> Tensor {
        Tensor::from_vec(sizes, values.to_vec()).expect("tensor")
    }

    #[test]
    fn mutation_is_replayed_and_artifact_reused() {
        let f = aot_function(mul_then_scale);
        for _ in 0..2 {
            let a = tensor(&[1, 1], &[1.0]);
            let out = f.call(&[Value::Tensor(a.clone())]).expect("call");
            assert_eq!(a.to_vec(), vec![2.0]);
            assert_eq!(out[0].to_vecs(), vec![vec![6.0]]);
        }
        assert_eq!(f.compilations(), 1);
        assert_eq!(f.cached_artifacts(), 1);
    }

    #[test]
    fn new_shapes_compile_new_artifacts() {
        let f = aot_function(mul_then_scale);
        f.call(&[Value::Tensor(tensor(&[1, 1], &[1.0]))]).expect("first");
        let wide = tensor(&[1, 3], &[1.0, 2.0, 3.0]);
        let out = f.call(&[Value::Tensor(wide.clone())]).expect("second");
        assert_eq!(out[0].to_vecs(), vec![vec![6.0, 12.0, 18.0]]);
        assert_eq!(wide.to_vec(), vec![2.0, 4.0, 6.0]);
        assert_eq!(f.compilations(), 2);
        f.invalidate_all();
        assert_eq!(f.cached_artifacts(), 0);
    }

    #[test]
    fn duplicated_arguments_get_their_own_artifact() {
        let mut b = GraphBuilder::new();
        let a = b.input(&[2], false);
        let c = b.input(&[2], false);
        b.inplace_scalar(Primitive::AddInplace, a, 1.0).expect("add_");
        let out = b.scalar(Primitive::Mul, c, 2.0).expect("mul");
        let f = aot_graph(b.finish(vec![out]));

        let x = tensor(&[2], &[1.0, 2.0]);
        let out = f
            .call(&[Value::Tensor(x.clone()), Value::Tensor(x.clone())])
            .expect("duplicated");
        assert_eq!(x.to_vec(), vec![2.0, 3.0]);
        assert_eq!(out[0].to_vecs(), vec![vec![4.0, 6.0]]);

        let (y, z) = (tensor(&[2], &[1.0, 2.0]), tensor(&[2], &[1.0, 2.0]));
        let out = f
            .call(&[Value::Tensor(y.clone()), Value::Tensor(z.clone())])
            .expect("distinct");
        assert_eq!(y.to_vec(), vec![2.0, 3.0]);
        assert_eq!(z.to_vec(), vec![1.0, 2.0]);
        assert_eq!(out[0].to_vecs(), vec![vec![2.0, 4.0]]);
        assert_eq!(f.compilations(), 2);
    }

    #[test]
    fn stale_guards_trigger_one_recompile() {
        let f = aot_graph(build_program(ProgramSpec::OverlappingStrided).expect("program"));
        let windows = |offset: i64| {
            let base = Tensor::from_vec(&[80], (0..80).map(f64::from).collect()).expect("base");
            let a = base.as_strided(&[4, 4], &[9, 1], offset).expect("a");
            let c = base.as_strided(&[4, 4], &[9, 1], offset + 24).expect("c");
            (base, vec![Value::Tensor(a), Value::Tensor(c)])
        };

        let (_, args) = windows(0);
        f.call(&args).expect("first call");
        assert_eq!(f.compilations(), 1);

        let (base, args) = windows(1);
        let graph = build_program(ProgramSpec::OverlappingStrided).expect("program");
        let (eager_base, eager_args) = windows(1);
        let retraced = GraphBuilder::retrace(
            &graph,
            eager_args.iter().map(Value::meta).collect(),
        )
        .expect("retrace");
        let eager = af_interpreters::eval_graph(&retraced, &eager_args).expect("eager");

        let out = f.call(&args).expect("shifted call recompiles");
        assert_eq!(f.compilations(), 2);
        assert_eq!(out[0].to_vecs(), eager[0].to_vecs());
        assert_eq!(base.to_vec(), eager_base.to_vec());
    }

    #[test]
    fn gradients_flow_through_the_compiled_backward() {
        let f = aot_graph(build_program(ProgramSpec::PureLoss).expect("program"))
            .with_loss_outputs(vec![0]);
        let a = tensor(&[3], &[1.0, 2.0, 3.0]).requires_grad(true);
        let c = tensor(&[3], &[1.0, -1.0, 2.0]).requires_grad(true);
        let out = f
            .call(&[Value::Tensor(a.clone()), Value::Tensor(c.clone())])
            .expect("call");
        backward(&out, &[Value::Tensor(Tensor::scalar(1.0))]).expect("backward");

        let grad_a = a.grad().expect("a grad").to_vec();
        let expected_a = [1.0 - 1f64.sin(), -(2f64.sin()), 2.0 - 3f64.sin()];
        for (got, want) in grad_a.iter().zip(expected_a) {
            assert!((got - want).abs() < 1e-12, "{got} vs {want}");
        }
        assert_eq!(c.grad().expect("c grad").to_vec(), vec![1.0, 0.0, 3.0]);
    }

    #[test]
    fn unsupported_programs_surface_directly() {
        let f = aot_function(|metas: &[ValueMeta]| -> Result<Graph, BuildError> {
            let mut b = GraphBuilder::new();
            let a = b.input_meta(metas[0].clone());
            let transposed = b.transpose_(a, 0, 1)?;
            Ok(b.finish(vec![transposed]))
        });
        let sub = af_core::SubclassTensor::new(
            "two_tensor",
            vec![
                ("a".to_owned(), Tensor::zeros(&[2, 2])),
                ("b".to_owned(), Tensor::zeros(&[2, 2])),
            ],
        );
        let err = f.call(&[Value::Subclass(sub)]).expect_err("subclass metadata mutation");
        match err {
            ApiError::Dispatch(inner) => assert!(inner.is_unsupported_program(), "{inner}"),
            other => panic!("expected dispatch error, got {other}"),
        }
        assert_eq!(f.cached_artifacts(), 0);
    }
}
