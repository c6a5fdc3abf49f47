use af_core::{ProgramSpec, Tensor, Value, build_program};
use af_dispatch::{CompileRequest, PipelineConfig, compile_default};
use af_partition::PartitionPolicy;
use criterion::{Criterion, criterion_group, criterion_main};

fn benchmark_compile(c: &mut Criterion) {
    let overlapping = build_program(ProgramSpec::OverlappingStrided)
        .expect("overlapping program should build");
    c.bench_function("compile/overlapping_strided", |b| {
        b.iter(|| {
            compile_default(&CompileRequest::new(overlapping.clone()))
                .expect("overlapping program should compile")
        });
    });

    let loss = build_program(ProgramSpec::PureLoss).expect("loss program should build");
    let min_cut = PipelineConfig {
        partition_policy: PartitionPolicy::MinCut,
        ..PipelineConfig::default()
    };
    c.bench_function("compile/pure_loss_min_cut", |b| {
        b.iter(|| {
            compile_default(&CompileRequest::new(loss.clone()).with_config(min_cut.clone()))
                .expect("loss program should compile")
        });
    });
}

fn benchmark_call(c: &mut Criterion) {
    let artifact = compile_default(&CompileRequest::new(
        build_program(ProgramSpec::MulThenScale).expect("program should build"),
    ))
    .expect("program should compile");
    c.bench_function("call/mul_then_scale", |b| {
        b.iter(|| {
            let a = Tensor::from_vec(&[1, 1], vec![1.0]).expect("tensor");
            let out = artifact
                .function
                .call(&[Value::Tensor(a)])
                .expect("call should succeed");
            assert_eq!(out[0].to_vecs(), vec![vec![6.0]]);
        });
    });
}

criterion_group!(pipeline_benches, benchmark_compile, benchmark_call);
criterion_main!(pipeline_benches);
