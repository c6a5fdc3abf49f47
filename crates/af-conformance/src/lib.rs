#![forbid(unsafe_code)]

//! Eager-vs-compiled parity harness.
//!
//! Every case runs one traced program twice on identical inputs: once through
//! the interpreter (eager reference) and once through the compile pipeline
//! and runtime. Outputs, input mutations and, where outputs require grad,
//! gradients are compared. Eager execution records no gradients, so the
//! gradient reference is a central finite difference over the eager program.

use std::collections::BTreeMap;
use std::sync::Arc;

use af_core::{
    BuildError, Graph, Layout, ProgramSpec, Storage, StorageId, SubclassTensor, Tensor,
    TensorError, Value, ValueMeta, build_program,
};
use af_dispatch::{CompileRequest, DispatchError, PipelineConfig, compile_default};
use af_interpreters::{EvalError, eval_graph};
use af_runtime::RuntimeError;
use af_test_utils::fill_values;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const PARITY_REPORT_SCHEMA_VERSION: &str = "aotflow.parity-report.v1";

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("input {position} is a symbolic integer; the harness only materializes tensors")]
    SymbolicInput { position: usize },
    #[error("program failed to build: {0}")]
    Build(#[from] BuildError),
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error("eager execution failed: {0}")]
    Eager(#[from] EvalError),
    #[error("compile failed: {0}")]
    Compile(#[from] DispatchError),
    #[error("compiled call failed: {0}")]
    Runtime(#[from] RuntimeError),
}

#[derive(Debug, Clone)]
pub struct ParityConfig {
    pub pipeline: PipelineConfig,
    pub seed: u64,
    pub atol: f64,
    /// Finite-difference gradient tolerance.
    pub grad_atol: f64,
    pub check_gradients: bool,
}

impl Default for ParityConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            seed: 0,
            atol: 1e-12,
            grad_atol: 1e-5,
            check_gradients: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftClassification {
    Pass,
    Regression,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum GradientCheck {
    NotApplicable,
    Matched { max_error: f64 },
    Mismatch { max_error: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseReport {
    pub program: String,
    pub drift: DriftClassification,
    pub outputs_match: bool,
    pub inputs_match: bool,
    pub gradients: GradientCheck,
    pub cache_key: Option<String>,
    pub error: Option<String>,
}

impl CaseReport {
    #[must_use]
    pub fn passed(&self) -> bool {
        self.drift == DriftClassification::Pass
    }

    fn failed(program: &str, error: &HarnessError) -> Self {
        Self {
            program: program.to_owned(),
            drift: DriftClassification::Error,
            outputs_match: false,
            inputs_match: false,
            gradients: GradientCheck::NotApplicable,
            cache_key: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParityReport {
    pub schema_version: String,
    pub total: usize,
    pub passed: usize,
    pub cases: Vec<CaseReport>,
}

impl ParityReport {
    #[must_use]
    pub fn from_cases(cases: Vec<CaseReport>) -> Self {
        Self {
            schema_version: PARITY_REPORT_SCHEMA_VERSION.to_owned(),
            total: cases.len(),
            passed: cases.iter().filter(|case| case.passed()).count(),
            cases,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = format!(
            "# Parity report\n\n{}/{} cases pass.\n\n| program | drift | outputs | inputs | gradients |\n|---|---|---|---|---|\n",
            self.passed, self.total
        );
        for case in &self.cases {
            let gradients = match &case.gradients {
                GradientCheck::NotApplicable => "n/a".to_owned(),
                GradientCheck::Matched { max_error } => format!("ok ({max_error:.1e})"),
                GradientCheck::Mismatch { max_error } => format!("MISMATCH ({max_error:.1e})"),
            };
            out.push_str(&format!(
                "| {} | {:?} | {} | {} | {} |\n",
                case.program, case.drift, case.outputs_match, case.inputs_match, gradients
            ));
        }
        out
    }
}

/// Build concrete arguments matching the graph's input metadata. Inputs that
/// share a storage id share one allocation, so traced aliasing is reproduced.
pub fn materialize_inputs(graph: &Graph, seed: u64) -> Result<Vec<Value>, HarnessError> {
    materialize(graph, seed, true)
}

fn materialize(graph: &Graph, seed: u64, keep_grad: bool) -> Result<Vec<Value>, HarnessError> {
    let metas: Vec<&ValueMeta> = graph.inputs.iter().filter_map(|id| graph.meta(*id)).collect();

    let mut extents: BTreeMap<StorageId, usize> = BTreeMap::new();
    let mut note = |storage: StorageId, layout: &Layout| {
        let needed = layout.max_offset().map_or(0, |last| last + 1);
        let entry = extents.entry(storage).or_insert(0);
        *entry = (*entry).max(needed);
    };
    for meta in &metas {
        if let ValueMeta::Tensor(tensor) = meta {
            match &tensor.subclass {
                Some(subclass) => {
                    for component in &subclass.components {
                        note(component.storage, &component.layout);
                    }
                }
                None => note(tensor.storage, &tensor.layout),
            }
        }
    }
    let storages: BTreeMap<StorageId, Arc<Storage>> = extents
        .iter()
        .enumerate()
        .map(|(index, (id, len))| (*id, Storage::new(fill_values(*len, seed + index as u64))))
        .collect();
    let storage = |id: StorageId| Arc::clone(&storages[&id]);

    metas
        .iter()
        .enumerate()
        .map(|(position, meta)| {
            let ValueMeta::Tensor(tensor) = meta else {
                return Err(HarnessError::SymbolicInput { position });
            };
            let requires_grad = keep_grad && tensor.requires_grad;
            match &tensor.subclass {
                Some(subclass) => {
                    let components = subclass
                        .components
                        .iter()
                        .map(|c| {
                            let dense =
                                Tensor::from_parts(storage(c.storage), c.layout.clone(), c.dtype)?
                                    .requires_grad(requires_grad);
                            Ok((c.attr.clone(), dense))
                        })
                        .collect::<Result<Vec<_>, HarnessError>>()?;
                    Ok(Value::Subclass(SubclassTensor::new(subclass.kind.clone(), components)))
                }
                None => {
                    let dense = Tensor::from_parts(
                        storage(tensor.storage),
                        tensor.layout.clone(),
                        tensor.dtype,
                    )?;
                    Ok(Value::Tensor(dense.requires_grad(requires_grad)))
                }
            }
        })
        .collect()
}

pub fn run_program(spec: ProgramSpec, config: &ParityConfig) -> CaseReport {
    match build_program(spec) {
        Ok(graph) => run_graph(spec.as_str(), &graph, config),
        Err(err) => CaseReport::failed(spec.as_str(), &err.into()),
    }
}

pub fn run_graph(name: &str, graph: &Graph, config: &ParityConfig) -> CaseReport {
    match try_run_graph(name, graph, config) {
        Ok(report) => report,
        Err(err) => {
            tracing::warn!(program = name, error = %err, "parity case failed to run");
            CaseReport::failed(name, &err)
        }
    }
}

fn try_run_graph(
    name: &str,
    graph: &Graph,
    config: &ParityConfig,
) -> Result<CaseReport, HarnessError> {
    // Eager runs without grad so that programs mutating differentiable
    // inputs still have a reference; the compiled side keeps the flags.
    let eager_args = materialize(graph, config.seed, false)?;
    let eager = eval_graph(graph, &eager_args)?;

    let artifact = compile_default(
        &CompileRequest::new(graph.clone()).with_config(config.pipeline.clone()),
    )?;
    let args = materialize_inputs(graph, config.seed)?;
    let compiled = artifact.function.call(&args)?;

    let outputs_match = values_match(&eager, &compiled, config.atol);
    let inputs_match = values_match(&eager_args, &args, config.atol);

    let gradients = if config.check_gradients {
        check_gradients(graph, config, &args, &compiled)?
    } else {
        GradientCheck::NotApplicable
    };
    let gradients_ok = !matches!(gradients, GradientCheck::Mismatch { .. });

    let drift = if outputs_match && inputs_match && gradients_ok {
        DriftClassification::Pass
    } else {
        DriftClassification::Regression
    };
    tracing::debug!(program = name, ?drift, "parity case finished");
    Ok(CaseReport {
        program: name.to_owned(),
        drift,
        outputs_match,
        inputs_match,
        gradients,
        cache_key: Some(artifact.cache_key.as_string()),
        error: None,
    })
}

pub fn run_suite(programs: &[ProgramSpec], config: &ParityConfig) -> ParityReport {
    ParityReport::from_cases(programs.iter().map(|spec| run_program(*spec, config)).collect())
}

/// Same sizes, strides and elements (componentwise for subclasses).
#[must_use]
pub fn values_match(expected: &[Value], actual: &[Value], atol: f64) -> bool {
    expected.len() == actual.len()
        && expected.iter().zip(actual).all(|(e, a)| {
            let same_layout = match (e, a) {
                (Value::Tensor(x), Value::Tensor(y)) => {
                    x.sizes() == y.sizes() && x.strides() == y.strides()
                }
                (Value::Subclass(x), Value::Subclass(y)) => {
                    x.tensors().zip(y.tensors()).all(|(p, q)| p.sizes() == q.sizes())
                }
                (Value::Scalar(x), Value::Scalar(y)) => x == y,
                _ => false,
            };
            let (ev, av) = (e.to_vecs(), a.to_vecs());
            same_layout
                && ev.len() == av.len()
                && ev.iter().zip(&av).all(|(p, q)| {
                    p.len() == q.len() && p.iter().zip(q).all(|(x, y)| (x - y).abs() <= atol)
                })
        })
}

/// Backpropagates ones through every compiled output that requires grad and
/// compares the leaf gradients against central differences of the eager
/// program's summed outputs.
fn check_gradients(
    graph: &Graph,
    config: &ParityConfig,
    args: &[Value],
    compiled: &[Value],
) -> Result<GradientCheck, HarnessError> {
    let differentiable: Vec<usize> = compiled
        .iter()
        .enumerate()
        .filter(|(_, value)| value.is_requires_grad())
        .map(|(position, _)| position)
        .collect();
    let leaves: Vec<(usize, &Tensor)> = args
        .iter()
        .enumerate()
        .filter_map(|(position, value)| value.as_tensor().map(|t| (position, t)))
        .filter(|(_, tensor)| tensor.is_requires_grad() && tensor.is_leaf())
        .collect();
    if differentiable.is_empty() || leaves.is_empty() {
        return Ok(GradientCheck::NotApplicable);
    }

    let roots: Vec<Value> = differentiable.iter().map(|p| compiled[*p].clone()).collect();
    let seeds = roots
        .iter()
        .map(|root| {
            let tensor = root.expect_tensor()?;
            Ok(Value::Tensor(Tensor::full(&tensor.sizes(), 1.0)))
        })
        .collect::<Result<Vec<_>, HarnessError>>()?;
    af_runtime::backward(&roots, &seeds)?;

    let objective = |perturb: Option<(usize, usize, f64)>| -> Result<f64, HarnessError> {
        let inputs = materialize(graph, config.seed, false)?;
        if let Some((position, element, delta)) = perturb {
            let tensor = inputs[position].expect_tensor()?;
            let mut values = tensor.to_vec();
            values[element] += delta;
            tensor.write_logical(&values)?;
        }
        let outputs = eval_graph(graph, &inputs)?;
        Ok(differentiable
            .iter()
            .map(|p| outputs[*p].to_vecs().iter().flatten().sum::<f64>())
            .sum())
    };

    let h = 1e-6;
    let mut max_error = 0.0_f64;
    for (position, leaf) in leaves {
        let analytic = leaf
            .grad()
            .map_or_else(|| vec![0.0; leaf.numel()], |grad| grad.to_vec());
        for (element, got) in analytic.iter().enumerate() {
            let plus = objective(Some((position, element, h)))?;
            let minus = objective(Some((position, element, -h)))?;
            let numeric = (plus - minus) / (2.0 * h);
            max_error = max_error.max((numeric - got).abs());
        }
    }
    Ok(if max_error <= config.grad_atol {
        GradientCheck::Matched { max_error }
    } else {
        GradientCheck::Mismatch { max_error }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_storage_inputs_share_one_allocation() {
        let graph = build_program(ProgramSpec::DisjointSlices).expect("program");
        let args = materialize_inputs(&graph, 3).expect("inputs");
        let a = args[0].as_tensor().expect("a");
        let b = args[1].as_tensor().expect("b");
        assert_eq!(a.storage_id(), b.storage_id());
        assert_eq!(a.storage().len(), 16);
        assert_eq!(b.storage_offset(), 8);
    }

    #[test]
    fn subclass_inputs_materialize_components() {
        let graph = build_program(ProgramSpec::SubclassAffine).expect("program");
        let args = materialize_inputs(&graph, 0).expect("inputs");
        let sub = args[0].as_subclass().expect("subclass");
        assert_eq!(sub.tensors().count(), 2);
        assert!(args[1].as_tensor().is_some());
    }

    #[test]
    fn materialization_is_deterministic_but_not_shared() {
        let graph = build_program(ProgramSpec::PureLoss).expect("program");
        let first = materialize_inputs(&graph, 9).expect("first");
        let second = materialize_inputs(&graph, 9).expect("second");
        assert!(values_match(&first, &second, 0.0));
        let a = first[0].as_tensor().expect("a");
        let b = second[0].as_tensor().expect("b");
        assert_ne!(a.storage_id(), b.storage_id());
        assert!(a.is_requires_grad());
    }

    #[test]
    fn markdown_lists_every_case() {
        let report = run_suite(&[ProgramSpec::MulThenScale], &ParityConfig::default());
        let markdown = report.to_markdown();
        assert!(markdown.contains("mul_then_scale"));
        assert!(markdown.contains("1/1 cases pass"));
    }
}
