#![forbid(unsafe_code)]

mod arithmetic;
mod inplace;
mod views;

use std::collections::BTreeMap;

use af_core::{Layout, Literal, ParamError, Primitive, Tensor, TensorError, Value};
use thiserror::Error;

use arithmetic::{
    eval_binary_elementwise, eval_copy, eval_expand, eval_fill, eval_full, eval_sum,
    eval_threshold_backward, eval_unary_elementwise, eval_zeros_like,
};
use inplace::{eval_binary_inplace, eval_copy_inplace, eval_fill_inplace};
use views::{
    eval_as_strided, eval_as_strided_backward, eval_as_strided_scatter, eval_select, eval_slice,
    eval_transpose, eval_unbind, eval_unsqueeze, eval_view,
};

#[derive(Debug, Clone, PartialEq, Error)]
pub enum KernelError {
    #[error("arity mismatch for {}: expected {expected}, got {actual}", primitive.as_str())]
    ArityMismatch {
        primitive: Primitive,
        expected: usize,
        actual: usize,
    },
    #[error("{}: operand {position} must be a tensor, got {kind}", primitive.as_str())]
    ExpectedTensor {
        primitive: Primitive,
        position: usize,
        kind: &'static str,
    },
    #[error("shape mismatch for {}: left={left:?} right={right:?}", primitive.as_str())]
    ShapeMismatch {
        primitive: Primitive,
        left: Vec<usize>,
        right: Vec<usize>,
    },
    #[error("{}: subclass operands disagree: {detail}", primitive.as_str())]
    SubclassMismatch {
        primitive: Primitive,
        detail: String,
    },
    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Param(#[from] ParamError),
}

pub(crate) fn tensor_at(
    primitive: Primitive,
    inputs: &[Value],
    position: usize,
) -> Result<&Tensor, KernelError> {
    match inputs.get(position) {
        Some(Value::Tensor(tensor)) => Ok(tensor),
        Some(other) => Err(KernelError::ExpectedTensor {
            primitive,
            position,
            kind: other.kind(),
        }),
        None => Err(KernelError::ArityMismatch {
            primitive,
            expected: position + 1,
            actual: inputs.len(),
        }),
    }
}

pub(crate) fn check_arity(
    primitive: Primitive,
    inputs: &[Value],
    expected: usize,
) -> Result<(), KernelError> {
    if inputs.len() == expected {
        Ok(())
    } else {
        Err(KernelError::ArityMismatch {
            primitive,
            expected,
            actual: inputs.len(),
        })
    }
}

/// Logical elements of a tensor or scalar operand.
pub(crate) fn operand_values(
    primitive: Primitive,
    inputs: &[Value],
    position: usize,
) -> Result<(Vec<usize>, Vec<f64>), KernelError> {
    match inputs.get(position) {
        Some(Value::Tensor(tensor)) => Ok((tensor.sizes(), tensor.to_vec())),
        Some(Value::Scalar(literal)) => Ok((Vec::new(), vec![literal.as_f64()])),
        Some(other) => Err(KernelError::ExpectedTensor {
            primitive,
            position,
            kind: other.kind(),
        }),
        None => Err(KernelError::ArityMismatch {
            primitive,
            expected: position + 1,
            actual: inputs.len(),
        }),
    }
}

/// Evaluates one primitive. In-place primitives write through the target
/// tensor and return the same handle.
pub fn eval_primitive(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Vec<Value>, KernelError> {
    if inputs.iter().any(|value| matches!(value, Value::Subclass(_))) {
        return eval_componentwise(primitive, inputs, params);
    }
    let single = |tensor: Tensor| vec![Value::Tensor(tensor)];
    let out = match primitive {
        Primitive::Add => single(eval_binary_elementwise(primitive, inputs, |a, b| a + b)?),
        Primitive::Sub => single(eval_binary_elementwise(primitive, inputs, |a, b| a - b)?),
        Primitive::Mul => single(eval_binary_elementwise(primitive, inputs, |a, b| a * b)?),
        Primitive::Div => single(eval_binary_elementwise(primitive, inputs, |a, b| a / b)?),
        Primitive::Neg => single(eval_unary_elementwise(primitive, inputs, |x| -x)?),
        Primitive::Exp => single(eval_unary_elementwise(primitive, inputs, f64::exp)?),
        Primitive::Log => single(eval_unary_elementwise(primitive, inputs, f64::ln)?),
        Primitive::Sin => single(eval_unary_elementwise(primitive, inputs, f64::sin)?),
        Primitive::Cos => single(eval_unary_elementwise(primitive, inputs, f64::cos)?),
        Primitive::Relu => single(eval_unary_elementwise(primitive, inputs, |x| x.max(0.0))?),
        Primitive::Clone => single(eval_unary_elementwise(primitive, inputs, |x| x)?),
        Primitive::Sum => single(eval_sum(primitive, inputs)?),
        Primitive::Full => single(eval_full(params)?),
        Primitive::ZerosLike => single(eval_zeros_like(primitive, inputs)?),
        Primitive::Expand => single(eval_expand(primitive, inputs, params)?),
        Primitive::SymSize => {
            let tensor = tensor_at(primitive, inputs, 0)?;
            let dim = af_core::param_i64(params, "dim")?;
            let size = usize::try_from(dim)
                .ok()
                .and_then(|dim| tensor.sizes().get(dim).copied())
                .ok_or(TensorError::Layout(af_core::LayoutError::DimOutOfRange {
                    dim,
                    rank: tensor.sizes().len(),
                }))?;
            vec![Value::Scalar(Literal::I64(size as i64))]
        }
        Primitive::Copy => single(eval_copy(primitive, inputs)?),
        Primitive::Fill => single(eval_fill(primitive, inputs, params)?),
        Primitive::ThresholdBackward => single(eval_threshold_backward(primitive, inputs)?),
        Primitive::AsStridedBackward => single(eval_as_strided_backward(primitive, inputs, params)?),
        Primitive::View => single(eval_view(primitive, inputs, params)?),
        Primitive::AsStrided => single(eval_as_strided(primitive, inputs, params)?),
        Primitive::Slice => single(eval_slice(primitive, inputs, params)?),
        Primitive::Select => single(eval_select(primitive, inputs, params)?),
        Primitive::Transpose => single(eval_transpose(primitive, inputs, params)?),
        Primitive::Unsqueeze => single(eval_unsqueeze(primitive, inputs, params)?),
        Primitive::Alias => single(tensor_at(primitive, inputs, 0)?.alias()?),
        Primitive::Detach => single(tensor_at(primitive, inputs, 0)?.detach()),
        Primitive::Unbind => eval_unbind(primitive, inputs, params)?
            .into_iter()
            .map(Value::Tensor)
            .collect(),
        Primitive::AsStridedScatter => single(eval_as_strided_scatter(primitive, inputs, params)?),
        Primitive::AddInplace => single(eval_binary_inplace(primitive, inputs, |a, b| a + b)?),
        Primitive::SubInplace => single(eval_binary_inplace(primitive, inputs, |a, b| a - b)?),
        Primitive::MulInplace => single(eval_binary_inplace(primitive, inputs, |a, b| a * b)?),
        Primitive::DivInplace => single(eval_binary_inplace(primitive, inputs, |a, b| a / b)?),
        Primitive::CopyInplace => single(eval_copy_inplace(primitive, inputs)?),
        Primitive::FillInplace => single(eval_fill_inplace(primitive, inputs, params)?),
        Primitive::TransposeInplace => {
            let target = tensor_at(primitive, inputs, 0)?;
            target.transpose_(
                af_core::param_i64(params, "dim0")?,
                af_core::param_i64(params, "dim1")?,
            )?;
            single(target.clone())
        }
        Primitive::UnsqueezeInplace => {
            let target = tensor_at(primitive, inputs, 0)?;
            target.unsqueeze_(af_core::param_i64(params, "dim")?)?;
            single(target.clone())
        }
        Primitive::Set => {
            let target = tensor_at(primitive, inputs, 0)?;
            target.set_(tensor_at(primitive, inputs, 1)?)?;
            single(target.clone())
        }
    };
    Ok(out)
}

/// Applies `primitive` once per component; plain operands are shared.
fn eval_componentwise(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Vec<Value>, KernelError> {
    let template = inputs
        .iter()
        .find_map(Value::as_subclass)
        .ok_or(KernelError::ArityMismatch {
            primitive,
            expected: 1,
            actual: 0,
        })?;
    let count = template.components.len();
    for value in inputs {
        if let Value::Subclass(other) = value
            && (other.kind != template.kind || other.components.len() != count)
        {
            return Err(KernelError::SubclassMismatch {
                primitive,
                detail: format!("{} vs {}", template.kind, other.kind),
            });
        }
    }

    let mut per_component = Vec::with_capacity(count);
    for index in 0..count {
        let operands: Vec<Value> = inputs
            .iter()
            .map(|value| match value {
                Value::Subclass(subclass) => Value::Tensor(subclass.components[index].1.clone()),
                other => other.clone(),
            })
            .collect();
        per_component.push(eval_primitive(primitive, &operands, params)?);
    }

    let outputs = per_component.first().map_or(0, Vec::len);
    let mut out = Vec::with_capacity(outputs);
    for position in 0..outputs {
        let component_values: Vec<&Value> = per_component
            .iter()
            .filter_map(|values| values.get(position))
            .collect();
        if let Some(Value::Scalar(literal)) = component_values.first() {
            out.push(Value::Scalar(*literal));
            continue;
        }
        let tensors = component_values
            .into_iter()
            .map(|value| value.expect_tensor().cloned())
            .collect::<Result<Vec<_>, _>>()?;
        out.push(Value::Subclass(template.with_components(tensors)));
    }
    Ok(out)
}

/// Contiguous tensor of `sizes` with the dtype of `like`.
pub(crate) fn fresh_like(like: &Tensor, sizes: &[usize], values: Vec<f64>) -> Result<Tensor, KernelError> {
    Ok(Tensor::from_vec(sizes, values)?.with_dtype(like.dtype()))
}

pub(crate) fn layout_param(
    params: &BTreeMap<String, String>,
    sizes_key: &str,
    strides_key: &str,
    offset: usize,
) -> Result<Layout, KernelError> {
    let sizes = af_core::param_usize_list(params, sizes_key)?;
    let strides = af_core::param_usize_list(params, strides_key)?;
    Ok(Layout::new(sizes, strides, offset).map_err(TensorError::from)?)
}
