use std::collections::BTreeMap;

use af_core::{Primitive, Tensor, Value, param_f64, param_usize_list};

use crate::{KernelError, check_arity, fresh_like, operand_values, tensor_at};

/// Result sizes of a binary elementwise op: equal sizes, or one side rank 0.
pub(crate) fn broadcast(
    primitive: Primitive,
    lhs: &[usize],
    rhs: &[usize],
) -> Result<Vec<usize>, KernelError> {
    if lhs == rhs || rhs.is_empty() {
        Ok(lhs.to_vec())
    } else if lhs.is_empty() {
        Ok(rhs.to_vec())
    } else {
        Err(KernelError::ShapeMismatch {
            primitive,
            left: lhs.to_vec(),
            right: rhs.to_vec(),
        })
    }
}

/// Elementwise combination with rank-0 broadcasting on either side.
pub(crate) fn zip_broadcast(
    lhs: &[f64],
    rhs: &[f64],
    numel: usize,
    op: impl Fn(f64, f64) -> f64,
) -> Vec<f64> {
    (0..numel)
        .map(|index| {
            let left = if lhs.len() == 1 { lhs[0] } else { lhs[index] };
            let right = if rhs.len() == 1 { rhs[0] } else { rhs[index] };
            op(left, right)
        })
        .collect()
}

pub(crate) fn eval_binary_elementwise(
    primitive: Primitive,
    inputs: &[Value],
    op: impl Fn(f64, f64) -> f64,
) -> Result<Tensor, KernelError> {
    check_arity(primitive, inputs, 2)?;
    let like = tensor_at(primitive, inputs, 0)
        .or_else(|_| tensor_at(primitive, inputs, 1))?
        .clone();
    let (lhs_sizes, lhs) = operand_values(primitive, inputs, 0)?;
    let (rhs_sizes, rhs) = operand_values(primitive, inputs, 1)?;
    let sizes = broadcast(primitive, &lhs_sizes, &rhs_sizes)?;
    let numel = sizes.iter().product();
    fresh_like(&like, &sizes, zip_broadcast(&lhs, &rhs, numel, op))
}

pub(crate) fn eval_unary_elementwise(
    primitive: Primitive,
    inputs: &[Value],
    op: impl Fn(f64) -> f64,
) -> Result<Tensor, KernelError> {
    check_arity(primitive, inputs, 1)?;
    let input = tensor_at(primitive, inputs, 0)?;
    let values = input.to_vec().into_iter().map(op).collect();
    fresh_like(input, &input.sizes(), values)
}

pub(crate) fn eval_sum(primitive: Primitive, inputs: &[Value]) -> Result<Tensor, KernelError> {
    check_arity(primitive, inputs, 1)?;
    let input = tensor_at(primitive, inputs, 0)?;
    fresh_like(input, &[], vec![input.to_vec().iter().sum()])
}

pub(crate) fn eval_full(params: &BTreeMap<String, String>) -> Result<Tensor, KernelError> {
    let sizes = param_usize_list(params, "sizes")?;
    let value = param_f64(params, "value")?;
    Ok(Tensor::full(&sizes, value))
}

pub(crate) fn eval_zeros_like(primitive: Primitive, inputs: &[Value]) -> Result<Tensor, KernelError> {
    let input = tensor_at(primitive, inputs, 0)?;
    let sizes = input.sizes();
    fresh_like(input, &sizes, vec![0.0; sizes.iter().product()])
}

/// Broadcasts a rank-0 tensor to `sizes`. Trailing symbolic-size operands
/// only carry dependencies.
pub(crate) fn eval_expand(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Tensor, KernelError> {
    let input = tensor_at(primitive, inputs, 0)?;
    let value = input.item()?;
    let sizes = param_usize_list(params, "sizes")?;
    for (position, operand) in inputs.iter().enumerate().skip(1) {
        if let (Some(literal), Some(expected)) = (operand.as_scalar(), sizes.get(position - 1))
            && literal.as_i64() != Some(*expected as i64)
        {
            return Err(KernelError::ShapeMismatch {
                primitive,
                left: sizes.clone(),
                right: vec![literal.as_i64().unwrap_or(-1).max(0) as usize],
            });
        }
    }
    fresh_like(input, &sizes, vec![value; sizes.iter().product()])
}

/// Functional `copy_`: the values of `src` in the shape of `dst`.
pub(crate) fn eval_copy(primitive: Primitive, inputs: &[Value]) -> Result<Tensor, KernelError> {
    check_arity(primitive, inputs, 2)?;
    let dst = tensor_at(primitive, inputs, 0)?;
    let (src_sizes, src) = operand_values(primitive, inputs, 1)?;
    let sizes = dst.sizes();
    broadcast(primitive, &sizes, &src_sizes)?;
    let numel = sizes.iter().product();
    fresh_like(dst, &sizes, zip_broadcast(&[0.0], &src, numel, |_, value| value))
}

/// Fill value from operand 1, falling back to the `value` param.
pub(crate) fn fill_value(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<f64, KernelError> {
    match inputs.get(1) {
        Some(Value::Scalar(literal)) => Ok(literal.as_f64()),
        Some(Value::Tensor(tensor)) => Ok(tensor.item()?),
        Some(other) => Err(KernelError::ExpectedTensor {
            primitive,
            position: 1,
            kind: other.kind(),
        }),
        None => Ok(param_f64(params, "value")?),
    }
}

pub(crate) fn eval_fill(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Tensor, KernelError> {
    let target = tensor_at(primitive, inputs, 0)?;
    let value = fill_value(primitive, inputs, params)?;
    let sizes = target.sizes();
    fresh_like(target, &sizes, vec![value; sizes.iter().product()])
}

/// `grad` where `input > 0`, zero elsewhere.
pub(crate) fn eval_threshold_backward(
    primitive: Primitive,
    inputs: &[Value],
) -> Result<Tensor, KernelError> {
    check_arity(primitive, inputs, 2)?;
    let grad = tensor_at(primitive, inputs, 0)?;
    let input = tensor_at(primitive, inputs, 1)?;
    let sizes = broadcast(primitive, &grad.sizes(), &input.sizes())?;
    let numel = sizes.iter().product();
    let values = zip_broadcast(&grad.to_vec(), &input.to_vec(), numel, |g, x| {
        if x > 0.0 { g } else { 0.0 }
    });
    fresh_like(grad, &sizes, values)
}
