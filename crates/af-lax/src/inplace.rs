use std::collections::BTreeMap;

use af_core::{Primitive, Tensor, Value};

use crate::arithmetic::{broadcast, fill_value, zip_broadcast};
use crate::{KernelError, check_arity, operand_values, tensor_at};

/// `target op= other`, written through `target`'s layout.
pub(crate) fn eval_binary_inplace(
    primitive: Primitive,
    inputs: &[Value],
    op: impl Fn(f64, f64) -> f64,
) -> Result<Tensor, KernelError> {
    check_arity(primitive, inputs, 2)?;
    let target = tensor_at(primitive, inputs, 0)?;
    target.check_inplace()?;
    let sizes = target.sizes();
    let (other_sizes, other) = operand_values(primitive, inputs, 1)?;
    if broadcast(primitive, &sizes, &other_sizes)? != sizes {
        return Err(KernelError::ShapeMismatch {
            primitive,
            left: sizes,
            right: other_sizes,
        });
    }
    let values = zip_broadcast(&target.to_vec(), &other, target.numel(), op);
    target.write_logical(&values)?;
    Ok(target.clone())
}

pub(crate) fn eval_copy_inplace(primitive: Primitive, inputs: &[Value]) -> Result<Tensor, KernelError> {
    eval_binary_inplace(primitive, inputs, |_, src| src)
}

pub(crate) fn eval_fill_inplace(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Tensor, KernelError> {
    let target = tensor_at(primitive, inputs, 0)?;
    target.check_inplace()?;
    let value = fill_value(primitive, inputs, params)?;
    target.write_logical(&vec![value; target.numel()])?;
    Ok(target.clone())
}
