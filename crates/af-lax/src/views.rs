use std::collections::BTreeMap;

use af_core::{
    Layout, Primitive, Tensor, TensorError, Value, param_i64, param_i64_list, param_usize_list,
};

use crate::{KernelError, layout_param, tensor_at};

pub(crate) fn eval_view(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Tensor, KernelError> {
    let input = tensor_at(primitive, inputs, 0)?;
    Ok(input.view(&param_i64_list(params, "sizes")?)?)
}

pub(crate) fn eval_as_strided(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Tensor, KernelError> {
    let input = tensor_at(primitive, inputs, 0)?;
    Ok(input.as_strided(
        &param_usize_list(params, "sizes")?,
        &param_usize_list(params, "strides")?,
        param_i64(params, "offset")?,
    )?)
}

pub(crate) fn eval_slice(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Tensor, KernelError> {
    let input = tensor_at(primitive, inputs, 0)?;
    Ok(input.slice(
        param_i64(params, "dim")?,
        param_i64(params, "start")?,
        param_i64(params, "end")?,
        param_i64(params, "step")?,
    )?)
}

pub(crate) fn eval_select(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Tensor, KernelError> {
    let input = tensor_at(primitive, inputs, 0)?;
    Ok(input.select(param_i64(params, "dim")?, param_i64(params, "index")?)?)
}

pub(crate) fn eval_transpose(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Tensor, KernelError> {
    let input = tensor_at(primitive, inputs, 0)?;
    Ok(input.transpose(param_i64(params, "dim0")?, param_i64(params, "dim1")?)?)
}

pub(crate) fn eval_unsqueeze(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Tensor, KernelError> {
    let input = tensor_at(primitive, inputs, 0)?;
    Ok(input.unsqueeze(param_i64(params, "dim")?)?)
}

pub(crate) fn eval_unbind(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Vec<Tensor>, KernelError> {
    let input = tensor_at(primitive, inputs, 0)?;
    Ok(input.unbind(param_i64(params, "dim")?)?)
}

/// Copy of `base` (same geometry, fresh storage) with `src` written through
/// the strided window `(sizes, strides, offset)` relative to `base`'s offset.
pub(crate) fn eval_as_strided_scatter(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Tensor, KernelError> {
    let base = tensor_at(primitive, inputs, 0)?;
    let src = tensor_at(primitive, inputs, 1)?;
    let sizes = param_usize_list(params, "sizes")?;
    if src.sizes() != sizes {
        return Err(KernelError::ShapeMismatch {
            primitive,
            left: sizes,
            right: src.sizes(),
        });
    }
    let out = base.clone_storage().with_dtype(base.dtype());
    let window = out.as_strided(
        &sizes,
        &param_usize_list(params, "strides")?,
        param_i64(params, "offset")?,
    )?;
    window.write_logical(&src.to_vec())?;
    Ok(out)
}

/// Params: the input geometry (`input_sizes`, `input_strides`) at offset 0 and
/// the view geometry (`sizes`, `strides`, `offset`) in the same coordinates.
pub(crate) fn eval_as_strided_backward(
    primitive: Primitive,
    inputs: &[Value],
    params: &BTreeMap<String, String>,
) -> Result<Tensor, KernelError> {
    let grad = tensor_at(primitive, inputs, 0)?;
    let input = layout_param(params, "input_sizes", "input_strides", 0)?;
    let raw_offset = param_i64(params, "offset")?;
    let offset = usize::try_from(raw_offset).map_err(|_| {
        TensorError::Layout(af_core::LayoutError::NegativeOffset { offset: raw_offset })
    })?;
    let view: Layout = layout_param(params, "sizes", "strides", offset)?;
    Ok(af_core::tensor::as_strided_backward(grad, &input, &view)?.with_dtype(grad.dtype()))
}

#[cfg(test)]
mod tests {
    use super::eval_as_strided_backward;
    use af_core::{Primitive, Tensor, Value, params};

    #[test]
    fn backward_of_a_column_window_routes_gradients() {
        let grad = Tensor::from_vec(&[2], vec![1.0, 2.0]).expect("grad");
        let out = eval_as_strided_backward(
            Primitive::AsStridedBackward,
            &[Value::Tensor(grad)],
            &params([
                ("input_sizes", "2,2".to_owned()),
                ("input_strides", "2,1".to_owned()),
                ("sizes", "2".to_owned()),
                ("strides", "2".to_owned()),
                ("offset", "1".to_owned()),
            ]),
        )
        .expect("backward");
        assert_eq!(out.to_vec(), vec![0.0, 1.0, 0.0, 2.0]);
    }
}
