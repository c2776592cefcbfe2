use ndarray::concatenate;
use ndarray::prelude::*;

/// Zero-pad the two spatial axes of an NCHW tensor by `pad` on every side.
///
/// Returns a new array of shape `(n, c, h + 2*pad, w + 2*pad)` whose interior
/// is a copy of `x`. `pad == 0` still copies.
pub(crate) fn pad_spatial(x: ArrayView4<'_, f32>, pad: usize) -> Array4<f32> {
    let (n, c, h, w) = x.raw_dim().into_pattern();
    let mut out = Array4::zeros((n, c, h + 2 * pad, w + 2 * pad));
    out.slice_mut(s![.., .., pad..pad + h, pad..pad + w])
        .assign(&x);
    out
}

/// Stack tensors along the channel axis, in the given order.
///
/// The argument order is a correctness invariant of the nested topology: each
/// downstream block's parameter layout assumes a particular channel range for
/// each input, so callers must not reorder.
pub(crate) fn concat_channels(parts: &[ArrayView4<'_, f32>]) -> Array4<f32> {
    concatenate(Axis(1), parts).expect("channel concat requires matching batch and spatial shapes")
}
