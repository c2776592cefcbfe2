//! Layers of the nested U-Net.
//!
//! All layers take input of the shape `(num_images, num_channels, height, width)`.
//! Parameters are stored in a flat vector owned by the model; each layer knows
//! only how many it needs and how to slice them up.

use ndarray::prelude::*;
use ndarray::Zip;
use rand::RngCore;
use rayon::prelude::*;

use crate::array_util::pad_spatial;
use crate::{ActivationFn, Layer};

/// The logistic function, a handy symmetric, s-shaped function.
#[derive(Debug, Clone, Copy)]
pub struct Sigmoid;

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl ActivationFn for Sigmoid {
    fn f(self, x: f32) -> f32 {
        sigmoid(x)
    }
}

/// Rectified linear unit activation function.
#[derive(Debug, Clone, Copy)]
pub struct Relu;

impl ActivationFn for Relu {
    fn f(self, x: f32) -> f32 {
        if x >= 0.0 {
            x
        } else {
            0.0
        }
    }
}

/// Convolve each channel with its own 2D kernel, no cross-channel mixing.
///
/// The shape of `x` is `(num_images, num_channels, img_height, img_width)`,
/// already padded. The shape of `kernel` is `(num_channels, ker_height,
/// ker_width)`; `bias` has one entry per channel.
fn depthwise_conv2d_impl(
    x: ArrayView4<'_, f32>,
    kernel: ArrayView3<'_, f32>,
    bias: ArrayView1<'_, f32>,
    mut y: ArrayViewMut4<'_, f32>,
) {
    let (xn, xc, xh, xw) = x.raw_dim().into_pattern();
    let (kc, kh, kw) = kernel.raw_dim().into_pattern();
    assert_eq!(kc, xc, "incompatible number of channels: images={xc}, kernel={kc}");
    let oh = xh - kh + 1;
    let ow = xw - kw + 1;
    assert_eq!(y.raw_dim().into_pattern(), (xn, xc, oh, ow));
    Zip::from(y.axis_iter_mut(Axis(1)))
        .and(x.axis_iter(Axis(1)))
        .and(kernel.outer_iter())
        .and(bias)
        .par_for_each(|mut y, x, k, &b| {
            // x and y here are one channel across the whole batch.
            for t in 0..xn {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let mut acc = b;
                        for j in 0..kh {
                            for i in 0..kw {
                                acc += k[[j, i]] * x[[t, oy + j, ox + i]];
                            }
                        }
                        y[[t, oy, ox]] = acc;
                    }
                }
            }
        });
}

/// 1×1 convolution mixing channels: a matrix product over the channel axis at
/// every pixel. `weight` has shape `(num_output_channels, num_input_channels)`.
fn pointwise_conv2d_impl(
    x: ArrayView4<'_, f32>,
    weight: ArrayView2<'_, f32>,
    bias: ArrayView1<'_, f32>,
    y: ArrayViewMut4<'_, f32>,
) {
    let (xn, xc, xh, xw) = x.raw_dim().into_pattern();
    let (oc, ic) = weight.raw_dim().into_pattern();
    assert_eq!(ic, xc, "incompatible number of channels: images={xc}, weight={ic}");
    assert_eq!(y.raw_dim().into_pattern(), (xn, oc, xh, xw));
    let xm = x
        .into_shape((xn, xc, xh * xw))
        .expect("conv input should be contiguous");
    let mut ym = y
        .into_shape((xn, oc, xh * xw))
        .expect("conv output should be contiguous");
    let bias = bias.insert_axis(Axis(1));
    for (x, mut y) in xm.outer_iter().zip(ym.outer_iter_mut()) {
        y.assign(&weight.dot(&x));
        y += &bias;
    }
}

/// Depthwise-separable convolution.
///
/// A per-channel spatial convolution followed by a 1×1 cross-channel mixing
/// convolution. Together they approximate a dense `Cin*Cout*k²` convolution
/// with `Cin*k² + Cin*Cout` weights instead.
#[derive(Debug)]
pub struct DsConv2d {
    in_channels: usize,
    out_channels: usize,
    kernel_size: usize,
    padding: usize,
}

impl DsConv2d {
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: usize, padding: usize) -> Self {
        assert!(kernel_size >= 1);
        DsConv2d {
            in_channels,
            out_channels,
            kernel_size,
            padding,
        }
    }

    pub fn in_channels(&self) -> usize {
        self.in_channels
    }

    pub fn out_channels(&self) -> usize {
        self.out_channels
    }

    /// Number of parameters in the depthwise stage (kernel + bias).
    fn depthwise_params(&self) -> usize {
        let k = self.kernel_size;
        self.in_channels * k * k + self.in_channels
    }
}

impl Layer for DsConv2d {
    fn output_shape(&self, input_shape: Ix4) -> Ix4 {
        let (xn, xc, xh, xw) = input_shape.into_pattern();
        assert_eq!(
            xc, self.in_channels,
            "incompatible number of channels: images={xc}, layer={}",
            self.in_channels
        );
        let k = self.kernel_size;
        let p = self.padding;
        Ix4(xn, self.out_channels, xh + 2 * p - k + 1, xw + 2 * p - k + 1)
    }

    fn num_params(&self) -> usize {
        self.depthwise_params() + self.in_channels * self.out_channels + self.out_channels
    }

    fn apply(
        &self,
        params: ArrayView1<'_, f32>,
        x: ArrayView4<'_, f32>,
        y: ArrayViewMut4<'_, f32>,
    ) {
        let ci = self.in_channels;
        let co = self.out_channels;
        let k = self.kernel_size;

        let dk = ci * k * k;
        let dw_kernel = params
            .slice(s![..dk])
            .into_shape((ci, k, k))
            .expect("params must be contiguous");
        let dw_bias = params.slice(s![dk..dk + ci]);
        let pw = self.depthwise_params();
        let pw_kernel = params
            .slice(s![pw..pw + ci * co])
            .into_shape((co, ci))
            .expect("params must be contiguous");
        let pw_bias = params.slice(s![pw + ci * co..]);

        let padded = pad_spatial(x, self.padding);
        let (xn, _, ph, pw_) = padded.raw_dim().into_pattern();
        let mut mid = Array4::zeros((xn, ci, ph - k + 1, pw_ - k + 1));
        depthwise_conv2d_impl(padded.view(), dw_kernel, dw_bias, mid.view_mut());
        pointwise_conv2d_impl(mid.view(), pw_kernel, pw_bias, y);
    }
}

/// Per-channel normalization in its inference form.
///
/// `y = gamma * (x - mean) / sqrt(var + eps) + beta`, where all four vectors
/// are per-channel entries of the parameter slice in that order. The running
/// statistics are maintained by an external training procedure; here they are
/// just more parameters.
#[derive(Debug)]
pub struct BatchNorm2d {
    channels: usize,
    eps: f32,
}

impl BatchNorm2d {
    pub fn new(channels: usize) -> Self {
        BatchNorm2d {
            channels,
            eps: 1e-5,
        }
    }
}

impl Layer for BatchNorm2d {
    fn output_shape(&self, input_shape: Ix4) -> Ix4 {
        input_shape
    }

    fn num_params(&self) -> usize {
        4 * self.channels
    }

    /// Identity transform to start: unit gamma, zero beta, zero mean, unit
    /// variance. Gaussian noise here would put negative running variances
    /// under the square root.
    fn init_params(&self, mut params: ArrayViewMut1<'_, f32>, _rng: &mut dyn RngCore) {
        let c = self.channels;
        params.slice_mut(s![..c]).fill(1.0); // gamma
        params.slice_mut(s![c..3 * c]).fill(0.0); // beta, mean
        params.slice_mut(s![3 * c..]).fill(1.0); // var
    }

    fn apply(
        &self,
        params: ArrayView1<'_, f32>,
        x: ArrayView4<'_, f32>,
        mut y: ArrayViewMut4<'_, f32>,
    ) {
        let c = self.channels;
        assert_eq!(
            x.len_of(Axis(1)),
            c,
            "incompatible number of channels: images={}, layer={c}",
            x.len_of(Axis(1))
        );
        let gamma = params.slice(s![..c]);
        let beta = params.slice(s![c..2 * c]);
        let mean = params.slice(s![2 * c..3 * c]);
        let var = params.slice(s![3 * c..]);
        for ch in 0..c {
            let scale = gamma[ch] / (var[ch] + self.eps).sqrt();
            let shift = beta[ch] - mean[ch] * scale;
            Zip::from(y.slice_mut(s![.., ch, .., ..]))
                .and(x.slice(s![.., ch, .., ..]))
                .for_each(|y, &x| *y = scale * x + shift);
        }
    }
}

/// Max pooling operation for image data.
///
/// Non-overlapping `size`×`size` windows with stride `size`; trailing rows and
/// columns that do not fill a window are dropped, so a 63-pixel axis pools to
/// 31.
#[derive(Debug)]
pub struct MaxPool2d {
    size: usize,
}

impl MaxPool2d {
    pub fn new(size: usize) -> Self {
        assert!(size > 0);
        MaxPool2d { size }
    }
}

impl Layer for MaxPool2d {
    fn output_shape(&self, input_shape: Ix4) -> Ix4 {
        let (xn, xc, xh, xw) = input_shape.into_pattern();
        Ix4(xn, xc, xh / self.size, xw / self.size)
    }

    fn apply(
        &self,
        _params: ArrayView1<'_, f32>,
        x: ArrayView4<'_, f32>,
        mut y: ArrayViewMut4<'_, f32>,
    ) {
        let n = self.size;
        let (xn, _, _, _) = x.raw_dim().into_pattern();
        let (_, _, oh, ow) = y.raw_dim().into_pattern();
        let xi = x.axis_iter(Axis(1)).into_par_iter();
        let yi = y.axis_iter_mut(Axis(1)).into_par_iter();
        xi.zip(yi).for_each(|(x, mut y)| {
            // one channel across the whole batch
            for t in 0..xn {
                for oy in 0..oh {
                    for ox in 0..ow {
                        let window = x.slice(s![t, oy * n..(oy + 1) * n, ox * n..(ox + 1) * n]);
                        y[[t, oy, ox]] = window.iter().copied().fold(f32::MIN, f32::max);
                    }
                }
            }
        });
    }
}

/// Bilinear upsampling by an integer factor, corner-aligned.
///
/// Corner-aligned sampling maps the corner pixels of the input exactly onto
/// the corner pixels of the output, so `src = dst * (in - 1) / (out - 1)`;
/// interior pixels interpolate between their four neighbors.
#[derive(Debug)]
pub struct Upsample2d {
    scale: usize,
}

impl Upsample2d {
    pub fn new(scale: usize) -> Self {
        assert!(scale > 0);
        Upsample2d { scale }
    }
}

impl Layer for Upsample2d {
    fn output_shape(&self, input_shape: Ix4) -> Ix4 {
        let (xn, xc, xh, xw) = input_shape.into_pattern();
        Ix4(xn, xc, xh * self.scale, xw * self.scale)
    }

    fn apply(
        &self,
        _params: ArrayView1<'_, f32>,
        x: ArrayView4<'_, f32>,
        mut y: ArrayViewMut4<'_, f32>,
    ) {
        let (xn, xc, ih, iw) = x.raw_dim().into_pattern();
        let (_, _, oh, ow) = y.raw_dim().into_pattern();
        let step = |i: usize, o: usize| -> f32 {
            if o > 1 {
                (i - 1) as f32 / (o - 1) as f32
            } else {
                0.0
            }
        };
        let sy = step(ih, oh);
        let sx = step(iw, ow);
        for oy in 0..oh {
            let fy = oy as f32 * sy;
            let y0 = fy as usize;
            let y1 = (y0 + 1).min(ih - 1);
            let wy = fy - y0 as f32;
            for ox in 0..ow {
                let fx = ox as f32 * sx;
                let x0 = fx as usize;
                let x1 = (x0 + 1).min(iw - 1);
                let wx = fx - x0 as f32;
                for t in 0..xn {
                    for c in 0..xc {
                        let top = (1.0 - wx) * x[[t, c, y0, x0]] + wx * x[[t, c, y0, x1]];
                        let bottom = (1.0 - wx) * x[[t, c, y1, x0]] + wx * x[[t, c, y1, x1]];
                        y[[t, c, oy, ox]] = (1.0 - wy) * top + wy * bottom;
                    }
                }
            }
        }
    }
}

/// The basic repeating unit of the network: two depthwise-separable
/// convolutions, each normalized and rectified.
#[derive(Debug)]
pub struct FeatureBlock {
    conv1: DsConv2d,
    bn1: BatchNorm2d,
    conv2: DsConv2d,
    bn2: BatchNorm2d,
}

impl FeatureBlock {
    pub fn new(in_channels: usize, middle_channels: usize, out_channels: usize) -> Self {
        FeatureBlock {
            conv1: DsConv2d::new(in_channels, middle_channels, 3, 1),
            bn1: BatchNorm2d::new(middle_channels),
            conv2: DsConv2d::new(middle_channels, out_channels, 3, 1),
            bn2: BatchNorm2d::new(out_channels),
        }
    }

    pub fn in_channels(&self) -> usize {
        self.conv1.in_channels()
    }

    pub fn out_channels(&self) -> usize {
        self.conv2.out_channels()
    }

    /// The sub-layers in application order, for slicing the parameter vector.
    fn stages(&self) -> [&dyn Layer; 4] {
        [&self.conv1, &self.bn1, &self.conv2, &self.bn2]
    }
}

impl Layer for FeatureBlock {
    fn output_shape(&self, input_shape: Ix4) -> Ix4 {
        let (xn, _, xh, xw) = input_shape.into_pattern();
        Ix4(xn, self.out_channels(), xh, xw)
    }

    fn num_params(&self) -> usize {
        self.stages().iter().map(|l| l.num_params()).sum()
    }

    fn init_params(&self, mut params: ArrayViewMut1<'_, f32>, rng: &mut dyn RngCore) {
        let mut begin = 0;
        for layer in self.stages() {
            let end = begin + layer.num_params();
            layer.init_params(params.slice_mut(s![begin..end]), rng);
            begin = end;
        }
    }

    fn apply(
        &self,
        params: ArrayView1<'_, f32>,
        x: ArrayView4<'_, f32>,
        mut y: ArrayViewMut4<'_, f32>,
    ) {
        let relu = Relu;
        let mut begin = 0;
        let mut next = |n: usize| {
            let range = begin..begin + n;
            begin += n;
            range
        };
        let p1 = next(self.conv1.num_params());
        let p2 = next(self.bn1.num_params());
        let p3 = next(self.conv2.num_params());
        let p4 = next(self.bn2.num_params());

        let mut h = self.conv1.forward(params.slice(s![p1]), x);
        h = self.bn1.forward(params.slice(s![p2]), h.view());
        h.mapv_inplace(|v| relu.f(v));
        h = self.conv2.forward(params.slice(s![p3]), h.view());
        h = self.bn2.forward(params.slice(s![p4]), h.view());
        h.mapv_inplace(|v| relu.f(v));
        y.assign(&h);
    }
}
