use std::fmt::Debug;

use ndarray::prelude::*;
use ndarray_rand::rand_distr::StandardNormal;
use rand::{Rng, RngCore};

/// A forward-only computational unit operating on NCHW image tensors.
///
/// Layers are stateless descriptors: learned parameters live in a single flat
/// `f32` vector owned by the model, and each method receives the slice of that
/// vector belonging to this layer. Axis 0 of every tensor is the mini-batch
/// axis; axis 1 is the channel axis.
pub trait Layer: Debug {
    /// For input of the given shape, compute the output shape.
    fn output_shape(&self, input_shape: Ix4) -> Ix4;

    /// Number of parameters required for this layer.
    ///
    /// The caller provides parameters to the other methods as a single flat
    /// array, which the methods will slice up and reshape into whatever they
    /// need.
    fn num_params(&self) -> usize {
        0
    }

    /// Fill this layer's parameter slice with initial values.
    ///
    /// The default draws small Gaussian weights. Layers whose parameters are
    /// not weights (normalization statistics, say) override this.
    fn init_params(&self, mut params: ArrayViewMut1<'_, f32>, rng: &mut dyn RngCore) {
        for p in params.iter_mut() {
            *p = 0.1 * rng.sample::<f32, _>(StandardNormal);
        }
    }

    /// Compute the output of this layer, given the `params` and the input `x`,
    /// storing the output in `y`.
    fn apply(&self, params: ArrayView1<'_, f32>, x: ArrayView4<'_, f32>, y: ArrayViewMut4<'_, f32>);

    /// Convenience wrapper around `apply` that allocates the output.
    fn forward(&self, params: ArrayView1<'_, f32>, x: ArrayView4<'_, f32>) -> Array4<f32> {
        let mut y = Array4::zeros(self.output_shape(x.raw_dim()));
        self.apply(params, x, y.view_mut());
        y
    }
}

pub trait ActivationFn: Copy + Clone + Debug {
    fn f(self, x: f32) -> f32;
}
