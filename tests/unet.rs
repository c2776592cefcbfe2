//! End-to-end checks of the nested U-Net forward pass.

use ndarray::prelude::*;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use nested_unet::{NestedUnet, Prediction};

fn random_images(batch: usize, channels: usize, height: usize, width: usize) -> Array4<f32> {
    Array4::random((batch, channels, height, width), Uniform::new(0.0, 1.0))
}

fn expect_mask(prediction: Prediction) -> Array4<f32> {
    match prediction {
        Prediction::Mask(mask) => mask,
        Prediction::DeepSupervision(_) => panic!("expected a single-output model"),
    }
}

#[test]
fn single_output_is_a_probability_mask() {
    let model = NestedUnet::new(1, 3, false);
    let x = random_images(1, 3, 64, 64);
    let mask = expect_mask(model.forward(x.view()));
    assert_eq!(mask.raw_dim().into_pattern(), (1, 1, 64, 64));
    assert!(
        mask.iter().all(|&v| v > 0.0 && v < 1.0),
        "probabilities must lie strictly inside (0, 1)"
    );
}

#[test]
fn deep_supervision_returns_four_scales() {
    let model = NestedUnet::new(1, 3, true);
    let x = random_images(1, 3, 64, 64);
    let outputs = match model.forward(x.view()) {
        Prediction::DeepSupervision(outputs) => outputs,
        Prediction::Mask(_) => panic!("expected a deep-supervision model"),
    };
    assert_eq!(outputs.len(), 4);
    for out in &outputs {
        // All four rejoin the full input resolution; no sigmoid is applied.
        assert_eq!(out.raw_dim().into_pattern(), (1, 1, 64, 64));
        assert!(out.iter().all(|v| v.is_finite()));
    }
}

#[test]
fn multi_class_batched_forward() {
    let model = NestedUnet::new(3, 5, false);
    let x = random_images(2, 5, 32, 32);
    let mask = expect_mask(model.forward(x.view()));
    assert_eq!(mask.raw_dim().into_pattern(), (2, 3, 32, 32));
}

#[test]
fn smallest_valid_input() {
    // 16×16 is the smallest size the four halvings allow: the deepest grid
    // node sees a single pixel.
    let model = NestedUnet::new(1, 3, false);
    let x = random_images(1, 3, 16, 16);
    let mask = expect_mask(model.forward(x.view()));
    assert_eq!(mask.raw_dim().into_pattern(), (1, 1, 16, 16));
}

#[test]
#[should_panic(expected = "matching batch and spatial shapes")]
fn indivisible_spatial_size_fails_at_concat() {
    // 63 pools to 31, which upsamples to 62: one pixel short of the skip
    // connection it must join.
    let model = NestedUnet::new(1, 3, false);
    let x = random_images(1, 3, 63, 63);
    model.forward(x.view());
}

#[test]
#[should_panic(expected = "incompatible number of channels")]
fn wrong_channel_count_fails() {
    let model = NestedUnet::new(1, 3, false);
    let x = random_images(1, 4, 16, 16);
    model.forward(x.view());
}
