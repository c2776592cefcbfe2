//! Build a nested U-Net and run it once on a random image.
//!
//! Run with `cargo run --release --example predict`.

use std::time::Instant;

use anyhow::Result;
use ndarray::prelude::*;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;

use nested_unet::seed;
use nested_unet::{NestedUnet, Prediction};

fn main() -> Result<()> {
    let seed_value = seed::fresh_seed()?;
    println!("seed: {seed_value}");
    seed::make_deterministic(seed_value);

    let model = NestedUnet::new(1, 3, false);
    println!("{} parameters", model.num_params());

    let x = Array4::random((1, 3, 64, 64), Uniform::new(0.0, 1.0));
    let start = Instant::now();
    match model.forward(x.view()) {
        Prediction::Mask(mask) => {
            let mean = mask.mean().unwrap_or(0.0);
            println!(
                "mask {:?} in {:.2?}, mean probability {mean:.4}",
                mask.shape(),
                start.elapsed()
            );
        }
        Prediction::DeepSupervision(_) => unreachable!("built in single-output mode"),
    }
    Ok(())
}
