mod array_util;

mod traits;
pub use traits::{ActivationFn, Layer};

pub mod layers;

pub mod seed;

mod unet;
pub use unet::{NestedUnet, Prediction, WIDTHS};
