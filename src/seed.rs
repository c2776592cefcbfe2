//! Seeding for reproducible runs.
//!
//! All parameter initialization in this crate draws from one process-wide
//! generator. Left alone, it seeds itself from OS entropy; call
//! [`make_deterministic`] first to get bit-identical runs instead. That call
//! must happen before any model is constructed: it replaces the generator,
//! it cannot rewind draws that already happened.

use std::env;
use std::sync::{Mutex, OnceLock};

use anyhow::{Context, Result};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};

static RNG: OnceLock<Mutex<StdRng>> = OnceLock::new();

/// Draw a fresh 32-bit seed from the operating system's cryptographic entropy
/// source, interpreted big-endian.
///
/// The best random sample you can get in any language comes from the OS. Fails
/// only if the entropy source itself is unavailable, which is not recoverable.
pub fn fresh_seed() -> Result<u32> {
    let mut bytes = [0u8; 4];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("error reading OS entropy")?;
    Ok(u32::from_be_bytes(bytes))
}

/// Pin every source of randomness in scope to `seed`.
///
/// Reseeds the process-wide generator that parameter initialization uses, and
/// exports `PYTHONHASHSEED` and `CUBLAS_WORKSPACE_CONFIG` so that Python
/// tooling and cuBLAS-backed stages elsewhere in the same pipeline behave
/// deterministically too. Effects are process-wide and there is no undo; runs
/// that constructed a model before calling this are not reproducible.
pub fn make_deterministic(seed: u32) {
    env::set_var("PYTHONHASHSEED", seed.to_string());
    env::set_var("CUBLAS_WORKSPACE_CONFIG", ":4096:8");
    let cell = RNG.get_or_init(|| Mutex::new(StdRng::seed_from_u64(seed as u64)));
    *cell.lock().unwrap() = StdRng::seed_from_u64(seed as u64);
}

/// Run `f` with the process-wide generator.
pub(crate) fn with_rng<T>(f: impl FnOnce(&mut StdRng) -> T) -> T {
    let cell = RNG.get_or_init(|| Mutex::new(StdRng::from_entropy()));
    f(&mut cell.lock().unwrap())
}
