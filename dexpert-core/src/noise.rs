//! Seeded latent noise and seed-to-seed interpolation.

use candle_core::{DType, Device, Shape, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::Result;

/// Above this cosine the two tensors are treated as parallel and blended linearly.
const PARALLEL_DOT: f32 = 0.9995;

/// Standard normal noise that depends only on `seed` and `shape`, drawn on the host
/// so that every backend sees the same values.
pub fn seeded_noise(seed: u64, shape: impl Into<Shape>, device: &Device, dtype: DType) -> Result<Tensor> {
    let shape = shape.into();
    let count = shape.elem_count();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(count + 1);
    while values.len() < count {
        // Box-Muller: two uniforms give two independent normals.
        let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
        let u2: f32 = rng.gen();
        let radius = (-2.0 * u1.ln()).sqrt();
        let angle = std::f32::consts::TAU * u2;
        values.push(radius * angle.cos());
        values.push(radius * angle.sin());
    }
    values.truncate(count);
    Ok(Tensor::from_vec(values, shape, &Device::Cpu)?
        .to_dtype(dtype)?
        .to_device(device)?)
}

/// Spherical interpolation between `primary` (at 0) and `secondary` (at 1).
pub fn slerp(primary: &Tensor, secondary: &Tensor, strength: f32) -> Result<Tensor> {
    if strength <= 0.0 {
        return Ok(primary.clone());
    }
    if strength >= 1.0 {
        return Ok(secondary.clone());
    }
    let dtype = primary.dtype();
    let a = primary.to_dtype(DType::F32)?;
    let b = secondary.to_dtype(DType::F32)?;
    let norm = |t: &Tensor| -> Result<f32> { Ok(t.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?) };
    let denominator = norm(&a)? * norm(&b)?;
    let dot = if denominator > 0.0 {
        (a.mul(&b)?.sum_all()?.to_scalar::<f32>()? / denominator).clamp(-1.0, 1.0)
    } else {
        1.0
    };

    let blended = if dot.abs() > PARALLEL_DOT {
        ((&a * (1.0 - strength) as f64)? + (&b * strength as f64)?)?
    } else {
        let omega = dot.acos();
        let sin_omega = omega.sin();
        let s0 = ((1.0 - strength) * omega).sin() / sin_omega;
        let s1 = (strength * omega).sin() / sin_omega;
        ((&a * s0 as f64)? + (&b * s1 as f64)?)?
    };
    Ok(blended.to_dtype(dtype)?)
}

/// Noise for one image: the primary seed's, optionally morphed toward the
/// variation seed's.
pub fn initial_noise(
    seed: u64,
    variation: Option<(u64, f32)>,
    shape: &Shape,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let primary = seeded_noise(seed, shape.clone(), device, dtype)?;
    match variation {
        Some((variation_seed, strength)) if strength > 0.0 => {
            let secondary = seeded_noise(variation_seed, shape.clone(), device, dtype)?;
            slerp(&primary, &secondary, strength)
        }
        _ => Ok(primary),
    }
}
