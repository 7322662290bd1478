//! The denoising loop. It owns the only cancellation checkpoint of a run, right
//! after each completed step.

use candle_core::{DType, Device, IndexOp, Shape, Tensor};
use image::DynamicImage;

use super::{image_to_tensor, mask_to_tensor, ExtraInputs, GenerationMode, Pipeline};
use crate::models::{Autoencoder, Denoiser, LatentDecoder, ModelFactory, PromptTokenizer, TextEncoder};
use crate::noise::initial_noise;
use crate::util::{round_to_latent_multiple, tensor_to_image};
use crate::{Error, Host, Result};

const PREVIEW_INTERVAL: usize = 5;
const LATENT_CHANNELS: usize = 4;
const LATENT_FACTOR: usize = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct RunParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub guidance_scale: f64,
    pub steps: usize,
    pub seed: u64,
    pub width: usize,
    pub height: usize,
    pub batch_size: usize,
    /// Second seed and the strength with which its noise is blended in.
    pub variation: Option<(u64, f32)>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed {
        images: Vec<DynamicImage>,
        completed_steps: usize,
    },
    Canceled {
        completed_steps: usize,
    },
}

impl RunOutcome {
    pub fn completed_steps(&self) -> usize {
        match self {
            RunOutcome::Completed { completed_steps, .. } | RunOutcome::Canceled { completed_steps } => {
                *completed_steps
            }
        }
    }
}

/// Latents and channels an inpainting backbone takes next to the noisy latents.
struct Conditioning {
    init_latents: Option<Tensor>,
    inpaint: Option<Tensor>,
}

fn encode_prompt<F: ModelFactory>(
    tokenizer: &F::Tokenizer,
    text_encoder: &F::TextEncoder,
    prompt: &str,
    device: &Device,
) -> Result<Tensor> {
    let ids = tokenizer.encode(prompt)?;
    let tokens = Tensor::new(ids.as_slice(), device)?.unsqueeze(0)?;
    Ok(text_encoder.encode(&tokens)?.to_dtype(DType::F32)?)
}

fn prepare_conditioning<F: ModelFactory>(
    mode: GenerationMode,
    autoencoder: &F::Autoencoder,
    inputs: &ExtraInputs,
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Conditioning> {
    let init_image = |what: &str| {
        inputs
            .init_image
            .as_ref()
            .ok_or_else(|| Error::InvalidInput(format!("{what} needs an init image")))
    };
    match mode {
        GenerationMode::Txt2Img => Ok(Conditioning {
            init_latents: None,
            inpaint: None,
        }),
        GenerationMode::Img2Img => {
            let image = image_to_tensor(init_image("image-to-image")?, width, height, device)?;
            Ok(Conditioning {
                init_latents: Some(autoencoder.encode(&image)?.to_dtype(DType::F32)?),
                inpaint: None,
            })
        }
        GenerationMode::Inpaint => {
            let image = image_to_tensor(init_image("inpainting")?, width, height, device)?;
            let mask = inputs
                .mask
                .as_ref()
                .ok_or_else(|| Error::InvalidInput("inpainting needs a mask".to_string()))?;
            let keep = mask_to_tensor(mask, width, height, device)?.affine(-1.0, 1.0)?;
            let masked = image.broadcast_mul(&keep)?;
            let masked_latents = autoencoder.encode(&masked)?.to_dtype(DType::F32)?;
            let latent_mask = mask_to_tensor(mask, width / LATENT_FACTOR, height / LATENT_FACTOR, device)?;
            Ok(Conditioning {
                init_latents: Some(autoencoder.encode(&image)?.to_dtype(DType::F32)?),
                inpaint: Some(Tensor::cat(&[&latent_mask, &masked_latents], 1)?),
            })
        }
    }
}

/// Runs `pipeline` for every image of the batch.
///
/// Progress is reported after each step, counting through the whole batch. A
/// cancellation observed after a step ends the run with
/// [`RunOutcome::Canceled`]; the step in flight is always completed.
pub fn run<F: ModelFactory>(
    pipeline: &Pipeline<F>,
    params: &RunParams,
    inputs: &ExtraInputs,
    host: &dyn Host,
) -> Result<RunOutcome> {
    if params.steps == 0 {
        return Err(Error::InvalidInput("steps must be at least 1".to_string()));
    }
    if !(0.0..=1.0).contains(&inputs.strength) {
        return Err(Error::InvalidInput(format!("strength {} is outside [0, 1]", inputs.strength)));
    }
    let model = pipeline.model();
    let device = &model.device;
    let width = round_to_latent_multiple(params.width);
    let height = round_to_latent_multiple(params.height);
    let batch_size = params.batch_size.max(1);
    let mode = pipeline.mode();

    let backbone = model.backbone.lock();
    let text_encoder = model.text_encoder.lock();
    let autoencoder = model.autoencoder.lock();
    let fast_decoder = model.fast_decoder.lock();

    let use_guidance = params.guidance_scale > 1.0;
    let cond = encode_prompt::<F>(&model.tokenizer, &text_encoder, &params.prompt, device)?;
    let context = if use_guidance {
        let uncond = encode_prompt::<F>(&model.tokenizer, &text_encoder, &params.negative_prompt, device)?;
        Tensor::cat(&[uncond, cond], 0)?
    } else {
        cond
    };
    drop(text_encoder);

    let conditioning = prepare_conditioning::<F>(mode, &autoencoder, inputs, width, height, device)?;
    let shape = Shape::from((1, LATENT_CHANNELS, height / LATENT_FACTOR, width / LATENT_FACTOR));

    let strength = match mode {
        GenerationMode::Txt2Img => 1.0,
        _ => inputs.strength,
    };
    let schedule_len = pipeline
        .schedule()
        .build(&model.descriptor.arch, params.steps)?
        .timesteps()
        .len();
    // Image-to-image strength skips the noisiest part of the schedule.
    let run_steps = ((schedule_len as f64 * strength) as usize).clamp(1, schedule_len.max(1));
    let total = run_steps * batch_size;

    let mut completed = 0;
    let mut images = Vec::with_capacity(batch_size);
    for index in 0..batch_size {
        let seed = params.seed.wrapping_add(index as u64);
        let variation = params
            .variation
            .map(|(variation_seed, strength)| (variation_seed.wrapping_add(index as u64), strength));
        let noise = initial_noise(seed, variation, &shape, device, DType::F32)?;

        let mut scheduler = pipeline.schedule().build(&model.descriptor.arch, params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let t_start = timesteps.len().saturating_sub(run_steps);
        let mut latents = match &conditioning.init_latents {
            Some(init) if strength < 1.0 => scheduler.add_noise(init, noise, timesteps[t_start])?,
            _ => (noise * scheduler.init_noise_sigma())?,
        };
        tracing::debug!(index, seed, steps = timesteps.len() - t_start, "denoising");

        for &timestep in &timesteps[t_start..] {
            let input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let input = scheduler.scale_model_input(input, timestep)?;
            let input = match &conditioning.inpaint {
                Some(extra) => {
                    let extra = if use_guidance {
                        Tensor::cat(&[extra, extra], 0)?
                    } else {
                        extra.clone()
                    };
                    Tensor::cat(&[&input, &extra], 1)?
                }
                None => input,
            };

            let noise_pred = backbone.forward(&input, timestep as f64, &context)?.to_dtype(DType::F32)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * params.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            completed += 1;

            let preview = if completed % PREVIEW_INTERVAL == 0 {
                decode_preview(&*fast_decoder, &latents)
            } else {
                None
            };
            host.report_progress(completed, total, preview.as_ref());

            if host.is_canceled() {
                tracing::info!(completed, total, "generation canceled");
                return Ok(RunOutcome::Canceled {
                    completed_steps: completed,
                });
            }
        }

        let decoded = if pipeline.uses_tiny_decoder() {
            fast_decoder.decode(&latents)?
        } else {
            autoencoder.decode(&latents)?
        };
        images.push(tensor_to_image(&decoded.i(0)?)?);
    }

    Ok(RunOutcome::Completed {
        images,
        completed_steps: completed,
    })
}

/// Previews are best effort; a failing decode never aborts the run.
fn decode_preview<D: LatentDecoder>(decoder: &D, latents: &Tensor) -> Option<DynamicImage> {
    let decoded = decoder.decode(latents).and_then(|image| Ok(image.i(0)?));
    match decoded.and_then(|image| tensor_to_image(&image)) {
        Ok(image) => Some(image),
        Err(err) => {
            tracing::debug!(%err, "preview decode failed");
            None
        }
    }
}
