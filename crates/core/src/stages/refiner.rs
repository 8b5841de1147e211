use anyhow::Result;
use tracing::{debug, info};

use crate::context::GenerationContext;
use crate::graph::{inputs, NodeRef};
use crate::media::MediaKind;
use crate::model_registry::CompatClass;
use crate::params::{keys, sections};
use crate::prompt::parse_prompt;
use crate::registry::PipelineStage;
use crate::resolution::Resolution;
use crate::sampling::{partial_start_step, Dimension, KSamplerSpec, SamplerChoice};
use crate::upscale::{apply_hypertile, ChainInput, LatentChainSet, Reanchor, UpscaleMethod};

const REFINER_LOADER_ID: &str = "20";
const DEFAULT_STEPS: u32 = 20;
const DEFAULT_CFG: f64 = 7.0;
const DEFAULT_TEXT2VIDEO_FPS: u32 = 24;
const STEP_SWAP_NOISY: &str = "StepSwapNoisy";
/// Pixel-upscale targets are floored to a multiple of this.
const PIXEL_ALIGN: u32 = 16;

/// Second image pass: optional alternate model, upscale, partial resample.
///
/// Runs when both `refiner_method` and `refiner_control` are set.
#[derive(Debug, Clone, Default)]
pub struct RefinerStage {
    chains: LatentChainSet,
}

impl RefinerStage {
    /// Stock refiner; `latentmodel-` upscales are rejected.
    pub fn new() -> Self {
        Self::with_chains(LatentChainSet::empty())
    }

    pub fn with_chains(chains: LatentChainSet) -> Self {
        Self { chains }
    }
}

impl PipelineStage for RefinerStage {
    fn name(&self) -> &str {
        "refiner"
    }

    fn run(&self, ctx: &mut GenerationContext<'_>) -> Result<()> {
        let params = ctx.params();
        let (Some(method), Some(control)) = (
            params.try_get::<String>(keys::REFINER_METHOD),
            params.try_get::<f64>(keys::REFINER_CONTROL),
        ) else {
            return Ok(());
        };
        let Some(base) = ctx.base_model.clone() else {
            debug!("No base model loaded, skipping refiner");
            return Ok(());
        };
        if ctx.media().is_none() {
            debug!("No media to refine, skipping refiner");
            return Ok(());
        }

        let original_vae = ctx.require_vae()?;
        let mut must_reencode = false;
        let loaded = match params.model(ctx.models(), keys::REFINER_MODEL)? {
            Some(entry) => {
                must_reencode = entry.compat_class != base.entry.compat_class
                    && !(entry.compat_class == CompatClass::StableDiffusionXlRefiner
                        && base.entry.compat_class == CompatClass::StableDiffusionXl);
                ctx.load_checkpoint(&entry, Some(REFINER_LOADER_ID))?
            }
            None => base,
        };
        let mut vae = loaded.vae.clone();
        if let Some(vae_name) = params
            .try_get::<String>(keys::REFINER_VAE)
            .filter(|name| !name.trim().is_empty())
        {
            must_reencode = true;
            vae = ctx
                .create_node("VAELoader", inputs([("vae_name", vae_name.into())]))?
                .out(0);
        }
        ctx.current_vae = Some(vae.clone());

        let prompt = parse_prompt(&params.prompt())?.base;
        let mut positive = ctx.encode_prompt(&loaded.clip, &prompt, None)?;
        let mut negative = ctx.encode_prompt(&loaded.clip, &params.negative_prompt(), None)?;

        let save_intermediate = params.get(keys::OUTPUT_INTERMEDIATE_IMAGES, false);
        let scale = params
            .try_get::<f64>(keys::REFINER_UPSCALE)
            .filter(|scale| *scale != 1.0);
        let upscale_method = UpscaleMethod::from_params(params);
        let pixel_upscale = scale.is_some() && upscale_method.is_pixel();
        let target = pixel_target(
            Resolution::new(params.image_width(), params.image_height()),
            scale.unwrap_or(1.0),
        );

        if must_reencode || pixel_upscale || save_intermediate {
            let media = ctx.require_media()?.clone();
            let mut pixels = match media.kind {
                MediaKind::RawImage => media.reference,
                _ => {
                    let latent = ctx.ensure_kind(MediaKind::Latent)?;
                    ctx.create_node_with_id(
                        "VAEDecode",
                        inputs([("samples", latent.into()), ("vae", original_vae.into())]),
                        "24",
                    )?
                    .out(0)
                }
            };
            if save_intermediate {
                ctx.create_node_with_id(
                    "SwarmSaveImageWS",
                    inputs([("images", (&pixels).into())]),
                    "29",
                )?;
            }
            if pixel_upscale {
                pixels = pixel_upscale_nodes(ctx, &upscale_method, pixels, target)?;
                if control <= 0.0 {
                    info!(%target, "Refiner control is zero, keeping the pixel upscale without resampling");
                    ctx.advance_media(pixels, MediaKind::RawImage);
                    return Ok(());
                }
            }
            if must_reencode || pixel_upscale {
                let encoded = ctx.create_node_with_id(
                    "VAEEncode",
                    inputs([("pixels", pixels.into()), ("vae", (&vae).into())]),
                    "25",
                )?;
                ctx.advance_media(encoded.out(0), MediaKind::Latent);
            }
        }

        if let Some(scale) = scale {
            match &upscale_method {
                UpscaleMethod::Latent(interp) => {
                    let samples = ctx.ensure_kind(MediaKind::Latent)?;
                    let upscaled = ctx.create_node_with_id(
                        "LatentUpscaleBy",
                        inputs([
                            ("samples", samples.into()),
                            ("upscale_method", interp.as_str().into()),
                            ("scale_by", scale.into()),
                        ]),
                        "26",
                    )?;
                    ctx.advance_media(upscaled.out(0), MediaKind::Latent);
                }
                UpscaleMethod::LatentModel(model_name) => {
                    let chain = self.chains.require(&loaded.entry.compat_class)?;
                    let samples = latent_reference(ctx)?;
                    let output = chain.apply(
                        ctx,
                        ChainInput {
                            samples,
                            positive,
                            negative,
                            vae: vae.clone(),
                            upscale_model: model_name,
                            width: Dimension::Fixed(target.width),
                            height: Dimension::Fixed(target.height),
                            reanchor: Reanchor::FrameRate(
                                params.get(keys::TEXT2VIDEO_FPS, DEFAULT_TEXT2VIDEO_FPS),
                            ),
                            loader_id: Some("27"),
                            output_id: Some("26"),
                        },
                    )?;
                    positive = output.positive;
                    negative = output.negative;
                }
                _ => {}
            }
        }

        let model = apply_hypertile(ctx, loaded.model.clone())?;
        let steps = params
            .get_in(keys::REFINER_STEPS, sections::REFINER, true)
            .or_else(|| params.get_in(keys::STEPS, sections::REFINER, true))
            .unwrap_or(DEFAULT_STEPS);
        let cfg = params
            .get_in(keys::REFINER_CFG_SCALE, sections::REFINER, true)
            .or_else(|| params.get_in(keys::CFG_SCALE, sections::REFINER, true))
            .unwrap_or(DEFAULT_CFG);

        let samples = latent_reference(ctx)?;
        let kind = ctx.require_media()?.kind;
        let mut spec = KSamplerSpec::new(
            model,
            positive,
            negative,
            samples,
            params.seed() + 1,
            steps,
            cfg,
        );
        spec.sampler = SamplerChoice::for_refiner(params);
        spec.start_at_step = partial_start_step(steps, control);
        spec.add_noise = method != STEP_SWAP_NOISY;
        spec.tiled = params.get(keys::REFINER_DO_TILING, false);
        let refined = spec.emit(ctx, Some("23"))?;
        ctx.advance_media(refined, kind);
        Ok(())
    }
}

/// `round(side * scale)` floored to a multiple of 16.
fn pixel_target(image: Resolution, scale: f64) -> Resolution {
    let scaled = image.scaled(scale);
    Resolution::new(
        (scaled.width / PIXEL_ALIGN) * PIXEL_ALIGN,
        (scaled.height / PIXEL_ALIGN) * PIXEL_ALIGN,
    )
}

fn pixel_upscale_nodes(
    ctx: &mut GenerationContext<'_>,
    method: &UpscaleMethod,
    pixels: NodeRef,
    target: Resolution,
) -> Result<NodeRef> {
    let (source, interp) = match method {
        UpscaleMethod::Model(model_name) => {
            let loader = ctx.create_node_with_id(
                "UpscaleModelLoader",
                inputs([("model_name", model_name.as_str().into())]),
                "27",
            )?;
            let upscaled = ctx.create_node_with_id(
                "ImageUpscaleWithModel",
                inputs([("upscale_model", loader.out(0).into()), ("image", pixels.into())]),
                "28",
            )?;
            (upscaled.out(0), "lanczos")
        }
        UpscaleMethod::Pixel(interp) => (pixels, interp.as_str()),
        _ => return Ok(pixels),
    };
    let scaled = ctx.create_node_with_id(
        "ImageScale",
        inputs([
            ("image", source.into()),
            ("width", target.width.into()),
            ("height", target.height.into()),
            ("upscale_method", interp.into()),
            ("crop", "disabled".into()),
        ]),
        "26",
    )?;
    Ok(scaled.out(0))
}

/// Current media as something a sampler accepts; joint latents stay joint.
fn latent_reference(ctx: &mut GenerationContext<'_>) -> Result<NodeRef> {
    let kind = ctx.require_media()?.kind;
    match kind {
        MediaKind::RawImage => ctx.ensure_kind(MediaKind::Latent),
        _ => Ok(ctx.require_media()?.reference.clone()),
    }
}
