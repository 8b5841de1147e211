use anyhow::Result;
use tracing::debug;

use crate::context::GenerationContext;
use crate::graph::inputs;
use crate::media::MediaKind;
use crate::params::{keys, sections};
use crate::postprocess::{save_animation, FINAL_SAVE_ID};
use crate::prompt::{has_extend, parse_prompt};
use crate::registry::PipelineStage;
use crate::sampling::{creativity_start_step, KSamplerSpec, SamplerChoice};
use crate::upscale::PREVIEW_SAVE_ID;

const DEFAULT_STEPS: u32 = 20;
const DEFAULT_CFG: f64 = 7.0;
const DEFAULT_INIT_IMAGE_CREATIVITY: f64 = 0.6;

/// `model` -> `CheckpointLoaderSimple` "4".
#[derive(Debug, Default)]
pub struct LoadModelStage;

impl PipelineStage for LoadModelStage {
    fn name(&self) -> &str {
        "load-model"
    }

    fn run(&self, ctx: &mut GenerationContext<'_>) -> Result<()> {
        let Some(entry) = ctx.params().model(ctx.models(), keys::MODEL)? else {
            debug!("No base model selected");
            return Ok(());
        };
        let loaded = ctx.load_checkpoint(&entry, Some("4"))?;
        ctx.current_vae = Some(loaded.vae.clone());
        ctx.base_model = Some(loaded);
        Ok(())
    }
}

/// Encodes the base prompt pair as "6" and "7".
#[derive(Debug, Default)]
pub struct PromptStage;

impl PipelineStage for PromptStage {
    fn name(&self) -> &str {
        "prompt"
    }

    fn run(&self, ctx: &mut GenerationContext<'_>) -> Result<()> {
        let Some(clip) = ctx.base_model.as_ref().map(|loaded| loaded.clip.clone()) else {
            return Ok(());
        };
        let params = ctx.params();
        let prompt = parse_prompt(&params.prompt())?.base;
        ctx.positive = Some(ctx.encode_prompt(&clip, &prompt, Some("6"))?);
        ctx.negative = Some(ctx.encode_prompt(&clip, &params.negative_prompt(), Some("7"))?);
        Ok(())
    }
}

/// `init_image` as `LoadImage` "15", otherwise an empty latent "5".
#[derive(Debug, Default)]
pub struct InitialMediaStage;

impl PipelineStage for InitialMediaStage {
    fn name(&self) -> &str {
        "initial-media"
    }

    fn run(&self, ctx: &mut GenerationContext<'_>) -> Result<()> {
        let params = ctx.params();
        if let Some(image) = params.try_get::<String>(keys::INIT_IMAGE) {
            let loaded = ctx.create_node_with_id("LoadImage", inputs([("image", image.into())]), "15")?;
            ctx.advance_media(loaded.out(0), MediaKind::RawImage);
            return Ok(());
        }
        if ctx.base_model.is_none() {
            return Ok(());
        }
        let empty = ctx.create_node_with_id(
            "EmptyLatentImage",
            inputs([
                ("width", params.image_width().into()),
                ("height", params.image_height().into()),
                ("batch_size", 1.into()),
            ]),
            "5",
        )?;
        ctx.advance_media(empty.out(0), MediaKind::Latent);
        Ok(())
    }
}

/// First image pass, `SwarmKSampler` "10".
#[derive(Debug, Default)]
pub struct BaseSamplerStage;

impl PipelineStage for BaseSamplerStage {
    fn name(&self) -> &str {
        "base-sampler"
    }

    fn run(&self, ctx: &mut GenerationContext<'_>) -> Result<()> {
        let (Some(loaded), Some(positive), Some(negative)) = (
            ctx.base_model.clone(),
            ctx.positive.clone(),
            ctx.negative.clone(),
        ) else {
            return Ok(());
        };
        if ctx.media().is_none() {
            return Ok(());
        }
        let params = ctx.params();
        let steps = params
            .get_in(keys::STEPS, sections::BASE, true)
            .unwrap_or(DEFAULT_STEPS);
        let cfg = params
            .get_in(keys::CFG_SCALE, sections::BASE, true)
            .unwrap_or(DEFAULT_CFG);

        let mut start_at_step = 0;
        if params.contains(keys::INIT_IMAGE) {
            let creativity = params.get(keys::INIT_IMAGE_CREATIVITY, DEFAULT_INIT_IMAGE_CREATIVITY);
            if creativity <= 0.0 {
                debug!("Init image creativity is zero, keeping the image unsampled");
                return Ok(());
            }
            start_at_step = creativity_start_step(steps, creativity);
        }

        let latent = ctx.ensure_kind(MediaKind::Latent)?;
        let mut spec = KSamplerSpec::new(
            loaded.model,
            positive,
            negative,
            latent,
            params.seed(),
            steps,
            cfg,
        );
        spec.sampler = SamplerChoice::for_section(params, sections::BASE);
        spec.start_at_step = start_at_step;
        let sampled = spec.emit(ctx, Some("10"))?;
        ctx.advance_media(sampled, MediaKind::Latent);
        Ok(())
    }
}

/// Latent media to pixels, `VAEDecode` "8".
#[derive(Debug, Default)]
pub struct DecodeStage;

impl PipelineStage for DecodeStage {
    fn name(&self) -> &str {
        "decode"
    }

    fn run(&self, ctx: &mut GenerationContext<'_>) -> Result<()> {
        match ctx.media().map(|media| media.kind) {
            None | Some(MediaKind::RawImage) => return Ok(()),
            Some(_) => {}
        }
        let latent = ctx.ensure_kind(MediaKind::Latent)?;
        let vae = ctx.require_vae()?;
        let decoded = ctx.create_node_with_id(
            "VAEDecode",
            inputs([("samples", latent.into()), ("vae", vae.into())]),
            "8",
        )?;
        ctx.advance_media(decoded.out(0), MediaKind::RawImage);
        Ok(())
    }
}

/// Saves the image result: "9", or a preview "30" when a video step follows.
#[derive(Debug, Default)]
pub struct SaveImageStage;

impl PipelineStage for SaveImageStage {
    fn name(&self) -> &str {
        "save-image"
    }

    fn run(&self, ctx: &mut GenerationContext<'_>) -> Result<()> {
        if ctx.media().is_none() {
            return Ok(());
        }
        let params = ctx.params();
        let video_follows = params.contains(keys::VIDEO_MODEL) || has_extend(&params.prompt());
        if video_follows {
            let fps = ctx
                .media()
                .and_then(|media| media.fps)
                .unwrap_or(ctx.defaults().default_video_fps);
            let format = params
                .get(keys::VIDEO_FORMAT, "h264-mp4".to_string())
                .to_lowercase();
            save_animation(ctx, fps, &format, Some(PREVIEW_SAVE_ID))?;
            return Ok(());
        }

        let images = ctx.ensure_kind(MediaKind::RawImage)?;
        ctx.create_node_with_id(
            "SwarmSaveImageWS",
            inputs([("images", images.into())]),
            FINAL_SAVE_ID,
        )?;
        Ok(())
    }
}
