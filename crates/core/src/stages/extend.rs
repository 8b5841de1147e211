use anyhow::Result;
use tracing::{debug, info, warn};

use crate::context::GenerationContext;
use crate::error::UserConfigError;
use crate::graph::inputs;
use crate::media::{MediaCursor, MediaKind};
use crate::params::keys;
use crate::postprocess::{apply_interpolation, save_animation, FINAL_SAVE_ID};
use crate::prompt::{has_extend, parse_prompt};
use crate::registry::PipelineStage;
use crate::sampling::{create_image_to_video, Dimension, VideoGenDescriptor};
use crate::upscale::{upscale_and_refine, LatentChainSet, LatentUpscaleSettings, Reanchor};

/// Offset applied to the request seed before the first segment.
pub const EXTEND_SEED_OFFSET: i64 = 600;

const DEFAULT_CFG: f64 = 7.0;

/// Chains `<extend:N>` segments onto the generated video.
#[derive(Debug, Default)]
pub struct ExtendVideoStage;

impl PipelineStage for ExtendVideoStage {
    fn name(&self) -> &str {
        "extend-video"
    }

    fn run(&self, ctx: &mut GenerationContext<'_>) -> Result<()> {
        run_extend(ctx, None)
    }
}

/// Builds every extend segment from the current frames.
///
/// Each segment conditions on the trailing `overlap` frames of the previous
/// one, drops those frames from its own output and is batched onto the
/// running video. With `upscale`, each segment runs at `1/scale` and goes
/// through the latent upscale refine pass before being resized to the
/// running video's size.
pub fn run_extend(
    ctx: &mut GenerationContext<'_>,
    upscale: Option<(&LatentUpscaleSettings, &LatentChainSet)>,
) -> Result<()> {
    let params = ctx.params();
    let raw_prompt = params.prompt();
    if !has_extend(&raw_prompt) {
        return Ok(());
    }
    let parsed = parse_prompt(&raw_prompt)?;
    let Some(model) = params.model(ctx.models(), keys::VIDEO_EXTEND_MODEL)? else {
        return Err(UserConfigError::MissingExtendModel.into());
    };
    let defaults = ctx.defaults();
    let swap_model = params.model(ctx.models(), keys::VIDEO_EXTEND_SWAP_MODEL)?;
    let swap_percent = params.get(keys::VIDEO_EXTEND_SWAP_PERCENT, 0.5);
    let overlap: u32 = params.get(keys::VIDEO_EXTEND_FRAME_OVERLAP, defaults.extend_frame_overlap);
    let format = params
        .get(keys::VIDEO_EXTEND_FORMAT, "mp4".to_string())
        .to_lowercase();
    let save_intermediate = params.get(keys::OUTPUT_INTERMEDIATE_IMAGES, false);
    let media_fps = ctx.media().and_then(|media| media.fps);
    let mut fps = params.get(
        keys::VIDEO_FPS,
        media_fps.unwrap_or(defaults.default_video_fps),
    );
    let mut seed = params.seed() + EXTEND_SEED_OFFSET;

    let mut current = ctx.ensure_kind(MediaKind::RawImage)?;
    let mut conjoined = current.clone();
    let width = ctx
        .create_node("SwarmImageWidth", inputs([("image", (&current).into())]))?
        .out(0);
    let height = ctx
        .create_node("SwarmImageHeight", inputs([("image", (&current).into())]))?
        .out(0);

    for segment in &parsed.segments {
        if segment.frames <= overlap {
            return Err(UserConfigError::InvalidExtendFrames {
                value: segment.frames.to_string(),
            }
            .into());
        }
        seed += 1;
        let section = segment.section.as_str();
        let cfg = params
            .get_in(keys::CFG_SCALE, section, false)
            .or_else(|| params.get_in(keys::VIDEO_CFG, section, true))
            .unwrap_or_else(|| params.get(keys::CFG_SCALE, DEFAULT_CFG));
        let steps = params
            .get_in(keys::STEPS, section, false)
            .or_else(|| params.get_in(keys::VIDEO_STEPS, section, true))
            .unwrap_or_else(|| params.get(keys::STEPS, defaults.default_video_steps));

        let count = ctx.create_node("SwarmCountFrames", inputs([("image", (&current).into())]))?;
        let window_start = ctx.create_node(
            "SwarmIntAdd",
            inputs([
                ("a", count.out(0).into()),
                ("b", (-i64::from(overlap)).into()),
            ]),
        )?;
        let window = ctx.create_node(
            "ImageFromBatch",
            inputs([
                ("image", (&current).into()),
                ("batch_index", window_start.out(0).into()),
                ("length", overlap.into()),
            ]),
        )?;
        ctx.set_media(MediaCursor::new(window.out(0), MediaKind::RawImage).with_fps(fps));

        let mut desc = VideoGenDescriptor {
            model: model.clone(),
            swap_model: swap_model.clone(),
            swap_percent,
            frames: segment.frames,
            fps,
            cfg: Some(cfg),
            width: Dimension::Linked(width.clone()),
            height: Dimension::Linked(height.clone()),
            prompt: segment.prompt.clone(),
            negative_prompt: params.negative_prompt(),
            steps,
            seed,
            section: segment.section.clone(),
            creativity: None,
        };

        match upscale {
            None => {
                create_image_to_video(ctx, &desc)?;
            }
            Some((settings, chains)) => {
                if settings.scale > 0.0 {
                    let small = ctx.create_node(
                        "ImageScaleBy",
                        inputs([
                            ("image", window.out(0).into()),
                            ("upscale_method", "lanczos".into()),
                            ("scale_by", (1.0 / settings.scale).into()),
                        ]),
                    )?;
                    let small_width = ctx
                        .create_node("SwarmImageWidth", inputs([("image", small.out(0).into())]))?
                        .out(0);
                    let small_height = ctx
                        .create_node("SwarmImageHeight", inputs([("image", small.out(0).into())]))?
                        .out(0);
                    ctx.set_media(
                        MediaCursor::new(small.out(0), MediaKind::RawImage).with_fps(fps),
                    );
                    desc.width = Dimension::Linked(small_width);
                    desc.height = Dimension::Linked(small_height);
                } else {
                    warn!(
                        scale = settings.scale,
                        section = %segment.section,
                        "Invalid upscale factor, extending at the running output size"
                    );
                }

                let (pass, sampled) = create_image_to_video(ctx, &desc)?;
                upscale_and_refine(
                    ctx,
                    &pass,
                    sampled,
                    settings,
                    chains,
                    Reanchor::FrameRate(fps),
                    Dimension::Linked(width.clone()),
                    Dimension::Linked(height.clone()),
                )?;
                let decoded = ctx.ensure_kind(MediaKind::RawImage)?;
                let resized = ctx.create_node(
                    "ImageScale",
                    inputs([
                        ("image", decoded.into()),
                        ("width", (&width).into()),
                        ("height", (&height).into()),
                        ("upscale_method", "lanczos".into()),
                        ("crop", "disabled".into()),
                    ]),
                )?;
                ctx.advance_media(resized.out(0), MediaKind::RawImage);
            }
        }

        let segment_frames = ctx.ensure_kind(MediaKind::RawImage)?;
        if save_intermediate {
            save_animation(ctx, fps, &format, None)?;
        }
        let cut = ctx.create_node(
            "ImageFromBatch",
            inputs([
                ("image", segment_frames.into()),
                ("batch_index", overlap.into()),
                ("length", (segment.frames - overlap).into()),
            ]),
        )?;
        current = cut.out(0);
        let batched = ctx.create_node(
            "ImageBatch",
            inputs([("image1", conjoined.into()), ("image2", (&current).into())]),
        )?;
        conjoined = batched.out(0);
        debug!(segment = segment.index, frames = segment.frames, seed, "Added extend segment");
    }

    ctx.set_media(MediaCursor::new(conjoined, MediaKind::RawImage).with_fps(fps));
    fps = apply_interpolation(ctx, fps, &format)?;
    save_animation(ctx, fps, &format, Some(FINAL_SAVE_ID))?;
    info!(
        segments = parsed.segments.len(),
        overlap,
        upscaled = upscale.is_some(),
        "Extended video"
    );
    Ok(())
}
