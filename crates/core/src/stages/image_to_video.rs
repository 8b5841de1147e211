use anyhow::Result;
use tracing::{debug, warn};

use crate::context::GenerationContext;
use crate::media::MediaKind;
use crate::params::keys;
use crate::postprocess::{finish_video, FinishOptions};
use crate::registry::PipelineStage;
use crate::resolution::{model_hint, resolve, Resolution};
use crate::sampling::{create_image_to_video, Dimension, VideoRequest};

/// Single-pass video generation from the current media.
#[derive(Debug, Default)]
pub struct ImageToVideoStage;

impl PipelineStage for ImageToVideoStage {
    fn name(&self) -> &str {
        "image-to-video"
    }

    fn run(&self, ctx: &mut GenerationContext<'_>) -> Result<()> {
        let params = ctx.params();
        let Some(request) = VideoRequest::from_params(params, ctx.models(), ctx.defaults())? else {
            return Ok(());
        };
        let class = &request.model.compat_class;
        if ctx.media().is_none() && !class.has_joint_audio_video_latent() {
            warn!(model = %request.model.name, "Video model needs an input image but there is no media, skipping video");
            return Ok(());
        }

        // Families with their own latent upscaler leave scaling to it.
        let image_scale = if class.has_joint_audio_video_latent() {
            None
        } else {
            params.try_get::<f64>(keys::REFINER_UPSCALE)
        };
        let resolution = resolve(
            request.policy,
            model_hint(&request.model, ctx.defaults()),
            Resolution::new(params.image_width(), params.image_height()),
            image_scale,
            class.resolution_precision(),
        );
        debug!(%resolution, policy = request.policy.as_str(), "Resolved video resolution");

        let desc = request.descriptor(
            Dimension::Fixed(resolution.width),
            Dimension::Fixed(resolution.height),
        );
        create_image_to_video(ctx, &desc)?;
        ctx.ensure_kind(MediaKind::RawImage)?;
        ctx.set_media_fps(request.fps);
        finish_video(
            ctx,
            &FinishOptions {
                fps: request.fps,
                format: request.format.clone(),
                has_extend: request.has_extend,
            },
        )?;
        Ok(())
    }
}
