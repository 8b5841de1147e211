use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::context::GenerationContext;
use crate::error::UserConfigError;
use crate::graph::{inputs, NodeRef};
use crate::media::{MediaCursor, MediaKind};
use crate::model_registry::{CompatClass, ModelEntry, ModelRegistry};
use crate::params::{keys, sections, ParamSet};
use crate::postprocess::{finish_video, FinishOptions};
use crate::resolution::{model_hint, resolve, split_base_target, Resolution};
use crate::sampling::{
    create_image_to_video, partial_start_step, Dimension, KSamplerSpec, SamplerChoice, VideoPass,
    VideoRequest, DEFAULT_PREVIEWS,
};

/// Node id of the preview save emitted by the image save stage.
pub const PREVIEW_SAVE_ID: &str = "30";

const STEP_SWAP_NOISY: &str = "StepSwapNoisy";

/// Parsed `refiner_upscale_method`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpscaleMethod {
    None,
    /// `pixel-<interp>`: plain image resize.
    Pixel(String),
    /// `model-<name>`: pixel-space upscale model.
    Model(String),
    /// `latent-<interp>`: plain latent resize.
    Latent(String),
    /// `latentmodel-<name>`: learned latent upsampler.
    LatentModel(String),
}

impl UpscaleMethod {
    pub fn parse(raw: &str) -> Self {
        if let Some(name) = raw.strip_prefix("latentmodel-") {
            Self::LatentModel(name.to_string())
        } else if let Some(name) = raw.strip_prefix("latent-") {
            Self::Latent(name.to_string())
        } else if let Some(name) = raw.strip_prefix("pixel-") {
            Self::Pixel(name.to_string())
        } else if let Some(name) = raw.strip_prefix("model-") {
            Self::Model(name.to_string())
        } else {
            Self::None
        }
    }

    pub fn from_params(params: &ParamSet) -> Self {
        Self::parse(&params.get(keys::REFINER_UPSCALE_METHOD, "None".to_string()))
    }

    /// Whether the method works on decoded pixels.
    pub fn is_pixel(&self) -> bool {
        matches!(self, Self::Pixel(_) | Self::Model(_))
    }
}

/// Which video stage is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpscaleEntry {
    ImageToVideo,
    /// Extend segments, which start from frames already in the graph.
    VideoToVideo,
}

impl UpscaleEntry {
    fn model_key(self) -> &'static str {
        match self {
            Self::ImageToVideo => keys::VIDEO_MODEL,
            Self::VideoToVideo => keys::VIDEO_EXTEND_MODEL,
        }
    }
}

/// Everything the two-stage path needs once the predicate holds.
#[derive(Debug, Clone, PartialEq)]
pub struct LatentUpscaleSettings {
    pub model: ModelEntry,
    pub scale: f64,
    /// Upsampler model name, i.e. the method without its `latentmodel-` prefix.
    pub upscale_model: String,
    pub control: f64,
}

/// Decides whether a request takes the latent-upscale path.
///
/// Every unmet condition routes to the stock path; the reason is logged at
/// debug and nothing is an error except an unknown model name.
pub fn wants_latent_upscale(
    params: &ParamSet,
    models: &ModelRegistry,
    entry: UpscaleEntry,
) -> Result<Option<LatentUpscaleSettings>> {
    let Some(model) = params.model(models, entry.model_key())? else {
        debug!(?entry, "No video model selected, latent upscale not used");
        return Ok(None);
    };
    if model.compat_class != CompatClass::Ltxv2 {
        debug!(model = %model.name, class = %model.compat_class, "Video model is not ltxv2, latent upscale not used");
        return Ok(None);
    }
    if entry == UpscaleEntry::ImageToVideo && !params.contains(keys::INIT_IMAGE) {
        debug!("No initial image, latent upscale not used");
        return Ok(None);
    }
    let scale = match params.try_get::<f64>(keys::REFINER_UPSCALE) {
        Some(scale) if scale != 1.0 => scale,
        other => {
            debug!(scale = ?other, "Refiner upscale unset or 1, latent upscale not used");
            return Ok(None);
        }
    };
    let UpscaleMethod::LatentModel(upscale_model) = UpscaleMethod::from_params(params) else {
        debug!("Refiner upscale method is not latentmodel-, latent upscale not used");
        return Ok(None);
    };
    let control = match params.try_get::<f64>(keys::REFINER_CONTROL) {
        Some(control) if control > 0.0 => control,
        other => {
            debug!(control = ?other, "Refiner control unset or not positive, latent upscale not used");
            return Ok(None);
        }
    };

    Ok(Some(LatentUpscaleSettings {
        model,
        scale,
        upscale_model,
        control,
    }))
}

/// How the upscaled latent is tied back to its conditioning.
#[derive(Debug, Clone, PartialEq)]
pub enum Reanchor {
    /// Re-inject the target-size conditioning image into the latent.
    Image(NodeRef),
    /// Re-apply frame-rate conditioning.
    FrameRate(u32),
}

#[derive(Debug, Clone)]
pub struct ChainInput<'i> {
    pub samples: NodeRef,
    pub positive: NodeRef,
    pub negative: NodeRef,
    pub vae: NodeRef,
    pub upscale_model: &'i str,
    pub width: Dimension,
    pub height: Dimension,
    pub reanchor: Reanchor,
    /// Stable id for the upsampler loader; dynamic when `None`.
    pub loader_id: Option<&'i str>,
    /// Stable id for the node producing the upscaled latent.
    pub output_id: Option<&'i str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChainOutput {
    pub samples: NodeRef,
    pub positive: NodeRef,
    pub negative: NodeRef,
    pub kind: MediaKind,
    /// Audio latent split off before upscaling, if the family carries one.
    pub audio_latent: Option<NodeRef>,
}

/// Node sequence that upscales a latent for one model family.
///
/// Implementations leave the media cursor on the chain output.
pub trait LatentUpscaleChain: Send + Sync {
    fn name(&self) -> &str;

    fn apply(&self, ctx: &mut GenerationContext<'_>, input: ChainInput<'_>) -> Result<ChainOutput>;
}

/// Separate, crop guides, upsample, re-anchor, recombine.
#[derive(Debug, Default)]
pub struct JointAudioVideoChain;

impl LatentUpscaleChain for JointAudioVideoChain {
    fn name(&self) -> &str {
        "joint-audio-video"
    }

    fn apply(&self, ctx: &mut GenerationContext<'_>, input: ChainInput<'_>) -> Result<ChainOutput> {
        let fps = ctx.media().and_then(|media| media.fps);
        let mut cursor = MediaCursor::new(input.samples, MediaKind::LatentAudioVideo);
        cursor.fps = fps;
        ctx.set_media(cursor);

        let video = ctx.ensure_kind(MediaKind::Latent)?;
        let audio = ctx.require_media()?.audio_latent.clone();

        let cropped = ctx.create_node(
            "LTXVCropGuides",
            inputs([
                ("positive", input.positive.into()),
                ("negative", input.negative.into()),
                ("latent", video.into()),
            ]),
        )?;
        let loader = ctx.create_node_at(
            "LatentUpscaleModelLoader",
            inputs([("model_name", input.upscale_model.into())]),
            input.loader_id,
        )?;
        let upsampled = ctx.create_node_at(
            "LTXVLatentUpsampler",
            inputs([
                ("vae", (&input.vae).into()),
                ("samples", cropped.out(2).into()),
                ("upscale_model", loader.out(0).into()),
            ]),
            input.output_id,
        )?;

        let (samples, positive, negative) = match input.reanchor {
            Reanchor::Image(image) => {
                let preprocessed = ctx.create_node(
                    "LTXVPreprocess",
                    inputs([("image", image.into()), ("img_compression", 32.into())]),
                )?;
                let anchored = ctx.create_node(
                    "LTXVImgToVideoInplace",
                    inputs([
                        ("vae", input.vae.into()),
                        ("image", preprocessed.out(0).into()),
                        ("latent", upsampled.out(0).into()),
                        ("strength", 1.0.into()),
                        ("bypass", false.into()),
                    ]),
                )?;
                (anchored.out(0), cropped.out(0), cropped.out(1))
            }
            Reanchor::FrameRate(frame_rate) => {
                let conditioned = ctx.create_node(
                    "LTXVConditioning",
                    inputs([
                        ("positive", cropped.out(0).into()),
                        ("negative", cropped.out(1).into()),
                        ("frame_rate", frame_rate.into()),
                    ]),
                )?;
                (upsampled.out(0), conditioned.out(0), conditioned.out(1))
            }
        };

        ctx.advance_media(samples, MediaKind::Latent);
        let joined = ctx.ensure_kind(MediaKind::LatentAudioVideo)?;

        Ok(ChainOutput {
            samples: joined,
            positive,
            negative,
            kind: MediaKind::LatentAudioVideo,
            audio_latent: audio,
        })
    }
}

/// One learned upscale node at the exact target size.
#[derive(Debug, Default)]
pub struct SingleChannelChain;

impl LatentUpscaleChain for SingleChannelChain {
    fn name(&self) -> &str {
        "single-channel"
    }

    fn apply(&self, ctx: &mut GenerationContext<'_>, input: ChainInput<'_>) -> Result<ChainOutput> {
        let loader = ctx.create_node_at(
            "LatentUpscaleModelLoader",
            inputs([("model_name", input.upscale_model.into())]),
            input.loader_id,
        )?;
        let upscaled = ctx.create_node_at(
            "HunyuanVideo15LatentUpscaleWithModel",
            inputs([
                ("model", loader.out(0).into()),
                ("samples", input.samples.into()),
                ("upscale_method", "bilinear".into()),
                ("width", input.width.into()),
                ("height", input.height.into()),
                ("crop", "disabled".into()),
            ]),
            input.output_id,
        )?;
        ctx.advance_media(upscaled.out(0), MediaKind::Latent);

        Ok(ChainOutput {
            samples: upscaled.out(0),
            positive: input.positive,
            negative: input.negative,
            kind: MediaKind::Latent,
            audio_latent: None,
        })
    }
}

/// Latent upscale chains keyed by compatibility class.
#[derive(Clone, Default)]
pub struct LatentChainSet {
    chains: Vec<(CompatClass, Arc<dyn LatentUpscaleChain>)>,
}

impl fmt::Debug for LatentChainSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.chains.iter().map(|(class, chain)| (class.id(), chain.name())))
            .finish()
    }
}

impl LatentChainSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Chains for every family with a known latent upsampler.
    pub fn builtin() -> Self {
        let mut set = Self::empty();
        set.register(CompatClass::Ltxv2, JointAudioVideoChain);
        set.register(CompatClass::HunyuanVideo15, SingleChannelChain);
        set
    }

    pub fn register<C>(&mut self, class: CompatClass, chain: C)
    where
        C: LatentUpscaleChain + 'static,
    {
        self.chains.retain(|(existing, _)| *existing != class);
        self.chains.push((class, Arc::new(chain)));
    }

    pub fn find(&self, class: &CompatClass) -> Option<Arc<dyn LatentUpscaleChain>> {
        self.chains
            .iter()
            .find(|(registered, _)| registered == class)
            .map(|(_, chain)| Arc::clone(chain))
    }

    pub fn require(&self, class: &CompatClass) -> Result<Arc<dyn LatentUpscaleChain>> {
        self.find(class).ok_or_else(|| {
            UserConfigError::UnsupportedLatentUpscale {
                compat_class: class.id().to_string(),
            }
            .into()
        })
    }

    pub fn len(&self) -> usize {
        self.chains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }
}

/// Wraps `model` in `HyperTile` when `refiner_hypertile` is set.
pub fn apply_hypertile(ctx: &mut GenerationContext<'_>, model: NodeRef) -> Result<NodeRef> {
    let Some(tile_size) = ctx.params().try_get::<u32>(keys::REFINER_HYPERTILE) else {
        return Ok(model);
    };
    let tiled = ctx.create_node(
        "HyperTile",
        inputs([
            ("model", model.into()),
            ("tile_size", tile_size.into()),
            ("swap_size", 2.into()),
            ("max_depth", 0.into()),
            ("scale_depth", false.into()),
        ]),
    )?;
    Ok(tiled.out(0))
}

/// Upscales `samples` through the family's chain and runs the refine pass.
///
/// The cursor ends on the refined latent.
#[allow(clippy::too_many_arguments)]
pub fn upscale_and_refine(
    ctx: &mut GenerationContext<'_>,
    pass: &VideoPass,
    samples: NodeRef,
    settings: &LatentUpscaleSettings,
    chains: &LatentChainSet,
    reanchor: Reanchor,
    width: Dimension,
    height: Dimension,
) -> Result<NodeRef> {
    let params = ctx.params();
    let chain = chains.require(&pass.compat_class)?;
    let upscaled = chain.apply(
        ctx,
        ChainInput {
            samples,
            positive: pass.positive.clone(),
            negative: pass.negative.clone(),
            vae: pass.vae.clone(),
            upscale_model: &settings.upscale_model,
            width,
            height,
            reanchor,
            loader_id: None,
            output_id: None,
        },
    )?;

    let steps = params
        .get_in(keys::REFINER_STEPS, sections::REFINER, true)
        .unwrap_or(pass.steps);
    let cfg = params
        .get_in(keys::REFINER_CFG_SCALE, sections::REFINER, true)
        .unwrap_or(pass.cfg);
    let method: String = params.get(keys::REFINER_METHOD, "PostApply".to_string());
    let model = apply_hypertile(ctx, pass.model.clone())?;

    let mut spec = KSamplerSpec::new(
        model,
        upscaled.positive,
        upscaled.negative,
        upscaled.samples,
        pass.seed + 1,
        steps,
        cfg,
    )
    .video_sigmas();
    spec.sampler = SamplerChoice::for_refiner(params);
    spec.start_at_step = partial_start_step(steps, settings.control);
    spec.add_noise = method != STEP_SWAP_NOISY;
    spec.tiled = params.get(keys::REFINER_DO_TILING, false);
    spec.previews = params.get(keys::VIDEO_PREVIEW_TYPE, DEFAULT_PREVIEWS.to_string());
    let start_at_step = spec.start_at_step;

    let refined = spec.emit(ctx, None)?;
    ctx.set_media(MediaCursor::new(refined.clone(), upscaled.kind).with_fps(pass.fps));
    info!(
        chain = chain.name(),
        steps,
        start_at_step,
        seed = pass.seed + 1,
        "Added latent upscale refine pass"
    );
    Ok(refined)
}

/// Image-to-video at base resolution, latent upscale, refine at target.
///
/// `snapshot` is the conditioning image as pixels, taken before any video
/// node was added.
pub fn run_two_stage_image_to_video(
    ctx: &mut GenerationContext<'_>,
    request: &VideoRequest,
    settings: &LatentUpscaleSettings,
    chains: &LatentChainSet,
    snapshot: NodeRef,
) -> Result<()> {
    let params = ctx.params();
    let hint = model_hint(&request.model, ctx.defaults());
    let input = Resolution::new(params.image_width(), params.image_height());
    let target = resolve(
        request.policy,
        hint,
        input,
        Some(settings.scale),
        request.model.compat_class.resolution_precision(),
    );
    let base = split_base_target(target, settings.scale);
    info!(%target, %base, scale = settings.scale, "Using two-stage latent upscale video pipeline");

    let scaled = ctx.create_node(
        "ImageScale",
        inputs([
            ("image", snapshot.into()),
            ("width", target.width.into()),
            ("height", target.height.into()),
            ("upscale_method", "lanczos".into()),
            ("crop", "disabled".into()),
        ]),
    )?;
    ctx.advance_media(scaled.out(0), MediaKind::RawImage);

    let desc = request.descriptor(Dimension::Fixed(base.width), Dimension::Fixed(base.height));
    let (pass, sampled) = create_image_to_video(ctx, &desc)?;
    upscale_and_refine(
        ctx,
        &pass,
        sampled,
        settings,
        chains,
        Reanchor::Image(scaled.out(0)),
        Dimension::Fixed(target.width),
        Dimension::Fixed(target.height),
    )?;

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
    remove_preview_save(ctx);
    Ok(())
}

/// Drops the image-stage preview save; the video save replaces it.
pub fn remove_preview_save(ctx: &mut GenerationContext<'_>) -> bool {
    let is_animation_save = ctx
        .graph()
        .get(PREVIEW_SAVE_ID)
        .is_some_and(|record| record.class_type == "SwarmSaveAnimationWS");
    if !is_animation_save {
        return false;
    }
    let removed = ctx.remove_node(PREVIEW_SAVE_ID);
    if removed {
        info!(node = PREVIEW_SAVE_ID, "Removed preview save superseded by the upscaled video");
    }
    removed
}
