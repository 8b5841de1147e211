use anyhow::{bail, Result};
use tracing::debug;

use crate::config::GenerationDefaults;
use crate::context::{GenerationContext, LoadedModel};
use crate::graph::{inputs, InputValue, NodeRef};
use crate::media::{MediaCursor, MediaKind};
use crate::model_registry::{CompatClass, ModelEntry, ModelRegistry};
use crate::params::{keys, sections, ParamSet};
use crate::prompt::{has_extend, parse_prompt};
use crate::resolution::ResolutionPolicy;

/// `end_at_step` meaning "run to the last step".
pub const END_AT_STEP_ALL: u32 = 10000;
pub const VIDEO_SIGMA_MIN: f64 = 0.002;
pub const VIDEO_SIGMA_MAX: f64 = 1000.0;

const DEFAULT_SAMPLER: &str = "euler";
const DEFAULT_SCHEDULER: &str = "normal";
pub const DEFAULT_PREVIEWS: &str = "animate";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamplerChoice {
    pub sampler: String,
    pub scheduler: String,
}

impl SamplerChoice {
    /// Section override, then the base parameters, then defaults.
    pub fn for_section(params: &ParamSet, section: &str) -> Self {
        Self {
            sampler: params
                .get_in(keys::SAMPLER, section, true)
                .unwrap_or_else(|| DEFAULT_SAMPLER.to_string()),
            scheduler: params
                .get_in(keys::SCHEDULER, section, true)
                .unwrap_or_else(|| DEFAULT_SCHEDULER.to_string()),
        }
    }

    /// Like `for_section`, but the swap section wins when a swap model runs.
    pub fn for_video(params: &ParamSet, section: &str, has_swap: bool) -> Self {
        let mut choice = Self::for_section(params, section);
        if has_swap {
            if let Some(sampler) = params.get_in(keys::SAMPLER, sections::VIDEO_SWAP, false) {
                choice.sampler = sampler;
            }
            if let Some(scheduler) = params.get_in(keys::SCHEDULER, sections::VIDEO_SWAP, false) {
                choice.scheduler = scheduler;
            }
        }
        choice
    }

    /// Refiner section, then `refiner_sampler`/`refiner_scheduler`, then base.
    pub fn for_refiner(params: &ParamSet) -> Self {
        let base = Self::for_section(params, sections::REFINER);
        Self {
            sampler: params
                .get_in(keys::SAMPLER, sections::REFINER, false)
                .or_else(|| params.try_get(keys::REFINER_SAMPLER))
                .unwrap_or(base.sampler),
            scheduler: params
                .get_in(keys::SCHEDULER, sections::REFINER, false)
                .or_else(|| params.try_get(keys::REFINER_SCHEDULER))
                .unwrap_or(base.scheduler),
        }
    }
}

/// Inputs of one `SwarmKSampler` node.
#[derive(Debug, Clone)]
pub struct KSamplerSpec {
    pub model: NodeRef,
    pub positive: NodeRef,
    pub negative: NodeRef,
    pub latent: NodeRef,
    pub seed: i64,
    pub steps: u32,
    pub cfg: f64,
    pub sampler: SamplerChoice,
    pub start_at_step: u32,
    pub end_at_step: u32,
    pub add_noise: bool,
    pub return_with_leftover_noise: bool,
    pub sigma_min: f64,
    pub sigma_max: f64,
    pub previews: String,
    pub tiled: bool,
}

impl KSamplerSpec {
    pub fn new(
        model: NodeRef,
        positive: NodeRef,
        negative: NodeRef,
        latent: NodeRef,
        seed: i64,
        steps: u32,
        cfg: f64,
    ) -> Self {
        Self {
            model,
            positive,
            negative,
            latent,
            seed,
            steps,
            cfg,
            sampler: SamplerChoice {
                sampler: DEFAULT_SAMPLER.to_string(),
                scheduler: DEFAULT_SCHEDULER.to_string(),
            },
            start_at_step: 0,
            end_at_step: END_AT_STEP_ALL,
            add_noise: true,
            return_with_leftover_noise: false,
            sigma_min: -1.0,
            sigma_max: -1.0,
            previews: "default".to_string(),
            tiled: false,
        }
    }

    pub fn video_sigmas(mut self) -> Self {
        self.sigma_min = VIDEO_SIGMA_MIN;
        self.sigma_max = VIDEO_SIGMA_MAX;
        self
    }

    pub fn emit(self, ctx: &mut GenerationContext<'_>, id: Option<&str>) -> Result<NodeRef> {
        let node = ctx.create_node_at(
            "SwarmKSampler",
            inputs([
                ("model", self.model.into()),
                ("positive", self.positive.into()),
                ("negative", self.negative.into()),
                ("latent_image", self.latent.into()),
                ("noise_seed", self.seed.into()),
                ("steps", self.steps.into()),
                ("cfg", self.cfg.into()),
                ("sampler_name", self.sampler.sampler.into()),
                ("scheduler", self.sampler.scheduler.into()),
                ("start_at_step", self.start_at_step.into()),
                ("end_at_step", self.end_at_step.into()),
                ("var_seed", 0.into()),
                ("var_seed_strength", 0.0.into()),
                ("sigma_min", self.sigma_min.into()),
                ("sigma_max", self.sigma_max.into()),
                ("rho", 7.0.into()),
                ("add_noise", self.add_noise.into()),
                ("return_with_leftover_noise", self.return_with_leftover_noise.into()),
                ("previews", self.previews.into()),
                ("tile_sample", self.tiled.into()),
                ("tile_size", 1024.into()),
            ]),
            id,
        )?;
        Ok(node.out(0))
    }
}

/// Start step for a partial denoise keeping `1 - strength` of the schedule.
pub fn partial_start_step(steps: u32, strength: f64) -> u32 {
    let start = (f64::from(steps) * (1.0 - strength)).round_ties_even();
    start.clamp(0.0, f64::from(steps)) as u32
}

/// A width or height input: a constant or another node's output.
#[derive(Debug, Clone, PartialEq)]
pub enum Dimension {
    Fixed(u32),
    Linked(NodeRef),
}

impl From<Dimension> for InputValue {
    fn from(dim: Dimension) -> Self {
        match dim {
            Dimension::Fixed(v) => InputValue::from(v),
            Dimension::Linked(r) => InputValue::Link(r),
        }
    }
}

impl From<&Dimension> for InputValue {
    fn from(dim: &Dimension) -> Self {
        dim.clone().into()
    }
}

/// Parameters frozen for one video sampling pass.
#[derive(Debug, Clone)]
pub struct VideoGenDescriptor {
    pub model: ModelEntry,
    pub swap_model: Option<ModelEntry>,
    pub swap_percent: f64,
    pub frames: u32,
    pub fps: u32,
    /// `None` uses the model class default.
    pub cfg: Option<f64>,
    pub width: Dimension,
    pub height: Dimension,
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: u32,
    pub seed: i64,
    pub section: String,
    /// Video-to-video strength: re-encode the input frames instead of
    /// starting from an empty latent.
    pub creativity: Option<f64>,
}

/// Handles produced by [`prepare_video_pass`].
#[derive(Debug, Clone)]
pub struct VideoPass {
    pub compat_class: CompatClass,
    pub model: NodeRef,
    pub positive: NodeRef,
    pub negative: NodeRef,
    pub vae: NodeRef,
    pub latent: NodeRef,
    pub kind: MediaKind,
    pub cfg: f64,
    pub fps: u32,
    pub frames: u32,
    pub steps: u32,
    pub start_step: u32,
    pub seed: i64,
    pub section: String,
}

/// Loads the video model, encodes conditioning and builds the starting
/// latent from the current media. The cursor ends on that latent.
pub fn prepare_video_pass(
    ctx: &mut GenerationContext<'_>,
    desc: &VideoGenDescriptor,
) -> Result<VideoPass> {
    let class = desc.model.compat_class.clone();
    let joint = class.has_joint_audio_video_latent();
    let loaded = ctx.load_checkpoint(&desc.model, None)?;
    ctx.current_vae = Some(loaded.vae.clone());
    if joint {
        let audio_vae = ctx.load_audio_vae(&desc.model)?;
        ctx.audio_vae = Some(audio_vae);
    }

    let image = ctx.media_as_raw_image()?;
    let (positive, negative) = encode_video_conditioning(ctx, &loaded, desc)?;
    let cfg = desc.cfg.unwrap_or_else(|| class.default_video_cfg());

    let mut start_step = 0;
    let latent = match (desc.creativity, image) {
        (Some(creativity), Some(image)) => {
            start_step = creativity_start_step(desc.steps, creativity);
            let frames = ctx.create_node(
                "ImageFromBatch",
                inputs([
                    ("image", image.into()),
                    ("batch_index", 0.into()),
                    ("length", desc.frames.into()),
                ]),
            )?;
            let encoded = ctx.create_node(
                "VAEEncode",
                inputs([("pixels", frames.out(0).into()), ("vae", (&loaded.vae).into())]),
            )?;
            if joint {
                attach_empty_audio(ctx, encoded.out(0), desc)?
            } else {
                encoded.out(0)
            }
        }
        (None, Some(image)) => {
            let scaled = ctx.create_node(
                "ImageScale",
                inputs([
                    ("image", image.into()),
                    ("width", (&desc.width).into()),
                    ("height", (&desc.height).into()),
                    ("upscale_method", "lanczos".into()),
                    ("crop", "disabled".into()),
                ]),
            )?;
            if joint {
                let empty = empty_ltxv_latent(ctx, desc)?;
                let conditioned = ctx.create_node(
                    "LTXVImgToVideoInplace",
                    inputs([
                        ("vae", (&loaded.vae).into()),
                        ("image", scaled.out(0).into()),
                        ("latent", empty.into()),
                        ("strength", 1.0.into()),
                        ("bypass", false.into()),
                    ]),
                )?;
                attach_empty_audio(ctx, conditioned.out(0), desc)?
            } else {
                let encoded = ctx.create_node(
                    "VAEEncode",
                    inputs([("pixels", scaled.out(0).into()), ("vae", (&loaded.vae).into())]),
                )?;
                let repeated = ctx.create_node(
                    "RepeatLatentBatch",
                    inputs([("samples", encoded.out(0).into()), ("amount", desc.frames.into())]),
                )?;
                repeated.out(0)
            }
        }
        (_, None) if joint => {
            let empty = empty_ltxv_latent(ctx, desc)?;
            attach_empty_audio(ctx, empty, desc)?
        }
        (_, None) => bail!(
            "model class '{class}' needs an input image to generate video, but there is no current media"
        ),
    };

    let kind = if joint {
        MediaKind::LatentAudioVideo
    } else {
        MediaKind::Latent
    };
    ctx.set_media(MediaCursor::new(latent.clone(), kind).with_fps(desc.fps));

    Ok(VideoPass {
        compat_class: class,
        model: loaded.model,
        positive,
        negative,
        vae: loaded.vae,
        latent,
        kind,
        cfg,
        fps: desc.fps,
        frames: desc.frames,
        steps: desc.steps,
        start_step,
        seed: desc.seed,
        section: desc.section.clone(),
    })
}

/// Samples a prepared pass, split across the swap model when one is set.
/// The cursor ends on the sampled latent.
pub fn sample_video_pass(
    ctx: &mut GenerationContext<'_>,
    pass: &VideoPass,
    desc: &VideoGenDescriptor,
) -> Result<NodeRef> {
    let params = ctx.params();
    let sampler = SamplerChoice::for_video(params, &pass.section, desc.swap_model.is_some());
    let previews: String = params.get(keys::VIDEO_PREVIEW_TYPE, DEFAULT_PREVIEWS.to_string());

    let mut spec = KSamplerSpec::new(
        pass.model.clone(),
        pass.positive.clone(),
        pass.negative.clone(),
        pass.latent.clone(),
        pass.seed,
        pass.steps,
        pass.cfg,
    )
    .video_sigmas();
    spec.sampler = sampler;
    spec.previews = previews;
    spec.start_at_step = pass.start_step;

    let output = match &desc.swap_model {
        None => spec.emit(ctx, None)?,
        Some(swap) => {
            let split = ((f64::from(pass.steps) * desc.swap_percent).round_ties_even() as u32)
                .clamp(pass.start_step, pass.steps);
            debug!(swap_model = %swap.name, split, "Splitting video sampling across swap model");

            let mut first = spec.clone();
            first.end_at_step = split;
            first.return_with_leftover_noise = true;
            let first_out = first.emit(ctx, None)?;

            let swap_loaded = ctx.load_checkpoint(swap, None)?;
            let (positive, negative) = encode_video_conditioning(ctx, &swap_loaded, desc)?;
            let mut second = spec;
            second.model = swap_loaded.model;
            second.positive = positive;
            second.negative = negative;
            second.latent = first_out;
            second.start_at_step = split;
            second.add_noise = false;
            second.emit(ctx, None)?
        }
    };

    ctx.set_media(MediaCursor::new(output.clone(), pass.kind).with_fps(pass.fps));
    Ok(output)
}

/// Prepares and samples one video pass.
pub fn create_image_to_video(
    ctx: &mut GenerationContext<'_>,
    desc: &VideoGenDescriptor,
) -> Result<(VideoPass, NodeRef)> {
    let pass = prepare_video_pass(ctx, desc)?;
    let output = sample_video_pass(ctx, &pass, desc)?;
    Ok((pass, output))
}

/// Video settings of an image-to-video request, read once per stage run.
#[derive(Debug, Clone)]
pub struct VideoRequest {
    pub model: ModelEntry,
    pub swap_model: Option<ModelEntry>,
    pub swap_percent: f64,
    pub frames: u32,
    pub fps: u32,
    pub cfg: Option<f64>,
    pub steps: u32,
    pub policy: ResolutionPolicy,
    pub format: String,
    pub seed: i64,
    pub prompt: String,
    pub negative_prompt: String,
    pub has_extend: bool,
    pub creativity: Option<f64>,
}

/// Offset applied to the request seed for the image-to-video pass.
pub const VIDEO_SEED_OFFSET: i64 = 42;

impl VideoRequest {
    /// `None` when no video model is selected.
    pub fn from_params(
        params: &ParamSet,
        models: &ModelRegistry,
        defaults: &GenerationDefaults,
    ) -> Result<Option<Self>> {
        let Some(model) = params.model(models, keys::VIDEO_MODEL)? else {
            return Ok(None);
        };
        let raw_prompt = params.prompt();
        let parsed = parse_prompt(&raw_prompt)?;

        Ok(Some(Self {
            model,
            swap_model: params.model(models, keys::VIDEO_SWAP_MODEL)?,
            swap_percent: params.get(keys::VIDEO_SWAP_PERCENT, 0.5),
            frames: params.get(keys::VIDEO_FRAMES, defaults.default_video_frames),
            fps: params.get(keys::VIDEO_FPS, defaults.default_video_fps),
            cfg: params
                .get_in(keys::CFG_SCALE, sections::VIDEO, false)
                .or_else(|| params.get_in(keys::VIDEO_CFG, sections::VIDEO, true)),
            steps: params
                .get_in(keys::STEPS, sections::VIDEO, false)
                .or_else(|| params.get_in(keys::VIDEO_STEPS, sections::VIDEO, true))
                .unwrap_or(defaults.default_video_steps),
            policy: ResolutionPolicy::parse(&params.get(
                keys::VIDEO_RESOLUTION,
                ResolutionPolicy::MODEL_PREFERRED.to_string(),
            )),
            format: params
                .get(keys::VIDEO_FORMAT, "h264-mp4".to_string())
                .to_lowercase(),
            seed: params.seed() + VIDEO_SEED_OFFSET,
            prompt: parsed.base,
            negative_prompt: params.negative_prompt(),
            has_extend: has_extend(&raw_prompt),
            creativity: params.try_get(keys::VIDEO2VIDEO_CREATIVITY),
        }))
    }

    pub fn descriptor(&self, width: Dimension, height: Dimension) -> VideoGenDescriptor {
        VideoGenDescriptor {
            model: self.model.clone(),
            swap_model: self.swap_model.clone(),
            swap_percent: self.swap_percent,
            frames: self.frames,
            fps: self.fps,
            cfg: self.cfg,
            width,
            height,
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            steps: self.steps,
            seed: self.seed,
            section: sections::VIDEO.to_string(),
            creativity: self.creativity,
        }
    }
}

pub fn creativity_start_step(steps: u32, creativity: f64) -> u32 {
    let start = (f64::from(steps) * (1.0 - creativity)).floor();
    start.clamp(0.0, f64::from(steps)) as u32
}

fn encode_video_conditioning(
    ctx: &mut GenerationContext<'_>,
    loaded: &LoadedModel,
    desc: &VideoGenDescriptor,
) -> Result<(NodeRef, NodeRef)> {
    let positive = ctx.encode_prompt(&loaded.clip, &desc.prompt, None)?;
    let negative = ctx.encode_prompt(&loaded.clip, &desc.negative_prompt, None)?;
    if !loaded.entry.compat_class.has_joint_audio_video_latent() {
        return Ok((positive, negative));
    }
    let conditioned = ctx.create_node(
        "LTXVConditioning",
        inputs([
            ("positive", positive.into()),
            ("negative", negative.into()),
            ("frame_rate", desc.fps.into()),
        ]),
    )?;
    Ok((conditioned.out(0), conditioned.out(1)))
}

fn empty_ltxv_latent(ctx: &mut GenerationContext<'_>, desc: &VideoGenDescriptor) -> Result<NodeRef> {
    let empty = ctx.create_node(
        "EmptyLTXVLatentVideo",
        inputs([
            ("width", (&desc.width).into()),
            ("height", (&desc.height).into()),
            ("length", desc.frames.into()),
            ("batch_size", 1.into()),
        ]),
    )?;
    Ok(empty.out(0))
}

fn attach_empty_audio(
    ctx: &mut GenerationContext<'_>,
    video_latent: NodeRef,
    desc: &VideoGenDescriptor,
) -> Result<NodeRef> {
    let Some(audio_vae) = ctx.audio_vae.clone() else {
        bail!("no audio VAE loaded for '{}'", desc.model.name);
    };
    let audio = ctx.create_node(
        "LTXVEmptyLatentAudio",
        inputs([
            ("audio_vae", audio_vae.into()),
            ("frames_number", desc.frames.into()),
            ("frame_rate", desc.fps.into()),
            ("batch_size", 1.into()),
        ]),
    )?;
    let joined = ctx.create_node(
        "LTXVConcatAVLatent",
        inputs([
            ("video_latent", video_latent.into()),
            ("audio_latent", audio.out(0).into()),
        ]),
    )?;
    Ok(joined.out(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(models: &ModelRegistry, model: &str) -> VideoGenDescriptor {
        VideoGenDescriptor {
            model: models.get(model).expect("builtin model").clone(),
            swap_model: None,
            swap_percent: 0.5,
            frames: 25,
            fps: 24,
            cfg: None,
            width: Dimension::Fixed(768),
            height: Dimension::Fixed(512),
            prompt: "a cat".into(),
            negative_prompt: String::new(),
            steps: 20,
            seed: 42,
            section: sections::VIDEO.into(),
            creativity: None,
        }
    }

    fn load_image(ctx: &mut GenerationContext<'_>) {
        let image = ctx
            .create_node_with_id("LoadImage", inputs([("image", "in.png".into())]), "15")
            .expect("image should be created");
        ctx.advance_media(image.out(0), MediaKind::RawImage);
    }

    #[test]
    fn test_partial_start_step() {
        assert_eq!(partial_start_step(20, 0.4), 12);
        assert_eq!(partial_start_step(20, 1.0), 0);
        assert_eq!(partial_start_step(20, 1.5), 0);
        assert_eq!(partial_start_step(20, -1.0), 20);
        // 10 * 0.5 = 5 exactly, 3 * 0.5 = 1.5 -> 2
        assert_eq!(partial_start_step(3, 0.5), 2);
    }

    #[test]
    fn test_creativity_start_step_floors() {
        assert_eq!(creativity_start_step(20, 0.6), 8);
        assert_eq!(creativity_start_step(7, 0.5), 3);
    }

    #[test]
    fn test_sampler_choice_precedence() {
        let params = ParamSet::new()
            .with(keys::SAMPLER, "dpmpp_2m")
            .with(keys::REFINER_SAMPLER, "uni_pc")
            .with_section(sections::VIDEO_SWAP, keys::SCHEDULER, "karras")
            .with_section(sections::REFINER, keys::SCHEDULER, "beta");

        let video = SamplerChoice::for_video(&params, sections::VIDEO, true);
        assert_eq!(video.sampler, "dpmpp_2m");
        assert_eq!(video.scheduler, "karras");

        let refiner = SamplerChoice::for_refiner(&params);
        assert_eq!(refiner.sampler, "uni_pc");
        assert_eq!(refiner.scheduler, "beta");

        let plain = SamplerChoice::for_section(&ParamSet::new(), sections::VIDEO);
        assert_eq!(plain.sampler, DEFAULT_SAMPLER);
        assert_eq!(plain.scheduler, DEFAULT_SCHEDULER);
    }

    #[test]
    fn test_ltxv2_pass_builds_joint_latent() {
        let params = ParamSet::new();
        let models = ModelRegistry::with_builtin_models();
        let defaults = GenerationDefaults::default();
        let mut ctx = GenerationContext::new(&params, &models, &defaults);
        load_image(&mut ctx);

        let desc = descriptor(&models, "ltx-2-19b-dev");
        let (pass, output) = create_image_to_video(&mut ctx, &desc).expect("pass should build");

        assert_eq!(pass.kind, MediaKind::LatentAudioVideo);
        assert_eq!(pass.cfg, 3.0);
        let graph = ctx.graph();
        for class_type in [
            "LTXVAudioVAELoader",
            "LTXVConditioning",
            "EmptyLTXVLatentVideo",
            "LTXVImgToVideoInplace",
            "LTXVEmptyLatentAudio",
            "LTXVConcatAVLatent",
            "SwarmKSampler",
        ] {
            assert_eq!(graph.count_of_type(class_type), 1, "{class_type}");
        }
        let sampler = graph.get(&output.node).expect("sampler node");
        assert_eq!(sampler.link("latent_image"), Some(&pass.latent));
        assert_eq!(sampler.input("sigma_min"), Some(&InputValue::Float(VIDEO_SIGMA_MIN)));
        assert_eq!(ctx.media().map(|m| m.kind), Some(MediaKind::LatentAudioVideo));
        assert_eq!(ctx.media().and_then(|m| m.fps), Some(24));
    }

    #[test]
    fn test_single_channel_pass_repeats_encoded_image() {
        let params = ParamSet::new();
        let models = ModelRegistry::with_builtin_models();
        let defaults = GenerationDefaults::default();
        let mut ctx = GenerationContext::new(&params, &models, &defaults);
        load_image(&mut ctx);

        let desc = descriptor(&models, "svd-xt");
        let (pass, _) = create_image_to_video(&mut ctx, &desc).expect("pass should build");

        assert_eq!(pass.kind, MediaKind::Latent);
        let graph = ctx.graph();
        assert_eq!(graph.count_of_type("RepeatLatentBatch"), 1);
        assert_eq!(graph.count_of_type("LTXVConcatAVLatent"), 0);
        assert_eq!(graph.count_of_type("LTXVAudioVAELoader"), 0);
    }

    #[test]
    fn test_single_channel_pass_without_media_fails() {
        let params = ParamSet::new();
        let models = ModelRegistry::with_builtin_models();
        let defaults = GenerationDefaults::default();
        let mut ctx = GenerationContext::new(&params, &models, &defaults);

        let desc = descriptor(&models, "svd-xt");
        let err = prepare_video_pass(&mut ctx, &desc).expect_err("needs an input image");
        assert!(err.to_string().contains("needs an input image"));
    }

    #[test]
    fn test_swap_model_splits_sampling() {
        let params = ParamSet::new();
        let models = ModelRegistry::with_builtin_models();
        let defaults = GenerationDefaults::default();
        let mut ctx = GenerationContext::new(&params, &models, &defaults);
        load_image(&mut ctx);

        let mut desc = descriptor(&models, "wan2.1-i2v-480p");
        desc.swap_model = models.get("svd-xt").cloned();
        desc.swap_percent = 0.3;
        let (_, output) = create_image_to_video(&mut ctx, &desc).expect("pass should build");

        let graph = ctx.graph();
        let samplers: Vec<&str> = graph.nodes_of_type("SwarmKSampler").collect();
        assert_eq!(samplers.len(), 2);
        let first = graph.get(samplers[0]).expect("first sampler");
        let second = graph.get(samplers[1]).expect("second sampler");
        assert_eq!(first.input("end_at_step"), Some(&InputValue::Int(6)));
        assert_eq!(first.input("return_with_leftover_noise"), Some(&InputValue::Bool(true)));
        assert_eq!(second.input("start_at_step"), Some(&InputValue::Int(6)));
        assert_eq!(second.input("add_noise"), Some(&InputValue::Bool(false)));
        assert_eq!(second.link("latent_image"), Some(&NodeRef::new(samplers[0], 0)));
        assert_eq!(output.node, samplers[1]);
    }

    #[test]
    fn test_video_to_video_reencodes_frames() {
        let params = ParamSet::new();
        let models = ModelRegistry::with_builtin_models();
        let defaults = GenerationDefaults::default();
        let mut ctx = GenerationContext::new(&params, &models, &defaults);
        load_image(&mut ctx);

        let mut desc = descriptor(&models, "wan2.1-i2v-480p");
        desc.creativity = Some(0.6);
        let pass = prepare_video_pass(&mut ctx, &desc).expect("pass should build");

        assert_eq!(pass.start_step, 8);
        assert_eq!(ctx.graph().count_of_type("ImageFromBatch"), 1);
        assert_eq!(ctx.graph().count_of_type("ImageScale"), 0);
    }
}
