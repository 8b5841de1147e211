use anyhow::Result;
use tracing::{debug, warn};

use crate::context::GenerationContext;
use crate::graph::{inputs, InputValue, NodeId};
use crate::media::MediaKind;
use crate::params::{keys, ParamSet};

/// Node id of the final save.
pub const FINAL_SAVE_ID: &str = "9";

/// Inserts `SwarmTrimFrames` when either trim parameter is present.
pub fn apply_trim(ctx: &mut GenerationContext<'_>) -> Result<()> {
    let params = ctx.params();
    if !params.contains(keys::TRIM_VIDEO_START_FRAMES) && !params.contains(keys::TRIM_VIDEO_END_FRAMES) {
        return Ok(());
    }
    let trim_start: u32 = params.get(keys::TRIM_VIDEO_START_FRAMES, 0);
    let trim_end: u32 = params.get(keys::TRIM_VIDEO_END_FRAMES, 0);
    let frames = ctx.ensure_kind(MediaKind::RawImage)?;
    let trimmed = ctx.create_node(
        "SwarmTrimFrames",
        inputs([
            ("image", frames.into()),
            ("trim_start", trim_start.into()),
            ("trim_end", trim_end.into()),
        ]),
    )?;
    ctx.advance_media(trimmed.out(0), MediaKind::RawImage);
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpolationSettings {
    pub method: String,
    pub multiplier: u32,
}

/// Interpolation request, when a method is set and the multiplier is above 1.
pub fn interpolation_settings(params: &ParamSet) -> Option<InterpolationSettings> {
    let method: String = params.try_get(keys::VIDEO_FRAME_INTERPOLATION_METHOD)?;
    let multiplier: u32 = params.try_get(keys::VIDEO_FRAME_INTERPOLATION_MULTIPLIER)?;
    (multiplier > 1).then_some(InterpolationSettings { method, multiplier })
}

/// Interpolates the current frames and returns the new frame rate.
///
/// With `output_intermediate_images` the pre-interpolation frames are saved
/// first.
pub fn apply_interpolation(ctx: &mut GenerationContext<'_>, fps: u32, format: &str) -> Result<u32> {
    let params = ctx.params();
    let Some(settings) = interpolation_settings(params) else {
        return Ok(fps);
    };
    let class_type = match settings.method.as_str() {
        "RIFE" => "RIFE VFI",
        "FILM" => "FILM VFI",
        other => {
            warn!(method = other, "Unknown frame interpolation method, skipping interpolation");
            return Ok(fps);
        }
    };

    if params.get(keys::OUTPUT_INTERMEDIATE_IMAGES, false) {
        save_animation(ctx, fps, format, None)?;
    }

    let frames = ctx.ensure_kind(MediaKind::RawImage)?;
    let mut node_inputs = inputs([
        ("frames", frames.into()),
        ("multiplier", settings.multiplier.into()),
        ("clear_cache_after_n_frames", 10.into()),
    ]);
    if class_type == "RIFE VFI" {
        node_inputs.insert("ckpt_name".into(), "rife47.pth".into());
        node_inputs.insert("fast_mode".into(), true.into());
        node_inputs.insert("ensemble".into(), true.into());
        node_inputs.insert("scale_factor".into(), 1.0.into());
    } else {
        node_inputs.insert("ckpt_name".into(), "film_net_fp32.pt".into());
    }
    let interpolated = ctx.create_node(class_type, node_inputs)?;
    let new_fps = fps * settings.multiplier;
    ctx.advance_media(interpolated.out(0), MediaKind::RawImage);
    ctx.set_media_fps(new_fps);
    debug!(method = class_type, from_fps = fps, to_fps = new_fps, "Added frame interpolation");
    Ok(new_fps)
}

/// Inserts `SwarmVideoBoomerang` when `video_boomerang` is set.
pub fn apply_boomerang(ctx: &mut GenerationContext<'_>) -> Result<()> {
    if !ctx.params().get(keys::VIDEO_BOOMERANG, false) {
        return Ok(());
    }
    let frames = ctx.ensure_kind(MediaKind::RawImage)?;
    let bounced = ctx.create_node("SwarmVideoBoomerang", inputs([("images", frames.into())]))?;
    ctx.advance_media(bounced.out(0), MediaKind::RawImage);
    Ok(())
}

/// Emits `SwarmSaveAnimationWS` for the current frames, with decoded audio
/// when the cursor holds an audio latent and an audio VAE is loaded.
pub fn save_animation(
    ctx: &mut GenerationContext<'_>,
    fps: u32,
    format: &str,
    id: Option<&str>,
) -> Result<NodeId> {
    let frames = ctx.ensure_kind(MediaKind::RawImage)?;
    let audio_latent = ctx.media().and_then(|media| media.audio_latent.clone());

    let mut node_inputs = inputs([
        ("images", frames.into()),
        ("fps", fps.into()),
        ("lossless", false.into()),
        ("quality", 95.into()),
        ("method", "default".into()),
        ("format", format.into()),
    ]);
    if let (Some(samples), Some(audio_vae)) = (audio_latent, ctx.audio_vae.clone()) {
        let audio = ctx.create_node(
            "LTXVAudioVAEDecode",
            inputs([("samples", samples.into()), ("audio_vae", audio_vae.into())]),
        )?;
        node_inputs.insert("audio".into(), InputValue::Link(audio.out(0)));
    }
    ctx.create_node_at("SwarmSaveAnimationWS", node_inputs, id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishOptions {
    pub fps: u32,
    pub format: String,
    /// Extend segments follow; they interpolate and save the assembled video.
    pub has_extend: bool,
}

/// Trim, interpolate, boomerang, save.
pub fn finish_video(ctx: &mut GenerationContext<'_>, options: &FinishOptions) -> Result<NodeId> {
    apply_trim(ctx)?;
    let mut fps = options.fps;
    if !options.has_extend {
        fps = apply_interpolation(ctx, fps, &options.format)?;
    }
    apply_boomerang(ctx)?;
    let id = if options.has_extend {
        None
    } else {
        Some(FINAL_SAVE_ID)
    };
    save_animation(ctx, fps, &options.format, id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GenerationDefaults;
    use crate::graph::{NodeInputs, NodeRef};
    use crate::media::MediaCursor;
    use crate::model_registry::ModelRegistry;

    fn with_frames(ctx: &mut GenerationContext<'_>) -> NodeRef {
        let frames = ctx
            .create_node_with_id("VAEDecode", NodeInputs::new(), "8")
            .expect("decode should be created")
            .out(0);
        ctx.set_media(MediaCursor::new(frames.clone(), MediaKind::RawImage).with_fps(24));
        frames
    }

    fn run_finish(params: &ParamSet, has_extend: bool) -> (crate::graph::WorkflowGraph, NodeId) {
        let models = ModelRegistry::new();
        let defaults = GenerationDefaults::default();
        let mut ctx = GenerationContext::new(params, &models, &defaults);
        with_frames(&mut ctx);
        let save = finish_video(
            &mut ctx,
            &FinishOptions {
                fps: 24,
                format: "h264-mp4".into(),
                has_extend,
            },
        )
        .expect("finish should work");
        (ctx.into_graph(), save)
    }

    #[test]
    fn test_plain_finish_saves_to_final_id() {
        let (graph, save) = run_finish(&ParamSet::new(), false);
        assert_eq!(save.as_str(), FINAL_SAVE_ID);
        let record = graph.get(FINAL_SAVE_ID).expect("save node");
        assert_eq!(record.link("images"), Some(&NodeRef::new("8", 0)));
        assert_eq!(record.input("fps").and_then(|v| v.as_i64()), Some(24));
        assert_eq!(record.input("format").and_then(|v| v.as_str()), Some("h264-mp4"));
        assert!(record.input("audio").is_none());
        assert_eq!(graph.len(), 2);
    }

    #[test]
    fn test_full_chain_order() {
        let params = ParamSet::new()
            .with(keys::TRIM_VIDEO_START_FRAMES, 2)
            .with(keys::VIDEO_FRAME_INTERPOLATION_METHOD, "RIFE")
            .with(keys::VIDEO_FRAME_INTERPOLATION_MULTIPLIER, 2)
            .with(keys::VIDEO_BOOMERANG, true);
        let (graph, _) = run_finish(&params, false);

        let types: Vec<&str> = graph.iter().map(|(_, r)| r.class_type.as_str()).collect();
        assert_eq!(
            types,
            vec![
                "VAEDecode",
                "SwarmTrimFrames",
                "RIFE VFI",
                "SwarmVideoBoomerang",
                "SwarmSaveAnimationWS"
            ]
        );
        let trim = graph.nodes_of_type("SwarmTrimFrames").next().expect("trim");
        assert_eq!(
            graph.get(trim).and_then(|r| r.input("trim_end")).and_then(|v| v.as_i64()),
            Some(0)
        );
        let save = graph.get(FINAL_SAVE_ID).expect("save node");
        assert_eq!(save.input("fps").and_then(|v| v.as_i64()), Some(48));
    }

    #[test]
    fn test_extend_defers_interpolation_and_uses_dynamic_save() {
        let params = ParamSet::new()
            .with(keys::VIDEO_FRAME_INTERPOLATION_METHOD, "FILM")
            .with(keys::VIDEO_FRAME_INTERPOLATION_MULTIPLIER, 3);
        let (graph, save) = run_finish(&params, true);
        assert_ne!(save.as_str(), FINAL_SAVE_ID);
        assert_eq!(graph.count_of_type("FILM VFI"), 0);
        let record = graph.get(save.as_str()).expect("save node");
        assert_eq!(record.input("fps").and_then(|v| v.as_i64()), Some(24));
    }

    #[test]
    fn test_multiplier_of_one_is_no_interpolation() {
        let params = ParamSet::new()
            .with(keys::VIDEO_FRAME_INTERPOLATION_METHOD, "RIFE")
            .with(keys::VIDEO_FRAME_INTERPOLATION_MULTIPLIER, 1);
        assert!(interpolation_settings(&params).is_none());
    }

    #[test]
    fn test_unknown_interpolation_method_is_skipped() {
        let params = ParamSet::new()
            .with(keys::VIDEO_FRAME_INTERPOLATION_METHOD, "magic")
            .with(keys::VIDEO_FRAME_INTERPOLATION_MULTIPLIER, 2);
        let (graph, _) = run_finish(&params, false);
        assert_eq!(graph.len(), 2);
        let save = graph.get(FINAL_SAVE_ID).expect("save node");
        assert_eq!(save.input("fps").and_then(|v| v.as_i64()), Some(24));
    }

    #[test]
    fn test_intermediate_save_before_interpolation() {
        let params = ParamSet::new()
            .with(keys::OUTPUT_INTERMEDIATE_IMAGES, true)
            .with(keys::VIDEO_FRAME_INTERPOLATION_METHOD, "RIFE")
            .with(keys::VIDEO_FRAME_INTERPOLATION_MULTIPLIER, 2);
        let (graph, _) = run_finish(&params, false);
        let saves: Vec<&str> = graph.nodes_of_type("SwarmSaveAnimationWS").collect();
        assert_eq!(saves.len(), 2);
        let intermediate = graph.get(saves[0]).expect("intermediate save");
        assert_eq!(intermediate.link("images"), Some(&NodeRef::new("8", 0)));
    }

    #[test]
    fn test_save_decodes_held_audio() {
        let params = ParamSet::new();
        let models = ModelRegistry::new();
        let defaults = GenerationDefaults::default();
        let mut ctx = GenerationContext::new(&params, &models, &defaults);
        let audio_vae = ctx
            .create_node("LTXVAudioVAELoader", NodeInputs::new())
            .expect("loader should be created");
        ctx.audio_vae = Some(audio_vae.out(0));
        let separated = ctx
            .create_node("LTXVSeparateAVLatent", NodeInputs::new())
            .expect("separation should be created");
        let frames = with_frames(&mut ctx);
        ctx.set_media(
            MediaCursor::new(frames, MediaKind::RawImage).with_audio_latent(separated.out(1)),
        );

        let save = save_animation(&mut ctx, 24, "h264-mp4", Some(FINAL_SAVE_ID))
            .expect("save should work");
        let graph = ctx.graph();
        let record = graph.get(save.as_str()).expect("save node");
        let audio = record.link("audio").expect("save should carry audio");
        let decode = graph.get(&audio.node).expect("audio decode node");
        assert_eq!(decode.class_type, "LTXVAudioVAEDecode");
        assert_eq!(decode.link("samples"), Some(&separated.out(1)));
    }
}
