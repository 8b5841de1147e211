use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use tracing::trace;

use crate::config::GenerationDefaults;
use crate::graph::{inputs, NodeId, NodeInputs, NodeRecord, NodeRef, WorkflowGraph};
use crate::media::{conversion_path, Conversion, MediaCursor, MediaKind};
use crate::model_registry::{ModelEntry, ModelRegistry};
use crate::params::ParamSet;

/// Handles of a loaded checkpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedModel {
    pub entry: ModelEntry,
    pub model: NodeRef,
    pub clip: NodeRef,
    pub vae: NodeRef,
}

/// Mutable state of one workflow build.
///
/// Every graph and cursor mutation goes through here; stages never hold a
/// cursor of their own.
pub struct GenerationContext<'a> {
    params: &'a ParamSet,
    models: &'a ModelRegistry,
    defaults: &'a GenerationDefaults,
    graph: WorkflowGraph,
    next_dynamic_id: u64,
    media: Option<MediaCursor>,
    pub base_model: Option<LoadedModel>,
    pub positive: Option<NodeRef>,
    pub negative: Option<NodeRef>,
    pub current_vae: Option<NodeRef>,
    pub audio_vae: Option<NodeRef>,
    /// Cache of node ids created for shared helpers (loaders and the like).
    pub helpers: HashMap<String, String>,
}

impl<'a> GenerationContext<'a> {
    pub fn new(
        params: &'a ParamSet,
        models: &'a ModelRegistry,
        defaults: &'a GenerationDefaults,
    ) -> Self {
        Self {
            params,
            models,
            defaults,
            graph: WorkflowGraph::new(),
            next_dynamic_id: defaults.dynamic_id_base,
            media: None,
            base_model: None,
            positive: None,
            negative: None,
            current_vae: None,
            audio_vae: None,
            helpers: HashMap::new(),
        }
    }

    pub fn params(&self) -> &'a ParamSet {
        self.params
    }

    pub fn models(&self) -> &'a ModelRegistry {
        self.models
    }

    pub fn defaults(&self) -> &'a GenerationDefaults {
        self.defaults
    }

    pub fn graph(&self) -> &WorkflowGraph {
        &self.graph
    }

    pub fn into_graph(self) -> WorkflowGraph {
        self.graph
    }

    /// Allocates the next dynamic id, skipping any id already in the graph.
    pub fn next_dynamic_id(&mut self) -> String {
        loop {
            let id = self.next_dynamic_id.to_string();
            self.next_dynamic_id += 1;
            if !self.graph.contains(&id) {
                return id;
            }
        }
    }

    pub fn create_node(&mut self, class_type: &str, node_inputs: NodeInputs) -> Result<NodeId> {
        let id = self.next_dynamic_id();
        self.create_node_with_id(class_type, node_inputs, &id)
    }

    pub fn create_node_with_id(
        &mut self,
        class_type: &str,
        node_inputs: NodeInputs,
        id: &str,
    ) -> Result<NodeId> {
        trace!(node = id, class_type, "Creating node");
        self.graph
            .add_node(
                id,
                NodeRecord {
                    class_type: class_type.to_string(),
                    inputs: node_inputs,
                },
            )
            .with_context(|| format!("failed to insert '{class_type}' node"))
    }

    /// Creates with `id` when given, otherwise with a dynamic id.
    pub fn create_node_at(
        &mut self,
        class_type: &str,
        node_inputs: NodeInputs,
        id: Option<&str>,
    ) -> Result<NodeId> {
        match id {
            Some(id) => self.create_node_with_id(class_type, node_inputs, id),
            None => self.create_node(class_type, node_inputs),
        }
    }

    pub fn remove_node(&mut self, id: &str) -> bool {
        self.graph.remove_node(id)
    }

    pub fn media(&self) -> Option<&MediaCursor> {
        self.media.as_ref()
    }

    pub fn require_media(&self) -> Result<&MediaCursor> {
        self.media
            .as_ref()
            .context("no current media: an earlier stage must produce an image or latent")
    }

    pub fn set_media(&mut self, cursor: MediaCursor) {
        self.media = Some(cursor);
    }

    /// Points the cursor at a new reference, keeping fps and any held audio.
    pub fn advance_media(&mut self, reference: NodeRef, kind: MediaKind) {
        let (fps, audio_latent) = self
            .media
            .take()
            .map(|cursor| (cursor.fps, cursor.audio_latent))
            .unwrap_or((None, None));
        self.media = Some(MediaCursor {
            reference,
            kind,
            fps,
            audio_latent,
        });
    }

    pub fn set_media_fps(&mut self, fps: u32) {
        if let Some(cursor) = self.media.as_mut() {
            cursor.fps = Some(fps);
        }
    }

    pub fn require_vae(&self) -> Result<NodeRef> {
        self.current_vae
            .clone()
            .context("no VAE loaded: cannot convert between pixels and latents")
    }

    /// Converts the cursor to `target` through the conversion table and
    /// returns the new reference. A no-op when the kind already matches.
    pub fn ensure_kind(&mut self, target: MediaKind) -> Result<NodeRef> {
        let from = self.require_media()?.kind;
        for step in conversion_path(from, target) {
            self.apply_conversion(*step)?;
        }
        Ok(self.require_media()?.reference.clone())
    }

    /// Snapshot of the current media as pixels, if there is any media.
    pub fn media_as_raw_image(&mut self) -> Result<Option<NodeRef>> {
        if self.media.is_none() {
            return Ok(None);
        }
        self.ensure_kind(MediaKind::RawImage).map(Some)
    }

    fn apply_conversion(&mut self, step: Conversion) -> Result<()> {
        let cursor = self.require_media()?.clone();
        match step {
            Conversion::VaeEncode => {
                let vae = self.require_vae()?;
                let encoded = self.create_node(
                    "VAEEncode",
                    inputs([("pixels", cursor.reference.into()), ("vae", vae.into())]),
                )?;
                self.advance_media(encoded.out(0), MediaKind::Latent);
            }
            Conversion::VaeDecode => {
                let vae = self.require_vae()?;
                let decoded = self.create_node(
                    "VAEDecode",
                    inputs([("samples", cursor.reference.into()), ("vae", vae.into())]),
                )?;
                self.advance_media(decoded.out(0), MediaKind::RawImage);
            }
            Conversion::SeparateAudioVideo => {
                let separated = self.create_node(
                    "LTXVSeparateAVLatent",
                    inputs([("av_latent", cursor.reference.into())]),
                )?;
                self.set_media(MediaCursor {
                    reference: separated.out(0),
                    kind: MediaKind::Latent,
                    fps: cursor.fps,
                    audio_latent: Some(separated.out(1)),
                });
            }
            Conversion::AttachAudio => {
                let audio = match cursor.audio_latent.clone() {
                    Some(audio) => audio,
                    None => self.empty_audio_latent(cursor.fps)?,
                };
                let joined = self.create_node(
                    "LTXVConcatAVLatent",
                    inputs([
                        ("video_latent", cursor.reference.into()),
                        ("audio_latent", audio.into()),
                    ]),
                )?;
                self.set_media(MediaCursor {
                    reference: joined.out(0),
                    kind: MediaKind::LatentAudioVideo,
                    fps: cursor.fps,
                    audio_latent: None,
                });
            }
        }
        Ok(())
    }

    fn empty_audio_latent(&mut self, fps: Option<u32>) -> Result<NodeRef> {
        let Some(audio_vae) = self.audio_vae.clone() else {
            bail!("no audio VAE loaded: cannot create an audio latent");
        };
        let frames = self.defaults.default_video_frames;
        let fps = fps.unwrap_or(self.defaults.default_video_fps);
        let audio = self.create_node(
            "LTXVEmptyLatentAudio",
            inputs([
                ("audio_vae", audio_vae.into()),
                ("frames_number", frames.into()),
                ("frame_rate", fps.into()),
                ("batch_size", 1.into()),
            ]),
        )?;
        Ok(audio.out(0))
    }

    /// Emits a checkpoint loader for `entry`, reusing an earlier dynamic one.
    pub fn load_checkpoint(&mut self, entry: &ModelEntry, id: Option<&str>) -> Result<LoadedModel> {
        let cache_key = format!("checkpoint:{}", entry.name);
        let cached = match id {
            None => self.helpers.get(&cache_key).cloned(),
            Some(_) => None,
        };
        let loader = match cached {
            Some(loader) => loader,
            None => {
                let node = self.create_node_at(
                    "CheckpointLoaderSimple",
                    inputs([("ckpt_name", entry.name.as_str().into())]),
                    id,
                )?;
                if id.is_none() {
                    self.helpers.insert(cache_key, node.as_str().to_string());
                }
                node.as_str().to_string()
            }
        };
        Ok(LoadedModel {
            entry: entry.clone(),
            model: NodeRef::new(loader.clone(), 0),
            clip: NodeRef::new(loader.clone(), 1),
            vae: NodeRef::new(loader, 2),
        })
    }

    /// Emits (or reuses) the audio VAE loader for a joint audio/video model.
    pub fn load_audio_vae(&mut self, entry: &ModelEntry) -> Result<NodeRef> {
        let cache_key = format!("audio_vae:{}", entry.name);
        if let Some(cached) = self.helpers.get(&cache_key) {
            return Ok(NodeRef::new(cached.clone(), 0));
        }
        let node = self.create_node(
            "LTXVAudioVAELoader",
            inputs([("ckpt_name", entry.name.as_str().into())]),
        )?;
        self.helpers.insert(cache_key, node.as_str().to_string());
        Ok(node.out(0))
    }

    /// Encodes `text` with `clip` into a conditioning reference.
    pub fn encode_prompt(&mut self, clip: &NodeRef, text: &str, id: Option<&str>) -> Result<NodeRef> {
        let node = self.create_node_at(
            "CLIPTextEncode",
            inputs([("clip", clip.into()), ("text", text.into())]),
            id,
        )?;
        Ok(node.out(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        params: ParamSet,
        models: ModelRegistry,
        defaults: GenerationDefaults,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                params: ParamSet::new(),
                models: ModelRegistry::with_builtin_models(),
                defaults: GenerationDefaults::default(),
            }
        }

        fn ctx(&self) -> GenerationContext<'_> {
            GenerationContext::new(&self.params, &self.models, &self.defaults)
        }
    }

    fn with_image_and_vae(ctx: &mut GenerationContext<'_>) {
        let loader = ctx
            .create_node_with_id(
                "CheckpointLoaderSimple",
                inputs([("ckpt_name", "m".into())]),
                "4",
            )
            .expect("loader should be created");
        ctx.current_vae = Some(loader.out(2));
        let image = ctx
            .create_node_with_id("LoadImage", inputs([("image", "in.png".into())]), "15")
            .expect("image should be created");
        ctx.advance_media(image.out(0), MediaKind::RawImage);
    }

    #[test]
    fn test_dynamic_ids_start_at_base_and_increase() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        let a = ctx
            .create_node("EmptyLatentImage", NodeInputs::new())
            .expect("node should be created");
        let b = ctx
            .create_node("EmptyLatentImage", NodeInputs::new())
            .expect("node should be created");
        assert_eq!(a.as_str(), "50000");
        assert_eq!(b.as_str(), "50001");
    }

    #[test]
    fn test_dynamic_id_skips_taken_ids() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        ctx.create_node_with_id("X", NodeInputs::new(), "50000")
            .expect("stable node should be created");
        assert_eq!(ctx.next_dynamic_id(), "50001");
    }

    #[test]
    fn test_ensure_kind_is_idempotent() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        with_image_and_vae(&mut ctx);

        let first = ctx.ensure_kind(MediaKind::Latent).expect("encode should work");
        let second = ctx.ensure_kind(MediaKind::Latent).expect("second call is a no-op");
        assert_eq!(first, second);
        assert_eq!(ctx.graph().count_of_type("VAEEncode"), 1);
    }

    #[test]
    fn test_ensure_kind_without_vae_fails() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        let image = ctx
            .create_node_with_id("LoadImage", NodeInputs::new(), "15")
            .expect("image should be created");
        ctx.advance_media(image.out(0), MediaKind::RawImage);

        let err = ctx
            .ensure_kind(MediaKind::Latent)
            .expect_err("encode without a VAE should fail");
        assert!(err.to_string().contains("no VAE loaded"));
    }

    #[test]
    fn test_joint_latent_round_trip_keeps_audio() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        with_image_and_vae(&mut ctx);
        let joint = ctx
            .create_node("SwarmKSampler", NodeInputs::new())
            .expect("sampler should be created");
        ctx.set_media(MediaCursor::new(joint.out(0), MediaKind::LatentAudioVideo));

        ctx.ensure_kind(MediaKind::Latent).expect("separate should work");
        let held_audio = ctx
            .media()
            .and_then(|m| m.audio_latent.clone())
            .expect("separation should hold the audio latent");

        let rejoined = ctx
            .ensure_kind(MediaKind::LatentAudioVideo)
            .expect("attach should work");
        let concat = ctx
            .graph()
            .get(&rejoined.node)
            .expect("concat node should exist");
        assert_eq!(concat.class_type, "LTXVConcatAVLatent");
        assert_eq!(concat.link("audio_latent"), Some(&held_audio));
        assert_eq!(ctx.graph().count_of_type("LTXVEmptyLatentAudio"), 0);
    }

    #[test]
    fn test_attach_audio_without_held_latent_needs_audio_vae() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        with_image_and_vae(&mut ctx);
        ctx.ensure_kind(MediaKind::Latent).expect("encode should work");

        assert!(ctx.ensure_kind(MediaKind::LatentAudioVideo).is_err());

        let audio_vae = ctx
            .create_node("LTXVAudioVAELoader", NodeInputs::new())
            .expect("loader should be created");
        ctx.audio_vae = Some(audio_vae.out(0));
        ctx.ensure_kind(MediaKind::LatentAudioVideo)
            .expect("attach should work with an audio VAE");
        assert_eq!(ctx.graph().count_of_type("LTXVEmptyLatentAudio"), 1);
    }

    #[test]
    fn test_advance_media_keeps_fps() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        with_image_and_vae(&mut ctx);
        ctx.set_media_fps(24);
        ctx.advance_media(NodeRef::new("4", 0), MediaKind::RawImage);
        assert_eq!(ctx.media().and_then(|m| m.fps), Some(24));
    }

    #[test]
    fn test_checkpoint_loader_is_reused() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        let entry = fixture
            .models
            .get("ltx-2-19b-dev")
            .expect("builtin model")
            .clone();

        let first = ctx.load_checkpoint(&entry, None).expect("load should work");
        let second = ctx.load_checkpoint(&entry, None).expect("load should work");
        let pinned = ctx
            .load_checkpoint(&entry, Some("20"))
            .expect("pinned load should work");

        assert_eq!(first, second);
        assert_eq!(pinned.model, NodeRef::new("20", 0));
        assert_eq!(ctx.graph().count_of_type("CheckpointLoaderSimple"), 2);
    }

    #[test]
    fn test_media_as_raw_image_without_media() {
        let fixture = Fixture::new();
        let mut ctx = fixture.ctx();
        assert_eq!(ctx.media_as_raw_image().expect("no media is not an error"), None);
    }
}
