//! Latent-upscale extension.
//!
//! Activating it wraps three stock stages with decorators that route LTXV2
//! requests asking for a `latentmodel-` upscale through the two-stage
//! pipeline and leave every other request on the stock path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use crate::context::GenerationContext;
use crate::params::keys;
use crate::registry::{PipelineStage, StageRegistry};
use crate::sampling::VideoRequest;
use crate::stages::{priority, run_extend, RefinerStage};
use crate::upscale::{
    run_two_stage_image_to_video, wants_latent_upscale, LatentChainSet, UpscaleEntry,
    UpscaleMethod,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationOutcome {
    Activated,
    AlreadyActive,
}

/// Patch-once guard owned by whoever composes the registry.
#[derive(Debug, Default)]
pub struct ExtensionActivation {
    activated: AtomicBool,
}

impl ExtensionActivation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    /// Installs the decorators on the first call; later calls change nothing.
    pub fn activate(&self, registry: &mut StageRegistry) -> ActivationOutcome {
        if self
            .activated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Latent upscale extension already active");
            return ActivationOutcome::AlreadyActive;
        }

        let chains = LatentChainSet::builtin();
        let i2v_chains = chains.clone();
        let extend_chains = chains.clone();
        let patched = [
            registry.replace(priority::IMAGE_TO_VIDEO, false, move |inner| {
                Arc::new(LatentUpscaleImageToVideoStage {
                    inner,
                    chains: i2v_chains,
                })
            }),
            registry.replace(priority::EXTEND_VIDEO, false, move |inner| {
                Arc::new(LatentUpscaleExtendStage {
                    inner,
                    chains: extend_chains,
                })
            }),
            registry.replace(priority::REFINER, true, move |inner| {
                Arc::new(LatentUpscaleRefinerStage {
                    inner,
                    chain_aware: RefinerStage::with_chains(chains),
                })
            }),
        ];
        info!(
            patched = patched.iter().filter(|replaced| **replaced).count(),
            "Activated latent upscale extension"
        );
        ActivationOutcome::Activated
    }
}

/// Image-to-video, two-stage when the latent upscale predicate holds.
pub struct LatentUpscaleImageToVideoStage {
    inner: Arc<dyn PipelineStage>,
    chains: LatentChainSet,
}

impl PipelineStage for LatentUpscaleImageToVideoStage {
    fn name(&self) -> &str {
        "latent-upscale-image-to-video"
    }

    fn run(&self, ctx: &mut GenerationContext<'_>) -> Result<()> {
        let params = ctx.params();
        let Some(settings) = wants_latent_upscale(params, ctx.models(), UpscaleEntry::ImageToVideo)?
        else {
            return self.inner.run(ctx);
        };
        let Some(request) = VideoRequest::from_params(params, ctx.models(), ctx.defaults())? else {
            return self.inner.run(ctx);
        };
        let Some(snapshot) = ctx.media_as_raw_image()? else {
            debug!("No media to snapshot, using stock image-to-video");
            return self.inner.run(ctx);
        };
        run_two_stage_image_to_video(ctx, &request, &settings, &self.chains, snapshot)
    }
}

/// Extend segments with a per-segment latent upscale refine.
pub struct LatentUpscaleExtendStage {
    inner: Arc<dyn PipelineStage>,
    chains: LatentChainSet,
}

impl PipelineStage for LatentUpscaleExtendStage {
    fn name(&self) -> &str {
        "latent-upscale-extend-video"
    }

    fn run(&self, ctx: &mut GenerationContext<'_>) -> Result<()> {
        match wants_latent_upscale(ctx.params(), ctx.models(), UpscaleEntry::VideoToVideo)? {
            Some(settings) => run_extend(ctx, Some((&settings, &self.chains))),
            None => self.inner.run(ctx),
        }
    }
}

/// Keeps the image refiner out of the way of the video latent upscale.
pub struct LatentUpscaleRefinerStage {
    inner: Arc<dyn PipelineStage>,
    chain_aware: RefinerStage,
}

impl PipelineStage for LatentUpscaleRefinerStage {
    fn name(&self) -> &str {
        "latent-upscale-refiner"
    }

    fn run(&self, ctx: &mut GenerationContext<'_>) -> Result<()> {
        let params = ctx.params();
        if wants_latent_upscale(params, ctx.models(), UpscaleEntry::ImageToVideo)?.is_some() {
            debug!("Video latent upscale owns the upscale, skipping image refiner");
            return Ok(());
        }
        let scaled = params
            .try_get::<f64>(keys::REFINER_UPSCALE)
            .is_some_and(|scale| scale != 1.0);
        if scaled && matches!(UpscaleMethod::from_params(params), UpscaleMethod::LatentModel(_)) {
            return self.chain_aware.run(ctx);
        }
        self.inner.run(ctx)
    }
}
