//! Stock pipeline stages.

pub mod base;
pub mod extend;
pub mod image_to_video;
pub mod refiner;

use crate::registry::StageRegistry;

pub use base::{
    BaseSamplerStage, DecodeStage, InitialMediaStage, LoadModelStage, PromptStage, SaveImageStage,
};
pub use extend::{run_extend, ExtendVideoStage};
pub use image_to_video::ImageToVideoStage;
pub use refiner::RefinerStage;

/// Stage priorities. Extensions patch stages by these values.
pub mod priority {
    pub const LOAD_MODEL: f64 = -10.0;
    pub const PROMPT: f64 = -9.0;
    pub const INITIAL_MEDIA: f64 = -8.0;
    pub const BASE_SAMPLER: f64 = -5.0;
    pub const REFINER: f64 = -4.0;
    pub const DECODE: f64 = 0.0;
    pub const SAVE_IMAGE: f64 = 10.0;
    pub const IMAGE_TO_VIDEO: f64 = 11.0;
    pub const EXTEND_VIDEO: f64 = 12.0;
}

pub fn register_stock_stages(registry: &mut StageRegistry) {
    registry.register(priority::LOAD_MODEL, LoadModelStage);
    registry.register(priority::PROMPT, PromptStage);
    registry.register(priority::INITIAL_MEDIA, InitialMediaStage);
    registry.register(priority::BASE_SAMPLER, BaseSamplerStage);
    registry.register(priority::REFINER, RefinerStage::new());
    registry.register(priority::DECODE, DecodeStage);
    registry.register(priority::SAVE_IMAGE, SaveImageStage);
    registry.register(priority::IMAGE_TO_VIDEO, ImageToVideoStage);
    registry.register(priority::EXTEND_VIDEO, ExtendVideoStage);
}
