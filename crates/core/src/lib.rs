//! Workflow construction for node-graph image and video generation.

pub mod builder;
pub mod config;
pub mod context;
pub mod error;
pub mod extension;
pub mod graph;
pub mod logging;
pub mod media;
pub mod model_registry;
pub mod params;
pub mod postprocess;
pub mod prompt;
pub mod registry;
pub mod resolution;
pub mod sampling;
pub mod stages;
pub mod upscale;

pub use builder::WorkflowBuilder;
pub use error::{as_user_config_error, UserConfigError};
pub use extension::{ActivationOutcome, ExtensionActivation};
pub use graph::WorkflowGraph;
pub use params::ParamSet;
