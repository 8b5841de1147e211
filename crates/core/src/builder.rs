use anyhow::{Context, Result};
use tracing::info;

use crate::config::GenerationDefaults;
use crate::context::GenerationContext;
use crate::extension::ExtensionActivation;
use crate::graph::WorkflowGraph;
use crate::model_registry::ModelRegistry;
use crate::params::ParamSet;
use crate::registry::{build_default_registry, StageRegistry};

/// Composition root: stock stages, optional extension, one build per call.
///
/// The registry is only mutated while the builder is being set up, so a
/// built `WorkflowBuilder` can be shared across threads and used for
/// concurrent builds.
#[derive(Debug)]
pub struct WorkflowBuilder {
    registry: StageRegistry,
    models: ModelRegistry,
    defaults: GenerationDefaults,
}

impl WorkflowBuilder {
    pub fn new(models: ModelRegistry, defaults: GenerationDefaults) -> Self {
        Self {
            registry: build_default_registry(),
            models,
            defaults,
        }
    }

    pub fn with_extension(mut self, activation: &ExtensionActivation) -> Self {
        activation.activate(&mut self.registry);
        self
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Runs every stage against a fresh context and returns the graph.
    ///
    /// Any stage error aborts the build; no partial graph is returned.
    pub fn build(&self, params: &ParamSet) -> Result<WorkflowGraph> {
        let mut ctx = GenerationContext::new(params, &self.models, &self.defaults);
        self.registry.run(&mut ctx)?;
        let graph = ctx.into_graph();
        graph
            .validate_construction_order()
            .context("built workflow is not in construction order")?;
        info!(nodes = graph.len(), "Built workflow");
        Ok(graph)
    }
}
