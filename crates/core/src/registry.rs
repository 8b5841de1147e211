use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::context::GenerationContext;

/// Priorities closer than this are treated as the same slot.
pub const PRIORITY_TOLERANCE: f64 = 1e-4;

/// One step of workflow construction.
pub trait PipelineStage: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, ctx: &mut GenerationContext<'_>) -> Result<()>;
}

#[derive(Clone)]
pub struct StageEntry {
    pub priority: f64,
    pub stage: Arc<dyn PipelineStage>,
}

impl fmt::Debug for StageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageEntry")
            .field("priority", &self.priority)
            .field("stage", &self.stage.name())
            .finish()
    }
}

/// Stages ordered by ascending priority, ties kept in registration order.
#[derive(Debug, Clone, Default)]
pub struct StageRegistry {
    entries: Vec<StageEntry>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn register<S>(&mut self, priority: f64, stage: S)
    where
        S: PipelineStage + 'static,
    {
        self.register_arc(priority, Arc::new(stage));
    }

    pub fn register_arc(&mut self, priority: f64, stage: Arc<dyn PipelineStage>) {
        self.entries.push(StageEntry { priority, stage });
        self.sort();
    }

    /// Index of the stage registered at `priority`; `from_end` picks the last
    /// of several matches.
    pub fn find(&self, priority: f64, from_end: bool) -> Option<usize> {
        let matches = |entry: &StageEntry| (entry.priority - priority).abs() < PRIORITY_TOLERANCE;
        if from_end {
            self.entries.iter().rposition(matches)
        } else {
            self.entries.iter().position(matches)
        }
    }

    /// Hands the stage at `priority` to `wrap` and installs what it returns.
    ///
    /// A missing stage is logged and left alone; the pipeline keeps running
    /// with its stock behaviour. Returns whether a stage was replaced.
    pub fn replace<F>(&mut self, priority: f64, from_end: bool, wrap: F) -> bool
    where
        F: FnOnce(Arc<dyn PipelineStage>) -> Arc<dyn PipelineStage>,
    {
        let Some(index) = self.find(priority, from_end) else {
            warn!(priority, "Could not find workflow stage to replace");
            return false;
        };

        let entry = &mut self.entries[index];
        let replaced = entry.stage.name().to_string();
        entry.stage = wrap(Arc::clone(&entry.stage));
        debug!(
            priority,
            replaced = %replaced,
            stage = entry.stage.name(),
            "Replaced workflow stage"
        );
        self.sort();
        true
    }

    pub fn stages(&self) -> Vec<(f64, &str)> {
        self.entries
            .iter()
            .map(|entry| (entry.priority, entry.stage.name()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs every stage in order against one context.
    pub fn run(&self, ctx: &mut GenerationContext<'_>) -> Result<()> {
        for entry in &self.entries {
            let name = entry.stage.name();
            debug!(stage = name, priority = entry.priority, "Running workflow stage");
            entry
                .stage
                .run(ctx)
                .with_context(|| format!("stage '{name}' (priority {}) failed", entry.priority))?;
        }
        Ok(())
    }

    fn sort(&mut self) {
        self.entries
            .sort_by(|a, b| a.priority.total_cmp(&b.priority));
    }
}

/// Registry with the stock pipeline stages installed.
pub fn build_default_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    crate::stages::register_stock_stages(&mut registry);
    registry
}
