// src/stage/registry.rs

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::config::model::{PipelineConfig, StageInstance};
use crate::errors::ConfigError;
use crate::stage::command::{CommandStage, COMMAND_STAGE_TYPE};
use crate::stage::{PipelineContext, StageRunner};

/// Builds the runner for one stage instance. Rejecting the instance's
/// parameters is reported as [`ConfigError::InvalidParameters`].
pub type StageFactory = Box<
    dyn Fn(&StageInstance, &PipelineContext) -> anyhow::Result<Arc<dyn StageRunner>>
        + Send
        + Sync,
>;

/// Explicit mapping from stage-type identifiers to runner factories.
///
/// An instance is bound by trying, in order, `"<module>.<task>"`, `module`
/// and `task`. Binding happens once, before anything is scheduled.
#[derive(Default)]
pub struct StageRegistry {
    factories: BTreeMap<String, StageFactory>,
}

impl fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageRegistry")
            .field("stage_types", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in `command` runner.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(COMMAND_STAGE_TYPE, |instance, ctx| {
            let stage = CommandStage::from_instance(instance, ctx)?;
            Ok(Arc::new(stage) as Arc<dyn StageRunner>)
        });
        registry
    }

    /// Register (or replace) the factory for a stage-type identifier.
    pub fn register<F>(&mut self, stage_type: impl Into<String>, factory: F)
    where
        F: Fn(&StageInstance, &PipelineContext) -> anyhow::Result<Arc<dyn StageRunner>>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(stage_type.into(), Box::new(factory));
    }

    /// Register a factory that ignores the instance and always hands out the
    /// same runner.
    pub fn register_runner(&mut self, stage_type: impl Into<String>, runner: Arc<dyn StageRunner>) {
        self.register(stage_type, move |_, _| Ok(Arc::clone(&runner)));
    }

    pub fn contains(&self, stage_type: &str) -> bool {
        self.factories.contains_key(stage_type)
    }

    pub fn stage_types(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// The registry key an instance resolves to, if any.
    pub fn resolve_key(&self, instance: &StageInstance) -> Option<String> {
        let mut candidates = Vec::with_capacity(3);
        if let Some(module) = &instance.module {
            candidates.push(format!("{module}.{}", instance.stage_type));
            candidates.push(module.clone());
        }
        candidates.push(instance.stage_type.clone());

        candidates.into_iter().find(|key| self.contains(key))
    }

    /// Build the runner for one instance.
    pub fn bind(
        &self,
        instance: &StageInstance,
        ctx: &PipelineContext,
    ) -> Result<Arc<dyn StageRunner>, ConfigError> {
        let key = self
            .resolve_key(instance)
            .ok_or_else(|| ConfigError::UnknownStageType {
                stage: instance.name.clone(),
                stage_type: match &instance.module {
                    Some(module) => format!("{module}.{}", instance.stage_type),
                    None => instance.stage_type.clone(),
                },
            })?;

        let factory = &self.factories[&key];
        let runner = factory(instance, ctx).map_err(|e| ConfigError::InvalidParameters {
            stage: instance.name.clone(),
            reason: format!("{e:#}"),
        })?;

        debug!(stage = %instance.name, stage_type = %key, "bound stage runner");
        Ok(runner)
    }

    /// Bind every instance, collecting all failures instead of stopping at
    /// the first one.
    pub fn bind_all(
        &self,
        cfg: &PipelineConfig,
        ctx: &PipelineContext,
    ) -> (Vec<Option<Arc<dyn StageRunner>>>, Vec<ConfigError>) {
        let mut runners = Vec::with_capacity(cfg.stages().len());
        let mut errors = Vec::new();

        for instance in cfg.stages() {
            match self.bind(instance, ctx) {
                Ok(runner) => runners.push(Some(runner)),
                Err(e) => {
                    errors.push(e);
                    runners.push(None);
                }
            }
        }

        (runners, errors)
    }
}
