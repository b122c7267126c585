use std::fmt;
use std::sync::Arc;

use rhai::module_resolvers::DummyModuleResolver;
use rhai::Engine;
use sh_core::EngineLimits;

use crate::modules::{HubResolver, ModuleHub};

/// Which import mechanism currently backs the engine's module resolver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolverOwner {
    Unclaimed,
    /// Supplied when the engine was built; contexts never replace it.
    Foreign,
    Context(u64),
}

/// A configured interpreter instance. Not safe for concurrent use; always
/// reached through an [`EngineHolder`](crate::EngineHolder).
pub struct ScriptEngine {
    engine: Engine,
    resolver_owner: ResolverOwner,
}

impl ScriptEngine {
    pub fn new() -> Self {
        Self::with_limits(&EngineLimits::default())
    }

    pub fn with_limits(limits: &EngineLimits) -> Self {
        let mut engine = Engine::new();
        apply_limits(&mut engine, limits);
        engine.set_module_resolver(DummyModuleResolver::new());
        Self {
            engine,
            resolver_owner: ResolverOwner::Unclaimed,
        }
    }

    /// Builds an engine whose imports are served by `resolver` for its whole
    /// life. Contexts on such an engine cannot use `load_modules`.
    pub fn with_module_resolver(
        limits: &EngineLimits,
        resolver: impl rhai::ModuleResolver + 'static,
    ) -> Self {
        let mut engine = Engine::new();
        apply_limits(&mut engine, limits);
        engine.set_module_resolver(resolver);
        Self {
            engine,
            resolver_owner: ResolverOwner::Foreign,
        }
    }

    /// Wraps an engine configured elsewhere. Its resolver is treated as foreign.
    pub fn from_engine(engine: Engine) -> Self {
        Self {
            engine,
            resolver_owner: ResolverOwner::Foreign,
        }
    }

    pub fn rhai(&self) -> &Engine {
        &self.engine
    }

    /// Mutable access for registering host functions and types.
    pub fn rhai_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    pub(crate) fn resolver_owner(&self) -> ResolverOwner {
        self.resolver_owner
    }

    pub(crate) fn install_hub(&mut self, context_id: u64, hub: Arc<ModuleHub>) {
        self.engine.set_module_resolver(HubResolver::new(hub));
        self.resolver_owner = ResolverOwner::Context(context_id);
    }

    pub(crate) fn reset_resolver(&mut self) {
        self.engine.set_module_resolver(DummyModuleResolver::new());
        self.resolver_owner = ResolverOwner::Unclaimed;
    }
}

impl Default for ScriptEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ScriptEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptEngine")
            .field("resolver_owner", &self.resolver_owner)
            .finish_non_exhaustive()
    }
}

fn apply_limits(engine: &mut Engine, limits: &EngineLimits) {
    engine.set_strict_variables(limits.strict_variables);
    if let Some(max) = limits.max_operations {
        engine.set_max_operations(max);
    }
    if let Some(max) = limits.max_call_levels {
        engine.set_max_call_levels(max);
    }
    if limits.max_expr_depth.is_some() || limits.max_function_expr_depth.is_some() {
        let expr = limits.max_expr_depth.unwrap_or(engine.max_expr_depth());
        let function_expr = limits
            .max_function_expr_depth
            .unwrap_or(engine.max_function_expr_depth());
        engine.set_max_expr_depths(expr, function_expr);
    }
    if let Some(max) = limits.max_string_size {
        engine.set_max_string_size(max);
    }
    if let Some(max) = limits.max_array_size {
        engine.set_max_array_size(max);
    }
    if let Some(max) = limits.max_map_size {
        engine.set_max_map_size(max);
    }
}

#[cfg(test)]
mod engine_tests {
    use super::*;
    use rhai::module_resolvers::StaticModuleResolver;

    #[test]
    fn default_engine_is_unclaimed_and_evaluates() {
        let engine = ScriptEngine::new();
        assert_eq!(engine.resolver_owner(), ResolverOwner::Unclaimed);
        let value = engine.rhai().eval::<rhai::INT>("40 + 2").expect("eval");
        assert_eq!(value, 42);
    }

    #[test]
    fn limits_are_applied() {
        let engine = ScriptEngine::with_limits(&EngineLimits {
            max_operations: Some(50),
            strict_variables: true,
            ..EngineLimits::default()
        });
        assert_eq!(engine.rhai().max_operations(), 50);
        assert!(engine.rhai().strict_variables());
        assert!(engine
            .rhai()
            .run("let i = 0; while i < 1000 { i += 1; }")
            .is_err());
    }

    #[test]
    fn foreign_resolver_is_marked() {
        let engine =
            ScriptEngine::with_module_resolver(&EngineLimits::default(), StaticModuleResolver::new());
        assert_eq!(engine.resolver_owner(), ResolverOwner::Foreign);
        assert_eq!(
            ScriptEngine::from_engine(Engine::new()).resolver_owner(),
            ResolverOwner::Foreign
        );
    }

    #[test]
    fn hub_install_and_reset_track_owner() {
        let mut engine = ScriptEngine::new();
        engine.install_hub(9, Arc::new(ModuleHub::new(None)));
        assert_eq!(engine.resolver_owner(), ResolverOwner::Context(9));
        engine.reset_resolver();
        assert_eq!(engine.resolver_owner(), ResolverOwner::Unclaimed);
    }
}
