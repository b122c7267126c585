mod context;
mod engine;
mod holder;
mod marshal;
mod modules;

pub use context::{ContextOptions, EngineContext, ScopeBindings};
pub use engine::ScriptEngine;
pub use holder::{configure_default_locking, default_locking, EngineHolder, EngineLease};
pub use modules::{normalize_module_path, MapModuleResolver, ModuleHub, ModuleResolver};
pub use sh_core::{ErrorKind, HostError, LockingMode, OpaqueHandle, Value};
