use std::fmt;
use std::fs;
use std::mem;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rhai::{CallFnOptions, Dynamic, FnPtr, Map, Module, Scope, Stmt, AST};
use sh_core::{HostConfig, HostError, Value};
use tracing::{debug, trace};

use crate::engine::{ResolverOwner, ScriptEngine};
use crate::holder::EngineHolder;
use crate::marshal::{
    dynamic_to_value, ensure_identifier, eval_error, function_not_found, handle_library,
    parse_error, value_to_dynamic, SharedArguments,
};
use crate::modules::{ModuleHub, ModuleResolver};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Name prefix the interpreter gives the functions behind closures.
const CLOSURE_PREFIX: &str = "anon$";

/// The persistent ("global") layer of a context: variables that outlive a
/// single call plus every script function defined by persistent loads.
pub struct ScopeBindings {
    scope: Scope<'static>,
    library: AST,
    /// Top-level imports of persistent loads, replayed before every call.
    prelude: AST,
    modules: Option<Arc<ModuleHub>>,
    loaded_sources: Vec<String>,
}

impl ScopeBindings {
    fn new() -> Self {
        Self {
            scope: Scope::new(),
            library: AST::empty(),
            prelude: AST::empty(),
            modules: None,
            loaded_sources: Vec::new(),
        }
    }

    pub fn scope(&self) -> &Scope<'static> {
        &self.scope
    }

    pub fn scope_mut(&mut self) -> &mut Scope<'static> {
        &mut self.scope
    }

    pub fn library(&self) -> &AST {
        &self.library
    }

    pub fn modules(&self) -> Option<&Arc<ModuleHub>> {
        self.modules.as_ref()
    }

    /// Source names passed to `load_persistent`, in load order.
    pub fn loaded_sources(&self) -> &[String] {
        &self.loaded_sources
    }

    pub fn names(&self) -> Vec<String> {
        self.scope
            .iter()
            .map(|(name, _, _)| name.to_string())
            .collect()
    }
}

fn has_function(library: &AST, name: &str, arity: usize) -> bool {
    library
        .iter_functions()
        .any(|function| function.name == name && function.params.len() == arity)
}

fn import_statements(ast: &AST) -> AST {
    let imports = ast
        .statements()
        .iter()
        .filter(|statement| matches!(statement, Stmt::Import(..)))
        .cloned();
    AST::new(imports, Module::new())
}

/// A bare reference to a persistent map or array variable. The slot is
/// converted to a shared cell so the returned handle aliases it.
fn persistent_alias(scope: &mut Scope<'static>, library: &AST, name: &str) -> Option<Value> {
    if ensure_identifier(name).is_err() || scope.is_constant(name) != Some(false) {
        return None;
    }
    let slot = scope.get_mut(name)?;
    if !(slot.is_shared() || slot.is_map() || slot.is_array()) {
        return None;
    }
    if !slot.is_shared() {
        *slot = mem::take(slot).into_shared();
    }
    Some(dynamic_to_value(slot.clone(), library))
}

/// Discards everything an isolated eval pushes above the persistent layer.
/// Rewinding happens in `Drop`, so success, failure and unwinding all restore
/// the scope to its pre-call length.
struct ShieldGuard<'a> {
    scope: &'a mut Scope<'static>,
    marker: usize,
}

impl<'a> ShieldGuard<'a> {
    fn install(scope: &'a mut Scope<'static>) -> Self {
        let marker = scope.len();
        Self { scope, marker }
    }

    fn active(&mut self) -> &mut Scope<'static> {
        self.scope
    }
}

impl Drop for ShieldGuard<'_> {
    fn drop(&mut self) {
        let discarded = self.scope.len().saturating_sub(self.marker);
        self.scope.rewind(self.marker);
        trace!(discarded, "shielded layer discarded");
    }
}

#[derive(Clone, Default)]
pub struct ContextOptions {
    pub name: Option<String>,
    /// Consulted by imports after the sources registered with `load_modules`.
    pub external_resolver: Option<Arc<dyn ModuleResolver>>,
}

impl fmt::Debug for ContextOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextOptions")
            .field("name", &self.name)
            .field("external_resolver", &self.external_resolver.is_some())
            .finish()
    }
}

/// An engine plus one persistent scope.
///
/// Every operation first takes exclusive engine access through the holder,
/// so a context is safe to share across threads; contention surfaces as
/// `ENGINE_CONCURRENT_ACCESS` when locking is enabled.
pub struct EngineContext {
    id: u64,
    name: Option<String>,
    holder: Arc<EngineHolder>,
    bindings: Mutex<ScopeBindings>,
    external_resolver: Option<Arc<dyn ModuleResolver>>,
}

impl EngineContext {
    /// Fresh engine, default locking.
    pub fn new() -> Self {
        Self::with_holder(
            Arc::new(EngineHolder::with_default_locking(ScriptEngine::new())),
            ContextOptions::default(),
        )
    }

    pub fn from_config(
        config: &HostConfig,
        external_resolver: Option<Arc<dyn ModuleResolver>>,
    ) -> Self {
        let engine = ScriptEngine::with_limits(&config.limits);
        let holder = match config.locking {
            Some(locking) => EngineHolder::new(engine, locking),
            None => EngineHolder::with_default_locking(engine),
        };
        Self::with_holder(
            Arc::new(holder),
            ContextOptions {
                name: config.name.clone(),
                external_resolver,
            },
        )
    }

    /// Context over an existing holder. Several contexts may share one engine;
    /// each keeps its own persistent scope and modules.
    pub fn with_holder(holder: Arc<EngineHolder>, options: ContextOptions) -> Self {
        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        debug!(context = id, name = options.name.as_deref().unwrap_or(""), "context created");
        Self {
            id,
            name: options.name,
            holder,
            bindings: Mutex::new(ScopeBindings::new()),
            external_resolver: options.external_resolver,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn holder(&self) -> &Arc<EngineHolder> {
        &self.holder
    }

    /// Runs `operation` with the engine and this context's persistent layer,
    /// under exclusive engine access. Nothing is shielded.
    pub fn with_engine_and_scope<T>(
        &self,
        operation: impl FnOnce(&mut ScriptEngine, &mut ScopeBindings) -> Result<T, HostError>,
    ) -> Result<T, HostError> {
        self.holder.with_engine(|engine| {
            let mut bindings = self.bindings.lock();
            self.claim_resolver(engine, &bindings);
            operation(engine, &mut bindings)
        })
    }

    /// Evaluates `code` against the persistent layer without letting it add
    /// to it. New top-level variables and named functions are discarded
    /// afterwards; values already in the persistent layer can still be
    /// mutated in place. Closures created by `code` are kept, since values
    /// stored in the persistent layer may point at them.
    ///
    /// A bare persistent map or array variable name yields a handle to the
    /// variable itself rather than to a copy.
    pub fn eval(&self, code: &str) -> Result<Value, HostError> {
        trace!(context = self.id, "isolated eval");
        self.with_engine_and_scope(|engine, bindings| {
            let ScopeBindings {
                scope,
                library,
                prelude,
                ..
            } = bindings;
            if let Some(alias) = persistent_alias(scope, library, code.trim()) {
                return Ok(alias);
            }

            let ast = engine
                .rhai()
                .compile_with_scope(scope, code)
                .map_err(parse_error)?;
            let closures = ast.clone_functions_only_filtered(|_, _, _, name, _| {
                name.starts_with(CLOSURE_PREFIX)
            });
            let program = prelude.merge(library).merge(&ast);

            let mut shield = ShieldGuard::install(scope);
            let result = engine
                .rhai()
                .eval_ast_with_scope::<Dynamic>(shield.active(), &program);
            drop(shield);

            if closures.iter_functions().next().is_some() {
                *library = library.merge(&closures);
            }
            let result = result.map_err(eval_error)?;
            Ok(dynamic_to_value(result, &program))
        })
    }

    /// Same as [`eval`](Self::eval); reads better when fetching an object to
    /// pass to [`invoke_method`](Self::invoke_method).
    pub fn script_object(&self, expression: &str) -> Result<Value, HostError> {
        self.eval(expression)
    }

    /// Runs `code` directly in the persistent layer. Its variables,
    /// functions and top-level imports stay visible to later calls. A failure
    /// part way through keeps whatever ran before it, except its imports.
    pub fn load_persistent(&self, name: &str, code: &str) -> Result<(), HostError> {
        debug!(context = self.id, source = name, "persistent load");
        self.with_engine_and_scope(|engine, bindings| {
            let mut ast = engine
                .rhai()
                .compile_with_scope(&bindings.scope, code)
                .map_err(parse_error)?;
            ast.set_source(name);

            let program = bindings.prelude.merge(&bindings.library).merge(&ast);
            bindings.library = program.clone_functions_only();
            bindings.loaded_sources.push(name.to_string());

            engine
                .rhai()
                .run_ast_with_scope(&mut bindings.scope, &program)
                .map_err(eval_error)?;

            let imports = import_statements(&ast);
            if !imports.statements().is_empty() {
                trace!(context = self.id, count = imports.statements().len(), "imports kept");
                bindings.prelude = bindings.prelude.merge(&imports);
            }
            Ok(())
        })
    }

    pub fn load_persistent_file(&self, path: impl AsRef<Path>) -> Result<(), HostError> {
        let path = path.as_ref();
        let code = fs::read_to_string(path).map_err(|error| {
            HostError::state(
                "CONTEXT_SOURCE_READ",
                format!("Failed to read script \"{}\": {}", path.display(), error),
            )
        })?;
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        self.load_persistent(&name, &code)
    }

    /// Calls a persistent script function, or a function pointer stored in a
    /// persistent variable called `name`. Array and map arguments are passed
    /// by reference: the callee's changes are copied back into `args`.
    pub fn invoke_function(&self, name: &str, args: &mut [Value]) -> Result<Value, HostError> {
        ensure_identifier(name)?;
        trace!(context = self.id, function = name, arity = args.len(), "invoke function");
        self.with_engine_and_scope(|engine, bindings| {
            let mut shared = SharedArguments::prepare(args)?;
            let call_args = shared.take_values();
            let arity = call_args.len();

            let ScopeBindings {
                scope,
                library,
                prelude,
                ..
            } = bindings;
            let outcome = if has_function(library, name, arity) {
                call_library(engine, scope, prelude, library, name, None, call_args)
            } else if let Some(fn_ptr) = scope.get_value::<FnPtr>(name) {
                call_pointer(engine, scope, prelude, library, &fn_ptr, None, call_args)
            } else {
                Err(function_not_found(name, arity))
            };

            shared.write_back(args, library);
            outcome.map(|result| dynamic_to_value(result, library))
        })
    }

    /// Calls `name` as a method of `target`, with `this` bound to it. A map
    /// property holding a function pointer wins over a library function of
    /// the same name.
    pub fn invoke_method(
        &self,
        target: &Value,
        name: &str,
        args: &mut [Value],
    ) -> Result<Value, HostError> {
        ensure_identifier(name)?;
        trace!(context = self.id, method = name, arity = args.len(), "invoke method");
        self.with_engine_and_scope(|engine, bindings| {
            let ScopeBindings {
                scope,
                library,
                prelude,
                ..
            } = bindings;
            let merged;
            let library: &AST = match handle_library(target) {
                Some(carried) => {
                    merged = library.merge(carried);
                    &merged
                }
                None => library,
            };

            let mut receiver = value_to_dynamic(target)?;
            let mut shared = SharedArguments::prepare(args)?;
            let call_args = shared.take_values();
            let arity = call_args.len();

            let property = receiver
                .read_lock::<Map>()
                .and_then(|map| map.get(name).cloned())
                .and_then(|property| property.flatten().try_cast::<FnPtr>());

            let outcome = match property {
                Some(fn_ptr) => {
                    let this = Some(&mut receiver);
                    call_pointer(engine, scope, prelude, library, &fn_ptr, this, call_args)
                }
                None if has_function(library, name, arity) => {
                    let this = Some(&mut receiver);
                    call_library(engine, scope, prelude, library, name, this, call_args)
                }
                None => Err(function_not_found(name, arity)),
            };

            shared.write_back(args, library);
            outcome.map(|result| dynamic_to_value(result, library))
        })
    }

    /// Makes `targets` importable from this context's scripts with
    /// `import "<name>" as alias;`.
    pub fn load_modules(
        &self,
        targets: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), HostError> {
        let targets = targets.into_iter().collect::<Vec<_>>();
        self.with_engine_and_scope(|engine, bindings| {
            if engine.resolver_owner() == ResolverOwner::Foreign {
                return Err(HostError::state(
                    "MODULE_RESOLVER_INCOMPATIBLE",
                    "The engine already has a module resolver that cannot be replaced.",
                ));
            }
            let hub = bindings
                .modules
                .get_or_insert_with(|| Arc::new(ModuleHub::new(self.external_resolver.clone())))
                .clone();
            if engine.resolver_owner() != ResolverOwner::Context(self.id) {
                engine.install_hub(self.id, Arc::clone(&hub));
            }
            let added = hub.register(targets)?;
            debug!(context = self.id, added, "modules registered");
            Ok(())
        })
    }

    pub fn persistent_names(&self) -> Result<Vec<String>, HostError> {
        self.with_engine_and_scope(|_, bindings| Ok(bindings.names()))
    }

    fn claim_resolver(&self, engine: &mut ScriptEngine, bindings: &ScopeBindings) {
        match (bindings.modules.as_ref(), engine.resolver_owner()) {
            (_, ResolverOwner::Foreign) => {}
            (Some(hub), owner) if owner != ResolverOwner::Context(self.id) => {
                trace!(context = self.id, "claiming module resolver");
                engine.install_hub(self.id, Arc::clone(hub));
            }
            (None, ResolverOwner::Context(owner)) if owner != self.id => {
                engine.reset_resolver();
            }
            _ => {}
        }
    }
}

impl Default for EngineContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineContext")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("holder", &self.holder)
            .finish_non_exhaustive()
    }
}

/// Calls a library function. Persistent imports are replayed first so
/// namespaced calls inside the function resolve.
fn call_library(
    engine: &ScriptEngine,
    scope: &mut Scope<'static>,
    prelude: &AST,
    library: &AST,
    name: &str,
    this: Option<&mut Dynamic>,
    args: Vec<Dynamic>,
) -> Result<Dynamic, HostError> {
    let replay = !prelude.statements().is_empty();
    let merged;
    let program = if replay {
        merged = prelude.merge(library);
        &merged
    } else {
        library
    };
    let mut options = CallFnOptions::new().eval_ast(replay).rewind_scope(true);
    if let Some(this) = this {
        options = options.bind_this_ptr(this);
    }
    engine
        .rhai()
        .call_fn_with_options::<Dynamic>(options, scope, program, name, args)
        .map_err(eval_error)
}

fn call_pointer(
    engine: &ScriptEngine,
    scope: &mut Scope<'static>,
    prelude: &AST,
    library: &AST,
    fn_ptr: &FnPtr,
    this: Option<&mut Dynamic>,
    args: Vec<Dynamic>,
) -> Result<Dynamic, HostError> {
    let mut full_args = fn_ptr.curry().to_vec();
    full_args.extend(args);
    if !has_function(library, fn_ptr.fn_name(), full_args.len()) {
        return Err(function_not_found(fn_ptr.fn_name(), full_args.len()));
    }
    call_library(engine, scope, prelude, library, fn_ptr.fn_name(), this, full_args)
}
