use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rhai::{Dynamic, Engine, EvalAltResult, Module, Position, Scope, Shared};
use sh_core::HostError;
use tracing::{debug, trace};

const MODULE_EXTENSION: &str = ".rhai";

type SharedModule = Shared<Module>;

/// Supplies module source text by normalized name.
pub trait ModuleResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<String, HostError>;
}

#[derive(Debug, Clone, Default)]
pub struct MapModuleResolver {
    sources: BTreeMap<String, String>,
}

impl MapModuleResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl AsRef<str>, source: impl Into<String>) {
        self.sources
            .insert(normalize_module_path(None, name.as_ref()), source.into());
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

impl<K: AsRef<str>, V: Into<String>> FromIterator<(K, V)> for MapModuleResolver {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut resolver = Self::new();
        for (name, source) in iter {
            resolver.insert(name, source);
        }
        resolver
    }
}

impl ModuleResolver for MapModuleResolver {
    fn resolve(&self, name: &str) -> Result<String, HostError> {
        self.sources
            .get(&normalize_module_path(None, name))
            .cloned()
            .ok_or_else(|| module_not_found(name))
    }
}

/// Normalizes an import path. `./` and `../` resolve against the importing
/// module's directory; every other path is taken from the root. A leading `/`
/// and the `.rhai` extension are dropped.
pub fn normalize_module_path(importer: Option<&str>, path: &str) -> String {
    let path = path.trim().replace('\\', "/");
    let path = path.strip_suffix(MODULE_EXTENSION).unwrap_or(&path);
    let mut stack: Vec<&str> = Vec::new();

    if path.starts_with("./") || path.starts_with("../") {
        if let Some(importer) = importer {
            let importer = importer.strip_suffix(MODULE_EXTENSION).unwrap_or(importer);
            let mut parent = importer.split('/').collect::<Vec<_>>();
            parent.pop();
            stack.extend(parent.into_iter().filter(|part| !part.is_empty()));
        }
    }

    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            part => stack.push(part),
        }
    }
    stack.join("/")
}

/// Per-context import state: registered sources, an optional fallback
/// resolver, and the cache of compiled modules.
pub struct ModuleHub {
    targets: RwLock<BTreeMap<String, String>>,
    external: Option<Arc<dyn ModuleResolver>>,
    cache: Mutex<HashMap<String, SharedModule>>,
    loading: Mutex<Vec<String>>,
}

impl ModuleHub {
    pub fn new(external: Option<Arc<dyn ModuleResolver>>) -> Self {
        Self {
            targets: RwLock::new(BTreeMap::new()),
            external,
            cache: Mutex::new(HashMap::new()),
            loading: Mutex::new(Vec::new()),
        }
    }

    /// Registers module sources. Nothing is registered if any normalized path
    /// collides with an existing or sibling entry.
    pub fn register(&self, targets: Vec<(String, String)>) -> Result<usize, HostError> {
        let mut registered = self.targets.write();
        let mut batch: BTreeMap<String, String> = BTreeMap::new();
        for (name, source) in targets {
            let path = normalize_module_path(None, &name);
            if path.is_empty() {
                return Err(HostError::state(
                    "MODULE_PATH_INVALID",
                    format!("Module name \"{}\" normalizes to an empty path.", name),
                ));
            }
            if registered.contains_key(&path) || batch.contains_key(&path) {
                return Err(HostError::state(
                    "MODULE_PATH_COLLISION",
                    format!("Two module sources normalize to the same path \"{}\".", path),
                ));
            }
            batch.insert(path, source);
        }
        let added = batch.len();
        registered.extend(batch);
        Ok(added)
    }

    pub fn registered(&self) -> Vec<String> {
        self.targets.read().keys().cloned().collect()
    }

    pub fn cached(&self) -> Vec<String> {
        let mut names = self.cache.lock().keys().cloned().collect::<Vec<_>>();
        names.sort();
        names
    }

    fn source_for(&self, path: &str) -> Result<String, HostError> {
        if let Some(source) = self.targets.read().get(path) {
            return Ok(source.clone());
        }
        match &self.external {
            Some(external) => external.resolve(path),
            None => Err(module_not_found(path)),
        }
    }

    fn load(
        &self,
        engine: &Engine,
        path: &str,
        position: Position,
    ) -> Result<SharedModule, Box<EvalAltResult>> {
        if let Some(module) = self.cache.lock().get(path) {
            trace!(module = path, "module cache hit");
            return Ok(module.clone());
        }

        {
            let mut loading = self.loading.lock();
            if loading.iter().any(|entry| entry == path) {
                loading.push(path.to_string());
                let cycle = loading.join(" -> ");
                loading.pop();
                return Err(Box::new(EvalAltResult::ErrorRuntime(
                    Dynamic::from(format!("MODULE_IMPORT_CYCLE: Import cycle detected: {}", cycle)),
                    position,
                )));
            }
            loading.push(path.to_string());
        }

        let compiled = self.compile(engine, path, position);
        self.loading.lock().retain(|entry| entry != path);

        let module = compiled?;
        debug!(module = path, "module compiled");
        self.cache.lock().insert(path.to_string(), module.clone());
        Ok(module)
    }

    fn compile(
        &self,
        engine: &Engine,
        path: &str,
        position: Position,
    ) -> Result<SharedModule, Box<EvalAltResult>> {
        let source = self.source_for(path).map_err(|error| {
            trace!(module = path, code = %error.code, "module source unavailable");
            Box::new(EvalAltResult::ErrorModuleNotFound(path.to_string(), position))
        })?;
        let mut ast = engine.compile(&source).map_err(|error| {
            Box::new(EvalAltResult::ErrorInModule(
                path.to_string(),
                error.into(),
                position,
            ))
        })?;
        ast.set_source(path);
        let module = Module::eval_ast_as_new(Scope::new(), &ast, engine).map_err(|error| {
            Box::new(EvalAltResult::ErrorInModule(path.to_string(), error, position))
        })?;
        Ok(module.into())
    }
}

impl fmt::Debug for ModuleHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHub")
            .field("registered", &self.registered())
            .field("cached", &self.cached())
            .field("external", &self.external.is_some())
            .finish()
    }
}

/// Adapter installed as the engine's module resolver while a context owns it.
pub(crate) struct HubResolver {
    hub: Arc<ModuleHub>,
}

impl HubResolver {
    pub(crate) fn new(hub: Arc<ModuleHub>) -> Self {
        Self { hub }
    }
}

impl rhai::ModuleResolver for HubResolver {
    fn resolve(
        &self,
        engine: &Engine,
        source: Option<&str>,
        path: &str,
        pos: Position,
    ) -> Result<SharedModule, Box<EvalAltResult>> {
        let normalized = normalize_module_path(source, path);
        self.hub.load(engine, &normalized, pos)
    }
}

fn module_not_found(name: &str) -> HostError {
    HostError::state(
        "MODULE_NOT_FOUND",
        format!("Module \"{}\" is not registered.", name),
    )
}
