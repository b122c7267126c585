use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sh_core::HostError;
use sh_dispatch::Dispatcher;
use sh_runtime::{normalize_module_path, EngineContext, ModuleResolver};
use thiserror::Error;
use tracing::debug;
use walkdir::WalkDir;

pub use sh_core::{
    DispatcherOptions, EngineLimits, ErrorKind, HostConfig, LockingMode, OpaqueHandle, Value,
};
pub use sh_dispatch::{TaskHandle, TaskStatus};
pub use sh_runtime::{configure_default_locking, MapModuleResolver};

const MODULE_EXTENSION: &str = ".rhai";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Failed to read module source {path}: {source}")]
    ReadSource {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to scan module directory {path}: {source}")]
    ScanSource {
        path: PathBuf,
        source: walkdir::Error,
    },
    #[error("No .rhai files under {path}.")]
    SourceEmpty { path: PathBuf },
    #[error("Host error: {0}")]
    Host(#[from] HostError),
}

#[derive(Clone, Default)]
pub struct CreateHostOptions {
    pub config: HostConfig,
    /// Registered with the context before the dispatcher starts.
    pub module_sources: Vec<(String, String)>,
    pub external_resolver: Option<Arc<dyn ModuleResolver>>,
}

/// A context and the dispatcher serving it.
pub struct ScriptHost {
    context: Arc<EngineContext>,
    dispatcher: Dispatcher,
}

impl ScriptHost {
    pub fn context(&self) -> &Arc<EngineContext> {
        &self.context
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Drains the queue and stops the worker. The context stays usable.
    pub fn shutdown(self) -> Result<Arc<EngineContext>, ApiError> {
        self.dispatcher.shutdown()?;
        Ok(self.context)
    }
}

pub fn create_context(options: &CreateHostOptions) -> Result<EngineContext, ApiError> {
    let context = EngineContext::from_config(&options.config, options.external_resolver.clone());
    if !options.module_sources.is_empty() {
        context.load_modules(options.module_sources.clone())?;
    }
    Ok(context)
}

pub fn create_host(options: CreateHostOptions) -> Result<ScriptHost, ApiError> {
    let context = Arc::new(create_context(&options)?);
    let dispatcher = Dispatcher::spawn(Arc::clone(&context), options.config.dispatcher.clone())?;
    debug!(
        context = context.id(),
        modules = options.module_sources.len(),
        "script host created"
    );
    Ok(ScriptHost {
        context,
        dispatcher,
    })
}

pub fn create_host_from_json(
    raw_config: &str,
    external_resolver: Option<Arc<dyn ModuleResolver>>,
) -> Result<ScriptHost, ApiError> {
    create_host(CreateHostOptions {
        config: HostConfig::from_json_str(raw_config)?,
        module_sources: Vec::new(),
        external_resolver,
    })
}

/// Host whose modules are every `.rhai` file under `module_dir`.
pub fn create_host_from_dir(config: HostConfig, module_dir: &Path) -> Result<ScriptHost, ApiError> {
    create_host(CreateHostOptions {
        config,
        module_sources: collect_module_sources(module_dir)?,
        external_resolver: None,
    })
}

/// Collects every `.rhai` file under `dir` as `(relative path, source)`,
/// ordered by path. Symlinks are not followed.
pub fn collect_module_sources(dir: &Path) -> Result<Vec<(String, String)>, ApiError> {
    let mut sources = BTreeMap::new();

    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|source| ApiError::ScanSource {
            path: dir.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if !path.to_string_lossy().ends_with(MODULE_EXTENSION) {
            continue;
        }
        let Ok(relative) = path.strip_prefix(dir) else {
            continue;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");

        let content = fs::read_to_string(path).map_err(|source| ApiError::ReadSource {
            path: path.to_path_buf(),
            source,
        })?;
        sources.insert(relative, content);
    }

    if sources.is_empty() {
        return Err(ApiError::SourceEmpty {
            path: dir.to_path_buf(),
        });
    }

    Ok(sources.into_iter().collect())
}

/// Reads `<root>/<module>.rhai` on demand.
#[derive(Debug, Clone)]
pub struct DirModuleResolver {
    root: PathBuf,
}

impl DirModuleResolver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ModuleResolver for DirModuleResolver {
    fn resolve(&self, name: &str) -> Result<String, HostError> {
        let normalized = normalize_module_path(None, name);
        let path = self
            .root
            .join(format!("{}{}", normalized, MODULE_EXTENSION));
        if normalized.is_empty() || !path.is_file() {
            return Err(HostError::state(
                "MODULE_NOT_FOUND",
                format!("Module \"{}\" not found under {}.", name, self.root.display()),
            ));
        }
        fs::read_to_string(&path).map_err(|error| {
            HostError::state(
                "MODULE_SOURCE_READ",
                format!("Failed to read module {}: {}", path.display(), error),
            )
        })
    }
}
