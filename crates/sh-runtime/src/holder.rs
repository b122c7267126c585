use std::sync::OnceLock;

use parking_lot::{Mutex, MutexGuard};
use sh_core::{HostError, LockingMode};
use tracing::{trace, warn};

use crate::engine::ScriptEngine;

static DEFAULT_LOCKING: OnceLock<LockingMode> = OnceLock::new();

/// Sets the process-wide locking default read by holders built afterwards.
/// Can be called at most once.
pub fn configure_default_locking(enabled: bool) -> Result<(), HostError> {
    let mode = LockingMode::from_enabled(enabled);
    DEFAULT_LOCKING.set(mode).map_err(|_| {
        HostError::state(
            "ENGINE_LOCKING_CONFIGURED",
            "Default engine locking has already been configured.",
        )
    })
}

pub fn default_locking() -> LockingMode {
    DEFAULT_LOCKING.get().copied().unwrap_or(LockingMode::Enabled)
}

/// Guards an engine against concurrent use.
///
/// With locking enabled, acquisition never waits: if another thread holds the
/// engine the caller gets `ENGINE_CONCURRENT_ACCESS` straight away. With
/// locking disabled, acquisition waits its turn and contention goes unreported.
#[derive(Debug)]
pub struct EngineHolder {
    engine: Mutex<ScriptEngine>,
    locking: LockingMode,
}

impl EngineHolder {
    pub fn new(engine: ScriptEngine, locking: LockingMode) -> Self {
        Self {
            engine: Mutex::new(engine),
            locking,
        }
    }

    pub fn with_default_locking(engine: ScriptEngine) -> Self {
        Self::new(engine, default_locking())
    }

    pub fn locking(&self) -> LockingMode {
        self.locking
    }

    pub fn locking_enabled(&self) -> bool {
        self.locking.is_enabled()
    }

    pub fn is_locked(&self) -> bool {
        self.engine.is_locked()
    }

    /// Runs `operation` with exclusive engine access. The engine is released
    /// when `operation` returns, fails or panics.
    pub fn with_engine<T>(
        &self,
        operation: impl FnOnce(&mut ScriptEngine) -> Result<T, HostError>,
    ) -> Result<T, HostError> {
        let mut guard = self.acquire()?;
        operation(&mut guard)
    }

    pub fn open(&self) -> Result<EngineLease<'_>, HostError> {
        let guard = self.acquire()?;
        trace!("engine lease opened");
        Ok(EngineLease { guard: Some(guard) })
    }

    pub fn try_open(&self) -> Option<EngineLease<'_>> {
        self.open().ok()
    }

    pub fn get_mut(&mut self) -> &mut ScriptEngine {
        self.engine.get_mut()
    }

    pub fn into_engine(self) -> ScriptEngine {
        self.engine.into_inner()
    }

    fn acquire(&self) -> Result<MutexGuard<'_, ScriptEngine>, HostError> {
        match self.locking {
            LockingMode::Enabled => self.engine.try_lock().ok_or_else(|| {
                warn!("engine contention detected");
                HostError::concurrency(
                    "ENGINE_CONCURRENT_ACCESS",
                    "Concurrent access to the script engine is not allowed.",
                )
            }),
            LockingMode::Disabled => Ok(self.engine.lock()),
        }
    }
}

/// Explicitly released engine access obtained from [`EngineHolder::open`].
/// Dropping an unreleased lease releases it.
#[derive(Debug)]
pub struct EngineLease<'a> {
    guard: Option<MutexGuard<'a, ScriptEngine>>,
}

impl EngineLease<'_> {
    pub fn engine(&mut self) -> Result<&mut ScriptEngine, HostError> {
        self.guard
            .as_deref_mut()
            .ok_or_else(lease_released_error)
    }

    pub fn release(&mut self) -> Result<(), HostError> {
        match self.guard.take() {
            Some(guard) => {
                drop(guard);
                trace!("engine lease released");
                Ok(())
            }
            None => Err(lease_released_error()),
        }
    }

    pub fn is_released(&self) -> bool {
        self.guard.is_none()
    }
}

fn lease_released_error() -> HostError {
    HostError::state(
        "ENGINE_LEASE_RELEASED",
        "Engine lease was already released.",
    )
}
