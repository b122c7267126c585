use serde::{Deserialize, Serialize};

use crate::error::HostError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LockingMode {
    /// Non-blocking acquisition; contention is reported as an error.
    Enabled,
    /// Blocking acquisition; contention is never reported.
    Disabled,
}

impl LockingMode {
    pub fn from_enabled(enabled: bool) -> Self {
        if enabled {
            Self::Enabled
        } else {
            Self::Disabled
        }
    }

    pub fn is_enabled(self) -> bool {
        self == Self::Enabled
    }
}

/// Interpreter resource limits. `None` keeps the engine default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineLimits {
    pub max_operations: Option<u64>,
    pub max_call_levels: Option<usize>,
    pub max_expr_depth: Option<usize>,
    pub max_function_expr_depth: Option<usize>,
    pub max_string_size: Option<usize>,
    pub max_array_size: Option<usize>,
    pub max_map_size: Option<usize>,
    pub strict_variables: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatcherOptions {
    pub thread_name: Option<String>,
    pub stack_size: Option<usize>,
}

impl DispatcherOptions {
    pub const DEFAULT_THREAD_NAME: &'static str = "script-dispatcher";

    pub fn thread_name(&self) -> &str {
        self.thread_name
            .as_deref()
            .unwrap_or(Self::DEFAULT_THREAD_NAME)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HostConfig {
    pub name: Option<String>,
    /// Overrides the process-wide default for the holder built from this config.
    pub locking: Option<LockingMode>,
    pub limits: EngineLimits,
    pub dispatcher: DispatcherOptions,
}

impl HostConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, HostError> {
        serde_json::from_str(raw).map_err(|error| {
            HostError::state(
                "CONFIG_INVALID",
                format!("Host config JSON is invalid: {}", error),
            )
        })
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn empty_json_yields_defaults() {
        let config = HostConfig::from_json_str("{}").expect("config");
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.dispatcher.thread_name(), "script-dispatcher");
    }

    #[test]
    fn camel_case_fields_are_read() {
        let config = HostConfig::from_json_str(
            r#"{
                "name": "reports",
                "locking": "disabled",
                "limits": { "maxOperations": 5000, "strictVariables": true },
                "dispatcher": { "threadName": "reports-worker", "stackSize": 4194304 }
            }"#,
        )
        .expect("config");

        assert_eq!(config.name.as_deref(), Some("reports"));
        assert_eq!(config.locking, Some(LockingMode::Disabled));
        assert_eq!(config.limits.max_operations, Some(5000));
        assert!(config.limits.strict_variables);
        assert_eq!(config.limits.max_call_levels, None);
        assert_eq!(config.dispatcher.thread_name(), "reports-worker");
        assert_eq!(config.dispatcher.stack_size, Some(4 * 1024 * 1024));
    }

    #[test]
    fn malformed_json_is_state_error() {
        let error = HostConfig::from_json_str("{ \"limits\": 3 }").expect_err("bad config");
        assert_eq!(error.code, "CONFIG_INVALID");
        assert_eq!(error.kind, ErrorKind::State);
    }

    #[test]
    fn locking_mode_round_trips_bool() {
        assert!(LockingMode::from_enabled(true).is_enabled());
        assert!(!LockingMode::from_enabled(false).is_enabled());
    }
}
