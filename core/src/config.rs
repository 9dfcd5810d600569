//! Layered configuration for the lock engine and service.
//!
//! Precedence, later wins:
//! 1. Built-in defaults
//! 2. `config.toml` in the Flow home (`$FLOW_HOME`, else `~/.config/flow`)
//! 3. Environment overrides (`FLOW_SOCKET_PATH`, `FLOW_STATE_FILE`,
//!    `FLOW_DEBOUNCE_MS`)
//!
//! ```toml
//! [engine]
//! debounce_ms = 500
//! initial_retry_delay_ms = 100
//! max_retry_delay_ms = 1000
//! retry_factor = 1.5
//!
//! [service]
//! socket_path = "/run/user/1000/flow-lock.sock"
//! host_call_timeout_ms = 5000
//! ```

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const CONFIG_FILENAME: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error loading config: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for ${var}: '{value}' (expected: {expected})")]
    InvalidEnvValue {
        var: String,
        value: String,
        expected: String,
    },

    #[error("config validation error: {0}")]
    Invalid(String),

    #[error("cannot determine config directory")]
    NoConfigDir,
}

/// Enforcement timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Activation events inside this window of a running switch-back are
    /// dropped.
    pub debounce_ms: u64,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_factor: f64,
    /// Pause between refocusing the window and re-activating the tab when a
    /// switch-back fails for a reason other than dragging.
    pub fallback_delay_ms: u64,
    pub unlock_toast_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            initial_retry_delay_ms: 100,
            max_retry_delay_ms: 1000,
            retry_factor: 1.5,
            fallback_delay_ms: 50,
            unlock_toast_delay_ms: 500,
        }
    }
}

impl EngineConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn initial_retry_delay(&self) -> Duration {
        Duration::from_millis(self.initial_retry_delay_ms)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_millis(self.max_retry_delay_ms)
    }

    pub fn fallback_delay(&self) -> Duration {
        Duration::from_millis(self.fallback_delay_ms)
    }

    pub fn unlock_toast_delay(&self) -> Duration {
        Duration::from_millis(self.unlock_toast_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Unix socket the browser host connects to. `None` picks the runtime
    /// directory default.
    pub socket_path: Option<PathBuf>,
    /// JSON state file. `None` picks the data directory default.
    pub state_file: Option<PathBuf>,
    pub host_call_timeout_ms: u64,
    /// Exit after this long with no host connected and no lock held.
    /// Zero disables the idle exit.
    pub idle_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            state_file: None,
            host_call_timeout_ms: 5000,
            idle_timeout_secs: 0,
        }
    }
}

impl ServiceConfig {
    pub fn host_call_timeout(&self) -> Duration {
        Duration::from_millis(self.host_call_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    pub engine: EngineConfig,
    pub service: ServiceConfig,
}

impl FlowConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let engine = &self.engine;
        if engine.initial_retry_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "engine.initial_retry_delay_ms must be positive".to_string(),
            ));
        }
        if engine.initial_retry_delay_ms > engine.max_retry_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "engine.initial_retry_delay_ms ({}) exceeds engine.max_retry_delay_ms ({})",
                engine.initial_retry_delay_ms, engine.max_retry_delay_ms
            )));
        }
        if !(engine.retry_factor >= 1.0 && engine.retry_factor.is_finite()) {
            return Err(ConfigError::Invalid(format!(
                "engine.retry_factor must be a finite number >= 1.0, got {}",
                engine.retry_factor
            )));
        }
        if self.service.host_call_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "service.host_call_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for layered configuration loading.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    flow_home: Option<PathBuf>,
    env_prefix: String,
    skip_file: bool,
    skip_env: bool,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            flow_home: None,
            env_prefix: "FLOW".to_string(),
            skip_file: false,
            skip_env: false,
        }
    }

    pub fn with_flow_home(mut self, path: PathBuf) -> Self {
        self.flow_home = Some(path);
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn skip_file_layer(mut self) -> Self {
        self.skip_file = true;
        self
    }

    pub fn skip_env_layer(mut self) -> Self {
        self.skip_env = true;
        self
    }

    pub fn load(self) -> Result<FlowConfig, ConfigError> {
        let mut config = if self.skip_file {
            FlowConfig::default()
        } else {
            let home = self.resolve_flow_home()?;
            Self::load_from_file(&home)?
        };

        if !self.skip_env {
            Self::apply_env_overrides(&mut config, &self.env_prefix)?;
        }

        config.validate()?;
        Ok(config)
    }

    fn resolve_flow_home(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.flow_home {
            return Ok(path.clone());
        }
        if let Ok(path) = env::var("FLOW_HOME")
            && !path.trim().is_empty()
        {
            return Ok(PathBuf::from(path));
        }
        dirs::config_dir()
            .map(|dir| dir.join("flow"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Read `config.toml` under `flow_home`. A missing file yields defaults.
    pub fn load_from_file(flow_home: &Path) -> Result<FlowConfig, ConfigError> {
        let path = flow_home.join(CONFIG_FILENAME);
        let contents = match std::fs::read_to_string(&path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config.toml not found, using defaults");
                return Ok(FlowConfig::default());
            }
            Err(e) => return Err(e.into()),
        };
        Ok(toml::from_str(&contents)?)
    }

    pub fn apply_env_overrides(config: &mut FlowConfig, prefix: &str) -> Result<(), ConfigError> {
        let socket_var = format!("{prefix}_SOCKET_PATH");
        if let Ok(value) = env::var(&socket_var)
            && !value.trim().is_empty()
        {
            tracing::debug!("Applying env override: {socket_var}={value}");
            config.service.socket_path = Some(PathBuf::from(value));
        }

        let state_var = format!("{prefix}_STATE_FILE");
        if let Ok(value) = env::var(&state_var)
            && !value.trim().is_empty()
        {
            tracing::debug!("Applying env override: {state_var}={value}");
            config.service.state_file = Some(PathBuf::from(value));
        }

        let debounce_var = format!("{prefix}_DEBOUNCE_MS");
        if let Ok(value) = env::var(&debounce_var) {
            match value.trim().parse::<u64>() {
                Ok(ms) => {
                    tracing::debug!("Applying env override: {debounce_var}={ms}");
                    config.engine.debounce_ms = ms;
                }
                Err(_) => {
                    return Err(ConfigError::InvalidEnvValue {
                        var: debounce_var,
                        value,
                        expected: "a whole number of milliseconds".to_string(),
                    });
                }
            }
        }

        Ok(())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        let config = ConfigLoader::new()
            .skip_file_layer()
            .skip_env_layer()
            .load()
            .unwrap();
        assert_eq!(config, FlowConfig::default());
        assert_eq!(config.engine.debounce(), Duration::from_millis(500));
    }

    #[test]
    fn file_layer_overrides_defaults_and_keeps_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            r#"
                [engine]
                debounce_ms = 250

                [service]
                socket_path = "/tmp/flow-test.sock"
            "#,
        )
        .unwrap();

        let config = ConfigLoader::new()
            .with_flow_home(dir.path().to_path_buf())
            .skip_env_layer()
            .load()
            .unwrap();
        assert_eq!(config.engine.debounce_ms, 250);
        assert_eq!(config.engine.max_retry_delay_ms, 1000);
        assert_eq!(
            config.service.socket_path,
            Some(PathBuf::from("/tmp/flow-test.sock"))
        );
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::load_from_file(dir.path()).unwrap();
        assert_eq!(config, FlowConfig::default());
    }

    #[test]
    fn invalid_retry_settings_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILENAME),
            "[engine]\ninitial_retry_delay_ms = 2000\nmax_retry_delay_ms = 1000\n",
        )
        .unwrap();
        let err = ConfigLoader::new()
            .with_flow_home(dir.path().to_path_buf())
            .skip_env_layer()
            .load()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn env_overrides_apply() {
        unsafe {
            std::env::set_var("FLOWTEST_OK_SOCKET_PATH", "/tmp/override.sock");
            std::env::set_var("FLOWTEST_OK_DEBOUNCE_MS", " 750 ");
        }

        let mut config = FlowConfig::default();
        ConfigLoader::apply_env_overrides(&mut config, "FLOWTEST_OK").unwrap();
        assert_eq!(
            config.service.socket_path,
            Some(PathBuf::from("/tmp/override.sock"))
        );
        assert_eq!(config.engine.debounce_ms, 750);

        unsafe {
            std::env::remove_var("FLOWTEST_OK_SOCKET_PATH");
            std::env::remove_var("FLOWTEST_OK_DEBOUNCE_MS");
        }
    }

    #[test]
    fn invalid_env_value_is_reported() {
        unsafe {
            std::env::set_var("FLOWTEST_BAD_DEBOUNCE_MS", "soon");
        }

        let mut config = FlowConfig::default();
        let err = ConfigLoader::apply_env_overrides(&mut config, "FLOWTEST_BAD").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvValue { .. }));

        unsafe {
            std::env::remove_var("FLOWTEST_BAD_DEBOUNCE_MS");
        }
    }
}
