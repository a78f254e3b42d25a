//! Settings management.
//!
//! Settings are loaded from multiple sources with the following priority:
//!
//! 1. Environment variables (`AVPVM_*`, `__` separates nested keys)
//! 2. Settings file (`~/.config/avpvm/config.toml` unless a path is given)
//! 3. Default values
//!
//! ## Example Settings File
//!
//! ```toml
//! [vm]
//! rom_path = "/path/to/AVPBooter.vresearch1.bin"
//! aux_path = "/path/to/aux.img"
//! platform_version = 2
//! cpu_count = 4
//! memory_size = 8589934592
//!
//! [vm.start]
//! stop_in_iboot_stage1 = true
//!
//! [logging]
//! level = "debug"
//! ```
//!
//! `AVPVM_VM__CPU_COUNT=8` overrides `vm.cpu_count`.

use std::path::{Path, PathBuf};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::config::VmParameters;
use crate::error::Result;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "AVPVM_";

/// Top-level settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Virtual machine parameters.
    pub vm: VmParameters,
    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl Settings {
    /// Loads settings from the user settings file and the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a source exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(user_settings_path())
    }

    /// Loads settings from a specific file and the environment.
    ///
    /// A missing file is treated as empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be parsed or a value has the
    /// wrong type.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!(path = %path.display(), "loading settings");
        let settings = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(settings)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Default settings file location.
#[must_use]
pub fn user_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("~/.config"))
        .join("avpvm")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load_from(dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.vm, VmParameters::default());
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[vm]
platform_version = 1
cpu_count = 6
aux_path = "/vm/aux.img"
debug = true
debug_port = 1234

[vm.start]
boot_recovery = true

[logging]
level = "trace"
"#
        )
        .unwrap();

        let settings = Settings::load_from(file.path()).unwrap();
        assert_eq!(settings.vm.platform_version, 1);
        assert_eq!(settings.vm.cpu_count, 6);
        assert_eq!(settings.vm.aux_path, Some(PathBuf::from("/vm/aux.img")));
        assert_eq!(settings.vm.debug_port, Some(1234));
        assert!(settings.vm.start.boot_recovery);
        assert!(settings.vm.production_mode);
        assert_eq!(settings.logging.level, "trace");
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[vm]\ncpu_count = \"many\"").unwrap();
        assert!(Settings::load_from(file.path()).is_err());
    }

    #[test]
    fn test_user_settings_path() {
        assert!(user_settings_path().ends_with("avpvm/config.toml"));
    }
}
