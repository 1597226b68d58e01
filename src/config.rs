/*
 * Copyright (C) 2026 Mark Wells Dev
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::lsp::binding::{Language, LanguageBinding};

/// Engine configuration. Owned by the caller; the engine never persists it.
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Root workspace path (default: current directory)
    #[serde(default)]
    pub workspace: Option<PathBuf>,

    /// Seconds to wait for the `initialize` response (default: 10)
    #[serde(default = "default_init_timeout")]
    pub init_timeout_secs: u64,

    /// Seconds between liveness checks while connected (default: 30)
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// Milliseconds to wait for the `shutdown` response (default: 2000)
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,

    /// Milliseconds to wait for exit before killing (default: 1000)
    #[serde(default = "default_exit_grace")]
    pub exit_grace_ms: u64,

    /// Server definitions keyed by language ID ("cpp", "java")
    #[serde(default)]
    pub server: HashMap<String, ServerConfig>,
}

/// Per-language server settings.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerConfig {
    /// Executable for native servers, install directory for JVM-hosted ones
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Arguments appended after the built-in defaults
    #[serde(default)]
    pub args: Vec<String>,

    /// Initialization options merged over the defaults
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,

    /// Directory containing `compile_commands.json`
    #[serde(default)]
    pub compile_commands_dir: Option<PathBuf>,

    /// Fallback include directories
    #[serde(default)]
    pub include_paths: Vec<PathBuf>,

    /// Language standard, e.g. "c++20"
    #[serde(default)]
    pub language_standard: Option<String>,

    /// Extra fallback compiler flags, e.g. "-DQT_CORE_LIB"
    #[serde(default)]
    pub extra_flags: Vec<String>,

    /// Maximum results per request
    #[serde(default)]
    pub result_limit: Option<u32>,

    /// Enable background indexing
    #[serde(default)]
    pub background_index: Option<bool>,

    /// JDK home for JVM-hosted servers
    #[serde(default)]
    pub java_home: Option<PathBuf>,

    /// Java language level
    #[serde(default)]
    pub java_version: Option<String>,

    /// Extra classpath entries
    #[serde(default)]
    pub class_path: Vec<String>,

    /// JVM maximum heap, e.g. "2G"
    #[serde(default)]
    pub max_heap: Option<String>,

    /// Private server data directory
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// Deadlines used by every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Handshake deadline.
    pub init: Duration,
    /// Liveness check period while connected.
    pub keep_alive: Duration,
    /// Wait for the `shutdown` response.
    pub shutdown_grace: Duration,
    /// Wait for the process to exit before killing it.
    pub exit_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            init: Duration::from_secs(default_init_timeout()),
            keep_alive: Duration::from_secs(default_keep_alive()),
            shutdown_grace: Duration::from_millis(default_shutdown_grace()),
            exit_grace: Duration::from_millis(default_exit_grace()),
        }
    }
}

const fn default_init_timeout() -> u64 {
    10
}

const fn default_keep_alive() -> u64 {
    30
}

const fn default_shutdown_grace() -> u64 {
    2000
}

const fn default_exit_grace() -> u64 {
    1000
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace: None,
            init_timeout_secs: default_init_timeout(),
            keep_alive_secs: default_keep_alive(),
            shutdown_grace_ms: default_shutdown_grace(),
            exit_grace_ms: default_exit_grace(),
            server: HashMap::new(),
        }
    }
}

impl Config {
    /// Load configuration from standard paths or a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be read or the merged values do
    /// not match the expected shape.
    pub fn load(explicit_file: Option<PathBuf>) -> Result<Self> {
        let mut builder = config::Config::builder();

        // 1. Start with defaults
        builder = builder
            .set_default("init_timeout_secs", default_init_timeout())?
            .set_default("keep_alive_secs", default_keep_alive())?
            .set_default("shutdown_grace_ms", default_shutdown_grace())?
            .set_default("exit_grace_ms", default_exit_grace())?;

        // 2. Load from user config directory (~/.config/grove/config.toml)
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join("grove").join("config.toml");
            if config_path.exists() {
                builder = builder.add_source(config::File::from(config_path));
            }
        }

        // 3. Load from explicit file if provided
        if let Some(path) = explicit_file {
            builder = builder.add_source(config::File::from(path));
        }

        // 4. Load from environment variables (GROVE_INIT_TIMEOUT_SECS, GROVE_SERVER__CPP__PATH)
        builder = builder.add_source(
            config::Environment::with_prefix("GROVE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .context("Failed to build configuration")?;

        config.try_deserialize().context("Failed to deserialize configuration")
    }

    /// Settings for `language`, or defaults when none are configured.
    #[must_use]
    pub fn server_config(&self, language: Language) -> ServerConfig {
        self.server.get(language.id()).cloned().unwrap_or_default()
    }

    /// Binding for `language` built from its settings.
    #[must_use]
    pub fn binding(&self, language: Language) -> LanguageBinding {
        LanguageBinding::from_config(language, &self.server_config(language))
    }

    /// Connection deadlines.
    #[must_use]
    pub const fn timeouts(&self) -> Timeouts {
        Timeouts {
            init: Duration::from_secs(self.init_timeout_secs),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            exit_grace: Duration::from_millis(self.exit_grace_ms),
        }
    }

    /// Workspace root, falling back to the current directory.
    #[must_use]
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace
            .clone()
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lsp::binding::Launch;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.timeouts(), Timeouts::default());
        assert_eq!(config.timeouts().init, Duration::from_secs(10));
        assert_eq!(config.timeouts().keep_alive, Duration::from_secs(30));
        assert!(config.server_config(Language::Cpp).path.is_none());
    }

    #[test]
    fn test_load_explicit_file() -> Result<()> {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        write!(
            file,
            r#"
workspace = "/ws"
init_timeout_secs = 3

[server.cpp]
path = "/opt/llvm/bin/clangd"
args = ["--clang-tidy"]
extra_flags = ["-DQT_CORE_LIB"]
result_limit = 50

[server.cpp.initialization_options.clangd]
index = "background"

[server.java]
path = "/opt/jdtls"
max_heap = "2G"
"#
        )?;

        let config = Config::load(Some(file.path().to_path_buf()))?;
        assert_eq!(config.workspace, Some(PathBuf::from("/ws")));
        assert_eq!(config.timeouts().init, Duration::from_secs(3));
        assert_eq!(config.keep_alive_secs, 30);

        let cpp = config.server_config(Language::Cpp);
        assert_eq!(cpp.args, vec!["--clang-tidy"]);
        assert_eq!(
            cpp.initialization_options
                .as_ref()
                .and_then(|o| o.pointer("/clangd/index"))
                .and_then(serde_json::Value::as_str),
            Some("background")
        );

        let binding = config.binding(Language::Cpp);
        assert_eq!(binding.server_path(), Some(std::path::Path::new("/opt/llvm/bin/clangd")));
        assert!(matches!(
            binding.launch(),
            Launch::Native(opts) if opts.result_limit == 50 && opts.extra_flags == ["-DQT_CORE_LIB"]
        ));

        let java = config.binding(Language::Java);
        assert!(matches!(java.launch(), Launch::Jvm(opts) if opts.max_heap == "2G"));
        Ok(())
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        assert!(Config::load(Some(PathBuf::from("/definitely/not/here.toml"))).is_err());
    }
}
