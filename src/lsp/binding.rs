// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! Per-language launch and initialization specifics.
//!
//! A [`LanguageBinding`] is plain data: which language it serves, how to find
//! and launch the server, and which initialization options to send. The
//! connection state machine never branches on the language itself.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};
use url::Url;

use crate::config::ServerConfig;
use crate::error::ClientError;

/// Languages with a built-in binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// C and C++, served by clangd.
    Cpp,
    /// Java, served by Eclipse JDT LS.
    Java,
}

impl Language {
    /// Every supported language.
    pub const ALL: [Self; 2] = [Self::Cpp, Self::Java];

    /// LSP language identifier sent in `didOpen`.
    #[must_use]
    pub const fn id(self) -> &'static str {
        match self {
            Self::Cpp => "cpp",
            Self::Java => "java",
        }
    }

    /// Human-readable server name.
    #[must_use]
    pub const fn server_name(self) -> &'static str {
        match self {
            Self::Cpp => "clangd",
            Self::Java => "Eclipse JDT Language Server",
        }
    }

    /// File extensions routed to this language.
    #[must_use]
    pub const fn extensions(self) -> &'static [&'static str] {
        match self {
            Self::Cpp => &["cpp", "cc", "cxx", "h", "hpp", "hh"],
            Self::Java => &["java"],
        }
    }

    /// Looks up the language for a bare extension, ignoring case.
    #[must_use]
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|lang| lang.extensions().contains(&ext.as_str()))
    }

    /// Infers the language of a file from its extension.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::UnsupportedExtension`] when the extension is
    /// missing or not in the table.
    pub fn from_path(path: &Path) -> Result<Self, ClientError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        Self::from_extension(ext).ok_or_else(|| {
            ClientError::UnsupportedExtension(if ext.is_empty() {
                path.display().to_string()
            } else {
                format!(".{ext}")
            })
        })
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpp" | "c++" | "c" => Ok(Self::Cpp),
            "java" => Ok(Self::Java),
            other => Err(format!("unsupported language: {other}")),
        }
    }
}

/// Knobs for a server that is launched as a native executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeOptions {
    /// Directory holding `compile_commands.json`.
    pub compile_commands_dir: Option<PathBuf>,
    /// Include directories for files without a compile command. Empty means
    /// the workspace root and its `include/` directory.
    pub include_paths: Vec<PathBuf>,
    /// Value of `-std=`.
    pub language_standard: String,
    /// Flags appended to the fallback flags.
    pub extra_flags: Vec<String>,
    /// Cap on results per request.
    pub result_limit: u32,
    /// Whether the server indexes the project in the background.
    pub background_index: bool,
}

impl Default for NativeOptions {
    fn default() -> Self {
        Self {
            compile_commands_dir: None,
            include_paths: Vec::new(),
            language_standard: "c++17".to_string(),
            extra_flags: Vec::new(),
            result_limit: 100,
            background_index: true,
        }
    }
}

/// Knobs for a server hosted by a JVM through an OSGi launcher jar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JvmOptions {
    /// JDK used to run the server and reported to it.
    pub java_home: Option<PathBuf>,
    /// Java language level reported to the server.
    pub java_version: String,
    /// Extra classpath entries reported to the server.
    pub class_path: Vec<String>,
    /// Value of `-Xmx`.
    pub max_heap: String,
    /// Private server data directory. Defaults to
    /// `<workspace>/.jdtls-workspace`.
    pub data_dir: Option<PathBuf>,
}

impl Default for JvmOptions {
    fn default() -> Self {
        Self {
            java_home: None,
            java_version: "11".to_string(),
            class_path: Vec::new(),
            max_heap: "1G".to_string(),
            data_dir: None,
        }
    }
}

/// How a binding turns a server location into a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Launch {
    /// The server path is the executable.
    Native(NativeOptions),
    /// The server path is an install directory; the program is `java`.
    Jvm(JvmOptions),
}

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    /// Program to execute.
    pub program: PathBuf,
    /// Arguments, binding defaults first.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub env: Vec<(String, String)>,
}

/// Launch and initialization specifics for one language.
#[derive(Debug, Clone)]
pub struct LanguageBinding {
    language: Language,
    server_path: Option<PathBuf>,
    extra_args: Vec<String>,
    extra_init_options: Option<Value>,
    launch: Launch,
}

const LAUNCHER_PATTERN: &str = r"^org\.eclipse\.equinox\.launcher_.*\.jar$";

static LAUNCHER_JAR: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(LAUNCHER_PATTERN).ok());

const JDTLS_JVM_FLAGS: &[&str] = &[
    "-Declipse.application=org.eclipse.jdt.ls.core.id1",
    "-Dosgi.bundles.defaultStartLevel=4",
    "-Declipse.product=org.eclipse.jdt.ls.core.product",
    "-Dlog.protocol=true",
    "-Dlog.level=ALL",
];

const JDTLS_MODULE_FLAGS: &[&str] = &[
    "--add-modules=ALL-SYSTEM",
    "--add-opens",
    "java.base/java.util=ALL-UNNAMED",
    "--add-opens",
    "java.base/java.lang=ALL-UNNAMED",
];

impl LanguageBinding {
    /// Binding with the default strategy and options for `language`.
    #[must_use]
    pub fn new(language: Language) -> Self {
        let launch = match language {
            Language::Cpp => Launch::Native(NativeOptions::default()),
            Language::Java => Launch::Jvm(JvmOptions::default()),
        };
        Self {
            language,
            server_path: None,
            extra_args: Vec::new(),
            extra_init_options: None,
            launch,
        }
    }

    /// Builds a binding from a `[server.<language>]` table.
    #[must_use]
    pub fn from_config(language: Language, config: &ServerConfig) -> Self {
        let launch = match language {
            Language::Cpp => {
                let defaults = NativeOptions::default();
                Launch::Native(NativeOptions {
                    compile_commands_dir: config.compile_commands_dir.clone(),
                    include_paths: config.include_paths.clone(),
                    language_standard: config
                        .language_standard
                        .clone()
                        .unwrap_or(defaults.language_standard),
                    extra_flags: config.extra_flags.clone(),
                    result_limit: config.result_limit.unwrap_or(defaults.result_limit),
                    background_index: config.background_index.unwrap_or(defaults.background_index),
                })
            }
            Language::Java => {
                let defaults = JvmOptions::default();
                Launch::Jvm(JvmOptions {
                    java_home: config.java_home.clone(),
                    java_version: config.java_version.clone().unwrap_or(defaults.java_version),
                    class_path: config.class_path.clone(),
                    max_heap: config.max_heap.clone().unwrap_or(defaults.max_heap),
                    data_dir: config.data_dir.clone(),
                })
            }
        };

        Self {
            language,
            server_path: config.path.clone(),
            extra_args: config.args.clone(),
            extra_init_options: config.initialization_options.clone(),
            launch,
        }
    }

    /// Replaces the launch strategy.
    #[must_use]
    pub fn with_launch(mut self, launch: Launch) -> Self {
        self.launch = launch;
        self
    }

    /// Sets the executable (native) or install directory (JVM).
    #[must_use]
    pub fn with_server_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.server_path = Some(path.into());
        self
    }

    /// Sets arguments appended after the defaults.
    #[must_use]
    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Sets initialization options merged over the defaults.
    #[must_use]
    pub fn with_init_options(mut self, options: Value) -> Self {
        self.extra_init_options = Some(options);
        self
    }

    /// Updates the server location in place.
    pub fn set_server_path(&mut self, path: Option<PathBuf>) {
        self.server_path = path;
    }

    /// The language this binding serves.
    #[must_use]
    pub const fn language(&self) -> Language {
        self.language
    }

    /// LSP language identifier.
    #[must_use]
    pub const fn language_id(&self) -> &'static str {
        self.language.id()
    }

    /// Human-readable server name.
    #[must_use]
    pub const fn server_display_name(&self) -> &'static str {
        self.language.server_name()
    }

    /// The launch strategy.
    #[must_use]
    pub const fn launch(&self) -> &Launch {
        &self.launch
    }

    /// The configured server location, if any.
    #[must_use]
    pub fn server_path(&self) -> Option<&Path> {
        self.server_path.as_deref()
    }

    /// The configured server location, or one found on this machine.
    #[must_use]
    pub fn resolve_server(&self) -> Option<PathBuf> {
        if let Some(path) = &self.server_path {
            return Some(path.clone());
        }
        match self.launch {
            Launch::Native(_) => discover_clangd(),
            Launch::Jvm(_) => discover_jdtls(),
        }
    }

    /// Default server arguments.
    ///
    /// For a JVM-hosted server these are the JVM arguments up to and
    /// including `-data`. They are empty when no launcher jar can be found,
    /// which callers must treat as a launch failure.
    #[must_use]
    pub fn default_args(&self, workspace: &Path) -> Vec<String> {
        match &self.launch {
            Launch::Native(opts) => native_args(opts),
            Launch::Jvm(opts) => self
                .resolve_server()
                .map(|dir| jvm_args(opts, &dir, workspace))
                .unwrap_or_default(),
        }
    }

    /// Default `initializationOptions`.
    #[must_use]
    pub fn default_init_options(&self, workspace: &Path) -> Value {
        match &self.launch {
            Launch::Native(opts) => native_init_options(opts, workspace),
            Launch::Jvm(opts) => jvm_init_options(opts, workspace),
        }
    }

    /// Fills in the language-specific namespace of `options`.
    ///
    /// Missing settings are restored from the defaults. Caller-supplied
    /// values are kept.
    pub fn apply_language_specific_settings(&self, options: &mut Value, workspace: &Path) {
        if !options.is_object() {
            *options = json!({});
        }
        let defaults = self.default_init_options(workspace);

        match &self.launch {
            Launch::Native(opts) => {
                fill_missing(options, &defaults);
                if opts.extra_flags.is_empty() {
                    return;
                }
                if let Some(flags) = options
                    .pointer_mut("/clangd/fallbackFlags/flags")
                    .and_then(Value::as_array_mut)
                {
                    for flag in &opts.extra_flags {
                        let flag = Value::String(flag.clone());
                        if !flags.contains(&flag) {
                            flags.push(flag);
                        }
                    }
                }
            }
            Launch::Jvm(_) => fill_missing(options, &defaults),
        }
    }

    /// The `initializationOptions` sent with `initialize`: defaults, then
    /// caller options merged over them, then the language-specific pass.
    #[must_use]
    pub fn initialization_options(&self, workspace: &Path) -> Value {
        let mut options = self.default_init_options(workspace);
        if let Some(extra) = &self.extra_init_options {
            merge_json(&mut options, extra.clone());
        }
        self.apply_language_specific_settings(&mut options, workspace);
        options
    }

    /// Resolves the complete process invocation.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when no server, launcher jar or Java
    /// runtime can be found, or [`ClientError::Spawn`] when the JVM data
    /// directory cannot be created.
    pub fn launch_command(&self, workspace: &Path) -> Result<LaunchCommand, ClientError> {
        let server = self.server_display_name().to_string();
        let Some(server_path) = self.resolve_server() else {
            return Err(ClientError::NoExecutable { server });
        };
        if server_path.as_os_str().is_empty() {
            return Err(ClientError::NoExecutable { server });
        }

        let mut env = vec![
            ("LC_ALL".to_string(), "C.UTF-8".to_string()),
            ("LANG".to_string(), "C.UTF-8".to_string()),
        ];

        let (program, mut args) = match &self.launch {
            Launch::Native(opts) => (server_path, native_args(opts)),
            Launch::Jvm(opts) => {
                let args = jvm_args(opts, &server_path, workspace);
                if args.is_empty() {
                    return Err(ClientError::LauncherNotFound {
                        server,
                        dir: server_path,
                    });
                }
                let (java, home) = resolve_java(opts).ok_or_else(|| ClientError::JavaNotFound {
                    server: server.clone(),
                })?;
                if let Some(home) = home {
                    env.push(("JAVA_HOME".to_string(), home.display().to_string()));
                }

                let data_dir = jvm_data_dir(opts, workspace);
                std::fs::create_dir_all(&data_dir)
                    .map_err(|source| ClientError::Spawn { server, source })?;
                (java, args)
            }
        };

        args.extend(self.extra_args.iter().cloned());
        debug!(
            "{} launch command: {} {}",
            self.language,
            program.display(),
            args.join(" ")
        );
        Ok(LaunchCommand { program, args, env })
    }
}

fn native_args(opts: &NativeOptions) -> Vec<String> {
    let mut args = vec!["--log=verbose".to_string(), "--pretty".to_string()];
    if let Some(dir) = &opts.compile_commands_dir {
        args.push(format!("--compile-commands-dir={}", dir.display()));
    }
    args.push(format!("--limit-results={}", opts.result_limit));
    if opts.background_index {
        args.push("--background-index".to_string());
    }
    args
}

fn native_include_paths(opts: &NativeOptions, workspace: &Path) -> Vec<PathBuf> {
    if opts.include_paths.is_empty() {
        vec![workspace.to_path_buf(), workspace.join("include")]
    } else {
        opts.include_paths.clone()
    }
}

fn native_init_options(opts: &NativeOptions, workspace: &Path) -> Value {
    let mut flags: Vec<String> = native_include_paths(opts, workspace)
        .iter()
        .map(|p| format!("-I{}", p.display()))
        .collect();
    flags.push(format!("-std={}", opts.language_standard));
    flags.push("-Wall".to_string());
    flags.push("-Wextra".to_string());

    let database = opts
        .compile_commands_dir
        .as_ref()
        .map(|d| d.display().to_string())
        .unwrap_or_default();

    json!({
        "clangd": {
            "compilationDatabasePath": database,
            "fallbackFlags": {
                "compilers": ["/usr/bin/gcc", "/usr/bin/clang"],
                "flags": flags
            }
        }
    })
}

fn jvm_data_dir(opts: &JvmOptions, workspace: &Path) -> PathBuf {
    if let Some(dir) = &opts.data_dir {
        return dir.clone();
    }
    if workspace.as_os_str().is_empty() {
        std::env::temp_dir().join("jdtls-workspace")
    } else {
        workspace.join(".jdtls-workspace")
    }
}

fn jvm_args(opts: &JvmOptions, install_dir: &Path, workspace: &Path) -> Vec<String> {
    let Some(launcher) = find_launcher(install_dir) else {
        return Vec::new();
    };

    let mut args: Vec<String> = JDTLS_JVM_FLAGS.iter().map(ToString::to_string).collect();
    args.push(format!("-Xmx{}", opts.max_heap));
    args.extend(JDTLS_MODULE_FLAGS.iter().map(ToString::to_string));
    args.push("-jar".to_string());
    args.push(launcher.display().to_string());

    if let Some(config) = find_config_dir(install_dir) {
        args.push("-configuration".to_string());
        args.push(config.display().to_string());
    } else {
        warn!("No config_* directory in {}", install_dir.display());
    }

    args.push("-data".to_string());
    args.push(jvm_data_dir(opts, workspace).display().to_string());
    args
}

fn jvm_init_options(opts: &JvmOptions, workspace: &Path) -> Value {
    let java_home = opts
        .java_home
        .clone()
        .or_else(|| std::env::var_os("JAVA_HOME").map(PathBuf::from))
        .map(|p| p.display().to_string())
        .unwrap_or_default();

    let mut options = json!({
        "jdtls": {
            "java": {
                "home": java_home,
                "configuration": { "runtimes": [] },
                "version": opts.java_version,
                "classpath": opts.class_path
            },
            "extendedClientCapabilities": {
                "progressReportProvider": true,
                "classFileContentsSupport": true
            }
        }
    });

    if let Ok(uri) = Url::from_directory_path(workspace) {
        let name = workspace
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if let Some(jdtls) = options.get_mut("jdtls").and_then(Value::as_object_mut) {
            jdtls.insert(
                "workspaceFolders".to_string(),
                json!([{ "uri": uri.as_str().trim_end_matches('/'), "name": name }]),
            );
        }
    }
    options
}

/// Finds the Equinox launcher jar in `dir` or `dir/plugins`. When several
/// versions are present the lexicographically greatest wins.
#[must_use]
pub fn find_launcher(dir: &Path) -> Option<PathBuf> {
    let pattern = LAUNCHER_JAR.as_ref()?;
    [dir.to_path_buf(), dir.join("plugins")]
        .into_iter()
        .find_map(|candidate| {
            let mut jars: Vec<PathBuf> = std::fs::read_dir(&candidate)
                .ok()?
                .filter_map(Result::ok)
                .filter(|entry| entry.path().is_file())
                .filter(|entry| pattern.is_match(&entry.file_name().to_string_lossy()))
                .map(|entry| entry.path())
                .collect();
            jars.sort();
            jars.pop()
        })
}

/// Picks the OS-specific `config_*` directory of a JDT LS install, falling
/// back to any `config_*` directory.
#[must_use]
pub fn find_config_dir(dir: &Path) -> Option<PathBuf> {
    let preferred = match std::env::consts::OS {
        "windows" => "config_win",
        "macos" => "config_mac",
        _ => "config_linux",
    };
    let preferred = dir.join(preferred);
    if preferred.is_dir() {
        return Some(preferred);
    }

    let mut configs: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .filter(|entry| entry.path().is_dir())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with("config_"))
        .map(|entry| entry.path())
        .collect();
    configs.sort();
    configs.into_iter().next()
}

/// Locates the `java` executable and, when known, its home directory.
fn resolve_java(opts: &JvmOptions) -> Option<(PathBuf, Option<PathBuf>)> {
    let homes = opts
        .java_home
        .clone()
        .into_iter()
        .chain(std::env::var_os("JAVA_HOME").map(PathBuf::from));

    for home in homes {
        let java = home.join("bin").join(java_executable());
        if java.is_file() {
            return Some((java, Some(home)));
        }
        warn!("Ignoring Java home without a java executable: {}", home.display());
    }

    which::which("java").ok().map(|java| (java, None))
}

const fn java_executable() -> &'static str {
    if cfg!(windows) { "java.exe" } else { "java" }
}

/// Looks for clangd on `PATH`, then in the usual system locations.
#[must_use]
pub fn discover_clangd() -> Option<PathBuf> {
    if let Ok(path) = which::which("clangd") {
        return Some(path);
    }
    ["/usr/bin/clangd", "/usr/local/bin/clangd"]
        .into_iter()
        .map(PathBuf::from)
        .find(|p| p.is_file())
}

/// Looks for a JDT LS install: `JDTLS_HOME`, then the usual locations. Only
/// directories containing a launcher jar qualify.
#[must_use]
pub fn discover_jdtls() -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = std::env::var_os("JDTLS_HOME")
        .map(PathBuf::from)
        .into_iter()
        .collect();
    candidates.extend(
        [
            "/usr/lib/jdtls",
            "/usr/share/jdtls",
            "/usr/local/lib/jdtls",
            "/opt/jdtls",
        ]
        .into_iter()
        .map(PathBuf::from),
    );
    if let Some(home) = dirs::home_dir() {
        candidates.push(home.join("jdtls"));
    }

    candidates
        .into_iter()
        .find(|dir| dir.is_dir() && find_launcher(dir).is_some())
}

/// Recursively merges `overlay` into `base`. Objects merge key by key;
/// any other overlay value replaces the base value.
pub fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Copies keys of `defaults` that are absent from `target`, recursing into
/// objects present on both sides.
fn fill_missing(target: &mut Value, defaults: &Value) {
    let (Value::Object(target), Value::Object(defaults)) = (target, defaults) else {
        return;
    };
    for (key, default) in defaults {
        match target.get_mut(key) {
            Some(existing) => fill_missing(existing, default),
            None => {
                target.insert(key.clone(), default.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fake_jdtls() -> anyhow::Result<tempfile::TempDir> {
        let dir = tempfile::tempdir()?;
        let plugins = dir.path().join("plugins");
        fs::create_dir_all(&plugins)?;
        fs::write(plugins.join("org.eclipse.equinox.launcher_1.6.400.v20210924-0641.jar"), "")?;
        fs::write(plugins.join("org.eclipse.equinox.launcher_1.6.900.v20240613-2009.jar"), "")?;
        fs::write(plugins.join("org.eclipse.equinox.launcher.gtk_1.2.0.jar"), "")?;
        fs::create_dir_all(dir.path().join("config_linux"))?;
        fs::create_dir_all(dir.path().join("config_mac"))?;
        fs::create_dir_all(dir.path().join("config_win"))?;
        Ok(dir)
    }

    fn fake_java_home() -> anyhow::Result<tempfile::TempDir> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("bin"))?;
        fs::write(dir.path().join("bin").join(java_executable()), "")?;
        Ok(dir)
    }

    #[test]
    fn test_extension_table() {
        for ext in ["cpp", "cc", "cxx", "h", "hpp", "hh", "CPP"] {
            assert_eq!(Language::from_extension(ext), Some(Language::Cpp), "{ext}");
        }
        assert_eq!(Language::from_extension("java"), Some(Language::Java));
        assert_eq!(Language::from_extension("rs"), None);
        assert_eq!(Language::from_extension("c"), None);
    }

    #[test]
    fn test_from_path_rejects_unknown() {
        assert_eq!(
            Language::from_path(Path::new("/src/Main.java")).ok(),
            Some(Language::Java)
        );
        assert!(matches!(
            Language::from_path(Path::new("/src/lib.rs")),
            Err(ClientError::UnsupportedExtension(ext)) if ext == ".rs"
        ));
        assert!(matches!(
            Language::from_path(Path::new("/src/Makefile")),
            Err(ClientError::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn test_language_names() -> anyhow::Result<()> {
        assert_eq!(Language::Cpp.id(), "cpp");
        assert_eq!(Language::Java.server_name(), "Eclipse JDT Language Server");
        assert_eq!("C++".parse::<Language>().ok(), Some(Language::Cpp));
        assert!("cobol".parse::<Language>().is_err());
        assert_eq!(serde_json::to_string(&Language::Java)?, "\"java\"");
        Ok(())
    }

    #[test]
    fn test_native_default_args() {
        let binding = LanguageBinding::new(Language::Cpp);
        assert_eq!(
            binding.default_args(Path::new("/ws")),
            vec!["--log=verbose", "--pretty", "--limit-results=100", "--background-index"]
        );

        let binding = binding.with_launch(Launch::Native(NativeOptions {
            compile_commands_dir: Some(PathBuf::from("/ws/build")),
            result_limit: 20,
            background_index: false,
            ..NativeOptions::default()
        }));
        assert_eq!(
            binding.default_args(Path::new("/ws")),
            vec![
                "--log=verbose",
                "--pretty",
                "--compile-commands-dir=/ws/build",
                "--limit-results=20"
            ]
        );
    }

    #[test]
    fn test_native_init_options() {
        let binding = LanguageBinding::new(Language::Cpp);
        let options = binding.initialization_options(Path::new("/ws"));

        assert_eq!(
            options.pointer("/clangd/fallbackFlags/flags"),
            Some(&json!(["-I/ws", "-I/ws/include", "-std=c++17", "-Wall", "-Wextra"]))
        );
        assert_eq!(
            options.pointer("/clangd/fallbackFlags/compilers"),
            Some(&json!(["/usr/bin/gcc", "/usr/bin/clang"]))
        );
    }

    #[test]
    fn test_native_apply_restores_namespace_and_appends_flags() {
        let binding = LanguageBinding::new(Language::Cpp).with_launch(Launch::Native(NativeOptions {
            extra_flags: vec!["-DGROVE".to_string()],
            ..NativeOptions::default()
        }));

        let mut options = json!({ "unrelated": 1 });
        binding.apply_language_specific_settings(&mut options, Path::new("/ws"));

        assert_eq!(options["unrelated"], 1);
        let flags = options
            .pointer("/clangd/fallbackFlags/flags")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        assert_eq!(flags.last(), Some(&json!("-DGROVE")));

        // A second pass does not duplicate the flag.
        binding.apply_language_specific_settings(&mut options, Path::new("/ws"));
        let count = options
            .pointer("/clangd/fallbackFlags/flags")
            .and_then(Value::as_array)
            .map_or(0, |f| f.iter().filter(|v| *v == "-DGROVE").count());
        assert_eq!(count, 1);
    }

    #[test]
    fn test_caller_init_options_win() {
        let binding = LanguageBinding::new(Language::Cpp).with_init_options(json!({
            "clangd": { "fallbackFlags": { "flags": ["-std=c++20"] } },
            "custom": true
        }));
        let options = binding.initialization_options(Path::new("/ws"));

        assert_eq!(options.pointer("/clangd/fallbackFlags/flags"), Some(&json!(["-std=c++20"])));
        assert_eq!(
            options.pointer("/clangd/fallbackFlags/compilers"),
            Some(&json!(["/usr/bin/gcc", "/usr/bin/clang"]))
        );
        assert_eq!(options["custom"], true);
    }

    #[test]
    fn test_native_launch_command_appends_extra_args() -> anyhow::Result<()> {
        let binding = LanguageBinding::new(Language::Cpp)
            .with_server_path("/opt/llvm/bin/clangd")
            .with_extra_args(vec!["--clang-tidy".to_string()]);
        let command = binding.launch_command(Path::new("/ws"))?;

        assert_eq!(command.program, PathBuf::from("/opt/llvm/bin/clangd"));
        assert_eq!(command.args.last().map(String::as_str), Some("--clang-tidy"));
        assert_eq!(command.args.first().map(String::as_str), Some("--log=verbose"));
        assert!(command.env.contains(&("LC_ALL".to_string(), "C.UTF-8".to_string())));
        Ok(())
    }

    #[test]
    fn test_empty_server_path_is_no_executable() {
        let binding = LanguageBinding::new(Language::Cpp).with_server_path("");
        assert!(matches!(
            binding.launch_command(Path::new("/ws")),
            Err(ClientError::NoExecutable { .. })
        ));
    }

    #[test]
    fn test_find_launcher_picks_latest() -> anyhow::Result<()> {
        let install = fake_jdtls()?;
        let launcher = find_launcher(install.path());
        assert_eq!(
            launcher.and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned())),
            Some("org.eclipse.equinox.launcher_1.6.900.v20240613-2009.jar".to_string())
        );
        Ok(())
    }

    #[test]
    fn test_find_launcher_in_root_before_plugins() -> anyhow::Result<()> {
        let install = fake_jdtls()?;
        fs::write(install.path().join("org.eclipse.equinox.launcher_0.1.jar"), "")?;
        assert_eq!(
            find_launcher(install.path()),
            Some(install.path().join("org.eclipse.equinox.launcher_0.1.jar"))
        );
        Ok(())
    }

    #[test]
    fn test_find_config_dir_falls_back() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("config_ss_linux"))?;
        assert_eq!(find_config_dir(dir.path()), Some(dir.path().join("config_ss_linux")));
        Ok(())
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_jvm_args_layout() -> anyhow::Result<()> {
        let install = fake_jdtls()?;
        let binding = LanguageBinding::new(Language::Java).with_server_path(install.path());
        let args = binding.default_args(Path::new("/ws/project"));

        let jar = args.iter().position(|a| a == "-jar");
        assert!(jar.is_some());
        let jar = jar.unwrap_or_default();
        assert!(args[..jar].contains(&"-Xmx1G".to_string()));
        assert!(args[..jar].contains(&"--add-modules=ALL-SYSTEM".to_string()));
        assert!(args[..jar].contains(&"-Declipse.application=org.eclipse.jdt.ls.core.id1".to_string()));
        assert!(args[jar + 1].ends_with("org.eclipse.equinox.launcher_1.6.900.v20240613-2009.jar"));
        assert_eq!(args[jar + 2], "-configuration");
        assert_eq!(args[jar + 3], install.path().join("config_linux").display().to_string());
        assert_eq!(args[jar + 4..], ["-data".to_string(), "/ws/project/.jdtls-workspace".to_string()]);
        Ok(())
    }

    #[test]
    fn test_jvm_without_launcher_has_no_args() -> anyhow::Result<()> {
        let empty = tempfile::tempdir()?;
        let binding = LanguageBinding::new(Language::Java).with_server_path(empty.path());
        assert!(binding.default_args(Path::new("/ws")).is_empty());
        assert!(matches!(
            binding.launch_command(Path::new("/ws")),
            Err(ClientError::LauncherNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_jvm_launch_command_uses_java_home() -> anyhow::Result<()> {
        let install = fake_jdtls()?;
        let java_home = fake_java_home()?;
        let workspace = tempfile::tempdir()?;

        let binding = LanguageBinding::new(Language::Java)
            .with_server_path(install.path())
            .with_launch(Launch::Jvm(JvmOptions {
                java_home: Some(java_home.path().to_path_buf()),
                ..JvmOptions::default()
            }));
        let command = binding.launch_command(workspace.path())?;

        assert_eq!(command.program, java_home.path().join("bin").join(java_executable()));
        assert!(command.env.contains(&(
            "JAVA_HOME".to_string(),
            java_home.path().display().to_string()
        )));
        assert!(workspace.path().join(".jdtls-workspace").is_dir());
        Ok(())
    }

    #[test]
    fn test_jvm_init_options() {
        let binding = LanguageBinding::new(Language::Java).with_launch(Launch::Jvm(JvmOptions {
            java_home: Some(PathBuf::from("/usr/lib/jvm/java-17")),
            java_version: "17".to_string(),
            class_path: vec!["lib/junit.jar".to_string()],
            ..JvmOptions::default()
        }));
        let options = binding.initialization_options(Path::new("/ws/demo"));

        assert_eq!(options.pointer("/jdtls/java/home"), Some(&json!("/usr/lib/jvm/java-17")));
        assert_eq!(options.pointer("/jdtls/java/version"), Some(&json!("17")));
        assert_eq!(options.pointer("/jdtls/java/classpath"), Some(&json!(["lib/junit.jar"])));
        assert_eq!(options.pointer("/jdtls/java/configuration/runtimes"), Some(&json!([])));
        assert_eq!(
            options.pointer("/jdtls/extendedClientCapabilities/progressReportProvider"),
            Some(&json!(true))
        );
        assert_eq!(
            options.pointer("/jdtls/workspaceFolders/0"),
            Some(&json!({ "uri": "file:///ws/demo", "name": "demo" }))
        );
    }

    #[test]
    fn test_jvm_apply_fills_missing_keys() {
        let binding = LanguageBinding::new(Language::Java);
        let mut options = json!({ "jdtls": { "java": { "version": "21" } } });
        binding.apply_language_specific_settings(&mut options, Path::new("/ws"));

        assert_eq!(options.pointer("/jdtls/java/version"), Some(&json!("21")));
        assert!(options.pointer("/jdtls/java/configuration").is_some());
        assert!(options.pointer("/jdtls/extendedClientCapabilities").is_some());
    }

    #[test]
    fn test_merge_json() {
        let mut base = json!({ "a": { "b": 1, "c": [1] }, "d": "x" });
        merge_json(&mut base, json!({ "a": { "c": [2], "e": null }, "d": { "f": 1 } }));
        assert_eq!(base, json!({ "a": { "b": 1, "c": [2], "e": null }, "d": { "f": 1 } }));
    }
}
