//! # Deployment Settings
//!
//! Paths that depend on where the toolchain and its runtime libraries are
//! installed. Settings come from three layers, later ones winning:
//!
//! 1. a JSON file (`Settings::load`),
//! 2. `TKRUN_*` environment variables (`Settings::with_env`),
//! 3. command-line flags applied by the binaries.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env::{self, JoinPathsError};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding `interpreter`
pub const ENV_INTERPRETER: &str = "TKRUN_INTERPRETER";
/// Environment variable overriding `toolchain_module_path`
pub const ENV_TOOLCHAIN_MODULE_PATH: &str = "TKRUN_TOOLCHAIN_MODULE_PATH";
/// Environment variable overriding `runtime_lib_path`
pub const ENV_RUNTIME_LIB_PATH: &str = "TKRUN_RUNTIME_LIB_PATH";
/// Environment variable overriding `working_root`
pub const ENV_WORKING_ROOT: &str = "TKRUN_WORKING_ROOT";

/// Deployment-specific configuration for compiling and running kernels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Interpreter used to run the toolchain bridge
    pub interpreter: PathBuf,
    /// Search path entries for the toolchain module (prepended to PYTHONPATH)
    pub toolchain_module_path: Vec<PathBuf>,
    /// Extra shared-library directories appended after the kernel directory
    pub runtime_lib_path: Vec<PathBuf>,
    /// Base directory under which the toolchain creates kernel directories
    pub working_root: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            interpreter: PathBuf::from("python3"),
            toolchain_module_path: Vec::new(),
            runtime_lib_path: Vec::new(),
            working_root: None,
        }
    }
}

/// Values given on the command line. Empty lists and `None` leave the lower
/// layers alone; a non-empty list replaces the lower layer's list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettingsOverrides {
    pub interpreter: Option<PathBuf>,
    pub toolchain_module_path: Vec<PathBuf>,
    pub runtime_lib_path: Vec<PathBuf>,
    pub working_root: Option<PathBuf>,
}

impl Settings {
    /// Build settings from all three layers: `file` (if any), then the
    /// `TKRUN_*` environment, then `overrides`.
    pub fn layered(file: Option<&Path>, overrides: &SettingsOverrides) -> Result<Self> {
        Self::layered_with(file, |key| env::var_os(key), overrides)
    }

    fn layered_with(
        file: Option<&Path>,
        lookup: impl Fn(&str) -> Option<OsString>,
        overrides: &SettingsOverrides,
    ) -> Result<Self> {
        let base = match file {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        Ok(base.with_vars(lookup).with_overrides(overrides))
    }

    /// Apply command-line overrides on top of these settings.
    pub fn with_overrides(mut self, overrides: &SettingsOverrides) -> Self {
        if let Some(interpreter) = &overrides.interpreter {
            self.interpreter = interpreter.clone();
        }
        if !overrides.toolchain_module_path.is_empty() {
            self.toolchain_module_path = overrides.toolchain_module_path.clone();
        }
        if !overrides.runtime_lib_path.is_empty() {
            self.runtime_lib_path = overrides.runtime_lib_path.clone();
        }
        if let Some(root) = &overrides.working_root {
            self.working_root = Some(root.clone());
        }
        self
    }

    /// Load settings from a JSON file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {:?}", path))?;
        serde_json::from_str(&raw).with_context(|| format!("Invalid settings file {:?}", path))
    }

    /// Overlay values from `TKRUN_*` environment variables.
    pub fn with_env(self) -> Self {
        self.with_vars(|key| env::var_os(key))
    }

    fn with_vars(mut self, lookup: impl Fn(&str) -> Option<OsString>) -> Self {
        if let Some(interpreter) = lookup(ENV_INTERPRETER).filter(|v| !v.is_empty()) {
            self.interpreter = PathBuf::from(interpreter);
        }
        if let Some(paths) = lookup(ENV_TOOLCHAIN_MODULE_PATH) {
            self.toolchain_module_path = env::split_paths(&paths).collect();
        }
        if let Some(paths) = lookup(ENV_RUNTIME_LIB_PATH) {
            self.runtime_lib_path = env::split_paths(&paths).collect();
        }
        if let Some(root) = lookup(ENV_WORKING_ROOT).filter(|v| !v.is_empty()) {
            self.working_root = Some(PathBuf::from(root));
        }
        self
    }

    /// PYTHONPATH for the bridge: configured entries first, then whatever the
    /// caller's environment already had.
    pub fn python_path(&self) -> Result<Option<OsString>, JoinPathsError> {
        let inherited = env::var_os("PYTHONPATH");
        prepend_paths(&self.toolchain_module_path, inherited.as_deref())
    }

    /// LD_LIBRARY_PATH for a kernel living in `kernel_dir`.
    ///
    /// The kernel directory always comes first so the kernel resolves its own
    /// `libkernel.so` before anything else.
    pub fn library_path(&self, kernel_dir: &Path) -> Result<OsString, JoinPathsError> {
        let extra = self.runtime_lib_path.iter().map(PathBuf::as_path);
        env::join_paths(std::iter::once(kernel_dir).chain(extra))
    }
}

fn prepend_paths(
    front: &[PathBuf],
    rest: Option<&OsStr>,
) -> Result<Option<OsString>, JoinPathsError> {
    if front.is_empty() {
        return Ok(rest.map(OsStr::to_os_string));
    }

    let mut entries: Vec<PathBuf> = front.to_vec();
    if let Some(rest) = rest.filter(|r| !r.is_empty()) {
        entries.extend(env::split_paths(rest));
    }
    env::join_paths(entries).map(Some)
}
