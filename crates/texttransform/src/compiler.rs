use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::TransformError;

mod output;
mod rustc;

pub use output::{parse_output_line, CompilerMessage};
pub use rustc::RustcCompiler;

/// Backend compiler configuration, fixed for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOptions {
    pub compiler_full_path: PathBuf,
    /// Idle lifetime of a reusable compiler process, for backends that keep
    /// one around.
    pub compiler_server_time_to_live: Duration,
    /// `None` waits for the compiler indefinitely.
    pub compiler_timeout: Option<Duration>,
    pub warn_as_error: bool,
    pub all_options: BTreeMap<String, String>,
}

impl Default for ProviderOptions {
    fn default() -> Self {
        Self {
            compiler_full_path: PathBuf::from("rustc"),
            compiler_server_time_to_live: Duration::ZERO,
            compiler_timeout: None,
            warn_as_error: false,
            all_options: BTreeMap::new(),
        }
    }
}

impl ProviderOptions {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.all_options.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerParameters {
    /// Resolved references, either a path or `name=path`.
    pub references: Vec<String>,
    pub include_debug_information: bool,
    pub generate_executable: bool,
    pub output_name: String,
    pub extra_options: Vec<String>,
}

impl Default for CompilerParameters {
    fn default() -> Self {
        Self {
            references: Vec::new(),
            include_debug_information: false,
            generate_executable: true,
            output_name: "template".to_string(),
            extra_options: Vec::new(),
        }
    }
}

/// A successfully built unit. The binary lives in a temporary workspace that
/// is removed once the last clone of the module is dropped.
#[derive(Debug, Clone)]
pub struct CompiledModule {
    pub path: PathBuf,
    pub symbols: Option<PathBuf>,
    pub references: Vec<PathBuf>,
    workspace: Arc<TempDir>,
}

impl CompiledModule {
    pub fn new(path: PathBuf, symbols: Option<PathBuf>, references: Vec<PathBuf>, workspace: TempDir) -> Self {
        Self {
            path,
            symbols,
            references,
            workspace: Arc::new(workspace),
        }
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }
}

#[derive(Debug, Default)]
pub struct CompilerResults {
    /// Diagnostics in generated-unit coordinates.
    pub messages: Vec<CompilerMessage>,
    /// Raw compiler output lines.
    pub output: Vec<String>,
    pub native_return_value: i32,
    /// Path of the generated source as the compiler saw it.
    pub source_path: PathBuf,
    pub module: Option<CompiledModule>,
}

impl CompilerResults {
    pub fn has_errors(&self) -> bool {
        self.messages.iter().any(|message| !message.is_warning)
    }
}

/// Turns generated source into a runnable module.
pub trait BackendCompiler: Send + Sync {
    fn compile(
        &self,
        source: &str,
        parameters: &CompilerParameters,
    ) -> Result<CompilerResults, TransformError>;
}

/// Splits a reference into crate name and path. `name=path` is taken as is;
/// otherwise the name comes from the file stem without `lib` prefix and
/// `-hash` suffix. A bare name has no path.
pub fn extern_reference(reference: &str) -> (String, Option<PathBuf>) {
    if let Some((name, path)) = reference.split_once('=') {
        return (name.trim().to_string(), Some(PathBuf::from(path.trim())));
    }
    let path = Path::new(reference);
    let is_path = path.components().count() > 1 || path.extension().is_some();
    if !is_path {
        return (reference.to_string(), None);
    }
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = stem.strip_prefix("lib").unwrap_or(&stem);
    let name = stem.split('-').next().unwrap_or(stem).to_string();
    (name, Some(path.to_path_buf()))
}
