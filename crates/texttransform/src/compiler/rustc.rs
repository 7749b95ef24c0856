use std::env::consts::EXE_SUFFIX;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};

use super::{
    extern_reference, parse_output_line, BackendCompiler, CompiledModule, CompilerMessage,
    CompilerParameters, CompilerResults, ProviderOptions,
};
use crate::TransformError;

const CRATE_NAME: &str = "texttransform_unit";
const SOURCE_FILE: &str = "unit.rs";
const ARGS_FILE: &str = "unit.args";
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Compiles generated units with a `rustc` subprocess. Arguments go through
/// a response file so long reference lists never hit command line limits.
#[derive(Debug, Clone, Default)]
pub struct RustcCompiler {
    options: ProviderOptions,
}

impl RustcCompiler {
    pub fn new(options: ProviderOptions) -> Self {
        if !options.compiler_server_time_to_live.is_zero() {
            debug!(
                "compiler server lifetime {:?} ignored; rustc runs per unit",
                options.compiler_server_time_to_live
            );
        }
        Self { options }
    }

    pub fn options(&self) -> &ProviderOptions {
        &self.options
    }

    fn arguments(
        &self,
        source_path: &Path,
        output_path: &Path,
        parameters: &CompilerParameters,
    ) -> Vec<String> {
        let mut args = vec![
            source_path.display().to_string(),
            format!("--crate-name={CRATE_NAME}"),
            format!(
                "--crate-type={}",
                if parameters.generate_executable { "bin" } else { "lib" }
            ),
            format!("--edition={}", self.options.option("edition").unwrap_or("2021")),
            "--error-format=short".to_string(),
            "-o".to_string(),
            output_path.display().to_string(),
        ];
        if parameters.include_debug_information {
            args.push("-Cdebuginfo=2".to_string());
        } else {
            args.push("-Copt-level=1".to_string());
        }
        if self.options.warn_as_error {
            args.push("-Dwarnings".to_string());
        }

        let mut search_dirs: Vec<PathBuf> = Vec::new();
        for reference in &parameters.references {
            let (name, path) = extern_reference(reference);
            match path {
                Some(path) => {
                    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                        if !search_dirs.iter().any(|dir| dir == parent) {
                            search_dirs.push(parent.to_path_buf());
                        }
                    }
                    args.push("--extern".to_string());
                    args.push(format!("{name}={}", path.display()));
                }
                None => {
                    args.push("--extern".to_string());
                    args.push(name);
                }
            }
        }
        for dir in search_dirs {
            args.push(format!("-Ldependency={}", dir.display()));
        }

        if let Some(extra) = self.options.option("extra-args") {
            args.extend(
                extra
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(str::to_string),
            );
        }
        args.extend(parameters.extra_options.iter().cloned());
        args
    }
}

impl BackendCompiler for RustcCompiler {
    fn compile(
        &self,
        source: &str,
        parameters: &CompilerParameters,
    ) -> Result<CompilerResults, TransformError> {
        let workspace = tempfile::Builder::new()
            .prefix("texttransform-")
            .tempdir()?;
        let dir = workspace.path();
        let source_path = dir.join(SOURCE_FILE);
        fs::write(&source_path, source)?;

        let output_path = if parameters.generate_executable {
            dir.join(format!("{}{EXE_SUFFIX}", parameters.output_name))
        } else {
            dir.join(format!("lib{}.rlib", parameters.output_name))
        };
        let args = self.arguments(&source_path, &output_path, parameters);
        let args_path = dir.join(ARGS_FILE);
        fs::write(&args_path, args.join("\n"))?;

        let stdout_path = dir.join("rustc.stdout");
        let stderr_path = dir.join("rustc.stderr");
        debug!(
            "compiling {} with {}",
            source_path.display(),
            self.options.compiler_full_path.display()
        );
        let child = Command::new(&self.options.compiler_full_path)
            .arg(format!("@{}", args_path.display()))
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(File::create(&stdout_path)?)
            .stderr(File::create(&stderr_path)?)
            .spawn()
            .map_err(|err| {
                TransformError::Io(std::io::Error::new(
                    err.kind(),
                    format!(
                        "failed to start compiler {}: {err}",
                        self.options.compiler_full_path.display()
                    ),
                ))
            })?;

        let mut results = CompilerResults {
            source_path: source_path.clone(),
            ..CompilerResults::default()
        };
        let status = wait_with_timeout(child, self.options.compiler_timeout)?;

        for path in [&stderr_path, &stdout_path] {
            let text = fs::read_to_string(path).unwrap_or_default();
            for line in text.lines() {
                if let Some(message) = parse_output_line(line) {
                    results.messages.push(message);
                }
                results.output.push(line.to_string());
            }
        }

        let Some(status) = status else {
            warn!("compiler timed out after {:?}", self.options.compiler_timeout);
            results.native_return_value = -1;
            results.messages.push(CompilerMessage {
                file: None,
                line: 0,
                column: 0,
                is_warning: false,
                code: "TT3002".to_string(),
                message: format!(
                    "compiler did not finish within {} seconds",
                    self.options
                        .compiler_timeout
                        .map(|t| t.as_secs())
                        .unwrap_or_default()
                ),
            });
            return Ok(results);
        };
        results.native_return_value = status.code().unwrap_or(-1);
        if !status.success() && !results.has_errors() {
            results.messages.push(CompilerMessage {
                file: None,
                line: 0,
                column: 0,
                is_warning: false,
                code: "TT3001".to_string(),
                message: format!("compiler exited with {status}"),
            });
        }
        debug!(
            "compiler finished with {} message(s), exit {}",
            results.messages.len(),
            results.native_return_value
        );

        if status.success() && output_path.exists() {
            let symbols = find_symbols(&output_path);
            let references = parameters
                .references
                .iter()
                .filter_map(|reference| extern_reference(reference).1)
                .collect();
            results.module = Some(CompiledModule::new(
                output_path,
                symbols,
                references,
                workspace,
            ));
        }
        Ok(results)
    }
}

/// Waits for the child. `Ok(None)` means the timeout elapsed and the child
/// was killed.
fn wait_with_timeout(
    mut child: Child,
    timeout: Option<Duration>,
) -> Result<Option<ExitStatus>, TransformError> {
    let Some(timeout) = timeout else {
        return Ok(Some(child.wait()?));
    };
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn find_symbols(output_path: &Path) -> Option<PathBuf> {
    let candidates = [
        output_path.with_extension("pdb"),
        PathBuf::from(format!("{}.dSYM", output_path.display())),
    ];
    candidates.into_iter().find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn compiler(options: BTreeMap<String, String>, warn_as_error: bool) -> RustcCompiler {
        RustcCompiler::new(ProviderOptions {
            warn_as_error,
            all_options: options,
            ..ProviderOptions::default()
        })
    }

    #[test]
    fn arguments_cover_references_and_options() {
        let mut options = BTreeMap::new();
        options.insert("edition".to_string(), "2018".to_string());
        options.insert("extra-args".to_string(), "-Cpanic=unwind\n\n--cfg=tt".to_string());
        let compiler = compiler(options, true);
        let parameters = CompilerParameters {
            references: vec![
                "/deps/libserde-1a2b.rlib".to_string(),
                "/deps/libitoa-9f.rlib".to_string(),
                "proc_macro".to_string(),
            ],
            extra_options: vec!["-Ccodegen-units=1".to_string()],
            ..CompilerParameters::default()
        };
        let args = compiler.arguments(Path::new("unit.rs"), Path::new("template"), &parameters);

        assert_eq!(args[0], "unit.rs");
        assert!(args.contains(&"--crate-type=bin".to_string()));
        assert!(args.contains(&"--edition=2018".to_string()));
        assert!(args.contains(&"-Dwarnings".to_string()));
        assert!(args.contains(&"serde=/deps/libserde-1a2b.rlib".to_string()));
        assert!(args.contains(&"proc_macro".to_string()));
        assert_eq!(
            args.iter().filter(|a| a.starts_with("-Ldependency=")).count(),
            1
        );
        let tail: Vec<_> = args.iter().rev().take(3).rev().cloned().collect();
        assert_eq!(tail, vec!["-Cpanic=unwind", "--cfg=tt", "-Ccodegen-units=1"]);
    }

    #[test]
    fn library_units_and_debug_info() {
        let compiler = compiler(BTreeMap::new(), false);
        let parameters = CompilerParameters {
            generate_executable: false,
            include_debug_information: true,
            ..CompilerParameters::default()
        };
        let args = compiler.arguments(Path::new("unit.rs"), Path::new("libt.rlib"), &parameters);
        assert!(args.contains(&"--crate-type=lib".to_string()));
        assert!(args.contains(&"--edition=2021".to_string()));
        assert!(args.contains(&"-Cdebuginfo=2".to_string()));
        assert!(!args.contains(&"-Dwarnings".to_string()));
    }

    #[test]
    fn missing_compiler_is_an_io_error() {
        let compiler = RustcCompiler::new(ProviderOptions {
            compiler_full_path: PathBuf::from("/nonexistent/texttransform-rustc"),
            ..ProviderOptions::default()
        });
        let result = compiler.compile("fn main() {}", &CompilerParameters::default());
        assert!(matches!(result, Err(TransformError::Io(_))));
    }
}
