use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::compiler::RustcCompiler;
use crate::diagnostics::{Diagnostic, Location};
use crate::directives::DirectiveProcessor;
use crate::engine::{RunStage, TemplatingEngine};
use crate::fs_util::{file_hash, read_text_with_retry};
use crate::host::{IncludeText, OutputEncoding, ParameterKey, TemplatingHost};
use crate::settings::{load_template_options, GenerationOutput, TemplateOptions, ToolSettings};

pub const TEMPLATE_EXTENSION: &str = "tt";
pub const DEFAULT_OUTPUT_EXTENSION: &str = "txt";
pub const PREPROCESSED_EXTENSION: &str = "rs";

/// Outcome of [`TemplateGenerator::run_for_template`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformationResult {
    Success,
    /// The generated output equals the existing target.
    NoChanges,
    UnknownOutputType,
    /// The template compiled but failed while running.
    TemplateProcessingError,
    /// Tokenizing, parsing, directive processing or compiling failed.
    TemplateCompilationError,
}

type ProcessorFactory = Box<dyn Fn() -> Box<dyn DirectiveProcessor>>;

/// File-system host: templates, includes and references are files, and
/// output goes next to the template unless told otherwise.
pub struct TemplateGenerator {
    engine: TemplatingEngine,
    include_paths: Vec<PathBuf>,
    reference_paths: Vec<PathBuf>,
    references: Vec<String>,
    imports: Vec<String>,
    parameters: BTreeMap<ParameterKey, String>,
    processors: BTreeMap<String, ProcessorFactory>,
    template_file: Option<String>,
    output_extension: Option<String>,
    output_encoding: OutputEncoding,
    output_file: Option<PathBuf>,
    failed_stage: Option<RunStage>,
    errors: Vec<Diagnostic>,
}

impl TemplateGenerator {
    pub fn new(engine: TemplatingEngine) -> Self {
        Self {
            engine,
            include_paths: Vec::new(),
            reference_paths: Vec::new(),
            references: Vec::new(),
            imports: Vec::new(),
            parameters: BTreeMap::new(),
            processors: BTreeMap::new(),
            template_file: None,
            output_extension: None,
            output_encoding: OutputEncoding::default(),
            output_file: None,
            failed_stage: None,
            errors: Vec::new(),
        }
    }

    /// A generator compiling with `rustc` as configured in `settings`.
    pub fn from_tool_settings(settings: &ToolSettings) -> Self {
        let compiler = RustcCompiler::new(settings.provider_options());
        let mut generator = Self::new(TemplatingEngine::new(Arc::new(compiler)));
        generator.include_paths = settings.include_paths.clone();
        generator.reference_paths = settings.reference_paths.clone();
        generator.references = settings.references.clone();
        generator.imports = settings.imports.clone();
        for (name, value) in &settings.parameters {
            generator.add_parameter(None, None, name, value);
        }
        generator
    }

    pub fn add_include_path(&mut self, path: impl Into<PathBuf>) {
        self.include_paths.push(path.into());
    }

    pub fn add_reference_path(&mut self, path: impl Into<PathBuf>) {
        self.reference_paths.push(path.into());
    }

    pub fn add_reference(&mut self, reference: &str) {
        self.references.push(reference.to_string());
    }

    pub fn add_import(&mut self, import: &str) {
        self.imports.push(import.to_string());
    }

    pub fn add_parameter(
        &mut self,
        processor: Option<&str>,
        directive_id: Option<&str>,
        name: &str,
        value: &str,
    ) {
        self.parameters
            .insert(ParameterKey::new(processor, directive_id, name), value.to_string());
    }

    /// Makes `name` available to `processor="name"` directives.
    pub fn register_processor(
        &mut self,
        name: &str,
        factory: impl Fn() -> Box<dyn DirectiveProcessor> + 'static,
    ) {
        self.processors
            .insert(name.to_ascii_lowercase(), Box::new(factory));
    }

    /// Diagnostics of the last run.
    pub fn errors(&self) -> &[Diagnostic] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        self.errors.iter().any(Diagnostic::is_error)
    }

    /// File written by the last successful run.
    pub fn output_file(&self) -> Option<&Path> {
        self.output_file.as_deref()
    }

    pub fn output_encoding(&self) -> OutputEncoding {
        self.output_encoding
    }

    /// Processes `input` and writes the result to `output`, or next to the
    /// template. Nothing is written when any error was reported.
    pub fn process_template_file(&mut self, input: &Path, output: Option<&Path>) -> bool {
        let Some(content) = self.begin(input) else {
            return false;
        };
        let engine = self.engine.clone();
        let result = engine.process_template(&content, self);
        self.failed_stage = result.failed_stage;
        let Some(text) = result.output else {
            return false;
        };
        if self.has_errors() {
            return false;
        }

        let target = self.output_path_for(input, output);
        let bytes = self.output_encoding.encode(&text);
        self.write_output(&target, &bytes)
    }

    /// Writes a standalone module for `input` instead of running it.
    pub fn preprocess_template_file(
        &mut self,
        input: &Path,
        class_name: &str,
        namespace: &str,
        output: Option<&Path>,
    ) -> bool {
        let Some(content) = self.begin(input) else {
            return false;
        };
        let engine = self.engine.clone();
        let result = engine.preprocess_template(&content, class_name, namespace, self);
        self.failed_stage = result.failed_stage;
        let Some(template) = result.template else {
            return false;
        };
        if self.has_errors() {
            return false;
        }

        let target = output
            .map(Path::to_path_buf)
            .unwrap_or_else(|| input.with_extension(PREPROCESSED_EXTENSION));
        self.write_output(&target, template.source.as_bytes())
    }

    /// Runs a template according to its sidecar settings and copies the
    /// result to its target when the content changed.
    pub fn run_for_template(&mut self, template: &Path) -> TransformationResult {
        let options = match load_template_options(template) {
            Ok(options) => options,
            Err(err) => {
                warn!("{err}; using default template settings");
                TemplateOptions::default()
            }
        };
        let staging = match tempfile::Builder::new().prefix("texttransform-run-").tempdir() {
            Ok(staging) => staging,
            Err(err) => {
                self.errors.push(Diagnostic::error(
                    "TT5002",
                    format!("failed to create staging directory: {err}"),
                    None,
                ));
                return TransformationResult::TemplateProcessingError;
            }
        };
        let stem = template
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "template".to_string());

        let (staged, default_target) = match options.output_type {
            GenerationOutput::Unknown => {
                warn!("{}: unknown output type", template.display());
                return TransformationResult::UnknownOutputType;
            }
            GenerationOutput::Text => {
                if !self.process_template_file(template, Some(&staging.path().join(&stem))) {
                    return match self.failed_stage {
                        Some(stage) if stage.is_before_execution() => {
                            TransformationResult::TemplateCompilationError
                        }
                        _ => TransformationResult::TemplateProcessingError,
                    };
                }
                let Some(staged) = self.output_file.clone() else {
                    return TransformationResult::TemplateProcessingError;
                };
                let extension = staged
                    .extension()
                    .map(|ext| ext.to_string_lossy().into_owned())
                    .unwrap_or_else(|| DEFAULT_OUTPUT_EXTENSION.to_string());
                (staged, template.with_extension(extension))
            }
            GenerationOutput::TextGenerator => {
                let staged = staging.path().join(format!("{stem}.{PREPROCESSED_EXTENSION}"));
                let class_name = class_name_for(template);
                if !self.preprocess_template_file(template, &class_name, "", Some(&staged)) {
                    return TransformationResult::TemplateCompilationError;
                }
                (staged, template.with_extension(PREPROCESSED_EXTENSION))
            }
        };

        let target = match options.output_path {
            Some(path) if path.is_relative() => template
                .parent()
                .map(|dir| dir.join(&path))
                .unwrap_or(path),
            Some(path) => path,
            None => default_target,
        };
        let previous = file_hash(&target);
        if previous.is_some() && previous == file_hash(&staged) {
            info!("{}: no changes", target.display());
            self.output_file = Some(target);
            return TransformationResult::NoChanges;
        }
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(err) = fs::create_dir_all(parent) {
                self.report_write_error(&target, &err);
                return TransformationResult::TemplateProcessingError;
            }
        }
        if let Err(err) = fs::copy(&staged, &target) {
            self.report_write_error(&target, &err);
            return TransformationResult::TemplateProcessingError;
        }
        info!("{} -> {}", template.display(), target.display());
        self.output_file = Some(target);
        TransformationResult::Success
    }

    /// Resets per-run state and reads the template.
    fn begin(&mut self, input: &Path) -> Option<String> {
        self.errors.clear();
        self.output_extension = None;
        self.output_encoding = OutputEncoding::default();
        self.output_file = None;
        self.failed_stage = None;
        let canonical = fs::canonicalize(input).unwrap_or_else(|_| input.to_path_buf());
        self.template_file = Some(canonical.display().to_string());
        match read_text_with_retry(input) {
            Ok(content) => Some(content),
            Err(err) => {
                self.errors.push(Diagnostic::error(
                    "TT5001",
                    format!("could not read template: {err}"),
                    Some(Location::new(self.template_file.as_deref(), -1, -1)),
                ));
                self.failed_stage = Some(RunStage::Tokenizing);
                None
            }
        }
    }

    fn output_path_for(&self, input: &Path, output: Option<&Path>) -> PathBuf {
        match (output, self.output_extension.as_deref()) {
            (Some(output), Some(extension)) => output.with_extension(extension),
            (Some(output), None) => output.to_path_buf(),
            (None, extension) => {
                input.with_extension(extension.unwrap_or(DEFAULT_OUTPUT_EXTENSION))
            }
        }
    }

    fn write_output(&mut self, target: &Path, bytes: &[u8]) -> bool {
        if let Err(err) = fs::write(target, bytes) {
            self.report_write_error(target, &err);
            return false;
        }
        debug!("wrote {} byte(s) to {}", bytes.len(), target.display());
        self.output_file = Some(target.to_path_buf());
        true
    }

    fn report_write_error(&mut self, target: &Path, err: &std::io::Error) {
        self.errors.push(Diagnostic::error(
            "TT5002",
            format!("could not write output file {}: {err}", target.display()),
            Some(Location::new(self.template_file.as_deref(), -1, -1)),
        ));
    }

    fn template_dir(&self) -> Option<&Path> {
        self.template_file
            .as_deref()
            .and_then(|file| Path::new(file).parent())
    }
}

impl TemplatingHost for TemplateGenerator {
    fn template_file(&self) -> Option<&str> {
        self.template_file.as_deref()
    }

    fn log_errors(&mut self, diagnostics: &[Diagnostic]) {
        self.errors.extend_from_slice(diagnostics);
    }

    fn standard_references(&self) -> Vec<String> {
        self.references.clone()
    }

    fn standard_imports(&self) -> Vec<String> {
        self.imports.clone()
    }

    /// Tries the request resolved against the template, then under each
    /// include path.
    fn load_include_text(&self, request: &str) -> Option<IncludeText> {
        let request_path = Path::new(request);
        let mut candidates = vec![PathBuf::from(self.resolve_path(request))];
        if request_path.is_relative() {
            candidates.extend(self.include_paths.iter().map(|dir| dir.join(request_path)));
        }
        let path = candidates.into_iter().find(|path| path.is_file())?;
        let content = read_text_with_retry(&path).ok()?;
        let resolved = fs::canonicalize(&path).unwrap_or(path);
        Some(IncludeText {
            content,
            resolved_name: resolved.display().to_string(),
        })
    }

    /// Looks in each reference path for the exact name, then for the usual
    /// library file names. Unresolved names are passed on as they are.
    fn resolve_assembly_reference(&self, name: &str) -> String {
        let name = name.trim();
        if name.contains('=') || Path::new(name).is_absolute() {
            return name.to_string();
        }
        let candidates = [
            name.to_string(),
            format!("lib{name}.rlib"),
            format!("{name}.rlib"),
        ];
        for dir in &self.reference_paths {
            for candidate in &candidates {
                let path = dir.join(candidate);
                if path.is_file() {
                    return path.display().to_string();
                }
            }
        }
        if Path::new(name).is_file() {
            return fs::canonicalize(name)
                .map(|path| path.display().to_string())
                .unwrap_or_else(|_| name.to_string());
        }
        name.to_string()
    }

    fn resolve_parameter_value(
        &self,
        directive_id: Option<&str>,
        processor: Option<&str>,
        parameter: &str,
    ) -> Option<String> {
        self.parameters
            .get(&ParameterKey::new(processor, directive_id, parameter))
            .or_else(|| self.parameters.get(&ParameterKey::global(parameter)))
            .cloned()
    }

    fn resolve_directive_processor(
        &self,
        processor_name: &str,
    ) -> Result<Box<dyn DirectiveProcessor>, String> {
        match self.processors.get(&processor_name.to_ascii_lowercase()) {
            Some(factory) => Ok(factory()),
            None => Err(format!(
                "directive processor '{processor_name}' is not registered"
            )),
        }
    }

    fn resolve_path(&self, path: &str) -> String {
        let candidate = Path::new(path);
        if candidate.is_absolute() {
            return path.to_string();
        }
        let joined = match self.template_dir() {
            Some(dir) => dir.join(candidate),
            None => candidate.to_path_buf(),
        };
        fs::canonicalize(&joined)
            .unwrap_or(joined)
            .display()
            .to_string()
    }

    fn session_parameters(&self) -> BTreeMap<String, String> {
        self.parameters
            .iter()
            .filter(|(key, _)| key.is_global())
            .map(|(key, value)| (key.name.clone(), value.clone()))
            .collect()
    }

    fn set_file_extension(&mut self, extension: &str) {
        let extension = extension.trim().trim_start_matches('.');
        self.output_extension = Some(extension.to_string());
    }

    fn set_output_encoding(&mut self, encoding: OutputEncoding) {
        self.output_encoding = encoding;
    }
}

/// `my-report.tt` becomes `MyReport`.
pub fn class_name_for(template: &Path) -> String {
    let stem = template
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut name = String::new();
    for part in stem.split(|c: char| !c.is_ascii_alphanumeric()) {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            name.push(first.to_ascii_uppercase());
            name.extend(chars);
        }
    }
    if name.is_empty() || name.starts_with(|c: char| c.is_ascii_digit()) {
        name.insert_str(0, "Template");
    }
    name
}

/// Every `.tt` file under `root` that is not excluded by `settings`, sorted.
pub fn find_templates(root: &Path, settings: &ToolSettings) -> Vec<PathBuf> {
    let mut templates: Vec<PathBuf> = WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| path.extension().is_some_and(|ext| ext == TEMPLATE_EXTENSION))
        .filter(|path| {
            let relative = path.strip_prefix(root).unwrap_or(path);
            !settings.is_excluded(path) && !settings.is_excluded(relative)
        })
        .collect();
    templates.sort();
    templates
}

#[cfg(test)]
mod tests;
