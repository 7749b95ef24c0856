use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use crate::codegen::{generate_unit, DirectiveCode, GeneratedUnit, UnitInput, UnitKind};
use crate::compiler::{BackendCompiler, CompilerMessage, CompilerParameters, CompilerResults};
use crate::diagnostics::{Diagnostic, DiagnosticBag, Location, Severity};
use crate::directives::{DirectiveProcessor, SessionParameterGenerator, REQUIRES_PROVIDES_PROCESSOR};
use crate::execution::ExecutionHost;
use crate::host::TemplatingHost;
use crate::settings::{is_built_in_directive, TemplateSettings};
use crate::template::{ParsedTemplate, Segment};

/// Language identifier reported for preprocessed templates.
pub const TEMPLATE_LANGUAGE: &str = "Rust";

/// Stages of one run, in order. A failing stage ends the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Idle,
    Tokenizing,
    Parsing,
    DirectiveProcessing,
    CodeGenerating,
    Compiling,
    Executing,
    Done,
}

impl RunStage {
    /// Stages that end a run before the compiled module is executed.
    pub fn is_before_execution(self) -> bool {
        !matches!(self, RunStage::Executing | RunStage::Done)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProcessResult {
    pub output: Option<String>,
    pub failed_stage: Option<RunStage>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ProcessResult {
    pub fn succeeded(&self) -> bool {
        self.failed_stage.is_none() && self.output.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreprocessedTemplate {
    pub language: String,
    pub references: Vec<String>,
    pub source: String,
}

#[derive(Debug, Clone, Default)]
pub struct PreprocessResult {
    pub template: Option<PreprocessedTemplate>,
    pub failed_stage: Option<RunStage>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Parsed, configured and generated unit, shared by both entry points.
struct PreparedUnit {
    unit: GeneratedUnit,
    settings: TemplateSettings,
    references: Vec<String>,
}

/// Turns template text into output text:
/// parse, directive processing, code generation, compilation, execution.
#[derive(Clone)]
pub struct TemplatingEngine {
    compiler: Arc<dyn BackendCompiler>,
    execution: ExecutionHost,
}

impl TemplatingEngine {
    pub fn new(compiler: Arc<dyn BackendCompiler>) -> Self {
        Self::with_execution_host(compiler, ExecutionHost::default())
    }

    pub fn with_execution_host(compiler: Arc<dyn BackendCompiler>, execution: ExecutionHost) -> Self {
        Self { compiler, execution }
    }

    pub fn execution_host(&self) -> &ExecutionHost {
        &self.execution
    }

    pub fn process_template(&self, content: &str, host: &mut dyn TemplatingHost) -> ProcessResult {
        info!("processing {}", host.template_file().unwrap_or("<template>"));
        let mut diagnostics = DiagnosticBag::new();
        let outcome = self.run_process(content, host, &mut diagnostics);
        let (output, failed_stage) = match outcome {
            Ok(output) => (Some(output), None),
            Err(stage) => (None, Some(stage)),
        };
        debug!("run ended at {:?}", failed_stage.unwrap_or(RunStage::Done));
        let diagnostics = diagnostics.into_vec();
        host.log_errors(&diagnostics);
        ProcessResult {
            output,
            failed_stage,
            diagnostics,
        }
    }

    /// Generates a standalone module named `class_name` inside `namespace`
    /// instead of running the template.
    pub fn preprocess_template(
        &self,
        content: &str,
        class_name: &str,
        namespace: &str,
        host: &mut dyn TemplatingHost,
    ) -> PreprocessResult {
        info!("preprocessing {}", host.template_file().unwrap_or("<template>"));
        let mut diagnostics = DiagnosticBag::new();
        let kind = UnitKind::Preprocessed {
            class_name: class_name.to_string(),
            namespace: namespace.to_string(),
        };
        let prepared = self.prepare(content, &kind, host, &mut diagnostics);
        let (template, failed_stage) = match prepared {
            Ok(prepared) => (
                Some(PreprocessedTemplate {
                    language: TEMPLATE_LANGUAGE.to_string(),
                    references: prepared.references,
                    source: prepared.unit.source,
                }),
                None,
            ),
            Err(stage) => (None, Some(stage)),
        };
        let diagnostics = diagnostics.into_vec();
        host.log_errors(&diagnostics);
        PreprocessResult {
            template,
            failed_stage,
            diagnostics,
        }
    }

    fn run_process(
        &self,
        content: &str,
        host: &mut dyn TemplatingHost,
        diagnostics: &mut DiagnosticBag,
    ) -> Result<String, RunStage> {
        let prepared = self.prepare(content, &UnitKind::Executable, host, diagnostics)?;
        if let Some(extension) = &prepared.settings.extension {
            host.set_file_extension(extension);
        }
        if let Some(encoding) = prepared.settings.encoding {
            host.set_output_encoding(encoding);
        }

        debug!("stage {:?}", RunStage::Compiling);
        let root = host.template_file().map(str::to_string);
        let parameters = CompilerParameters {
            references: prepared.references.clone(),
            include_debug_information: prepared.settings.debug,
            ..CompilerParameters::default()
        };
        let results = match self.compiler.compile(&prepared.unit.source, &parameters) {
            Ok(results) => results,
            Err(err) => {
                diagnostics.error(
                    "TT5003",
                    format!("failed to compile template: {err}"),
                    Some(Location::new(root.as_deref(), -1, -1)),
                );
                return Err(RunStage::Compiling);
            }
        };
        for message in &results.messages {
            diagnostics.push(map_compiler_message(message, &results, &prepared.unit, root.as_deref()));
        }
        let module = match results.module {
            Some(module) if !results.has_errors() => module,
            _ => {
                if !diagnostics.has_errors() {
                    diagnostics.error(
                        "TT3001",
                        "compiler produced no module",
                        Some(Location::new(root.as_deref(), -1, -1)),
                    );
                }
                return Err(RunStage::Compiling);
            }
        };

        debug!("stage {:?}", RunStage::Executing);
        let session = host.session_parameters();
        let working_dir = root
            .as_deref()
            .and_then(|file| Path::new(file).parent())
            .filter(|dir| dir.is_dir());
        let outcome = self
            .execution
            .run(&module, &session, working_dir, root.as_deref());
        let succeeded = outcome.succeeded();
        diagnostics.extend(outcome.diagnostics);
        match outcome.output {
            Some(output) if succeeded => Ok(output),
            _ => Err(RunStage::Executing),
        }
    }

    fn prepare(
        &self,
        content: &str,
        kind: &UnitKind,
        host: &mut dyn TemplatingHost,
        diagnostics: &mut DiagnosticBag,
    ) -> Result<PreparedUnit, RunStage> {
        debug!("stage {:?}", RunStage::Parsing);
        let template = ParsedTemplate::from_text(content, &*host);
        diagnostics.extend(template.errors().iter().cloned());
        if diagnostics.has_errors() {
            let tokenizer_failed = diagnostics.iter().any(|d| d.code == "TT1001");
            return Err(if tokenizer_failed {
                RunStage::Tokenizing
            } else {
                RunStage::Parsing
            });
        }

        debug!("stage {:?}", RunStage::DirectiveProcessing);
        let settings = TemplateSettings::from_template(&template, diagnostics);
        let directive_code = process_directives(&template, &*host, diagnostics);
        if diagnostics.has_errors() {
            return Err(RunStage::DirectiveProcessing);
        }

        let mut imports = host.standard_imports();
        imports.extend(settings.imports.iter().cloned());
        let mut references: Vec<String> = Vec::new();
        let requested = host
            .standard_references()
            .into_iter()
            .chain(settings.references.iter().cloned())
            .chain(directive_code.references.iter().cloned());
        for reference in requested {
            let resolved = host.resolve_assembly_reference(&reference);
            if !references.contains(&resolved) {
                references.push(resolved);
            }
        }

        debug!("stage {:?}", RunStage::CodeGenerating);
        let input = UnitInput {
            template: &template,
            settings: &settings,
            directive_code: &directive_code,
            imports: &imports,
            template_file: host.template_file(),
        };
        let unit = match generate_unit(&input, kind) {
            Ok(unit) => unit,
            Err(err) => {
                diagnostics.error(
                    "TT3003",
                    format!("failed to generate transformation: {err}"),
                    Some(Location::new(host.template_file(), -1, -1)),
                );
                return Err(RunStage::CodeGenerating);
            }
        };
        Ok(PreparedUnit {
            unit,
            settings,
            references,
        })
    }
}

struct ActiveProcessor {
    name: String,
    processor: Box<dyn DirectiveProcessor>,
}

/// Routes every directive that is not fully handled by the engine to its
/// processor and gathers the code they contribute.
fn process_directives(
    template: &ParsedTemplate,
    host: &dyn TemplatingHost,
    diagnostics: &mut DiagnosticBag,
) -> DirectiveCode {
    let root = template.root_file_name();
    let mut code = DirectiveCode::default();
    let mut active: Vec<ActiveProcessor> = Vec::new();

    for (index, segment) in template.raw_segments().iter().enumerate() {
        let Segment::Directive(directive) = segment else {
            continue;
        };
        let location = attribute_to_root(&directive.start_location, root);
        let processor_name = match directive.attribute("processor") {
            Some(name) => name.trim().to_string(),
            None if directive.has_attribute("requires") || directive.has_attribute("provides") => {
                REQUIRES_PROVIDES_PROCESSOR.to_string()
            }
            None if is_built_in_directive(directive) => continue,
            None => {
                diagnostics.error(
                    "TT2001",
                    format!("directive '{}' has no processor", directive.name),
                    Some(location),
                );
                continue;
            }
        };

        let position = active
            .iter()
            .position(|entry| entry.name.eq_ignore_ascii_case(&processor_name));
        let position = match position {
            Some(position) => position,
            None => {
                let resolved: Result<Box<dyn DirectiveProcessor>, String> =
                    if processor_name.eq_ignore_ascii_case(REQUIRES_PROVIDES_PROCESSOR) {
                        Ok(Box::new(SessionParameterGenerator::processor()))
                    } else {
                        host.resolve_directive_processor(&processor_name)
                    };
                let mut processor = match resolved {
                    Ok(processor) => processor,
                    Err(message) => {
                        diagnostics.error("TT2001", message, Some(location));
                        continue;
                    }
                };
                if let Err(err) = processor.start_processing_run() {
                    diagnostics.error("TT2002", err.to_string(), Some(location));
                    continue;
                }
                debug!("directive processor '{}' started", processor.friendly_name());
                active.push(ActiveProcessor {
                    name: processor_name,
                    processor,
                });
                active.len() - 1
            }
        };

        match active[position].processor.process_directive(host, directive) {
            Ok(fragment) => {
                code.per_occurrence.insert(index, fragment);
            }
            Err(err) => diagnostics.error("TT2002", err.to_string(), Some(location)),
        }
    }

    for entry in &mut active {
        entry.processor.finish_processing_run();
        let location = Location::new(root, -1, -1);
        match entry.processor.pre_initialization_code() {
            Ok(fragment) => code.pre_initialization.push_str(&fragment),
            Err(err) => diagnostics.error("TT2002", err.to_string(), Some(location.clone())),
        }
        match entry.processor.post_initialization_code() {
            Ok(fragment) => code.post_initialization.push_str(&fragment),
            Err(err) => diagnostics.error("TT2002", err.to_string(), Some(location)),
        }
        code.references.extend(entry.processor.references());
        code.imports.extend(entry.processor.imports());
    }
    code
}

fn attribute_to_root(location: &Location, root: Option<&str>) -> Location {
    match (&location.file_name, root) {
        (None, Some(root)) => location.with_file(root),
        _ => location.clone(),
    }
}

/// Messages inside the generated unit are moved to template coordinates.
/// Anything else is attributed to the template itself.
fn map_compiler_message(
    message: &CompilerMessage,
    results: &CompilerResults,
    unit: &GeneratedUnit,
    root: Option<&str>,
) -> Diagnostic {
    let severity = if message.is_warning {
        Severity::Warning
    } else {
        Severity::Error
    };
    let code = if message.code.is_empty() {
        "TT3000".to_string()
    } else {
        message.code.clone()
    };
    let in_unit = message.file.as_deref().is_some_and(|file| {
        Path::new(file).file_name().is_some() && Path::new(file).file_name() == results.source_path.file_name()
    });
    let mapped = if in_unit && message.line > 0 {
        unit.line_map
            .map(message.line, message.column)
            .map(|location| attribute_to_root(&location, root))
    } else {
        None
    };
    let (location, text) = match mapped {
        Some(location) => (location, message.message.clone()),
        None if in_unit && message.line > 0 => (
            Location::new(root, -1, -1),
            format!("{} (generated line {})", message.message, message.line),
        ),
        None => (Location::new(root, -1, -1), message.message.clone()),
    };
    Diagnostic {
        severity,
        code,
        message: text,
        location: Some(location),
    }
}
