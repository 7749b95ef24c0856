pub mod codegen;
pub mod compiler;
pub mod diagnostics;
pub mod directives;
pub mod engine;
pub mod execution;
pub mod fs_util;
pub mod generator;
pub mod host;
pub mod sandbox;
pub mod scheduler;
pub mod settings;
pub mod template;
pub mod tokenizer;
pub mod transformation;
pub mod watch;

pub use compiler::{
    BackendCompiler, CompiledModule, CompilerParameters, CompilerResults, ProviderOptions,
    RustcCompiler,
};
pub use diagnostics::{render_diagnostics, Diagnostic, DiagnosticBag, Location, Severity};
pub use directives::{DirectiveProcessor, ProcessorError};
pub use engine::{PreprocessedTemplate, ProcessResult, RunStage, TemplatingEngine};
pub use execution::ExecutionHost;
pub use generator::{find_templates, TemplateGenerator, TransformationResult};
pub use host::{IncludeText, OutputEncoding, ParameterKey, TemplatingHost};
pub use sandbox::{SandboxRecycler, DEFAULT_MAX_USES};
pub use scheduler::DebounceScheduler;
pub use settings::{load_tool_settings, TemplateOptions, ToolSettings};
pub use template::{Directive, ParsedTemplate, Segment, SegmentKind, TemplateSegment};
pub use tokenizer::{ParseError, TokenState, Tokenizer};
pub use watch::TemplateWatcher;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid path: {0}")]
    InvalidPath(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),
    #[error("Directive processor error: {0}")]
    Processor(#[from] ProcessorError),
    #[error("Code generation error: {0}")]
    Codegen(String),
    #[error("{0}")]
    InvalidArgument(String),
    /// Diagnostics were already reported to the host.
    #[error("template run reported errors")]
    Diagnostics,
}
