use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::compiler::ProviderOptions;
use crate::diagnostics::{DiagnosticBag, Location};
use crate::directives::is_identifier;
use crate::host::OutputEncoding;
use crate::template::{Directive, ParsedTemplate};
use crate::TransformError;

pub const TOOL_SETTINGS_FILE: &str = "texttransform.toml";
pub const TEMPLATE_OPTIONS_SUFFIX: &str = ".settings.json";
pub const MIN_TRIGGER_DELAY_MS: u64 = 500;

/// Directive names the engine interprets itself.
pub const BUILT_IN_DIRECTIVES: &[&str] = &["template", "output", "import", "assembly", "parameter"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDeclaration {
    pub name: String,
    pub type_name: String,
    pub location: Location,
}

/// What the built-in directives of one template ask for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSettings {
    pub debug: bool,
    pub line_pragmas: bool,
    pub host_specific: bool,
    pub internal_visibility: bool,
    pub extension: Option<String>,
    pub encoding: Option<OutputEncoding>,
    pub imports: Vec<String>,
    pub references: Vec<String>,
    pub parameters: Vec<ParameterDeclaration>,
}

impl Default for TemplateSettings {
    fn default() -> Self {
        Self {
            debug: false,
            line_pragmas: true,
            host_specific: false,
            internal_visibility: false,
            extension: None,
            encoding: None,
            imports: Vec::new(),
            references: Vec::new(),
            parameters: Vec::new(),
        }
    }
}

/// Attributes that route a directive to a processor rather than configure it.
const ROUTING_ATTRIBUTES: &[&str] = &["processor", "requires", "provides"];

impl TemplateSettings {
    pub fn from_template(template: &ParsedTemplate, diagnostics: &mut DiagnosticBag) -> Self {
        let mut settings = TemplateSettings::default();
        for directive in template.directives() {
            let name = directive.name.to_ascii_lowercase();
            match name.as_str() {
                "template" => settings.apply_template(directive, diagnostics),
                "output" => settings.apply_output(directive, diagnostics),
                "import" => {
                    if let Some(namespace) = required(directive, "namespace", diagnostics) {
                        settings.imports.push(namespace);
                    }
                }
                "assembly" => {
                    if let Some(reference) = required(directive, "name", diagnostics) {
                        settings.references.push(reference);
                    }
                }
                "parameter" => settings.apply_parameter(directive, diagnostics),
                _ => {}
            }
        }
        settings
    }

    fn apply_template(&mut self, directive: &Directive, diagnostics: &mut DiagnosticBag) {
        for (key, value) in directive.attributes() {
            let location = Some(directive.start_location.clone());
            match key.to_ascii_lowercase().as_str() {
                "language" => {
                    if !value.trim().eq_ignore_ascii_case("rust") {
                        diagnostics.error(
                            "TT2004",
                            format!("template language '{value}' is not supported; templates embed Rust"),
                            location,
                        );
                    }
                }
                "debug" => self.debug = parse_bool(key, value, self.debug, directive, diagnostics),
                "linepragmas" => {
                    self.line_pragmas =
                        parse_bool(key, value, self.line_pragmas, directive, diagnostics)
                }
                "hostspecific" => {
                    self.host_specific = value.eq_ignore_ascii_case("truefrombase")
                        || parse_bool(key, value, self.host_specific, directive, diagnostics)
                }
                "visibility" => match value.to_ascii_lowercase().as_str() {
                    "public" => self.internal_visibility = false,
                    "internal" => self.internal_visibility = true,
                    _ => diagnostics.warning(
                        "TT2003",
                        format!("unknown visibility '{value}'; expected public or internal"),
                        location,
                    ),
                },
                "inherits" => diagnostics.warning(
                    "TT2005",
                    format!("inherits=\"{value}\" is not supported and was ignored"),
                    location,
                ),
                other if ROUTING_ATTRIBUTES.contains(&other) => {}
                _ => diagnostics.warning(
                    "TT2003",
                    format!("unknown attribute '{key}' in template directive"),
                    location,
                ),
            }
        }
    }

    fn apply_output(&mut self, directive: &Directive, diagnostics: &mut DiagnosticBag) {
        if let Some(extension) = directive.attribute("extension") {
            self.extension = Some(extension.to_string());
        }
        if let Some(encoding) = directive.attribute("encoding") {
            match OutputEncoding::from_name(encoding) {
                Some(encoding) => self.encoding = Some(encoding),
                None => diagnostics.warning(
                    "TT2003",
                    format!("unknown output encoding '{encoding}'; utf-8 is used"),
                    Some(directive.start_location.clone()),
                ),
            }
        }
    }

    fn apply_parameter(&mut self, directive: &Directive, diagnostics: &mut DiagnosticBag) {
        let Some(name) = required(directive, "name", diagnostics) else {
            return;
        };
        if !is_identifier(&name) {
            diagnostics.error(
                "TT2006",
                format!("parameter name '{name}' is not a valid identifier"),
                Some(directive.start_location.clone()),
            );
            return;
        }
        let type_name = directive
            .attribute("type")
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or("String")
            .to_string();
        self.parameters.push(ParameterDeclaration {
            name,
            type_name,
            location: directive.start_location.clone(),
        });
    }
}

pub fn is_built_in_directive(directive: &Directive) -> bool {
    BUILT_IN_DIRECTIVES.iter().any(|name| directive.is_named(name))
}

fn required(directive: &Directive, key: &str, diagnostics: &mut DiagnosticBag) -> Option<String> {
    match directive.attribute(key).map(str::trim) {
        Some(value) if !value.is_empty() => Some(value.to_string()),
        _ => {
            diagnostics.error(
                "TT2007",
                format!(
                    "{} directive requires a '{}' attribute",
                    directive.name.to_ascii_lowercase(),
                    key
                ),
                Some(directive.start_location.clone()),
            );
            None
        }
    }
}

fn parse_bool(
    key: &str,
    value: &str,
    current: bool,
    directive: &Directive,
    diagnostics: &mut DiagnosticBag,
) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" => true,
        "false" => false,
        _ => {
            diagnostics.warning(
                "TT2003",
                format!("attribute '{key}' expects true or false, got '{value}'"),
                Some(directive.start_location.clone()),
            );
            current
        }
    }
}

/// Tool-wide settings, read from `texttransform.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default)]
    pub include_paths: Vec<PathBuf>,
    #[serde(default)]
    pub exclude_paths: Vec<PathBuf>,
    #[serde(default)]
    pub reference_paths: Vec<PathBuf>,
    #[serde(default)]
    pub references: Vec<String>,
    #[serde(default)]
    pub imports: Vec<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub compiler: CompilerSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilerSettings {
    #[serde(default = "default_compiler_path")]
    pub path: String,
    #[serde(default = "default_edition")]
    pub edition: String,
    #[serde(default)]
    pub warn_as_error: bool,
    #[serde(default = "default_server_time_to_live_secs")]
    pub server_time_to_live_secs: u64,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Provider-specific options passed through untouched.
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

impl Default for CompilerSettings {
    fn default() -> Self {
        Self {
            path: default_compiler_path(),
            edition: default_edition(),
            warn_as_error: false,
            server_time_to_live_secs: default_server_time_to_live_secs(),
            timeout_secs: None,
            extra_args: Vec::new(),
            options: BTreeMap::new(),
        }
    }
}

fn default_compiler_path() -> String {
    "rustc".to_string()
}

fn default_edition() -> String {
    "2021".to_string()
}

fn default_server_time_to_live_secs() -> u64 {
    60
}

impl ToolSettings {
    pub fn provider_options(&self) -> ProviderOptions {
        let compiler = &self.compiler;
        let mut options = compiler.options.clone();
        options
            .entry("edition".to_string())
            .or_insert_with(|| compiler.edition.clone());
        if !compiler.extra_args.is_empty() {
            options.insert("extra-args".to_string(), compiler.extra_args.join("\n"));
        }
        ProviderOptions {
            compiler_full_path: PathBuf::from(&compiler.path),
            compiler_server_time_to_live: Duration::from_secs(compiler.server_time_to_live_secs),
            compiler_timeout: compiler.timeout_secs.map(Duration::from_secs),
            warn_as_error: compiler.warn_as_error,
            all_options: options,
        }
    }

    /// True when `path` lies under one of the excluded directories.
    pub fn is_excluded(&self, path: &Path) -> bool {
        self.exclude_paths.iter().any(|excluded| path.starts_with(excluded))
    }
}

pub fn read_tool_settings(path: &Path) -> Result<ToolSettings, TransformError> {
    let text = std::fs::read_to_string(path)?;
    toml::from_str(&text)
        .map_err(|err| TransformError::Config(format!("failed to parse {}: {err}", path.display())))
}

/// Reads `texttransform.toml` from `dir` when present.
pub fn load_tool_settings(dir: &Path) -> Result<ToolSettings, TransformError> {
    let path = dir.join(TOOL_SETTINGS_FILE);
    if !path.is_file() {
        return Ok(ToolSettings::default());
    }
    read_tool_settings(&path)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationOutput {
    #[default]
    Text,
    TextGenerator,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationTriggers {
    #[serde(default)]
    pub code_compilation: bool,
    #[serde(default)]
    pub asset_changes: bool,
}

/// Per-template settings stored next to the template as
/// `<template>.settings.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateOptions {
    #[serde(default)]
    pub generation_triggers: GenerationTriggers,
    #[serde(default = "default_trigger_delay_ms")]
    pub trigger_delay_ms: u64,
    #[serde(default)]
    pub output_type: GenerationOutput,
    #[serde(default)]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub watched_paths: Vec<PathBuf>,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            generation_triggers: GenerationTriggers::default(),
            trigger_delay_ms: default_trigger_delay_ms(),
            output_type: GenerationOutput::default(),
            output_path: None,
            watched_paths: Vec::new(),
        }
    }
}

fn default_trigger_delay_ms() -> u64 {
    MIN_TRIGGER_DELAY_MS
}

impl TemplateOptions {
    pub fn trigger_delay(&self) -> Duration {
        Duration::from_millis(self.trigger_delay_ms)
    }

    fn validate(mut self) -> Self {
        self.trigger_delay_ms = self.trigger_delay_ms.max(MIN_TRIGGER_DELAY_MS);
        self
    }
}

pub fn template_options_path(template: &Path) -> PathBuf {
    let mut name = template.as_os_str().to_os_string();
    name.push(TEMPLATE_OPTIONS_SUFFIX);
    PathBuf::from(name)
}

/// Loads the sidecar settings of `template`, or defaults when it has none.
pub fn load_template_options(template: &Path) -> Result<TemplateOptions, TransformError> {
    let path = template_options_path(template);
    if !path.is_file() {
        return Ok(TemplateOptions::default());
    }
    let text = std::fs::read_to_string(&path)?;
    let options: TemplateOptions = serde_json::from_str(&text)
        .map_err(|err| TransformError::Config(format!("failed to parse {}: {err}", path.display())))?;
    Ok(options.validate())
}
