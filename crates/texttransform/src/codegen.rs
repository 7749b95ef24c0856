use std::collections::BTreeMap;

use log::debug;

use crate::diagnostics::Location;
use crate::directives::is_identifier;
use crate::settings::TemplateSettings;
use crate::template::{ParsedTemplate, Segment, SegmentKind, TemplateSegment};
use crate::TransformError;

/// Source of the runtime module spliced into every unit.
pub const RUNTIME_SOURCE: &str = include_str!("transformation.rs");
pub const RUNTIME_MODULE: &str = "texttransform_runtime";
pub const DEFAULT_CLASS_NAME: &str = "GeneratedTextTransformation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitKind {
    /// A program with `main`, run by the execution host.
    Executable,
    /// A standalone module for callers that compile it themselves.
    Preprocessed { class_name: String, namespace: String },
}

/// Code contributed by directive processors for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectiveCode {
    pub pre_initialization: String,
    pub post_initialization: String,
    /// Keyed by the index of the directive in the template's raw segments.
    pub per_occurrence: BTreeMap<usize, String>,
    pub imports: Vec<String>,
    pub references: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineMapEntry {
    pub generated_start: u32,
    pub generated_end: u32,
    pub location: Location,
    /// Verbatim template text: positions inside it shift with the generated
    /// line and column.
    pub verbatim: bool,
}

/// Maps 1-based generated-unit lines back to template locations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineMap {
    entries: Vec<LineMapEntry>,
}

impl LineMap {
    pub fn entries(&self) -> &[LineMapEntry] {
        &self.entries
    }

    pub fn map(&self, line: u32, column: u32) -> Option<Location> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.generated_start <= line && line <= entry.generated_end)?;
        if !entry.verbatim {
            return Some(entry.location.clone());
        }
        let offset = (line - entry.generated_start) as i32;
        let column = column.max(1) as i32;
        let location = &entry.location;
        Some(if offset == 0 {
            Location {
                file_name: location.file_name.clone(),
                line: location.line,
                column: location.column + column - 1,
            }
        } else {
            Location {
                file_name: location.file_name.clone(),
                line: location.line + offset,
                column,
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedUnit {
    pub source: String,
    pub line_map: LineMap,
    pub class_name: String,
}

/// Everything the generator reads for one unit.
pub struct UnitInput<'a> {
    pub template: &'a ParsedTemplate,
    pub settings: &'a TemplateSettings,
    pub directive_code: &'a DirectiveCode,
    /// Standard imports of the host followed by template imports.
    pub imports: &'a [String],
    pub template_file: Option<&'a str>,
}

struct UnitWriter {
    source: String,
    lines: u32,
    line_map: LineMap,
    line_pragmas: bool,
}

impl UnitWriter {
    fn new(line_pragmas: bool) -> Self {
        Self {
            source: String::new(),
            lines: 0,
            line_map: LineMap::default(),
            line_pragmas,
        }
    }

    fn line(&mut self, text: &str) {
        self.source.push_str(text);
        self.source.push('\n');
        self.lines += text.matches('\n').count() as u32 + 1;
    }

    /// Writes `text` starting on a fresh line and records where it came from.
    fn mapped(&mut self, text: &str, location: &Location, verbatim: bool) {
        if self.line_pragmas && location.line >= 1 {
            self.line(&format!(
                "// #line {} {:?}",
                location.line,
                location.file_name.as_deref().unwrap_or("")
            ));
        }
        let start = self.lines + 1;
        self.line(text.strip_suffix('\n').unwrap_or(text));
        self.line_map.entries.push(LineMapEntry {
            generated_start: start,
            generated_end: self.lines,
            location: location.clone(),
            verbatim,
        });
    }
}

pub fn generate_unit(input: &UnitInput<'_>, kind: &UnitKind) -> Result<GeneratedUnit, TransformError> {
    let (class_name, namespace) = match kind {
        UnitKind::Executable => (DEFAULT_CLASS_NAME.to_string(), Vec::new()),
        UnitKind::Preprocessed {
            class_name,
            namespace,
        } => (class_name.clone(), namespace_path(namespace)?),
    };
    if !is_identifier(&class_name) {
        return Err(TransformError::InvalidArgument(format!(
            "class name '{class_name}' is not a valid identifier"
        )));
    }

    let visibility = match (kind, input.settings.internal_visibility) {
        (UnitKind::Preprocessed { .. }, true) => "pub(crate) ",
        _ => "pub ",
    };
    let mut out = UnitWriter::new(input.settings.line_pragmas);
    out.line(&format!(
        "// Generated by texttransform from {}.",
        input.template_file.unwrap_or("<template>")
    ));
    if *kind == UnitKind::Executable {
        out.line("#![allow(dead_code, unused_imports, unused_mut, unused_variables, non_snake_case)]");
    }
    for module in &namespace {
        out.line(&format!("{visibility}mod {module} {{"));
    }

    out.line("#[allow(dead_code)]");
    out.line(&format!("pub mod {RUNTIME_MODULE} {{"));
    out.line(runtime_items());
    out.line("}");
    out.line("");

    let mut imports: Vec<&str> = Vec::new();
    for import in input.imports.iter().chain(&input.directive_code.imports) {
        if !imports.contains(&import.as_str()) {
            imports.push(import);
        }
    }
    for import in imports {
        out.line(&format!("use {};", import.trim_end_matches(';')));
    }
    out.line("");

    emit_struct(&mut out, &class_name, visibility, input);
    emit_template_impl(&mut out, &class_name, input);
    emit_helpers(&mut out, &class_name, input.template);

    if *kind == UnitKind::Executable {
        out.line("fn main() {");
        out.line(&format!(
            "    {RUNTIME_MODULE}::run_as_process({class_name}::new())"
        ));
        out.line("}");
    }
    for _ in &namespace {
        out.line("}");
    }

    debug!(
        "generated unit '{}' ({} lines, {} mapped spans)",
        class_name,
        out.lines,
        out.line_map.entries.len()
    );
    Ok(GeneratedUnit {
        source: out.source,
        line_map: out.line_map,
        class_name,
    })
}

/// The runtime without its unit tests.
fn runtime_items() -> &'static str {
    let items = match RUNTIME_SOURCE.find("\n#[cfg(test)]") {
        Some(end) => &RUNTIME_SOURCE[..end],
        None => RUNTIME_SOURCE,
    };
    items.trim_end()
}

/// `a.b` and `a::b` both become nested modules `a` / `b`.
fn namespace_path(namespace: &str) -> Result<Vec<String>, TransformError> {
    let namespace = namespace.trim();
    if namespace.is_empty() {
        return Ok(Vec::new());
    }
    namespace
        .split("::")
        .flat_map(|part| part.split('.'))
        .map(|part| {
            let part = part.trim();
            if is_identifier(part) {
                Ok(part.to_string())
            } else {
                Err(TransformError::Codegen(format!(
                    "namespace segment '{part}' is not a valid module name"
                )))
            }
        })
        .collect()
}

fn emit_struct(out: &mut UnitWriter, class_name: &str, visibility: &str, input: &UnitInput<'_>) {
    let base = format!("{RUNTIME_MODULE}::TextTransformation");
    out.line(&format!("{visibility}struct {class_name} {{"));
    out.line(&format!("    base: {base},"));
    out.line("}");
    out.line("");
    out.line(&format!("impl {class_name} {{"));
    out.line("    pub fn new() -> Self {");
    out.line(&format!("        let mut base = {base}::new();"));
    if input.settings.host_specific {
        if let Some(file) = input.template_file {
            out.line(&format!("        base.set_template_file({file:?});"));
        }
    }
    out.line("        Self { base }");
    out.line("    }");
    out.line("}");
    out.line("");
    out.line(&format!("impl Default for {class_name} {{"));
    out.line("    fn default() -> Self {");
    out.line("        Self::new()");
    out.line("    }");
    out.line("}");
    out.line("");
    out.line(&format!("impl ::std::ops::Deref for {class_name} {{"));
    out.line(&format!("    type Target = {base};"));
    out.line("    fn deref(&self) -> &Self::Target {");
    out.line("        &self.base");
    out.line("    }");
    out.line("}");
    out.line("");
    out.line(&format!("impl ::std::ops::DerefMut for {class_name} {{"));
    out.line("    fn deref_mut(&mut self) -> &mut Self::Target {");
    out.line("        &mut self.base");
    out.line("    }");
    out.line("}");
    out.line("");
}

fn emit_template_impl(out: &mut UnitWriter, class_name: &str, input: &UnitInput<'_>) {
    let code = input.directive_code;
    out.line(&format!(
        "impl {RUNTIME_MODULE}::TextTemplate for {class_name} {{"
    ));
    out.line(&format!(
        "    fn transformation(&mut self) -> &mut {RUNTIME_MODULE}::TextTransformation {{"
    ));
    out.line("        &mut self.base");
    out.line("    }");
    out.line("");
    out.line("    fn initialize(&mut self) {");
    for chunk in [&code.pre_initialization, &code.post_initialization] {
        if !chunk.trim().is_empty() {
            out.line(chunk.trim_end());
        }
    }
    out.line("    }");
    out.line("");
    out.line("    fn transform_text(&mut self) -> String {");
    for parameter in &input.settings.parameters {
        out.mapped(
            &format!(
                "let {name}: {ty} = self.base.parameter_or_default::<{ty}>({name:?});",
                name = parameter.name,
                ty = parameter.type_name
            ),
            &parameter.location,
            false,
        );
    }
    for (index, segment) in input.template.raw_segments().iter().enumerate() {
        match segment {
            Segment::Template(segment) => emit_segment(out, segment),
            Segment::Directive(directive) => {
                if let Some(code) = code.per_occurrence.get(&index) {
                    if !code.trim().is_empty() {
                        out.mapped(code, &directive.start_location, false);
                    }
                }
            }
        }
    }
    out.line("        self.base.take_generated_text()");
    out.line("    }");
    out.line("}");
    out.line("");
}

fn emit_segment(out: &mut UnitWriter, segment: &TemplateSegment) {
    match segment.kind {
        SegmentKind::Content => out.mapped(
            &format!("self.base.write({:?});", segment.text),
            &segment.start_location,
            false,
        ),
        SegmentKind::Expression => {
            out.line("{");
            out.line("let texttransform_value = ::std::string::ToString::to_string(&(");
            out.mapped(&segment.text, &segment.start_location, true);
            out.line("));");
            out.line("self.base.write(&texttransform_value);");
            out.line("}");
        }
        SegmentKind::Block => out.mapped(&segment.text, &segment.start_location, true),
        SegmentKind::Helper => {}
    }
}

/// Helper segments become one trailing `impl` block, after every other
/// segment and in discovery order.
fn emit_helpers(out: &mut UnitWriter, class_name: &str, template: &ParsedTemplate) {
    let helpers: Vec<&TemplateSegment> = template
        .content()
        .filter(|segment| segment.kind == SegmentKind::Helper)
        .collect();
    if helpers.is_empty() {
        return;
    }
    out.line(&format!("impl {class_name} {{"));
    for helper in helpers {
        out.mapped(&helper.text, &helper.start_location, true);
    }
    out.line("}");
    out.line("");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{Diagnostic, DiagnosticBag};
    use crate::host::TemplatingHost;

    struct FileHost;

    impl TemplatingHost for FileHost {
        fn template_file(&self) -> Option<&str> {
            Some("t.tt")
        }

        fn log_errors(&mut self, _diagnostics: &[Diagnostic]) {}
    }

    fn generate(source: &str, kind: &UnitKind) -> (ParsedTemplate, GeneratedUnit) {
        let template = ParsedTemplate::from_text(source, &FileHost);
        assert!(template.errors().is_empty());
        let mut diagnostics = DiagnosticBag::new();
        let settings = TemplateSettings::from_template(&template, &mut diagnostics);
        let code = DirectiveCode::default();
        let unit = generate_unit(
            &UnitInput {
                template: &template,
                settings: &settings,
                directive_code: &code,
                imports: &settings.imports,
                template_file: Some("t.tt"),
            },
            kind,
        )
        .expect("generate");
        (template, unit)
    }

    #[test]
    fn helper_is_emitted_after_all_other_code() {
        let (_, unit) = generate(
            "first<#+ fn helper(&self) -> u32 { 1 } #>second<# let x = 2; #>",
            &UnitKind::Executable,
        );
        let helper = unit.source.find("fn helper").expect("helper emitted");
        let second = unit.source.find("\"second\"").expect("content emitted");
        let block = unit.source.find("let x = 2;").expect("block emitted");
        let take = unit
            .source
            .rfind("self.base.take_generated_text()")
            .expect("body end");
        assert!(second < take && block < take && take < helper);
        assert!(unit.source.contains("fn main()"));
    }

    #[test]
    fn content_is_written_as_an_escaped_literal() {
        let (_, unit) = generate("say \"hi\"\\n\n", &UnitKind::Executable);
        assert!(unit
            .source
            .contains("self.base.write(\"say \\\"hi\\\"\\\\n\\n\");"));
    }

    #[test]
    fn block_lines_map_back_to_template_coordinates() {
        let (_, unit) = generate("ab<# let y =\n    oops; #>", &UnitKind::Executable);
        let first = unit
            .source
            .lines()
            .position(|line| line.contains(" let y ="))
            .expect("block line") as u32
            + 1;
        assert_eq!(
            unit.line_map.map(first, 2),
            Some(Location::new(Some("t.tt"), 1, 6))
        );
        assert_eq!(
            unit.line_map.map(first + 1, 5),
            Some(Location::new(Some("t.tt"), 2, 5))
        );
        assert_eq!(unit.line_map.map(1, 1), None);
    }

    #[test]
    fn line_pragmas_can_be_turned_off() {
        let (_, with) = generate("x", &UnitKind::Executable);
        assert!(with.source.contains("// #line 1 \"t.tt\""));
        let (_, without) = generate("<#@ template linePragmas=\"false\" #>x", &UnitKind::Executable);
        assert!(!without.source.contains("// #line"));
    }

    #[test]
    fn parameters_become_typed_locals() {
        let (_, unit) = generate("<#@ parameter name=\"count\" type=\"u32\" #><#= count #>", &UnitKind::Executable);
        assert!(unit
            .source
            .contains("let count: u32 = self.base.parameter_or_default::<u32>(\"count\");"));
    }

    #[test]
    fn preprocessed_unit_is_wrapped_in_namespace_modules() {
        let (_, unit) = generate(
            "<#@ template visibility=\"internal\" #>x",
            &UnitKind::Preprocessed {
                class_name: "Report".to_string(),
                namespace: "reports.daily".to_string(),
            },
        );
        assert_eq!(unit.class_name, "Report");
        assert!(unit.source.contains("pub(crate) mod reports {"));
        assert!(unit.source.contains("pub(crate) mod daily {"));
        assert!(unit.source.contains("pub(crate) struct Report {"));
        assert!(!unit.source.contains("fn main()"));
        assert!(!unit.source.contains("#[cfg(test)]"));
    }

    #[test]
    fn invalid_class_name_is_rejected() {
        let template = ParsedTemplate::from_text("x", &FileHost);
        let settings = TemplateSettings::default();
        let code = DirectiveCode::default();
        let result = generate_unit(
            &UnitInput {
                template: &template,
                settings: &settings,
                directive_code: &code,
                imports: &[],
                template_file: None,
            },
            &UnitKind::Preprocessed {
                class_name: "not valid".to_string(),
                namespace: String::new(),
            },
        );
        assert!(matches!(result, Err(TransformError::InvalidArgument(_))));
    }
}
