use super::*;
use crate::diagnostics::Diagnostic;
use crate::host::IncludeText;
use std::collections::HashMap;

struct MemoryHost {
    file: String,
    files: HashMap<String, String>,
}

impl MemoryHost {
    fn new(file: &str, files: &[(&str, &str)]) -> Self {
        Self {
            file: file.to_string(),
            files: files
                .iter()
                .map(|(name, text)| (name.to_string(), text.to_string()))
                .collect(),
        }
    }
}

impl TemplatingHost for MemoryHost {
    fn template_file(&self) -> Option<&str> {
        Some(&self.file)
    }

    fn log_errors(&mut self, _diagnostics: &[Diagnostic]) {}

    fn load_include_text(&self, request: &str) -> Option<IncludeText> {
        if let Some(content) = self.files.get(request) {
            return Some(IncludeText {
                content: content.clone(),
                resolved_name: request.to_string(),
            });
        }
        let content = std::fs::read_to_string(request).ok()?;
        Some(IncludeText {
            content,
            resolved_name: request.to_string(),
        })
    }
}

fn summary(template: &ParsedTemplate) -> Vec<String> {
    template
        .raw_segments()
        .iter()
        .map(|segment| match segment {
            Segment::Template(segment) => format!("{:?}:{}", segment.kind, segment.text),
            Segment::Directive(directive) => format!("@{}", directive.name),
        })
        .collect()
}

#[test]
fn directive_names_and_attributes_are_case_insensitive() {
    let host = MemoryHost::new("a.tt", &[]);
    let template = ParsedTemplate::from_text("<#@ Output Extension=\".cs\" #>", &host);
    assert!(template.errors().is_empty());
    let directive = template.directives().next().expect("directive");
    assert_eq!(directive.name, "Output");
    assert!(directive.is_named("output"));
    assert_eq!(directive.attribute("extension"), Some(".cs"));
    assert_eq!(directive.attribute("EXTENSION"), Some(".cs"));
}

#[test]
fn segments_keep_source_order() {
    let host = MemoryHost::new("a.tt", &[]);
    let template = ParsedTemplate::from_text(
        "A<#@ import namespace=\"std::fmt\" #>B<# let x = 1; #>C<#= x #>",
        &host,
    );
    assert_eq!(
        summary(&template),
        vec![
            "Content:A",
            "@import",
            "Content:B",
            "Block: let x = 1; ",
            "Content:C",
            "Expression: x ",
        ]
    );
}

#[test]
fn include_is_spliced_in_place() {
    let host = MemoryHost::new("A.tt", &[("B.txt", "from b<#+ fn b() {} #>")]);
    let template = ParsedTemplate::from_text(
        "before\n<#@ include file=\"B.txt\" #>\nafter<#+ fn a() {} #>",
        &host,
    );
    assert!(template.errors().is_empty(), "{:?}", template.errors());
    assert_eq!(
        summary(&template),
        vec![
            "Content:before\n",
            "Content:from b",
            "Content:after",
            "Helper: fn a() {} ",
            "Helper: fn b() {} ",
        ]
    );
    assert!(template.directives().next().is_none());
}

#[test]
fn include_resolves_relative_to_including_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("B.txt"), "included").expect("write include");
    let root = dir.path().join("A.tt");
    let host = MemoryHost::new(&root.to_string_lossy(), &[]);
    let template = ParsedTemplate::from_text("<#@ include file=\"B.txt\" #>", &host);
    assert!(template.errors().is_empty(), "{:?}", template.errors());
    assert_eq!(summary(&template), vec!["Content:included"]);
    let segment = template.content().next().expect("segment");
    assert!(segment
        .start_location
        .file_name
        .as_deref()
        .is_some_and(|name| name.ends_with("B.txt")));
}

#[test]
fn include_cycle_is_reported_instead_of_recursing() {
    let host = MemoryHost::new(
        "A.tt",
        &[
            ("A.tt", "<#@ include file=\"B.tt\" #>"),
            ("B.tt", "<#@ include file=\"A.tt\" #>"),
        ],
    );
    let template = ParsedTemplate::from_text("<#@ include file=\"B.tt\" #>", &host);
    let messages: Vec<&str> = template.errors().iter().map(|d| d.message.as_str()).collect();
    assert_eq!(messages, vec!["include cycle detected: 'A.tt'"]);
}

#[test]
fn include_errors_point_at_directive() {
    let host = MemoryHost::new("A.tt", &[]);
    let template = ParsedTemplate::from_text(
        "<#@ include file=\"missing.tt\" #>\n<#@ include file=\"x\" once=\"true\" #>",
        &host,
    );
    let errors: Vec<&Diagnostic> = template.errors().iter().collect();
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].message, "Could not resolve include file 'missing.tt'.");
    assert_eq!(errors[0].location.as_ref().map(|l| l.line), Some(1));
    assert_eq!(errors[1].message, "Unexpected attributes in include directive");
    assert_eq!(errors[1].location.as_ref().map(|l| l.line), Some(2));
}

#[test]
fn tokenizer_failure_is_recorded_with_root_file() {
    let host = MemoryHost::new("A.tt", &[]);
    let template = ParsedTemplate::from_text("text <# foo", &host);
    let error = template.errors().iter().next().expect("error");
    assert!(error.is_error());
    assert_eq!(error.message, "Unexpected end of file.");
    assert_eq!(
        error.location.as_ref().and_then(|l| l.file_name.as_deref()),
        Some("A.tt")
    );
}

#[test]
fn without_includes_keeps_include_directive() {
    let mut template = ParsedTemplate::new(None);
    let mut tokenizer = Tokenizer::new(None, "<#@ include file=\"B.txt\" #>");
    template.parse_without_includes(&mut tokenizer).expect("parse");
    assert_eq!(summary(&template), vec!["@include"]);
    assert_eq!(
        template.directives().next().and_then(|d| d.attribute("file")),
        Some("B.txt")
    );
}

#[test]
fn attribute_names_are_case_insensitive() {
    let mut directive = Directive::new("template", Location::empty());
    directive.set_attribute("language", "Rust");
    directive.set_attribute("LANGUAGE", "rust");
    assert_eq!(directive.attributes().len(), 1);
    assert_eq!(directive.attribute("Language"), Some("rust"));
    assert!(directive.has_attribute("language"));
}
