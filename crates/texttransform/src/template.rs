use std::path::Path;

use log::debug;

use crate::diagnostics::{DiagnosticBag, Location};
use crate::host::TemplatingHost;
use crate::tokenizer::{ParseError, TokenState, Tokenizer};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    Block,
    Expression,
    Content,
    Helper,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSegment {
    pub kind: SegmentKind,
    pub text: String,
    pub start_location: Location,
    pub tag_start_location: Location,
    pub end_location: Location,
}

/// A `<#@ name attr="value" #>` directive. Name and attribute keys compare
/// case-insensitively; attribute order is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub name: String,
    attributes: Vec<(String, String)>,
    pub start_location: Location,
    pub tag_start_location: Location,
    pub end_location: Location,
}

impl Directive {
    pub fn new(name: &str, start_location: Location) -> Self {
        Self {
            name: name.to_string(),
            attributes: Vec::new(),
            tag_start_location: start_location.clone(),
            end_location: start_location.clone(),
            start_location,
        }
    }

    pub fn is_named(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
            .map(|(_, value)| value.as_str())
    }

    pub fn has_attribute(&self, key: &str) -> bool {
        self.attribute(key).is_some()
    }

    /// Later assignments of the same key replace the earlier value.
    pub fn set_attribute(&mut self, key: &str, value: &str) {
        match self
            .attributes
            .iter_mut()
            .find(|(name, _)| name.eq_ignore_ascii_case(key))
        {
            Some(slot) => slot.1 = value.to_string(),
            None => self.attributes.push((key.to_string(), value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Template(TemplateSegment),
    Directive(Directive),
}

impl Segment {
    pub fn start_location(&self) -> &Location {
        match self {
            Segment::Template(segment) => &segment.start_location,
            Segment::Directive(directive) => &directive.start_location,
        }
    }
}

/// Ordered directive/content model of one template with its includes
/// spliced in.
#[derive(Debug, Clone, Default)]
pub struct ParsedTemplate {
    root_file_name: Option<String>,
    raw_segments: Vec<Segment>,
    imported_helpers: Vec<Segment>,
    include_stack: Vec<String>,
    errors: DiagnosticBag,
}

impl ParsedTemplate {
    pub fn new(root_file_name: Option<&str>) -> Self {
        Self {
            root_file_name: root_file_name.map(str::to_string),
            include_stack: root_file_name.map(str::to_string).into_iter().collect(),
            ..Self::default()
        }
    }

    /// Parses `content` as the host's template, resolving includes through
    /// the host. Tokenizer failures are recorded as errors, never returned.
    pub fn from_text(content: &str, host: &dyn TemplatingHost) -> Self {
        let mut template = ParsedTemplate::new(host.template_file());
        let mut tokenizer = Tokenizer::new(host.template_file(), content);
        if let Err(err) = template.parse(host, &mut tokenizer) {
            template.record_parse_error(&err);
        }
        template
    }

    pub fn parse(
        &mut self,
        host: &dyn TemplatingHost,
        tokenizer: &mut Tokenizer,
    ) -> Result<(), ParseError> {
        self.parse_inner(Some(host), tokenizer, true, false)
    }

    /// Parses without a host. `include` directives are kept as ordinary
    /// directives.
    pub fn parse_without_includes(&mut self, tokenizer: &mut Tokenizer) -> Result<(), ParseError> {
        self.parse_inner(None, tokenizer, false, false)
    }

    pub fn root_file_name(&self) -> Option<&str> {
        self.root_file_name.as_deref()
    }

    pub fn raw_segments(&self) -> &[Segment] {
        &self.raw_segments
    }

    pub fn directives(&self) -> impl Iterator<Item = &Directive> {
        self.raw_segments.iter().filter_map(|segment| match segment {
            Segment::Directive(directive) => Some(directive),
            Segment::Template(_) => None,
        })
    }

    pub fn content(&self) -> impl Iterator<Item = &TemplateSegment> {
        self.raw_segments.iter().filter_map(|segment| match segment {
            Segment::Template(segment) => Some(segment),
            Segment::Directive(_) => None,
        })
    }

    pub fn errors(&self) -> &DiagnosticBag {
        &self.errors
    }

    pub fn into_errors(self) -> DiagnosticBag {
        self.errors
    }

    pub fn record_parse_error(&mut self, err: &ParseError) {
        self.log_error("TT1001", &err.message, &err.location);
    }

    /// Diagnostics without a file are attributed to the root template.
    pub fn log_error(&mut self, code: &str, message: &str, location: &Location) {
        let location = self.attribute_location(location);
        self.errors.error(code, message, Some(location));
    }

    pub fn log_warning(&mut self, code: &str, message: &str, location: &Location) {
        let location = self.attribute_location(location);
        self.errors.warning(code, message, Some(location));
    }

    fn attribute_location(&self, location: &Location) -> Location {
        if location.file_name.is_some() {
            return location.clone();
        }
        match &self.root_file_name {
            Some(root) => Location::empty().with_file(root),
            None => Location::empty(),
        }
    }

    fn parse_inner(
        &mut self,
        host: Option<&dyn TemplatingHost>,
        tokenizer: &mut Tokenizer,
        parse_includes: bool,
        is_import: bool,
    ) -> Result<(), ParseError> {
        let mut skip = false;
        loop {
            if !skip && !tokenizer.advance()? {
                break;
            }
            if tokenizer.state() == TokenState::Eof {
                break;
            }
            skip = false;
            let kind = match tokenizer.state() {
                TokenState::Content => SegmentKind::Content,
                TokenState::Block => SegmentKind::Block,
                TokenState::Expression => SegmentKind::Expression,
                TokenState::Helper => SegmentKind::Helper,
                TokenState::Directive => {
                    skip = self.parse_directive(host, tokenizer, parse_includes)?;
                    continue;
                }
                TokenState::DirectiveName | TokenState::DirectiveValue | TokenState::Eof => {
                    continue
                }
            };
            let text = tokenizer.value().unwrap_or_default();
            if text.is_empty() {
                continue;
            }
            let segment = Segment::Template(TemplateSegment {
                kind,
                text: text.to_string(),
                start_location: tokenizer.location().clone(),
                tag_start_location: tokenizer.tag_start_location().clone(),
                end_location: tokenizer.tag_end_location().clone(),
            });
            if is_import && kind == SegmentKind::Helper {
                self.imported_helpers.push(segment);
            } else {
                self.raw_segments.push(segment);
            }
        }

        if !is_import {
            self.raw_segments.append(&mut self.imported_helpers);
        }
        Ok(())
    }

    /// Consumes name/value pairs up to the end of the directive. Returns true
    /// when the tokenizer already sits on the token following the directive.
    fn parse_directive(
        &mut self,
        host: Option<&dyn TemplatingHost>,
        tokenizer: &mut Tokenizer,
        parse_includes: bool,
    ) -> Result<bool, ParseError> {
        let mut directive: Option<Directive> = None;
        let mut attribute_name: Option<String> = None;
        let mut skip = false;
        while !skip && tokenizer.advance()? {
            match tokenizer.state() {
                TokenState::DirectiveName => {
                    let value = tokenizer.value().unwrap_or_default();
                    if directive.is_none() {
                        let mut created = Directive::new(value, tokenizer.location().clone());
                        created.tag_start_location = tokenizer.tag_start_location().clone();
                        directive = Some(created);
                    } else {
                        attribute_name = Some(value.to_string());
                    }
                }
                TokenState::DirectiveValue => {
                    let value = tokenizer.value().unwrap_or_default();
                    match (attribute_name.take(), directive.as_mut()) {
                        (Some(name), Some(directive)) => directive.set_attribute(&name, value),
                        _ => self.log_error(
                            "TT1002",
                            "Directive value without name",
                            tokenizer.location(),
                        ),
                    }
                }
                TokenState::Directive => {
                    if let Some(directive) = directive.as_mut() {
                        directive.end_location = tokenizer.tag_end_location().clone();
                    }
                }
                _ => skip = true,
            }
        }

        let Some(directive) = directive else {
            return Ok(skip);
        };
        match host {
            Some(host) if parse_includes && directive.is_named("include") => {
                let directory = tokenizer
                    .location()
                    .file_name
                    .as_deref()
                    .and_then(|file| Path::new(file).parent())
                    .map(Path::to_path_buf);
                self.import(host, &directive, directory.as_deref())?;
            }
            _ => self.raw_segments.push(Segment::Directive(directive)),
        }
        Ok(skip)
    }

    fn import(
        &mut self,
        host: &dyn TemplatingHost,
        directive: &Directive,
        relative_to: Option<&Path>,
    ) -> Result<(), ParseError> {
        let file_name = match (directive.attributes().len(), directive.attribute("file")) {
            (1, Some(file)) => file.to_string(),
            _ => {
                self.log_error(
                    "TT1003",
                    "Unexpected attributes in include directive",
                    &directive.start_location,
                );
                return Ok(());
            }
        };

        let mut requested = file_name.clone();
        if let Some(directory) = relative_to {
            if !Path::new(&file_name).is_absolute() {
                let candidate = directory.join(&file_name);
                if candidate.is_file() {
                    let candidate = std::fs::canonicalize(&candidate).unwrap_or(candidate);
                    requested = candidate.to_string_lossy().into_owned();
                }
            }
        }

        let Some(include) = host.load_include_text(&requested) else {
            self.log_error(
                "TT1004",
                &format!("Could not resolve include file '{file_name}'."),
                &directive.start_location,
            );
            return Ok(());
        };

        if self.include_stack.iter().any(|active| active == &include.resolved_name) {
            self.log_error(
                "TT1005",
                &format!("include cycle detected: '{}'", include.resolved_name),
                &directive.start_location,
            );
            return Ok(());
        }

        debug!("including '{}'", include.resolved_name);
        self.include_stack.push(include.resolved_name.clone());
        let mut tokenizer = Tokenizer::new(Some(&include.resolved_name), &include.content);
        let result = self.parse_inner(Some(host), &mut tokenizer, true, true);
        self.include_stack.pop();
        result
    }
}
