use std::collections::BTreeMap;

use crate::diagnostics::Diagnostic;
use crate::directives::DirectiveProcessor;

/// Text of an include file together with the canonical name it was found
/// under. The canonical name becomes the file identifier of its segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeText {
    pub content: String,
    pub resolved_name: String,
}

/// Lookup key for directive-processor parameters. The global key
/// `(None, None, name)` is the fallback for any processor and directive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParameterKey {
    pub processor: Option<String>,
    pub directive_id: Option<String>,
    pub name: String,
}

impl ParameterKey {
    pub fn new(processor: Option<&str>, directive_id: Option<&str>, name: &str) -> Self {
        Self {
            processor: processor.map(str::to_string),
            directive_id: directive_id.map(str::to_string),
            name: name.to_string(),
        }
    }

    pub fn global(name: &str) -> Self {
        Self::new(None, None, name)
    }

    pub fn is_global(&self) -> bool {
        self.processor.is_none() && self.directive_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputEncoding {
    #[default]
    Utf8,
    Utf8Bom,
    Ascii,
}

impl OutputEncoding {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "utf-8" | "utf8" => Some(OutputEncoding::Utf8),
            "utf-8-bom" | "utf8bom" | "utf-8bom" => Some(OutputEncoding::Utf8Bom),
            "ascii" | "us-ascii" => Some(OutputEncoding::Ascii),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            OutputEncoding::Utf8 => "utf-8",
            OutputEncoding::Utf8Bom => "utf-8-bom",
            OutputEncoding::Ascii => "ascii",
        }
    }

    /// Non-ASCII characters become `?` under the ASCII encoding.
    pub fn encode(self, text: &str) -> Vec<u8> {
        match self {
            OutputEncoding::Utf8 => text.as_bytes().to_vec(),
            OutputEncoding::Utf8Bom => {
                let mut bytes = Vec::with_capacity(text.len() + 3);
                bytes.extend_from_slice(&[0xEF, 0xBB, 0xBF]);
                bytes.extend_from_slice(text.as_bytes());
                bytes
            }
            OutputEncoding::Ascii => text
                .chars()
                .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
                .collect(),
        }
    }
}

/// Callbacks the engine needs from the surrounding application.
///
/// Only `template_file` and `log_errors` are mandatory; the remaining
/// callbacks default to "nothing configured".
pub trait TemplatingHost {
    /// Identifier of the template being processed, used in diagnostics.
    fn template_file(&self) -> Option<&str>;

    fn log_errors(&mut self, diagnostics: &[Diagnostic]);

    /// Reference modules every generated unit is linked against.
    fn standard_references(&self) -> Vec<String> {
        Vec::new()
    }

    /// Paths brought into scope in every generated unit.
    fn standard_imports(&self) -> Vec<String> {
        Vec::new()
    }

    fn load_include_text(&self, _request: &str) -> Option<IncludeText> {
        None
    }

    fn resolve_assembly_reference(&self, name: &str) -> String {
        name.to_string()
    }

    fn resolve_parameter_value(
        &self,
        _directive_id: Option<&str>,
        _processor: Option<&str>,
        _parameter: &str,
    ) -> Option<String> {
        None
    }

    fn resolve_directive_processor(
        &self,
        processor_name: &str,
    ) -> Result<Box<dyn DirectiveProcessor>, String> {
        Err(format!("directive processor '{processor_name}' is not registered"))
    }

    fn resolve_path(&self, path: &str) -> String {
        path.to_string()
    }

    /// Values handed to the compiled module as its session.
    fn session_parameters(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn set_file_extension(&mut self, _extension: &str) {}

    fn set_output_encoding(&mut self, _encoding: OutputEncoding) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_names_are_case_insensitive() {
        assert_eq!(OutputEncoding::from_name("UTF-8"), Some(OutputEncoding::Utf8));
        assert_eq!(OutputEncoding::from_name("utf-8-BOM"), Some(OutputEncoding::Utf8Bom));
        assert_eq!(OutputEncoding::from_name("Ascii"), Some(OutputEncoding::Ascii));
        assert_eq!(OutputEncoding::from_name("latin1"), None);
    }

    #[test]
    fn encodings_produce_expected_bytes() {
        assert_eq!(OutputEncoding::Utf8Bom.encode("a"), vec![0xEF, 0xBB, 0xBF, b'a']);
        assert_eq!(OutputEncoding::Ascii.encode("añb"), b"a?b".to_vec());
        assert_eq!(OutputEncoding::Utf8.encode("ñ"), "ñ".as_bytes().to_vec());
    }
}
