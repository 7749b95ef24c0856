use serde::Serialize;
use std::fmt;

/// A position in template source. Lines and columns are 1-based; the empty
/// location (`-1`, `-1`, no file) marks diagnostics raised by the host itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Location {
    pub file_name: Option<String>,
    pub line: i32,
    pub column: i32,
}

impl Location {
    pub fn new(file_name: Option<&str>, line: i32, column: i32) -> Self {
        Self {
            file_name: file_name.map(str::to_string),
            line,
            column,
        }
    }

    pub fn empty() -> Self {
        Self {
            file_name: None,
            line: -1,
            column: -1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.line == -1 && self.column == -1 && self.file_name.is_none()
    }

    pub fn add_line(&self) -> Self {
        Self {
            file_name: self.file_name.clone(),
            line: self.line + 1,
            column: 1,
        }
    }

    pub fn add_col(&self) -> Self {
        self.add_cols(1)
    }

    pub fn add_cols(&self, count: i32) -> Self {
        Self {
            file_name: self.file_name.clone(),
            line: self.line,
            column: self.column + count,
        }
    }

    pub fn with_file(&self, file_name: &str) -> Self {
        Self {
            file_name: Some(file_name.to_string()),
            line: self.line,
            column: self.column,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{} ({},{})]",
            self.file_name.as_deref().unwrap_or(""),
            self.line,
            self.column
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    pub location: Option<Location>,
}

impl Diagnostic {
    pub fn error(code: &str, message: impl Into<String>, location: Option<Location>) -> Self {
        Self {
            severity: Severity::Error,
            code: code.to_string(),
            message: message.into(),
            location,
        }
    }

    pub fn warning(code: &str, message: impl Into<String>, location: Option<Location>) -> Self {
        Self {
            severity: Severity::Warning,
            code: code.to_string(),
            message: message.into(),
            location,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Diagnostics accumulated over one run. A run succeeded iff the bag holds no
/// error-severity entry.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiagnosticBag {
    items: Vec<Diagnostic>,
}

impl DiagnosticBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, diagnostic: Diagnostic) {
        self.items.push(diagnostic);
    }

    pub fn error(&mut self, code: &str, message: impl Into<String>, location: Option<Location>) {
        self.push(Diagnostic::error(code, message, location));
    }

    pub fn warning(&mut self, code: &str, message: impl Into<String>, location: Option<Location>) {
        self.push(Diagnostic::warning(code, message, location));
    }

    pub fn extend(&mut self, other: impl IntoIterator<Item = Diagnostic>) {
        self.items.extend(other);
    }

    pub fn has_errors(&self) -> bool {
        self.items.iter().any(Diagnostic::is_error)
    }

    pub fn error_count(&self) -> usize {
        self.items.iter().filter(|d| d.is_error()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Diagnostic> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[Diagnostic] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<Diagnostic> {
        self.items
    }
}

impl IntoIterator for DiagnosticBag {
    type Item = Diagnostic;
    type IntoIter = std::vec::IntoIter<Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a> IntoIterator for &'a DiagnosticBag {
    type Item = &'a Diagnostic;
    type IntoIter = std::slice::Iter<'a, Diagnostic>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

pub fn render_diagnostics(diagnostics: &[Diagnostic]) -> String {
    let mut output = String::new();
    for (index, diagnostic) in diagnostics.iter().enumerate() {
        if index > 0 {
            output.push('\n');
        }
        output.push_str(&render_diagnostic(diagnostic));
    }
    output
}

/// `error[TT1001] file:line:col message`. The position part shrinks to what
/// the location actually knows.
pub fn render_diagnostic(diagnostic: &Diagnostic) -> String {
    let head = format!("{}[{}]", diagnostic.severity.as_str(), diagnostic.code);
    let Some(location) = &diagnostic.location else {
        return format!("{} {}", head, diagnostic.message);
    };
    let file = location.file_name.as_deref();
    match (file, location.line >= 1) {
        (Some(file), true) => format!(
            "{} {}:{}:{} {}",
            head, file, location.line, location.column, diagnostic.message
        ),
        (None, true) => format!(
            "{} <unknown>:{}:{} {}",
            head, location.line, location.column, diagnostic.message
        ),
        (Some(file), false) => format!("{} {}: {}", head, file, diagnostic.message),
        (None, false) => format!("{} {}", head, diagnostic.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_arithmetic_resets_column_on_new_line() {
        let loc = Location::new(Some("a.tt"), 3, 7);
        assert_eq!(loc.add_col(), Location::new(Some("a.tt"), 3, 8));
        assert_eq!(loc.add_line(), Location::new(Some("a.tt"), 4, 1));
        assert!(Location::empty().is_empty());
        assert!(!loc.is_empty());
    }

    #[test]
    fn renders_located_and_host_diagnostics() {
        let located = Diagnostic::error(
            "TT1001",
            "Unexpected end of file.",
            Some(Location::new(Some("a.tt"), 2, 5)),
        );
        let host = Diagnostic::warning("TT5001", "no settings", Some(Location::empty()));
        assert_eq!(
            render_diagnostics(&[located, host]),
            "error[TT1001] a.tt:2:5 Unexpected end of file.\nwarning[TT5001] no settings"
        );
    }

    #[test]
    fn bag_reports_errors_only_for_error_severity() {
        let mut bag = DiagnosticBag::new();
        bag.warning("TT2003", "careful", None);
        assert!(!bag.has_errors());
        bag.error("TT2001", "broken", None);
        assert!(bag.has_errors());
        assert_eq!(bag.error_count(), 1);
        assert_eq!(bag.len(), 2);
    }
}
