// Runtime shared by every generated unit. This file is compiled into the
// library and also spliced verbatim into generated sources, so it may only
// depend on `std`.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Read, Write as _};
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;

pub const ENTRY_INITIALIZE: &str = "initialize";
pub const ENTRY_TRANSFORM_TEXT: &str = "transform_text";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformationMessage {
    pub is_warning: bool,
    pub message: String,
}

/// Text accumulator with an indent stack, an error list and a session.
#[derive(Debug, Default)]
pub struct TextTransformation {
    generated: String,
    ends_with_newline: bool,
    current_indent: String,
    indent_lengths: Vec<usize>,
    errors: Vec<TransformationMessage>,
    session: BTreeMap<String, String>,
    template_file: Option<String>,
}

impl TextTransformation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `text`. Every line started by this call gets the current
    /// indent; a trailing line break defers the indent to the next write.
    pub fn write(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        if (self.generated.is_empty() || self.ends_with_newline) && !self.current_indent.is_empty()
        {
            self.generated.push_str(&self.current_indent);
        }
        self.ends_with_newline = text.ends_with('\n') || text.ends_with('\r');
        if self.current_indent.is_empty() {
            self.generated.push_str(text);
            return;
        }

        let bytes = text.as_bytes();
        let mut line_start = 0;
        let mut index = 0;
        while index < bytes.len() {
            let line_end = match bytes[index] {
                b'\r' if bytes.get(index + 1) == Some(&b'\n') => index + 2,
                b'\r' | b'\n' => index + 1,
                _ => {
                    index += 1;
                    continue;
                }
            };
            if line_end < bytes.len() {
                self.generated.push_str(&text[line_start..line_end]);
                self.generated.push_str(&self.current_indent);
                line_start = line_end;
            }
            index = line_end;
        }
        self.generated.push_str(&text[line_start..]);
    }

    pub fn write_line(&mut self, text: &str) {
        self.write(text);
        self.generated.push('\n');
        self.ends_with_newline = true;
    }

    pub fn push_indent(&mut self, indent: &str) {
        self.indent_lengths.push(indent.len());
        self.current_indent.push_str(indent);
    }

    /// Removes and returns the most recently pushed indent, or `""` when the
    /// stack is empty.
    pub fn pop_indent(&mut self) -> String {
        match self.indent_lengths.pop() {
            Some(length) => {
                let split = self.current_indent.len() - length;
                self.current_indent.split_off(split)
            }
            None => String::new(),
        }
    }

    pub fn clear_indent(&mut self) {
        self.current_indent.clear();
        self.indent_lengths.clear();
    }

    pub fn current_indent(&self) -> &str {
        &self.current_indent
    }

    pub fn generated_text(&self) -> &str {
        &self.generated
    }

    pub fn take_generated_text(&mut self) -> String {
        self.ends_with_newline = false;
        std::mem::take(&mut self.generated)
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(TransformationMessage {
            is_warning: false,
            message: message.into(),
        });
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.errors.push(TransformationMessage {
            is_warning: true,
            message: message.into(),
        });
    }

    pub fn errors(&self) -> &[TransformationMessage] {
        &self.errors
    }

    pub fn session(&self) -> &BTreeMap<String, String> {
        &self.session
    }

    pub fn set_session(&mut self, session: BTreeMap<String, String>) {
        self.session = session;
    }

    pub fn session_value(&self, key: &str) -> Option<&str> {
        self.session.get(key).map(String::as_str)
    }

    pub fn set_session_value(&mut self, key: &str, value: &str) {
        self.session.insert(key.to_string(), value.to_string());
    }

    /// Parses the session value `name`. A missing value yields the default;
    /// an unparsable one also records an error.
    pub fn parameter_or_default<T: FromStr + Default>(&mut self, name: &str) -> T {
        let Some(raw) = self.session.get(name) else {
            return T::default();
        };
        match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                let message = format!(
                    "parameter '{}' value '{}' is not a valid {}",
                    name,
                    raw,
                    std::any::type_name::<T>()
                );
                self.error(message);
                T::default()
            }
        }
    }

    pub fn template_file(&self) -> Option<&str> {
        self.template_file.as_deref()
    }

    pub fn set_template_file(&mut self, path: &str) {
        self.template_file = Some(path.to_string());
    }
}

impl fmt::Write for TextTransformation {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write(s);
        Ok(())
    }
}

/// Contract every generated transformation satisfies.
pub trait TextTemplate {
    fn transformation(&mut self) -> &mut TextTransformation;

    fn initialize(&mut self) {}

    fn transform_text(&mut self) -> String;
}

/// Line-framed reply a generated program sends back to the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransformationReply {
    pub entries: Vec<String>,
    pub messages: Vec<TransformationMessage>,
    pub output: Option<String>,
}

impl TransformationReply {
    pub fn has_entry(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry == name)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str("@entry ");
            out.push_str(entry);
            out.push('\n');
        }
        for message in &self.messages {
            out.push_str(if message.is_warning { "@warning " } else { "@error " });
            out.push_str(&escape(&message.message));
            out.push('\n');
        }
        if let Some(output) = &self.output {
            out.push_str("@output ");
            out.push_str(&escape(output));
            out.push('\n');
        }
        out
    }

    /// Unknown lines are ignored.
    pub fn parse(text: &str) -> Self {
        let mut reply = TransformationReply::default();
        for line in text.lines() {
            let Some((tag, payload)) = line.split_once(' ') else {
                continue;
            };
            match tag {
                "@entry" => reply.entries.push(payload.to_string()),
                "@error" | "@warning" => reply.messages.push(TransformationMessage {
                    is_warning: tag == "@warning",
                    message: unescape(payload),
                }),
                "@output" => reply.output = Some(unescape(payload)),
                _ => {}
            }
        }
        reply
    }
}

pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// One `key=value` line per entry. `=` inside keys is written as `\=`.
pub fn render_session(session: &BTreeMap<String, String>) -> String {
    let mut out = String::new();
    for (key, value) in session {
        out.push_str(&escape(key).replace('=', "\\="));
        out.push('=');
        out.push_str(&escape(value));
        out.push('\n');
    }
    out
}

pub fn parse_session(text: &str) -> BTreeMap<String, String> {
    text.lines()
        .filter_map(split_session_line)
        .map(|(key, value)| (unescape(key), unescape(value)))
        .collect()
}

/// Splits at the first `=` that is not preceded by an escaping backslash.
fn split_session_line(line: &str) -> Option<(&str, &str)> {
    let mut escaped = false;
    for (index, c) in line.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '=' => return Some((&line[..index], &line[index + 1..])),
            _ => {}
        }
    }
    None
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}

/// Runs initialize then transform. Panics become error messages; output is
/// only reported when transform completed.
pub fn run_transformation<T: TextTemplate>(
    template: &mut T,
    session: BTreeMap<String, String>,
) -> TransformationReply {
    let mut reply = TransformationReply {
        entries: vec![ENTRY_INITIALIZE.to_string(), ENTRY_TRANSFORM_TEXT.to_string()],
        ..TransformationReply::default()
    };
    template.transformation().set_session(session);

    let initialized = panic::catch_unwind(AssertUnwindSafe(|| template.initialize()));
    if let Err(payload) = initialized {
        template.transformation().error(format!(
            "{} failed: {}",
            ENTRY_INITIALIZE,
            panic_message(payload.as_ref())
        ));
    } else {
        match panic::catch_unwind(AssertUnwindSafe(|| template.transform_text())) {
            Ok(output) => reply.output = Some(output),
            Err(payload) => template.transformation().error(format!(
                "{} failed: {}",
                ENTRY_TRANSFORM_TEXT,
                panic_message(payload.as_ref())
            )),
        }
    }

    reply.messages = template.transformation().errors().to_vec();
    reply
}

/// Entry point of generated executables. Reads the session from stdin and
/// writes the reply to the path given as the first argument, or stdout.
pub fn run_as_process<T: TextTemplate>(mut template: T) -> ! {
    panic::set_hook(Box::new(|_| {}));
    let mut input = String::new();
    let session = match io::stdin().read_to_string(&mut input) {
        Ok(_) => parse_session(&input),
        Err(_) => BTreeMap::new(),
    };
    let reply = run_transformation(&mut template, session).render();
    let written = match std::env::args().nth(1) {
        Some(path) => std::fs::write(path, reply.as_bytes()),
        None => io::stdout().write_all(reply.as_bytes()),
    };
    std::process::exit(if written.is_ok() { 0 } else { 1 })
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sample {
        base: TextTransformation,
        fail_in_initialize: bool,
    }

    impl TextTemplate for Sample {
        fn transformation(&mut self) -> &mut TextTransformation {
            &mut self.base
        }

        fn initialize(&mut self) {
            if self.fail_in_initialize {
                panic!("boom");
            }
        }

        fn transform_text(&mut self) -> String {
            let name = self.base.session_value("name").unwrap_or("nobody").to_string();
            self.base.write("Hello ");
            self.base.write(&name);
            self.base.take_generated_text()
        }
    }

    #[test]
    fn pushed_indent_applies_to_each_written_line() {
        let mut t = TextTransformation::new();
        t.push_indent("  ");
        t.write_line("one");
        t.write_line("two");
        assert_eq!(t.pop_indent(), "  ");
        t.write_line("three");
        assert_eq!(t.generated_text(), "  one\n  two\nthree\n");
    }

    #[test]
    fn embedded_newlines_are_reindented() {
        let mut t = TextTransformation::new();
        t.write("head ");
        t.push_indent("\t");
        t.write("a\n\nb\r\nc\n");
        t.write("d");
        assert_eq!(t.generated_text(), "head a\n\t\n\tb\r\n\tc\n\td");
    }

    #[test]
    fn nested_indents_pop_in_reverse_order() {
        let mut t = TextTransformation::new();
        t.push_indent("ab");
        t.push_indent("c");
        assert_eq!(t.current_indent(), "abc");
        assert_eq!(t.pop_indent(), "c");
        assert_eq!(t.pop_indent(), "ab");
        assert_eq!(t.pop_indent(), "");
        t.push_indent("x");
        t.clear_indent();
        assert_eq!(t.current_indent(), "");
    }

    #[test]
    fn parameters_parse_or_record_errors() {
        let mut t = TextTransformation::new();
        t.set_session_value("count", "3");
        t.set_session_value("flag", "maybe");
        assert_eq!(t.parameter_or_default::<u32>("count"), 3);
        assert_eq!(t.parameter_or_default::<u32>("missing"), 0);
        assert!(!t.parameter_or_default::<bool>("flag"));
        assert_eq!(t.errors().len(), 1);
        assert!(!t.errors()[0].is_warning);
    }

    #[test]
    fn reply_survives_render_and_parse() {
        let reply = TransformationReply {
            entries: vec![ENTRY_INITIALIZE.to_string()],
            messages: vec![TransformationMessage {
                is_warning: true,
                message: "a\\b\nc".to_string(),
            }],
            output: Some("x\r\ny\n".to_string()),
        };
        assert_eq!(TransformationReply::parse(&reply.render()), reply);
    }

    #[test]
    fn session_lines_escape_newlines() {
        let mut session = BTreeMap::new();
        session.insert("k".to_string(), "a=b\nc".to_string());
        assert_eq!(render_session(&session), "k=a=b\\nc\n");
        assert_eq!(parse_session(&render_session(&session)), session);
    }

    #[test]
    fn session_keys_may_contain_equals_signs() {
        let mut session = BTreeMap::new();
        session.insert("a=b".to_string(), "v".to_string());
        session.insert("dir\\".to_string(), "x=y".to_string());
        let rendered = render_session(&session);
        assert!(rendered.contains("a\\=b=v\n"), "{rendered}");
        assert_eq!(parse_session(&rendered), session);
    }

    #[test]
    fn run_transformation_reports_output_and_panics() {
        let mut session = BTreeMap::new();
        session.insert("name".to_string(), "World".to_string());
        let mut ok = Sample {
            base: TextTransformation::new(),
            fail_in_initialize: false,
        };
        let reply = run_transformation(&mut ok, session);
        assert!(reply.has_entry(ENTRY_TRANSFORM_TEXT));
        assert_eq!(reply.output.as_deref(), Some("Hello World"));
        assert!(reply.messages.is_empty());

        let mut failing = Sample {
            base: TextTransformation::new(),
            fail_in_initialize: true,
        };
        let reply = run_transformation(&mut failing, BTreeMap::new());
        assert_eq!(reply.output, None);
        assert_eq!(reply.messages[0].message, "initialize failed: boom");
    }
}
