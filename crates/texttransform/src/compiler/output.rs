use regex::Regex;
use std::sync::OnceLock;

/// One diagnostic line reported by the backend compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerMessage {
    pub file: Option<String>,
    pub line: u32,
    pub column: u32,
    pub is_warning: bool,
    pub code: String,
    pub message: String,
}

struct Patterns {
    /// `file(line,col): error CODE: message`
    parenthesized: Regex,
    /// `file:line:col: error[CODE]: message`
    colon: Regex,
    /// `error CODE: message`
    simple: Regex,
    /// `error[CODE]: message` or `error: message`
    bracketed: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        parenthesized: Regex::new(
            r"^(.*)\(([0-9]+),([0-9]+)\): (error|warning) ([A-Za-z]+[0-9]+) ?: (.*)$",
        )
        .expect("valid regex"),
        colon: Regex::new(
            r"^(.+?):([0-9]+):([0-9]+): (error|warning)(?:\[([A-Za-z]+[0-9]+)\])?: (.*)$",
        )
        .expect("valid regex"),
        simple: Regex::new(r"^(error|warning) ([A-Za-z]+[0-9]+) ?: (.*)$").expect("valid regex"),
        bracketed: Regex::new(r"^(error|warning)(?:\[([A-Za-z]+[0-9]+)\])?: (.*)$")
            .expect("valid regex"),
    })
}

/// Summary lines carry no information of their own.
fn is_summary(message: &str) -> bool {
    message.starts_with("aborting due to")
        || message.ends_with("warning emitted")
        || message.ends_with("warnings emitted")
}

/// Parses one compiler output line. Lines that match no pattern yield `None`.
pub fn parse_output_line(line: &str) -> Option<CompilerMessage> {
    let line = line.trim_end();
    let patterns = patterns();
    let located = patterns
        .parenthesized
        .captures(line)
        .or_else(|| patterns.colon.captures(line));
    if let Some(caps) = located {
        let message = caps.get(6).map_or("", |m| m.as_str()).to_string();
        if is_summary(&message) {
            return None;
        }
        return Some(CompilerMessage {
            file: Some(caps[1].to_string()),
            line: caps[2].parse().unwrap_or(0),
            column: caps[3].parse().unwrap_or(0),
            is_warning: &caps[4] == "warning",
            code: caps.get(5).map_or("", |m| m.as_str()).to_string(),
            message,
        });
    }

    let caps = patterns
        .simple
        .captures(line)
        .or_else(|| patterns.bracketed.captures(line))?;
    let message = caps[3].to_string();
    if is_summary(&message) {
        return None;
    }
    Some(CompilerMessage {
        file: None,
        line: 0,
        column: 0,
        is_warning: &caps[1] == "warning",
        code: caps.get(2).map_or("", |m| m.as_str()).to_string(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rustc_short_format() {
        let message = parse_output_line(
            "/tmp/x/unit.rs:12:5: error[E0425]: cannot find value `nme` in this scope",
        )
        .expect("match");
        assert_eq!(message.file.as_deref(), Some("/tmp/x/unit.rs"));
        assert_eq!((message.line, message.column), (12, 5));
        assert!(!message.is_warning);
        assert_eq!(message.code, "E0425");
        assert_eq!(message.message, "cannot find value `nme` in this scope");

        let warning = parse_output_line("unit.rs:3:9: warning: unused variable: `x`").expect("match");
        assert!(warning.is_warning);
        assert_eq!(warning.code, "");
    }

    #[test]
    fn parses_parenthesized_and_unlocated_formats() {
        let message =
            parse_output_line("C:\\t\\unit.cs(7,13): warning CS0168: declared but never used")
                .expect("match");
        assert_eq!(message.file.as_deref(), Some("C:\\t\\unit.cs"));
        assert_eq!((message.line, message.column), (7, 13));
        assert!(message.is_warning);
        assert_eq!(message.code, "CS0168");

        let plain = parse_output_line("error E0601: `main` function not found").expect("match");
        assert_eq!(plain.file, None);
        assert_eq!(plain.code, "E0601");

        let bracketed = parse_output_line("error[E0463]: can't find crate for `foo`").expect("match");
        assert_eq!(bracketed.code, "E0463");
        assert_eq!(bracketed.message, "can't find crate for `foo`");
    }

    #[test]
    fn skips_summaries_and_noise() {
        assert_eq!(parse_output_line("error: aborting due to 2 previous errors"), None);
        assert_eq!(parse_output_line("warning: 1 warning emitted"), None);
        assert_eq!(parse_output_line("   |     ^^^ not found"), None);
        assert_eq!(parse_output_line(""), None);
    }
}
