use crate::diagnostics::Location;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenState {
    Content,
    Directive,
    Expression,
    Block,
    Helper,
    DirectiveName,
    DirectiveValue,
    Eof,
}

/// A fatal tokenizer error. Parsing stops at the first one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ParseError {
    pub message: String,
    pub location: Location,
}

impl ParseError {
    fn new(message: impl Into<String>, location: &Location) -> Self {
        Self {
            message: message.into(),
            location: location.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub state: TokenState,
    pub value: Option<String>,
    pub location: Location,
    pub tag_start_location: Location,
    pub tag_end_location: Location,
}

/// Cursor over template text.
///
/// `advance` publishes the state found by the previous scan and immediately
/// scans ahead to the next token boundary, so after each call `value()` holds
/// the text belonging to `state()`.
pub struct Tokenizer {
    chars: Vec<char>,
    position: usize,
    state: TokenState,
    next_state: TokenState,
    value: Option<String>,
    location: Location,
    tag_start_location: Location,
    tag_end_location: Location,
    next_location: Location,
    next_tag_start_location: Location,
}

impl Tokenizer {
    pub fn new(file_name: Option<&str>, content: &str) -> Self {
        let start = Location::new(file_name, 1, 1);
        Self {
            chars: content.chars().collect(),
            position: 0,
            state: TokenState::Content,
            next_state: TokenState::Content,
            value: None,
            location: start.clone(),
            tag_start_location: start.clone(),
            tag_end_location: start.clone(),
            next_location: start.clone(),
            next_tag_start_location: start,
        }
    }

    pub fn state(&self) -> TokenState {
        self.state
    }

    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn location(&self) -> &Location {
        &self.location
    }

    pub fn tag_start_location(&self) -> &Location {
        &self.tag_start_location
    }

    pub fn tag_end_location(&self) -> &Location {
        &self.tag_end_location
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Moves to the next token. Returns `Ok(false)` once end of input has been
    /// reached from content.
    pub fn advance(&mut self) -> Result<bool, ParseError> {
        self.value = None;
        self.state = self.next_state;
        self.location = self.next_location.clone();
        self.tag_start_location = self.next_tag_start_location.clone();
        if self.next_state == TokenState::Eof {
            return Ok(false);
        }
        self.next_state = match self.state {
            TokenState::Block | TokenState::Expression | TokenState::Helper => {
                self.scan_block_end()?
            }
            TokenState::Directive => self.scan_directive()?,
            TokenState::Content => self.scan_content(),
            TokenState::DirectiveName => self.scan_directive_name()?,
            TokenState::DirectiveValue => self.scan_directive_value()?,
            TokenState::Eof => TokenState::Eof,
        };
        Ok(true)
    }

    /// Collects the whole token stream, ending with an `Eof` token.
    pub fn tokenize(mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        while self.advance()? {
            tokens.push(self.token());
        }
        tokens.push(self.token());
        Ok(tokens)
    }

    fn token(&self) -> Token {
        Token {
            state: self.state,
            value: self.value.clone(),
            location: self.location.clone(),
            tag_start_location: self.tag_start_location.clone(),
            tag_end_location: self.tag_end_location.clone(),
        }
    }

    fn char_at(&self, index: usize) -> Option<char> {
        self.chars.get(index).copied()
    }

    fn slice(&self, start: usize, end: usize) -> String {
        self.chars[start..end].iter().collect()
    }

    /// Steps over a line break at the cursor. `\r\n` counts as one line.
    fn consume_line_break(&mut self, c: char) -> bool {
        match c {
            '\r' => {
                if self.char_at(self.position + 1) == Some('\n') {
                    self.position += 1;
                }
                self.next_location = self.next_location.add_line();
                true
            }
            '\n' => {
                self.next_location = self.next_location.add_line();
                true
            }
            _ => false,
        }
    }

    fn trailing_newline_len(&self) -> usize {
        let mut found = 0;
        if self.char_at(self.position) == Some('\r') {
            found += 1;
        }
        if self.char_at(self.position + found) == Some('\n') {
            found += 1;
        }
        found
    }

    fn skip_trailing_newline(&mut self) {
        let found = self.trailing_newline_len();
        if found > 0 {
            self.position += found;
            self.next_location = self.next_location.add_line();
        }
    }

    fn scan_content(&mut self) -> TokenState {
        let start = self.position;
        while self.position < self.chars.len() {
            let c = self.chars[self.position];
            self.next_tag_start_location = self.next_location.clone();
            self.next_location = self.next_location.add_col();
            if self.consume_line_break(c) {
                self.position += 1;
                continue;
            }
            if c == '<'
                && self.position + 2 < self.chars.len()
                && self.chars[self.position + 1] == '#'
            {
                self.tag_end_location = self.next_location.clone();
                self.value = Some(self.slice(start, self.position));
                let next = match self.chars[self.position + 2] {
                    '@' => TokenState::Directive,
                    '=' => TokenState::Expression,
                    '+' => TokenState::Helper,
                    _ => TokenState::Block,
                };
                if next == TokenState::Block {
                    self.next_location = self.next_location.add_col();
                    self.position += 2;
                } else {
                    self.next_location = self.next_location.add_cols(2);
                    self.position += 3;
                }
                return next;
            }
            self.position += 1;
        }
        // End of input is only legal from content.
        self.value = Some(self.slice(start, self.chars.len()));
        TokenState::Eof
    }

    fn scan_block_end(&mut self) -> Result<TokenState, ParseError> {
        let start = self.position;
        while self.position < self.chars.len() {
            let c = self.chars[self.position];
            self.next_tag_start_location = self.next_location.clone();
            self.next_location = self.next_location.add_col();
            if self.consume_line_break(c) {
                self.position += 1;
                continue;
            }
            if c == '>' && self.closes_tag(start) {
                let body = self.slice(start, self.position - 1);
                self.value = Some(body.replace("\\#>", "#>"));
                self.position += 1;
                self.tag_end_location = self.next_location.clone();
                if self.state != TokenState::Expression {
                    self.skip_trailing_newline();
                }
                return Ok(TokenState::Content);
            }
            self.position += 1;
        }
        Err(ParseError::new("Unexpected end of file.", &self.next_location))
    }

    /// True when the `>` at the cursor ends an unescaped `#>` inside the body
    /// that began at `start`.
    fn closes_tag(&self, start: usize) -> bool {
        if self.position <= start || self.chars[self.position - 1] != '#' {
            return false;
        }
        self.position < 2 || self.chars[self.position - 2] != '\\'
    }

    fn scan_directive(&mut self) -> Result<TokenState, ParseError> {
        while self.position < self.chars.len() {
            let c = self.chars[self.position];
            if self.consume_line_break(c) {
                self.position += 1;
                continue;
            }
            if c.is_alphabetic() {
                return Ok(TokenState::DirectiveName);
            }
            if c == '=' {
                self.next_location = self.next_location.add_col();
                self.position += 1;
                return Ok(TokenState::DirectiveValue);
            }
            if c == '#' && self.char_at(self.position + 1) == Some('>') {
                self.position += 2;
                self.tag_end_location = self.next_location.add_cols(2);
                self.next_location = self.next_location.add_cols(3);
                self.skip_trailing_newline();
                return Ok(TokenState::Content);
            }
            if !c.is_whitespace() {
                return Err(ParseError::new(
                    format!("Directive ended unexpectedly with character '{c}'"),
                    &self.next_location,
                ));
            }
            self.next_location = self.next_location.add_col();
            self.position += 1;
        }
        Err(ParseError::new("Unexpected end of file.", &self.next_location))
    }

    fn scan_directive_name(&mut self) -> Result<TokenState, ParseError> {
        let start = self.position;
        while self.position < self.chars.len() {
            if !self.chars[self.position].is_alphanumeric() {
                self.value = Some(self.slice(start, self.position));
                return Ok(TokenState::Directive);
            }
            self.next_location = self.next_location.add_col();
            self.position += 1;
        }
        Err(ParseError::new("Unexpected end of file.", &self.next_location))
    }

    fn scan_directive_value(&mut self) -> Result<TokenState, ParseError> {
        let mut start = self.position;
        let mut delimiter: Option<char> = None;
        while self.position < self.chars.len() {
            let c = self.chars[self.position];
            self.next_location = self.next_location.add_col();
            self.consume_line_break(c);
            match delimiter {
                None => {
                    if c == '\'' || c == '"' {
                        start = self.position;
                        delimiter = Some(c);
                    } else if !c.is_whitespace() {
                        return Err(ParseError::new(
                            format!("Unexpected character '{c}'. Expecting attribute value."),
                            &self.next_location,
                        ));
                    }
                }
                Some(quote) if c == quote => {
                    self.value = Some(self.slice(start + 1, self.position));
                    self.position += 1;
                    return Ok(TokenState::Directive);
                }
                Some(_) => {}
            }
            self.position += 1;
        }
        Err(ParseError::new("Unexpected end of file.", &self.next_location))
    }
}
