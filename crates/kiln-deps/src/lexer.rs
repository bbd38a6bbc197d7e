//! Statement-level Python lexer.
//!
//! Produces the logical statements of a module as token lists. Strings,
//! comments, bracket nesting, explicit line continuations and indentation are
//! understood well enough to reject source that CPython would refuse to
//! tokenize, which is all the resolver needs to decide whether it may touch
//! the code.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Name(String),
    Op(&'static str),
    Str,
    Number,
}

impl Token {
    pub fn is_op(&self, op: &str) -> bool {
        matches!(self, Token::Op(o) if *o == op)
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Token::Name(n) => Some(n),
            _ => None,
        }
    }

    pub fn is_name(&self, name: &str) -> bool {
        self.name() == Some(name)
    }
}

/// One logical line (or `;`-separated part of one).
#[derive(Debug, Clone)]
pub struct Statement {
    pub start_line: usize,
    pub end_line: usize,
    pub indent: usize,
    pub tokens: Vec<Token>,
}

impl Statement {
    pub fn first_name(&self) -> Option<&str> {
        self.tokens.first().and_then(Token::name)
    }

    pub fn is_import(&self) -> bool {
        matches!(self.first_name(), Some("import") | Some("from"))
    }

    /// A statement made only of string literals.
    pub fn is_docstring(&self) -> bool {
        !self.tokens.is_empty() && self.tokens.iter().all(|t| *t == Token::Str)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LexError {
    #[error("line {line}: unterminated string literal")]
    UnterminatedString { line: usize },
    #[error("line {line}: unmatched '{found}'")]
    UnmatchedBracket { line: usize, found: char },
    #[error("line {line}: '{open}' was never closed")]
    UnclosedBracket { line: usize, open: char },
    #[error("line {line}: unindent does not match any outer indentation level")]
    InconsistentDedent { line: usize },
    #[error("line {line}: invalid character '{found}'")]
    InvalidCharacter { line: usize, found: char },
}

const OPERATORS: &[&str] = &[
    "**=", "//=", ">>=", "<<=", "...", "->", ":=", "==", "!=", "<=", ">=", "+=", "-=", "*=",
    "/=", "%=", "&=", "|=", "^=", "@=", "**", "//", "<<", ">>", "+", "-", "*", "/", "%", "@",
    "&", "|", "^", "~", "<", ">", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "=", "!",
];

const STRING_PREFIXES: &[&str] = &[
    "rb", "br", "fr", "rf", "r", "b", "u", "f",
];

struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    source: &'a str,
    statements: Vec<Statement>,
    current: Vec<Token>,
    start_line: usize,
    indent: usize,
    indent_stack: Vec<usize>,
    brackets: Vec<(char, usize)>,
    at_line_start: bool,
}

pub fn parse(source: &str) -> Result<Vec<Statement>, LexError> {
    Lexer::new(source).run()
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            source,
            statements: Vec::new(),
            current: Vec::new(),
            start_line: 1,
            indent: 0,
            indent_stack: vec![0],
            brackets: Vec::new(),
            at_line_start: true,
        }
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn run(mut self) -> Result<Vec<Statement>, LexError> {
        tracing::trace!(bytes = self.source.len(), "lexing python source");
        while let Some(c) = self.peek(0) {
            if self.at_line_start && self.brackets.is_empty() {
                self.at_line_start = false;
                self.measure_indent()?;
                continue;
            }

            match c {
                '\n' => {
                    self.pos += 1;
                    if self.brackets.is_empty() {
                        self.end_statement();
                        self.at_line_start = true;
                    }
                    self.line += 1;
                }
                '\r' | ' ' | '\t' | '\x0c' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' if matches!(self.peek(1), Some('\n')) => {
                    self.pos += 2;
                    self.line += 1;
                }
                '\\' if self.peek(1) == Some('\r') && self.peek(2) == Some('\n') => {
                    self.pos += 3;
                    self.line += 1;
                }
                ';' if self.brackets.is_empty() => {
                    self.pos += 1;
                    self.end_statement();
                }
                '\'' | '"' => self.lex_string()?,
                c if c.is_ascii_digit() => self.lex_number(),
                '.' if self.peek(1).is_some_and(|d| d.is_ascii_digit()) => self.lex_number(),
                c if c.is_alphabetic() || c == '_' => {
                    if let Some(prefix_len) = self.string_prefix_len() {
                        self.pos += prefix_len;
                        self.lex_string()?;
                    } else {
                        self.lex_name();
                    }
                }
                _ => self.lex_operator(c)?,
            }
        }

        if let Some(&(open, line)) = self.brackets.last() {
            return Err(LexError::UnclosedBracket { line, open });
        }
        self.end_statement();
        Ok(self.statements)
    }

    /// Reads leading whitespace of a physical line. Blank and comment-only
    /// lines carry no indentation meaning.
    fn measure_indent(&mut self) -> Result<(), LexError> {
        let mut width = 0;
        while let Some(c) = self.peek(0) {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / 8 + 1) * 8,
                '\x0c' => width = 0,
                _ => break,
            }
            self.pos += 1;
        }

        match self.peek(0) {
            None | Some('\n') | Some('\r') | Some('#') => return Ok(()),
            _ => {}
        }

        let top = self.indent_stack.last().copied().unwrap_or(0);
        if width > top {
            self.indent_stack.push(width);
        } else if width < top {
            while self.indent_stack.last().is_some_and(|&level| level > width) {
                self.indent_stack.pop();
            }
            if self.indent_stack.last().copied() != Some(width) {
                return Err(LexError::InconsistentDedent { line: self.line });
            }
        }
        self.indent = width;
        Ok(())
    }

    fn end_statement(&mut self) {
        if self.current.is_empty() {
            return;
        }
        self.statements.push(Statement {
            start_line: self.start_line,
            end_line: self.line,
            indent: self.indent,
            tokens: std::mem::take(&mut self.current),
        });
    }

    fn push(&mut self, token: Token, line: usize) {
        if self.current.is_empty() {
            self.start_line = line;
        }
        self.current.push(token);
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek(0) {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn string_prefix_len(&self) -> Option<usize> {
        STRING_PREFIXES.iter().find_map(|prefix| {
            let len = prefix.len();
            let matches = prefix
                .chars()
                .enumerate()
                .all(|(i, p)| self.peek(i).is_some_and(|c| c.to_ascii_lowercase() == p));
            let quoted = matches!(self.peek(len), Some('\'') | Some('"'));
            (matches && quoted).then_some(len)
        })
    }

    fn lex_string(&mut self) -> Result<(), LexError> {
        let start_line = self.line;
        let quote = self.peek(0).unwrap_or('"');
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        loop {
            let Some(c) = self.peek(0) else {
                return Err(LexError::UnterminatedString { line: start_line });
            };
            match c {
                '\\' => {
                    if self.peek(1) == Some('\n') {
                        self.line += 1;
                    }
                    self.pos += 2;
                }
                '\n' if !triple => {
                    return Err(LexError::UnterminatedString { line: start_line });
                }
                '\n' => {
                    self.line += 1;
                    self.pos += 1;
                }
                c if c == quote => {
                    if !triple {
                        self.pos += 1;
                        break;
                    }
                    if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                        self.pos += 3;
                        break;
                    }
                    self.pos += 1;
                }
                _ => self.pos += 1,
            }
        }

        self.push(Token::Str, start_line);
        Ok(())
    }

    fn lex_number(&mut self) {
        let line = self.line;
        let mut prev = '\0';
        while let Some(c) = self.peek(0) {
            let exponent_sign = matches!(c, '+' | '-') && matches!(prev, 'e' | 'E');
            if !(c.is_ascii_alphanumeric() || c == '_' || c == '.' || exponent_sign) {
                break;
            }
            prev = c;
            self.pos += 1;
        }
        self.push(Token::Number, line);
    }

    fn lex_name(&mut self) {
        let line = self.line;
        let start = self.pos;
        while self.peek(0).is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        self.push(Token::Name(name), line);
    }

    fn lex_operator(&mut self, c: char) -> Result<(), LexError> {
        let line = self.line;
        let op = OPERATORS.iter().find(|op| {
            op.chars()
                .enumerate()
                .all(|(i, oc)| self.peek(i) == Some(oc))
        });
        let Some(&op) = op else {
            return Err(LexError::InvalidCharacter { line, found: c });
        };

        match op {
            "(" | "[" | "{" => self.brackets.push((c, line)),
            ")" | "]" | "}" => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match self.brackets.pop() {
                    Some((open, _)) if open == expected => {}
                    _ => return Err(LexError::UnmatchedBracket { line, found: c }),
                }
            }
            _ => {}
        }

        self.pos += op.chars().count();
        self.push(Token::Op(op), line);
        Ok(())
    }
}
