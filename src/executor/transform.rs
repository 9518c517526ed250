//! Rewrites blocking `input(...)` calls into awaited calls of the runtime's
//! asynchronous replacement.
//!
//! The pass is a token-level scan over Python source. Comments and string
//! literals (every prefix and quoting form) are opaque, so `# input()` or
//! `"input("` are never touched. Calls inside f-string replacement fields are
//! detected but not rewritten. A call
//! `input(args)` becomes `(await __nagini_input__(args))`; the closing
//! parenthesis is found by bracket matching, which keeps method chains such
//! as `input().strip()` intact.
//!
//! Only insertions on the same line are made, so the rewritten program has
//! exactly the line structure of the original and error line numbers still
//! point at user code.
//!
//! Code that cannot await is left alone: bodies of plain `def` functions,
//! `class` bodies, `lambda` expressions and generator expressions. Those
//! calls reach the runtime's blocking `input`.

/// Name of the blocking primitive detected in user code.
pub const INPUT_PRIMITIVE: &str = "input";

/// Name of the asynchronous replacement rewritten calls await.
pub const ASYNC_INPUT: &str = "__nagini_input__";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prepared {
    pub code: String,
    /// Whether the program awaits the asynchronous replacement.
    pub needs_async: bool,
    /// Whether the program calls `input` anywhere, rewritten or not.
    pub calls_input: bool,
}

impl Prepared {
    /// Execution needs an input port attached.
    pub fn wants_input(&self) -> bool {
        self.needs_async || self.calls_input
    }
}

pub fn prepare(source: &str) -> Prepared {
    if !source.contains(INPUT_PRIMITIVE) {
        return Prepared { code: source.to_string(), needs_async: false, calls_input: false };
    }
    Scanner::new(source).run()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeKind {
    Function,
    AsyncFunction,
    Class,
}

#[derive(Debug, Clone, Copy)]
struct Scope {
    indent: usize,
    kind: ScopeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Prev {
    LineStart,
    Word(String),
    Dot,
    Other,
}

struct Edit {
    start: usize,
    end: usize,
    text: String,
}

struct Scanner<'a> {
    src: &'a str,
    bytes: &'a [u8],
    pos: usize,
    depth: usize,
    scopes: Vec<Scope>,
    lambdas: Vec<usize>,
    generators: Vec<usize>,
    closers: Vec<usize>,
    edits: Vec<Edit>,
    prev: Prev,
    line_indent: usize,
    line_tokens: usize,
    needs_async: bool,
    calls_input: bool,
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

fn is_ident_continue(b: u8) -> bool {
    is_ident_start(b) || b.is_ascii_digit()
}

fn is_string_prefix(word: &[u8]) -> bool {
    word.len() <= 2 && word.iter().all(|c| matches!(c.to_ascii_lowercase(), b'r' | b'b' | b'u' | b'f' | b't'))
}

fn is_formatted_prefix(word: &[u8]) -> bool {
    word.iter().any(|c| matches!(c.to_ascii_lowercase(), b'f' | b't'))
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            bytes: src.as_bytes(),
            pos: 0,
            depth: 0,
            scopes: Vec::new(),
            lambdas: Vec::new(),
            generators: Vec::new(),
            closers: Vec::new(),
            edits: Vec::new(),
            prev: Prev::LineStart,
            line_indent: 0,
            line_tokens: 0,
            needs_async: false,
            calls_input: false,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn run(mut self) -> Prepared {
        self.begin_line();
        while let Some(b) = self.peek() {
            match b {
                b'\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        self.begin_line();
                    }
                }
                b' ' | b'\t' | b'\r' | b'\x0c' => self.pos += 1,
                b'\\' => {
                    // Explicit line joining: the next physical line continues this one.
                    self.pos += 1;
                    if self.peek() == Some(b'\r') {
                        self.pos += 1;
                    }
                    if self.peek() == Some(b'\n') {
                        self.pos += 1;
                    }
                }
                b'#' => self.skip_comment(),
                b'\'' | b'"' => {
                    self.skip_string(false);
                    self.token(Prev::Other);
                }
                b'(' | b'[' | b'{' => {
                    let generator = b == b'(' && self.opens_generator();
                    self.depth += 1;
                    self.pos += 1;
                    if generator {
                        self.generators.push(self.depth);
                    }
                    self.token(Prev::Other);
                }
                b')' | b']' | b'}' => self.close_bracket(),
                b',' => {
                    if self.lambdas.last() == Some(&self.depth) {
                        self.lambdas.pop();
                    }
                    self.pos += 1;
                    self.token(Prev::Other);
                }
                b'.' => {
                    self.pos += 1;
                    self.token(Prev::Dot);
                }
                b'0'..=b'9' => {
                    while self.peek().is_some_and(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'.') {
                        self.pos += 1;
                    }
                    self.token(Prev::Other);
                }
                b if is_ident_start(b) => self.word(),
                _ => {
                    self.pos += 1;
                    self.token(Prev::Other);
                }
            }
        }
        self.finish()
    }

    fn token(&mut self, prev: Prev) {
        self.prev = prev;
        self.line_tokens += 1;
    }

    /// Start of a logical line: measure indentation and close finished scopes.
    fn begin_line(&mut self) {
        self.lambdas.clear();
        self.prev = Prev::LineStart;
        self.line_tokens = 0;
        let mut indent = 0;
        while let Some(b) = self.peek() {
            match b {
                b' ' => indent += 1,
                b'\t' => indent = (indent / 8 + 1) * 8,
                b'\x0c' => indent = 0,
                _ => break,
            }
            self.pos += 1;
        }
        match self.peek() {
            None | Some(b'\n') | Some(b'\r') | Some(b'#') => return,
            _ => {}
        }
        while self.scopes.last().is_some_and(|s| s.indent >= indent) {
            self.scopes.pop();
        }
        self.line_indent = indent;
    }

    fn skip_comment(&mut self) {
        while self.peek().is_some_and(|b| b != b'\n') {
            self.pos += 1;
        }
    }

    /// Skip a string literal whose opening quote is at `self.pos`.
    fn skip_string(&mut self, formatted: bool) {
        let quote = self.bytes[self.pos];
        let triple = self.bytes[self.pos..].starts_with(&[quote; 3]);
        self.pos += if triple { 3 } else { 1 };
        let mut braces = 0usize;
        while let Some(b) = self.peek() {
            match b {
                b'\\' => {
                    self.pos = (self.pos + 2).min(self.bytes.len());
                    continue;
                }
                // Unterminated single-quoted literal; let the newline end the line.
                b'\n' if !triple => return,
                b'{' if formatted => {
                    if braces == 0 && self.bytes.get(self.pos + 1) == Some(&b'{') {
                        self.pos += 2;
                        continue;
                    }
                    braces += 1;
                }
                b'}' if formatted && braces > 0 => braces -= 1,
                b'\'' | b'"' if formatted && braces > 0 => {
                    self.skip_string(false);
                    continue;
                }
                b if formatted && braces > 0 && is_ident_start(b) => {
                    self.field_word();
                    continue;
                }
                q if q == quote && braces == 0 => {
                    if !triple {
                        self.pos += 1;
                        return;
                    }
                    if self.bytes[self.pos..].starts_with(&[quote; 3]) {
                        self.pos += 3;
                        return;
                    }
                }
                _ => {}
            }
            self.pos += 1;
        }
    }

    /// A name inside an f-string replacement field. `input(` there marks the
    /// program as calling input without rewriting it.
    fn field_word(&mut self) {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_continue) {
            self.pos += 1;
        }
        let word = &self.bytes[start..self.pos];
        if matches!(self.peek(), Some(b'\'' | b'"')) && is_string_prefix(word) {
            self.skip_string(is_formatted_prefix(word));
        } else if word == INPUT_PRIMITIVE.as_bytes()
            && (start == 0 || self.bytes[start - 1] != b'.')
            && self.call_paren(self.pos).is_some()
        {
            self.calls_input = true;
        }
    }

    /// Whether the `(` at `self.pos` opens a generator expression, that is a
    /// `for` at its own nesting level before the matching `)`.
    fn opens_generator(&mut self) -> bool {
        let (pos, calls_input) = (self.pos, self.calls_input);
        self.pos += 1;
        let mut nesting = 0usize;
        let mut found = false;
        while let Some(b) = self.peek() {
            match b {
                b'#' => {
                    self.skip_comment();
                    continue;
                }
                b'\'' | b'"' => {
                    self.skip_string(false);
                    continue;
                }
                b'(' | b'[' | b'{' => nesting += 1,
                b')' | b']' | b'}' => {
                    if nesting == 0 {
                        break;
                    }
                    nesting -= 1;
                }
                b if is_ident_start(b) => {
                    let start = self.pos;
                    while self.peek().is_some_and(is_ident_continue) {
                        self.pos += 1;
                    }
                    let word = &self.bytes[start..self.pos];
                    if matches!(self.peek(), Some(b'\'' | b'"')) && is_string_prefix(word) {
                        self.skip_string(is_formatted_prefix(word));
                    } else if nesting == 0 && word == b"for" {
                        found = true;
                        break;
                    }
                    continue;
                }
                _ => {}
            }
            self.pos += 1;
        }
        self.pos = pos;
        self.calls_input = calls_input;
        found
    }

    /// Position of the `(` following a name that ends at `end`, if any.
    fn call_paren(&self, end: usize) -> Option<usize> {
        let mut paren = end;
        while matches!(self.bytes.get(paren), Some(b' ' | b'\t')) {
            paren += 1;
        }
        (self.bytes.get(paren) == Some(&b'(')).then_some(paren)
    }

    fn close_bracket(&mut self) {
        if self.closers.last() == Some(&self.depth) {
            self.closers.pop();
            self.edits.push(Edit { start: self.pos + 1, end: self.pos + 1, text: ")".into() });
        }
        self.depth = self.depth.saturating_sub(1);
        self.pos += 1;
        while self.lambdas.last().is_some_and(|&d| d > self.depth) {
            self.lambdas.pop();
        }
        while self.generators.last().is_some_and(|&d| d > self.depth) {
            self.generators.pop();
        }
        self.token(Prev::Other);
    }

    fn word(&mut self) {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_continue) {
            self.pos += 1;
        }
        let end = self.pos;
        let word = &self.src[start..end];

        if matches!(self.peek(), Some(b'\'' | b'"')) && is_string_prefix(word.as_bytes()) {
            self.skip_string(is_formatted_prefix(word.as_bytes()));
            self.token(Prev::Other);
            return;
        }

        match word {
            "def" => {
                let kind = match (&self.prev, self.line_tokens) {
                    (_, 0) => Some(ScopeKind::Function),
                    (Prev::Word(w), 1) if w == "async" => Some(ScopeKind::AsyncFunction),
                    _ => None,
                };
                if let Some(kind) = kind {
                    self.scopes.push(Scope { indent: self.line_indent, kind });
                }
            }
            "class" if self.line_tokens == 0 => {
                self.scopes.push(Scope { indent: self.line_indent, kind: ScopeKind::Class });
            }
            "lambda" => self.lambdas.push(self.depth),
            INPUT_PRIMITIVE => {
                if self.rewrite_call(start, end) {
                    return;
                }
            }
            _ => {}
        }
        self.token(Prev::Word(word.to_string()));
    }

    fn can_await(&self) -> bool {
        self.lambdas.is_empty()
            && self.generators.is_empty()
            && self.scopes.last().map_or(true, |s| s.kind == ScopeKind::AsyncFunction)
    }

    /// Rewrite `input(` at `start..end`. Returns true when the opening
    /// parenthesis was consumed.
    fn rewrite_call(&mut self, start: usize, end: usize) -> bool {
        match &self.prev {
            Prev::Dot => return false,
            Prev::Word(w) if w == "def" => return false,
            _ => {}
        }
        let Some(paren) = self.call_paren(end) else {
            return false;
        };
        self.calls_input = true;
        if matches!(&self.prev, Prev::Word(w) if w == "await") {
            self.needs_async = true;
            return false;
        }
        if !self.can_await() {
            return false;
        }

        self.needs_async = true;
        self.edits.push(Edit { start, end, text: format!("(await {ASYNC_INPUT}") });
        self.pos = paren + 1;
        self.depth += 1;
        self.closers.push(self.depth);
        self.token(Prev::Other);
        true
    }

    fn finish(mut self) -> Prepared {
        if self.edits.is_empty() {
            return Prepared {
                code: self.src.to_string(),
                needs_async: self.needs_async,
                calls_input: self.calls_input,
            };
        }
        self.edits.sort_by_key(|e| e.start);
        let mut code = String::with_capacity(self.src.len() + self.edits.len() * 24);
        let mut last = 0;
        for edit in &self.edits {
            code.push_str(&self.src[last..edit.start]);
            code.push_str(&edit.text);
            last = edit.end;
        }
        code.push_str(&self.src[last..]);
        Prepared { code, needs_async: self.needs_async, calls_input: self.calls_input }
    }
}
