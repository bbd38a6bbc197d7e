use crate::lexer::{self, Statement, Token};
use crate::manifest;
use crate::modules::{ImportSpec, KnownModules};
use kiln_core::DependencyFixResult;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

/// Statements whose header ends in a `:` that may be followed by a body on the same line.
const COMPOUND: &[&str] = &[
    "if", "elif", "else", "while", "for", "with", "try", "except", "finally", "def", "class",
    "async",
];

const AUGMENTED: &[&str] = &[
    "+=", "-=", "*=", "/=", "//=", "%=", "**=", ">>=", "<<=", "&=", "|=", "^=", "@=",
];

static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:from\s+([A-Za-z_]\w*)[\w.]*\s+import\b|import\s+([A-Za-z_]\w*))")
        .expect("import pattern compiles")
});

static ATTRIBUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\w.])([A-Za-z_]\w*)\.[A-Za-z_]").expect("attribute pattern compiles")
});

static NAME_ERROR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"NameError: name '([A-Za-z_]\w*)' is not defined").expect("name error pattern compiles")
});

fn is_keyword(name: &str) -> bool {
    KEYWORDS.contains(&name)
}

/// What a module binds, imports and dereferences, across all scopes.
#[derive(Debug, Default)]
struct Analysis {
    imported_modules: BTreeSet<String>,
    imported_bindings: BTreeSet<String>,
    bound: BTreeSet<String>,
    attribute_roots: BTreeSet<String>,
}

impl Analysis {
    fn of(statements: &[Statement]) -> Self {
        let mut analysis = Self::default();
        for stmt in statements {
            analysis.visit(&stmt.tokens);
        }
        analysis
    }

    fn visit(&mut self, tokens: &[Token]) {
        match tokens.first().and_then(Token::name) {
            Some("import") => return self.visit_import(&tokens[1..]),
            Some("from") => return self.visit_from(&tokens[1..]),
            Some("global") | Some("nonlocal") => {
                let names = tokens[1..].iter().filter_map(Token::name);
                self.bound.extend(names.map(str::to_string));
                return;
            }
            Some(keyword) if COMPOUND.contains(&keyword) => {
                if let Some(colon) = header_colon(tokens) {
                    self.visit_header(&tokens[..colon]);
                    if colon + 1 < tokens.len() {
                        self.visit(&tokens[colon + 1..]);
                    }
                    return;
                }
            }
            _ => {}
        }
        self.visit_simple(tokens);
    }

    fn visit_import(&mut self, tokens: &[Token]) {
        for part in tokens.split(|t| t.is_op(",")) {
            let Some(module) = part.first().and_then(Token::name) else {
                continue;
            };
            self.imported_modules.insert(module.to_string());
            let binding = alias_of(part).unwrap_or(module);
            self.imported_bindings.insert(binding.to_string());
            self.bound.insert(binding.to_string());
        }
    }

    fn visit_from(&mut self, tokens: &[Token]) {
        let Some(split) = tokens.iter().position(|t| t.is_name("import")) else {
            return;
        };
        if let Some(module) = tokens.first().and_then(Token::name) {
            self.imported_modules.insert(module.to_string());
        }

        let names: Vec<Token> = tokens[split + 1..]
            .iter()
            .filter(|t| !t.is_op("(") && !t.is_op(")"))
            .cloned()
            .collect();
        for part in names.split(|t| t.is_op(",")) {
            let Some(name) = part.first().and_then(Token::name) else {
                continue;
            };
            let binding = alias_of(part).unwrap_or(name);
            self.imported_bindings.insert(binding.to_string());
            self.bound.insert(binding.to_string());
        }
    }

    fn visit_header(&mut self, tokens: &[Token]) {
        self.collect_uses(tokens);

        let definition = tokens
            .iter()
            .position(|t| t.is_name("def") || t.is_name("class"));
        let Some(at) = definition else {
            return;
        };
        if let Some(name) = tokens.get(at + 1).and_then(Token::name) {
            self.bound.insert(name.to_string());
        }
        if tokens[at].is_name("def") {
            self.bind_parameters(&tokens[at + 2..]);
        }
    }

    fn visit_simple(&mut self, tokens: &[Token]) {
        self.collect_uses(tokens);

        if let (Some(Token::Name(name)), Some(second)) = (tokens.first(), tokens.get(1)) {
            if second.is_op(":") && !is_keyword(name) {
                self.bound.insert(name.clone());
            }
        }

        let mut depth = 0usize;
        let mut segment_start = 0;
        for (i, token) in tokens.iter().enumerate() {
            match token {
                Token::Op("(" | "[" | "{") => depth += 1,
                Token::Op(")" | "]" | "}") => depth = depth.saturating_sub(1),
                Token::Op("=") if depth == 0 => {
                    self.bind_targets(&tokens[segment_start..i]);
                    segment_start = i + 1;
                }
                Token::Op(op) if depth == 0 && AUGMENTED.contains(op) => {
                    self.bind_targets(&tokens[segment_start..i]);
                    segment_start = i + 1;
                }
                _ => {}
            }
        }
    }

    /// Usages and the bindings that can appear anywhere in an expression.
    fn collect_uses(&mut self, tokens: &[Token]) {
        for (i, token) in tokens.iter().enumerate() {
            let Token::Name(name) = token else {
                continue;
            };
            let after_dot = i > 0 && tokens[i - 1].is_op(".");

            if !after_dot && !is_keyword(name) {
                let dotted = tokens.get(i + 1).is_some_and(|t| t.is_op("."))
                    && tokens.get(i + 2).and_then(Token::name).is_some();
                if dotted {
                    self.attribute_roots.insert(name.clone());
                }
                if tokens.get(i + 1).is_some_and(|t| t.is_op(":=")) {
                    self.bound.insert(name.clone());
                }
            }

            match name.as_str() {
                "as" => {
                    if let Some(target) = tokens.get(i + 1).and_then(Token::name) {
                        self.bound.insert(target.to_string());
                    }
                }
                "for" => {
                    let end = tokens[i + 1..]
                        .iter()
                        .position(|t| t.is_name("in"))
                        .map(|p| i + 1 + p)
                        .unwrap_or(tokens.len());
                    self.bind_plain_names(&tokens[i + 1..end]);
                }
                "lambda" => {
                    let end = tokens[i + 1..]
                        .iter()
                        .position(|t| t.is_op(":"))
                        .map(|p| i + 1 + p)
                        .unwrap_or(tokens.len());
                    self.bind_parameters(&tokens[i + 1..end]);
                }
                _ => {}
            }
        }
    }

    fn bind_plain_names(&mut self, tokens: &[Token]) {
        for (i, token) in tokens.iter().enumerate() {
            if let Token::Name(name) = token {
                let after_dot = i > 0 && tokens[i - 1].is_op(".");
                if !after_dot && !is_keyword(name) {
                    self.bound.insert(name.clone());
                }
            }
        }
    }

    /// Binds names that start a parameter: after `(`, `,`, `*` or `**` at the
    /// outermost level of the list. Defaults and annotations are skipped.
    fn bind_parameters(&mut self, tokens: &[Token]) {
        let mut depth = 0usize;
        let mut expect_name = true;
        for token in tokens {
            match token {
                Token::Op("(" | "[" | "{") => {
                    depth += 1;
                    expect_name = depth == 1;
                }
                Token::Op(")" | "]" | "}") => depth = depth.saturating_sub(1),
                Token::Op(",") if depth <= 1 => expect_name = true,
                Token::Op("*" | "**") if depth <= 1 => {}
                Token::Name(name) if expect_name && depth <= 1 => {
                    if !is_keyword(name) {
                        self.bound.insert(name.clone());
                    }
                    expect_name = false;
                }
                _ => expect_name = false,
            }
        }
    }

    /// Binds the plain names of an assignment target. Attribute and subscript
    /// targets (`a.b = …`, `a[i] = …`) bind nothing.
    fn bind_targets(&mut self, tokens: &[Token]) {
        let mut brackets: Vec<bool> = Vec::new();
        for (i, token) in tokens.iter().enumerate() {
            let prev = i.checked_sub(1).map(|p| &tokens[p]);
            match token {
                Token::Op("(" | "[" | "{") => {
                    let accessor = matches!(prev, Some(Token::Name(n)) if !is_keyword(n))
                        || prev.is_some_and(|p| p.is_op(")") || p.is_op("]") || *p == Token::Str);
                    brackets.push(accessor);
                }
                Token::Op(")" | "]" | "}") => {
                    brackets.pop();
                }
                // annotation follows
                Token::Op(":") if brackets.is_empty() => break,
                Token::Name(name) => {
                    let inside_accessor = brackets.iter().any(|&accessor| accessor);
                    let after_dot = prev.is_some_and(|p| p.is_op("."));
                    let accessed = tokens
                        .get(i + 1)
                        .is_some_and(|t| t.is_op(".") || t.is_op("(") || t.is_op("["));
                    if !inside_accessor && !after_dot && !accessed && !is_keyword(name) {
                        self.bound.insert(name.clone());
                    }
                }
                _ => {}
            }
        }
    }
}

fn alias_of(part: &[Token]) -> Option<&str> {
    part.iter()
        .position(|t| t.is_name("as"))
        .and_then(|at| part.get(at + 1))
        .and_then(Token::name)
}

/// Index of the `:` closing a compound statement header, skipping any `:`
/// that belongs to a lambda or sits inside brackets.
fn header_colon(tokens: &[Token]) -> Option<usize> {
    let mut depth = 0usize;
    let mut open_lambdas = 0usize;
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::Op("(" | "[" | "{") => depth += 1,
            Token::Op(")" | "]" | "}") => depth = depth.saturating_sub(1),
            Token::Name(name) if depth == 0 && name == "lambda" => open_lambdas += 1,
            Token::Op(":") if depth == 0 => {
                if open_lambdas == 0 {
                    return Some(i);
                }
                open_lambdas -= 1;
            }
            _ => {}
        }
    }
    None
}

/// Where new imports go: `(line index, follows an import block)`.
fn insertion_point(statements: &[Statement], line_count: usize) -> (usize, bool) {
    let mut rest = statements;
    let mut point = 0;

    if let Some(first) = rest.first() {
        if first.is_docstring() {
            point = first.end_line;
            rest = &rest[1..];
        }
    }

    match rest.first() {
        Some(first) if first.is_import() && first.indent == 0 => {
            let mut last = first;
            for next in &rest[1..] {
                if next.is_import() && next.indent == 0 && next.start_line <= last.end_line + 1 {
                    last = next;
                } else {
                    break;
                }
            }
            (last.end_line.min(line_count), true)
        }
        Some(code) => (code.start_line.saturating_sub(1).min(line_count), false),
        None => (point.min(line_count), false),
    }
}

/// Splices `imports` in at the insertion point. Existing lines keep their own
/// terminators; new lines use the file's (CRLF if it has any).
fn insert_imports(code: &str, statements: &[Statement], imports: &[ImportSpec]) -> String {
    let eol = if code.contains("\r\n") { "\r\n" } else { "\n" };
    let lines: Vec<&str> = code.split_inclusive('\n').collect();
    let (point, after_imports) = insertion_point(statements, lines.len());

    let mut fixed = String::with_capacity(code.len() + imports.len() * 24);
    fixed.extend(lines[..point].iter().copied());
    if point > 0 && !fixed.ends_with('\n') {
        fixed.push_str(eol);
    }
    if point > 0 && !after_imports && !lines[point - 1].trim().is_empty() {
        fixed.push_str(eol);
    }
    for import in imports {
        fixed.push_str(&import.statement());
        fixed.push_str(eol);
    }
    match lines.get(point) {
        Some(next) => {
            if !next.trim().is_empty() {
                fixed.push_str(eol);
            }
            fixed.extend(lines[point..].iter().copied());
        }
        None if !code.ends_with('\n') => {
            fixed.truncate(fixed.len() - eol.len());
        }
        None => {}
    }
    fixed
}

/// Finds modules a Python snippet uses and adds the imports it forgot.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver {
    modules: KnownModules,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn modules(&self) -> &KnownModules {
        &self.modules
    }

    /// Top-level modules the code imports or dereferences without binding.
    pub fn detect_used_modules(&self, code: &str) -> BTreeSet<String> {
        let statements = match lexer::parse(code) {
            Ok(statements) => statements,
            Err(err) => {
                tracing::debug!(%err, "falling back to text heuristics");
                return self.detect_by_text(code);
            }
        };

        let analysis = Analysis::of(&statements);
        let mut used = analysis.imported_modules.clone();
        for root in &analysis.attribute_roots {
            if analysis.bound.contains(root) {
                continue;
            }
            if let Some(spec) = self.modules.resolve(root) {
                used.insert(spec.top_level().to_string());
            }
        }
        used
    }

    fn detect_by_text(&self, code: &str) -> BTreeSet<String> {
        let mut used = BTreeSet::new();
        for caps in IMPORT_RE.captures_iter(code) {
            if let Some(module) = caps.get(1).or_else(|| caps.get(2)) {
                used.insert(module.as_str().to_string());
            }
        }
        for caps in ATTRIBUTE_RE.captures_iter(code) {
            if let Some(spec) = self.modules.resolve(&caps[1]) {
                used.insert(spec.top_level().to_string());
            }
        }
        used
    }

    /// Inserts `import` lines for known modules that are dereferenced but
    /// never bound. Unparsable code comes back untouched.
    pub fn fix(&self, code: &str) -> DependencyFixResult {
        let statements = match lexer::parse(code) {
            Ok(statements) => statements,
            Err(err) => {
                tracing::debug!(%err, "code is not parsable, skipping import fix");
                return DependencyFixResult::unchanged(code);
            }
        };

        let analysis = Analysis::of(&statements);
        let missing: Vec<ImportSpec> = analysis
            .attribute_roots
            .iter()
            .filter(|name| !analysis.imported_modules.contains(*name))
            .filter(|name| !analysis.bound.contains(*name))
            .filter_map(|name| self.modules.resolve(name))
            .collect();

        if missing.is_empty() {
            return DependencyFixResult::unchanged(code);
        }

        tracing::debug!(count = missing.len(), "adding missing imports");
        DependencyFixResult {
            original_code: code.to_string(),
            fixed_code: insert_imports(code, &statements, &missing),
            added_imports: missing.into_iter().map(|spec| spec.binding).collect(),
        }
    }

    /// Name from a `NameError: name 'x' is not defined` message.
    pub fn missing_name(&self, error: &str) -> Option<String> {
        NAME_ERROR_RE
            .captures(error)
            .map(|caps| caps[1].to_string())
    }

    /// Adds `import name` after a run failed on it. Unlike [`fix`](Self::fix),
    /// a local binding of the same name does not block the repair, since the
    /// interpreter already proved the name unbound where it was used.
    pub fn repair(&self, code: &str, name: &str) -> Option<DependencyFixResult> {
        let spec = self.modules.resolve(name)?;
        let statements = lexer::parse(code).ok()?;
        let analysis = Analysis::of(&statements);
        if analysis.imported_bindings.contains(&spec.binding) {
            return None;
        }

        let fixed_code = insert_imports(code, &statements, std::slice::from_ref(&spec));
        Some(DependencyFixResult {
            original_code: code.to_string(),
            fixed_code,
            added_imports: BTreeSet::from([spec.binding]),
        })
    }

    /// Pip requirement lines for the third-party modules in `modules`.
    pub fn requirements<'a, I>(&self, modules: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        manifest::requirements(&self.modules, modules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bound(code: &str) -> BTreeSet<String> {
        Analysis::of(&lexer::parse(code).unwrap()).bound
    }

    #[test]
    fn collects_binding_forms() {
        let names = bound(
            "a, (b, c) = 1, (2, 3)\n\
             d += 1\n\
             e: int = 4\n\
             for f, g in pairs: pass\n\
             with open(p) as h: pass\n\
             def k(m, n=1, *rest, **kw): pass\n\
             class Q(Base): pass\n\
             if (w := 5): pass\n\
             squares = [sq for sq in range(3)]\n\
             fn = lambda lx, ly: lx\n",
        );
        for name in [
            "a", "b", "c", "d", "e", "f", "g", "h", "k", "m", "n", "rest", "kw", "Q", "w", "sq",
            "squares", "fn", "lx", "ly",
        ] {
            assert!(names.contains(name), "{name} should be bound");
        }
        assert!(!names.contains("p"));
        assert!(!names.contains("Base"));
        assert!(!names.contains("pairs"));
    }

    #[test]
    fn attribute_and_subscript_targets_bind_nothing() {
        let names = bound("obj.attr = 1\nitems[idx] = 2\ncall(arg).field = 3\n");
        assert!(names.is_empty(), "{names:?}");
    }

    #[test]
    fn attribute_roots_skip_chained_attributes() {
        let analysis = Analysis::of(&lexer::parse("x = a.b.c\ny = self.os.path\n").unwrap());
        assert!(analysis.attribute_roots.contains("a"));
        assert!(analysis.attribute_roots.contains("self"));
        assert!(!analysis.attribute_roots.contains("b"));
        assert!(!analysis.attribute_roots.contains("os"));
    }

    #[test]
    fn header_colon_skips_lambda_and_brackets() {
        let tokens = lexer::parse("if f(lambda v: v) and (lambda: 1): x = d[1:2]\n").unwrap();
        let tokens = &tokens[0].tokens;
        let colon = header_colon(tokens).unwrap();
        assert!(tokens[colon + 1].is_name("x"));
    }

    #[test]
    fn missing_name_reads_name_errors() {
        let resolver = DependencyResolver::new();
        assert_eq!(
            resolver.missing_name("NameError: name 'math' is not defined").as_deref(),
            Some("math")
        );
        assert_eq!(resolver.missing_name("ZeroDivisionError: division by zero"), None);
    }
}
