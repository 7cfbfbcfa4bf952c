//! Compiled simple-glob patterns.
//!
//! A pattern is a list of alternatives separated by `|` or whitespace,
//! each an optional `!`-negated glob using `*` wildcards. The first
//! alternative that matches decides the outcome, so negatives placed
//! before a catch-all `*` carve exceptions out of it.

/// Outcome of evaluating a pattern against a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternMatch {
    /// A positive alternative matched.
    Positive,
    /// A negative (`!`) alternative matched.
    Negative,
    /// Nothing matched.
    None,
}

#[derive(Debug, Clone)]
struct Term {
    negative: bool,
    tokens: Vec<String>,
    anchored_start: bool,
    anchored_end: bool,
}

/// A compiled simple pattern.
#[derive(Debug, Clone)]
pub struct SimplePattern {
    terms: Vec<Term>,
    case_insensitive: bool,
}

impl SimplePattern {
    /// Compiles a case-sensitive pattern.
    pub fn parse(expr: &str) -> Self {
        Self::parse_with(expr, false)
    }

    /// Compiles a pattern, optionally folding case.
    pub fn parse_with(expr: &str, case_insensitive: bool) -> Self {
        let terms = expr
            .split(|c: char| c == '|' || c.is_whitespace())
            .filter(|s| !s.is_empty())
            .map(|raw| compile_term(raw, case_insensitive))
            .collect();
        Self { terms, case_insensitive }
    }

    /// True when the pattern has no alternatives.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// True when the first matching alternative is positive.
    pub fn matches(&self, text: &str) -> bool {
        self.evaluate(text) == PatternMatch::Positive
    }

    /// Evaluates the pattern: the first matching alternative decides.
    pub fn evaluate(&self, text: &str) -> PatternMatch {
        let folded;
        let text = if self.case_insensitive {
            folded = text.to_lowercase();
            folded.as_str()
        } else {
            text
        };

        for term in &self.terms {
            if term_matches(term, text) {
                return if term.negative {
                    PatternMatch::Negative
                } else {
                    PatternMatch::Positive
                };
            }
        }
        PatternMatch::None
    }
}

fn compile_term(raw: &str, case_insensitive: bool) -> Term {
    let (negative, glob) = match raw.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let glob = if case_insensitive { glob.to_lowercase() } else { glob.to_string() };

    Term {
        negative,
        anchored_start: !glob.starts_with('*'),
        anchored_end: !glob.ends_with('*'),
        tokens: glob.split('*').filter(|s| !s.is_empty()).map(String::from).collect(),
    }
}

fn term_matches(term: &Term, text: &str) -> bool {
    let n = term.tokens.len();
    if n == 0 {
        // "*" (or bare "!"): anchored on neither side matches anything,
        // anchored on both sides only matches the empty string
        return !(term.anchored_start && term.anchored_end) || text.is_empty();
    }

    let mut rest = text;
    let mut start_idx = 0;

    if term.anchored_start {
        let first = &term.tokens[0];
        if !rest.starts_with(first.as_str()) {
            return false;
        }
        rest = &rest[first.len()..];
        start_idx = 1;
        if n == 1 {
            return !term.anchored_end || rest.is_empty();
        }
    }

    let end_idx = if term.anchored_end { n - 1 } else { n };
    for token in &term.tokens[start_idx..end_idx] {
        match rest.find(token.as_str()) {
            Some(at) => rest = &rest[at + token.len()..],
            None => return false,
        }
    }

    if term.anchored_end {
        rest.ends_with(term.tokens[n - 1].as_str())
    } else {
        true
    }
}
