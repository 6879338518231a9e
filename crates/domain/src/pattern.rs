//! Glob-style pattern matching for allow/deny lists.
//!
//! A pattern with no `*` matches literally; otherwise `*` matches any
//! sequence of characters and every other regex metacharacter is escaped.
//! Patterns are compiled once at construction and reused for every check.

use regex::Regex;

/// A single compiled pattern.
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Literal,
    Glob(Regex),
}

impl Pattern {
    pub fn compile(raw: &str) -> Self {
        if !raw.contains('*') {
            return Self {
                raw: raw.to_owned(),
                matcher: Matcher::Literal,
            };
        }

        let mut re = String::with_capacity(raw.len() + 8);
        re.push('^');
        for (i, part) in raw.split('*').enumerate() {
            if i > 0 {
                re.push_str(".*");
            }
            re.push_str(&regex::escape(part));
        }
        re.push('$');

        // The constructed expression contains only escaped literals and
        // `.*` separators, so compilation cannot fail.
        let regex = Regex::new(&re).unwrap_or_else(|_| Regex::new("^$").unwrap());
        Self {
            raw: raw.to_owned(),
            matcher: Matcher::Glob(regex),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        match &self.matcher {
            Matcher::Literal => self.raw == name,
            Matcher::Glob(re) => re.is_match(name),
        }
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// A set of compiled patterns; matches when any member matches.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Pattern>,
}

impl PatternSet {
    pub fn compile<S: AsRef<str>>(raw: &[S]) -> Self {
        Self {
            patterns: raw.iter().map(|p| Pattern::compile(p.as_ref())).collect(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
