//! Pushed-directive model.
//!
//! A `Directive` is one pushed configuration line already split into
//! tokens: token 0 is the directive name, the rest are positional
//! arguments. `DirectiveList` preserves push order and indexes by name so
//! scans like "every `route` directive, in order" stay cheap.
//!
//! The real session feeds this from its control-channel tokenizer;
//! [`DirectiveList::parse`] is a line-oriented stand-in for the binary and
//! tests.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};

/// Longest a token is rendered in log lines before truncation.
const RENDER_TRUNC: usize = 64;

/// One pushed directive: a name plus ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    tokens: Vec<String>,
}

impl Directive {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    /// Directive name (token 0).
    pub fn name(&self) -> &str {
        self.tokens.first().map(String::as_str).unwrap_or("")
    }

    /// Total token count, name included.
    pub fn size(&self) -> usize {
        self.tokens.len()
    }

    /// Positional access, bounds-checked. Fails if the token is absent or
    /// longer than `max_len`.
    pub fn get(&self, index: usize, max_len: usize) -> Result<&str> {
        let tok = self.tokens.get(index).ok_or_else(|| {
            Error::format(format!("directive '{}': missing argument {}", self.name(), index))
        })?;
        if tok.len() > max_len {
            return Err(Error::format(format!(
                "directive '{}': argument {} exceeds {} chars",
                self.name(),
                index,
                max_len
            )));
        }
        Ok(tok)
    }

    /// Like [`get`](Self::get) but an absent token is `None` rather than an
    /// error. A present token over `max_len` still fails.
    pub fn get_optional(&self, index: usize, max_len: usize) -> Result<Option<&str>> {
        match self.tokens.get(index) {
            None => Ok(None),
            Some(_) => self.get(index, max_len).map(Some),
        }
    }

    /// Require exactly `n` tokens (name included).
    pub fn exact_args(&self, n: usize) -> Result<()> {
        if self.tokens.len() != n {
            return Err(Error::format(format!(
                "directive '{}' must have exactly {} arguments",
                self.name(),
                n
            )));
        }
        Ok(())
    }

    /// Require at least `n` tokens (name included).
    pub fn min_args(&self, n: usize) -> Result<()> {
        if self.tokens.len() < n {
            return Err(Error::format(format!(
                "directive '{}' must have at least {} arguments",
                self.name(),
                n
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Directive {
    /// Bracketed, truncated rendering for log lines.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tok) in self.tokens.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if tok.chars().count() > RENDER_TRUNC {
                let cut: String = tok.chars().take(RENDER_TRUNC).collect();
                write!(f, "[{}...]", cut)?;
            } else {
                write!(f, "[{}]", tok)?;
            }
        }
        Ok(())
    }
}

/// Ordered collection of pushed directives with a name index.
#[derive(Debug, Clone, Default)]
pub struct DirectiveList {
    items: Vec<Directive>,
    index: HashMap<String, Vec<usize>>,
}

impl DirectiveList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a directive, keeping the name index current. Empty token
    /// lists are dropped.
    pub fn push(&mut self, directive: Directive) {
        if directive.tokens.is_empty() {
            return;
        }
        let pos = self.items.len();
        self.index
            .entry(directive.name().to_string())
            .or_default()
            .push(pos);
        self.items.push(directive);
    }

    /// First directive with the given name, if any.
    pub fn get(&self, name: &str) -> Option<&Directive> {
        self.index
            .get(name)
            .and_then(|ix| ix.first())
            .map(|&i| &self.items[i])
    }

    /// All directives with the given name, in push order.
    pub fn get_all<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Directive> + 'a {
        self.index
            .get(name)
            .into_iter()
            .flatten()
            .map(move |&i| &self.items[i])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Directive> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Line-oriented parse: one directive per line, whitespace-split,
    /// blank lines and `#`/`;` comments skipped.
    pub fn parse(text: &str) -> Self {
        let mut list = Self::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            list.push(Directive::new(line.split_whitespace()));
        }
        list
    }
}
