//! JSON-pointer positions over the virtual workflow document
//!
//! A position names a single node in the task tree, e.g. `/do/0/fetch` or
//! `/do/1/try/catch/do/0/recover`. Tokens alternate between structural
//! markers (`do`, `try`, `catch`, `fork`, `branches`), list indexes, and
//! task names. Markers and names share one textual representation so that
//! parsed and built positions compare equal.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A single token of a position pointer
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PositionToken {
    /// Index into a task list
    Index(usize),

    /// Structural marker (`do`, `try`, `catch`, ...) or task name
    Text(String),
}

impl fmt::Display for PositionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "{i}"),
            Self::Text(t) => write!(f, "{t}"),
        }
    }
}

/// Position of a node in the workflow tree
///
/// Positions are structural: equality and hashing are over the token
/// sequence, and the string form is a JSON pointer. The root position is
/// `/` (no tokens).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Position {
    tokens: Vec<PositionToken>,
}

impl Position {
    /// The root position `/`
    pub fn root() -> Self {
        Self { tokens: vec![] }
    }

    /// Whether this is the root position
    pub fn is_root(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Tokens of this position, outermost first
    pub fn tokens(&self) -> &[PositionToken] {
        &self.tokens
    }

    /// Number of tokens (pointer depth, not task nesting depth)
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether the position has no tokens
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Append a structural marker token (`do`, `try`, `catch`, ...)
    pub fn push_marker(&self, marker: &str) -> Self {
        self.push_text(marker)
    }

    /// Append a task name token
    pub fn push_name(&self, name: &str) -> Self {
        self.push_text(name)
    }

    /// Append a list index token
    pub fn push_index(&self, index: usize) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.push(PositionToken::Index(index));
        Self { tokens }
    }

    fn push_text(&self, text: &str) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.push(PositionToken::Text(text.to_string()));
        Self { tokens }
    }

    /// Parent position, or `None` for the root
    pub fn parent(&self) -> Option<Self> {
        if self.tokens.is_empty() {
            return None;
        }
        Some(Self {
            tokens: self.tokens[..self.tokens.len() - 1].to_vec(),
        })
    }

    /// Whether `self` is an ancestor of (or equal to) `other`
    pub fn is_prefix_of(&self, other: &Position) -> bool {
        other.tokens.len() >= self.tokens.len()
            && self.tokens == other.tokens[..self.tokens.len()]
    }

    /// Parse a position from its JSON-pointer form
    ///
    /// Pure-numeric tokens parse as indexes; everything else is text.
    pub fn parse(s: &str) -> Result<Self, PositionParseError> {
        let s = s.trim();
        if s == "/" || s.is_empty() {
            return Ok(Self::root());
        }
        let stripped = s
            .strip_prefix('/')
            .ok_or_else(|| PositionParseError::MissingSlash(s.to_string()))?;
        let mut tokens = Vec::new();
        for raw in stripped.split('/') {
            if raw.is_empty() {
                return Err(PositionParseError::EmptyToken(s.to_string()));
            }
            match raw.parse::<usize>() {
                Ok(index) => tokens.push(PositionToken::Index(index)),
                Err(_) => tokens.push(PositionToken::Text(raw.to_string())),
            }
        }
        Ok(Self { tokens })
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.tokens.is_empty() {
            return write!(f, "/");
        }
        for token in &self.tokens {
            write!(f, "/{token}")?;
        }
        Ok(())
    }
}

impl Serialize for Position {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Position {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Position::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Position parse failures
#[derive(Debug, thiserror::Error)]
pub enum PositionParseError {
    /// Pointer did not start with `/`
    #[error("position must start with '/': {0}")]
    MissingSlash(String),

    /// Pointer contained an empty token (`//`)
    #[error("position contains an empty token: {0}")]
    EmptyToken(String),
}
