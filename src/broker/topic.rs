//! Topic routing keys
//!
//! Routing keys are dot-separated words. A binding key may contain the
//! wildcards `*` (exactly one word) and `#` (zero or more words), with the
//! same semantics as an AMQP topic exchange.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const WORD_SEPARATOR: char = '.';
const ONE_WORD: &str = "*";
const ANY_WORDS: &str = "#";

/// A validated routing key or binding pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutingKey(String);

impl RoutingKey {
    /// Parse and validate a routing key
    ///
    /// Rejects empty keys, empty words (`a..b`, trailing dots) and wildcards
    /// that are not a whole word (`a.b*`).
    pub fn parse(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();

        if trimmed.is_empty() {
            return Err(Error::invalid("routing key is empty"));
        }

        for word in trimmed.split(WORD_SEPARATOR) {
            if word.is_empty() {
                return Err(Error::invalid(format!(
                    "routing key {trimmed:?} has an empty word"
                )));
            }
            if word != ONE_WORD
                && word != ANY_WORDS
                && (word.contains('*') || word.contains('#'))
            {
                return Err(Error::invalid(format!(
                    "routing key {trimmed:?}: wildcards must be whole words"
                )));
            }
            if word.chars().any(char::is_whitespace) {
                return Err(Error::invalid(format!(
                    "routing key {trimmed:?} contains whitespace"
                )));
            }
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the key contains a wildcard word
    pub fn is_pattern(&self) -> bool {
        self.words().any(|w| w == ONE_WORD || w == ANY_WORDS)
    }

    /// Check whether a concrete routing key is matched by this binding key
    pub fn matches(&self, routing_key: &str) -> bool {
        let pattern: Vec<&str> = self.words().collect();
        let key: Vec<&str> = routing_key.split(WORD_SEPARATOR).collect();
        match_words(&pattern, &key)
    }

    fn words(&self) -> impl Iterator<Item = &str> {
        self.0.split(WORD_SEPARATOR)
    }
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&ANY_WORDS, rest)) => {
            // `#` absorbs zero or more words
            (0..=key.len()).any(|skip| match_words(rest, &key[skip..]))
        }
        Some((&word, rest)) => match key.split_first() {
            Some((head, tail)) if word == ONE_WORD || word == *head => match_words(rest, tail),
            _ => false,
        },
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoutingKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for RoutingKey {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(value)
    }
}

impl From<RoutingKey> for String {
    fn from(key: RoutingKey) -> Self {
        key.0
    }
}
