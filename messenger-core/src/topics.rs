//! Subscription patterns and the topic registry
//!
//! A pattern is either an exact topic or a prefix. In text form a prefix
//! pattern is written with a trailing [`WILDCARD`]: `"Sensor/*"` matches
//! every topic starting with `"Sensor/"`. Matching is case-sensitive and
//! byte-for-byte, with no normalization.

use std::collections::{BTreeSet, HashMap};

use crate::broker::ConnectionId;
use crate::error::ProtocolError;

/// Trailing marker that turns a pattern into a prefix pattern.
pub const WILDCARD: char = '*';

/// What a connection listens on
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubscriptionPattern {
    /// Matches one topic, by equality
    Exact(String),
    /// Matches every topic that starts with the prefix
    Prefix(String),
}

impl SubscriptionPattern {
    /// Parse the text form, where a trailing `*` marks a prefix pattern.
    pub fn parse(pattern: &str) -> Result<Self, ProtocolError> {
        if pattern.is_empty() {
            return Err(ProtocolError::PatternEmpty);
        }
        Ok(match pattern.strip_suffix(WILDCARD) {
            Some(prefix) => SubscriptionPattern::Prefix(prefix.to_owned()),
            None => SubscriptionPattern::Exact(pattern.to_owned()),
        })
    }

    pub fn exact(topic: impl Into<String>) -> Self {
        SubscriptionPattern::Exact(topic.into())
    }

    pub fn prefix(prefix: impl Into<String>) -> Self {
        SubscriptionPattern::Prefix(prefix.into())
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            SubscriptionPattern::Exact(exact) => exact == topic,
            SubscriptionPattern::Prefix(prefix) => topic.starts_with(prefix.as_str()),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, SubscriptionPattern::Prefix(_))
    }
}

impl core::fmt::Display for SubscriptionPattern {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            SubscriptionPattern::Exact(topic) => f.write_str(topic),
            SubscriptionPattern::Prefix(prefix) => write!(f, "{}{}", prefix, WILDCARD),
        }
    }
}

impl core::str::FromStr for SubscriptionPattern {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for SubscriptionPattern {
    type Error = ProtocolError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

/// Topic registry
///
/// Reverse index from patterns to the connections listening on them.
///
/// # Design
///
/// The registry is organized by pattern, not by connection. Exact patterns
/// live in a hash map keyed by topic; prefix patterns live in a map keyed by
/// prefix and are found by probing every prefix of the published topic.
/// A publish therefore costs one hash lookup plus one lookup per character
/// boundary of the topic, independent of the number of connections.
///
/// Connections are referred to by [`ConnectionId`] only, so removing one
/// never invalidates anything a publish is holding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicRegistry {
    exact: HashMap<String, BTreeSet<ConnectionId>>,
    prefixes: HashMap<String, BTreeSet<ConnectionId>>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` under `pattern`.
    ///
    /// Returns false if it was already there (listening twice is a no-op).
    pub fn listen(&mut self, id: ConnectionId, pattern: &SubscriptionPattern) -> bool {
        let entry = match pattern {
            SubscriptionPattern::Exact(topic) => self.exact.entry(topic.clone()).or_default(),
            SubscriptionPattern::Prefix(prefix) => self.prefixes.entry(prefix.clone()).or_default(),
        };
        entry.insert(id)
    }

    /// Remove `id` from `pattern`.
    ///
    /// Returns true if the subscription was removed, false if not found.
    /// Automatically cleans up empty entries.
    pub fn unlisten(&mut self, id: ConnectionId, pattern: &SubscriptionPattern) -> bool {
        match pattern {
            SubscriptionPattern::Exact(topic) => remove_from(&mut self.exact, topic, id),
            SubscriptionPattern::Prefix(prefix) => remove_from(&mut self.prefixes, prefix, id),
        }
    }

    /// Remove `id` from every pattern in `patterns`.
    ///
    /// Called when a connection goes away. Returns the number of entries removed.
    pub fn remove_connection<'a>(
        &mut self,
        id: ConnectionId,
        patterns: impl IntoIterator<Item = &'a SubscriptionPattern>,
    ) -> usize {
        patterns
            .into_iter()
            .filter(|pattern| self.unlisten(id, pattern))
            .count()
    }

    /// All connections with at least one pattern matching `topic`.
    ///
    /// Each connection appears once no matter how many of its patterns match.
    pub fn subscribers(&self, topic: &str) -> BTreeSet<ConnectionId> {
        let mut subscribers = BTreeSet::new();

        if let Some(ids) = self.exact.get(topic) {
            subscribers.extend(ids.iter().copied());
        }

        if !self.prefixes.is_empty() {
            let boundaries = topic
                .char_indices()
                .map(|(idx, _)| idx)
                .chain(core::iter::once(topic.len()));
            for end in boundaries {
                if let Some(ids) = self.prefixes.get(&topic[..end]) {
                    subscribers.extend(ids.iter().copied());
                }
            }
        }

        subscribers
    }

    /// Number of distinct patterns with at least one listener
    pub fn pattern_count(&self) -> usize {
        self.exact.len() + self.prefixes.len()
    }

    /// Total number of (pattern, connection) pairs
    pub fn subscription_count(&self) -> usize {
        self.exact.values().map(BTreeSet::len).sum::<usize>()
            + self.prefixes.values().map(BTreeSet::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.prefixes.is_empty()
    }
}

fn remove_from(
    map: &mut HashMap<String, BTreeSet<ConnectionId>>,
    key: &str,
    id: ConnectionId,
) -> bool {
    let Some(ids) = map.get_mut(key) else {
        return false;
    };
    let removed = ids.remove(&id);
    if ids.is_empty() {
        map.remove(key);
    }
    removed
}
