//! Topic naming.
//!
//! Callers always speak in *logical* topic names (`"limits.request"`). Only the
//! outermost layer that touches the broker turns a logical name into the name the
//! broker sees, by prepending the deployment-scoped prefix:
//!
//! ```text
//! logical:   limits.request
//! prefixed:  staging.limits.request
//! reply:     staging.limits.request.reply
//! ```
//!
//! The result of that transformation is a [`PrefixedTopic`], which can only be
//! produced by a [`TopicNamer`]. Broker-facing traits accept `&PrefixedTopic`
//! rather than `&str`, so a name can never be prefixed twice.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Suffix appended to a request topic to derive its reply channel.
pub const REPLY_SUFFIX: &str = ".reply";

/// A topic name exactly as the broker sees it (prefix already applied).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct PrefixedTopic(String);

impl PrefixedTopic {
    /// The broker-facing name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is a reply channel.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.0.ends_with(REPLY_SUFFIX)
    }

    /// The reply channel paired with this request topic.
    #[must_use]
    pub fn reply(&self) -> Self {
        Self(format!("{}{REPLY_SUFFIX}", self.0))
    }

    /// Wrap a name received *from* the broker (metadata listings, consumed
    /// messages). Never use this on a logical name.
    #[must_use]
    pub fn from_broker(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Consume into the inner string.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for PrefixedTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for PrefixedTopic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Applies the deployment-scoped topic prefix.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicNamer {
    prefix: Option<String>,
}

impl TopicNamer {
    /// Create a namer. An empty prefix behaves like no prefix.
    #[must_use]
    pub fn new(prefix: Option<String>) -> Self {
        Self {
            prefix: prefix.filter(|p| !p.is_empty()),
        }
    }

    /// A namer that leaves names untouched.
    #[must_use]
    pub const fn unprefixed() -> Self {
        Self { prefix: None }
    }

    /// The configured prefix, if any.
    #[must_use]
    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// `prefix ? "{prefix}.{name}" : name`
    #[must_use]
    pub fn prefixed(&self, logical: &str) -> PrefixedTopic {
        match &self.prefix {
            Some(prefix) => PrefixedTopic(format!("{prefix}.{logical}")),
            None => PrefixedTopic(logical.to_string()),
        }
    }

    /// `prefixed(name) + ".reply"`
    #[must_use]
    pub fn reply_topic(&self, logical: &str) -> PrefixedTopic {
        self.prefixed(logical).reply()
    }

    /// Whether a broker topic belongs to this deployment.
    ///
    /// Without a prefix every topic is ours; with one, only names starting
    /// with it are.
    #[must_use]
    pub fn owns(&self, broker_name: &str) -> bool {
        self.prefix
            .as_deref()
            .is_none_or(|prefix| broker_name.starts_with(prefix))
    }
}

/// A topic to provision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TopicSpec {
    /// Broker-facing name.
    pub name: PrefixedTopic,
    /// Whether this is a `.reply` channel.
    pub is_reply_topic: bool,
    /// Partition count to create with.
    pub partitions: i32,
    /// Replication factor to create with.
    pub replication_factor: i32,
}

impl TopicSpec {
    /// Build a spec for `name` with the given defaults.
    #[must_use]
    pub fn new(name: PrefixedTopic, partitions: i32, replication_factor: i32) -> Self {
        Self {
            is_reply_topic: name.is_reply(),
            name,
            partitions,
            replication_factor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn prefix_is_joined_with_a_dot() {
        let namer = TopicNamer::new(Some("staging".to_string()));
        assert_eq!(namer.prefixed("limits.request").as_str(), "staging.limits.request");
        assert_eq!(
            namer.reply_topic("limits.request").as_str(),
            "staging.limits.request.reply"
        );
    }

    #[test]
    fn empty_prefix_is_no_prefix() {
        let namer = TopicNamer::new(Some(String::new()));
        assert_eq!(namer.prefix(), None);
        assert_eq!(namer.prefixed("a").as_str(), "a");
        assert_eq!(namer.reply_topic("a").as_str(), "a.reply");
    }

    #[test]
    fn ownership_follows_prefix() {
        let namer = TopicNamer::new(Some("prod".to_string()));
        assert!(namer.owns("prod.withdrawals"));
        assert!(!namer.owns("staging.withdrawals"));
        assert!(TopicNamer::unprefixed().owns("anything"));
    }

    #[test]
    fn spec_detects_reply_topics() {
        let namer = TopicNamer::unprefixed();
        assert!(TopicSpec::new(namer.reply_topic("x"), 1, 1).is_reply_topic);
        assert!(!TopicSpec::new(namer.prefixed("x"), 1, 1).is_reply_topic);
    }

    proptest! {
        #[test]
        fn prefixing_adds_prefix_exactly_once(
            prefix in "[a-z]{1,8}",
            name in "[a-z]{1,8}(\\.[a-z]{1,8}){0,2}",
        ) {
            let namer = TopicNamer::new(Some(prefix.clone()));
            let topic = namer.prefixed(&name);
            let expected = format!("{prefix}.{name}");
            prop_assert_eq!(topic.as_str(), expected.as_str());
            prop_assert!(namer.owns(topic.as_str()));
        }

        #[test]
        fn reply_is_prefixed_plus_suffix(prefix in "[a-z]{0,8}", name in "[a-z]{1,12}") {
            let namer = TopicNamer::new(Some(prefix));
            let reply = namer.reply_topic(&name);
            let expected = format!("{}{REPLY_SUFFIX}", namer.prefixed(&name));
            prop_assert_eq!(reply.as_str(), expected.as_str());
        }
    }
}
