//! Dependency registry: which remote stubs are wired to reply subscriptions.
//!
//! A request/reply call only completes if this process consumes the request's
//! `.reply` topic. A stub whose reply channel was never subscribed does not
//! fail; it hangs until the broker client times out. The registry turns that
//! hang into an immediate [`DependencyNotLoadedError`] at construction time.
//!
//! Two kinds of dependency are tracked separately:
//!
//! - `dependency_topics`: request patterns whose replies the stub needs. These
//!   feed the subscribed-topics set that the reply consumer subscribes to.
//! - `dependency_stubs`: other stubs a composite stub delegates to. These must
//!   be present in the registered-stub map.
//!
//! Both the subscribed-topics set and the stub map are filled by the builder
//! at bootstrap and never change afterwards.

use crate::topic::{PrefixedTopic, TopicNamer};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::RwLock;
use thiserror::Error;

/// Identifier of a stub.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StubId(String);

impl StubId {
    /// Wrap a stub name.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The stub name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StubId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// What a stub needs before it can make calls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StubDescriptor {
    /// Stub identity.
    pub id: StubId,
    /// Logical request patterns whose replies must be consumed.
    pub dependency_topics: Vec<String>,
    /// Stubs this stub delegates to.
    pub dependency_stubs: Vec<StubId>,
}

impl StubDescriptor {
    /// Descriptor with no dependencies.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: StubId::new(id),
            dependency_topics: Vec::new(),
            dependency_stubs: Vec::new(),
        }
    }

    /// Add reply-routed request patterns.
    #[must_use]
    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_topics
            .extend(topics.into_iter().map(Into::into));
        self
    }

    /// Add stubs this stub delegates to.
    #[must_use]
    pub fn with_stubs<I, S>(mut self, stubs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_stubs
            .extend(stubs.into_iter().map(|s| StubId::new(s)));
        self
    }

    /// Descriptor declared by a [`RemoteStub`] type.
    #[must_use]
    pub fn of<S: RemoteStub>() -> Self {
        Self::new(S::ID)
            .with_topics(S::DEPENDENCY_TOPICS.iter().copied())
            .with_stubs(S::DEPENDENCY_STUBS.iter().copied())
    }

    /// Whether the stub declares any dependency at all.
    #[must_use]
    pub fn has_dependencies(&self) -> bool {
        !self.dependency_topics.is_empty() || !self.dependency_stubs.is_empty()
    }
}

/// A typed client for a remote capability.
///
/// Implementations are built through
/// [`DependencyRegistry::create_remote_stub`], never directly, so an unwired
/// stub is refused instead of hanging on its first call.
pub trait RemoteStub: Sized {
    /// Unique stub name.
    const ID: &'static str;
    /// Logical request patterns whose replies this stub waits for.
    const DEPENDENCY_TOPICS: &'static [&'static str] = &[];
    /// Stubs this stub delegates to.
    const DEPENDENCY_STUBS: &'static [&'static str] = &[];

    /// Constructor arguments (typically an RPC client handle).
    type Args;

    /// Build the stub. Only called after verification passed.
    fn construct(args: Self::Args) -> Self;
}

/// A stub could not be verified.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "Dependency not loaded for stub '{stub}': \
     missing reply topics {missing_topics:?}, missing stubs {missing_stubs:?}"
)]
pub struct DependencyNotLoadedError {
    /// Stub that was refused.
    pub stub: StubId,
    /// Dependency topics absent from the subscribed set.
    pub missing_topics: Vec<String>,
    /// Dependency stubs absent from the registered-stub map.
    pub missing_stubs: Vec<StubId>,
}

/// Frozen registry of stubs and subscribed reply topics.
#[derive(Debug, Default)]
pub struct DependencyRegistry {
    stubs: HashMap<StubId, StubDescriptor>,
    subscribed_topics: BTreeSet<String>,
    verified: RwLock<HashMap<StubId, bool>>,
}

impl DependencyRegistry {
    /// Start building a registry.
    #[must_use]
    pub fn builder() -> DependencyRegistryBuilder {
        DependencyRegistryBuilder::default()
    }

    /// Whether a stub id is registered.
    #[must_use]
    pub fn is_registered(&self, id: &StubId) -> bool {
        self.stubs.contains_key(id)
    }

    /// Registered stub descriptor.
    #[must_use]
    pub fn descriptor(&self, id: &StubId) -> Option<&StubDescriptor> {
        self.stubs.get(id)
    }

    /// Logical request patterns whose replies this process consumes.
    #[must_use]
    pub const fn subscribed_topics(&self) -> &BTreeSet<String> {
        &self.subscribed_topics
    }

    /// Broker-facing reply channels the reply consumer must subscribe to.
    #[must_use]
    pub fn reply_topics(&self, namer: &TopicNamer) -> Vec<PrefixedTopic> {
        self.subscribed_topics
            .iter()
            .map(|topic| namer.reply_topic(topic))
            .collect()
    }

    /// Whether a stub may make calls.
    ///
    /// True when every dependency topic is subscribed and every dependency
    /// stub is registered. A stub without dependencies is trivially verified.
    /// The answer is cached per stub id.
    #[must_use]
    pub fn verify(&self, stub: &StubDescriptor) -> bool {
        let cached = self
            .verified
            .read()
            .ok()
            .and_then(|memo| memo.get(&stub.id).copied());
        if let Some(cached) = cached {
            return cached;
        }

        let verified = self.missing(stub).is_none();
        if let Ok(mut memo) = self.verified.write() {
            memo.entry(stub.id.clone()).or_insert(verified);
        }
        if !verified {
            tracing::warn!(stub = %stub.id, "Stub failed dependency verification");
        }
        verified
    }

    /// Typed shorthand for [`verify`](Self::verify).
    #[must_use]
    pub fn verify_stub<S: RemoteStub>(&self) -> bool {
        self.verify(&StubDescriptor::of::<S>())
    }

    /// Gate used right before instantiating a stub that makes remote calls.
    ///
    /// # Errors
    ///
    /// Returns [`DependencyNotLoadedError`] naming what is missing if the
    /// stub does not verify.
    pub fn create_remote_stub<S: RemoteStub>(
        &self,
        args: S::Args,
    ) -> Result<S, DependencyNotLoadedError> {
        let descriptor = StubDescriptor::of::<S>();
        if self.verify(&descriptor) {
            return Ok(S::construct(args));
        }
        Err(self
            .missing(&descriptor)
            .unwrap_or_else(|| DependencyNotLoadedError {
                stub: descriptor.id.clone(),
                missing_topics: Vec::new(),
                missing_stubs: Vec::new(),
            }))
    }

    fn missing(&self, stub: &StubDescriptor) -> Option<DependencyNotLoadedError> {
        let missing_topics: Vec<String> = stub
            .dependency_topics
            .iter()
            .filter(|topic| !self.subscribed_topics.contains(*topic))
            .cloned()
            .collect();
        let missing_stubs: Vec<StubId> = stub
            .dependency_stubs
            .iter()
            .filter(|id| !self.stubs.contains_key(*id))
            .cloned()
            .collect();

        if missing_topics.is_empty() && missing_stubs.is_empty() {
            None
        } else {
            Some(DependencyNotLoadedError {
                stub: stub.id.clone(),
                missing_topics,
                missing_stubs,
            })
        }
    }
}

/// Builder for [`DependencyRegistry`]. Registration is append-only.
#[derive(Debug, Default)]
pub struct DependencyRegistryBuilder {
    stubs: HashMap<StubId, StubDescriptor>,
    subscribed_topics: BTreeSet<String>,
}

impl DependencyRegistryBuilder {
    /// Register a stub. Its dependency topics join the subscribed set;
    /// dependency stubs do not.
    #[must_use]
    pub fn register(mut self, stub: StubDescriptor) -> Self {
        self.subscribed_topics
            .extend(stub.dependency_topics.iter().cloned());
        tracing::debug!(
            stub = %stub.id,
            topics = ?stub.dependency_topics,
            stubs = ?stub.dependency_stubs,
            "Registered stub"
        );
        self.stubs.entry(stub.id.clone()).or_insert(stub);
        self
    }

    /// Register a typed stub.
    #[must_use]
    pub fn register_stub<S: RemoteStub>(self) -> Self {
        self.register(StubDescriptor::of::<S>())
    }

    /// Subscribe to a reply channel without a stub (e.g. ad-hoc clients).
    #[must_use]
    pub fn subscribe_reply(mut self, pattern: impl Into<String>) -> Self {
        self.subscribed_topics.insert(pattern.into());
        self
    }

    /// Freeze the registry.
    #[must_use]
    pub fn build(self) -> DependencyRegistry {
        DependencyRegistry {
            stubs: self.stubs,
            subscribed_topics: self.subscribed_topics,
            verified: RwLock::new(HashMap::new()),
        }
    }
}
