//! Composition root.
//!
//! [`MeshBuilder`] collects stub and exception registrations at bootstrap,
//! freezes them into read-only registries and wires the client, outbox
//! factory, provisioner and lease manager around the same collaborators.

use crate::client::RpcClient;
use crate::lease::LeaseManager;
use crate::outbox::OutboxFactory;
use crate::provisioner::{ProvisionReport, TopicProvisioner};
use meshbus_core::broker::{AdminConnector, BrokerTransport, ProvisionError};
use meshbus_core::config::{ConfigError, MeshConfig};
use meshbus_core::error::RemoteError;
use meshbus_core::exception::{
    BoxedDomainError, ExceptionRegistry, ExceptionRegistryBuilder, RemoteException,
};
use meshbus_core::lock::LockStore;
use meshbus_core::registry::{
    DependencyRegistry, DependencyRegistryBuilder, RemoteStub, StubDescriptor,
};
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// Errors assembling a [`Mesh`].
#[derive(Error, Debug)]
pub enum MeshError {
    /// Configuration failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The broker transport could not be created.
    #[error("Failed to create broker transport: {0}")]
    Transport(Box<dyn StdError + Send + Sync>),
}

/// Bootstrap-time registration.
///
/// # Example
///
/// ```no_run
/// use meshbus_core::config::MeshConfig;
/// use meshbus_runtime::MeshBuilder;
/// # use meshbus_core::{AdminConnector, BrokerTransport, LockStore};
/// # use std::sync::Arc;
/// # fn example(
/// #     transport: Arc<dyn BrokerTransport>,
/// #     admin: Arc<dyn AdminConnector>,
/// #     locks: Arc<dyn LockStore>,
/// # ) -> Result<(), Box<dyn std::error::Error>> {
/// let mesh = MeshBuilder::new(MeshConfig::from_env()?)
///     .subscribe_reply("users.get")
///     .build(|_config, _registry| Ok::<_, std::convert::Infallible>(transport), admin, locks)?;
/// # let _ = mesh;
/// # Ok(())
/// # }
/// ```
pub struct MeshBuilder {
    config: MeshConfig,
    dependencies: DependencyRegistryBuilder,
    exceptions: ExceptionRegistryBuilder,
}

impl MeshBuilder {
    /// Start registration with `config`.
    #[must_use]
    pub fn new(config: MeshConfig) -> Self {
        Self {
            config,
            dependencies: DependencyRegistry::builder(),
            exceptions: ExceptionRegistry::builder(),
        }
    }

    /// Register a typed stub.
    #[must_use]
    pub fn register_stub<S: RemoteStub>(mut self) -> Self {
        self.dependencies = self.dependencies.register_stub::<S>();
        self
    }

    /// Register a stub by descriptor.
    #[must_use]
    pub fn register_descriptor(mut self, stub: StubDescriptor) -> Self {
        self.dependencies = self.dependencies.register(stub);
        self
    }

    /// Consume replies for `pattern` without a stub.
    #[must_use]
    pub fn subscribe_reply(mut self, pattern: impl Into<String>) -> Self {
        self.dependencies = self.dependencies.subscribe_reply(pattern);
        self
    }

    /// Register a typed remote exception.
    #[must_use]
    pub fn register_exception<E: RemoteException>(mut self) -> Self {
        self.exceptions = self.exceptions.register::<E>();
        self
    }

    /// Register an exception factory by code.
    #[must_use]
    pub fn register_exception_fn<F>(mut self, code: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&RemoteError) -> BoxedDomainError + Send + Sync + 'static,
    {
        self.exceptions = self.exceptions.register_fn(code, factory);
        self
    }

    /// Freeze the registries and wire the mesh.
    ///
    /// `transport` is called once with the frozen dependency registry, so a
    /// transport can subscribe to every registered reply channel.
    ///
    /// # Errors
    ///
    /// Returns [`MeshError::Config`] if the configuration is invalid, or
    /// [`MeshError::Transport`] if `transport` fails.
    pub fn build<F, E>(
        self,
        transport: F,
        admin: Arc<dyn AdminConnector>,
        locks: Arc<dyn LockStore>,
    ) -> Result<Mesh, MeshError>
    where
        F: FnOnce(&MeshConfig, &Arc<DependencyRegistry>) -> Result<Arc<dyn BrokerTransport>, E>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        self.config.validate()?;

        let dependencies = Arc::new(self.dependencies.build());
        let exceptions = Arc::new(self.exceptions.build());
        let transport =
            transport(&self.config, &dependencies).map_err(|e| MeshError::Transport(e.into()))?;
        let namer = self.config.broker.topic_namer();

        let client = RpcClient::new(transport)
            .with_namer(namer.clone())
            .with_exceptions(exceptions)
            .with_dependencies(Arc::clone(&dependencies));

        tracing::info!(
            prefix = ?namer.prefix(),
            reply_topics = dependencies.subscribed_topics().len(),
            "Mesh assembled"
        );

        Ok(Mesh {
            outbox: OutboxFactory::new(client.clone(), self.config.outbox),
            provisioner: TopicProvisioner::new(admin, namer, self.config.provisioning),
            leases: LeaseManager::new(locks, self.config.lease),
            client,
            dependencies,
        })
    }
}

/// A wired mesh, shared by the whole process.
#[derive(Clone)]
pub struct Mesh {
    /// RPC client.
    pub client: RpcClient,
    /// Outbox factory; one outbox per unit of work.
    pub outbox: OutboxFactory,
    /// Topic provisioner.
    pub provisioner: TopicProvisioner,
    /// Lease manager.
    pub leases: LeaseManager,
    dependencies: Arc<DependencyRegistry>,
}

impl Mesh {
    /// Frozen dependency registry.
    #[must_use]
    pub const fn dependencies(&self) -> &Arc<DependencyRegistry> {
        &self.dependencies
    }

    /// Provision every registered dependency topic (with its reply channel)
    /// plus `event_patterns`.
    ///
    /// # Errors
    ///
    /// Returns the first [`ProvisionError`].
    pub async fn provision<E: AsRef<str>>(
        &self,
        event_patterns: &[E],
    ) -> Result<ProvisionReport, ProvisionError> {
        let requests: Vec<&str> = self
            .dependencies
            .subscribed_topics()
            .iter()
            .map(String::as_str)
            .collect();
        self.provisioner
            .ensure_topics(requests.as_slice(), event_patterns)
            .await
    }
}
