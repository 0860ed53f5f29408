// ── Service facade ──
//
// Wires store, providers, tunnel directory, allocator, orchestrator, and
// the reconciliation ticker from a `ServiceConfig`, and owns their
// startup and shutdown order.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::ServiceConfig;
use crate::error::CoreError;
use crate::ippool::IpPoolAllocator;
use crate::orchestrator::PeerOrchestrator;
use crate::provider::{ProviderRegistry, RouterOsProvider};
use crate::reconcile::ReconciliationService;
use crate::repository::{InterfaceRepository, PeerRepository, UserDirectory};
use crate::store::{MemoryStore, StaticDirectory};
use crate::tunnels::TunnelDirectory;

/// The running system. Cheaply cloneable.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    providers: Arc<ProviderRegistry>,
    tunnels: Arc<TunnelDirectory>,
    pools: Arc<IpPoolAllocator>,
    orchestrator: PeerOrchestrator,
    reconciler: ReconciliationService,
}

impl Service {
    /// Build with the JSON-backed store, one RouterOS provider per backend,
    /// and users from configuration.
    pub async fn build(config: &ServiceConfig) -> Result<Self, CoreError> {
        let store = Arc::new(match &config.state_file {
            Some(path) => MemoryStore::open(path).await?,
            None => MemoryStore::new(),
        });

        let mut providers = ProviderRegistry::new();
        for backend in &config.backends {
            if providers.contains(&backend.name) {
                return Err(CoreError::Config {
                    message: format!("backend '{}' is configured twice", backend.name),
                });
            }
            providers.insert(Arc::new(RouterOsProvider::new(backend)));
        }
        let directory = Arc::new(StaticDirectory::new(&config.users));

        Self::with_collaborators(config, store.clone(), store, directory, providers)
    }

    /// Build around caller-supplied collaborators.
    pub fn with_collaborators(
        config: &ServiceConfig,
        peers: Arc<dyn PeerRepository>,
        interfaces: Arc<dyn InterfaceRepository>,
        directory: Arc<dyn UserDirectory>,
        providers: ProviderRegistry,
    ) -> Result<Self, CoreError> {
        let providers = Arc::new(providers);
        let tunnels = Arc::new(TunnelDirectory::new(&config.tunnels, Arc::clone(&providers), interfaces)?);
        let pools = Arc::new(IpPoolAllocator::new(Arc::clone(&providers), Arc::clone(&peers)));
        let orchestrator = PeerOrchestrator::new(
            peers,
            Arc::clone(&tunnels),
            Arc::clone(&pools),
            Arc::clone(&providers),
            directory,
            config.task_queue_size,
            config.key_attempts,
        );
        let reconciler = ReconciliationService::new(
            Arc::clone(&tunnels),
            orchestrator.clone(),
            config.reconcile_interval,
        );
        Ok(Self {
            inner: Arc::new(ServiceInner {
                providers,
                tunnels,
                pools,
                orchestrator,
                reconciler,
            }),
        })
    }

    pub fn orchestrator(&self) -> &PeerOrchestrator {
        &self.inner.orchestrator
    }

    pub fn tunnels(&self) -> &TunnelDirectory {
        &self.inner.tunnels
    }

    pub fn pools(&self) -> &IpPoolAllocator {
        &self.inner.pools
    }

    /// Refresh tunnels once, then start the worker and the ticker.
    pub async fn start(&self) -> Result<(), CoreError> {
        self.inner.tunnels.refresh().await?;

        for tunnel_id in self.inner.orchestrator.tunnels_in_use().await? {
            if self.inner.tunnels.get(tunnel_id).is_err() {
                warn!(tunnel_id = %tunnel_id, "stored peers reference a tunnel that is no longer configured");
            }
        }

        self.inner.orchestrator.start().await;
        self.inner.reconciler.start().await;
        info!(
            tunnels = self.inner.tunnels.list().len(),
            backends = self.inner.providers.backends().count(),
            "service started"
        );
        Ok(())
    }

    /// Stop the ticker, drain the worker, and close device connections.
    pub async fn shutdown(&self) {
        self.inner.reconciler.stop().await;
        self.inner.orchestrator.shutdown().await;
        self.inner.providers.close_all().await;
        info!("service stopped");
    }

    // ── One-shot convenience ─────────────────────────────────────────

    /// Start without the ticker, run `f`, wait for queued work, shut down.
    pub async fn oneshot<F, Fut, T>(config: &ServiceConfig, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(Service) -> Fut,
        Fut: std::future::Future<Output = Result<T, CoreError>>,
    {
        let mut cfg = config.clone();
        cfg.reconcile_interval = Duration::ZERO;

        let service = Service::build(&cfg).await?;
        if let Err(e) = service.start().await {
            service.shutdown().await;
            return Err(e);
        }
        let result = f(service.clone()).await;
        if let Err(e) = service.orchestrator().flush().await {
            warn!(error = %e, "queued work did not finish");
        }
        service.shutdown().await;
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use secrecy::SecretString;

    use super::*;
    use crate::config::{BackendConfig, EndpointConfig, UserConfig};
    use crate::model::PeerState;
    use crate::orchestrator::CreatePeerRequest;
    use crate::testing::{FakeDirectory, FakeProvider, journal, tunnel_config};

    fn config() -> ServiceConfig {
        ServiceConfig {
            tunnels: vec![tunnel_config("wg0", "edge", &["10.0.0.0/8"])],
            users: vec![UserConfig {
                username: "alice".into(),
                password: None,
            }],
            ..ServiceConfig::default()
        }
    }

    struct CountingDirectory {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl UserDirectory for CountingDirectory {
        async fn list_valid_usernames(&self) -> Result<BTreeSet<String>, CoreError> {
            *self.calls.lock().unwrap() += 1;
            Ok(BTreeSet::from(["alice".to_owned()]))
        }

        async fn authenticate(&self, _username: &str, _password: &SecretString) -> Result<(), CoreError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn lifecycle_with_injected_collaborators() {
        let provider = FakeProvider::new("edge", "10.8.0.1/24", journal());
        let store = Arc::new(MemoryStore::new());
        let directory = Arc::new(CountingDirectory { calls: Mutex::new(0) });
        let mut cfg = config();
        cfg.reconcile_interval = Duration::from_millis(40);

        let service = Service::with_collaborators(
            &cfg,
            store.clone(),
            store,
            directory.clone(),
            (*provider.registry()).clone(),
        )
        .unwrap();
        service.start().await.unwrap();
        assert!(service.tunnels().find_by_name("wg0").unwrap().interface.present);

        let peer = service
            .orchestrator()
            .create_peer(CreatePeerRequest {
                username: "alice".into(),
                tunnel: "wg0".into(),
                profile: "default".into(),
                description: None,
                preshared_key: None,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        service.orchestrator().flush().await.unwrap();
        service.shutdown().await;

        assert!(*directory.calls.lock().unwrap() >= 1);
        assert_eq!(
            service.orchestrator().get_peer(peer.id).await.unwrap().state,
            PeerState::Provisioned
        );
        let tunnel = service.tunnels().find_by_name("wg0").unwrap();
        assert_eq!(service.pools().usage(&tunnel).await.unwrap().1, 1);
    }

    #[tokio::test]
    async fn tunnels_must_reference_known_backends() {
        let store = Arc::new(MemoryStore::new());
        let err = Service::with_collaborators(
            &config(),
            store.clone(),
            store,
            FakeDirectory::with(&[]),
            ProviderRegistry::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, CoreError::Config { .. }));
    }

    #[tokio::test]
    async fn duplicate_backends_are_rejected() {
        let backend = BackendConfig {
            name: "edge".into(),
            pool: wgkeeper_api::PoolConfig::new(wgkeeper_api::ClientConfig::new(
                "127.0.0.1",
                "admin",
                SecretString::from("secret"),
            )),
            endpoint: EndpointConfig::default(),
        };
        let cfg = ServiceConfig {
            backends: vec![backend.clone(), backend],
            ..ServiceConfig::default()
        };
        let err = Service::build(&cfg).await.err().unwrap();
        assert!(matches!(err, CoreError::Config { .. }));
    }

    #[tokio::test]
    async fn oneshot_runs_with_an_empty_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = ServiceConfig {
            state_file: Some(dir.path().join("state.json")),
            ..ServiceConfig::default()
        };

        let peers = Service::oneshot(&cfg, |service| async move { service.orchestrator().list_peers(None).await })
            .await
            .unwrap();
        assert!(peers.is_empty());
    }
}
