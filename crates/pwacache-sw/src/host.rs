//! Lifecycle host: drives one manager through install → activate → serve.
//!
//! The host plays the runtime's part. It gates each handler on the worker
//! state, holds the phase open until the handler's future settles, applies
//! retry and timeout policy, and reports state changes.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pwacache_common::{retry_with_backoff, with_timeout};
use pwacache_net::Request;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::config::HostOptions;
use crate::manager::{ActivateReport, FetchResponse, InstallReport, OfflineCacheManager};
use crate::ServiceWorkerError;

// ==================== Types ====================

/// Unique identifier for a worker instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ServiceWorkerState {
    /// Not installed yet, or a failed install was rolled back.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and serving fetches from the cache.
    Activated,
    /// Superseded by a newer version.
    Redundant,
}

impl ServiceWorkerState {
    /// Only an activated worker answers fetches from its cache.
    pub fn controls_fetches(&self) -> bool {
        matches!(self, ServiceWorkerState::Activated)
    }
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// Events emitted by hosts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// State changed.
    StateChange {
        worker_id: ServiceWorkerId,
        version: String,
        new_state: ServiceWorkerState,
    },
    /// A lifecycle phase failed; the worker went back to its prior state.
    PhaseFailed {
        worker_id: ServiceWorkerId,
        version: String,
        phase: &'static str,
        error: String,
    },
}

// ==================== Host ====================

/// Hosts one [`OfflineCacheManager`] and enforces lifecycle ordering.
pub struct ServiceWorkerHost {
    id: ServiceWorkerId,
    manager: Arc<OfflineCacheManager>,
    options: HostOptions,
    state: RwLock<ServiceWorkerState>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl ServiceWorkerHost {
    /// Create a host with its own event channel.
    pub fn new(
        manager: OfflineCacheManager,
        options: HostOptions,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self::with_events(manager, options, event_tx), event_rx)
    }

    /// Create a host reporting on an existing channel.
    pub fn with_events(
        manager: OfflineCacheManager,
        options: HostOptions,
        event_tx: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Self {
            id: ServiceWorkerId::new(),
            manager: Arc::new(manager),
            options,
            state: RwLock::new(ServiceWorkerState::Parsed),
            event_tx,
        }
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.id
    }

    pub fn version(&self) -> &str {
        self.manager.version()
    }

    pub fn manager(&self) -> &OfflineCacheManager {
        &self.manager
    }

    /// Current state.
    pub async fn state(&self) -> ServiceWorkerState {
        *self.state.read().await
    }

    /// Move from `from` to `to`, or fail without changing anything.
    async fn transition(
        &self,
        from: ServiceWorkerState,
        to: ServiceWorkerState,
    ) -> Result<(), ServiceWorkerError> {
        let mut state = self.state.write().await;
        if *state != from {
            return Err(ServiceWorkerError::StateError(format!(
                "{} is {}, expected {}",
                self.id, *state, from
            )));
        }
        *state = to;
        drop(state);
        self.announce(to);
        Ok(())
    }

    async fn set_state(&self, to: ServiceWorkerState) {
        *self.state.write().await = to;
        self.announce(to);
    }

    fn announce(&self, new_state: ServiceWorkerState) {
        debug!(worker = %self.id, version = self.version(), state = %new_state, "Worker state changed");
        // No receiver is fine; events are advisory.
        let _ = self.event_tx.send(WorkerEvent::StateChange {
            worker_id: self.id,
            version: self.version().to_string(),
            new_state,
        });
    }

    fn report_failure(&self, phase: &'static str, error: &ServiceWorkerError) {
        warn!(worker = %self.id, version = self.version(), phase, error = %error, "Lifecycle phase failed");
        let _ = self.event_tx.send(WorkerEvent::PhaseFailed {
            worker_id: self.id,
            version: self.version().to_string(),
            phase,
            error: error.to_string(),
        });
    }

    /// Dispatch the install event.
    ///
    /// On failure the worker returns to `Parsed` and may be installed again.
    pub async fn install(&self) -> Result<InstallReport, ServiceWorkerError> {
        self.transition(ServiceWorkerState::Parsed, ServiceWorkerState::Installing)
            .await?;

        let timeout = self.options.phase_timeout;
        let manager = &self.manager;
        let outcome = with_timeout(timeout, || {
            retry_with_backoff(
                &self.options.install_retry,
                ServiceWorkerError::is_retryable,
                || manager.on_install(),
            )
        })
        .await
        .unwrap_or_else(|_| {
            Err(ServiceWorkerError::Timeout {
                phase: "install",
                timeout,
            })
        });

        match outcome {
            Ok(report) => {
                self.set_state(ServiceWorkerState::Installed).await;
                info!(worker = %self.id, version = %report.version, cached = report.cached, "Worker installed");
                Ok(report)
            }
            Err(e) => {
                self.report_failure("install", &e);
                self.set_state(ServiceWorkerState::Parsed).await;
                Err(e)
            }
        }
    }

    /// Dispatch the activate event. Requires a completed install.
    ///
    /// On failure the worker stays installed and activation may be retried.
    pub async fn activate(&self) -> Result<ActivateReport, ServiceWorkerError> {
        self.transition(ServiceWorkerState::Installed, ServiceWorkerState::Activating)
            .await?;

        let timeout = self.options.phase_timeout;
        let outcome = with_timeout(timeout, || self.manager.on_activate())
            .await
            .unwrap_or_else(|_| {
                Err(ServiceWorkerError::Timeout {
                    phase: "activate",
                    timeout,
                })
            });

        match outcome {
            Ok(report) => {
                self.set_state(ServiceWorkerState::Activated).await;
                info!(worker = %self.id, version = %report.version, purged = report.deleted.len(), "Worker activated");
                Ok(report)
            }
            Err(e) => {
                self.report_failure("activate", &e);
                self.set_state(ServiceWorkerState::Installed).await;
                Err(e)
            }
        }
    }

    /// Dispatch a fetch event.
    ///
    /// An activated worker answers cache-first. In any other state the
    /// request is not controlled and goes straight to the network.
    pub async fn fetch(&self, request: Request) -> Result<FetchResponse, ServiceWorkerError> {
        if self.state().await.controls_fetches() {
            self.manager.on_fetch(request).await
        } else {
            self.manager.fetch_from_network(request).await
        }
    }

    /// Retire this worker after a newer version took over.
    pub async fn mark_redundant(&self) {
        self.set_state(ServiceWorkerState::Redundant).await;
    }
}

impl fmt::Debug for ServiceWorkerHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorkerHost")
            .field("id", &self.id)
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::manager::testing::ScriptedFetcher;
    use crate::manager::ResponseSource;
    use crate::storage::{CacheStorage, MemoryCacheStorage};
    use http::StatusCode;
    use pwacache_common::RetryConfig;
    use std::time::Duration;
    use url::Url;

    const ORIGIN: &str = "https://app.example/";

    fn host_with(
        version: &str,
        storage: Arc<MemoryCacheStorage>,
        fetcher: Arc<ScriptedFetcher>,
        options: HostOptions,
    ) -> (ServiceWorkerHost, mpsc::UnboundedReceiver<WorkerEvent>) {
        let config = CacheConfig::new(version, Url::parse(ORIGIN).unwrap(), ["/", "/index.html"]);
        let manager = OfflineCacheManager::new(config, storage, fetcher).unwrap();
        ServiceWorkerHost::new(manager, options)
    }

    fn site() -> Arc<ScriptedFetcher> {
        Arc::new(ScriptedFetcher::serving(&[
            ("/", "home"),
            ("/index.html", "<html>"),
        ]))
    }

    fn get(path: &str) -> Request {
        Request::get(Url::parse(ORIGIN).unwrap().join(path).unwrap())
    }

    fn states(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<ServiceWorkerState> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let WorkerEvent::StateChange { new_state, .. } = event {
                seen.push(new_state);
            }
        }
        seen
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let storage = Arc::new(MemoryCacheStorage::new());
        storage.open("v1").await.unwrap();
        let (host, mut rx) = host_with("v2", storage.clone(), site(), HostOptions::default());
        assert_eq!(host.state().await, ServiceWorkerState::Parsed);

        host.install().await.unwrap();
        assert_eq!(host.state().await, ServiceWorkerState::Installed);

        let report = host.activate().await.unwrap();
        assert_eq!(report.deleted, vec!["v1"]);
        assert_eq!(host.state().await, ServiceWorkerState::Activated);

        assert_eq!(
            states(&mut rx),
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );
    }

    #[tokio::test]
    async fn test_activate_requires_install() {
        let storage = Arc::new(MemoryCacheStorage::new());
        storage.open("v1").await.unwrap();
        let (host, _rx) = host_with("v2", storage.clone(), site(), HostOptions::default());

        let err = host.activate().await.unwrap_err();

        assert!(matches!(err, ServiceWorkerError::StateError(_)));
        // Nothing was purged.
        assert!(storage.has("v1").await.unwrap());
    }

    #[tokio::test]
    async fn test_install_twice_is_rejected() {
        let (host, _rx) = host_with(
            "v1",
            Arc::new(MemoryCacheStorage::new()),
            site(),
            HostOptions::default(),
        );
        host.install().await.unwrap();

        assert!(matches!(
            host.install().await,
            Err(ServiceWorkerError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_install_returns_to_parsed() {
        let fetcher = site();
        fetcher.fail("/index.html");
        let (host, mut rx) = host_with(
            "v1",
            Arc::new(MemoryCacheStorage::new()),
            fetcher.clone(),
            HostOptions::default(),
        );

        assert!(host.install().await.is_err());
        assert_eq!(host.state().await, ServiceWorkerState::Parsed);

        let mut failures = 0;
        while let Ok(event) = rx.try_recv() {
            if let WorkerEvent::PhaseFailed { phase, .. } = event {
                assert_eq!(phase, "install");
                failures += 1;
            }
        }
        assert_eq!(failures, 1);

        // The next install event starts over.
        fetcher.recover("/index.html");
        host.install().await.unwrap();
        assert_eq!(host.state().await, ServiceWorkerState::Installed);
    }

    #[tokio::test]
    async fn test_install_retries_transient_failures() {
        let fetcher = site();
        fetcher.serve("/index.html", StatusCode::SERVICE_UNAVAILABLE, "busy");
        let options = HostOptions {
            install_retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let (host, _rx) = host_with(
            "v1",
            Arc::new(MemoryCacheStorage::new()),
            fetcher.clone(),
            options,
        );

        let err = host.install().await.unwrap_err();

        assert!(matches!(err, ServiceWorkerError::InstallAssetStatus { .. }));
        let index_fetches = fetcher
            .seen()
            .iter()
            .filter(|p| p.as_str() == "/index.html")
            .count();
        assert_eq!(index_fetches, 3);
    }

    #[tokio::test]
    async fn test_install_does_not_retry_permanent_failures() {
        let fetcher = site();
        fetcher.serve("/index.html", StatusCode::NOT_FOUND, "");
        let options = HostOptions {
            install_retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                jitter: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let (host, _rx) = host_with(
            "v1",
            Arc::new(MemoryCacheStorage::new()),
            fetcher.clone(),
            options,
        );

        assert!(host.install().await.is_err());
        let index_fetches = fetcher
            .seen()
            .iter()
            .filter(|p| p.as_str() == "/index.html")
            .count();
        assert_eq!(index_fetches, 1);
    }

    #[tokio::test]
    async fn test_uncontrolled_fetch_bypasses_cache() {
        let storage = Arc::new(MemoryCacheStorage::new());
        let fetcher = site();
        let (host, _rx) = host_with("v1", storage, fetcher.clone(), HostOptions::default());
        host.install().await.unwrap();
        let before = fetcher.calls();

        // Installed but not active: the cache is populated, yet not consulted.
        let served = host.fetch(get("/index.html")).await.unwrap();
        assert_eq!(served.source, ResponseSource::Network);
        assert_eq!(fetcher.calls(), before + 1);

        host.activate().await.unwrap();
        let served = host.fetch(get("/index.html")).await.unwrap();
        assert_eq!(served.source, ResponseSource::Cache);
        assert_eq!(fetcher.calls(), before + 1);
    }

    #[tokio::test]
    async fn test_redundant_worker_stops_serving_from_cache() {
        let fetcher = site();
        let (host, _rx) = host_with(
            "v1",
            Arc::new(MemoryCacheStorage::new()),
            fetcher,
            HostOptions::default(),
        );
        host.install().await.unwrap();
        host.activate().await.unwrap();

        host.mark_redundant().await;

        assert_eq!(host.state().await, ServiceWorkerState::Redundant);
        let served = host.fetch(get("/")).await.unwrap();
        assert_eq!(served.source, ResponseSource::Network);
    }

    struct StalledFetcher;

    #[async_trait::async_trait]
    impl pwacache_net::Fetcher for StalledFetcher {
        async fn fetch(
            &self,
            _request: Request,
        ) -> Result<pwacache_net::Response, pwacache_net::NetError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(pwacache_net::NetError::RequestFailed("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_install_aborted_after_phase_timeout() {
        let config = CacheConfig::new("v1", Url::parse(ORIGIN).unwrap(), ["/"]);
        let manager = OfflineCacheManager::new(
            config,
            Arc::new(MemoryCacheStorage::new()),
            Arc::new(StalledFetcher),
        )
        .unwrap();
        let options = HostOptions {
            phase_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (host, _rx) = ServiceWorkerHost::new(manager, options);

        let err = host.install().await.unwrap_err();

        assert!(matches!(
            err,
            ServiceWorkerError::Timeout { phase: "install", .. }
        ));
        assert_eq!(host.state().await, ServiceWorkerState::Parsed);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ServiceWorkerState::Activated.to_string(), "activated");
        assert_eq!(ServiceWorkerState::default(), ServiceWorkerState::Parsed);
        assert!(!ServiceWorkerState::Installed.controls_fetches());
    }
}
