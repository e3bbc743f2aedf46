//! A scope's installing / waiting / active workers.
//!
//! A new version installs next to the active one under its own bucket.
//! The old bucket is only purged when the new worker activates.

use std::sync::Arc;
use std::time::Instant;

use pwacache_net::{Fetcher, Request};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info};
use url::Url;

use crate::config::HostOptions;
use crate::host::{ServiceWorkerHost, ServiceWorkerState, WorkerEvent};
use crate::manager::{
    ActivateReport, FetchResponse, InstallReport, OfflineCacheManager, ResponseSource,
};
use crate::ServiceWorkerError;

#[derive(Default)]
struct Slots {
    installing: Option<Arc<ServiceWorkerHost>>,
    waiting: Option<Arc<ServiceWorkerHost>>,
    active: Option<Arc<ServiceWorkerHost>>,
}

/// Worker registration for one scope.
pub struct Registration {
    scope: Url,
    options: HostOptions,
    // Used for requests while no worker is active.
    network: Arc<dyn Fetcher>,
    slots: RwLock<Slots>,
    last_update: RwLock<Option<Instant>>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
}

impl Registration {
    /// Create an empty registration.
    pub fn new(
        scope: Url,
        options: HostOptions,
        network: Arc<dyn Fetcher>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let registration = Self {
            scope,
            options,
            network,
            slots: RwLock::new(Slots::default()),
            last_update: RwLock::new(None),
            event_tx,
        };
        (registration, event_rx)
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    /// Whether `url` falls under this registration's scope.
    pub fn in_scope(&self, url: &Url) -> bool {
        url.as_str().starts_with(self.scope.as_str())
    }

    pub async fn installing(&self) -> Option<Arc<ServiceWorkerHost>> {
        self.slots.read().await.installing.clone()
    }

    pub async fn waiting(&self) -> Option<Arc<ServiceWorkerHost>> {
        self.slots.read().await.waiting.clone()
    }

    pub async fn active(&self) -> Option<Arc<ServiceWorkerHost>> {
        self.slots.read().await.active.clone()
    }

    /// Version tag of the worker currently serving requests.
    pub async fn active_version(&self) -> Option<String> {
        self.active().await.map(|host| host.version().to_string())
    }

    /// When `update` last ran, successful or not.
    pub async fn last_update(&self) -> Option<Instant> {
        *self.last_update.read().await
    }

    /// Install a new version alongside the active one.
    ///
    /// On success the new worker waits; a previously waiting worker is
    /// discarded. On failure the registration is left as it was.
    pub async fn update(
        &self,
        manager: OfflineCacheManager,
    ) -> Result<InstallReport, ServiceWorkerError> {
        let host = Arc::new(ServiceWorkerHost::with_events(
            manager,
            self.options.clone(),
            self.event_tx.clone(),
        ));
        {
            let mut slots = self.slots.write().await;
            if let Some(busy) = &slots.installing {
                return Err(ServiceWorkerError::StateError(format!(
                    "{} is still installing {}",
                    self.scope,
                    busy.version()
                )));
            }
            slots.installing = Some(host.clone());
        }
        *self.last_update.write().await = Some(Instant::now());
        info!(scope = %self.scope, version = host.version(), "Installing new version");

        let outcome = host.install().await;

        let superseded = {
            let mut slots = self.slots.write().await;
            slots.installing = None;
            match outcome {
                Ok(_) => slots.waiting.replace(host.clone()),
                Err(_) => Some(host.clone()),
            }
        };
        if let Some(old) = superseded {
            old.mark_redundant().await;
        }
        outcome
    }

    /// Activate the waiting worker, if any.
    ///
    /// The previous active worker keeps serving until activation succeeds,
    /// then becomes redundant. If activation fails, the worker goes back to
    /// waiting.
    pub async fn activate_waiting(&self) -> Result<Option<ActivateReport>, ServiceWorkerError> {
        let Some(next) = self.slots.write().await.waiting.take() else {
            debug!(scope = %self.scope, "Nothing waiting to activate");
            return Ok(None);
        };

        match next.activate().await {
            Ok(report) => {
                let previous = self.slots.write().await.active.replace(next);
                if let Some(previous) = previous {
                    previous.mark_redundant().await;
                }
                Ok(Some(report))
            }
            Err(e) => {
                let mut slots = self.slots.write().await;
                if slots.waiting.is_none() && next.state().await == ServiceWorkerState::Installed {
                    slots.waiting = Some(next);
                }
                Err(e)
            }
        }
    }

    /// Route an intercepted request to the active worker. Requests outside
    /// the scope, or made while no worker is active, go to the network.
    pub async fn handle_fetch(&self, request: Request) -> Result<FetchResponse, ServiceWorkerError> {
        let active = if self.in_scope(&request.url) {
            self.active().await
        } else {
            debug!(scope = %self.scope, url = %request.url, "Request outside scope");
            None
        };

        match active {
            Some(host) => host.fetch(request).await,
            None => {
                let response = self
                    .network
                    .fetch(request)
                    .await
                    .map_err(ServiceWorkerError::Network)?;
                Ok(FetchResponse {
                    response,
                    source: ResponseSource::Network,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::manager::testing::ScriptedFetcher;
    use crate::storage::{CacheStorage, MemoryCacheStorage};
    use http::StatusCode;

    const ORIGIN: &str = "https://app.example/";

    struct Fixture {
        storage: Arc<MemoryCacheStorage>,
        fetcher: Arc<ScriptedFetcher>,
        registration: Registration,
        _events: mpsc::UnboundedReceiver<WorkerEvent>,
    }

    impl Fixture {
        fn new() -> Self {
            let storage = Arc::new(MemoryCacheStorage::new());
            let fetcher = Arc::new(ScriptedFetcher::serving(&[
                ("/", "home v1"),
                ("/index.html", "<html>"),
            ]));
            let (registration, events) = Registration::new(
                Url::parse(ORIGIN).unwrap(),
                HostOptions::default(),
                fetcher.clone(),
            );
            Self {
                storage,
                fetcher,
                registration,
                _events: events,
            }
        }

        fn manager(&self, version: &str) -> OfflineCacheManager {
            let config =
                CacheConfig::new(version, Url::parse(ORIGIN).unwrap(), ["/", "/index.html"]);
            OfflineCacheManager::new(config, self.storage.clone(), self.fetcher.clone()).unwrap()
        }
    }

    fn get(path: &str) -> Request {
        Request::get(Url::parse(ORIGIN).unwrap().join(path).unwrap())
    }

    #[tokio::test]
    async fn test_no_active_worker_goes_to_network() {
        let fx = Fixture::new();

        let served = fx.registration.handle_fetch(get("/")).await.unwrap();

        assert_eq!(served.source, ResponseSource::Network);
        assert!(fx.registration.active_version().await.is_none());
    }

    #[tokio::test]
    async fn test_update_then_activate() {
        let fx = Fixture::new();

        fx.registration.update(fx.manager("v1")).await.unwrap();
        assert!(fx.registration.waiting().await.is_some());
        assert!(fx.registration.installing().await.is_none());
        assert!(fx.registration.last_update().await.is_some());

        let report = fx.registration.activate_waiting().await.unwrap().unwrap();
        assert_eq!(report.version, "v1");
        assert_eq!(fx.registration.active_version().await.as_deref(), Some("v1"));

        let served = fx.registration.handle_fetch(get("/")).await.unwrap();
        assert!(served.from_cache());
    }

    #[tokio::test]
    async fn test_new_version_installs_beside_active() {
        let fx = Fixture::new();
        fx.registration.update(fx.manager("v1")).await.unwrap();
        fx.registration.activate_waiting().await.unwrap();
        let v1 = fx.registration.active().await.unwrap();

        fx.fetcher.serve("/", StatusCode::OK, "home v2");
        fx.registration.update(fx.manager("v2")).await.unwrap();

        // v1 still active and its bucket untouched.
        assert_eq!(fx.storage.keys().await.unwrap(), vec!["v1", "v2"]);
        let served = fx.registration.handle_fetch(get("/")).await.unwrap();
        assert_eq!(served.response.body, "home v1");

        fx.registration.activate_waiting().await.unwrap();

        assert_eq!(fx.storage.keys().await.unwrap(), vec!["v2"]);
        assert_eq!(v1.state().await, ServiceWorkerState::Redundant);
        let served = fx.registration.handle_fetch(get("/")).await.unwrap();
        assert!(served.from_cache());
        assert_eq!(served.response.body, "home v2");
    }

    #[tokio::test]
    async fn test_failed_update_keeps_active() {
        let fx = Fixture::new();
        fx.registration.update(fx.manager("v1")).await.unwrap();
        fx.registration.activate_waiting().await.unwrap();

        fx.fetcher.fail("/index.html");
        assert!(fx.registration.update(fx.manager("v2")).await.is_err());

        assert!(fx.registration.waiting().await.is_none());
        assert_eq!(fx.registration.active_version().await.as_deref(), Some("v1"));
        let served = fx.registration.handle_fetch(get("/index.html")).await.unwrap();
        assert!(served.from_cache());
    }

    #[tokio::test]
    async fn test_newer_waiting_worker_replaces_older() {
        let fx = Fixture::new();
        fx.registration.update(fx.manager("v1")).await.unwrap();
        let first = fx.registration.waiting().await.unwrap();

        fx.registration.update(fx.manager("v2")).await.unwrap();

        assert_eq!(first.state().await, ServiceWorkerState::Redundant);
        assert_eq!(fx.registration.waiting().await.unwrap().version(), "v2");
    }

    #[tokio::test]
    async fn test_out_of_scope_request_skips_active_worker() {
        let fx = Fixture::new();
        fx.registration.update(fx.manager("v1")).await.unwrap();
        fx.registration.activate_waiting().await.unwrap();
        let calls_before = fx.fetcher.calls();

        // Same path as a cached asset, different origin.
        let foreign = Request::get(Url::parse("https://cdn.example/").unwrap());
        let served = fx.registration.handle_fetch(foreign).await.unwrap();

        assert_eq!(served.source, ResponseSource::Network);
        assert_eq!(fx.fetcher.calls(), calls_before + 1);
        assert!(fx.registration.handle_fetch(get("/")).await.unwrap().from_cache());
    }

    #[tokio::test]
    async fn test_activate_with_nothing_waiting() {
        let fx = Fixture::new();
        assert!(fx.registration.activate_waiting().await.unwrap().is_none());
    }

    #[test]
    fn test_scope_matching() {
        let fetcher = Arc::new(ScriptedFetcher::default());
        let (registration, _rx) = Registration::new(
            Url::parse("https://app.example/app/").unwrap(),
            HostOptions::default(),
            fetcher,
        );
        assert!(registration.in_scope(&Url::parse("https://app.example/app/index.html").unwrap()));
        assert!(!registration.in_scope(&Url::parse("https://app.example/other").unwrap()));
    }
}
