//! Stateful refresh coordinator: owns the (port, token) cache, the latest
//! quota snapshot, and the model selection, and sequences the
//! locate → resolve → fetch pipeline.
//!
//! One coordinator is created per host session and driven either by its
//! internal timer (started with [`Coordinator::start`]) or by manual
//! [`Coordinator::refresh`] calls. At most one refresh runs at a time; a
//! trigger arriving while one is in flight coalesces with it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::api::QuotaTransport;
use crate::error::RefreshError;
use crate::locator::{self, ProcessSource};
use crate::model::QuotaSnapshot;
use crate::resolver;

/// Default automatic refresh period.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(120);

/// The cached (port, token) pair currently believed valid. Retained only
/// after a successful probe or fetch; cleared as a unit on any fetch failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub port: u16,
    pub csrf_token: String,
}

/// Observable state published to rendering collaborators.
#[derive(Debug, Clone, PartialEq)]
pub enum QuotaStatus {
    /// Discovery in progress (or not yet attempted).
    Connecting,
    /// No language_server process with a CSRF token was found.
    NoProcess,
    /// No port answered the probe and no fallback was advertised.
    NoPort,
    /// Endpoint resolved, quota fetch in flight.
    Fetching,
    /// The fetch failed; the endpoint cache has been dropped.
    FetchFailed,
    /// Latest successful snapshot.
    Ok(QuotaSnapshot),
    /// Unclassified internal failure.
    Error(String),
}

/// Who asked for the refresh. Manual triggers surface their outcome to the
/// user; automatic ones only log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Manual,
    Automatic,
}

/// Result of a refresh attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Snapshot replaced; carries the model count.
    Refreshed(usize),
    /// Another refresh was already in flight; this trigger coalesced with it.
    Coalesced,
}

#[derive(Default)]
struct CoordinatorState {
    endpoint: Option<ResolvedEndpoint>,
    snapshot: Option<QuotaSnapshot>,
    selected_model: Option<String>,
}

pub struct Coordinator {
    source: Arc<dyn ProcessSource>,
    transport: Arc<dyn QuotaTransport>,
    state: Mutex<CoordinatorState>,
    /// Held for the duration of one refresh; `try_lock` failure means a
    /// refresh is already in flight.
    refresh_gate: Mutex<()>,
    status_tx: watch::Sender<QuotaStatus>,
    selection_tx: watch::Sender<Option<String>>,
    interval_tx: watch::Sender<Duration>,
    shutdown_tx: watch::Sender<bool>,
}

impl Coordinator {
    pub fn new(
        source: Arc<dyn ProcessSource>,
        transport: Arc<dyn QuotaTransport>,
        refresh_interval: Duration,
    ) -> Arc<Self> {
        let (status_tx, _) = watch::channel(QuotaStatus::Connecting);
        let (selection_tx, _) = watch::channel(None);
        let (interval_tx, _) = watch::channel(refresh_interval);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            source,
            transport,
            state: Mutex::new(CoordinatorState::default()),
            refresh_gate: Mutex::new(()),
            status_tx,
            selection_tx,
            interval_tx,
            shutdown_tx,
        })
    }

    /// Subscribe to status transitions.
    pub fn subscribe(&self) -> watch::Receiver<QuotaStatus> {
        self.status_tx.subscribe()
    }

    /// Subscribe to selection-change events.
    pub fn subscribe_selection(&self) -> watch::Receiver<Option<String>> {
        self.selection_tx.subscribe()
    }

    /// Latest successful snapshot, if any.
    pub async fn snapshot(&self) -> Option<QuotaSnapshot> {
        self.state.lock().await.snapshot.clone()
    }

    /// Currently selected model label.
    pub async fn selected_model(&self) -> Option<String> {
        self.state.lock().await.selected_model.clone()
    }

    /// Choose a model. The label is kept even if later snapshots no longer
    /// carry it; "selected model currently unknown" is a display state.
    pub async fn select_model(&self, label: &str) {
        let mut state = self.state.lock().await;
        state.selected_model = Some(label.to_owned());
        self.selection_tx.send_replace(Some(label.to_owned()));
        tracing::debug!("model selection changed to `{label}`");
    }

    /// Change the automatic refresh period. Cancels and reschedules the
    /// pending timer without touching an in-flight refresh.
    pub fn set_interval(&self, interval: Duration) {
        self.interval_tx.send_replace(interval);
    }

    /// Spawn the timer-driven refresh loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.run().await })
    }

    /// Stop the timer loop. Does not interrupt an in-flight refresh.
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    async fn run(&self) {
        let mut interval_rx = self.interval_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            let period = *interval_rx.borrow_and_update();
            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    if let Err(error) = self.refresh(Trigger::Automatic).await {
                        tracing::debug!("scheduled refresh failed: {error}");
                    }
                }
                changed = interval_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    // loop re-arms the timer with the new period
                }
                _ = shutdown_rx.changed() => break,
            }
        }
        tracing::debug!("refresh loop stopped");
    }

    /// Run one full refresh cycle: reuse the cached endpoint when present,
    /// otherwise discover one, then fetch and publish.
    pub async fn refresh(&self, trigger: Trigger) -> Result<RefreshOutcome, RefreshError> {
        let _in_flight = match self.refresh_gate.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::debug!("refresh already in flight; coalescing {trigger:?} trigger");
                return Ok(RefreshOutcome::Coalesced);
            }
        };

        let endpoint = {
            let cached = self.state.lock().await.endpoint.clone();
            match cached {
                Some(endpoint) => endpoint,
                None => self.discover().await?,
            }
        };

        self.publish(QuotaStatus::Fetching);
        match self
            .transport
            .fetch_quota(endpoint.port, &endpoint.csrf_token)
            .await
        {
            Ok(snapshot) => {
                let model_count = snapshot.models.len();
                let mut state = self.state.lock().await;
                if state.selected_model.is_none() {
                    if let Some(first) = snapshot.models.first() {
                        state.selected_model = Some(first.label.clone());
                        self.selection_tx.send_replace(state.selected_model.clone());
                        tracing::debug!("model selection initialized to `{}`", first.label);
                    }
                }
                state.snapshot = Some(snapshot.clone());
                drop(state);
                self.publish(QuotaStatus::Ok(snapshot));
                Ok(RefreshOutcome::Refreshed(model_count))
            }
            Err(error) => {
                // A stale token or port is never partially salvageable;
                // drop both and rediscover on the next trigger.
                self.state.lock().await.endpoint = None;
                self.publish(QuotaStatus::FetchFailed);
                tracing::warn!("quota fetch failed, endpoint cache dropped: {error}");
                Err(RefreshError::Fetch(error))
            }
        }
    }

    /// Locate the process, resolve a working port, and cache the endpoint.
    async fn discover(&self) -> Result<ResolvedEndpoint, RefreshError> {
        self.publish(QuotaStatus::Connecting);

        let Some(credentials) = locator::locate(self.source.as_ref()).await else {
            self.publish(QuotaStatus::NoProcess);
            return Err(RefreshError::NoProcess);
        };

        let candidates = match self.source.listening_ports(credentials.pid).await {
            Ok(ports) => ports,
            Err(error) => {
                // Tool failure, not "no ports": surface it, then let the
                // fallback port carry the attempt if one exists.
                tracing::warn!("port listing failed for pid {}: {error:#}", credentials.pid);
                self.publish(QuotaStatus::Error(format!("port listing failed: {error:#}")));
                Vec::new()
            }
        };

        let Some(port) = resolver::resolve(
            self.transport.as_ref(),
            &candidates,
            credentials.extension_port,
            &credentials.csrf_token,
        )
        .await
        else {
            self.publish(QuotaStatus::NoPort);
            return Err(RefreshError::NoPort);
        };

        let endpoint = ResolvedEndpoint {
            port,
            csrf_token: credentials.csrf_token,
        };
        self.state.lock().await.endpoint = Some(endpoint.clone());
        Ok(endpoint)
    }

    // send_replace rather than send: the value must stick even when no
    // subscriber is attached yet.
    fn publish(&self, status: QuotaStatus) {
        self.status_tx.send_replace(status);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use super::*;
    use crate::error::FetchError;
    use crate::locator::ProcessEntry;
    use crate::model::{AccountInfo, ModelQuota};

    struct FakeSource {
        entries: Vec<ProcessEntry>,
        ports: Vec<u16>,
        enumerations: AtomicUsize,
    }

    impl FakeSource {
        fn with_server(ports: &[u16]) -> Self {
            Self {
                entries: vec![ProcessEntry {
                    pid: 7,
                    command_line:
                        "language_server --extension_server_port=9000 --csrf_token=abc123"
                            .to_owned(),
                }],
                ports: ports.to_vec(),
                enumerations: AtomicUsize::new(0),
            }
        }

        fn empty() -> Self {
            Self {
                entries: Vec::new(),
                ports: Vec::new(),
                enumerations: AtomicUsize::new(0),
            }
        }

        fn enumerations(&self) -> usize {
            self.enumerations.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProcessSource for FakeSource {
        async fn matching_processes(
            &self,
            _name_filter: &str,
        ) -> crate::error::Result<Vec<ProcessEntry>> {
            self.enumerations.fetch_add(1, Ordering::SeqCst);
            Ok(self.entries.clone())
        }

        async fn listening_ports(&self, _pid: u32) -> crate::error::Result<Vec<u16>> {
            Ok(self.ports.clone())
        }
    }

    struct FakeTransport {
        accepting: Vec<u16>,
        fetches: StdMutex<VecDeque<Result<QuotaSnapshot, FetchError>>>,
        fetch_delay: Duration,
    }

    impl FakeTransport {
        fn new(accepting: &[u16]) -> Self {
            Self {
                accepting: accepting.to_vec(),
                fetches: StdMutex::new(VecDeque::new()),
                fetch_delay: Duration::ZERO,
            }
        }

        fn push_fetch(&self, result: Result<QuotaSnapshot, FetchError>) {
            self.fetches.lock().unwrap().push_back(result);
        }
    }

    #[async_trait]
    impl QuotaTransport for FakeTransport {
        async fn probe(&self, port: u16, _csrf_token: &str) -> bool {
            self.accepting.contains(&port)
        }

        async fn fetch_quota(
            &self,
            _port: u16,
            _csrf_token: &str,
        ) -> Result<QuotaSnapshot, FetchError> {
            if self.fetch_delay > Duration::ZERO {
                tokio::time::sleep(self.fetch_delay).await;
            }
            self.fetches
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(FetchError::BadStatus(500)))
        }
    }

    fn snapshot_with(labels: &[&str]) -> QuotaSnapshot {
        QuotaSnapshot {
            account: AccountInfo::default(),
            models: labels
                .iter()
                .map(|label| ModelQuota {
                    label: (*label).to_owned(),
                    remaining_fraction: Some(0.9),
                    reset_time: String::new(),
                })
                .collect(),
        }
    }

    fn coordinator_with(
        source: FakeSource,
        transport: FakeTransport,
    ) -> (Arc<Coordinator>, Arc<FakeSource>, Arc<FakeTransport>) {
        let source = Arc::new(source);
        let transport = Arc::new(transport);
        let coordinator = Coordinator::new(
            Arc::clone(&source) as Arc<dyn ProcessSource>,
            Arc::clone(&transport) as Arc<dyn QuotaTransport>,
            DEFAULT_REFRESH_INTERVAL,
        );
        (coordinator, source, transport)
    }

    #[tokio::test]
    async fn successful_refresh_caches_endpoint_and_publishes_snapshot() {
        let transport = FakeTransport::new(&[9000]);
        transport.push_fetch(Ok(snapshot_with(&["gpt-x"])));
        let (coordinator, source, _) =
            coordinator_with(FakeSource::with_server(&[9001, 9000]), transport);

        let outcome = coordinator.refresh(Trigger::Manual).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Refreshed(1));
        assert_eq!(source.enumerations(), 1);

        let status = coordinator.subscribe().borrow().clone();
        assert_matches!(status, QuotaStatus::Ok(snapshot) if snapshot.models[0].label == "gpt-x");
    }

    #[tokio::test]
    async fn cached_endpoint_skips_rediscovery() {
        let transport = FakeTransport::new(&[9000]);
        transport.push_fetch(Ok(snapshot_with(&["a"])));
        transport.push_fetch(Ok(snapshot_with(&["a"])));
        let (coordinator, source, _) =
            coordinator_with(FakeSource::with_server(&[9000]), transport);

        coordinator.refresh(Trigger::Automatic).await.unwrap();
        coordinator.refresh(Trigger::Automatic).await.unwrap();
        assert_eq!(source.enumerations(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_invalidates_cache_and_forces_rediscovery() {
        let transport = FakeTransport::new(&[9000]);
        transport.push_fetch(Ok(snapshot_with(&["a"])));
        transport.push_fetch(Err(FetchError::BadStatus(500)));
        transport.push_fetch(Ok(snapshot_with(&["a"])));
        let (coordinator, source, _) =
            coordinator_with(FakeSource::with_server(&[9000]), transport);

        coordinator.refresh(Trigger::Automatic).await.unwrap();
        let error = coordinator.refresh(Trigger::Automatic).await.unwrap_err();
        assert_matches!(error, RefreshError::Fetch(FetchError::BadStatus(500)));
        assert_matches!(
            coordinator.subscribe().borrow().clone(),
            QuotaStatus::FetchFailed
        );

        // endpoint was dropped, so the next refresh locates again
        coordinator.refresh(Trigger::Automatic).await.unwrap();
        assert_eq!(source.enumerations(), 2);
    }

    #[tokio::test]
    async fn identical_responses_yield_identical_lists() {
        let transport = FakeTransport::new(&[9000]);
        transport.push_fetch(Ok(snapshot_with(&["a", "b"])));
        transport.push_fetch(Ok(snapshot_with(&["a", "b"])));
        let (coordinator, _, _) = coordinator_with(FakeSource::with_server(&[9000]), transport);

        coordinator.refresh(Trigger::Automatic).await.unwrap();
        let first = coordinator.snapshot().await.unwrap();
        coordinator.refresh(Trigger::Automatic).await.unwrap();
        let second = coordinator.snapshot().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.models.len(), 2);
    }

    #[tokio::test]
    async fn no_process_emits_status_and_leaves_cache_empty() {
        let transport = FakeTransport::new(&[]);
        let (coordinator, _, _) = coordinator_with(FakeSource::empty(), transport);

        let error = coordinator.refresh(Trigger::Manual).await.unwrap_err();
        assert_matches!(error, RefreshError::NoProcess);
        assert_matches!(
            coordinator.subscribe().borrow().clone(),
            QuotaStatus::NoProcess
        );
        assert!(coordinator.state.lock().await.endpoint.is_none());
    }

    #[tokio::test]
    async fn no_port_without_probe_success_or_fallback() {
        let transport = FakeTransport::new(&[]);
        let source = FakeSource {
            entries: vec![ProcessEntry {
                pid: 7,
                command_line: "language_server --csrf_token=abc123".to_owned(),
            }],
            ports: vec![9001, 9002],
            enumerations: AtomicUsize::new(0),
        };
        let (coordinator, _, _) = coordinator_with(source, transport);

        let error = coordinator.refresh(Trigger::Manual).await.unwrap_err();
        assert_matches!(error, RefreshError::NoPort);
        assert_matches!(coordinator.subscribe().borrow().clone(), QuotaStatus::NoPort);
    }

    #[tokio::test]
    async fn port_listing_tool_failure_still_reaches_fallback() {
        struct BrokenPortsSource;

        #[async_trait]
        impl ProcessSource for BrokenPortsSource {
            async fn matching_processes(
                &self,
                _name_filter: &str,
            ) -> crate::error::Result<Vec<ProcessEntry>> {
                Ok(vec![ProcessEntry {
                    pid: 7,
                    command_line:
                        "language_server --extension_server_port=9000 --csrf_token=abc123"
                            .to_owned(),
                }])
            }

            async fn listening_ports(&self, _pid: u32) -> crate::error::Result<Vec<u16>> {
                Err(anyhow::anyhow!("lsof unavailable"))
            }
        }

        let transport = Arc::new(FakeTransport::new(&[]));
        transport.push_fetch(Ok(snapshot_with(&["a"])));
        let coordinator = Coordinator::new(
            Arc::new(BrokenPortsSource),
            Arc::clone(&transport) as Arc<dyn QuotaTransport>,
            DEFAULT_REFRESH_INTERVAL,
        );

        let outcome = coordinator.refresh(Trigger::Manual).await.unwrap();
        assert_eq!(outcome, RefreshOutcome::Refreshed(1));
        let endpoint = coordinator.state.lock().await.endpoint.clone().unwrap();
        assert_eq!(endpoint.port, 9000);
    }

    #[tokio::test]
    async fn fallback_port_is_used_when_probes_fail() {
        let transport = FakeTransport::new(&[]);
        transport.push_fetch(Ok(snapshot_with(&["a"])));
        let (coordinator, _, _) =
            coordinator_with(FakeSource::with_server(&[9001, 9002]), transport);

        coordinator.refresh(Trigger::Manual).await.unwrap();
        let endpoint = coordinator.state.lock().await.endpoint.clone().unwrap();
        assert_eq!(
            endpoint,
            ResolvedEndpoint {
                port: 9000,
                csrf_token: "abc123".to_owned(),
            }
        );
    }

    #[tokio::test]
    async fn selection_initializes_to_first_label_and_survives_its_removal() {
        let transport = FakeTransport::new(&[9000]);
        transport.push_fetch(Ok(snapshot_with(&["first", "second"])));
        transport.push_fetch(Ok(snapshot_with(&["second", "third"])));
        let (coordinator, _, _) = coordinator_with(FakeSource::with_server(&[9000]), transport);

        coordinator.refresh(Trigger::Automatic).await.unwrap();
        assert_eq!(coordinator.selected_model().await.as_deref(), Some("first"));

        // "first" disappears from the list; the selection is not cleared
        coordinator.refresh(Trigger::Automatic).await.unwrap();
        assert_eq!(coordinator.selected_model().await.as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn explicit_selection_is_not_overwritten_by_auto_init() {
        let transport = FakeTransport::new(&[9000]);
        transport.push_fetch(Ok(snapshot_with(&["first", "second"])));
        let (coordinator, _, _) = coordinator_with(FakeSource::with_server(&[9000]), transport);

        coordinator.select_model("second").await;
        coordinator.refresh(Trigger::Automatic).await.unwrap();
        assert_eq!(coordinator.selected_model().await.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn concurrent_trigger_coalesces_with_in_flight_refresh() {
        let mut transport = FakeTransport::new(&[9000]);
        transport.fetch_delay = Duration::from_millis(100);
        transport.push_fetch(Ok(snapshot_with(&["a"])));
        let (coordinator, source, _) =
            coordinator_with(FakeSource::with_server(&[9000]), transport);

        let slow = Arc::clone(&coordinator);
        let fast = Arc::clone(&coordinator);
        let slow_task = tokio::spawn(async move { slow.refresh(Trigger::Automatic).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let coalesced = fast.refresh(Trigger::Manual).await.unwrap();
        assert_eq!(coalesced, RefreshOutcome::Coalesced);

        let outcome = slow_task.await.unwrap().unwrap();
        assert_eq!(outcome, RefreshOutcome::Refreshed(1));
        assert_eq!(source.enumerations(), 1);
    }

    #[tokio::test]
    async fn timer_loop_refreshes_until_stopped() {
        let transport = FakeTransport::new(&[9000]);
        transport.push_fetch(Ok(snapshot_with(&["a"])));
        let (coordinator, _, _) = coordinator_with(FakeSource::with_server(&[9000]), transport);
        coordinator.set_interval(Duration::from_millis(10));

        let mut status_rx = coordinator.subscribe();
        let handle = coordinator.start();

        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                status_rx.changed().await.unwrap();
                if matches!(*status_rx.borrow_and_update(), QuotaStatus::Ok(_)) {
                    break;
                }
            }
        })
        .await
        .expect("timer-driven refresh should publish a snapshot");

        coordinator.stop();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should exit after stop")
            .unwrap();
    }
}
