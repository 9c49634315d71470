//! Component wiring and task supervision
//!
//! The supervisor owns the event bus and every source/client runtime.
//! Sources and clients never hold references to each other: sources publish
//! `NewPlay` to the bus, the fan-out task copies each play into every
//! subscribing client, and clients drain independently so a slow client
//! never blocks a fast one.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use msb_common::backoff::Backoff;
use msb_common::config::AppConfig;
use msb_common::error::{Error, Result};
use msb_common::events::{ComponentStatus, EventBus, MsbEvent};
use msb_common::play::Play;
use msb_common::time::SharedClock;
use msb_common::transform::PlayTransform;

use crate::clients::listenbrainz::ListenBrainzAdapter;
use crate::clients::{run_worker, ClientCore, ClientOptions, ScrobbleClient};
use crate::lifecycle::{initialize, Component, InitOutcome};
use crate::sources::players::PlayerRegistry;
use crate::sources::{
    capabilities_for, run_poll_loop, PollAdapter, SourceCapabilities, SourceCore, SourceOptions,
};

/// Graceful stop waits this long for tasks to acknowledge cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
/// Cadence of the stale-player sweep for push sources.
const PLAYER_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// One configured source and its runtime state.
pub struct SourceRuntime {
    pub name: String,
    pub kind: String,
    pub slug: Option<String>,
    pub capabilities: SourceCapabilities,
    pub core: Arc<Mutex<SourceCore>>,
    /// Player sessions, for push sources that report progress
    pub players: Arc<Mutex<PlayerRegistry>>,
}

/// One configured client and its runtime state.
///
/// `adapter` and `component` are the same object behind two contracts: the
/// scrobble calls the worker makes, and the init stages the lifecycle
/// scaffold drives.
pub struct ClientRuntime {
    pub name: String,
    pub kind: String,
    pub core: Arc<Mutex<ClientCore>>,
    pub adapter: Arc<dyn ScrobbleClient>,
    pub component: Arc<dyn Component>,
}

/// Everything the service runs, plus the handles to stop it.
pub struct Supervisor {
    pub bus: EventBus,
    pub clock: SharedClock,
    pub sources: Vec<SourceRuntime>,
    pub clients: Vec<ClientRuntime>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Poll adapters waiting for `start`, keyed by source index
    pending_pollers: Mutex<Vec<PendingPoller>>,
}

/// A poll-capable source adapter waiting to be started: the fetch loop and
/// the lifecycle stages of the same underlying adapter.
struct PendingPoller {
    source_idx: usize,
    adapter: Box<dyn PollAdapter>,
    component: Arc<dyn Component>,
}

impl Supervisor {
    /// Build every enabled component from the config.
    pub fn from_config(config: &AppConfig, bus: EventBus, clock: SharedClock) -> Result<Self> {
        let mut sources = Vec::new();
        let mut pending_pollers = Vec::new();

        for entry in config.sources.iter().filter(|s| s.enable) {
            let capabilities = capabilities_for(&entry.kind).ok_or_else(|| {
                Error::Config(format!(
                    "source {:?} has unknown type {:?}",
                    entry.name, entry.kind
                ))
            })?;

            let options = entry.options.merged_over(&config.source_defaults);
            let transform = match &options.play_transform {
                Some(cfg) => PlayTransform::compile(cfg)
                    .map_err(|e| Error::Config(format!("source {:?}: {}", entry.name, e)))?,
                None => PlayTransform::default(),
            };

            let core = SourceCore::new(
                &entry.name,
                transform,
                SourceOptions::from_config(&options),
                bus.clone(),
                clock.clone(),
            );

            if capabilities.can_poll {
                let (adapter, component) =
                    build_poll_adapter(&entry.kind, &entry.name, &entry.data)?;
                pending_pollers.push(PendingPoller {
                    source_idx: sources.len(),
                    adapter,
                    component,
                });
            }

            sources.push(SourceRuntime {
                name: entry.name.clone(),
                kind: entry.kind.clone(),
                slug: entry.slug.clone(),
                capabilities,
                core: Arc::new(Mutex::new(core)),
                players: Arc::new(Mutex::new(PlayerRegistry::new(clock.clone()))),
            });
        }

        let mut clients = Vec::new();
        for entry in config.clients.iter().filter(|c| c.enable) {
            let options = entry.options.merged_over(&config.client_defaults);
            let transform = match &options.play_transform {
                Some(cfg) => PlayTransform::compile(cfg)
                    .map_err(|e| Error::Config(format!("client {:?}: {}", entry.name, e)))?,
                None => PlayTransform::default(),
            };

            let core = ClientCore::new(
                &entry.name,
                transform,
                ClientOptions::from_config(&options),
                bus.clone(),
                clock.clone(),
            );

            let (adapter, component): (Arc<dyn ScrobbleClient>, Arc<dyn Component>) =
                match entry.kind.as_str() {
                    "listenbrainz" => {
                        let adapter =
                            Arc::new(ListenBrainzAdapter::from_config(&entry.name, &entry.data)?);
                        (adapter.clone(), adapter)
                    }
                    other => {
                        return Err(Error::Config(format!(
                            "client {:?} has unknown type {:?}",
                            entry.name, other
                        )))
                    }
                };

            clients.push(ClientRuntime {
                name: entry.name.clone(),
                kind: entry.kind.clone(),
                core: Arc::new(Mutex::new(core)),
                adapter,
                component,
            });
        }

        Ok(Self {
            bus,
            clock,
            sources,
            clients,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            pending_pollers: Mutex::new(pending_pollers),
        })
    }

    /// Webhook routing: the configured source of this type whose slug
    /// matches the request path.
    pub fn find_webhook_source(&self, kind: &str, slug: Option<&str>) -> Option<&SourceRuntime> {
        self.sources.iter().find(|s| {
            s.kind == kind && crate::sources::ingress::slug_matches(s.slug.as_deref(), slug)
        })
    }

    pub fn client_by_name(&self, name: &str) -> Option<&ClientRuntime> {
        self.clients.iter().find(|c| c.name == name)
    }

    /// Initialize components and spawn every long-running task.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;

        // Push sources have no connection to prove; they go straight to
        // awaiting ingress.
        for source in &self.sources {
            if !source.capabilities.can_poll {
                let mut core = source.core.lock().await;
                core.status.set(ComponentStatus::Initializing);
                core.status.set(ComponentStatus::Initialized);
                core.status.set(ComponentStatus::AwaitingData);
            }
        }

        // Poll sources walk the init stages, then fetch on their own
        // cadence.
        for pending in self.pending_pollers.lock().await.drain(..) {
            let source = &self.sources[pending.source_idx];
            let core = source.core.clone();
            let cancel = self.cancel.clone();
            let can_backlog = source.capabilities.can_backlog;
            tasks.push(tokio::spawn(async move {
                run_source(pending, core, cancel, can_backlog).await;
            }));
        }

        // Clients initialize (with retry on transient failures), then run
        // their worker loop.
        for client in &self.clients {
            let core = client.core.clone();
            let adapter = client.adapter.clone();
            let component = client.component.clone();
            let cancel = self.cancel.clone();
            let name = client.name.clone();
            tasks.push(tokio::spawn(async move {
                run_client(name, core, adapter, component, cancel).await;
            }));
        }

        // Fan-out: every NewPlay is copied into every client queue.
        {
            let mut rx = self.bus.subscribe();
            let clients: Vec<(String, Arc<Mutex<ClientCore>>)> = self
                .clients
                .iter()
                .map(|c| (c.name.clone(), c.core.clone()))
                .collect();
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        received = rx.recv() => match received {
                            Ok(MsbEvent::NewPlay { name, play, .. }) => {
                                fan_out(&clients, &name, &play).await;
                            }
                            Ok(_) => {}
                            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                                warn!(missed, "fan-out lagged behind the bus");
                            }
                            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }));
        }

        // Stale-player sweep for push sources.
        {
            let sources: Vec<Arc<Mutex<PlayerRegistry>>> =
                self.sources.iter().map(|s| s.players.clone()).collect();
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(PLAYER_EVICTION_INTERVAL) => {}
                    }
                    for players in &sources {
                        players.lock().await.evict_stale();
                    }
                }
            }));
        }

        info!(
            sources = self.sources.len(),
            clients = self.clients.len(),
            "supervisor started"
        );
    }

    /// Cooperative stop: signal every loop, wait bounded, then abandon.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.cancel.cancel();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        let all = futures::future::join_all(tasks);
        if tokio::time::timeout(SHUTDOWN_GRACE, all).await.is_err() {
            warn!(
                grace_s = SHUTDOWN_GRACE.as_secs(),
                "tasks did not stop within the grace period, abandoning"
            );
        }
    }
}

async fn fan_out(clients: &[(String, Arc<Mutex<ClientCore>>)], source: &str, play: &Play) {
    for (name, core) in clients {
        let mut core = core.lock().await;
        if core.accept(source, play).is_none() {
            tracing::debug!(client = %name, source, "client refused play");
        }
    }
}

/// Initialize a client with backoff on transient failures, then run its
/// worker until cancelled.
async fn run_client(
    name: String,
    core: Arc<Mutex<ClientCore>>,
    adapter: Arc<dyn ScrobbleClient>,
    component: Arc<dyn Component>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::default();
    loop {
        let outcome = {
            let mut guard = core.lock().await;
            initialize(component.as_ref(), &mut guard.status).await
        };
        match outcome {
            Ok(InitOutcome::Ready) => break,
            Ok(InitOutcome::Deferred(_)) => {
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                error!(client = %name, error = %e, "client failed to initialize");
                return;
            }
        }
    }

    core.lock().await.authed = true;
    run_worker(core, adapter, cancel).await;
}

/// Initialize a poll source with backoff on transient failures, seed the
/// ring from backlog, then poll until cancelled.
async fn run_source(
    pending: PendingPoller,
    core: Arc<Mutex<SourceCore>>,
    cancel: CancellationToken,
    can_backlog: bool,
) {
    let PendingPoller {
        mut adapter,
        component,
        ..
    } = pending;

    let mut backoff = Backoff::default();
    loop {
        let outcome = {
            let mut guard = core.lock().await;
            initialize(component.as_ref(), &mut guard.status).await
        };
        match outcome {
            Ok(InitOutcome::Ready) => break,
            Ok(InitOutcome::Deferred(_)) => {
                let delay = backoff.next_delay();
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Err(e) => {
                error!(source = component.name(), error = %e, "source failed to initialize");
                return;
            }
        }
    }

    if can_backlog {
        match adapter.backlog().await {
            Ok(plays) if !plays.is_empty() => {
                core.lock().await.seed_backlog(plays);
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "backlog fetch failed, starting with an empty ring"),
        }
    }
    run_poll_loop(core, adapter, cancel).await;
}

/// A poll-capable source built from its config entry.
fn build_poll_adapter(
    kind: &str,
    name: &str,
    data: &serde_json::Value,
) -> Result<(Box<dyn PollAdapter>, Arc<dyn Component>)> {
    match kind {
        "listenbrainz" => {
            let inner = Arc::new(ListenBrainzAdapter::from_config(name, data)?);
            let adapter = Box::new(ListenBrainzSourceAdapter {
                name: name.to_string(),
                inner: inner.clone(),
            });
            Ok((adapter, inner))
        }
        other => Err(Error::Config(format!(
            "source type {:?} is not poll-capable",
            other
        ))),
    }
}

/// ListenBrainz as a *source*: the user's listen feed becomes plays.
struct ListenBrainzSourceAdapter {
    name: String,
    inner: Arc<ListenBrainzAdapter>,
}

#[async_trait::async_trait]
impl PollAdapter for ListenBrainzSourceAdapter {
    async fn fetch(&mut self) -> Result<Vec<Play>> {
        let mut plays = self
            .inner
            .recent_scrobbles()
            .await
            .map_err(Error::Upstream)?;
        for play in &mut plays {
            play.meta.source = self.name.clone();
            play.meta.new_from_source = false;
        }
        plays.sort_by_key(|p| p.data.play_date);
        Ok(plays)
    }

    async fn backlog(&mut self) -> Result<Vec<Play>> {
        self.fetch().await
    }
}

// Boxed adapters also drive the poll loop.
#[async_trait::async_trait]
impl PollAdapter for Box<dyn PollAdapter> {
    async fn fetch(&mut self) -> Result<Vec<Play>> {
        (**self).fetch().await
    }

    async fn backlog(&mut self) -> Result<Vec<Play>> {
        (**self).backlog().await
    }
}
