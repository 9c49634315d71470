//! Shared init/auth scaffold for sources and clients
//!
//! Every component walks the same three ordered stages before it may run:
//! build-data, check-connection, test-auth. Stage results distinguish
//! "nothing to do" from "done" so that pure-ingress components can skip the
//! connection probe without faking one.

use async_trait::async_trait;
use msb_common::error::Result;
use msb_common::events::{ComponentKind, ComponentStatus, EventBus, MsbEvent};
use msb_common::time::SharedClock;
use tracing::{debug, error, info, warn};

/// Result of one init stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The component has nothing to do at this stage
    Skipped,
    Ok,
    /// Succeeded, with a human-readable detail for the log
    Info(String),
}

/// The three-stage init contract shared by source and client adapters.
///
/// Stages take `&self`: adapters are shared between the worker loop and the
/// init driver, so anything a stage discovers (a username, a derived URL)
/// lands in interior-mutable state.
#[async_trait]
pub trait Component: Send + Sync {
    fn name(&self) -> &str;
    fn kind(&self) -> ComponentKind;

    fn requires_auth(&self) -> bool {
        false
    }

    /// Parse config, assemble derived data, validate required fields.
    /// Errors here are fatal: retrying cannot fix a bad config.
    async fn build_init_data(&self) -> Result<StageOutcome>;

    /// Prove network reachability. Optional for pure-ingress components.
    async fn check_connection(&self) -> Result<StageOutcome> {
        Ok(StageOutcome::Skipped)
    }

    /// Verify (or acquire) credentials. Only runs when `requires_auth`.
    async fn authenticate(&self) -> Result<StageOutcome> {
        Ok(StageOutcome::Skipped)
    }

    /// A URL the user must visit to finish authentication, when the adapter
    /// is waiting on an interactive redirect.
    fn auth_interaction_url(&self) -> Option<String> {
        None
    }
}

/// Component status holder that publishes every transition on the bus.
#[derive(Clone)]
pub struct StatusCell {
    name: String,
    kind: ComponentKind,
    status: ComponentStatus,
    bus: EventBus,
    clock: SharedClock,
}

impl StatusCell {
    pub fn new(
        name: impl Into<String>,
        kind: ComponentKind,
        bus: EventBus,
        clock: SharedClock,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            status: ComponentStatus::NotInitialized,
            bus,
            clock,
        }
    }

    pub fn get(&self) -> ComponentStatus {
        self.status
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Transition to a new status, emitting a StatusChange for the
    /// dashboard. No-op when the status is unchanged.
    pub fn set(&mut self, new_status: ComponentStatus) {
        if new_status == self.status {
            return;
        }
        debug!(
            component = %self.name,
            kind = %self.kind,
            from = %self.status,
            to = %new_status,
            "status change"
        );
        let old_status = self.status;
        self.status = new_status;
        self.bus.emit_lossy(MsbEvent::StatusChange {
            name: self.name.clone(),
            from: self.kind,
            old_status,
            new_status,
            timestamp: self.clock.now(),
        });
    }
}

/// How an initialization attempt ended.
#[derive(Debug)]
pub enum InitOutcome {
    /// All stages passed; the component may run
    Ready,
    /// A transient (network) failure; the caller schedules a retry
    Deferred(msb_common::Error),
}

/// Drive a component through its init stages.
///
/// One-shot and idempotent: a component that already initialized returns
/// `Ready` without re-running its stages. Validation errors fail hard (the
/// component stays visible in an errored state); network errors fail soft
/// and return [`InitOutcome::Deferred`] so the supervisor can back off and
/// retry.
pub async fn initialize(component: &dyn Component, status: &mut StatusCell) -> Result<InitOutcome> {
    match status.get() {
        ComponentStatus::NotInitialized | ComponentStatus::Errored => {}
        _ => return Ok(InitOutcome::Ready),
    }

    status.set(ComponentStatus::Initializing);

    let stages: [(&str, bool); 3] = [
        ("build-data", true),
        ("check-connection", true),
        ("test-auth", component.requires_auth()),
    ];

    for (stage, applies) in stages {
        if !applies {
            continue;
        }
        let result = match stage {
            "build-data" => component.build_init_data().await,
            "check-connection" => component.check_connection().await,
            _ => component.authenticate().await,
        };
        match result {
            Ok(StageOutcome::Skipped) => {
                debug!(component = component.name(), stage, "stage skipped");
            }
            Ok(StageOutcome::Ok) => {
                debug!(component = component.name(), stage, "stage ok");
            }
            Ok(StageOutcome::Info(detail)) => {
                info!(component = component.name(), stage, detail = %detail, "stage ok");
            }
            Err(e) if e.is_transient() => {
                warn!(
                    component = component.name(),
                    stage,
                    error = %e,
                    "transient init failure, will retry"
                );
                status.set(ComponentStatus::Errored);
                return Ok(InitOutcome::Deferred(e));
            }
            Err(e) => {
                error!(component = component.name(), stage, error = %e, "init failed");
                status.set(ComponentStatus::Errored);
                return Err(e);
            }
        }
    }

    if let Some(url) = component.auth_interaction_url() {
        info!(
            component = component.name(),
            url = %url,
            "authentication requires user interaction"
        );
    }

    status.set(ComponentStatus::Initialized);
    Ok(InitOutcome::Ready)
}
