//! Host side of the worker lifecycle: dispatches install, activate and fetch
//! events to the cache manager and enforces the order they may happen in.

use color_eyre::{eyre::eyre, Result};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cache::{
  ActivateReport, CacheManager, CacheResult, CacheStorage, InstallReport, Request, Response,
};
use crate::network::Network;

/// Lifecycle phase of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
  /// Registered, install not started yet
  Parsed,
  Installing,
  Installed,
  Activating,
  /// Controlling the page; fetches are answered from the cache
  Activated,
  /// Install failed; this worker will never control the page
  Redundant,
}

/// Events the host delivers to a worker.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
  Install,
  Activate,
  Fetch(Request),
}

/// What handling an event produced.
#[derive(Debug)]
pub enum EventOutcome {
  Installed(InstallReport),
  Activated(ActivateReport),
  Response(CacheResult<Response>),
}

/// A registered worker driven by the host.
///
/// Install and activate are awaited to completion before the phase advances,
/// so nothing observes `Installed` until every asset is stored and nothing
/// observes `Activated` until pruning is done. Fetches may run concurrently.
pub struct ServiceWorker<S: CacheStorage, N: Network> {
  manager: CacheManager<S, N>,
  phase: Mutex<Phase>,
}

impl<S: CacheStorage, N: Network> ServiceWorker<S, N> {
  /// A freshly registered (or updated) worker that still has to install.
  pub fn new(manager: CacheManager<S, N>) -> Self {
    Self {
      manager,
      phase: Mutex::new(Phase::Parsed),
    }
  }

  /// A worker that already went through install and activate in an earlier
  /// session and controls the page right away.
  pub fn resume(manager: CacheManager<S, N>) -> Self {
    Self {
      manager,
      phase: Mutex::new(Phase::Activated),
    }
  }

  pub fn manager(&self) -> &CacheManager<S, N> {
    &self.manager
  }

  pub fn phase(&self) -> Phase {
    match self.phase.lock() {
      Ok(phase) => *phase,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  /// Move from `from` to `to`, failing if the worker is somewhere else.
  fn transition(&self, from: Phase, to: Phase) -> Result<()> {
    let mut phase = self
      .phase
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if *phase != from {
      return Err(eyre!("Cannot move to {:?} while {:?}", to, *phase));
    }

    debug!(from = ?from, to = ?to, "Worker phase change");
    *phase = to;
    Ok(())
  }

  fn set_phase(&self, to: Phase) -> Result<()> {
    let mut phase = self
      .phase
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let from = *phase;
    debug!(from = ?from, to = ?to, "Worker phase change");
    *phase = to;
    Ok(())
  }

  /// Run the install phase. A failed install makes the worker redundant.
  pub async fn install(&self) -> Result<InstallReport> {
    self.transition(Phase::Parsed, Phase::Installing)?;

    match self.manager.install().await {
      Ok(report) => {
        self.set_phase(Phase::Installed)?;
        Ok(report)
      }
      Err(err) => {
        warn!(error = %err, "Install failed, worker is redundant");
        self.set_phase(Phase::Redundant)?;
        Err(err)
      }
    }
  }

  /// Run the activate phase.
  ///
  /// The worker takes control even when pruning fails outright; the error
  /// is still returned so the host can report it.
  pub async fn activate(&self) -> Result<ActivateReport> {
    self.transition(Phase::Installed, Phase::Activating)?;

    let result = self.manager.activate().await;
    self.set_phase(Phase::Activated)?;

    match &result {
      Ok(report) => info!(deleted = report.deleted.len(), "Worker activated"),
      Err(err) => warn!(error = %err, "Activation cleanup failed"),
    }

    result
  }

  /// Install then activate, as the host does for a new worker.
  pub async fn start(&self) -> Result<(InstallReport, ActivateReport)> {
    let installed = self.install().await?;
    let activated = self.activate().await?;
    Ok((installed, activated))
  }

  /// Handle a request from the page.
  ///
  /// Until the worker is activated it does not control the page, so
  /// requests go straight to the network.
  pub async fn fetch(&self, request: &Request) -> Result<CacheResult<Response>> {
    if self.phase() != Phase::Activated {
      debug!(url = %request.url, "Worker not active, bypassing cache");
      let response = self.manager.network().fetch(request).await?;
      return Ok(CacheResult::from_network(response));
    }

    self.manager.fetch(request).await
  }

  /// Deliver one event and wait for the handler to finish.
  pub async fn dispatch(&self, event: LifecycleEvent) -> Result<EventOutcome> {
    match event {
      LifecycleEvent::Install => self.install().await.map(EventOutcome::Installed),
      LifecycleEvent::Activate => self.activate().await.map(EventOutcome::Activated),
      LifecycleEvent::Fetch(request) => self.fetch(&request).await.map(EventOutcome::Response),
    }
  }
}
