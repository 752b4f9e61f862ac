//! Runs the agent: registration, version switching and event dispatch.
//!
//! Each event becomes one task. A task is finished only after the work its
//! handler registered on `WaitUntil` has settled; shutting the host down
//! aborts whatever is still running.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};
use url::Url;

use crate::agent::{Agent, EventOutcome};
use crate::cache::{CacheSource, CacheStorage};
use crate::config::AgentConfig;
use crate::error::FetchError;
use crate::event::{Event, EventReceiver, OutcomeSender, WaitUntil};
use crate::interceptor::Intercepted;
use crate::lifecycle::{ActivationReport, InstallReport};
use crate::net::{Network, Request};
use crate::platform::{Platform, WorkerSlot};

/// Result of registering the agent script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "registration", rename_all = "kebab-case")]
pub enum RegistrationOutcome {
  /// First version for this scope
  Installed {
    cache_name: String,
    cached: usize,
    claimed: usize,
  },
  /// Replaced an older active version
  Updated {
    previous: String,
    cache_name: String,
    cached: usize,
    deleted: Vec<String>,
  },
  /// Same script and version already active
  Unchanged { cache_name: String },
}

#[derive(Default)]
struct HostState {
  script_url: Option<Url>,
  active: Option<Arc<Agent>>,
}

pub struct AgentHost {
  platform: Platform,
  state: Mutex<HostState>,
  /// Serializes registrations so re-registering races cannot double-install
  registering: AsyncMutex<()>,
  tasks: AsyncMutex<JoinSet<()>>,
}

impl AgentHost {
  pub fn new(platform: Platform) -> Self {
    Self {
      platform,
      state: Mutex::new(HostState::default()),
      registering: AsyncMutex::new(()),
      tasks: AsyncMutex::new(JoinSet::new()),
    }
  }

  pub fn platform(&self) -> &Platform {
    &self.platform
  }

  /// The version currently controlling pages.
  pub fn active(&self) -> Option<Arc<Agent>> {
    self.state.lock().ok().and_then(|s| s.active.clone())
  }

  /// Register the agent script for `config`'s version.
  ///
  /// Registering the same script and version again is a no-op. A new version
  /// is installed next to the old one; if install fails, the old one keeps
  /// serving and the error is returned.
  pub async fn register(&self, script_url: Url, config: AgentConfig) -> Result<RegistrationOutcome> {
    let _guard = self.registering.lock().await;

    let previous = {
      let state = self
        .state
        .lock()
        .map_err(|e| eyre!("Lock poisoned: {}", e))?;
      if let Some(active) = &state.active {
        if state.script_url.as_ref() == Some(&script_url) && active.cache_name() == config.cache_name {
          info!(script = %script_url, cache = %config.cache_name, "Already registered");
          return Ok(RegistrationOutcome::Unchanged {
            cache_name: config.cache_name,
          });
        }
      }
      state.active.as_ref().map(|a| a.cache_name().to_string())
    };

    let agent = Arc::new(Agent::new(config, &self.platform));
    let slot = WorkerSlot::new();
    let install = agent.install(&slot).await.map_err(|e| {
      warn!(script = %script_url, "Registration failed, keeping previous version: {}", e);
      eyre!("Failed to install {}: {}", agent.cache_name(), e)
    })?;
    debug!(
      cache = %agent.cache_name(),
      skip_waiting = slot.skip_waiting_requested(),
      "Installed, activating"
    );

    let activation = self.promote(script_url, agent.clone()).await?;

    Ok(outcome(previous, &install, &activation))
  }

  /// Adopt an already-installed version after a restart, without fetching
  /// the manifest again. Returns false if its cache store does not exist.
  pub fn resume(&self, script_url: Url, config: AgentConfig) -> Result<bool> {
    let names = self.platform.storage.names()?;
    if !names.contains(&config.cache_name) {
      debug!(cache = %config.cache_name, "Nothing installed to resume");
      return Ok(false);
    }

    let agent = Arc::new(Agent::new(config, &self.platform));
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    info!(cache = %agent.cache_name(), "Resumed installed agent");
    state.script_url = Some(script_url);
    state.active = Some(agent);
    Ok(true)
  }

  async fn promote(&self, script_url: Url, agent: Arc<Agent>) -> Result<ActivationReport> {
    // Activate before switching so stale stores are gone once it controls pages
    let activation = agent.activate().await?;

    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    state.script_url = Some(script_url);
    state.active = Some(agent);
    Ok(activation)
  }

  /// Handle an event on its own task. The receiver resolves once the event
  /// and all the work it extended itself with are done.
  pub async fn dispatch(&self, event: Event) -> oneshot::Receiver<EventOutcome> {
    let (tx, rx) = oneshot::channel();
    self
      .spawn_event(event, move |outcome| {
        let _ = tx.send(outcome);
      })
      .await;
    rx
  }

  async fn spawn_event<F>(&self, event: Event, report: F)
  where
    F: FnOnce(EventOutcome) + Send + 'static,
  {
    let agent = self.active();
    let network = self.platform.network.clone();

    let mut tasks = self.tasks.lock().await;
    reap(&mut tasks);
    tasks.spawn(async move {
      let wait = WaitUntil::new();
      let outcome = match agent {
        Some(agent) => agent.handle(event, &wait).await,
        None => uncontrolled(network.as_ref(), event).await,
      };
      wait.settle().await;
      debug!(?outcome, "Event complete");
      report(outcome);
    });
  }

  /// Events still being handled.
  pub async fn in_flight(&self) -> usize {
    let mut tasks = self.tasks.lock().await;
    reap(&mut tasks);
    tasks.len()
  }

  /// Send a request through the agent and wait for the page's answer.
  pub async fn fetch(&self, request: Request) -> Result<Intercepted, FetchError> {
    let url = request.url.to_string();
    let (tx, rx) = oneshot::channel();
    let _ = self
      .dispatch(Event::Fetch {
        request,
        respond_to: Some(tx),
      })
      .await;

    rx.await.unwrap_or(Err(FetchError::Offline { url }))
  }

  /// Dispatch events until every sender is gone, then wait for in-flight
  /// work. Each outcome is sent to `outcomes` as its event completes; the
  /// sender is dropped once everything has drained.
  pub async fn run(&self, mut events: EventReceiver, outcomes: OutcomeSender) {
    while let Some(event) = events.recv().await {
      let outcomes = outcomes.clone();
      self
        .spawn_event(event, move |outcome| {
          // Nobody listening is fine
          let _ = outcomes.send(outcome);
        })
        .await;
    }
    self.drain().await;
  }

  /// Wait for every dispatched event to complete.
  pub async fn drain(&self) {
    loop {
      let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
      if tasks.is_empty() {
        return;
      }
      while let Some(result) = tasks.join_next().await {
        log_join(result);
      }
    }
  }

  /// Abort in-flight events. Cache writes that have not finished are lost.
  pub async fn shutdown(&self) {
    let mut tasks = self.tasks.lock().await;
    let pending = tasks.len();
    tasks.abort_all();
    if pending > 0 {
      info!(pending, "Aborted in-flight events");
    }
  }
}

/// Drop tasks that already finished so the set only holds live events.
fn reap(tasks: &mut JoinSet<()>) {
  while let Some(result) = tasks.try_join_next() {
    log_join(result);
  }
}

fn log_join(result: Result<(), JoinError>) {
  if let Err(e) = result {
    if e.is_panic() {
      warn!("Event task panicked: {}", e);
    }
  }
}

fn outcome(
  previous: Option<String>,
  install: &InstallReport,
  activation: &ActivationReport,
) -> RegistrationOutcome {
  match previous {
    Some(previous) => RegistrationOutcome::Updated {
      previous,
      cache_name: install.cache_name.clone(),
      cached: install.cached.len(),
      deleted: activation.deleted.clone(),
    },
    None => RegistrationOutcome::Installed {
      cache_name: install.cache_name.clone(),
      cached: install.cached.len(),
      claimed: activation.claimed,
    },
  }
}

/// No agent is active: requests go straight to the network, and push or
/// click events have nobody to handle them.
async fn uncontrolled(network: &dyn Network, event: Event) -> EventOutcome {
  let kind = event.kind();
  match event {
    Event::Fetch {
      request,
      respond_to,
    } => {
      let result = network
        .fetch(&request)
        .await
        .map(|response| Intercepted {
          response,
          source: CacheSource::Network,
        })
        .map_err(FetchError::from);
      let outcome = match &result {
        Ok(i) => EventOutcome::Response {
          url: request.url.clone(),
          status: i.response.status,
          source: i.source,
          bytes: i.response.body.len(),
        },
        Err(e) => EventOutcome::Failed {
          event: kind,
          error: e.to_string(),
        },
      };
      if let Some(tx) = respond_to {
        let _ = tx.send(result);
      }
      outcome
    }
    _ => {
      warn!(event = kind, "No active agent, dropping event");
      EventOutcome::Failed {
        event: kind,
        error: "no active agent".to_string(),
      }
    }
  }
}
