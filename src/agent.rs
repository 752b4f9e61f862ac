//! One version of the agent: config plus the three event handlers.

use color_eyre::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use crate::cache::CacheSource;
use crate::config::AgentConfig;
use crate::error::InstallError;
use crate::event::{Event, WaitUntil};
use crate::interceptor::FetchInterceptor;
use crate::lifecycle::{ActivationReport, InstallReport, LifecycleManager};
use crate::notify::{NotificationDispatcher, NotificationState};
use crate::platform::{NotificationId, Platform, Registration};

/// What handling an event produced, for callers that report on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum EventOutcome {
  Response {
    url: Url,
    status: u16,
    source: CacheSource,
    bytes: usize,
  },
  Notification {
    id: NotificationId,
    state: NotificationState,
  },
  Failed {
    event: &'static str,
    error: String,
  },
}

pub struct Agent {
  config: Arc<AgentConfig>,
  lifecycle: LifecycleManager,
  interceptor: FetchInterceptor,
  dispatcher: NotificationDispatcher,
}

impl Agent {
  pub fn new(config: AgentConfig, platform: &Platform) -> Self {
    let config = Arc::new(config);

    Self {
      lifecycle: LifecycleManager::new(
        config.clone(),
        platform.storage.clone(),
        platform.network.clone(),
        platform.clients.clone(),
      ),
      interceptor: FetchInterceptor::new(
        config.clone(),
        platform.storage.clone(),
        platform.network.clone(),
      ),
      dispatcher: NotificationDispatcher::new(
        config.clone(),
        platform.surface.clone(),
        platform.clients.clone(),
      ),
      config,
    }
  }

  pub fn cache_name(&self) -> &str {
    &self.config.cache_name
  }

  pub async fn install(&self, registration: &dyn Registration) -> Result<InstallReport, InstallError> {
    self.lifecycle.install(registration).await
  }

  pub async fn activate(&self) -> Result<ActivationReport> {
    self.lifecycle.activate().await
  }

  pub fn dispatcher(&self) -> &NotificationDispatcher {
    &self.dispatcher
  }

  /// Handle one event. Work the handler leaves running is registered on `wait`.
  pub async fn handle(&self, event: Event, wait: &WaitUntil) -> EventOutcome {
    let kind = event.kind();
    debug!(event = kind, cache = %self.config.cache_name, "Handling event");

    let outcome = match event {
      Event::Fetch {
        request,
        respond_to,
      } => {
        let result = self.interceptor.handle_fetch(&request, wait).await;
        let outcome = match &result {
          Ok(intercepted) => EventOutcome::Response {
            url: request.url.clone(),
            status: intercepted.response.status,
            source: intercepted.source,
            bytes: intercepted.response.body.len(),
          },
          Err(e) => EventOutcome::Failed {
            event: kind,
            error: e.to_string(),
          },
        };
        if let Some(tx) = respond_to {
          // The page may have gone away
          let _ = tx.send(result);
        }
        return outcome;
      }
      Event::Push { payload } => self
        .dispatcher
        .handle_push(payload.as_deref())
        .await
        .map(|id| EventOutcome::Notification {
          id,
          state: NotificationState::Displayed,
        }),
      Event::NotificationClick { id, action } => self
        .dispatcher
        .handle_click(id, action.as_deref())
        .await
        .map(|state| EventOutcome::Notification { id, state }),
    };

    outcome.unwrap_or_else(|e| {
      warn!(event = kind, "Handler failed: {}", e);
      EventOutcome::Failed {
        event: kind,
        error: e.to_string(),
      }
    })
  }
}
