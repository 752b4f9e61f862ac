use serde::Deserialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::warn;
use url::Url;

use crate::agent::EventOutcome;
use crate::error::FetchError;
use crate::interceptor::Intercepted;
use crate::net::{Destination, Method, Request};
use crate::platform::NotificationId;

/// Events the host delivers to the agent.
#[derive(Debug)]
pub enum Event {
  /// Outgoing request from a controlled page
  Fetch {
    request: Request,
    respond_to: Option<oneshot::Sender<Result<Intercepted, FetchError>>>,
  },
  /// Push message; the payload is optional
  Push { payload: Option<Vec<u8>> },
  /// Interaction with a displayed notification
  NotificationClick {
    id: NotificationId,
    action: Option<String>,
  },
}

impl Event {
  pub fn kind(&self) -> &'static str {
    match self {
      Event::Fetch { .. } => "fetch",
      Event::Push { .. } => "push",
      Event::NotificationClick { .. } => "notificationclick",
    }
  }
}

pub type EventSender = mpsc::UnboundedSender<Event>;
pub type EventReceiver = mpsc::UnboundedReceiver<Event>;

pub fn channel() -> (EventSender, EventReceiver) {
  mpsc::unbounded_channel()
}

/// Where the host reports what each event produced.
pub type OutcomeSender = mpsc::UnboundedSender<EventOutcome>;
pub type OutcomeReceiver = mpsc::UnboundedReceiver<EventOutcome>;

pub fn outcome_channel() -> (OutcomeSender, OutcomeReceiver) {
  mpsc::unbounded_channel()
}

/// Work an event handler started but did not wait for.
///
/// The host settles it after the handler returns, so the event is only
/// complete once this work is done. Dropping it aborts whatever is still
/// running.
#[derive(Clone, Default)]
pub struct WaitUntil {
  tasks: Arc<Mutex<JoinSet<()>>>,
}

impl WaitUntil {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn spawn<F>(&self, future: F)
  where
    F: Future<Output = ()> + Send + 'static,
  {
    if let Ok(mut tasks) = self.tasks.lock() {
      tasks.spawn(future);
    }
  }

  pub fn spawn_blocking<F>(&self, f: F)
  where
    F: FnOnce() + Send + 'static,
  {
    if let Ok(mut tasks) = self.tasks.lock() {
      tasks.spawn_blocking(f);
    }
  }

  pub fn pending(&self) -> usize {
    self.tasks.lock().map(|t| t.len()).unwrap_or(0)
  }

  /// Wait for every extension to finish.
  pub async fn settle(&self) {
    loop {
      // Take the set out so the lock is not held across an await
      let mut tasks = match self.tasks.lock() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(_) => return,
      };
      if tasks.is_empty() {
        return;
      }
      while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
          if e.is_panic() {
            warn!("Extended event work panicked: {}", e);
          }
        }
      }
    }
  }

  /// Abort outstanding work. Pending cache writes are lost.
  pub fn abort(&self) {
    if let Ok(mut tasks) = self.tasks.lock() {
      tasks.abort_all();
    }
  }
}

/// Line-delimited JSON events accepted by `shellcache run`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireEvent {
  /// Register the agent script; runs install and activate
  Register,
  Fetch {
    url: Url,
    #[serde(default = "default_method")]
    method: Method,
    #[serde(default)]
    destination: Destination,
    #[serde(default)]
    body: Option<String>,
  },
  Push {
    #[serde(default)]
    payload: Option<String>,
  },
  NotificationClick {
    id: NotificationId,
    #[serde(default)]
    action: Option<String>,
  },
  /// Local notification from the page layer
  Notify {
    title: String,
    body: String,
    #[serde(default)]
    tag: Option<String>,
  },
}

fn default_method() -> Method {
  Method::Get
}

impl WireEvent {
  pub fn into_request(self) -> Option<Request> {
    match self {
      WireEvent::Fetch {
        url,
        method,
        destination,
        body,
      } => {
        let request = Request::new(method, url).with_destination(destination);
        Some(match body {
          Some(b) => request.with_body(b),
          None => request,
        })
      }
      _ => None,
    }
  }
}
