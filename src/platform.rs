//! Outbound calls the agent makes to its host platform.
//!
//! The headless implementations keep state in memory and report through
//! `tracing`; the binary uses them, and so do the tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use url::Url;

use crate::cache::CacheStorage;
use crate::net::Network;
use crate::notify::PendingNotification;

/// Identifier handed out by the notification surface.
pub type NotificationId = u64;

/// An open application window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowClient {
  pub id: u64,
  pub url: Url,
  /// Whether the current agent controls this window
  pub controlled: bool,
}

/// Open application windows.
#[async_trait]
pub trait Clients: Send + Sync {
  /// Enumerate open windows.
  async fn match_all(&self) -> Result<Vec<WindowClient>>;

  /// Open a new window at `url`.
  async fn open_window(&self, url: &Url) -> Result<WindowClient>;

  /// Take control of every open window. Returns how many were claimed.
  async fn claim(&self) -> Result<usize>;
}

/// Where notifications are displayed.
#[async_trait]
pub trait NotificationSurface: Send + Sync {
  async fn show(&self, notification: &PendingNotification) -> Result<NotificationId>;

  async fn close(&self, id: NotificationId) -> Result<()>;
}

/// The registration slot a worker is being installed into.
pub trait Registration: Send + Sync {
  /// Activate as soon as install finishes instead of waiting for open pages
  /// to close.
  fn skip_waiting(&self);
}

/// Everything an agent talks to, shared by every version the host runs.
#[derive(Clone)]
pub struct Platform {
  pub storage: Arc<dyn CacheStorage>,
  pub network: Arc<dyn Network>,
  pub clients: Arc<dyn Clients>,
  pub surface: Arc<dyn NotificationSurface>,
}

/// Windows tracked in memory.
#[derive(Default)]
pub struct HeadlessClients {
  windows: Mutex<Vec<WindowClient>>,
  next_id: AtomicU64,
}

impl HeadlessClients {
  pub fn new() -> Self {
    Self::default()
  }

  /// Record a window the agent does not control yet (a page opened before
  /// activation).
  pub fn attach(&self, url: Url) -> Result<WindowClient> {
    let client = WindowClient {
      id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
      url,
      controlled: false,
    };
    self
      .windows
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .push(client.clone());
    Ok(client)
  }

  pub fn windows(&self) -> Vec<WindowClient> {
    self
      .windows
      .lock()
      .map(|w| w.clone())
      .unwrap_or_default()
  }
}

#[async_trait]
impl Clients for HeadlessClients {
  async fn match_all(&self) -> Result<Vec<WindowClient>> {
    Ok(self.windows())
  }

  async fn open_window(&self, url: &Url) -> Result<WindowClient> {
    let client = WindowClient {
      id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
      url: url.clone(),
      controlled: true,
    };
    info!(id = client.id, url = %url, "Opened window");
    self
      .windows
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .push(client.clone());
    Ok(client)
  }

  async fn claim(&self) -> Result<usize> {
    let mut windows = self
      .windows
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut claimed = 0;
    for window in windows.iter_mut().filter(|w| !w.controlled) {
      window.controlled = true;
      claimed += 1;
    }
    debug!(claimed, "Claimed open windows");
    Ok(claimed)
  }
}

/// Notifications tracked in memory until they are closed.
#[derive(Default)]
pub struct HeadlessSurface {
  displayed: Mutex<BTreeMap<NotificationId, PendingNotification>>,
  next_id: AtomicU64,
}

impl HeadlessSurface {
  pub fn new() -> Self {
    Self::default()
  }

  /// Notifications currently on screen, oldest first.
  pub fn displayed(&self) -> Vec<(NotificationId, PendingNotification)> {
    self
      .displayed
      .lock()
      .map(|d| d.iter().map(|(id, n)| (*id, n.clone())).collect())
      .unwrap_or_default()
  }
}

#[async_trait]
impl NotificationSurface for HeadlessSurface {
  async fn show(&self, notification: &PendingNotification) -> Result<NotificationId> {
    let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    info!(id, title = %notification.title, body = %notification.body, "Showing notification");
    self
      .displayed
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .insert(id, notification.clone());
    Ok(id)
  }

  async fn close(&self, id: NotificationId) -> Result<()> {
    let removed = self
      .displayed
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?
      .remove(&id);
    if removed.is_none() {
      debug!(id, "Closing a notification that is not displayed");
    }
    Ok(())
  }
}

/// A registration slot that only records whether skip-waiting was requested.
#[derive(Debug, Default)]
pub struct WorkerSlot {
  skip_waiting: AtomicBool,
}

impl WorkerSlot {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn skip_waiting_requested(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }
}

impl Registration for WorkerSlot {
  fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
  }
}
