//! Push-to-notification dispatch and notification click handling.

use chrono::Utc;
use color_eyre::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::platform::{Clients, NotificationId, NotificationSurface};

pub const ACTION_EXPLORE: &str = "explore";
pub const ACTION_CLOSE: &str = "close";

/// A button shown on a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationAction {
  pub action: String,
  pub title: String,
}

/// Opaque data attached to a notification.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
  /// Milliseconds since the Unix epoch
  pub date_of_arrival: i64,
  pub primary_key: serde_json::Value,
}

/// A notification about to be, or currently, displayed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingNotification {
  pub title: String,
  pub body: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tag: Option<String>,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
  pub data: NotificationData,
  pub actions: Vec<NotificationAction>,
}

/// Terminal outcome of a displayed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationState {
  Displayed,
  /// The "close" action was chosen
  Dismissed,
  ClickedExplore,
  /// The body was clicked, or an action we do not know
  ClickedDefault,
}

pub struct NotificationDispatcher {
  config: Arc<AgentConfig>,
  surface: Arc<dyn NotificationSurface>,
  clients: Arc<dyn Clients>,
}

impl NotificationDispatcher {
  pub fn new(
    config: Arc<AgentConfig>,
    surface: Arc<dyn NotificationSurface>,
    clients: Arc<dyn Clients>,
  ) -> Self {
    Self {
      config,
      surface,
      clients,
    }
  }

  /// Build a notification with the agent's fixed icon, vibration and actions.
  pub fn build(&self, title: &str, body: &str, tag: Option<&str>) -> Result<PendingNotification> {
    let icon = self.config.icon_url()?.path().to_string();
    let notifications = &self.config.notifications;

    Ok(PendingNotification {
      title: title.to_string(),
      body: body.to_string(),
      tag: tag.map(String::from),
      badge: icon.clone(),
      icon,
      vibrate: notifications.vibrate.clone(),
      data: NotificationData {
        date_of_arrival: Utc::now().timestamp_millis(),
        primary_key: notifications.primary_key.clone(),
      },
      actions: vec![
        NotificationAction {
          action: ACTION_EXPLORE.to_string(),
          title: "Explore".to_string(),
        },
        NotificationAction {
          action: ACTION_CLOSE.to_string(),
          title: "Close".to_string(),
        },
      ],
    })
  }

  /// Show a notification for a push message.
  pub async fn handle_push(&self, payload: Option<&[u8]>) -> Result<NotificationId> {
    let body = self.push_body(payload);
    let notification = self.build(&self.config.notifications.title, &body, None)?;
    let id = self.surface.show(&notification).await?;
    info!(id, "Displayed push notification");
    Ok(id)
  }

  /// Show a notification requested by a page.
  pub async fn notify(&self, title: &str, body: &str, tag: Option<&str>) -> Result<NotificationId> {
    let notification = self.build(title, body, tag)?;
    self.surface.show(&notification).await
  }

  /// Close the notification, then open the app unless "close" was chosen.
  pub async fn handle_click(
    &self,
    id: NotificationId,
    action: Option<&str>,
  ) -> Result<NotificationState> {
    // Closed before anything else so it never lingers
    if let Err(e) = self.surface.close(id).await {
      warn!(id, "Failed to close notification: {}", e);
    }

    let state = match action {
      Some(ACTION_CLOSE) => return Ok(NotificationState::Dismissed),
      Some(ACTION_EXPLORE) => NotificationState::ClickedExplore,
      Some(other) => {
        debug!(id, action = other, "Unknown notification action");
        NotificationState::ClickedDefault
      }
      None => NotificationState::ClickedDefault,
    };

    let url = self.config.shell_url()?;
    self.clients.open_window(&url).await?;
    Ok(state)
  }

  fn push_body(&self, payload: Option<&[u8]>) -> String {
    // Whitespace only decides the fallback; a usable payload is shown as sent
    let text = payload
      .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
      .filter(|text| {
        text
          .chars()
          .any(|c| !c.is_whitespace() && !c.is_control() && c != '\u{FFFD}')
      });

    match text {
      Some(text) => text,
      None => {
        debug!("Push without usable payload, using default body");
        self.config.notifications.default_body.clone()
      }
    }
  }
}
