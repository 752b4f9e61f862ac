//! Typed failures for the agent's event handlers.
//!
//! Plumbing (config, storage setup, CLI) uses `color_eyre::Result`; these enums
//! only cover the outcomes a caller has to branch on.

use thiserror::Error;

/// A request could not be completed by the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("request to {url} failed: {reason}")]
pub struct NetworkError {
  pub url: String,
  pub reason: String,
}

impl NetworkError {
  pub fn new(url: impl Into<String>, reason: impl ToString) -> Self {
    Self {
      url: url.into(),
      reason: reason.to_string(),
    }
  }
}

/// Install failed; the new version never activates.
#[derive(Error, Debug)]
pub enum InstallError {
  #[error("failed to fetch manifest entry: {0}")]
  Fetch(#[from] NetworkError),

  #[error("manifest entry {url} returned status {status}")]
  Status { url: String, status: u16 },

  #[error("invalid manifest entry {entry}: {reason}")]
  Manifest { entry: String, reason: String },

  #[error("failed to store manifest in cache {cache}: {reason}")]
  Storage { cache: String, reason: String },
}

/// The interceptor had neither a cached nor a network answer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  #[error(transparent)]
  Network(#[from] NetworkError),

  #[error("offline and no cached shell for {url}")]
  Offline { url: String },
}
