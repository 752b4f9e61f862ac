//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use url::Url;

use crate::config::AgentConfig;
use crate::error::NetworkError;
use crate::net::{Network, Request, Response};

/// Network with canned replies per URL. Unknown URLs fail like a dropped
/// connection.
#[derive(Default)]
pub struct MockNetwork {
  replies: Mutex<HashMap<Url, Result<(u16, String), String>>>,
  calls: AtomicUsize,
  seen: Mutex<Vec<Request>>,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, url: &Url, status: u16, body: &str) {
    self
      .replies
      .lock()
      .unwrap()
      .insert(url.clone(), Ok((status, body.to_string())));
  }

  pub fn fail(&self, url: &Url) {
    self
      .replies
      .lock()
      .unwrap()
      .insert(url.clone(), Err("connection refused".to_string()));
  }

  /// Every URL stops answering.
  pub fn go_offline(&self) {
    let mut replies = self.replies.lock().unwrap();
    for reply in replies.values_mut() {
      *reply = Err("offline".to_string());
    }
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn requests(&self) -> Vec<Request> {
    self.seen.lock().unwrap().clone()
  }
}

#[async_trait]
impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    self.seen.lock().unwrap().push(request.clone());

    let reply = self.replies.lock().unwrap().get(&request.url).cloned();
    match reply {
      Some(Ok((status, body))) => Ok(Response::new(request.url.clone(), status, body)),
      Some(Err(reason)) => Err(NetworkError::new(request.url.as_str(), reason)),
      None => Err(NetworkError::new(request.url.as_str(), "no route")),
    }
  }
}

/// Config served from the origin root with a three-entry manifest.
pub fn root_config(cache_name: &str) -> AgentConfig {
  AgentConfig {
    origin: Url::parse("http://localhost").unwrap(),
    base_path: String::new(),
    cache_name: cache_name.to_string(),
    manifest: vec![
      "/".to_string(),
      "/manifest.json".to_string(),
      "/icon-192x192.png".to_string(),
    ],
    ..AgentConfig::default()
  }
}

/// Make every manifest entry of `config` fetchable.
pub fn serve_manifest(network: &MockNetwork, config: &AgentConfig) {
  for url in config.manifest_urls().unwrap() {
    network.respond(&url, 200, &format!("body of {}", url.path()));
  }
}
