//! Request/response model and the network seam.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::error::NetworkError;

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Post,
  Put,
  Patch,
  Delete,
  Options,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
      Method::Options => "OPTIONS",
    }
  }

  /// Only plain retrievals are written to the cache.
  pub fn is_cacheable(&self) -> bool {
    matches!(self, Method::Get)
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      "OPTIONS" => Ok(Method::Options),
      other => Err(eyre!("Unsupported request method: {}", other)),
    }
  }
}

/// What the requester intends to do with the response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  /// Top-level page load
  Document,
  Script,
  Style,
  Image,
  Manifest,
  #[default]
  Other,
}

/// An outgoing request issued by a controlled page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      destination: Destination::Other,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::Get, url)
  }

  /// A top-level document load.
  pub fn navigate(url: Url) -> Self {
    Self {
      destination: Destination::Document,
      ..Self::get(url)
    }
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.destination == Destination::Document
  }
}

/// A complete response snapshot. Cloning copies the body, so the cached copy
/// and the copy handed back to the page are independent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub url: Url,
  pub status: u16,
  pub status_text: String,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(url: Url, status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      url,
      status,
      status_text: String::new(),
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn text(&self) -> Cow<'_, str> {
    String::from_utf8_lossy(&self.body)
  }
}

/// Issues requests to the network on behalf of the agent.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// Network access through `reqwest`. Timeouts are left to the client defaults.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("shellcache/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Head => reqwest::Method::HEAD,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
    Method::Options => reqwest::Method::OPTIONS,
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let mut builder = self
      .client
      .request(to_reqwest_method(request.method), request.url.clone());

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let resp = builder
      .send()
      .await
      .map_err(|e| NetworkError::new(request.url.as_str(), e))?;

    let status = resp.status();
    let url = resp.url().clone();
    let headers = resp
      .headers()
      .iter()
      .map(|(k, v)| {
        (
          k.as_str().to_string(),
          String::from_utf8_lossy(v.as_bytes()).into_owned(),
        )
      })
      .collect();

    let body = resp
      .bytes()
      .await
      .map_err(|e| NetworkError::new(request.url.as_str(), e))?
      .to_vec();

    Ok(Response {
      url,
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_method_parse_is_case_insensitive() {
    assert_eq!("get".parse::<Method>().unwrap(), Method::Get);
    assert_eq!("Post".parse::<Method>().unwrap(), Method::Post);
    assert!("BREW".parse::<Method>().is_err());
  }

  #[test]
  fn test_only_get_is_cacheable() {
    assert!(Method::Get.is_cacheable());
    for m in [Method::Head, Method::Post, Method::Put, Method::Patch, Method::Delete] {
      assert!(!m.is_cacheable(), "{} should not be cacheable", m);
    }
  }

  #[test]
  fn test_navigate_sets_document_destination() {
    let url = Url::parse("http://localhost/app/").unwrap();
    assert!(Request::navigate(url.clone()).is_navigation());
    assert!(!Request::get(url).is_navigation());
  }

  #[test]
  fn test_response_ok_range() {
    let url = Url::parse("http://localhost/").unwrap();
    assert!(Response::new(url.clone(), 200, "").ok());
    assert!(Response::new(url.clone(), 204, "").ok());
    assert!(!Response::new(url.clone(), 304, "").ok());
    assert!(!Response::new(url, 500, "").ok());
  }

  #[test]
  fn test_header_lookup_ignores_case() {
    let mut resp = Response::new(Url::parse("http://localhost/").unwrap(), 200, "hi");
    resp
      .headers
      .push(("Content-Type".to_string(), "text/html".to_string()));
    assert_eq!(resp.header("content-type"), Some("text/html"));
    assert_eq!(resp.header("etag"), None);
  }
}
