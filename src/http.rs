//! HTTP boundary: the transport trait the facade and sync engine call through,
//! and its reqwest implementation.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use serde_json::Value;
use std::time::Duration;
use url::Url;

use crate::request::{Method, RequestDescriptor};

/// Raw response as seen by the resiliency layer.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
  pub status: u16,
  pub body: Value,
}

impl HttpResponse {
  pub fn new(status: u16, body: Value) -> Self {
    Self { status, body }
  }

  pub fn class(&self) -> ResponseClass {
    ResponseClass::of(self.status)
  }
}

/// Transport-level failure: the server was never reached.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
  #[error("network error: {0}")]
  Network(String),

  #[error("request timed out")]
  Timeout,

  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

/// How a response status should be treated by retry logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
  Success,
  /// Server rejected the request itself; retrying cannot help
  ClientError,
  /// Server-side or throttling failure worth retrying later
  TransientError,
}

impl ResponseClass {
  pub fn of(status: u16) -> Self {
    match status {
      200..=299 => ResponseClass::Success,
      408 | 429 => ResponseClass::TransientError,
      400..=499 => ResponseClass::ClientError,
      _ => ResponseClass::TransientError,
    }
  }
}

/// Something that can perform a live request.
pub trait HttpTransport: Send + Sync {
  fn send<'a>(
    &'a self,
    request: &'a RequestDescriptor,
  ) -> BoxFuture<'a, Result<HttpResponse, TransportError>>;
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl ReqwestTransport {
  pub fn new(base_url: &str, timeout: Duration, token: Option<String>) -> Result<Self> {
    let base_url =
      Url::parse(base_url).map_err(|e| eyre!("Invalid base URL '{}': {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  /// Resolve a possibly relative URL against the base URL.
  fn resolve(&self, url: &str) -> Result<Url, TransportError> {
    match Url::parse(url) {
      Ok(u) => Ok(u),
      Err(url::ParseError::RelativeUrlWithoutBase) => self
        .base_url
        .join(url)
        .map_err(|e| TransportError::InvalidRequest(e.to_string())),
      Err(e) => Err(TransportError::InvalidRequest(e.to_string())),
    }
  }

  async fn execute(&self, request: &RequestDescriptor) -> Result<HttpResponse, TransportError> {
    let url = self.resolve(&request.url)?;

    let mut builder = self
      .client
      .request(reqwest_method(request.method), url)
      .header(reqwest::header::ACCEPT, "application/json");

    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }

    let has_auth = request
      .headers
      .keys()
      .any(|k| k.eq_ignore_ascii_case("authorization"));
    if let (Some(token), false) = (&self.token, has_auth) {
      builder = builder.bearer_auth(token);
    }

    if let Some(body) = &request.body {
      let bytes =
        serde_json::to_vec(body).map_err(|e| TransportError::InvalidRequest(e.to_string()))?;
      builder = builder
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(bytes);
    }

    let response = builder.send().await.map_err(map_reqwest_error)?;
    let status = response.status().as_u16();
    let bytes = response.bytes().await.map_err(map_reqwest_error)?;

    Ok(HttpResponse::new(status, parse_body(&bytes)))
  }
}

impl HttpTransport for ReqwestTransport {
  fn send<'a>(
    &'a self,
    request: &'a RequestDescriptor,
  ) -> BoxFuture<'a, Result<HttpResponse, TransportError>> {
    Box::pin(self.execute(request))
  }
}

fn reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
  }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
  if e.is_timeout() {
    TransportError::Timeout
  } else if e.is_builder() {
    TransportError::InvalidRequest(e.to_string())
  } else {
    TransportError::Network(e.to_string())
  }
}

/// JSON bodies are parsed, anything else is kept as a string.
fn parse_body(bytes: &[u8]) -> Value {
  if bytes.is_empty() {
    return Value::Null;
  }
  serde_json::from_slice(bytes)
    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned()))
}
