//! Request descriptors and canonical cache keys.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(format!("unsupported method: {}", other)),
    }
  }
}

/// Whether a request may be served from (and stored into) the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicy {
  /// Idempotent read: cached on success, served from cache while offline
  CacheableRead,
  /// Mutation: never cached, queued while offline
  Mutation,
}

/// Everything needed to issue, cache, or replay a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestDescriptor {
  pub method: Method,
  pub url: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Option<Value>,
  pub policy: CachePolicy,
  /// Cache lifetime override for cacheable reads
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ttl_ms: Option<u64>,
}

impl RequestDescriptor {
  /// Create a descriptor; GET defaults to a cacheable read, everything else
  /// to a mutation.
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    let policy = match method {
      Method::Get => CachePolicy::CacheableRead,
      _ => CachePolicy::Mutation,
    };
    Self {
      method,
      url: url.into(),
      headers: BTreeMap::new(),
      body: None,
      policy,
      ttl_ms: None,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn post(url: impl Into<String>, body: Value) -> Self {
    Self::new(Method::Post, url).with_body(body)
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  pub fn with_ttl(mut self, ttl: Duration) -> Self {
    self.ttl_ms = Some(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
    self
  }

  /// Force the request past the cache, even for GET.
  pub fn uncached(mut self) -> Self {
    self.policy = CachePolicy::Mutation;
    self
  }

  pub fn is_cacheable(&self) -> bool {
    self.policy == CachePolicy::CacheableRead
  }

  pub fn ttl(&self) -> Option<Duration> {
    self.ttl_ms.map(Duration::from_millis)
  }

  /// Deterministic key correlating this request with its cache entry.
  ///
  /// Built from method, URL (query parameters sorted) and body. Headers are
  /// left out so a refreshed auth token does not orphan cached data.
  pub fn canonical_key(&self) -> String {
    let body = self
      .body
      .as_ref()
      .map(|b| b.to_string())
      .unwrap_or_default();
    let input = format!("{}:{}:{}", self.method, normalize_url(&self.url), body);

    // SHA256 hash for stable, fixed-length keys
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hex::encode(hasher.finalize());

    // Keep a readable prefix so `clear(pattern)` can match on paths
    format!("{}:{}#{}", self.method, path_of(&self.url), &digest[..16])
  }
}

/// Trim the URL and sort its query parameters.
fn normalize_url(url: &str) -> String {
  let url = url.trim();
  match url.split_once('?') {
    Some((path, query)) => {
      let mut params: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
      params.sort_unstable();
      format!("{}?{}", path, params.join("&"))
    }
    None => url.to_string(),
  }
}

fn path_of(url: &str) -> &str {
  let url = url.trim();
  url.split_once('?').map(|(p, _)| p).unwrap_or(url)
}
