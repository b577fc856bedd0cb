//! Connectivity-aware request facade.
//!
//! Reads are served live when possible and from the cache otherwise;
//! mutations issued while offline are queued for the sync engine. Every
//! failure is reported as a [`FetchError`].

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{CacheEntry, DurableCache};
use crate::connectivity::ConnectivityMonitor;
use crate::error::FetchError;
use crate::http::{HttpResponse, HttpTransport, ResponseClass, TransportError};
use crate::notify::{Notification, NotificationSink};
use crate::queue::PendingQueue;
use crate::request::{Method, RequestDescriptor};

/// Where a successful response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Live,
  Cache { stored_at: i64, expires_at: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
  pub status: u16,
  pub body: Value,
  pub source: ResponseSource,
}

impl Response {
  fn live(response: HttpResponse) -> Self {
    Self {
      status: response.status,
      body: response.body,
      source: ResponseSource::Live,
    }
  }

  fn cached(entry: CacheEntry) -> Self {
    Self {
      status: 200,
      body: entry.value,
      source: ResponseSource::Cache {
        stored_at: entry.stored_at,
        expires_at: entry.expires_at,
      },
    }
  }

  pub fn is_from_cache(&self) -> bool {
    matches!(self.source, ResponseSource::Cache { .. })
  }
}

type LiveCall = Shared<BoxFuture<'static, Result<HttpResponse, TransportError>>>;

pub struct ResilientClient {
  http: Arc<dyn HttpTransport>,
  cache: Arc<DurableCache>,
  queue: Arc<PendingQueue>,
  monitor: Arc<ConnectivityMonitor>,
  sink: Arc<dyn NotificationSink>,
  /// Live reads in progress, by canonical key
  in_flight: Mutex<HashMap<String, LiveCall>>,
  /// Latest ticket per debounce slot
  debounced: Mutex<HashMap<String, u64>>,
  next_ticket: AtomicU64,
}

impl ResilientClient {
  pub fn new(
    http: Arc<dyn HttpTransport>,
    cache: Arc<DurableCache>,
    queue: Arc<PendingQueue>,
    monitor: Arc<ConnectivityMonitor>,
    sink: Arc<dyn NotificationSink>,
  ) -> Self {
    Self {
      http,
      cache,
      queue,
      monitor,
      sink,
      in_flight: Mutex::new(HashMap::new()),
      debounced: Mutex::new(HashMap::new()),
      next_ticket: AtomicU64::new(0),
    }
  }

  /// Issue `descriptor`, falling back to the cache or the queue when the
  /// server cannot be reached.
  pub async fn request(&self, descriptor: &RequestDescriptor) -> Result<Response, FetchError> {
    if !self.monitor.is_online() {
      return self.offline(descriptor, false);
    }

    let key = descriptor
      .is_cacheable()
      .then(|| descriptor.canonical_key());

    let result = match &key {
      Some(key) => self.shared_live_call(key, descriptor).await,
      None => self.http.send(descriptor).await,
    };

    match result {
      Ok(response) => self.handle_response(descriptor, key.as_deref(), response),
      Err(TransportError::InvalidRequest(reason)) => {
        warn!(method = %descriptor.method, url = %descriptor.url, %reason, "Invalid request");
        self.sink.notify(Notification::error(
          "Request Failed",
          format!(
            "{} {} could not be sent: {}.",
            descriptor.method, descriptor.url, reason
          ),
        ));
        Err(FetchError::Invalid { reason })
      }
      Err(e) => {
        warn!(
          method = %descriptor.method,
          url = %descriptor.url,
          error = %e,
          "Live request failed, falling back to offline handling"
        );
        self.offline(descriptor, true)
      }
    }
  }

  /// Run `descriptors` with at most `concurrency` in flight. Results come
  /// back in input order.
  pub async fn batch(
    &self,
    descriptors: &[RequestDescriptor],
    concurrency: usize,
  ) -> Vec<Result<Response, FetchError>> {
    stream::iter(descriptors.iter().map(|d| self.request(d)))
      .buffered(concurrency.max(1))
      .collect()
      .await
  }

  /// Issue `descriptor` once `delay` has passed without another call for
  /// the same `slot`.
  ///
  /// A newer call supersedes the pending one, which then resolves to `None`
  /// without touching the network.
  pub async fn request_debounced(
    &self,
    slot: &str,
    descriptor: &RequestDescriptor,
    delay: Duration,
  ) -> Option<Result<Response, FetchError>> {
    let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
    self.debounce_slots().insert(slot.to_string(), ticket);

    tokio::time::sleep(delay).await;

    {
      let mut slots = self.debounce_slots();
      if slots.get(slot) != Some(&ticket) {
        debug!(slot, "Debounced request superseded");
        return None;
      }
      slots.remove(slot);
    }
    Some(self.request(descriptor).await)
  }

  /// Number of distinct live reads currently in progress.
  pub fn in_flight(&self) -> usize {
    self.in_flight_calls().len()
  }

  /// Join an identical read already in progress, or start one.
  async fn shared_live_call(
    &self,
    key: &str,
    descriptor: &RequestDescriptor,
  ) -> Result<HttpResponse, TransportError> {
    let call = {
      let mut in_flight = self.in_flight_calls();
      match in_flight.get(key) {
        Some(existing) => {
          debug!(key, "Joining in-flight request");
          existing.clone()
        }
        None => {
          let http = self.http.clone();
          let request = descriptor.clone();
          let call = async move { http.send(&request).await }.boxed().shared();
          in_flight.insert(key.to_string(), call.clone());
          call
        }
      }
    };

    let result = call.clone().await;

    let mut in_flight = self.in_flight_calls();
    if in_flight.get(key).is_some_and(|current| current.ptr_eq(&call)) {
      in_flight.remove(key);
    }
    result
  }

  fn handle_response(
    &self,
    descriptor: &RequestDescriptor,
    key: Option<&str>,
    response: HttpResponse,
  ) -> Result<Response, FetchError> {
    match response.class() {
      ResponseClass::Success => {
        if let Some(key) = key {
          let ttl = descriptor.ttl().unwrap_or_else(|| self.cache.default_ttl());
          self.cache.put(key, response.body.clone(), ttl);
        }
        Ok(Response::live(response))
      }
      ResponseClass::ClientError => {
        warn!(
          method = %descriptor.method,
          url = %descriptor.url,
          status = response.status,
          "Request rejected"
        );
        self.sink.notify(Notification::error(
          "Request Failed",
          format!(
            "{} {} was rejected ({}).",
            descriptor.method, descriptor.url, response.status
          ),
        ));
        Err(FetchError::Rejected {
          status: response.status,
          body: response.body,
        })
      }
      ResponseClass::TransientError => Err(FetchError::Http {
        status: response.status,
        body: response.body,
      }),
    }
  }

  /// Serve `descriptor` without the server. `after_failure` is set when a
  /// live attempt was just made and failed.
  fn offline(
    &self,
    descriptor: &RequestDescriptor,
    after_failure: bool,
  ) -> Result<Response, FetchError> {
    if descriptor.method != Method::Get {
      let id = self.queue.enqueue(descriptor);
      info!(%id, method = %descriptor.method, url = %descriptor.url, "Request queued");
      self.sink.notify(Notification::info(
        "Request Queued",
        "Your request will be sent when connection is restored.",
      ));
      return Err(FetchError::Queued { id });
    }

    let key = descriptor.canonical_key();
    let cached = if descriptor.is_cacheable() {
      self.cache.get(&key)
    } else {
      None
    };

    match cached {
      Some(entry) => {
        debug!(key = %key, "Serving from cache");
        if after_failure {
          self.sink.notify(Notification::warning(
            "Using Cached Data",
            "Network error. Showing cached data.",
          ));
        }
        Ok(Response::cached(entry))
      }
      None => Err(FetchError::OfflineNoCache { key }),
    }
  }

  fn in_flight_calls(&self) -> MutexGuard<'_, HashMap<String, LiveCall>> {
    self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn debounce_slots(&self) -> MutexGuard<'_, HashMap<String, u64>> {
    self.debounced.lock().unwrap_or_else(|e| e.into_inner())
  }
}
