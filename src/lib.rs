//! Offline-resilient request layer.
//!
//! Cacheable reads are kept in a durable cache and served from it while the
//! server is unreachable; mutations issued offline are queued durably and
//! replayed once connectivity returns. Push channels reconnect with
//! exponential backoff and keep themselves alive with a heartbeat.

pub mod cache;
pub mod channel;
pub mod client;
pub mod clock;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod http;
pub mod logging;
pub mod notify;
pub mod queue;
pub mod request;
pub mod service;
pub mod store;
pub mod sync;

#[cfg(test)]
mod testing;

pub use cache::{CacheEntry, CacheStats, DurableCache};
pub use channel::{ChannelEvent, ChannelPolicy, ChannelRegistry, ChannelState, ReconnectingChannel};
pub use client::{ResilientClient, Response, ResponseSource};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use connectivity::{ConnectionState, ConnectivityMonitor, ReachabilityProbe, Transition};
pub use error::FetchError;
pub use http::{HttpResponse, HttpTransport, ReqwestTransport, TransportError};
pub use notify::{Level, Notification, NotificationSink};
pub use queue::{PendingQueue, QueueId, QueuedRequest};
pub use request::{CachePolicy, Method, RequestDescriptor};
pub use service::{OfflineService, ServiceOptions};
pub use store::{DurableStore, MemoryStore, SqliteStore};
pub use sync::{DrainSummary, SyncEngine};
