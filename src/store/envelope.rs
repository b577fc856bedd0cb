//! Versioned envelope around persisted documents.
//!
//! Documents are written as `{"version": N, "data": ...}`. Version 0 is the
//! legacy layout: the bare JSON document with no envelope at all.

use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// Version written by this build.
pub const CURRENT_VERSION: u32 = 1;

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
  version: u32,
  data: &'a T,
}

#[derive(Deserialize)]
struct EnvelopeOwned {
  version: u32,
  data: Value,
}

/// Serialize `data` inside a current-version envelope.
pub fn encode<T: Serialize>(data: &T) -> Result<String> {
  serde_json::to_string(&EnvelopeRef {
    version: CURRENT_VERSION,
    data,
  })
  .map_err(|e| eyre!("Failed to serialize document: {}", e))
}

/// Decode a persisted document.
///
/// `migrate_legacy` rewrites a version 0 document into the current shape
/// before it is deserialized. Unreadable documents and documents written by a
/// newer build are reported and treated as absent.
pub fn decode<T, F>(key: &str, raw: &str, migrate_legacy: F) -> Option<T>
where
  T: DeserializeOwned,
  F: FnOnce(Value) -> Value,
{
  let value: Value = match serde_json::from_str(raw) {
    Ok(v) => v,
    Err(e) => {
      warn!(key, error = %e, "Discarding unreadable persisted document");
      return None;
    }
  };

  let data = match serde_json::from_value::<EnvelopeOwned>(value.clone()) {
    Ok(env) if env.version == CURRENT_VERSION => env.data,
    Ok(env) if env.version > CURRENT_VERSION => {
      warn!(
        key,
        version = env.version,
        "Persisted document written by a newer version, ignoring"
      );
      return None;
    }
    Ok(env) => migrate_legacy(env.data),
    Err(_) => migrate_legacy(value),
  };

  match serde_json::from_value(data) {
    Ok(doc) => Some(doc),
    Err(e) => {
      warn!(key, error = %e, "Discarding persisted document with unexpected shape");
      None
    }
  }
}
