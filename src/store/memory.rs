use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;

use super::DurableStore;

/// Process-local store. Contents do not survive a restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
  docs: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl DurableStore for MemoryStore {
  fn load(&self, key: &str) -> Result<Option<String>> {
    let docs = self.docs.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(docs.get(key).cloned())
  }

  fn save(&self, key: &str, value: &str) -> Result<()> {
    let mut docs = self.docs.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    docs.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let mut docs = self.docs.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
    docs.remove(key);
    Ok(())
  }
}
