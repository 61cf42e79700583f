use std::{collections::HashMap, time::Duration};

use tokio::{sync::RwLock, time::Instant};

use super::device::Properties;

#[derive(Clone, Debug)]
struct CacheEntry {
    properties: Properties,
    stored_at: Instant,
}

/// Last successfully read state per device, valid for `ttl`.
///
/// Absorbs bursts of reads for the same device coming from several callers in
/// a short window. Entries are never evicted, only considered stale, so the
/// map is bounded by the number of devices on the account.
#[derive(Debug)]
pub struct StateCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl StateCache {
    pub fn new(ttl: Duration) -> Self {
        StateCache {
            ttl,
            entries: Default::default(),
        }
    }

    pub async fn get(&self, device: &str) -> Option<Properties> {
        let entries = self.entries.read().await;
        let entry = entries.get(device)?;

        if entry.stored_at.elapsed() < self.ttl {
            Some(entry.properties.clone())
        } else {
            None
        }
    }

    pub async fn put(&self, device: &str, properties: Properties) {
        let mut entries = self.entries.write().await;
        entries.insert(
            device.to_string(),
            CacheEntry {
                properties,
                stored_at: Instant::now(),
            },
        );
    }
}
