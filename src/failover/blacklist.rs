//! Failed host exclusion table
//!
//! One table is shared by every connection a driver opens, so a host that
//! just refused one election is tried last by the others.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::host::HostAddress;

#[derive(Debug, Clone, Copy)]
struct Entry {
    at: Instant,
    wall: DateTime<Utc>,
}

/// Point-in-time view of one excluded host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub host: String,
    pub failed_at: DateTime<Utc>,
}

/// Hosts that recently failed, with their failure time
#[derive(Debug, Default)]
pub struct Blacklist {
    entries: RwLock<HashMap<HostAddress, Entry>>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure, replacing any earlier one for the host
    pub async fn record(&self, host: &HostAddress, at: Instant) {
        let wall = Utc::now()
            - chrono::Duration::from_std(at.elapsed()).unwrap_or_else(|_| chrono::Duration::zero());
        self.entries
            .write()
            .await
            .insert(host.clone(), Entry { at, wall });
        tracing::debug!("Blacklisted {}", host);
    }

    /// Forget a host that answered again
    pub async fn clear(&self, host: &HostAddress) {
        if self.entries.write().await.remove(host).is_some() {
            tracing::debug!("Removed {} from blacklist", host);
        }
    }

    /// Check if a host is still excluded at `now`.
    ///
    /// Expired entries are dropped on the way.
    pub async fn is_excluded(&self, host: &HostAddress, now: Instant, timeout: Duration) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get(host) {
            Some(entry) if now.saturating_duration_since(entry.at) < timeout => true,
            Some(_) => {
                entries.remove(host);
                false
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Current entries, oldest failure first
    pub async fn snapshot(&self) -> Vec<BlacklistEntry> {
        let entries = self.entries.read().await;
        let mut list: Vec<_> = entries
            .iter()
            .map(|(host, entry)| (entry.at, BlacklistEntry {
                host: host.to_string(),
                failed_at: entry.wall,
            }))
            .collect();
        list.sort_by_key(|(at, _)| *at);
        list.into_iter().map(|(_, entry)| entry).collect()
    }

    pub async fn clear_all(&self) {
        self.entries.write().await.clear();
    }
}
