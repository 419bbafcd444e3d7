//! Clipboard hub: bounded, device-attributed sync history
//!
//! A capacity-bounded ring of synchronized items, newest first, with
//! adjacent-duplicate suppression and membership bookkeeping mirrored from
//! the session store for UI display.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// One synchronized clipboard item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HubEntry {
    pub id: Uuid,
    pub content: Vec<u8>,
    pub source_device: String,
    pub timestamp: DateTime<Utc>,
    /// Devices this entry has been confirmed synced to
    pub synced_devices: HashSet<String>,
}

/// Bounded clipboard history with device attribution
pub struct ClipboardHub {
    /// Newest entry at the front
    entries: RwLock<VecDeque<HubEntry>>,
    devices: RwLock<HashSet<String>>,
    capacity: usize,
}

impl ClipboardHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            devices: RwLock::new(HashSet::new()),
            capacity: capacity.max(1),
        }
    }

    /// Insert content attributed to a device
    ///
    /// A no-op returning `None` when the content equals the most recent
    /// entry's content. Evicts the oldest entries beyond capacity.
    pub async fn insert(&self, content: Vec<u8>, source_device: &str) -> Option<Uuid> {
        let mut entries = self.entries.write().await;
        if entries.front().map(|e| e.content == content).unwrap_or(false) {
            debug!(source_device, "Adjacent duplicate suppressed");
            return None;
        }

        let entry = HubEntry {
            id: Uuid::new_v4(),
            content,
            source_device: source_device.to_string(),
            timestamp: Utc::now(),
            synced_devices: HashSet::new(),
        };
        let id = entry.id;
        entries.push_front(entry);
        while entries.len() > self.capacity {
            entries.pop_back();
        }
        Some(id)
    }

    /// Case-insensitive substring search over text entries, newest first
    pub async fn search(&self, query: &str) -> Vec<HubEntry> {
        let needle = query.to_lowercase();
        self.entries
            .read()
            .await
            .iter()
            .filter(|entry| {
                std::str::from_utf8(&entry.content)
                    .map(|text| text.to_lowercase().contains(&needle))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// The most recent `count` entries, newest first
    pub async fn recent(&self, count: usize) -> Vec<HubEntry> {
        self.entries.read().await.iter().take(count).cloned().collect()
    }

    /// Record that a device has received an entry
    pub async fn mark_synced(&self, entry_id: Uuid, device_id: &str) -> bool {
        let mut entries = self.entries.write().await;
        match entries.iter_mut().find(|e| e.id == entry_id) {
            Some(entry) => {
                entry.synced_devices.insert(device_id.to_string());
                true
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

    /// Membership bookkeeping, mirrored from the session store
    pub async fn add_device(&self, device_id: &str) {
        self.devices.write().await.insert(device_id.to_string());
    }

    pub async fn remove_device(&self, device_id: &str) {
        self.devices.write().await.remove(device_id);
    }

    pub async fn connected_devices(&self) -> Vec<String> {
        let mut devices: Vec<String> = self.devices.read().await.iter().cloned().collect();
        devices.sort();
        devices
    }

    /// Per-device count of entries currently held, for UI display
    pub async fn device_counts(&self) -> Vec<(String, usize)> {
        let entries = self.entries.read().await;
        let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for entry in entries.iter() {
            *counts.entry(entry.source_device.clone()).or_default() += 1;
        }
        let mut counts: Vec<_> = counts.into_iter().collect();
        counts.sort();
        counts
    }
}
