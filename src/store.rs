//! Durable conversation state, one record per sender.
//!
//! The whole store is a single JSON document on disk. Every mutation
//! rewrites the file before returning, so a reply is never in flight
//! without its preceding inbound turn already persisted. Message volume
//! is low relative to disk latency; the rewrite cost is accepted for the
//! simplicity of an always-consistent, directly exportable snapshot.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "in")]
    Inbound,
    #[serde(rename = "out")]
    Outbound,
}

/// One recorded message, in either direction. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub ts: DateTime<Utc>,
    pub direction: Direction,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationRecord {
    #[serde(default)]
    pub name: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub history: Vec<Turn>,
}

impl ConversationRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            name: None,
            first_seen: now,
            last_seen: now,
            history: Vec::new(),
        }
    }

    /// Human label for the operator mirror; falls back to the sender id.
    pub fn display_name(&self, sender_id: &str) -> String {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(sender_id)
            .to_string()
    }
}

pub struct ConversationStore {
    path: PathBuf,
    history_cap: usize,
    inner: Mutex<HashMap<String, ConversationRecord>>,
}

impl ConversationStore {
    /// Open the snapshot at `path`, creating it when absent.
    ///
    /// A snapshot that fails to parse is logged and replaced by an empty
    /// in-memory map: losing history is preferred over refusing to start.
    pub fn load(path: impl Into<PathBuf>, history_cap: usize) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory {:?}", parent))?;
        }

        let map = match fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<HashMap<String, ConversationRecord>>(
                &contents,
            ) {
                Ok(map) => {
                    tracing::info!("Loaded {} conversation(s) from {:?}", map.len(), path);
                    map
                }
                Err(e) => {
                    tracing::warn!(
                        "Snapshot {:?} is unreadable ({}); starting with an empty store",
                        path,
                        e
                    );
                    HashMap::new()
                }
            },
            Err(_) => {
                fs::write(&path, "{}")
                    .with_context(|| format!("Failed to create snapshot file {:?}", path))?;
                tracing::info!("Created new snapshot file {:?}", path);
                HashMap::new()
            }
        };

        Ok(Self {
            path,
            history_cap,
            inner: Mutex::new(map),
        })
    }

    /// Helper to lock the map
    fn lock_map(&self) -> Result<MutexGuard<'_, HashMap<String, ConversationRecord>>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("Store lock poisoned: {}", e))
    }

    /// Fetch a sender's record, creating a fresh one on first contact.
    pub fn get(&self, sender_id: &str) -> Result<ConversationRecord> {
        let mut map = self.lock_map()?;
        Ok(map
            .entry(sender_id.to_string())
            .or_insert_with(|| ConversationRecord::new(Utc::now()))
            .clone())
    }

    /// Refresh the display name and last-seen time on inbound traffic.
    pub fn note_sender(&self, sender_id: &str, display_name: Option<&str>) -> Result<()> {
        let mut map = self.lock_map()?;
        let record = map
            .entry(sender_id.to_string())
            .or_insert_with(|| ConversationRecord::new(Utc::now()));
        if let Some(name) = display_name {
            if !name.trim().is_empty() {
                record.name = Some(name.trim().to_string());
            }
        }
        record.last_seen = Utc::now();
        self.persist(&map)
    }

    /// Append one turn, enforce the history cap, and persist before returning.
    pub fn append_turn(&self, sender_id: &str, direction: Direction, text: &str) -> Result<()> {
        let mut map = self.lock_map()?;
        let record = map
            .entry(sender_id.to_string())
            .or_insert_with(|| ConversationRecord::new(Utc::now()));

        record.history.push(Turn {
            ts: Utc::now(),
            direction,
            text: text.to_string(),
        });

        // Sliding window: evict the oldest, never reorder
        if record.history.len() > self.history_cap {
            let excess = record.history.len() - self.history_cap;
            record.history.drain(..excess);
        }

        self.persist(&map)
    }

    /// The most recent `max_turns` turns, oldest first. Read-only projection.
    pub fn window(&self, sender_id: &str, max_turns: usize) -> Result<Vec<Turn>> {
        let map = self.lock_map()?;
        Ok(match map.get(sender_id) {
            Some(record) => {
                let skip = record.history.len().saturating_sub(max_turns);
                record.history[skip..].to_vec()
            }
            None => Vec::new(),
        })
    }

    /// On-disk location of the snapshot, for the operator export command.
    pub fn snapshot_path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, map: &HashMap<String, ConversationRecord>) -> Result<()> {
        let json = serde_json::to_string_pretty(map).context("Failed to serialize snapshot")?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write snapshot {:?}", self.path))
    }
}
