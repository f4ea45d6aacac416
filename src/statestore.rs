//! State derivation from the per-user event log.
//!
//! `get_state` answers "what was this user's state strictly before the
//! incoming event", trusting a TTL'd snapshot cache when it can and
//! replaying a bounded window of the log when it cannot. `update_state`
//! refreshes the snapshot after every processed event.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::cache::TtlCache;
use crate::config::EngineSettings;
use crate::engine::event::Event;
use crate::engine::machine::{self, MachineError};
use crate::engine::state::State;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event log unavailable: {0}")]
    Log(String),
    #[error("log entry failed to parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Machine(#[from] MachineError),
}

/// Append-only per-user event log. Entries are the raw JSON strings as
/// ingested; equality on the raw string is what re-delivery detection
/// relies on.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, user: &str, raw: &str) -> Result<(), StoreError>;

    /// Up to `limit` most recent entries, oldest first.
    async fn recent(&self, user: &str, limit: usize) -> Result<Vec<String>, StoreError>;
}

/// Align a fetched window with the incoming entry: a re-delivered event is
/// already in the window, so cut everything after its first occurrence;
/// a genuinely new event goes on the end.
fn resolve(mut window: Vec<String>, incoming: &str) -> Vec<String> {
    match window.iter().position(|entry| entry == incoming) {
        Some(i) => {
            window.truncate(i + 1);
            window
        }
        None => {
            window.push(incoming.to_string());
            window
        }
    }
}

pub struct StateStore {
    settings: EngineSettings,
    cache: TtlCache<State>,
    log: Arc<dyn EventLog>,
    window: usize,
}

impl StateStore {
    pub fn new(
        settings: EngineSettings,
        log: Arc<dyn EventLog>,
        ttl: Duration,
        window: usize,
    ) -> Self {
        Self {
            settings,
            cache: TtlCache::new(ttl),
            log,
            window,
        }
    }

    fn key(user: &str) -> String {
        format!("state:{user}")
    }

    /// State reflecting every event strictly before `incoming`. A cache hit
    /// is authoritative; only a miss replays the log.
    pub async fn get_state(&self, user: &str, incoming: &str) -> Result<State, StoreError> {
        if let Some(cached) = self.cache.get(&Self::key(user)).await {
            return Ok(cached);
        }

        let window = self.log.recent(user, self.window).await?;
        let resolved = resolve(window, incoming);
        let mut events = Vec::with_capacity(resolved.len());
        for raw in &resolved {
            events.push(Event::parse(raw)?);
        }
        // drop the incoming event itself; it has not happened yet
        events.pop();
        Ok(machine::reduce(&self.settings, &events)?)
    }

    /// Write the snapshot with a fresh expiry. Called after every processed
    /// event, hit or miss.
    pub async fn update_state(&self, user: &str, state: &State) {
        self.cache.put(Self::key(user), state.clone()).await;
    }

    pub async fn evict(&self, user: &str) {
        self.cache.remove(&Self::key(user)).await;
    }
}

/// Log adapter backed by process memory. The deployment wires a real log
/// service in; tests and the demo composition use this.
#[derive(Default)]
pub struct InMemoryEventLog {
    entries: Mutex<std::collections::HashMap<String, Vec<String>>>,
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, user: &str, raw: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries
            .entry(user.to_string())
            .or_default()
            .push(raw.to_string());
        Ok(())
    }

    async fn recent(&self, user: &str, limit: usize) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock().await;
        let log = entries.get(user).cloned().unwrap_or_default();
        let skip = log.len().saturating_sub(limit);
        Ok(log[skip..].to_vec())
    }
}
