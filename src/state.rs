//! # Application State Management
//!
//! Shared state of the relay server, accessed by every HTTP handler and every
//! websocket actor at the same time.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers and actors hold a reference to the same data
//! - **RwLock**: many readers or one writer at a time
//! - **T**: the data being protected
//!
//! Locks are only held for the duration of a field update or a clone; nothing
//! awaits while holding one.

use crate::config::AppConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

/// State shared by all relay handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Relay counters
    pub metrics: Arc<RwLock<RelayMetrics>>,

    /// Relay connections currently open, keyed by session id
    pub sessions: Arc<RwLock<HashMap<String, RelaySessionInfo>>>,

    /// When the server started
    pub start_time: Instant,
}

/// Counters collected across all relay connections.
#[derive(Debug, Default, Clone, Serialize)]
pub struct RelayMetrics {
    /// Client websocket connections accepted since start
    pub connections_total: u64,

    /// Connections that failed to reach the upstream agent
    pub upstream_errors: u64,

    /// Frames forwarded client → agent
    pub frames_to_upstream: u64,

    /// Frames forwarded agent → client
    pub frames_to_client: u64,

    /// Assessment updates injected by the sidecar
    pub sidecar_updates: u64,
}

/// One open relay connection.
#[derive(Debug, Clone, Serialize)]
pub struct RelaySessionInfo {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub upstream_connected: bool,
    pub user_turns: usize,
    pub agent_turns: usize,
}

impl RelaySessionInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            started_at: Utc::now(),
            upstream_connected: false,
            user_turns: 0,
            agent_turns: 0,
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(RelayMetrics::default())),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so other threads aren't blocked.
    pub fn get_config(&self) -> AppConfig {
        read(&self.config).clone()
    }

    /// Apply a partial JSON update to the configuration.
    ///
    /// The update is applied to a copy and only stored if it validates.
    pub fn update_config_from_json(&self, json: &str) -> anyhow::Result<AppConfig> {
        let mut updated = self.get_config();
        updated.update_from_json(json)?;
        *write(&self.config) = updated.clone();
        Ok(updated)
    }

    pub fn register_session(&self, id: &str) {
        write(&self.metrics).connections_total += 1;
        write(&self.sessions).insert(id.to_string(), RelaySessionInfo::new(id));
    }

    pub fn remove_session(&self, id: &str) {
        write(&self.sessions).remove(id);
    }

    /// Run `f` on a session's entry if it is still registered.
    pub fn update_session<F: FnOnce(&mut RelaySessionInfo)>(&self, id: &str, f: F) {
        if let Some(info) = write(&self.sessions).get_mut(id) {
            f(info);
        }
    }

    pub fn record_upstream_error(&self) {
        write(&self.metrics).upstream_errors += 1;
    }

    pub fn record_frame_to_upstream(&self) {
        write(&self.metrics).frames_to_upstream += 1;
    }

    pub fn record_frame_to_client(&self) {
        write(&self.metrics).frames_to_client += 1;
    }

    pub fn record_sidecar_update(&self) {
        write(&self.metrics).sidecar_updates += 1;
    }

    pub fn get_metrics_snapshot(&self) -> RelayMetrics {
        read(&self.metrics).clone()
    }

    /// Open sessions, oldest first.
    pub fn list_sessions(&self) -> Vec<RelaySessionInfo> {
        let mut sessions: Vec<RelaySessionInfo> = read(&self.sessions).values().cloned().collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    pub fn active_sessions(&self) -> usize {
        read(&self.sessions).len()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
