//! Session pooling
//!
//! Remote sessions are expensive to create, so finished sessions are reset
//! and reused for later tasks of the same work type. Reuse must never leak
//! state between unrelated tasks: a pooled session is reset before it is
//! handed out, and a session touched by a task error is invalidated rather
//! than pooled.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use fanout_contracts::CreateSessionRequest;

use crate::remote::{ApiError, SessionApi};

/// Session pool configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionPoolConfig {
    /// Maximum sessions per work type
    pub max_per_type: usize,

    /// Maximum sessions across all work types
    pub global_max: usize,

    /// Idle time after which a pooled session is destroyed
    #[serde(with = "crate::duration_millis")]
    pub idle_timeout: Duration,

    /// Times a session may be handed back before forced recycling
    pub max_reuse_count: u32,

    /// Interval of the periodic cleanup sweep
    #[serde(with = "crate::duration_millis")]
    pub sweep_interval: Duration,

    /// Prefix for remote session titles
    pub title_prefix: String,

    /// Project context stamped on every session (e.g. a working directory)
    #[serde(default)]
    pub project_context: Option<String>,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_per_type: 10,
            global_max: 30,
            idle_timeout: Duration::from_secs(180),
            max_reuse_count: 20,
            sweep_interval: Duration::from_secs(30),
            title_prefix: "Fanout".to_string(),
            project_context: None,
        }
    }
}

impl SessionPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_per_type(mut self, max: usize) -> Self {
        self.max_per_type = max.max(1);
        self
    }

    pub fn with_global_max(mut self, max: usize) -> Self {
        self.global_max = max.max(1);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_max_reuse_count(mut self, count: u32) -> Self {
        self.max_reuse_count = count.max(1);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    pub fn with_project_context(mut self, context: impl Into<String>) -> Self {
        self.project_context = Some(context.into());
        self
    }
}

/// Session pool errors
#[derive(Debug, thiserror::Error)]
pub enum SessionPoolError {
    /// Per-type or global session ceiling hit (acquire_immediate only)
    #[error("session capacity exhausted for work type '{work_type}'")]
    Capacity { work_type: String },

    /// Remote call failed
    #[error("remote session error: {0}")]
    Api(#[from] ApiError),

    /// Pool is shutting down
    #[error("session pool is shut down")]
    ShutDown,
}

/// Health of a pooled session
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

/// A reusable remote execution context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PooledSession {
    pub id: String,
    /// Work type this session is currently configured for.
    pub work_type: String,
    pub project_context: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub reuse_count: u32,
    pub in_use: bool,
    pub health: SessionHealth,
}

impl PooledSession {
    fn available(&self, max_reuse: u32) -> bool {
        !self.in_use && self.health == SessionHealth::Healthy && self.reuse_count < max_reuse
    }
}

/// Pool statistics snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionPoolStats {
    pub total_sessions: usize,
    pub sessions_in_use: usize,
    pub available_sessions: usize,
    pub reuse_hits: u64,
    pub creation_misses: u64,
    pub by_type: HashMap<String, usize>,
}

struct PoolState {
    sessions: HashMap<String, PooledSession>,
    /// Acquires waiting for capacity, woken on release/destroy.
    waiters: VecDeque<oneshot::Sender<()>>,
    reuse_hits: u64,
    creation_misses: u64,
    shut_down: bool,
}

/// Bounded pool of reusable remote sessions
pub struct SessionPool {
    api: Arc<dyn SessionApi>,
    config: SessionPoolConfig,
    state: Mutex<PoolState>,
}

impl SessionPool {
    pub fn new(api: Arc<dyn SessionApi>, config: SessionPoolConfig) -> Self {
        Self {
            api,
            config,
            state: Mutex::new(PoolState {
                sessions: HashMap::new(),
                waiters: VecDeque::new(),
                reuse_hits: 0,
                creation_misses: 0,
                shut_down: false,
            }),
        }
    }

    pub fn config(&self) -> &SessionPoolConfig {
        &self.config
    }

    /// Acquire a session, waiting when the pool is at capacity.
    ///
    /// Prefers a pooled healthy session for `work_type` (reset before it is
    /// handed out); creates a new one when under the per-type and global
    /// ceilings; otherwise waits for a release to free capacity.
    pub async fn acquire(
        &self,
        work_type: &str,
        parent_id: &str,
        description: &str,
    ) -> Result<PooledSession, SessionPoolError> {
        loop {
            match self.try_acquire(work_type, parent_id, description).await? {
                Some(session) => return Ok(session),
                None => {
                    let rx = {
                        let mut state = self.state.lock();
                        if state.shut_down {
                            return Err(SessionPoolError::ShutDown);
                        }
                        let (tx, rx) = oneshot::channel();
                        state.waiters.push_back(tx);
                        rx
                    };
                    // Woken by release/destroy; loop to retry the pool.
                    let _ = rx.await;
                }
            }
        }
    }

    /// Acquire without waiting; fails fast with a capacity error.
    ///
    /// For callers that already gated on the concurrency controller and
    /// want a hard guarantee instead of a second wait.
    pub async fn acquire_immediate(
        &self,
        work_type: &str,
        parent_id: &str,
        description: &str,
    ) -> Result<PooledSession, SessionPoolError> {
        match self.try_acquire(work_type, parent_id, description).await? {
            Some(session) => Ok(session),
            None => Err(SessionPoolError::Capacity {
                work_type: work_type.to_string(),
            }),
        }
    }

    /// One acquisition attempt: pooled reuse, then creation under ceilings.
    ///
    /// `Ok(None)` means the pool is full and the caller decides whether to
    /// wait or fail.
    async fn try_acquire(
        &self,
        work_type: &str,
        parent_id: &str,
        description: &str,
    ) -> Result<Option<PooledSession>, SessionPoolError> {
        loop {
            // Claim a pooled candidate under the lock, reset it outside.
            let candidate = {
                let mut state = self.state.lock();
                if state.shut_down {
                    return Err(SessionPoolError::ShutDown);
                }
                let max_reuse = self.config.max_reuse_count;
                let id = state
                    .sessions
                    .values()
                    .filter(|s| s.work_type == work_type && s.available(max_reuse))
                    .min_by_key(|s| s.last_used_at)
                    .map(|s| s.id.clone());
                if let Some(id) = &id {
                    let session = state.sessions.get_mut(id).expect("claimed session exists");
                    session.in_use = true;
                    session.last_used_at = Utc::now();
                }
                id
            };

            if let Some(id) = candidate {
                // Mandatory reset before reuse so no task state leaks.
                match self.api.reset_session(&id).await {
                    Ok(()) => {
                        let mut guard = self.state.lock();
                        let state = &mut *guard;
                        if let Some(session) = state.sessions.get_mut(&id) {
                            state.reuse_hits += 1;
                            debug!(
                                session_id = %id,
                                work_type,
                                reuse_count = session.reuse_count,
                                "reusing pooled session"
                            );
                            return Ok(Some(session.clone()));
                        }
                        // Swept away between claim and reset; try again.
                        continue;
                    }
                    Err(err) => {
                        warn!(session_id = %id, "session reset failed, degrading: {err}");
                        let mut state = self.state.lock();
                        if let Some(session) = state.sessions.get_mut(&id) {
                            session.in_use = false;
                            session.health = SessionHealth::Degraded;
                        }
                        continue;
                    }
                }
            }

            // Nothing poolable; create if the ceilings allow.
            {
                let state = self.state.lock();
                if state.shut_down {
                    return Err(SessionPoolError::ShutDown);
                }
                let per_type = state
                    .sessions
                    .values()
                    .filter(|s| s.work_type == work_type)
                    .count();
                if state.sessions.len() >= self.config.global_max
                    || per_type >= self.config.max_per_type
                {
                    return Ok(None);
                }
            }

            return self
                .create_session(work_type, parent_id, description)
                .await
                .map(Some);
        }
    }

    async fn create_session(
        &self,
        work_type: &str,
        parent_id: &str,
        description: &str,
    ) -> Result<PooledSession, SessionPoolError> {
        let id = self
            .api
            .create_session(CreateSessionRequest {
                parent_id: parent_id.to_string(),
                title: format!("{}: {description}", self.config.title_prefix),
            })
            .await?;

        let now = Utc::now();
        let session = PooledSession {
            id: id.clone(),
            work_type: work_type.to_string(),
            project_context: self.config.project_context.clone(),
            created_at: now,
            last_used_at: now,
            reuse_count: 0,
            in_use: true,
            health: SessionHealth::Healthy,
        };

        let mut state = self.state.lock();
        state.creation_misses += 1;
        state.sessions.insert(id.clone(), session.clone());
        info!(session_id = %id, work_type, "created session");
        Ok(session)
    }

    /// Return a session to the pool.
    ///
    /// Increments its reuse count; sessions at the reuse cap or in bad
    /// health are destroyed instead of pooled.
    pub async fn release(&self, session_id: &str) {
        let retire = {
            let mut state = self.state.lock();
            let Some(session) = state.sessions.get_mut(session_id) else {
                debug!(session_id, "release for unknown session, ignoring");
                return;
            };
            session.in_use = false;
            session.reuse_count += 1;
            session.last_used_at = Utc::now();
            session.reuse_count >= self.config.max_reuse_count
                || session.health != SessionHealth::Healthy
        };

        if retire {
            self.destroy(session_id).await;
        } else {
            debug!(session_id, "session released to pool");
            self.wake_one_waiter();
        }
    }

    /// Destroy a session unconditionally. Used after task errors; the
    /// session is never returned by a later `acquire`.
    pub async fn invalidate(&self, session_id: &str) {
        debug!(session_id, "invalidating session");
        self.destroy(session_id).await;
    }

    /// Periodic sweep: destroy idle-expired sessions and demote sessions
    /// that fail their health probe. Two failed probes retire a session.
    pub async fn cleanup(&self) -> usize {
        let now = Utc::now();
        let idle_timeout =
            chrono::Duration::from_std(self.config.idle_timeout).unwrap_or(chrono::Duration::MAX);

        let (expired, probes): (Vec<String>, Vec<String>) = {
            let state = self.state.lock();
            let expired = state
                .sessions
                .values()
                .filter(|s| !s.in_use && now - s.last_used_at > idle_timeout)
                .map(|s| s.id.clone())
                .collect();
            let probes = state
                .sessions
                .values()
                .filter(|s| !s.in_use && s.health != SessionHealth::Unhealthy)
                .map(|s| s.id.clone())
                .collect();
            (expired, probes)
        };

        let mut cleaned = 0;
        for id in &expired {
            debug!(session_id = %id, "destroying idle session");
            self.destroy(id).await;
            cleaned += 1;
        }

        for id in probes {
            if expired.contains(&id) {
                continue;
            }
            let healthy = self.api.messages(&id).await.is_ok();
            if healthy {
                continue;
            }

            let retire = {
                let mut state = self.state.lock();
                match state.sessions.get_mut(&id) {
                    Some(session) => {
                        session.health = match session.health {
                            SessionHealth::Healthy => SessionHealth::Degraded,
                            _ => SessionHealth::Unhealthy,
                        };
                        warn!(
                            session_id = %id,
                            health = ?session.health,
                            "session failed health probe"
                        );
                        session.health == SessionHealth::Unhealthy
                    }
                    None => false,
                }
            };
            if retire {
                self.destroy(&id).await;
                cleaned += 1;
            }
        }

        if cleaned > 0 {
            info!(count = cleaned, "session sweep destroyed sessions");
        }
        cleaned
    }

    /// Destroy every session, pooled or in-use, and refuse new acquires.
    pub async fn shutdown(&self) {
        let ids: Vec<String> = {
            let mut state = self.state.lock();
            state.shut_down = true;
            state.waiters.clear();
            state.sessions.keys().cloned().collect()
        };
        for id in ids {
            self.destroy(&id).await;
        }
        info!("session pool shut down");
    }

    pub fn stats(&self) -> SessionPoolStats {
        let state = self.state.lock();
        let in_use = state.sessions.values().filter(|s| s.in_use).count();
        let mut by_type: HashMap<String, usize> = HashMap::new();
        for session in state.sessions.values() {
            *by_type.entry(session.work_type.clone()).or_default() += 1;
        }
        SessionPoolStats {
            total_sessions: state.sessions.len(),
            sessions_in_use: in_use,
            available_sessions: state.sessions.len() - in_use,
            reuse_hits: state.reuse_hits,
            creation_misses: state.creation_misses,
            by_type,
        }
    }

    /// Snapshot of one session, mainly for tests and diagnostics.
    pub fn session(&self, session_id: &str) -> Option<PooledSession> {
        self.state.lock().sessions.get(session_id).cloned()
    }

    async fn destroy(&self, session_id: &str) {
        let existed = self.state.lock().sessions.remove(session_id).is_some();
        if let Err(err) = self.api.delete_session(session_id).await {
            // The remote side may have dropped it already.
            debug!(session_id, "delete_session failed: {err}");
        }
        if existed {
            self.wake_one_waiter();
        }
    }

    fn wake_one_waiter(&self) {
        let mut state = self.state.lock();
        while let Some(tx) = state.waiters.pop_front() {
            if tx.send(()).is_ok() {
                return;
            }
        }
    }
}
