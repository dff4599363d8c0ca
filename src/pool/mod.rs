//! Pool manager: owns the set of backend connections keyed by
//! `(database, user)`, enforces the global `max_client_conn` cap, and
//! performs idle eviction. All free-list / pin-map / counter mutations go
//! through one [`tokio::sync::Mutex`]-guarded [`PoolInner`].

mod backend;
mod stream;

pub use backend::BackendConnection;
pub use stream::BackendStream;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use quanta::Instant;
use tokio::sync::Mutex;

use crate::config::{Config, PoolMode};
use crate::errors::PoolError;

/// Identifies one client session to the pool, for session-mode pinning.
pub type SessionId = u64;

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_session_id() -> SessionId {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

/// The `(database, user)` pair used to partition backend connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub database: String,
    pub user: String,
}

impl PoolKey {
    pub fn new(database: impl Into<String>, user: impl Into<String>) -> Self {
        PoolKey {
            database: database.into(),
            user: user.into(),
        }
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.user, self.database)
    }
}

pub enum AcquireOutcome {
    Acquired(BackendConnection),
    Exhausted,
}

struct PoolInner {
    free: HashMap<PoolKey, VecDeque<BackendConnection>>,
    total_connections: u32,
    /// `(session_id, key) -> backend id`, used only in session mode so a
    /// session that reacquires before its backend is claimed by anyone
    /// else gets the same backend back. Holds only an id, never the
    /// connection itself: ownership of the connection always lives in
    /// exactly one of `free` or a session's `current_backend`.
    session_pins: HashMap<(SessionId, PoolKey), u64>,
}

pub struct Pool {
    inner: Mutex<PoolInner>,
    config: Arc<Config>,
    next_backend_id: AtomicU64,
}

impl Pool {
    pub fn new(config: Arc<Config>) -> Self {
        Pool {
            inner: Mutex::new(PoolInner {
                free: HashMap::new(),
                total_connections: 0,
                session_pins: HashMap::new(),
            }),
            config,
            next_backend_id: AtomicU64::new(1),
        }
    }

    pub async fn total_connections(&self) -> u32 {
        self.inner.lock().await.total_connections
    }

    #[cfg(test)]
    pub async fn free_count(&self, key: &PoolKey) -> usize {
        self.inner
            .lock()
            .await
            .free
            .get(key)
            .map(VecDeque::len)
            .unwrap_or(0)
    }

    pub async fn acquire(
        &self,
        session_id: SessionId,
        key: &PoolKey,
        mode: PoolMode,
    ) -> Result<AcquireOutcome, PoolError> {
        let pool_config = self
            .config
            .pools
            .get(&key.database)
            .ok_or_else(|| PoolError::UnknownKey {
                database: key.database.clone(),
                user: key.user.clone(),
            })?;

        {
            let mut guard = self.inner.lock().await;

            if mode == PoolMode::Session {
                if let Some(&pinned_id) = guard.session_pins.get(&(session_id, key.clone())) {
                    if let Some(pos) = guard
                        .free
                        .get(key)
                        .and_then(|q| q.iter().position(|b| b.id == pinned_id))
                    {
                        let mut backend = guard.free.get_mut(key).unwrap().remove(pos).unwrap();
                        backend.mark_in_use();
                        return Ok(AcquireOutcome::Acquired(backend));
                    }
                }
            }

            if let Some(mut backend) = guard.free.get_mut(key).and_then(VecDeque::pop_front) {
                backend.mark_in_use();
                if mode == PoolMode::Session {
                    guard
                        .session_pins
                        .insert((session_id, key.clone()), backend.id);
                }
                return Ok(AcquireOutcome::Acquired(backend));
            }

            if guard.total_connections >= self.config.general.max_client_conn {
                return Ok(AcquireOutcome::Exhausted);
            }
            guard.total_connections += 1;
        }

        // Connection creation (TCP connect, TLS, startup auth) happens
        // outside the lock: we already reserved our slot in
        // `total_connections` above, so the cap still holds.
        let id = self.next_backend_id.fetch_add(1, Ordering::Relaxed);
        match backend::connect(id, key, pool_config).await {
            Ok(mut conn) => {
                conn.mark_in_use();
                if mode == PoolMode::Session {
                    let mut guard = self.inner.lock().await;
                    guard.session_pins.insert((session_id, key.clone()), conn.id);
                }
                Ok(AcquireOutcome::Acquired(conn))
            }
            Err(err) => {
                let mut guard = self.inner.lock().await;
                guard.total_connections -= 1;
                Err(err)
            }
        }
    }

    pub async fn release(&self, mut backend: BackendConnection, session_id: Option<SessionId>) {
        backend.mark_idle();
        let key = backend.key.clone();
        let mut guard = self.inner.lock().await;
        if let Some(session_id) = session_id {
            guard.session_pins.remove(&(session_id, key.clone()));
        }
        guard.free.entry(key).or_default().push_back(backend);
    }

    /// Drop a backend that faulted mid-session instead of returning it to
    /// the free list; decrements the global counter since the connection
    /// is gone for good.
    pub async fn drop_backend(&self, backend: BackendConnection, session_id: Option<SessionId>) {
        let mut guard = self.inner.lock().await;
        if let Some(session_id) = session_id {
            guard.session_pins.remove(&(session_id, backend.key.clone()));
        }
        guard.total_connections = guard.total_connections.saturating_sub(1);
        drop(backend);
    }

    pub async fn evict_idle(&self) -> u32 {
        let mut guard = self.inner.lock().await;
        let mut evicted = 0u32;
        let now = Instant::recent();
        for (key, queue) in guard.free.iter_mut() {
            let Some(pool_config) = self.config.pools.get(&key.database) else {
                continue;
            };
            let timeout = pool_config.server_idle_timeout_ms;
            if timeout == 0 {
                continue;
            }
            let before = queue.len();
            queue.retain(|backend| now.duration_since(backend.last_used_at).as_millis() as u64 <= timeout);
            evicted += (before - queue.len()) as u32;
        }
        guard.total_connections = guard.total_connections.saturating_sub(evicted);
        evicted
    }

    pub async fn shutdown(&self) {
        let mut guard = self.inner.lock().await;
        guard.free.clear();
        guard.session_pins.clear();
        guard.total_connections = 0;
    }
}
