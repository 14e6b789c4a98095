//! Transaction Coordinator
//!
//! Grants at most one write session per tenant. Each tenant has a binary
//! semaphore; a session owns its permit from `begin` until commit, rollback
//! or reclamation, and every one of those paths releases it exactly once.
//!
//! Sessions are addressed by an unguessable token and bound to the
//! principal that opened them. Collections written through a session are
//! recorded in its dirty set and invalidated in the result cache before
//! `commit` returns.
//!
//! Engine commits run on the blocking pool. Staged reads and writes stay on
//! the async thread: they only touch the session overlay and memory-mapped
//! reads.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use vesper_core::{
    Document, EngineError, SessionToken, TenantId, Timestamp, TransactionConfig, VesperError,
    VesperResult,
};
use vesper_storage::{CacheInvalidator, EngineTransaction, TenantRegistry};

use crate::constants::RECLAIMER_PRINCIPAL;

// ============================================================================
// SESSION STATE
// ============================================================================

struct Session {
    owner: String,
    tenant: TenantId,
    created_at: Timestamp,
    last_activity: Instant,
    dirty: BTreeSet<String>,
    txn: Option<Box<dyn EngineTransaction>>,
    permit: Option<OwnedSemaphorePermit>,
    reclaimed: bool,
}

impl Session {
    fn is_idle_past(&self, timeout: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_activity) > timeout
    }

    fn is_open(&self) -> bool {
        self.txn.is_some()
    }

    /// Hand back the engine transaction and the tenant permit.
    fn close(&mut self) -> (Option<Box<dyn EngineTransaction>>, Option<OwnedSemaphorePermit>) {
        (self.txn.take(), self.permit.take())
    }
}

/// Diagnostic view of an open session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub token: SessionToken,
    pub owner: String,
    pub tenant: TenantId,
    pub created_at: Timestamp,
    pub idle: Duration,
    pub dirty_collections: Vec<String>,
    pub pending_writes: usize,
}

// ============================================================================
// METRICS
// ============================================================================

#[derive(Debug, Default)]
pub struct CoordinatorMetrics {
    pub begun: AtomicU64,
    pub committed: AtomicU64,
    pub rolled_back: AtomicU64,
    /// Sessions rolled back by the system (idle timeout or tenant abort)
    pub reclaimed: AtomicU64,
    /// Engine commits or rollbacks that reported an error
    pub engine_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorSnapshot {
    pub begun: u64,
    pub committed: u64,
    pub rolled_back: u64,
    pub reclaimed: u64,
    pub engine_failures: u64,
}

impl CoordinatorMetrics {
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        CoordinatorSnapshot {
            begun: self.begun.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            rolled_back: self.rolled_back.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
            engine_failures: self.engine_failures.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// COORDINATOR
// ============================================================================

/// A session plus its tenant, readable without taking the session lock.
struct SessionEntry {
    tenant: TenantId,
    session: Arc<Mutex<Session>>,
}

struct CoordinatorInner {
    registry: Arc<TenantRegistry>,
    invalidator: Arc<CacheInvalidator>,
    config: TransactionConfig,
    locks: DashMap<TenantId, Arc<Semaphore>>,
    sessions: DashMap<SessionToken, SessionEntry>,
    metrics: CoordinatorMetrics,
}

/// Per-tenant single-writer transaction sessions.
#[derive(Clone)]
pub struct TransactionCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl TransactionCoordinator {
    pub fn new(
        registry: Arc<TenantRegistry>,
        invalidator: Arc<CacheInvalidator>,
        config: TransactionConfig,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                registry,
                invalidator,
                config,
                locks: DashMap::new(),
                sessions: DashMap::new(),
                metrics: CoordinatorMetrics::default(),
            }),
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.inner.config.idle_timeout
    }

    pub fn metrics(&self) -> CoordinatorSnapshot {
        self.inner.metrics.snapshot()
    }

    fn tenant_lock(&self, tenant: &TenantId) -> Arc<Semaphore> {
        if let Some(lock) = self.inner.locks.get(tenant) {
            return Arc::clone(lock.value());
        }
        Arc::clone(
            self.inner
                .locks
                .entry(tenant.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .value(),
        )
    }

    /// Drop the tenant's lock entry once nothing holds or awaits it.
    ///
    /// Returns whether the entry was removed.
    pub fn forget_tenant(&self, tenant: &TenantId) -> bool {
        self.inner
            .locks
            .remove_if(tenant, |_, lock| Arc::strong_count(lock) == 1)
            .is_some()
    }

    /// Number of tenants with a lock entry.
    pub fn tracked_tenants(&self) -> usize {
        self.inner.locks.len()
    }

    /// Whether a session currently holds the tenant's write lock.
    pub fn is_locked(&self, tenant: &TenantId) -> bool {
        self.inner
            .locks
            .get(tenant)
            .map(|lock| lock.available_permits() == 0)
            .unwrap_or(false)
    }

    /// Open a write session, waiting for the tenant's lock.
    ///
    /// Cancel-safe: dropping the future while it waits acquires nothing.
    pub async fn begin(&self, owner: &str, tenant: &TenantId) -> VesperResult<SessionToken> {
        let handle = self.inner.registry.resolve(tenant)?;
        let lock = self.tenant_lock(tenant);
        let permit = lock
            .acquire_owned()
            .await
            .map_err(|_| EngineError::backend("tenant lock closed"))?;

        // The permit is released on every early return below.
        let txn = match handle.engine().and_then(|engine| Ok(engine.begin()?)) {
            Ok(txn) => txn,
            Err(e) => {
                tracing::warn!(tenant = %tenant, owner, error = %e, "Engine refused to begin transaction");
                return Err(e);
            }
        };

        let token = SessionToken::generate();
        let session = Session {
            owner: owner.to_string(),
            tenant: tenant.clone(),
            created_at: Utc::now(),
            last_activity: Instant::now(),
            dirty: BTreeSet::new(),
            txn: Some(txn),
            permit: Some(permit),
            reclaimed: false,
        };
        self.inner.sessions.insert(
            token.clone(),
            SessionEntry {
                tenant: tenant.clone(),
                session: Arc::new(Mutex::new(session)),
            },
        );
        self.inner.metrics.begun.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(tenant = %tenant, owner, token = %token, "Transaction begun");
        Ok(token)
    }

    fn session(&self, token: &SessionToken) -> VesperResult<Arc<Mutex<Session>>> {
        self.inner
            .sessions
            .get(token)
            .map(|entry| Arc::clone(&entry.session))
            .ok_or(VesperError::SessionNotFound)
    }

    fn check_owner(session: &Session, caller: &str) -> VesperResult<()> {
        if session.owner != caller {
            return Err(VesperError::SessionForbidden);
        }
        Ok(())
    }

    fn closed_error(session: &Session) -> VesperError {
        if session.reclaimed {
            VesperError::SessionExpired
        } else {
            VesperError::SessionNotFound
        }
    }

    fn spawn_reclaim(&self, token: SessionToken) {
        let coordinator = self.clone();
        tokio::spawn(async move {
            coordinator.reclaim_session(&token, "idle timeout").await;
        });
    }

    /// Commit the session's writes and release the tenant's lock.
    ///
    /// The lock is released whatever the engine reports. On success every
    /// dirty collection is invalidated before this returns.
    pub async fn commit(&self, token: &SessionToken, caller: &str) -> VesperResult<()> {
        let session = self.session(token)?;
        let mut session = session.lock().await;
        Self::check_owner(&session, caller)?;
        if !session.is_open() {
            return Err(Self::closed_error(&session));
        }
        if session.is_idle_past(self.idle_timeout(), Instant::now()) {
            drop(session);
            self.spawn_reclaim(token.clone());
            return Err(VesperError::SessionExpired);
        }

        self.inner.sessions.remove(token);
        let (txn, permit) = session.close();
        // The permit travels with the engine commit, so the tenant stays
        // locked until the write has finished even if this future is dropped.
        let (result, permit) = match txn {
            Some(txn) => tokio::task::spawn_blocking(move || (txn.commit(), permit))
                .await
                .map_err(|e| EngineError::backend(format!("commit task failed: {}", e)))?,
            None => (Ok(Vec::new()), permit),
        };

        match result {
            Ok(records) => {
                for collection in &session.dirty {
                    self.inner.invalidator.invalidate(&session.tenant, collection);
                }
                drop(permit);
                self.inner.metrics.committed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    tenant = %session.tenant,
                    token = %token,
                    records = records.len(),
                    collections = session.dirty.len(),
                    "Transaction committed"
                );
                Ok(())
            }
            Err(e) => {
                drop(permit);
                self.inner
                    .metrics
                    .engine_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::error!(tenant = %session.tenant, token = %token, error = %e, "Commit failed");
                Err(e.into())
            }
        }
    }

    /// Discard the session's writes and release the tenant's lock.
    pub async fn rollback(&self, token: &SessionToken, caller: &str) -> VesperResult<()> {
        let session = self.session(token)?;
        let mut session = session.lock().await;
        Self::check_owner(&session, caller)?;

        self.inner.sessions.remove(token);
        let (txn, permit) = session.close();
        let result = match txn {
            Some(txn) => txn.rollback(),
            None => Ok(()),
        };
        drop(permit);

        match result {
            Ok(()) => {
                self.inner.metrics.rolled_back.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(tenant = %session.tenant, token = %token, "Transaction rolled back");
                Ok(())
            }
            Err(e) => {
                self.inner
                    .metrics
                    .engine_failures
                    .fetch_add(1, Ordering::Relaxed);
                tracing::error!(tenant = %session.tenant, token = %token, error = %e, "Rollback failed");
                Err(e.into())
            }
        }
    }

    /// Refresh a session's activity timestamp.
    ///
    /// A session already past its idle timeout is reclaimed in the
    /// background and reported as expired.
    pub async fn touch(&self, token: &SessionToken, caller: &str) -> VesperResult<SessionInfo> {
        let session = self.session(token)?;
        let mut guard = session.lock().await;
        Self::check_owner(&guard, caller)?;
        if !guard.is_open() {
            return Err(Self::closed_error(&guard));
        }
        let now = Instant::now();
        if guard.is_idle_past(self.idle_timeout(), now) {
            drop(guard);
            self.spawn_reclaim(token.clone());
            return Err(VesperError::SessionExpired);
        }
        guard.last_activity = now;
        Ok(Self::info(token, &guard, now))
    }

    fn info(token: &SessionToken, session: &Session, now: Instant) -> SessionInfo {
        SessionInfo {
            token: token.clone(),
            owner: session.owner.clone(),
            tenant: session.tenant.clone(),
            created_at: session.created_at,
            idle: now.saturating_duration_since(session.last_activity),
            dirty_collections: session.dirty.iter().cloned().collect(),
            pending_writes: session.txn.as_ref().map(|t| t.pending()).unwrap_or(0),
        }
    }

    /// Roll back one session as the system. Returns whether it was open.
    async fn reclaim_session(&self, token: &SessionToken, reason: &str) -> bool {
        let Ok(session) = self.session(token) else {
            return false;
        };
        let mut session = session.lock().await;
        self.reclaim_locked(token, &mut session, reason)
    }

    fn reclaim_locked(&self, token: &SessionToken, session: &mut Session, reason: &str) -> bool {
        self.inner.sessions.remove(token);
        let (txn, permit) = session.close();
        let Some(txn) = txn else {
            return false;
        };
        session.reclaimed = true;
        if let Err(e) = txn.rollback() {
            self.inner
                .metrics
                .engine_failures
                .fetch_add(1, Ordering::Relaxed);
            tracing::error!(tenant = %session.tenant, token = %token, error = %e, "Reclaim rollback failed");
        }
        drop(permit);
        self.inner.metrics.reclaimed.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            tenant = %session.tenant,
            owner = %session.owner,
            token = %token,
            by = RECLAIMER_PRINCIPAL,
            reason,
            "Transaction reclaimed"
        );
        true
    }

    fn sessions_where(
        &self,
        keep: impl Fn(&SessionEntry) -> bool,
    ) -> Vec<(SessionToken, Arc<Mutex<Session>>)> {
        self.inner
            .sessions
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| (e.key().clone(), Arc::clone(&e.value().session)))
            .collect()
    }

    /// Roll back every session idle past the timeout. Returns how many.
    ///
    /// Sessions busy with an operation are active by definition and skipped.
    pub async fn reclaim_expired(&self) -> usize {
        let timeout = self.idle_timeout();
        let now = Instant::now();
        let candidates = self.sessions_where(|_| true);

        let mut reclaimed = 0;
        for (token, session) in candidates {
            let Ok(mut guard) = session.try_lock() else {
                continue;
            };
            if guard.is_idle_past(timeout, now) && self.reclaim_locked(&token, &mut guard, "idle timeout") {
                reclaimed += 1;
            }
        }
        reclaimed
    }

    /// Roll back every session of a tenant, waiting for in-flight calls.
    pub async fn abort_tenant(&self, tenant: &TenantId) -> usize {
        let candidates = self.sessions_where(|entry| &entry.tenant == tenant);

        let mut aborted = 0;
        for (token, session) in candidates {
            let mut guard = session.lock().await;
            if self.reclaim_locked(&token, &mut guard, "tenant aborted") {
                aborted += 1;
            }
        }
        aborted
    }

    /// Snapshot of every open session.
    pub async fn active_sessions(&self) -> Vec<SessionInfo> {
        let candidates = self.sessions_where(|_| true);
        let now = Instant::now();
        let mut infos = Vec::with_capacity(candidates.len());
        for (token, session) in candidates {
            let guard = session.lock().await;
            if guard.is_open() {
                infos.push(Self::info(&token, &guard, now));
            }
        }
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    /// Run `op` against the session's engine transaction.
    ///
    /// Validates ownership and expiry and refreshes activity. When `dirty`
    /// names a collection it joins the dirty set once `op` succeeds.
    async fn with_session<T>(
        &self,
        token: &SessionToken,
        caller: &str,
        dirty: Option<&str>,
        op: impl FnOnce(&mut Box<dyn EngineTransaction>) -> VesperResult<T>,
    ) -> VesperResult<T> {
        let session = self.session(token)?;
        let mut guard = session.lock().await;
        Self::check_owner(&guard, caller)?;
        if !guard.is_open() {
            return Err(Self::closed_error(&guard));
        }
        let now = Instant::now();
        if guard.is_idle_past(self.idle_timeout(), now) {
            drop(guard);
            self.spawn_reclaim(token.clone());
            return Err(VesperError::SessionExpired);
        }
        let value = match guard.txn.as_mut() {
            Some(txn) => op(txn)?,
            None => return Err(VesperError::SessionNotFound),
        };
        guard.last_activity = now;
        if let Some(collection) = dirty {
            guard.dirty.insert(collection.to_string());
        }
        Ok(value)
    }

    /// The tenant a session writes to.
    pub async fn session_tenant(&self, token: &SessionToken, caller: &str) -> VesperResult<TenantId> {
        let session = self.session(token)?;
        let guard = session.lock().await;
        Self::check_owner(&guard, caller)?;
        if !guard.is_open() {
            return Err(Self::closed_error(&guard));
        }
        Ok(guard.tenant.clone())
    }

    pub async fn insert(
        &self,
        token: &SessionToken,
        caller: &str,
        collection: &str,
        doc: Document,
    ) -> VesperResult<Document> {
        self.with_session(token, caller, Some(collection), |txn| {
            Ok(txn.insert(collection, doc)?)
        })
        .await
    }

    pub async fn update(
        &self,
        token: &SessionToken,
        caller: &str,
        collection: &str,
        doc: Document,
    ) -> VesperResult<()> {
        self.with_session(token, caller, Some(collection), |txn| {
            Ok(txn.update(collection, doc)?)
        })
        .await
    }

    pub async fn delete(
        &self,
        token: &SessionToken,
        caller: &str,
        collection: &str,
        id: &str,
    ) -> VesperResult<()> {
        self.with_session(token, caller, Some(collection), |txn| {
            Ok(txn.delete(collection, id)?)
        })
        .await
    }

    /// Read through the session's staged writes.
    pub async fn find(
        &self,
        token: &SessionToken,
        caller: &str,
        collection: &str,
        id: &str,
    ) -> VesperResult<Option<Document>> {
        self.with_session(token, caller, None, |txn| Ok(txn.find_by_id(collection, id)?))
            .await
    }
}
