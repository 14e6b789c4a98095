//! Tenant registry: one open engine handle per canonical tenant id.
//!
//! The system tenant is opened eagerly and never closed before shutdown.
//! Every other tenant is opened lazily on first resolve, or eagerly by
//! provision. Opening, provisioning and deprovisioning a given tenant are
//! serialized by a per-tenant lifecycle lock, so there is never more than
//! one handle per tenant and a handle's engine is released exactly once.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use vesper_core::{EngineError, TenantId, Timestamp, VesperError, VesperResult};

use crate::engine::{EngineProvider, ObserverFactory, StorageEngine};

/// One opened storage engine.
pub struct TenantHandle {
    tenant: TenantId,
    path: PathBuf,
    engine: Arc<dyn StorageEngine>,
    opened_at: Timestamp,
    closed: AtomicBool,
}

impl TenantHandle {
    fn new(tenant: TenantId, path: PathBuf, engine: Arc<dyn StorageEngine>) -> Self {
        Self {
            tenant,
            path,
            engine,
            opened_at: Utc::now(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn opened_at(&self) -> Timestamp {
        self.opened_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The engine, unless the handle has been closed.
    pub fn engine(&self) -> VesperResult<Arc<dyn StorageEngine>> {
        if self.is_closed() {
            return Err(EngineError::Closed.into());
        }
        Ok(Arc::clone(&self.engine))
    }

    /// Close the engine. Returns true only for the call that closed it.
    pub fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Err(e) = self.engine.close() {
            warn!(tenant = %self.tenant, error = %e, "Engine close failed");
        }
        true
    }
}

impl std::fmt::Debug for TenantHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantHandle")
            .field("tenant", &self.tenant)
            .field("path", &self.path)
            .field("opened_at", &self.opened_at)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A backing store found on disk.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TenantEntry {
    pub tenant: TenantId,
    pub path: PathBuf,
    pub active: bool,
}

/// Owns every open tenant handle.
pub struct TenantRegistry {
    provider: Arc<dyn EngineProvider>,
    observers: Vec<Arc<dyn ObserverFactory>>,
    system: Arc<TenantHandle>,
    handles: DashMap<TenantId, Arc<TenantHandle>>,
    lifecycle: DashMap<TenantId, Arc<Mutex<()>>>,
    shut_down: AtomicBool,
}

impl TenantRegistry {
    /// Open the system tenant and build the registry.
    ///
    /// Every engine the registry opens, the system tenant's included, gets one
    /// commit observer from each factory.
    pub fn open(
        provider: Arc<dyn EngineProvider>,
        observers: Vec<Arc<dyn ObserverFactory>>,
    ) -> VesperResult<Self> {
        let system_id = TenantId::system();
        let engine = provider.create(&system_id)?;
        for factory in &observers {
            engine.observe(factory.observer_for(&system_id));
        }
        let system = Arc::new(TenantHandle::new(
            system_id.clone(),
            provider.location(&system_id),
            engine,
        ));
        info!(path = %system.path().display(), "System tenant opened");

        Ok(Self {
            provider,
            observers,
            system,
            handles: DashMap::new(),
            lifecycle: DashMap::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn system(&self) -> Arc<TenantHandle> {
        Arc::clone(&self.system)
    }

    fn ensure_running(&self) -> VesperResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            Err(EngineError::Closed.into())
        } else {
            Ok(())
        }
    }

    fn lifecycle_lock(&self, tenant: &TenantId) -> Arc<Mutex<()>> {
        Arc::clone(
            self.lifecycle
                .entry(tenant.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    fn attach_observers(&self, tenant: &TenantId, engine: &Arc<dyn StorageEngine>) {
        for factory in &self.observers {
            engine.observe(factory.observer_for(tenant));
        }
    }

    /// Find the open handle for a tenant, opening its store lazily.
    ///
    /// The system tenant always resolves.
    pub fn resolve(&self, tenant: &TenantId) -> VesperResult<Arc<TenantHandle>> {
        if tenant.is_system() {
            return Ok(self.system());
        }
        self.ensure_running()?;
        if let Some(handle) = self.handles.get(tenant) {
            return Ok(Arc::clone(handle.value()));
        }
        tenant.validate()?;

        let result = {
            let lock = self.lifecycle_lock(tenant);
            let _guard = lock.lock().map_err(|_| EngineError::LockPoisoned)?;
            self.open_lazily(tenant)
        };
        if result.is_err() {
            self.prune_lifecycle(tenant);
        }
        result
    }

    fn prune_lifecycle(&self, tenant: &TenantId) {
        self.lifecycle
            .remove_if(tenant, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn open_lazily(&self, tenant: &TenantId) -> VesperResult<Arc<TenantHandle>> {
        if let Some(handle) = self.handles.get(tenant) {
            return Ok(Arc::clone(handle.value()));
        }
        if !self.provider.exists(tenant) {
            return Err(VesperError::NotProvisioned {
                tenant: tenant.to_string(),
            });
        }

        let engine = self.provider.open(tenant)?;
        self.attach_observers(tenant, &engine);
        let handle = Arc::new(TenantHandle::new(
            tenant.clone(),
            self.provider.location(tenant),
            engine,
        ));
        self.handles.insert(tenant.clone(), Arc::clone(&handle));
        info!(tenant = %tenant, path = %handle.path().display(), "Tenant opened lazily");
        Ok(handle)
    }

    /// Create, open and register a tenant's store.
    pub fn provision(&self, tenant: &TenantId) -> VesperResult<Arc<TenantHandle>> {
        if tenant.is_system() {
            return Err(VesperError::invalid_argument(
                "tenant_id",
                "the default tenant cannot be provisioned",
            ));
        }
        self.ensure_running()?;
        tenant.validate()?;

        let lock = self.lifecycle_lock(tenant);
        let _guard = lock.lock().map_err(|_| EngineError::LockPoisoned)?;

        if self.handles.contains_key(tenant) {
            return Err(VesperError::AlreadyActive {
                tenant: tenant.to_string(),
            });
        }

        let engine = self.provider.create(tenant)?;
        self.attach_observers(tenant, &engine);
        let handle = Arc::new(TenantHandle::new(
            tenant.clone(),
            self.provider.location(tenant),
            engine,
        ));

        match self.handles.entry(tenant.clone()) {
            Entry::Occupied(_) => {
                handle.close();
                Err(VesperError::AlreadyActive {
                    tenant: tenant.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&handle));
                info!(tenant = %tenant, path = %handle.path().display(), "Tenant provisioned");
                Ok(handle)
            }
        }
    }

    /// Close a tenant's handle and optionally erase its store.
    pub fn deprovision(&self, tenant: &TenantId, delete_files: bool) -> VesperResult<()> {
        if tenant.is_system() {
            return Err(VesperError::invalid_argument(
                "tenant_id",
                "the default tenant cannot be deprovisioned",
            ));
        }
        self.ensure_running()?;

        let result = {
            let lock = self.lifecycle_lock(tenant);
            let _guard = lock.lock().map_err(|_| EngineError::LockPoisoned)?;
            self.close_and_erase(tenant, delete_files)
        };
        self.prune_lifecycle(tenant);
        result
    }

    fn close_and_erase(&self, tenant: &TenantId, delete_files: bool) -> VesperResult<()> {
        let (_, handle) = self
            .handles
            .remove(tenant)
            .ok_or_else(|| VesperError::NotActive {
                tenant: tenant.to_string(),
            })?;
        handle.close();

        if delete_files {
            self.provider.delete_files(tenant)?;
        }
        info!(tenant = %tenant, delete_files, "Tenant deprovisioned");
        Ok(())
    }

    /// Backing stores found by the provider, flagged active when open.
    pub fn list_discovered(&self) -> VesperResult<Vec<TenantEntry>> {
        let mut tenants = self.provider.discover()?;
        for handle in self.handles.iter() {
            if !tenants.contains(handle.key()) {
                tenants.push(handle.key().clone());
            }
        }
        tenants.sort();
        Ok(tenants
            .into_iter()
            .map(|tenant| TenantEntry {
                active: self.handles.contains_key(&tenant),
                path: self.provider.location(&tenant),
                tenant,
            })
            .collect())
    }

    /// Currently open tenants, excluding the system tenant.
    pub fn active(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.handles.iter().map(|h| h.key().clone()).collect();
        tenants.sort();
        tenants
    }

    pub fn is_active(&self, tenant: &TenantId) -> bool {
        tenant.is_system() || self.handles.contains_key(tenant)
    }

    /// Close every handle, the system tenant last. Returns how many closed.
    pub fn shutdown(&self) -> usize {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let tenants: Vec<TenantId> = self.handles.iter().map(|h| h.key().clone()).collect();
        let mut closed = 0;
        for tenant in tenants {
            if let Some((_, handle)) = self.handles.remove(&tenant) {
                if handle.close() {
                    closed += 1;
                }
            }
        }
        if self.system.close() {
            closed += 1;
        }
        debug!(closed, "Tenant registry shut down");
        closed
    }
}

impl Drop for TenantRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{LmdbEngineProvider, MemoryEngineProvider};
    use std::thread;
    use tempfile::TempDir;
    use vesper_core::Document;

    fn memory_registry() -> TenantRegistry {
        TenantRegistry::open(Arc::new(MemoryEngineProvider::new()), Vec::new()).unwrap()
    }

    #[test]
    fn test_system_tenant_always_resolves() {
        let registry = memory_registry();
        let a = registry.resolve(&TenantId::new("")).unwrap();
        let b = registry.resolve(&TenantId::new("  ")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.tenant().is_system());
    }

    #[test]
    fn test_unknown_tenant_is_not_provisioned() {
        let registry = memory_registry();
        let err = registry.resolve(&TenantId::new("acme")).unwrap_err();
        assert!(matches!(err, VesperError::NotProvisioned { .. }));
    }

    #[test]
    fn test_provision_then_resolve_normalizes() {
        let registry = memory_registry();
        registry.provision(&TenantId::new("Acme")).unwrap();
        let handle = registry.resolve(&TenantId::new("  ACME ")).unwrap();
        assert_eq!(handle.tenant().as_str(), "acme");
    }

    #[test]
    fn test_provision_conflicts() {
        let registry = memory_registry();
        let acme = TenantId::new("acme");
        registry.provision(&acme).unwrap();
        assert!(matches!(
            registry.provision(&acme),
            Err(VesperError::AlreadyActive { .. })
        ));
        assert!(matches!(
            registry.provision(&TenantId::system()),
            Err(VesperError::InvalidArgument { .. })
        ));
        assert!(matches!(
            registry.deprovision(&TenantId::system(), false),
            Err(VesperError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_deprovision_closes_handle_exactly_once() {
        let registry = memory_registry();
        let acme = TenantId::new("acme");
        let handle = registry.provision(&acme).unwrap();

        registry.deprovision(&acme, false).unwrap();
        assert!(handle.is_closed());
        assert!(handle.engine().is_err());
        assert!(!handle.close());
        assert!(matches!(
            registry.deprovision(&acme, false),
            Err(VesperError::NotActive { .. })
        ));
    }

    #[test]
    fn test_lifecycle_locks_are_pruned() {
        let registry = memory_registry();
        let acme = TenantId::new("acme");
        assert!(registry.resolve(&TenantId::new("ghost")).is_err());
        registry.provision(&acme).unwrap();
        registry.deprovision(&acme, true).unwrap();
        assert!(registry.deprovision(&acme, true).is_err());
        assert_eq!(registry.lifecycle.len(), 0);
    }

    #[test]
    fn test_lazy_reopen_after_deprovision_without_delete() {
        let registry = memory_registry();
        let acme = TenantId::new("acme");
        let handle = registry.provision(&acme).unwrap();
        handle
            .engine()
            .unwrap()
            .insert("articles", Document::new("d1"))
            .unwrap();
        registry.deprovision(&acme, false).unwrap();

        let reopened = registry.resolve(&acme).unwrap();
        assert!(!Arc::ptr_eq(&handle, &reopened));
        assert!(reopened
            .engine()
            .unwrap()
            .find_by_id("articles", "d1")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_concurrent_provision_has_one_winner() {
        let registry = Arc::new(memory_registry());
        let acme = TenantId::new("acme");
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let acme = acme.clone();
                thread::spawn(move || registry.provision(&acme).is_ok())
            })
            .collect();
        let winners = threads
            .into_iter()
            .map(|t| t.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.active(), vec![acme]);
    }

    #[test]
    fn test_lmdb_round_trip_leaves_nothing_behind() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(LmdbEngineProvider::new(dir.path(), 10 * 1024 * 1024));
        let registry = TenantRegistry::open(provider.clone(), Vec::new()).unwrap();
        let acme = TenantId::new("acme");

        registry.provision(&acme).unwrap();
        assert!(provider.location(&acme).exists());
        registry.deprovision(&acme, true).unwrap();

        assert!(!provider.location(&acme).exists());
        assert!(registry.active().is_empty());
        assert!(matches!(
            registry.resolve(&acme),
            Err(VesperError::NotProvisioned { .. })
        ));
    }

    #[test]
    fn test_list_discovered_flags_active() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(LmdbEngineProvider::new(dir.path(), 10 * 1024 * 1024));
        let registry = TenantRegistry::open(provider, Vec::new()).unwrap();
        registry.provision(&TenantId::new("acme")).unwrap();
        registry.provision(&TenantId::new("globex")).unwrap();
        registry.deprovision(&TenantId::new("globex"), false).unwrap();

        let entries = registry.list_discovered().unwrap();
        let flags: Vec<(&str, bool)> = entries
            .iter()
            .map(|e| (e.tenant.as_str(), e.active))
            .collect();
        assert_eq!(flags, vec![("acme", true), ("globex", false)]);
    }

    #[test]
    fn test_shutdown_closes_everything_once() {
        let registry = memory_registry();
        let handle = registry.provision(&TenantId::new("acme")).unwrap();
        let system = registry.system();

        assert_eq!(registry.shutdown(), 2);
        assert!(handle.is_closed());
        assert!(system.is_closed());
        assert_eq!(registry.shutdown(), 0);
        assert!(registry.resolve(&TenantId::new("acme")).is_err());
    }
}
