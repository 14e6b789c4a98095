//! Integration tests for tenant lifecycle on the LMDB backend.

use std::sync::Arc;

use tempfile::TempDir;
use vesper_core::{StorageBackend, VesperConfig};
use vesper_server::{DatabaseService, ErrorCode};
use vesper_storage::LmdbEngineProvider;
use vesper_test_utils::{article, FixedEmbeddingProvider, TenantId, VesperError};

fn lmdb_service(dir: &TempDir) -> DatabaseService {
    let mut config = VesperConfig::development();
    config.storage.backend = StorageBackend::Lmdb;
    config.storage.data_dir = dir.path().to_path_buf();
    let engines = Arc::new(LmdbEngineProvider::new(
        dir.path(),
        config.storage.map_size_bytes(),
    ));
    DatabaseService::open(config, engines, Arc::new(FixedEmbeddingProvider::default())).unwrap()
}

#[test]
fn test_provision_then_deprovision_leaves_nothing() {
    let dir = TempDir::new().unwrap();
    let service = lmdb_service(&dir);
    let acme = TenantId::new("acme");

    service.provision_tenant("Acme ").unwrap();
    let path = service.registry().resolve(&acme).unwrap().path().clone();
    assert!(path.exists());

    tokio::runtime::Runtime::new()
        .unwrap()
        .block_on(service.deprovision_tenant("acme", true))
        .unwrap();
    assert!(!path.exists());
    assert!(!service.registry().is_active(&acme));
    assert!(matches!(
        service.registry().resolve(&acme),
        Err(VesperError::NotProvisioned { .. })
    ));
    assert!(service
        .list_tenants()
        .unwrap()
        .iter()
        .all(|entry| entry.tenant != acme));
}

#[test]
fn test_provision_conflicts_are_reported() {
    let dir = TempDir::new().unwrap();
    let service = lmdb_service(&dir);

    service.provision_tenant("acme").unwrap();
    let err = service.provision_tenant("ACME").unwrap_err();
    assert_eq!(err.code, ErrorCode::TenantConflict);

    let err = service.provision_tenant("").unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidInput);

    let err = service.provision_tenant("../escape").unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidInput);
}

#[tokio::test]
async fn test_data_survives_reopen_and_backup() {
    let dir = TempDir::new().unwrap();
    let backup = TempDir::new().unwrap();
    {
        let service = lmdb_service(&dir);
        service.provision_tenant("acme").unwrap();
        service
            .insert("acme", "articles", article("d1", "kept"), None)
            .await
            .unwrap();
        service
            .backup_tenant("acme", &backup.path().join("acme.mdb"))
            .unwrap();
        service.shutdown().await;
    }

    let service = lmdb_service(&dir);
    let entries = service.list_tenants().unwrap();
    let acme = entries
        .iter()
        .find(|e| e.tenant == TenantId::new("acme"))
        .expect("tenant discovered on disk");
    assert!(!acme.active);

    // First access opens the store lazily.
    let doc = service.find("acme", "articles", "d1", None).await.unwrap().unwrap();
    assert_eq!(doc.get("body"), Some(&serde_json::json!("kept")));
    assert!(service.registry().is_active(&TenantId::new("acme")));
    assert!(backup.path().join("acme.mdb").is_file());
}

#[tokio::test]
async fn test_deprovision_without_delete_keeps_data() {
    let dir = TempDir::new().unwrap();
    let service = lmdb_service(&dir);
    service.provision_tenant("acme").unwrap();
    service
        .insert("acme", "articles", article("d1", "kept"), None)
        .await
        .unwrap();

    service.deprovision_tenant("acme", false).await.unwrap();
    let err = service.deprovision_tenant("acme", false).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::TenantConflict);

    let doc = service.find("acme", "articles", "d1", None).await.unwrap();
    assert!(doc.is_some());
}

#[tokio::test]
async fn test_shutdown_closes_every_tenant() {
    let dir = TempDir::new().unwrap();
    let service = lmdb_service(&dir);
    service.provision_tenant("acme").unwrap();
    service.provision_tenant("globex").unwrap();
    let token = service.begin_transaction("alice", "acme").await.unwrap();

    service.shutdown().await;
    assert!(service.active_sessions().await.is_empty());
    assert!(service.registry().active().is_empty());
    let err = service.commit(&token, "alice").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::TransactionNotFound);
}
