use chrono::Utc;
use tokio_test::{assert_err, assert_ok};

use portnote::{MemoryStore, PortStatus, PortStore, ScanError};

#[tokio::test]
async fn test_snapshot_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("inventory.json");

    let store = MemoryStore::new();
    let web = store.create_host("web", "https://Web.Example.com/").unwrap();
    let db = store.create_host("db", "10.0.0.5").unwrap();
    let https = store.create_port(web, 443, "frontend", "nginx").await.unwrap();
    let checked = Utc::now();
    store
        .update_port_status(https, PortStatus::Open, checked)
        .await
        .unwrap();
    store.create_port(db, 5432, "", "postgresql").await.unwrap();
    assert!(store.begin_scan(db).await.unwrap());

    assert_ok!(store.save_snapshot(&path));
    assert!(path.exists());
    assert!(!path.with_extension("json.tmp").exists());

    let loaded = MemoryStore::load_snapshot(&path).unwrap();
    let hosts = loaded.list_hosts().await.unwrap();
    assert_eq!(hosts.len(), 2);
    assert_eq!(hosts[1].address, "web.example.com");
    // Claims never survive a restart
    assert!(hosts.iter().all(|h| !h.scanning));

    let port = loaded.get_port(https).unwrap();
    assert_eq!(port.status, PortStatus::Open);
    assert_eq!(port.note, "frontend");
    assert_eq!(port.last_checked, Some(checked));

    // Identifiers keep counting from the loaded maximum
    let next = loaded.create_port(web, 80, "", "http").await.unwrap();
    assert!(next > https);
    let third = loaded.create_host("cache", "10.0.0.6").unwrap();
    assert!(third > db);
}

#[tokio::test]
async fn test_missing_snapshot_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::load_snapshot(dir.path().join("absent.json")).unwrap();
    assert!(store.list_hosts().await.unwrap().is_empty());
}

#[test]
fn test_corrupt_snapshot_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.json");
    std::fs::write(&path, "{ not json").unwrap();

    let err = assert_err!(MemoryStore::load_snapshot(&path));
    assert!(matches!(err, ScanError::SerializationError(_)));
}

#[tokio::test]
async fn test_snapshot_overwrites_previous() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("inventory.json");

    let store = MemoryStore::new();
    let host = store.create_host("web", "10.0.0.1").unwrap();
    store.save_snapshot(&path).unwrap();

    store.delete_host(host).unwrap();
    store.save_snapshot(&path).unwrap();

    let loaded = MemoryStore::load_snapshot(&path).unwrap();
    assert!(loaded.list_hosts().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_status_only_changes_through_reconciliation_calls() {
    let store = MemoryStore::new();
    let host = store.create_host("web", "10.0.0.1").unwrap();
    let id = store.create_port(host, 22, "", "").await.unwrap();

    store.update_port_note(id, "jump box", "OpenSSH").unwrap();
    store.update_port_fingerprint(id, "OpenSSH 9.6").await.unwrap();
    assert_eq!(store.get_port(id).unwrap().status, PortStatus::Unknown);

    assert_err!(store.update_port_status(999, PortStatus::Open, Utc::now()).await);
    assert_err!(store.update_port_fingerprint(999, "x").await);
}
