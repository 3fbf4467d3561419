// Queued changes written to the on-disk database outlive the session that
// made them

use galley_sync::{
    Connectivity, MemoryRemote, SyncConfig, SyncSession, SyncStatus, Syncable,
};
use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tempfile::TempDir;

const TENANT: &str = "tenant-a";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Recipe {
    title: String,
    portions: u32,
}

impl Syncable for Recipe {
    fn entity_type() -> &'static str {
        "recipes"
    }

    fn name_fields(&self) -> Vec<Option<&str>> {
        vec![Some(&self.title)]
    }
}

fn file_config(dir: &TempDir) -> SyncConfig {
    let mut config = SyncConfig::ephemeral();
    config.store.database_url = format!("sqlite://{}", dir.path().join("galley.db").display());
    config
}

async fn open(config: SyncConfig, remote: &Arc<MemoryRemote>, connectivity: Connectivity) -> SyncSession {
    SyncSession::builder(TENANT, remote.clone())
        .config(config)
        .connectivity(connectivity)
        .open()
        .await
        .unwrap()
}

#[tokio::test]
async fn test_pending_changes_survive_restart() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());

    let mut first = open(file_config(&dir), &remote, Connectivity::Offline).await;
    let stew = first
        .repository::<Recipe>()
        .create(Recipe {
            title: "Beef stew".into(),
            portions: 6,
        })
        .await
        .unwrap();
    first.shutdown().await;
    drop(first);

    let second = open(file_config(&dir), &remote, Connectivity::Offline).await;
    let pending = second.pending_changes().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entity_id, stew.id);

    let repo = second.repository::<Recipe>();
    let local = repo.get(&stew.id).await.unwrap().unwrap();
    assert_eq!(local.sync_status, SyncStatus::Pending);
    assert_eq!(local.payload.portions, 6);

    second.set_connectivity(Connectivity::Online);
    let report = second.flush().await.unwrap();
    assert_eq!(report.flushed, 1);
    assert!(second.pending_changes().await.unwrap().is_empty());

    let synced = repo.get(&stew.id).await.unwrap().unwrap();
    assert_eq!(synced.sync_status, SyncStatus::Synced);
    assert_eq!(remote.records(TENANT, "recipes").await.len(), 1);
}

#[tokio::test]
async fn test_conflicts_survive_restart() {
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    let mut config = file_config(&dir);
    config.queue.max_attempts = 0;

    let mut first = open(config.clone(), &remote, Connectivity::Online).await;
    remote.set_offline(true).await;
    first
        .repository::<Recipe>()
        .create(Recipe {
            title: "Gazpacho".into(),
            portions: 4,
        })
        .await
        .unwrap();
    let report = first.flush().await.unwrap();
    assert_eq!(report.conflicts.len(), 1);
    first.shutdown().await;
    drop(first);

    remote.set_offline(false).await;
    let second = open(config, &remote, Connectivity::Online).await;
    let conflicts = second.conflicts().await.unwrap();
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].attempt_count, 1);

    // Still terminal after the restart
    let report = second.flush().await.unwrap();
    assert_eq!(report.flushed, 0);
    assert!(remote.records(TENANT, "recipes").await.is_empty());
}
