#![cfg(feature = "test-utils")]

use std::sync::Arc;

use casesync_core::test_utils::MockSessionApi;
use casesync_core::{CacheStore, CaseSession, FieldKey, FileCacheBackend};
use serde_json::json;

fn cache(dir: &std::path::Path) -> Arc<CacheStore> {
    Arc::new(CacheStore::new(FileCacheBackend::open(dir).unwrap()))
}

#[tokio::test(start_paused = true)]
async fn test_offline_edits_replay_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockSessionApi::new());

    {
        let session = CaseSession::builder("case-77", api.clone(), cache(dir.path())).build();
        session.mount().await.unwrap();
        session.set_online(false).await.unwrap();
        session
            .write(FieldKey::TransportDestination, json!("Ankara Şehir Hastanesi"))
            .unwrap();
        assert_eq!(session.pending_writes().len(), 1);
        session.unmount();
    }
    assert!(api.patches().is_empty());

    let session = CaseSession::builder("case-77", api.clone(), cache(dir.path())).build();
    assert_eq!(session.pending_writes().len(), 1);
    assert_eq!(
        session.form().fields.text(&FieldKey::TransportDestination),
        None
    );

    session.mount().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_secs(6)).await;

    assert_eq!(
        api.patches(),
        vec![(
            FieldKey::TransportDestination,
            json!("Ankara Şehir Hastanesi")
        )]
    );
    assert!(session.pending_writes().is_empty());
    assert_eq!(api.leave_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cached_form_serves_second_run_offline() {
    let dir = tempfile::tempdir().unwrap();
    let api = Arc::new(MockSessionApi::new());
    api.set_remote_field(
        FieldKey::PatientName,
        casesync_core::FieldEntry::new(json!("Emre Koç")),
    );

    {
        let session = CaseSession::builder("case-5", api.clone(), cache(dir.path())).build();
        session.mount().await.unwrap();
    }

    let session = CaseSession::builder("case-5", api.clone(), cache(dir.path()))
        .online(false)
        .build();
    session.mount().await.unwrap();

    assert!(session.is_degraded());
    assert_eq!(session.form().fields.patient_name(), Some("Emre Koç"));
}
