// A dropped connection mid-transfer leaves no partial file and uploads once

use crate::harness::*;
use podsync::sync::SessionState;
use podsync::SyncError;
use std::sync::atomic::Ordering;
use std::sync::Arc;

#[tokio::test]
async fn test_transfer_survives_broken_link() {
    let roots = Roots::new();
    let content = patterned(1024 * 1024);
    std::fs::write(roots.local.path().join("big.bin"), &content).unwrap();

    // The first connection dies about a third of the way into the upload.
    let endpoint = AgentEndpoint::breaking(roots.remote.path(), 1, 300 * 1024);
    let mut session = Running::start(roots.config(), endpoint.clone());
    session.wait_streaming().await;

    let remote = roots.remote.path().to_path_buf();
    eventually("complete upload", || read(&remote, "big.bin").as_deref() == Some(&content[..])).await;
    eventually("staging files cleaned up", || temp_files(&remote).is_empty()).await;

    assert_eq!(endpoint.connects(), 2);
    assert_eq!(session.stats.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(session.stats.uploads_committed.load(Ordering::SeqCst), 1);
    session.stop().await;
}

#[tokio::test]
async fn test_download_survives_broken_link() {
    let roots = Roots::new();
    let content = patterned(1024 * 1024);
    std::fs::write(roots.remote.path().join("big.bin"), &content).unwrap();

    // The first connection stops delivering partway through the download.
    let endpoint = AgentEndpoint::breaking_download(roots.remote.path(), 1, 300 * 1024);
    let mut session = Running::start(roots.config(), endpoint.clone());
    session.wait_streaming().await;

    let local = roots.local.path().to_path_buf();
    assert_eq!(read(&local, "big.bin").as_deref(), Some(&content[..]));
    assert!(temp_files(&local).is_empty(), "left behind: {:?}", temp_files(&local));

    assert_eq!(endpoint.connects(), 2);
    assert_eq!(session.stats.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(session.stats.downloads_applied.load(Ordering::SeqCst), 1);
    session.stop().await;
}

#[tokio::test]
async fn test_unreachable_endpoint_exhausts_budget() {
    let roots = Roots::new();
    let mut config = roots.config();
    config.max_reconnect_attempts = 3;

    let session = Running::start(config, Arc::new(DeadEndpoint));
    let result = tokio::time::timeout(std::time::Duration::from_secs(10), session.handle)
        .await
        .unwrap()
        .unwrap();

    match result {
        Err(SyncError::ReconnectExhausted { attempts, last_error }) => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("connection refused"));
        }
        other => panic!("expected ReconnectExhausted, got {:?}", other),
    }
    assert_eq!(*session.state.borrow(), SessionState::Terminated);
}
