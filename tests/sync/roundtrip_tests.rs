// Changes on one side show up on the other, deletes included

use crate::harness::*;
use std::sync::atomic::Ordering;

#[tokio::test]
async fn test_initial_sync_copies_both_ways() {
    let roots = Roots::new();
    std::fs::write(roots.local.path().join("local.txt"), b"from local").unwrap();
    std::fs::create_dir_all(roots.remote.path().join("nested/deeper")).unwrap();
    std::fs::write(roots.remote.path().join("nested/deeper/remote.txt"), b"from remote").unwrap();

    let mut session = Running::start(roots.config(), AgentEndpoint::new(roots.remote.path()));
    session.wait_streaming().await;

    assert_eq!(read(roots.remote.path(), "local.txt").as_deref(), Some(&b"from local"[..]));
    assert_eq!(
        read(roots.local.path(), "nested/deeper/remote.txt").as_deref(),
        Some(&b"from remote"[..])
    );
    assert_eq!(session.stats.uploads_committed.load(Ordering::SeqCst), 1);
    assert_eq!(session.stats.downloads_applied.load(Ordering::SeqCst), 1);
    session.stop().await;
}

#[tokio::test]
async fn test_local_change_is_uploaded() {
    let roots = Roots::new();
    let mut session = Running::start(roots.config(), AgentEndpoint::new(roots.remote.path()));
    session.wait_streaming().await;

    std::fs::create_dir_all(roots.local.path().join("src")).unwrap();
    std::fs::write(roots.local.path().join("src/main.rs"), b"fn main() {}").unwrap();

    let remote = roots.remote.path().to_path_buf();
    eventually("upload of src/main.rs", || {
        read(&remote, "src/main.rs").as_deref() == Some(&b"fn main() {}"[..])
    })
    .await;
    session.stop().await;
}

#[tokio::test]
async fn test_remote_change_is_downloaded() {
    let roots = Roots::new();
    let mut session = Running::start(roots.config(), AgentEndpoint::new(roots.remote.path()));
    session.wait_streaming().await;

    let content = patterned(200 * 1024);
    std::fs::write(roots.remote.path().join("data.bin"), &content).unwrap();

    let local = roots.local.path().to_path_buf();
    eventually("download of data.bin", || read(&local, "data.bin").as_deref() == Some(&content[..])).await;

    // The applied download must not bounce back as an upload.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(session.stats.uploads_committed.load(Ordering::SeqCst), 0);
    session.stop().await;
}

#[tokio::test]
async fn test_deletes_propagate_both_ways() {
    let roots = Roots::new();
    std::fs::write(roots.local.path().join("mine.txt"), b"x").unwrap();
    std::fs::write(roots.remote.path().join("theirs.txt"), b"y").unwrap();

    let mut session = Running::start(roots.config(), AgentEndpoint::new(roots.remote.path()));
    session.wait_streaming().await;

    std::fs::remove_file(roots.local.path().join("mine.txt")).unwrap();
    std::fs::remove_file(roots.remote.path().join("theirs.txt")).unwrap();

    let local = roots.local.path().to_path_buf();
    let remote = roots.remote.path().to_path_buf();
    eventually("both deletes", || {
        !remote.join("mine.txt").exists() && !local.join("theirs.txt").exists()
    })
    .await;

    assert_eq!(session.stats.deletes_sent.load(Ordering::SeqCst), 1);
    assert_eq!(session.stats.deletes_applied.load(Ordering::SeqCst), 1);
    session.stop().await;
}

#[tokio::test]
async fn test_rapid_writes_collapse_into_one_upload() {
    let roots = Roots::new();
    let mut config = roots.config();
    config.debounce_ms = 300;

    let mut session = Running::start(config, AgentEndpoint::new(roots.remote.path()));
    session.wait_streaming().await;

    let path = roots.local.path().join("burst.txt");
    for i in 0..20 {
        std::fs::write(&path, format!("revision {}", i)).unwrap();
    }

    let remote = roots.remote.path().to_path_buf();
    eventually("final revision", || {
        read(&remote, "burst.txt").as_deref() == Some(&b"revision 19"[..])
    })
    .await;
    assert_eq!(session.stats.uploads_committed.load(Ordering::SeqCst), 1);
    session.stop().await;
}

#[tokio::test]
async fn test_delete_right_after_transfer_still_propagates() {
    let roots = Roots::new();
    let mut session = Running::start(roots.config(), AgentEndpoint::new(roots.remote.path()));
    session.wait_streaming().await;
    let local = roots.local.path().to_path_buf();
    let remote = roots.remote.path().to_path_buf();

    // No pause between the transfer landing and the delete: the other side's
    // notification about the new file has not come back yet.
    std::fs::write(local.join("short.txt"), b"brief").unwrap();
    eventually("upload of short.txt", || remote.join("short.txt").exists()).await;
    std::fs::remove_file(local.join("short.txt")).unwrap();
    eventually("remote delete of short.txt", || !remote.join("short.txt").exists()).await;

    std::fs::write(remote.join("fleeting.txt"), b"brief").unwrap();
    eventually("download of fleeting.txt", || local.join("fleeting.txt").exists()).await;
    std::fs::remove_file(remote.join("fleeting.txt")).unwrap();
    eventually("local delete of fleeting.txt", || !local.join("fleeting.txt").exists()).await;

    assert_eq!(session.stats.deletes_sent.load(Ordering::SeqCst), 1);
    assert_eq!(session.stats.deletes_applied.load(Ordering::SeqCst), 1);
    session.stop().await;
}
