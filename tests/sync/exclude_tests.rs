// Excluded paths never cross the link in the direction they are hidden from

use crate::harness::*;
use std::sync::atomic::Ordering;
use std::time::Duration;

#[tokio::test]
async fn test_general_excludes_hide_both_directions() {
    let roots = Roots::new();
    std::fs::write(roots.local.path().join("keep.txt"), b"keep").unwrap();
    std::fs::write(roots.local.path().join("build.log"), b"local noise").unwrap();
    std::fs::create_dir_all(roots.remote.path().join("target")).unwrap();
    std::fs::write(roots.remote.path().join("target/out.o"), b"remote noise").unwrap();

    let mut config = roots.config();
    config.exclude = vec!["*.log".to_string(), "target".to_string()];
    let mut session = Running::start(config, AgentEndpoint::new(roots.remote.path()));
    session.wait_streaming().await;

    assert!(roots.remote.path().join("keep.txt").exists());
    assert!(!roots.remote.path().join("build.log").exists());
    assert!(!roots.local.path().join("target").exists());

    // Live changes are filtered the same way.
    std::fs::write(roots.local.path().join("later.log"), b"more noise").unwrap();
    std::fs::write(roots.local.path().join("later.txt"), b"wanted").unwrap();
    let remote = roots.remote.path().to_path_buf();
    eventually("upload of later.txt", || remote.join("later.txt").exists()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!remote.join("later.log").exists());
    assert_eq!(session.stats.uploads_committed.load(Ordering::SeqCst), 2);

    session.stop().await;
}

#[tokio::test]
async fn test_directional_excludes() {
    let roots = Roots::new();
    let mut config = roots.config();
    config.upload_exclude = vec!["local-only/".to_string()];
    config.download_exclude = vec!["*.cache".to_string()];
    let mut session = Running::start(config, AgentEndpoint::new(roots.remote.path()));
    session.wait_streaming().await;

    std::fs::create_dir_all(roots.local.path().join("local-only")).unwrap();
    std::fs::write(roots.local.path().join("local-only/secret.txt"), b"s").unwrap();
    std::fs::write(roots.remote.path().join("index.cache"), b"c").unwrap();
    std::fs::write(roots.remote.path().join("marker.txt"), b"m").unwrap();

    let local = roots.local.path().to_path_buf();
    eventually("download of marker.txt", || local.join("marker.txt").exists()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!local.join("index.cache").exists());
    assert!(!roots.remote.path().join("local-only").exists());
    session.stop().await;
}
