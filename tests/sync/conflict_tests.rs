// Diverging versions at session start resolve the same way every time

use crate::harness::*;
use podsync::sync::ConflictAuthority;

fn diverge(roots: &Roots, local_mtime: u64, remote_mtime: u64) {
    let local = roots.local.path().join("shared.txt");
    let remote = roots.remote.path().join("shared.txt");
    std::fs::write(&local, b"local version").unwrap();
    std::fs::write(&remote, b"remote version!").unwrap();
    set_mtime(&local, local_mtime);
    set_mtime(&remote, remote_mtime);
}

async fn settle(roots: &Roots, authority: Option<ConflictAuthority>) -> (Vec<u8>, Vec<u8>) {
    let mut config = roots.config();
    config.conflict = authority;
    let mut session = Running::start(config, AgentEndpoint::new(roots.remote.path()));
    session.wait_streaming().await;

    let local = read(roots.local.path(), "shared.txt").unwrap();
    let remote = read(roots.remote.path(), "shared.txt").unwrap();
    session.stop().await;
    (local, remote)
}

#[tokio::test]
async fn test_newest_wins_by_default() {
    let roots = Roots::new();
    diverge(&roots, 1_600_000_000, 1_700_000_000);

    let (local, remote) = settle(&roots, None).await;
    assert_eq!(local, b"remote version!");
    assert_eq!(remote, b"remote version!");
}

#[tokio::test]
async fn test_local_wins_authority() {
    let roots = Roots::new();
    diverge(&roots, 1_600_000_000, 1_700_000_000);

    let (local, remote) = settle(&roots, Some(ConflictAuthority::LocalWins)).await;
    assert_eq!(local, b"local version");
    assert_eq!(remote, b"local version");
}

#[tokio::test]
async fn test_equal_mtime_keeps_local() {
    let roots = Roots::new();
    diverge(&roots, 1_650_000_000, 1_650_000_000);

    let (local, remote) = settle(&roots, None).await;
    assert_eq!(local, b"local version");
    assert_eq!(remote, b"local version");
}
