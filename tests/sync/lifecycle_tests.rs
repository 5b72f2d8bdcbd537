// Session states, registry and shutdown

use crate::harness::*;
use podsync::sync::{SessionRegistry, SessionState, SyncSession};
use podsync::SyncError;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_states_progress_to_streaming_then_terminated() {
    let roots = Roots::new();
    let mut session = Running::start(roots.config(), AgentEndpoint::new(roots.remote.path()));
    session.wait_streaming().await;
    session.stop().await;
}

#[tokio::test]
async fn test_missing_local_root_is_fatal() {
    let roots = Roots::new();
    let config = podsync::SyncConfig::new(roots.local.path().join("does-not-exist"), "/data");

    let mut session = Running::start(config, AgentEndpoint::new(roots.remote.path()));
    let result = session.handle.await.unwrap();
    assert!(result.unwrap_err().is_fatal());
    session
        .state
        .wait_for(|s| *s == SessionState::Terminated)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_registry_refuses_duplicate_session() {
    let roots = Roots::new();
    let registry = SessionRegistry::new();
    let endpoint = AgentEndpoint::new(roots.remote.path());
    let config = Arc::new(roots.config());

    let first = SyncSession::attach(&registry, config.clone(), endpoint.clone()).unwrap();
    let second = SyncSession::attach(&registry, config.clone(), endpoint.clone());
    assert!(matches!(second, Err(SyncError::SessionAlreadyAttached(_))));

    drop(first);
    assert!(SyncSession::attach(&registry, config, endpoint).is_ok());
}

#[tokio::test]
async fn test_stop_while_waiting_for_pod() {
    let roots = Roots::new();
    let session = Running::start(roots.config(), Arc::new(HangingEndpoint));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(*session.state.borrow(), SessionState::Initializing);

    let stopping = Instant::now();
    session.stop().await;
    assert!(
        stopping.elapsed() < Duration::from_secs(5),
        "stop took {:?}",
        stopping.elapsed()
    );
}
