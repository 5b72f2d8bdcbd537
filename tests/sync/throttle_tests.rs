// Upload bandwidth stays under the configured limit

use crate::harness::*;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_upload_limit_bounds_throughput() {
    let roots = Roots::new();
    let content = patterned(512 * 1024);
    std::fs::write(roots.local.path().join("payload.bin"), &content).unwrap();

    let mut config = roots.config();
    config.upload_limit_kib = Some(256);

    let started = Instant::now();
    let mut session = Running::start(config, AgentEndpoint::new(roots.remote.path()));
    session.wait_streaming().await;
    let elapsed = started.elapsed();

    assert_eq!(read(roots.remote.path(), "payload.bin").as_deref(), Some(&content[..]));
    // One chunk of burst, the rest at 256 KiB/s.
    assert!(
        elapsed >= Duration::from_millis(1500),
        "512 KiB went out in {:?}",
        elapsed
    );
    session.stop().await;
}
