// Test module entry point for sync tests
// Every test runs a real session against an in-process agent

mod harness;

mod conflict_tests;
mod exclude_tests;
mod lifecycle_tests;
mod reconnect_tests;
mod roundtrip_tests;
mod throttle_tests;
