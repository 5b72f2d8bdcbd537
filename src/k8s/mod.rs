pub mod client;
pub mod exec;

pub use client::{newest_running_pod, K8sClient};
pub use exec::{install_agent, PodExecEndpoint, AGENT_BINARY};
