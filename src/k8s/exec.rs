//! Execution endpoint backed by `kubectl exec`-style attach.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::AttachParams;
use kube::{Api, Client};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::config::TargetConfig;
use crate::error::{Result, SyncError};
use crate::k8s::client::newest_running_pod;
use crate::transport::endpoint::{ExecEndpoint, ExecStream};

/// Binary name the agent is installed under.
pub const AGENT_BINARY: &str = "podsync";

/// Starts the agent in the newest running pod of a workload.
pub struct PodExecEndpoint {
    client: Client,
    namespace: String,
    selector: String,
    container: Option<String>,
    command: Vec<String>,
    pod_wait: Duration,
    install_dir: Option<String>,
    /// Pods the agent binary has already been copied into.
    installed: Mutex<HashSet<String>>,
}

impl PodExecEndpoint {
    /// `command` is the full agent argv, remote path included.
    pub fn new(client: Client, target: &TargetConfig, command: Vec<String>) -> Self {
        Self {
            client,
            namespace: target.namespace.clone(),
            selector: target.selector.clone(),
            container: target.container.clone(),
            command,
            pod_wait: Duration::from_secs(target.pod_wait_secs),
            install_dir: target.install_agent_dir.clone(),
            installed: Mutex::new(HashSet::new()),
        }
    }

    async fn ensure_agent(&self, pod: &str) -> Result<()> {
        let Some(dir) = &self.install_dir else {
            return Ok(());
        };
        let mut installed = self.installed.lock().await;
        if installed.contains(pod) {
            return Ok(());
        }

        install_agent(&self.client, &self.namespace, pod, self.container.as_deref(), dir)
            .await
            .map_err(|e| SyncError::Transport(format!("installing agent into {}: {:#}", pod, e)))?;
        tracing::info!("Installed agent into {}:{}", pod, dir);
        installed.insert(pod.to_string());
        Ok(())
    }
}

#[async_trait]
impl ExecEndpoint for PodExecEndpoint {
    async fn connect(&self) -> Result<ExecStream> {
        let pod = newest_running_pod(&self.client, &self.namespace, &self.selector, self.pod_wait)
            .await
            .map_err(|e| SyncError::EndpointUnavailable(format!("{:#}", e)))?;
        self.ensure_agent(&pod).await?;

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        let params = AttachParams {
            container: self.container.clone(),
            stdin: true,
            stdout: true,
            stderr: false,
            tty: false,
            ..Default::default()
        };
        let mut attached = api
            .exec(&pod, self.command.clone(), &params)
            .await
            .map_err(|e| SyncError::Transport(format!("exec into {} failed: {}", pod, e)))?;

        let stdin = attached
            .stdin()
            .ok_or_else(|| SyncError::Transport("exec session has no stdin".to_string()))?;
        let stdout = attached
            .stdout()
            .ok_or_else(|| SyncError::Transport("exec session has no stdout".to_string()))?;

        tracing::debug!("Started agent in {}/{}: {:?}", self.namespace, pod, self.command);
        tokio::spawn(async move {
            if let Err(e) = attached.join().await {
                tracing::debug!("Agent exec in {} ended: {}", pod, e);
            }
        });

        Ok(ExecStream::new(stdout, stdin))
    }

    fn target(&self) -> String {
        format!("{}/{}", self.namespace, self.selector)
    }
}

/// Copy the running executable into `dir` inside the container.
///
/// The binary is streamed as a one-entry tar archive into `tar -xf -`, so the
/// container only needs `tar`.
pub async fn install_agent(
    client: &Client,
    namespace: &str,
    pod: &str,
    container: Option<&str>,
    dir: &str,
) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("locating the podsync executable")?;
    let archive = tokio::task::spawn_blocking(move || agent_archive(&exe))
        .await
        .context("building the agent archive")??;

    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let command = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("mkdir -p {dir} && tar -xf - -C {dir}", dir = dir),
    ];
    let params = AttachParams {
        container: container.map(str::to_string),
        stdin: true,
        stdout: false,
        stderr: false,
        tty: false,
        ..Default::default()
    };

    let mut attached = api.exec(pod, command, &params).await?;
    let mut stdin = attached.stdin().ok_or_else(|| anyhow!("exec session has no stdin"))?;
    stdin.write_all(&archive).await?;
    stdin.shutdown().await?;
    drop(stdin);
    attached.join().await?;
    Ok(())
}

fn agent_archive(exe: &Path) -> anyhow::Result<Vec<u8>> {
    let mut data = Vec::new();
    let mut archive = tar::Builder::new(&mut data);
    let mut file = std::fs::File::open(exe).with_context(|| format!("opening {}", exe.display()))?;
    archive.append_file(AGENT_BINARY, &mut file)?;
    archive.finish()?;
    drop(archive);
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_agent_archive_has_one_entry() {
        let dir = tempfile::TempDir::new().unwrap();
        let exe = dir.path().join("binary");
        std::fs::write(&exe, b"\x7fELF-not-really").unwrap();

        let data = agent_archive(&exe).unwrap();
        let mut archive = tar::Archive::new(data.as_slice());
        let mut entries = archive.entries().unwrap();

        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some(AGENT_BINARY));
        let mut content = Vec::new();
        entry.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"\x7fELF-not-really");
        drop(entry);
        assert!(entries.next().is_none());
    }
}
