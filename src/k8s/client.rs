use anyhow::{anyhow, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::ListParams;
use kube::{Api, Client, Config};
use std::time::Duration;

const POD_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct K8sClient {
    client: Client,
    current_namespace: String,
}

impl K8sClient {
    pub async fn new() -> Result<Self> {
        let config = Config::infer().await?;
        let namespace = config.default_namespace.clone();
        let client = Client::try_from(config)?;

        Ok(Self {
            client,
            current_namespace: namespace,
        })
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn current_namespace(&self) -> &str {
        &self.current_namespace
    }

    pub fn set_namespace(&mut self, namespace: String) {
        self.current_namespace = namespace;
    }
}

/// Name of the most recently created running pod matching `selector`.
///
/// Polls until one shows up or `timeout` elapses; a restarting workload is
/// picked up as soon as its replacement is running.
pub async fn newest_running_pod(client: &Client, namespace: &str, selector: &str, timeout: Duration) -> Result<String> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let params = ListParams::default().labels(selector);
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let pods = api.list(&params).await?;
        let newest = pods
            .items
            .into_iter()
            .filter(|pod| pod.metadata.deletion_timestamp.is_none())
            .filter(|pod| {
                pod.status
                    .as_ref()
                    .and_then(|status| status.phase.as_deref())
                    == Some("Running")
            })
            .max_by_key(|pod| pod.metadata.creation_timestamp.clone().map(|t| t.0));

        if let Some(name) = newest.and_then(|pod| pod.metadata.name) {
            return Ok(name);
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(anyhow!(
                "no running pod matches {} in namespace {} after {:?}",
                selector,
                namespace,
                timeout
            ));
        }
        tracing::debug!("Waiting for a running pod matching {}", selector);
        tokio::time::sleep(POD_POLL_INTERVAL).await;
    }
}
