use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing_subscriber::EnvFilter;

use podsync::config::{ConfigFile, SyncConfig, TargetConfig};
use podsync::k8s::{K8sClient, PodExecEndpoint, AGENT_BINARY};
use podsync::sync::{ConflictAuthority, SessionRegistry, SyncSession};

#[derive(Parser)]
#[command(name = "podsync", version, about = "Keep local directories in sync with a Kubernetes container")]
struct Cli {
    /// More log output (-v debug, -vv trace); RUST_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sync one or more directories with a running pod.
    Sync(SyncArgs),
    /// Serve the sync protocol on stdin/stdout (runs inside the container).
    Agent {
        #[arg(long)]
        root: PathBuf,
    },
}

#[derive(Args)]
struct SyncArgs {
    /// TOML file with a [target] table and [[sync]] entries.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    namespace: Option<String>,

    /// Label selector of the target pods, e.g. app=web.
    #[arg(short = 'l', long)]
    selector: Option<String>,

    #[arg(short, long)]
    container: Option<String>,

    /// Local directory; requires --remote.
    #[arg(long)]
    local: Option<PathBuf>,

    /// Path inside the container; requires --local.
    #[arg(long)]
    remote: Option<String>,

    #[arg(short, long = "exclude")]
    exclude: Vec<String>,

    #[arg(long = "upload-exclude")]
    upload_exclude: Vec<String>,

    #[arg(long = "download-exclude")]
    download_exclude: Vec<String>,

    #[arg(long)]
    upload_limit_kib: Option<u64>,

    #[arg(long)]
    download_limit_kib: Option<u64>,

    /// local-wins, remote-wins or newest-wins.
    #[arg(long)]
    conflict: Option<ConflictAuthority>,

    /// Copy this binary into the given container directory before starting.
    #[arg(long)]
    install_agent: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Agent { root } => {
            podsync::agent::run_stdio(root).await?;
            Ok(())
        }
        Command::Sync(args) => run_sync(args).await,
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // stdout carries the protocol when running as the agent.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run_sync(args: SyncArgs) -> Result<()> {
    let mut file = match &args.config {
        Some(path) => ConfigFile::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => ConfigFile {
            target: None,
            sync: Vec::new(),
        },
    };

    let k8s = K8sClient::new().await.context("connecting to Kubernetes")?;
    let target = resolve_target(file.target.take(), &args, k8s.current_namespace())?;

    let mut sessions = std::mem::take(&mut file.sync);
    match (&args.local, &args.remote) {
        (Some(local), Some(remote)) => {
            let mut config = SyncConfig::new(local, remote.clone());
            config.exclude = args.exclude.clone();
            config.upload_exclude = args.upload_exclude.clone();
            config.download_exclude = args.download_exclude.clone();
            config.upload_limit_kib = args.upload_limit_kib;
            config.download_limit_kib = args.download_limit_kib;
            config.conflict = args.conflict;
            sessions.push(config);
        }
        (None, None) => {}
        _ => bail!("--local and --remote must be given together"),
    }
    if sessions.is_empty() {
        bail!("nothing to sync: pass --local/--remote or a config file with [[sync]] entries");
    }

    let registry = SessionRegistry::new();
    let mut running = JoinSet::new();
    let mut cancels = Vec::new();

    for mut config in sessions {
        if let Some(dir) = &target.install_agent_dir {
            if config.agent_command.first().map(String::as_str) == Some(AGENT_BINARY) {
                config.agent_command[0] = format!("{}/{}", dir.trim_end_matches('/'), AGENT_BINARY);
            }
        }
        let endpoint = Arc::new(PodExecEndpoint::new(k8s.client(), &target, config.agent_argv()));
        let config = Arc::new(config);
        let session = SyncSession::attach(&registry, config.clone(), endpoint)?;

        cancels.push(session.cancel_token());
        let stats = session.stats();
        running.spawn(async move {
            let result = session.run().await;
            (config, stats.snapshot(), result)
        });
    }

    let mut failed = 0;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, stopping sessions");
                for cancel in &cancels {
                    cancel.cancel();
                }
            }
            joined = running.join_next() => {
                let Some(joined) = joined else { break };
                let (config, stats, result) = joined.context("session task panicked")?;
                if result.is_err() {
                    failed += 1;
                }
                let summary = serde_json::json!({
                    "local": config.local_root,
                    "remote": config.remote_path,
                    "ok": result.is_ok(),
                    "stats": stats,
                });
                println!("{}", serde_json::to_string(&summary)?);
            }
        }
    }

    if failed > 0 {
        bail!("{} sync session(s) failed", failed);
    }
    Ok(())
}

fn resolve_target(from_file: Option<TargetConfig>, args: &SyncArgs, current_namespace: &str) -> Result<TargetConfig> {
    let selector = args
        .selector
        .clone()
        .or_else(|| from_file.as_ref().map(|t| t.selector.clone()))
        .context("no target: pass --selector or set [target] in the config file")?;
    let mut target = from_file.unwrap_or_else(|| TargetConfig {
        namespace: current_namespace.to_string(),
        selector: selector.clone(),
        container: None,
        pod_wait_secs: 120,
        install_agent_dir: None,
    });

    target.selector = selector;
    if let Some(namespace) = &args.namespace {
        target.namespace = namespace.clone();
    }
    if args.container.is_some() {
        target.container = args.container.clone();
    }
    if args.install_agent.is_some() {
        target.install_agent_dir = args.install_agent.clone();
    }
    Ok(target)
}
