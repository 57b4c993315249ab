//! The k8s-nft-npc controller binary.
//!
//! Watches Pods, Namespaces, and NetworkPolicies and maintains the
//! `k8s-nft-npc` nftables tables enforcing the union of in-scope policies.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;

use anyhow::{Context, Result};
use clap::Parser;
use k8s_nft_npc_index::events::{ChannelSink, ClusterEvent, Severity};
use k8s_nft_npc_index::Index;
use k8s_nft_npc_k8s as k8s;
use k8s_nft_npc_nfds::nft::NftBackend;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "k8s-nft-npc", about = "Kubernetes NetworkPolicy controller for nftables")]
struct Args {
    /// The address of the Kubernetes API server. Overrides any value in
    /// kubeconfig. Only required if out-of-cluster.
    #[arg(long)]
    master: Option<String>,

    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<std::path::PathBuf>,

    /// Interface group id for pod-facing interfaces. Recommended in most
    /// use cases, required if the nodes also act as routers for non-local
    /// traffic.
    #[arg(long, default_value_t = 0)]
    pod_interface_group: u32,

    /// Log filter directives.
    #[arg(long, default_value = "info", env = "RUST_LOG")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_level))
        .init();

    let config = load_config(&args).await.context("building kubeconfig")?;
    let client = k8s::Client::try_from(config).context("building kubernetes client")?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let index = Index::new(
        Box::new(NftBackend::default()),
        Box::new(ChannelSink(events_tx)),
        args.pod_interface_group,
    )
    .context("initializing nftables ruleset")?;

    tokio::spawn(forward_events(client.clone(), events_rx));

    info!("Starting k8s-nft-npc worker");
    controller::run(client, index).await
}

async fn load_config(args: &Args) -> Result<k8s::Config> {
    let mut config = match &args.kubeconfig {
        Some(path) => {
            let kubeconfig =
                k8s::Kubeconfig::read_from(path).context("reading kubeconfig file")?;
            k8s::Config::from_custom_kubeconfig(kubeconfig, &k8s::KubeConfigOptions::default())
                .await?
        }
        None => k8s::Config::infer().await?,
    };
    if let Some(master) = &args.master {
        config.cluster_url = master.parse().context("parsing --master url")?;
    }
    Ok(config)
}

/// Publishes cluster events recorded by the index as Kubernetes events.
async fn forward_events(
    client: k8s::Client,
    mut events: mpsc::UnboundedReceiver<ClusterEvent>,
) {
    let reporter = k8s::Reporter {
        controller: "npc".to_string(),
        instance: None,
    };
    while let Some(event) = events.recv().await {
        let reference = k8s::ObjectReference {
            api_version: Some(event.object.api_version.to_string()),
            kind: Some(event.object.kind.to_string()),
            namespace: event.object.namespace.clone(),
            name: Some(event.object.name.clone()),
            uid: event.object.uid.clone(),
            ..Default::default()
        };
        let recorder = k8s::Recorder::new(client.clone(), reporter.clone(), reference);
        let published = recorder
            .publish(k8s::K8sEvent {
                type_: match event.severity {
                    Severity::Normal => k8s::EventType::Normal,
                    Severity::Warning => k8s::EventType::Warning,
                },
                reason: event.reason.to_string(),
                note: Some(event.message.clone()),
                action: "Sync".to_string(),
                secondary: None,
            })
            .await;
        if let Err(error) = published {
            warn!(%error, reason = event.reason, "Failed to publish cluster event");
        }
    }
}
