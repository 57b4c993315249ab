//! Cluster event reporting.
//!
//! Validation problems surface as Kubernetes events on the offending
//! object. The index records them synchronously through a sink; the binary
//! wires a channel-backed sink whose receiver publishes through the kube
//! events recorder.

use k8s_nft_npc_k8s::ObjectMeta;
use tokio::sync::mpsc;

/// A reference to the involved object of an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    pub kind: &'static str,
    pub api_version: &'static str,
    pub namespace: Option<String>,
    pub name: String,
    pub uid: Option<String>,
}

// === impl ObjectRef ===

impl ObjectRef {
    pub fn pod(meta: &ObjectMeta) -> Self {
        Self {
            kind: "Pod",
            api_version: "v1",
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
            uid: meta.uid.clone(),
        }
    }

    pub fn network_policy(meta: &ObjectMeta) -> Self {
        Self {
            kind: "NetworkPolicy",
            api_version: "networking.k8s.io/v1",
            namespace: meta.namespace.clone(),
            name: meta.name.clone().unwrap_or_default(),
            uid: meta.uid.clone(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Severity {
    Normal,
    Warning,
}

#[derive(Clone, Debug)]
pub struct ClusterEvent {
    pub object: ObjectRef,
    pub severity: Severity,
    pub reason: &'static str,
    pub message: String,
}

// === impl ClusterEvent ===

impl ClusterEvent {
    pub fn warning(object: ObjectRef, reason: &'static str, message: String) -> Self {
        Self {
            object,
            severity: Severity::Warning,
            reason,
            message,
        }
    }

    pub fn normal(object: ObjectRef, reason: &'static str, message: String) -> Self {
        Self {
            object,
            severity: Severity::Normal,
            reason,
            message,
        }
    }
}

pub trait EventSink {
    fn record(&mut self, event: ClusterEvent);
}

/// Records events to the log only.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn record(&mut self, event: ClusterEvent) {
        match event.severity {
            Severity::Warning => tracing::warn!(
                object = %event.object.name,
                reason = event.reason,
                "{}",
                event.message
            ),
            Severity::Normal => tracing::info!(
                object = %event.object.name,
                reason = event.reason,
                "{}",
                event.message
            ),
        }
    }
}

/// Forwards events to an async consumer.
#[derive(Clone, Debug)]
pub struct ChannelSink(pub mpsc::UnboundedSender<ClusterEvent>);

impl EventSink for ChannelSink {
    fn record(&mut self, event: ClusterEvent) {
        // A torn-down receiver only means events stop being published.
        let _ = self.0.send(event);
    }
}
