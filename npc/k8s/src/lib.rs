//! A narrow façade over the Kubernetes API types and machinery the
//! controller consumes: typed core/networking resources, watcher and
//! reflector plumbing, and label-selector matching.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;

pub use self::labels::Labels;
pub use k8s_openapi::{
    api::{
        core::v1::{
            Container, ContainerPort, Namespace, ObjectReference, Pod, PodIP, PodSpec, PodStatus,
        },
        networking::v1::{
            IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule,
            NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, LabelSelectorRequirement},
        util::intstr::IntOrString,
    },
};
pub use kube::{
    api::{Api, ObjectMeta, Resource, ResourceExt},
    config::{KubeConfigOptions, Kubeconfig},
    runtime::{
        events::{Event as K8sEvent, EventType, Recorder, Reporter},
        reflector::{self, ObjectRef, Store},
        watcher,
    },
    Client, Config,
};

/// A namespace/name pair identifying an object. The namespace is empty for
/// cluster-scoped resources.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectName {
    pub namespace: String,
    pub name: String,
}

// === impl ObjectName ===

impl ObjectName {
    pub fn new(namespace: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn cluster_scoped(name: impl ToString) -> Self {
        Self {
            namespace: String::new(),
            name: name.to_string(),
        }
    }

    /// Derives the key of a namespaced resource from its metadata.
    pub fn from_resource<K>(obj: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }
}

impl std::fmt::Display for ObjectName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.namespace.is_empty() {
            return self.name.fmt(f);
        }
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
